// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! C bindings for the renderer.
//!
//! The transport layer is C; every entry point here converts raw pointers
//! into the safe core API and the core's structured errors into negative
//! errno returns. Panics never cross the boundary: they are caught and
//! reported as `-EIO`.

#![allow(non_camel_case_types)]

use std::{
    ffi::CStr,
    io,
    os::{
        fd::{FromRawFd, OwnedFd},
        raw::{c_char, c_void},
    },
    panic::{catch_unwind, AssertUnwindSafe},
    slice::from_raw_parts,
    sync::Arc,
};

use log::error;

use crate::{
    error::Result,
    registry,
    resource::VaccelIovec,
    RendererCallbacks,
};

pub type vaccel_get_device_fd_cb = Option<extern "C" fn(cookie: u64, user_data: u64) -> i32>;
pub type vaccel_write_context_fence_cb =
    Option<extern "C" fn(cookie: u64, ctx_id: u32, ring_idx: u32, fence_id: u64)>;

/// Callback vtable supplied by the VMM.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct vaccel_callbacks {
    pub user_data: u64,
    pub get_device_fd: vaccel_get_device_fd_cb,
    pub write_context_fence: vaccel_write_context_fence_cb,
}

/// Guest memory segment, layout-compatible with `struct iovec`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct vaccel_iovec {
    pub iov_base: *mut c_void,
    pub iov_len: usize,
}

struct FfiCallbacks {
    cbs: vaccel_callbacks,
}

impl RendererCallbacks for FfiCallbacks {
    fn get_device_fd(&self, cookie: u64) -> io::Result<OwnedFd> {
        let cb = self
            .cbs
            .get_device_fd
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTSUP))?;
        let fd = cb(cookie, self.cbs.user_data);
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(-fd));
        }
        // SAFETY: the callback contract hands us ownership of a fresh fd.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn write_context_fence(&self, cookie: u64, ctx_id: u32, ring_idx: u32, fence_id: u64) {
        if let Some(cb) = self.cbs.write_context_fence {
            cb(cookie, ctx_id, ring_idx, fence_id);
        }
    }

    fn supports_context_fence(&self) -> bool {
        self.cbs.write_context_fence.is_some()
    }
}

fn wrap(op: &'static str, f: impl FnOnce() -> Result<()>) -> i32 {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!("{op} failed: {e}");
            e.errno()
        }
        Err(_) => {
            error!("{op} panicked");
            -libc::EIO
        }
    }
}

#[no_mangle]
pub extern "C" fn vaccel_renderer_init() {
    registry::renderer_init();
}

#[no_mangle]
pub extern "C" fn vaccel_renderer_cleanup() {
    registry::renderer_cleanup();
}

/// # Safety
/// `callbacks`, if non-null, must point to a valid `vaccel_callbacks`
/// whose function pointers stay callable for the device's lifetime.
#[no_mangle]
pub unsafe extern "C" fn vaccel_create(
    cookie: u64,
    capset_id: u32,
    callbacks: *const vaccel_callbacks,
) -> i32 {
    wrap("vaccel_create", || {
        if callbacks.is_null() {
            return Err(crate::error::Error::CallbackMissing("vaccel_callbacks"));
        }
        let cbs = FfiCallbacks { cbs: *callbacks };
        registry::create_device(cookie, capset_id, Arc::new(cbs))
    })
}

#[no_mangle]
pub extern "C" fn vaccel_destroy(cookie: u64) {
    registry::destroy_device(cookie);
}

/// # Safety
/// `name`, if non-null, must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn vaccel_context_create(
    cookie: u64,
    ctx_id: u32,
    name: *const c_char,
) -> i32 {
    wrap("vaccel_context_create", || {
        let name = if name.is_null() {
            None
        } else {
            Some(
                CStr::from_ptr(name)
                    .to_str()
                    .map_err(|_| crate::error::Error::MalformedCommandBuffer("context name"))?,
            )
        };
        registry::create_context(cookie, ctx_id, name)
    })
}

#[no_mangle]
pub extern "C" fn vaccel_context_destroy(cookie: u64, ctx_id: u32) {
    registry::destroy_context(cookie, ctx_id);
}

/// # Safety
/// `iovecs`, if `num_iovecs` is non-zero, must point to `num_iovecs`
/// entries describing memory pinned for the resource's lifetime.
#[no_mangle]
pub unsafe extern "C" fn vaccel_resource_create(
    cookie: u64,
    res_id: u32,
    size: u64,
    flags: u32,
    ctx_id: u32,
    iovecs: *const vaccel_iovec,
    num_iovecs: u32,
) -> i32 {
    wrap("vaccel_resource_create", || {
        let iovs: Vec<VaccelIovec> = if num_iovecs == 0 {
            Vec::new()
        } else {
            from_raw_parts(iovecs, num_iovecs as usize)
                .iter()
                .map(|iov| VaccelIovec {
                    base: iov.iov_base,
                    len: iov.iov_len,
                })
                .collect()
        };
        registry::create_resource(cookie, res_id, size, flags, ctx_id, &iovs)
    })
}

#[no_mangle]
pub extern "C" fn vaccel_resource_create_blob(
    cookie: u64,
    res_id: u32,
    size: u64,
    ctx_id: u32,
    bo_handle: u32,
) -> i32 {
    wrap("vaccel_resource_create_blob", || {
        registry::create_resource_from_blob(cookie, res_id, size, ctx_id, bo_handle)
    })
}

#[no_mangle]
pub extern "C" fn vaccel_resource_destroy(cookie: u64, res_id: u32) {
    registry::destroy_resource(cookie, res_id);
}

/// # Safety
/// `fd` must be a valid pointer to writable storage for one `int`.
#[no_mangle]
pub unsafe extern "C" fn vaccel_resource_export_fd(cookie: u64, res_id: u32, fd: *mut i32) -> i32 {
    wrap("vaccel_resource_export_fd", || {
        if fd.is_null() {
            return Err(crate::error::Error::MalformedCommandBuffer("NULL fd out"));
        }
        *fd = registry::export_resource_fd(cookie, res_id)?;
        Ok(())
    })
}

/// # Safety
/// `buffer` must point to `size` readable bytes. The buffer only needs to
/// stay valid for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn vaccel_submit_ccmd(
    cookie: u64,
    ctx_id: u32,
    buffer: *const c_void,
    size: usize,
) -> i32 {
    wrap("vaccel_submit_ccmd", || {
        if buffer.is_null() || size == 0 {
            return Err(crate::error::Error::MalformedCommandBuffer(
                "NULL or empty ccmd buffer",
            ));
        }
        let buf = from_raw_parts(buffer.cast::<u8>(), size);
        registry::submit_ccmd(cookie, ctx_id, buf)
    })
}

#[no_mangle]
pub extern "C" fn vaccel_submit_fence(
    cookie: u64,
    ctx_id: u32,
    fence_id: u64,
    ring_idx: u32,
) -> i32 {
    wrap("vaccel_submit_fence", || {
        registry::submit_fence(cookie, ctx_id, fence_id, ring_idx)
    })
}

/// Returns a dup of the fence's sync fd, or -1 when the fence is unknown
/// or carries no fd.
#[no_mangle]
pub extern "C" fn vaccel_get_fence_fd(cookie: u64, fence_id: u64) -> i32 {
    match catch_unwind(AssertUnwindSafe(|| registry::get_fence_fd(cookie, fence_id))) {
        Ok(Ok(fd)) => fd,
        Ok(Err(e)) => {
            error!("vaccel_get_fence_fd failed: {e}");
            -1
        }
        Err(_) => {
            error!("vaccel_get_fence_fd panicked");
            -1
        }
    }
}

/// # Safety
/// `max_version` and `max_size`, when non-null, must point to writable
/// storage for one `u32` each.
#[no_mangle]
pub unsafe extern "C" fn vaccel_get_capset_info(
    cookie: u64,
    capset_id: u32,
    max_version: *mut u32,
    max_size: *mut u32,
) -> i32 {
    wrap("vaccel_get_capset_info", || {
        let (version, size) = registry::get_capset_info(cookie, capset_id)?;
        if !max_version.is_null() {
            *max_version = version;
        }
        if !max_size.is_null() {
            *max_size = size;
        }
        Ok(())
    })
}

/// # Safety
/// `capset_buf` must point to `capset_size` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn vaccel_fill_capset(
    cookie: u64,
    capset_id: u32,
    capset_version: u32,
    capset_size: u32,
    capset_buf: *mut c_void,
) -> i32 {
    wrap("vaccel_fill_capset", || {
        if capset_buf.is_null() {
            return Err(crate::error::Error::MalformedCommandBuffer(
                "NULL capset buffer",
            ));
        }
        let buf =
            std::slice::from_raw_parts_mut(capset_buf.cast::<u8>(), capset_size as usize);
        registry::fill_capset(cookie, capset_id, capset_version, buf)
    })
}
