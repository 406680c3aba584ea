// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! AMDXDNA and generic DRM kernel ABI.
//!
//! Struct layouts and ioctl numbers are bit-exact copies of the kernel's
//! `drm.h`/`amdxdna_accel.h` uapi headers. Only the subset the renderer
//! issues is defined here.

#![allow(non_camel_case_types)]

use std::{
    mem::size_of,
    os::fd::{FromRawFd, OwnedFd, RawFd},
};

use libc::{c_ulong, c_void};
use vmm_sys_util::errno;

use crate::error::{Error, Result};

// The type of the `req` parameter is different for the `musl` library. This
// will enable successful build for other non-musl libraries.
#[cfg(target_env = "musl")]
type IoctlRequest = libc::c_int;
#[cfg(not(target_env = "musl"))]
type IoctlRequest = c_ulong;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;

const DRM_IOCTL_BASE: u32 = b'd' as u32;
const DRM_COMMAND_BASE: u32 = 0x40;

const fn ioc(dir: u32, nr: u32, size: usize) -> IoctlRequest {
    ((dir << IOC_DIRSHIFT)
        | (DRM_IOCTL_BASE << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as IoctlRequest
}

const fn drm_iow<T>(nr: u32) -> IoctlRequest {
    ioc(IOC_WRITE, nr, size_of::<T>())
}

const fn drm_iowr<T>(nr: u32) -> IoctlRequest {
    ioc(IOC_READ | IOC_WRITE, nr, size_of::<T>())
}

/// Driver-specific ioctl numbers, from `amdxdna_accel.h`.
const DRM_AMDXDNA_CREATE_HWCTX: u32 = 0;
const DRM_AMDXDNA_DESTROY_HWCTX: u32 = 1;
const DRM_AMDXDNA_CONFIG_HWCTX: u32 = 2;
const DRM_AMDXDNA_CREATE_BO: u32 = 3;
const DRM_AMDXDNA_GET_BO_INFO: u32 = 4;
const DRM_AMDXDNA_EXEC_CMD: u32 = 6;
const DRM_AMDXDNA_GET_INFO: u32 = 7;
const DRM_AMDXDNA_GET_ARRAY: u32 = 10;

pub const AMDXDNA_INVALID_ADDR: u64 = u64::MAX;

/// `enum amdxdna_bo_type`
pub const AMDXDNA_BO_INVALID: u32 = 0;
pub const AMDXDNA_BO_SHMEM: u32 = 1;
pub const AMDXDNA_BO_DEV_HEAP: u32 = 2;
pub const AMDXDNA_BO_DEV: u32 = 3;
pub const AMDXDNA_BO_CMD: u32 = 4;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_qos_info {
    pub gops: u32,
    pub fps: u32,
    pub dma_bandwidth: u32,
    pub latency: u32,
    pub frame_exec_time: u32,
    pub priority: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_drm_create_hwctx {
    pub ext: u64,
    pub ext_flags: u64,
    pub qos_p: u64,
    pub umq_bo: u32,
    pub log_buf_bo: u32,
    pub max_opc: u32,
    pub num_tiles: u32,
    pub mem_size: u32,
    pub umq_doorbell: u32,
    pub handle: u32,
    pub syncobj_handle: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_drm_destroy_hwctx {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_drm_config_hwctx {
    pub handle: u32,
    pub param_type: u32,
    pub param_val: u64,
    pub param_val_size: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_drm_create_bo {
    pub flags: u64,
    pub vaddr: u64,
    pub size: u64,
    pub type_: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_drm_get_bo_info {
    pub ext: u64,
    pub ext_flags: u64,
    pub handle: u32,
    pub pad: u32,
    pub map_offset: u64,
    pub vaddr: u64,
    pub xdna_addr: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_drm_exec_cmd {
    pub ext: u64,
    pub ext_flags: u64,
    pub hwctx: u32,
    pub type_: u32,
    pub cmd_handles: u64,
    pub args: u64,
    pub cmd_count: u32,
    pub arg_count: u32,
    pub seq: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_drm_get_info {
    pub param: u32,
    pub buffer_size: u32,
    pub buffer: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_drm_get_array {
    pub param: u32,
    pub element_size: u32,
    pub num_element: u32,
    pub pad: u32,
    pub buffer: u64,
}

/// Header of the va-table passed through `CREATE_BO.vaddr` for BOs backed
/// by guest pages, followed by `num_entries` `amdxdna_drm_va_entry`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_drm_va_tbl {
    pub udma_fd: i32,
    pub num_entries: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_drm_va_entry {
    pub vaddr: u64,
    pub len: u64,
}

pub const DRM_IOCTL_AMDXDNA_CREATE_HWCTX: IoctlRequest =
    drm_iowr::<amdxdna_drm_create_hwctx>(DRM_COMMAND_BASE + DRM_AMDXDNA_CREATE_HWCTX);
pub const DRM_IOCTL_AMDXDNA_DESTROY_HWCTX: IoctlRequest =
    drm_iowr::<amdxdna_drm_destroy_hwctx>(DRM_COMMAND_BASE + DRM_AMDXDNA_DESTROY_HWCTX);
pub const DRM_IOCTL_AMDXDNA_CONFIG_HWCTX: IoctlRequest =
    drm_iowr::<amdxdna_drm_config_hwctx>(DRM_COMMAND_BASE + DRM_AMDXDNA_CONFIG_HWCTX);
pub const DRM_IOCTL_AMDXDNA_CREATE_BO: IoctlRequest =
    drm_iowr::<amdxdna_drm_create_bo>(DRM_COMMAND_BASE + DRM_AMDXDNA_CREATE_BO);
pub const DRM_IOCTL_AMDXDNA_GET_BO_INFO: IoctlRequest =
    drm_iowr::<amdxdna_drm_get_bo_info>(DRM_COMMAND_BASE + DRM_AMDXDNA_GET_BO_INFO);
pub const DRM_IOCTL_AMDXDNA_EXEC_CMD: IoctlRequest =
    drm_iowr::<amdxdna_drm_exec_cmd>(DRM_COMMAND_BASE + DRM_AMDXDNA_EXEC_CMD);
pub const DRM_IOCTL_AMDXDNA_GET_INFO: IoctlRequest =
    drm_iowr::<amdxdna_drm_get_info>(DRM_COMMAND_BASE + DRM_AMDXDNA_GET_INFO);
pub const DRM_IOCTL_AMDXDNA_GET_ARRAY: IoctlRequest =
    drm_iowr::<amdxdna_drm_get_array>(DRM_COMMAND_BASE + DRM_AMDXDNA_GET_ARRAY);

/// Generic DRM, from `drm.h`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct drm_prime_handle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct drm_set_client_name {
    pub name_len: u64,
    pub name: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct drm_syncobj_destroy {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct drm_syncobj_handle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct drm_syncobj_timeline_wait {
    pub handles: u64,
    pub points: u64,
    pub timeout_nsec: i64,
    pub count_handles: u32,
    pub flags: u32,
    pub first_signaled: u32,
    pub pad: u32,
}

pub const DRM_SYNCOBJ_WAIT_FLAGS_WAIT_FOR_SUBMIT: u32 = 1 << 1;

pub const DRM_IOCTL_GEM_CLOSE: IoctlRequest = drm_iow::<drm_gem_close>(0x09);
pub const DRM_IOCTL_SET_CLIENT_NAME: IoctlRequest = drm_iowr::<drm_set_client_name>(0x0D);
pub const DRM_IOCTL_PRIME_HANDLE_TO_FD: IoctlRequest = drm_iowr::<drm_prime_handle>(0x2d);
pub const DRM_IOCTL_SYNCOBJ_DESTROY: IoctlRequest = drm_iowr::<drm_syncobj_destroy>(0xC0);
pub const DRM_IOCTL_SYNCOBJ_HANDLE_TO_FD: IoctlRequest = drm_iowr::<drm_syncobj_handle>(0xC1);
pub const DRM_IOCTL_SYNCOBJ_TIMELINE_WAIT: IoctlRequest =
    drm_iowr::<drm_syncobj_timeline_wait>(0xCA);

pub const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
pub const DRM_RDWR: u32 = libc::O_RDWR as u32;

/// Issues an ioctl with a mutable argument struct, capturing errno on
/// failure.
pub fn drm_ioctl<T>(fd: RawFd, request: IoctlRequest, arg: &mut T, op: &'static str) -> Result<()> {
    // SAFETY: `arg` is a valid, live `#[repr(C)]` struct of the size the
    // request number encodes, and the kernel does not retain the pointer
    // past the call.
    let ret = unsafe { libc::ioctl(fd, request, arg as *mut T as *mut c_void) };
    if ret < 0 {
        return Err(Error::IoctlFailure(op, errno::Error::last()));
    }
    Ok(())
}

pub fn gem_close(fd: RawFd, handle: u32) -> Result<()> {
    let mut req = drm_gem_close { handle, pad: 0 };
    drm_ioctl(fd, DRM_IOCTL_GEM_CLOSE, &mut req, "GEM_CLOSE")
}

pub fn syncobj_destroy(fd: RawFd, handle: u32) -> Result<()> {
    let mut req = drm_syncobj_destroy { handle, pad: 0 };
    drm_ioctl(fd, DRM_IOCTL_SYNCOBJ_DESTROY, &mut req, "SYNCOBJ_DESTROY")
}

/// Exports a syncobj as a file descriptor the caller owns.
pub fn syncobj_handle_to_fd(fd: RawFd, handle: u32) -> Result<OwnedFd> {
    let mut req = drm_syncobj_handle {
        handle,
        flags: 0,
        fd: -1,
        pad: 0,
    };
    drm_ioctl(fd, DRM_IOCTL_SYNCOBJ_HANDLE_TO_FD, &mut req, "SYNCOBJ_HANDLE_TO_FD")?;
    // SAFETY: on success the kernel returned a fresh fd that nothing else
    // owns yet.
    Ok(unsafe { OwnedFd::from_raw_fd(req.fd) })
}

/// Exports a GEM handle as a dma-buf fd.
pub fn prime_handle_to_fd(fd: RawFd, handle: u32) -> Result<OwnedFd> {
    let mut req = drm_prime_handle {
        handle,
        flags: DRM_CLOEXEC | DRM_RDWR,
        fd: -1,
    };
    drm_ioctl(fd, DRM_IOCTL_PRIME_HANDLE_TO_FD, &mut req, "PRIME_HANDLE_TO_FD")?;
    // SAFETY: on success the kernel returned a fresh fd that nothing else
    // owns yet.
    Ok(unsafe { OwnedFd::from_raw_fd(req.fd) })
}

pub fn set_client_name(fd: RawFd, name: &str) -> Result<()> {
    let mut req = drm_set_client_name {
        name_len: name.len() as u64,
        name: name.as_ptr() as u64,
    };
    drm_ioctl(fd, DRM_IOCTL_SET_CLIENT_NAME, &mut req, "SET_CLIENT_NAME")
}

/// Blocks until `point` signals on the timeline syncobj, the timeout
/// expires, or the wait fails.
pub fn syncobj_timeline_wait(
    fd: RawFd,
    handle: u32,
    point: u64,
    timeout_nsec: i64,
) -> Result<()> {
    let handles = [handle];
    let points = [point];
    let mut req = drm_syncobj_timeline_wait {
        handles: handles.as_ptr() as u64,
        points: points.as_ptr() as u64,
        timeout_nsec,
        count_handles: 1,
        flags: DRM_SYNCOBJ_WAIT_FLAGS_WAIT_FOR_SUBMIT,
        first_signaled: 0,
        pad: 0,
    };
    drm_ioctl(fd, DRM_IOCTL_SYNCOBJ_TIMELINE_WAIT, &mut req, "SYNCOBJ_TIMELINE_WAIT")
}

/// `os_dupfd_cloexec` equivalent.
pub fn dup_fd_cloexec(fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC with a lower bound of 3 only allocates a new
    // descriptor; it does not touch memory.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) };
    if dup < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: `dup` is a freshly created descriptor owned by no one else.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn test_ioctl_numbers_match_kernel() {
        // Reference values computed from the kernel's _IOW/_IOWR macros.
        assert_eq!(DRM_IOCTL_GEM_CLOSE as u64, 0x4008_6409);
        assert_eq!(DRM_IOCTL_PRIME_HANDLE_TO_FD as u64, 0xC00C_642D);
        assert_eq!(DRM_IOCTL_SYNCOBJ_DESTROY as u64, 0xC008_64C0);
        assert_eq!(DRM_IOCTL_SYNCOBJ_HANDLE_TO_FD as u64, 0xC010_64C1);
        assert_eq!(DRM_IOCTL_SYNCOBJ_TIMELINE_WAIT as u64, 0xC028_64CA);
        assert_eq!(DRM_IOCTL_SET_CLIENT_NAME as u64, 0xC010_640D);
    }

    #[test]
    fn test_struct_sizes_match_uapi() {
        assert_eq!(size_of::<amdxdna_qos_info>(), 24);
        assert_eq!(size_of::<amdxdna_drm_create_hwctx>(), 56);
        assert_eq!(size_of::<amdxdna_drm_config_hwctx>(), 24);
        assert_eq!(size_of::<amdxdna_drm_create_bo>(), 32);
        assert_eq!(size_of::<amdxdna_drm_get_bo_info>(), 48);
        assert_eq!(size_of::<amdxdna_drm_exec_cmd>(), 56);
        assert_eq!(size_of::<amdxdna_drm_get_info>(), 16);
        assert_eq!(size_of::<amdxdna_drm_get_array>(), 24);
        assert_eq!(size_of::<drm_syncobj_timeline_wait>(), 40);
        assert_eq!(size_of::<amdxdna_drm_va_tbl>(), 8);
        assert_eq!(size_of::<amdxdna_drm_va_entry>(), 16);
    }

    #[test]
    fn test_ioctl_on_non_drm_fd_fails() {
        let file = tempfile::tempfile().unwrap();
        let err = gem_close(file.as_raw_fd(), 1).unwrap_err();
        assert_eq!(err.errno(), -libc::ENOTTY);
    }

    #[test]
    fn test_dup_fd_cloexec() {
        let file = tempfile::tempfile().unwrap();
        let dup = dup_fd_cloexec(file.as_raw_fd()).unwrap();
        assert_ne!(dup.as_raw_fd(), file.as_raw_fd());
        // SAFETY: querying descriptor flags reads no memory.
        let flags = unsafe { libc::fcntl(dup.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_dup_fd_cloexec_bad_fd() {
        assert!(dup_fd_cloexec(-1).is_err());
    }
}
