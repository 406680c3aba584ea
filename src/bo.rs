// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Kernel buffer objects.
//!
//! A `Bo` wraps a GEM handle created on a context's DRM fd. Device-only
//! BOs live entirely on the accelerator; guest-backed BOs hand the kernel
//! a va-table describing the backing resource's pinned iovecs and are then
//! mapped into the host process, optionally at a guest-requested
//! alignment.
//!
//! The kernel offers no way to request mmap alignment, so alignment is
//! built by hand: reserve `map_size + align` anonymous pages, pick the
//! first aligned address inside the reservation, `MAP_FIXED` the BO there
//! and return the slack at both ends to the OS.

use std::{mem::size_of, os::fd::RawFd, ptr};

use libc::{c_void, off_t, MAP_FAILED};
use log::{debug, warn};
use vmm_sys_util::errno;

use crate::{
    drm::{
        amdxdna_drm_create_bo, amdxdna_drm_get_bo_info, amdxdna_drm_va_entry, amdxdna_drm_va_tbl,
        drm_ioctl, gem_close, DRM_IOCTL_AMDXDNA_CREATE_BO, DRM_IOCTL_AMDXDNA_GET_BO_INFO,
        AMDXDNA_INVALID_ADDR,
    },
    error::{Error, Result},
    protocol::{align_up, amdxdna_ccmd_create_bo_req},
    resource::Resource,
};

#[derive(Debug)]
pub struct Bo {
    bo_handle: u32,
    bo_type: u32,
    size: u64,
    vaddr: u64,
    map_offset: u64,
    xdna_addr: u64,
    map_size: u64,
    mapped: bool,
    ctx_fd: RawFd,
}

fn push_struct<T: Copy>(buf: &mut Vec<u8>, val: &T) {
    // SAFETY: `T` is a plain `#[repr(C)]` value; viewing it as bytes for
    // the duration of the copy is sound.
    let bytes =
        unsafe { std::slice::from_raw_parts((val as *const T).cast::<u8>(), size_of::<T>()) };
    buf.extend_from_slice(bytes);
}

impl Bo {
    /// Creates a device-only BO (no host backing, no mapping).
    pub fn new(ctx_fd: RawFd, req: &amdxdna_ccmd_create_bo_req) -> Result<Bo> {
        let handle = Self::create_bo(ctx_fd, req, 0)?;
        let info = Self::bo_info(ctx_fd, handle).inspect_err(|_| Self::close(ctx_fd, handle))?;

        Ok(Bo {
            bo_handle: handle,
            bo_type: req.bo_type,
            size: req.size,
            vaddr: info.vaddr,
            map_offset: info.map_offset,
            xdna_addr: info.xdna_addr,
            map_size: 0,
            mapped: false,
            ctx_fd,
        })
    }

    /// Creates a BO backed by a resource's guest pages and maps it into
    /// the host process.
    pub fn from_resource(
        res: &Resource,
        ctx_fd: RawFd,
        req: &amdxdna_ccmd_create_bo_req,
    ) -> Result<Bo> {
        let iovs = res.iovs();

        let mut tbl = Vec::with_capacity(
            size_of::<amdxdna_drm_va_tbl>() + iovs.len() * size_of::<amdxdna_drm_va_entry>(),
        );
        push_struct(
            &mut tbl,
            &amdxdna_drm_va_tbl {
                udma_fd: -1,
                num_entries: iovs.len() as u32,
            },
        );
        let mut map_size = 0u64;
        for iov in iovs {
            push_struct(
                &mut tbl,
                &amdxdna_drm_va_entry {
                    vaddr: iov.base as u64,
                    len: iov.len as u64,
                },
            );
            map_size += iov.len as u64;
        }

        let handle = Self::create_bo(ctx_fd, req, tbl.as_ptr() as u64)?;
        let info = Self::bo_info(ctx_fd, handle).inspect_err(|_| Self::close(ctx_fd, handle))?;

        let vaddr = Self::map(ctx_fd, info.map_offset, map_size, req.map_align)
            .inspect_err(|_| Self::close(ctx_fd, handle))?;

        debug!(
            "BO created: handle={}, type={}, xdna_addr={:#x}, vaddr={:#x}, map_size={}",
            handle, req.bo_type, info.xdna_addr, vaddr, map_size
        );

        Ok(Bo {
            bo_handle: handle,
            bo_type: req.bo_type,
            size: req.size,
            vaddr,
            map_offset: info.map_offset,
            xdna_addr: info.xdna_addr,
            map_size,
            mapped: true,
            ctx_fd,
        })
    }

    fn create_bo(ctx_fd: RawFd, req: &amdxdna_ccmd_create_bo_req, vaddr: u64) -> Result<u32> {
        let mut create = amdxdna_drm_create_bo {
            flags: req.bo_flags,
            vaddr,
            size: req.size,
            type_: req.bo_type,
            handle: 0,
        };
        drm_ioctl(ctx_fd, DRM_IOCTL_AMDXDNA_CREATE_BO, &mut create, "CREATE_BO")?;
        Ok(create.handle)
    }

    fn bo_info(ctx_fd: RawFd, handle: u32) -> Result<amdxdna_drm_get_bo_info> {
        let mut info = amdxdna_drm_get_bo_info {
            handle,
            ..Default::default()
        };
        drm_ioctl(ctx_fd, DRM_IOCTL_AMDXDNA_GET_BO_INFO, &mut info, "GET_BO_INFO")?;
        Ok(info)
    }

    fn map(ctx_fd: RawFd, map_offset: u64, map_size: u64, align: u64) -> Result<u64> {
        let map_size = map_size as usize;
        if align == 0 {
            // SAFETY: a fresh shared mapping of the BO at a kernel-chosen
            // address; failure is checked below.
            let addr = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    map_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    ctx_fd,
                    map_offset as off_t,
                )
            };
            if addr == MAP_FAILED {
                return Err(Error::MapFailed(errno::Error::last()));
            }
            return Ok(addr as u64);
        }

        let align = align as usize;
        let total = map_size + align;
        // SAFETY: anonymous PROT_NONE reservation of our own address
        // space.
        let reserve = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reserve == MAP_FAILED {
            return Err(Error::ReserveFailed(total, errno::Error::last()));
        }

        let base = reserve as usize;
        let aligned = align_up(base, align);
        // SAFETY: the target range lies inside the reservation we just
        // made, so MAP_FIXED cannot clobber foreign mappings.
        let addr = unsafe {
            libc::mmap(
                aligned as *mut c_void,
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED | libc::MAP_LOCKED,
                ctx_fd,
                map_offset as off_t,
            )
        };
        if addr == MAP_FAILED {
            let err = errno::Error::last();
            // SAFETY: returning the whole untouched reservation.
            unsafe { libc::munmap(reserve, total) };
            return Err(Error::MapFailed(err));
        }

        let head = aligned - base;
        if head > 0 {
            // SAFETY: unmapping the slack below the BO mapping, still
            // inside the reservation.
            unsafe { libc::munmap(reserve, head) };
        }
        let tail = total - head - map_size;
        if tail > 0 {
            // SAFETY: unmapping the slack above the BO mapping.
            unsafe { libc::munmap((aligned + map_size) as *mut c_void, tail) };
        }

        Ok(aligned as u64)
    }

    fn close(ctx_fd: RawFd, handle: u32) {
        if let Err(e) = gem_close(ctx_fd, handle) {
            warn!("Failed to close BO handle {handle}: {e}");
        }
    }

    pub fn handle(&self) -> u32 {
        self.bo_handle
    }

    pub fn bo_type(&self) -> u32 {
        self.bo_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn map_offset(&self) -> u64 {
        self.map_offset
    }

    /// Device address when the kernel assigned one, host mapping address
    /// otherwise.
    pub fn addr(&self) -> u64 {
        if self.xdna_addr != AMDXDNA_INVALID_ADDR {
            self.xdna_addr
        } else {
            self.vaddr
        }
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        if self.mapped {
            // SAFETY: `vaddr`/`map_size` describe the mapping this BO
            // owns.
            if unsafe { libc::munmap(self.vaddr as *mut c_void, self.map_size as usize) } < 0 {
                warn!(
                    "Failed to unmap BO handle {}: {}",
                    self.bo_handle,
                    std::io::Error::last_os_error()
                );
            }
        }
        Self::close(self.ctx_fd, self.bo_handle);
        debug!("BO destroyed: handle={}", self.bo_handle);
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{protocol::vdrm_ccmd_req, resource::VaccelIovec};

    fn create_req(bo_type: u32, size: u64, map_align: u64) -> amdxdna_ccmd_create_bo_req {
        amdxdna_ccmd_create_bo_req {
            hdr: vdrm_ccmd_req::default(),
            res_id: 0,
            bo_type,
            size,
            map_align,
            bo_flags: 0,
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(10, 3), 12);
    }

    #[test]
    fn test_va_table_layout() {
        let mut buf = Vec::new();
        push_struct(
            &mut buf,
            &amdxdna_drm_va_tbl {
                udma_fd: -1,
                num_entries: 2,
            },
        );
        push_struct(
            &mut buf,
            &amdxdna_drm_va_entry {
                vaddr: 0x1000,
                len: 0x2000,
            },
        );
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[0..4], &(-1i32).to_ne_bytes());
        assert_eq!(&buf[4..8], &2u32.to_ne_bytes());
        assert_eq!(&buf[8..16], &0x1000u64.to_ne_bytes());
    }

    #[test]
    fn test_create_on_non_drm_fd_fails() {
        let file = tempfile::tempfile().unwrap();
        let req = create_req(crate::drm::AMDXDNA_BO_DEV, 4096, 0);
        let err = Bo::new(file.as_raw_fd(), &req).unwrap_err();
        assert_matches!(err, Error::IoctlFailure("CREATE_BO", _));
    }

    #[test]
    fn test_from_resource_on_non_drm_fd_fails() {
        let mut backing = vec![0u8; 4096];
        let res = Resource::new(
            1,
            4096,
            0,
            0,
            vec![VaccelIovec {
                base: backing.as_mut_ptr().cast(),
                len: backing.len(),
            }],
        );
        let file = tempfile::tempfile().unwrap();
        let req = create_req(crate::drm::AMDXDNA_BO_SHMEM, 4096, 4096);
        let err = Bo::from_resource(&res, file.as_raw_fd(), &req).unwrap_err();
        assert_matches!(err, Error::IoctlFailure("CREATE_BO", _));
    }
}
