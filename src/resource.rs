// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest scatter-gather resources.
//!
//! A resource is a byte region described by a list of iovecs into memory
//! the VMM has pinned for the resource's lifetime. It carries CCMD request
//! payloads and receives response bytes. The renderer never owns the iovec
//! memory; it may own an exported dma-buf fd for the resource.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use libc::c_void;
use log::debug;

use crate::{
    drm::dup_fd_cloexec,
    error::{Error, Result},
};

/// One guest memory segment backing part of a resource.
#[derive(Copy, Clone, Debug)]
pub struct VaccelIovec {
    pub base: *mut c_void,
    pub len: usize,
}

pub struct Resource {
    res_id: u32,
    size: u64,
    flags: u32,
    ctx_id: u32,
    iovs: Vec<VaccelIovec>,
    /// Exported dma-buf for blob-backed resources.
    opaque_fd: Option<OwnedFd>,
}

// SAFETY: the iovecs point into memory the VMM guarantees pinned and valid
// for the lifetime of the resource, and all access goes through `read`/
// `write`, which never hand the pointers out.
unsafe impl Send for Resource {}
// SAFETY: as above; `read` and `write` only perform plain byte copies and
// the guest serializes commands that touch the same region.
unsafe impl Sync for Resource {}

impl Resource {
    pub fn new(res_id: u32, size: u64, flags: u32, ctx_id: u32, iovs: Vec<VaccelIovec>) -> Self {
        Self {
            res_id,
            size,
            flags,
            ctx_id,
            iovs,
            opaque_fd: None,
        }
    }

    /// A resource backed by an exported buffer object rather than guest
    /// pages.
    pub fn from_blob(res_id: u32, size: u64, ctx_id: u32, fd: OwnedFd) -> Self {
        Self {
            res_id,
            size,
            flags: 0,
            ctx_id,
            iovs: Vec::new(),
            opaque_fd: Some(fd),
        }
    }

    pub fn res_id(&self) -> u32 {
        self.res_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn ctx_id(&self) -> u32 {
        self.ctx_id
    }

    pub fn iovs(&self) -> &[VaccelIovec] {
        &self.iovs
    }

    /// Duplicates the exported dma-buf fd for the caller.
    pub fn export_fd(&self) -> Result<RawFd> {
        let fd = self
            .opaque_fd
            .as_ref()
            .ok_or(Error::ResourceNotExportable(self.res_id))?;
        Ok(dup_fd_cloexec(fd.as_raw_fd())?.into_raw_fd())
    }

    /// Copies `buf` into the resource at `offset`, walking the iovec list.
    /// The copy is not transactional: bytes written before a short-range
    /// failure stay written.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut offset = offset as usize;
        let mut written = 0usize;

        for iov in &self.iovs {
            if written == buf.len() {
                break;
            }
            if offset >= iov.len {
                offset -= iov.len;
                continue;
            }
            let len = (buf.len() - written).min(iov.len - offset);
            // SAFETY: `iov.base + offset .. + len` stays inside a pinned
            // guest segment and `buf[written..]` holds at least `len`
            // bytes; the regions cannot overlap.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr().add(written),
                    (iov.base as *mut u8).add(offset),
                    len,
                );
            }
            written += len;
            offset = 0;
        }

        if written < buf.len() {
            return Err(Error::ShortRange(buf.len() - written, written));
        }
        Ok(written)
    }

    /// Copies bytes out of the resource at `offset` into `buf`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut offset = offset as usize;
        let mut read = 0usize;

        for iov in &self.iovs {
            if read == buf.len() {
                break;
            }
            if offset >= iov.len {
                offset -= iov.len;
                continue;
            }
            let len = (buf.len() - read).min(iov.len - offset);
            // SAFETY: symmetric to `write`; the source segment is pinned
            // guest memory and `buf[read..]` holds at least `len` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (iov.base as *const u8).add(offset),
                    buf.as_mut_ptr().add(read),
                    len,
                );
            }
            read += len;
            offset = 0;
        }

        if read < buf.len() {
            return Err(Error::ShortRange(buf.len() - read, read));
        }
        Ok(read)
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        debug!(
            "Resource destroyed: res_id={}, ctx_id={}, exported={}",
            self.res_id,
            self.ctx_id,
            self.opaque_fd.is_some()
        );
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    /// Backing store for iovec-based tests; keeps the buffers alive for
    /// the resource's lifetime the way the VMM pins guest pages.
    struct Backing {
        bufs: Vec<Vec<u8>>,
    }

    impl Backing {
        fn new(sizes: &[usize]) -> Self {
            Self {
                bufs: sizes.iter().map(|&s| vec![0u8; s]).collect(),
            }
        }

        fn iovs(&mut self) -> Vec<VaccelIovec> {
            self.bufs
                .iter_mut()
                .map(|b| VaccelIovec {
                    base: b.as_mut_ptr().cast::<libc::c_void>(),
                    len: b.len(),
                })
                .collect()
        }
    }

    #[test]
    fn test_write_read_roundtrip_single_iov() {
        let mut backing = Backing::new(&[64]);
        let res = Resource::new(1, 64, 0, 0, backing.iovs());

        let data = [0xabu8, 0xcd, 0xef, 0x01];
        assert_eq!(res.write(10, &data).unwrap(), 4);

        let mut out = [0u8; 4];
        assert_eq!(res.read(10, &mut out).unwrap(), 4);
        assert_eq!(out, data);
    }

    #[test]
    fn test_write_read_spans_iovecs() {
        let mut backing = Backing::new(&[8, 4, 16]);
        let res = Resource::new(1, 28, 0, 0, backing.iovs());

        let data: Vec<u8> = (0..20).collect();
        // Starts in the first iovec, crosses the 4-byte middle one.
        assert_eq!(res.write(5, &data).unwrap(), 20);

        let mut out = vec![0u8; 20];
        assert_eq!(res.read(5, &mut out).unwrap(), 20);
        assert_eq!(out, data);

        // The middle iovec holds bytes 3..7 of the pattern.
        assert_eq!(backing.bufs[1], vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_offset_skips_whole_iovecs() {
        let mut backing = Backing::new(&[4, 4, 4]);
        let res = Resource::new(1, 12, 0, 0, backing.iovs());

        res.write(9, &[7, 8]).unwrap();
        assert_eq!(backing.bufs[2][1..3], [7, 8]);
    }

    #[test]
    fn test_out_of_range_write_fails_with_partial_transfer() {
        let mut backing = Backing::new(&[4, 4]);
        let res = Resource::new(1, 8, 0, 0, backing.iovs());

        let err = res.write(6, &[1, 2, 3, 4]).unwrap_err();
        assert_matches!(err, Error::ShortRange(2, 2));
        assert_eq!(err.errno(), -libc::EINVAL);
        // The bytes that did fit are observable.
        assert_eq!(backing.bufs[1][2..], [1, 2]);
    }

    #[test]
    fn test_out_of_range_read_fails() {
        let mut backing = Backing::new(&[16]);
        let res = Resource::new(1, 16, 0, 0, backing.iovs());

        let mut out = [0u8; 8];
        assert_matches!(res.read(12, &mut out), Err(Error::ShortRange(4, 4)));
        // Offset entirely past the end transfers nothing.
        assert_matches!(res.read(16, &mut out), Err(Error::ShortRange(8, 0)));
    }

    #[test]
    fn test_zero_length_transfer() {
        let mut backing = Backing::new(&[4]);
        let res = Resource::new(1, 4, 0, 0, backing.iovs());
        assert_eq!(res.write(2, &[]).unwrap(), 0);
        assert_eq!(res.read(2, &mut []).unwrap(), 0);
    }

    #[test]
    fn test_export_fd_requires_blob() {
        let res = Resource::new(1, 0, 0, 0, Vec::new());
        assert_matches!(res.export_fd(), Err(Error::ResourceNotExportable(1)));

        let file = tempfile::tempfile().unwrap();
        let res = Resource::from_blob(2, 4096, 0, file.into());
        let fd = res.export_fd().unwrap();
        assert!(fd >= 0);
        // SAFETY: we own the freshly duplicated descriptor.
        unsafe { libc::close(fd) };
    }
}
