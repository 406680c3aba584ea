// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Capability set advertisement.
//!
//! The guest reads a single immutable capset to negotiate the wire format
//! and context type before issuing any CCMD. Only the AMDXDNA capset id
//! exists; everything else is refused.

use std::mem::size_of;

use vm_memory::ByteValued;

use crate::error::{Error, Result};

pub const VACCEL_CAPSET_ID_AMDXDNA: u32 = 0;

/// `viraccel_context_type`
pub const VACCEL_CONTEXT_AMDXDNA: u32 = 0;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct vaccel_drm_capset {
    pub wire_format_version: u32,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patchlevel: u32,
    pub context_type: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for vaccel_drm_capset {}

pub const AMDXDNA_CAPSET: vaccel_drm_capset = vaccel_drm_capset {
    wire_format_version: 1,
    version_major: 1,
    version_minor: 0,
    version_patchlevel: 0,
    context_type: VACCEL_CONTEXT_AMDXDNA,
};

pub fn validate_capset_id(capset_id: u32) -> Result<()> {
    if capset_id != VACCEL_CAPSET_ID_AMDXDNA {
        return Err(Error::UnsupportedCapset(capset_id));
    }
    Ok(())
}

/// `(max_version, max_size)` of the advertised capset.
pub fn capset_info(capset_id: u32) -> Result<(u32, u32)> {
    validate_capset_id(capset_id)?;
    Ok((
        AMDXDNA_CAPSET.version_major,
        size_of::<vaccel_drm_capset>() as u32,
    ))
}

/// Copies the capset verbatim into `buf`.
pub fn fill_capset(capset_id: u32, _version: u32, buf: &mut [u8]) -> Result<()> {
    validate_capset_id(capset_id)?;
    let blob = AMDXDNA_CAPSET.as_slice();
    if buf.len() < blob.len() {
        return Err(Error::CapsetBufferTooSmall(buf.len(), blob.len()));
    }
    buf[..blob.len()].copy_from_slice(blob);
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::protocol::read_obj;

    #[test]
    fn test_capset_info() {
        let (version, size) = capset_info(VACCEL_CAPSET_ID_AMDXDNA).unwrap();
        assert_eq!(version, 1);
        assert_eq!(size, size_of::<vaccel_drm_capset>() as u32);
    }

    #[test]
    fn test_unknown_capset_refused() {
        let err = capset_info(1).unwrap_err();
        assert_matches!(err, Error::UnsupportedCapset(1));
        assert_eq!(err.errno(), -libc::ENOTSUP);
        assert_matches!(
            fill_capset(7, 1, &mut [0u8; 64]),
            Err(Error::UnsupportedCapset(7))
        );
    }

    #[test]
    fn test_fill_capset_verbatim() {
        let mut buf = [0u8; 64];
        fill_capset(VACCEL_CAPSET_ID_AMDXDNA, 1, &mut buf).unwrap();
        let capset: vaccel_drm_capset = read_obj(&buf).unwrap();
        assert_eq!(capset, AMDXDNA_CAPSET);
        assert_eq!(capset.wire_format_version, 1);
        assert_eq!(capset.context_type, VACCEL_CONTEXT_AMDXDNA);
    }

    #[test]
    fn test_fill_capset_short_buffer() {
        let mut buf = [0u8; 8];
        let err = fill_capset(VACCEL_CAPSET_ID_AMDXDNA, 1, &mut buf).unwrap_err();
        assert_eq!(err.errno(), -libc::EINVAL);
    }
}
