// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest-visible CCMD wire protocol.
//!
//! Every command starts with a [`vdrm_ccmd_req`] header and every response
//! written back into the bound response resource starts with an
//! [`amdxdna_ccmd_rsp`]. Requests and responses are host-native-endian
//! `#[repr(C)]` structs: guest and host share the machine, so no byte
//! swapping happens on this path.
//!
//! `config_ctx`, `exec_cmd` and `read_sysfs` carry variable payloads after
//! their fixed part; the payload length is bounded by `hdr.len`, never by
//! the struct size.

#![allow(non_camel_case_types)]

use std::mem::size_of;

use vm_memory::ByteValued;

use crate::drm::amdxdna_qos_info;

pub const AMDXDNA_CCMD_NOP: u32 = 1;
pub const AMDXDNA_CCMD_INIT: u32 = 2;
pub const AMDXDNA_CCMD_CREATE_BO: u32 = 3;
pub const AMDXDNA_CCMD_DESTROY_BO: u32 = 4;
pub const AMDXDNA_CCMD_CREATE_CTX: u32 = 5;
pub const AMDXDNA_CCMD_DESTROY_CTX: u32 = 6;
pub const AMDXDNA_CCMD_CONFIG_CTX: u32 = 7;
pub const AMDXDNA_CCMD_EXEC_CMD: u32 = 8;
pub const AMDXDNA_CCMD_WAIT_CMD: u32 = 9;
pub const AMDXDNA_CCMD_GET_INFO: u32 = 10;
pub const AMDXDNA_CCMD_READ_SYSFS: u32 = 11;

/// Ring index that routes a fence past the hwctx tables. Ring 0 is a valid
/// kernel hwctx handle, so the sentinel sits at the top of the range.
pub const AMDXDNA_INVALID_CTX_HANDLE: u32 = u32::MAX;

/// CCMD payloads are padded to this alignment inside a submit buffer.
pub const AMDXDNA_CCMD_ALIGN: u32 = 8;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct vdrm_ccmd_req {
    pub cmd: u32,
    pub len: u32,
    pub seqno: u32,
    /// Offset of this command's response inside the response resource.
    pub rsp_off: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for vdrm_ccmd_req {}

/// Every response begins with this header.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_rsp {
    pub ret: i32,
    pub len: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_rsp {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_nop_req {
    pub hdr: vdrm_ccmd_req,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_nop_req {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_init_req {
    pub hdr: vdrm_ccmd_req,
    /// Resource that subsequent responses are written into.
    pub rsp_res_id: u32,
    pub pad: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_init_req {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_create_bo_req {
    pub hdr: vdrm_ccmd_req,
    /// Backing resource; ignored for `AMDXDNA_BO_DEV`.
    pub res_id: u32,
    pub bo_type: u32,
    pub size: u64,
    /// Host mapping alignment; 0 lets the kernel place the mapping.
    pub map_align: u64,
    pub bo_flags: u64,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_create_bo_req {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_create_bo_rsp {
    pub hdr: amdxdna_ccmd_rsp,
    pub handle: u32,
    pub pad: u32,
    pub xdna_addr: u64,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_create_bo_rsp {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_destroy_bo_req {
    pub hdr: vdrm_ccmd_req,
    pub handle: u32,
    pub pad: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_destroy_bo_req {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct amdxdna_ccmd_create_ctx_req {
    pub hdr: vdrm_ccmd_req,
    pub qos: amdxdna_qos_info,
    pub max_opc: u32,
    pub num_tiles: u32,
    pub mem_size: u32,
    pub umq_bo: u32,
    pub log_buf_bo: u32,
    pub pad: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_create_ctx_req {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_create_ctx_rsp {
    pub hdr: amdxdna_ccmd_rsp,
    /// Hardware context handle; doubles as the fence ring index.
    pub handle: u32,
    pub pad: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_create_ctx_rsp {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_destroy_ctx_req {
    pub hdr: vdrm_ccmd_req,
    pub handle: u32,
    pub pad: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_destroy_ctx_req {}

/// Fixed part of `config_ctx`; `param_val_size` bytes of parameter value
/// follow when it is non-zero, otherwise `inline_param` carries the value.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_config_ctx_req {
    pub hdr: vdrm_ccmd_req,
    pub handle: u32,
    pub param_type: u32,
    pub param_val_size: u32,
    pub pad: u32,
    pub inline_param: u64,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_config_ctx_req {}

/// Fixed part of `exec_cmd`. The trailing `cmds_n_args` u64 array holds
/// `cmd_count` command BO handles followed by execution arguments starting
/// at index `arg_offset`.
///
/// `arg_count` was appended after the first wire revision; requests from
/// older guests stop at `arg_offset` and dispatch zero-fills the rest.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_exec_cmd_req {
    pub hdr: vdrm_ccmd_req,
    pub hwctx: u32,
    pub cmd_type: u32,
    pub cmd_count: u32,
    pub pad: u32,
    pub arg_offset: u32,
    pub arg_count: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_exec_cmd_req {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_exec_cmd_rsp {
    pub hdr: amdxdna_ccmd_rsp,
    /// Kernel sequence number of the submission.
    pub seq: u64,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_exec_cmd_rsp {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_wait_cmd_req {
    pub hdr: vdrm_ccmd_req,
    pub hwctx: u32,
    pub pad: u32,
    /// Sequence number to latch as the next fence's sync point.
    pub seq: u64,
    pub timeout_nsec: i64,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_wait_cmd_req {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_get_info_req {
    pub hdr: vdrm_ccmd_req,
    pub param: u32,
    /// Buffer size for `GET_INFO`, element size for `GET_ARRAY`.
    pub size: u32,
    /// 0 selects `GET_INFO`, anything else `GET_ARRAY`.
    pub num_element: u32,
    /// Resource holding the argument block and receiving the result.
    pub info_res_id: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_get_info_req {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_get_info_rsp {
    pub hdr: amdxdna_ccmd_rsp,
    pub size: u32,
    pub num_element: u32,
    pub element_size: u32,
    pub pad: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_get_info_rsp {}

/// The node name follows the header as a NUL-terminated string bounded by
/// `hdr.len`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_read_sysfs_req {
    pub hdr: vdrm_ccmd_req,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_read_sysfs_req {}

/// Followed by `val_len` raw bytes of file content.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct amdxdna_ccmd_read_sysfs_rsp {
    pub hdr: amdxdna_ccmd_rsp,
    pub val_len: u32,
    pub pad: u32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for amdxdna_ccmd_read_sysfs_rsp {}

/// Rounds `value` up to the next multiple of `align`.
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Copies a `T` out of the front of `buf`, regardless of `buf`'s
/// alignment. Returns `None` when `buf` is too short.
pub fn read_obj<T: ByteValued + Default>(buf: &[u8]) -> Option<T> {
    if buf.len() < size_of::<T>() {
        return None;
    }
    let mut obj = T::default();
    obj.as_mut_slice().copy_from_slice(&buf[..size_of::<T>()]);
    Some(obj)
}

/// Variable payload of a command: the bytes between the fixed struct and
/// `hdr.len`. Empty when the request predates the payload or was widened.
pub fn payload<T>(cmd: &[u8], hdr_len: u32) -> &[u8] {
    let fixed = size_of::<T>();
    let end = (hdr_len as usize).min(cmd.len());
    if end <= fixed {
        return &[];
    }
    &cmd[fixed..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<vdrm_ccmd_req>(), 16);
        assert_eq!(size_of::<amdxdna_ccmd_rsp>(), 8);
        assert_eq!(size_of::<amdxdna_ccmd_init_req>(), 24);
        assert_eq!(size_of::<amdxdna_ccmd_create_bo_req>(), 48);
        assert_eq!(size_of::<amdxdna_ccmd_create_bo_rsp>(), 24);
        assert_eq!(size_of::<amdxdna_ccmd_create_ctx_req>(), 64);
        assert_eq!(size_of::<amdxdna_ccmd_create_ctx_rsp>(), 16);
        assert_eq!(size_of::<amdxdna_ccmd_config_ctx_req>(), 40);
        assert_eq!(size_of::<amdxdna_ccmd_exec_cmd_req>(), 40);
        assert_eq!(size_of::<amdxdna_ccmd_exec_cmd_rsp>(), 16);
        assert_eq!(size_of::<amdxdna_ccmd_wait_cmd_req>(), 40);
        assert_eq!(size_of::<amdxdna_ccmd_get_info_req>(), 32);
        assert_eq!(size_of::<amdxdna_ccmd_get_info_rsp>(), 24);
        assert_eq!(size_of::<amdxdna_ccmd_read_sysfs_rsp>(), 16);
    }

    #[test]
    fn test_read_obj_ignores_alignment() {
        let mut buf = vec![0u8; 64];
        let req = amdxdna_ccmd_wait_cmd_req {
            hdr: vdrm_ccmd_req {
                cmd: AMDXDNA_CCMD_WAIT_CMD,
                len: 40,
                seqno: 3,
                rsp_off: 0,
            },
            hwctx: 1,
            pad: 0,
            seq: 0x1122_3344_5566_7788,
            timeout_nsec: -1,
        };
        // Place the struct at an odd offset so the source is misaligned.
        buf[1..41].copy_from_slice(req.as_slice());
        let out: amdxdna_ccmd_wait_cmd_req = read_obj(&buf[1..]).unwrap();
        assert_eq!(out, req);
    }

    #[test]
    fn test_read_obj_too_short() {
        let buf = [0u8; 8];
        assert!(read_obj::<vdrm_ccmd_req>(&buf).is_none());
    }

    #[test]
    fn test_payload_bounds() {
        let cmd = [0u8; 48];
        // Payload runs from the fixed struct to hdr.len, not to the buffer
        // end.
        assert_eq!(payload::<amdxdna_ccmd_exec_cmd_req>(&cmd, 48).len(), 8);
        assert_eq!(payload::<amdxdna_ccmd_exec_cmd_req>(&cmd, 40).len(), 0);
        // A widened request reports no payload even though the scratch
        // buffer is larger.
        assert_eq!(payload::<amdxdna_ccmd_exec_cmd_req>(&cmd, 36).len(), 0);
    }
}
