// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::io;

use thiserror::Error as ThisError;
use vmm_sys_util::errno::Error as IoError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised inside the renderer core.
///
/// Every variant maps onto a negative errno through [`Error::errno`]; the
/// FFI boundary and the CCMD error responses only ever see that integer.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Renderer not initialized")]
    NotInitialized,
    #[error("Device not found for cookie {0:#x}")]
    DeviceNotFound(u64),
    #[error("Device already exists for cookie {0:#x}")]
    DeviceExists(u64),
    #[error("Unsupported capset ID: {0}")]
    UnsupportedCapset(u32),
    #[error("Invalid capset ID at device creation: {0}")]
    InvalidCapset(u32),
    #[error("Capset buffer too small: {0} < {1}")]
    CapsetBufferTooSmall(usize, usize),
    #[error("Context not found: ctx_id={0}")]
    ContextNotFound(u32),
    #[error("Context already exists: ctx_id={0}")]
    ContextExists(u32),
    #[error("Resource not found: res_id={0}")]
    ResourceNotFound(u32),
    #[error("Resource already exists: res_id={0}")]
    ResourceExists(u32),
    #[error("Resource is not exportable: res_id={0}")]
    ResourceNotExportable(u32),
    #[error("Buffer object not found: handle={0}")]
    BoNotFound(u32),
    #[error("Buffer object already tracked: handle={0}")]
    BoExists(u32),
    #[error("Hardware context not found: ring_idx={0}")]
    HwctxNotFound(u32),
    #[error("Hardware context already tracked: handle={0}")]
    HwctxExists(u32),
    #[error("Fence already exists: fence_id={0}")]
    FenceExists(u64),
    #[error("Fence not found: fence_id={0}")]
    FenceNotFound(u64),
    #[error("Invalid command id {0}")]
    InvalidCommand(u32),
    #[error("Command {0} too short: {1} < {2} bytes")]
    CommandTooShort(&'static str, u32, u32),
    #[error("Malformed command buffer: {0}")]
    MalformedCommandBuffer(&'static str),
    #[error("Range does not fit resource iovecs: {0} bytes left after {1}")]
    ShortRange(usize, usize),
    #[error("Response resource not bound (missing init)")]
    ResponseNotBound,
    #[error("Integer overflow sizing get_info: {0} * {1}")]
    InfoSizeOverflow(u32, u32),
    #[error("Required callback not provided: {0}")]
    CallbackMissing(&'static str),
    #[error("Failed to get device fd: {0}")]
    DeviceFd(io::Error),
    #[error("Ioctl {0} failed: {1}")]
    IoctlFailure(&'static str, IoError),
    #[error("Failed to reserve {0} bytes of address space: {1}")]
    ReserveFailed(usize, IoError),
    #[error("Failed to map buffer object: {0}")]
    MapFailed(IoError),
    #[error("Sysfs read of {0} failed: {1}")]
    SysfsRead(String, io::Error),
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl Error {
    /// Negative errno seen by the transport and written into error
    /// responses.
    pub fn errno(&self) -> i32 {
        use Error::*;
        match self {
            NotInitialized | InvalidCapset(_) | CapsetBufferTooSmall(..) | InvalidCommand(_)
            | CommandTooShort(..) | MalformedCommandBuffer(_) | ShortRange(..)
            | ResponseNotBound | InfoSizeOverflow(..) | ResourceNotExportable(_) => -libc::EINVAL,
            DeviceNotFound(_) | DeviceFd(_) => -libc::ENODEV,
            ContextNotFound(_) | ResourceNotFound(_) | BoNotFound(_) | HwctxNotFound(_)
            | FenceNotFound(_) => -libc::ENOENT,
            DeviceExists(_) | ContextExists(_) | ResourceExists(_) | BoExists(_)
            | HwctxExists(_) | FenceExists(_) => -libc::EEXIST,
            UnsupportedCapset(_) | CallbackMissing(_) => -libc::ENOTSUP,
            IoctlFailure(_, e) => -e.errno(),
            ReserveFailed(..) => -libc::ENOMEM,
            MapFailed(_) => -libc::EFAULT,
            SysfsRead(_, e) | Io(e) => e.raw_os_error().map_or(-libc::EIO, |n| -n),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
