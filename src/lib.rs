// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Host-side renderer for para-virtualized AMD XDNA AI accelerators.
//!
//! A guest XDNA shim driver issues virtio-GPU-style command packets
//! (CCMDs) through a virtualized transport. This crate is the host half:
//! it decodes each CCMD, issues the equivalent AMDXDNA DRM ioctl on a real
//! device node, writes structured responses into guest-pinned
//! scatter-gather memory, and retires fences asynchronously through a
//! VMM-provided callback.
//!
//! The embedding VMM drives the renderer through the [`registry`] module
//! (or the C entry points in [`ffi`]): it creates one device per guest
//! cookie, registers guest resources, and forwards CCMD buffers and fence
//! submissions. Everything device-node related (opening fds, translating
//! cookie to fd) stays on the VMM side, injected through
//! [`RendererCallbacks`].
//!
//! Set `XVDNA_LOG_LEVEL` (`ERROR`/`INFO`/`DEBUG`, or `0`/`1`/`2`) to
//! control logging; it defaults to `INFO`, and `RUST_LOG` is honored when
//! the variable is unset.

pub mod bo;
pub mod capset;
pub mod context;
pub mod device;
pub mod drm;
pub mod error;
pub mod ffi;
pub mod hwctx;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod table;
#[cfg(test)]
pub(crate) mod testutils;

use std::{io, os::fd::OwnedFd};

use log::LevelFilter;

pub use crate::{
    error::{Error, Result},
    registry::{
        create_context, create_device, create_resource, create_resource_from_blob,
        destroy_context, destroy_device, destroy_resource, export_resource_fd, fill_capset,
        get_capset_info, get_fence_fd, renderer_cleanup, renderer_init, submit_ccmd, submit_fence,
    },
    resource::VaccelIovec,
};

/// Host services the VMM injects into the renderer.
///
/// `get_device_fd` is the only bridge from an opaque guest cookie to a
/// real DRM fd; it is called once per context, and the returned fd is
/// owned (and eventually closed) by the renderer. `write_context_fence`
/// is invoked exactly once per submitted fence, possibly from a
/// retirement worker thread.
pub trait RendererCallbacks: Send + Sync {
    fn get_device_fd(&self, cookie: u64) -> io::Result<OwnedFd>;

    fn write_context_fence(&self, cookie: u64, ctx_id: u32, ring_idx: u32, fence_id: u64);

    /// Whether the VMM registered a fence writer at all. Hardware-context
    /// creation is refused without one.
    fn supports_context_fence(&self) -> bool {
        true
    }
}

fn level_from_env(value: Option<&str>) -> LevelFilter {
    match value {
        Some("ERROR") | Some("0") => LevelFilter::Error,
        Some("DEBUG") | Some("2") => LevelFilter::Debug,
        // INFO, 1, or anything unrecognized.
        _ => LevelFilter::Info,
    }
}

/// Installs the global logger. Safe to call more than once; later calls
/// are no-ops.
pub fn init_logger() {
    let mut builder = env_logger::Builder::new();
    match std::env::var("XVDNA_LOG_LEVEL") {
        Ok(value) => {
            builder.filter_level(level_from_env(Some(&value)));
        }
        Err(_) => {
            builder.filter_level(level_from_env(None));
            builder.parse_default_env();
        }
    }
    let _ = builder.try_init();
}
