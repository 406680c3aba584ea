// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Shared fixtures for unit tests.

use std::{
    fs::File,
    io,
    os::fd::OwnedFd,
    sync::Mutex,
};

use crate::RendererCallbacks;

/// Records every fence retirement and hands out `/dev/null` fds so tests
/// run without an XDNA device node.
#[derive(Default)]
pub(crate) struct TestCallbacks {
    fences: Mutex<Vec<(u64, u32, u32, u64)>>,
}

impl TestCallbacks {
    pub fn fences(&self) -> Vec<(u64, u32, u32, u64)> {
        self.fences.lock().unwrap().clone()
    }
}

impl RendererCallbacks for TestCallbacks {
    fn get_device_fd(&self, _cookie: u64) -> io::Result<OwnedFd> {
        Ok(File::open("/dev/null")?.into())
    }

    fn write_context_fence(&self, cookie: u64, ctx_id: u32, ring_idx: u32, fence_id: u64) {
        self.fences
            .lock()
            .unwrap()
            .push((cookie, ctx_id, ring_idx, fence_id));
    }
}

/// Callbacks for a VMM that never registered a fence writer.
#[derive(Default)]
pub(crate) struct NoFenceCallbacks;

impl RendererCallbacks for NoFenceCallbacks {
    fn get_device_fd(&self, _cookie: u64) -> io::Result<OwnedFd> {
        Ok(File::open("/dev/null")?.into())
    }

    fn write_context_fence(&self, _cookie: u64, _ctx_id: u32, _ring_idx: u32, _fence_id: u64) {}

    fn supports_context_fence(&self) -> bool {
        false
    }
}

/// Pinned heap buffers standing in for guest pages, plus the resource
/// iovecs over them.
pub(crate) struct GuestPages {
    bufs: Vec<Vec<u8>>,
}

impl GuestPages {
    pub fn new(sizes: &[usize]) -> Self {
        Self {
            bufs: sizes.iter().map(|&s| vec![0u8; s]).collect(),
        }
    }

    pub fn iovs(&mut self) -> Vec<crate::resource::VaccelIovec> {
        self.bufs
            .iter_mut()
            .map(|b| crate::resource::VaccelIovec {
                base: b.as_mut_ptr().cast::<libc::c_void>(),
                len: b.len(),
            })
            .collect()
    }

    pub fn bytes(&self, idx: usize) -> &[u8] {
        &self.bufs[idx]
    }
}
