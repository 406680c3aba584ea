// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Process-wide device registry and the renderer's public entry points.
//!
//! The VMM transport addresses everything by an opaque cookie; this module
//! maps cookies to [`Device`] instances. `renderer_init` and
//! `renderer_cleanup` are the process lifecycle hooks, both idempotent.
//! Destroying a device (or tearing the registry down) drops the whole
//! object graph underneath it: contexts close their fds, hardware contexts
//! join their retirement workers.

use std::{
    collections::HashMap,
    os::fd::RawFd,
    sync::{Arc, Mutex},
};

use log::{error, info};

use crate::{
    capset::VACCEL_CAPSET_ID_AMDXDNA,
    device::Device,
    error::{Error, Result},
    resource::VaccelIovec,
    RendererCallbacks,
};

static DEVICES: Mutex<Option<HashMap<u64, Arc<Device>>>> = Mutex::new(None);

/// Called once when the embedding process brings the renderer up.
pub fn renderer_init() {
    crate::init_logger();
    let mut table = DEVICES.lock().unwrap();
    if table.is_none() {
        *table = Some(HashMap::new());
        info!("Renderer initialized");
    }
}

/// Tears down every remaining device. Safe to call repeatedly.
pub fn renderer_cleanup() {
    let table = DEVICES.lock().unwrap().take();
    if let Some(table) = table {
        info!("Renderer cleanup: destroying {} device(s)", table.len());
    }
}

fn device(cookie: u64) -> Result<Arc<Device>> {
    DEVICES
        .lock()
        .unwrap()
        .as_ref()
        .ok_or(Error::NotInitialized)?
        .get(&cookie)
        .cloned()
        .ok_or(Error::DeviceNotFound(cookie))
}

pub fn create_device(
    cookie: u64,
    capset_id: u32,
    callbacks: Arc<dyn RendererCallbacks>,
) -> Result<()> {
    if capset_id != VACCEL_CAPSET_ID_AMDXDNA {
        error!("Unsupported capset ID at device creation: {capset_id}");
        return Err(Error::InvalidCapset(capset_id));
    }

    let device = Arc::new(Device::new(cookie, capset_id, callbacks));
    {
        let mut guard = DEVICES.lock().unwrap();
        let table = guard.as_mut().ok_or(Error::NotInitialized)?;
        if table.contains_key(&cookie) {
            return Err(Error::DeviceExists(cookie));
        }
        table.insert(cookie, device.clone());
    }

    // Capset-specific post-init; a device that cannot reach its node is
    // withdrawn again.
    if let Err(e) = device.post_init() {
        error!("Device post-init failed for cookie {cookie:#x}: {e}");
        destroy_device(cookie);
        return Err(e);
    }

    info!("Device created: cookie={cookie:#x}, capset_id={capset_id}");
    Ok(())
}

/// Removes and destroys the device. A missing cookie is a no-op.
pub fn destroy_device(cookie: u64) {
    let removed = DEVICES
        .lock()
        .unwrap()
        .as_mut()
        .and_then(|table| table.remove(&cookie));
    // Teardown happens outside the registry lock; joining fence workers
    // must not block other cookies.
    drop(removed);
}

pub fn create_context(cookie: u64, ctx_id: u32, name: Option<&str>) -> Result<()> {
    device(cookie)?.create_ctx(ctx_id, 0, name)
}

pub fn destroy_context(cookie: u64, ctx_id: u32) {
    if let Ok(dev) = device(cookie) {
        if let Err(e) = dev.destroy_ctx(ctx_id) {
            error!("destroy_context: {e}");
        }
    }
}

pub fn create_resource(
    cookie: u64,
    res_id: u32,
    size: u64,
    flags: u32,
    ctx_id: u32,
    iovs: &[VaccelIovec],
) -> Result<()> {
    device(cookie)?.create_resource(res_id, size, flags, ctx_id, iovs)
}

/// Registers a resource backed by an exported BO of `ctx_id`.
pub fn create_resource_from_blob(
    cookie: u64,
    res_id: u32,
    size: u64,
    ctx_id: u32,
    bo_handle: u32,
) -> Result<()> {
    device(cookie)?.create_resource_from_blob(res_id, size, ctx_id, bo_handle)
}

pub fn destroy_resource(cookie: u64, res_id: u32) {
    if let Ok(dev) = device(cookie) {
        if let Err(e) = dev.destroy_resource(res_id) {
            error!("destroy_resource: {e}");
        }
    }
}

pub fn export_resource_fd(cookie: u64, res_id: u32) -> Result<RawFd> {
    device(cookie)?.export_resource_fd(res_id)
}

pub fn submit_ccmd(cookie: u64, ctx_id: u32, buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        return Err(Error::MalformedCommandBuffer("empty ccmd buffer"));
    }
    device(cookie)?.submit_ccmd(ctx_id, buf)
}

pub fn submit_fence(cookie: u64, ctx_id: u32, fence_id: u64, ring_idx: u32) -> Result<()> {
    device(cookie)?.submit_fence(ctx_id, 0, ring_idx, fence_id)
}

pub fn get_fence_fd(cookie: u64, fence_id: u64) -> Result<RawFd> {
    device(cookie)?.get_fence_fd(fence_id)
}

pub fn get_capset_info(cookie: u64, capset_id: u32) -> Result<(u32, u32)> {
    device(cookie)?.get_capset_info(capset_id)
}

pub fn fill_capset(cookie: u64, capset_id: u32, version: u32, buf: &mut [u8]) -> Result<()> {
    device(cookie)?.fill_capset(capset_id, version, buf)
}
