// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Per-cookie device instances and the CCMD dispatcher.
//!
//! One `Device` exists per VMM cookie. It owns the context, resource and
//! fence tables and routes every CCMD through a fixed dispatch table.
//!
//! Dispatch is length-tolerant in both directions: a request longer than
//! the host's struct is fine (the excess is handler payload or ignored),
//! and a request from an older guest that stops short of the current
//! struct is widened with zero bytes so newly added trailing fields read
//! as their defaults. Requests shorter than the command's first-revision
//! size are rejected outright.

use std::{
    mem::size_of,
    os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd},
    sync::{Arc, Mutex},
};

use log::{debug, error, info, trace, warn};

use crate::{
    capset,
    context::Context,
    drm::{dup_fd_cloexec, set_client_name, syncobj_handle_to_fd, AMDXDNA_BO_DEV},
    error::{Error, Result},
    protocol::{
        align_up, payload, read_obj, amdxdna_ccmd_config_ctx_req, amdxdna_ccmd_create_bo_req,
        amdxdna_ccmd_create_ctx_req, amdxdna_ccmd_destroy_bo_req, amdxdna_ccmd_destroy_ctx_req,
        amdxdna_ccmd_exec_cmd_req, amdxdna_ccmd_get_info_req, amdxdna_ccmd_init_req,
        amdxdna_ccmd_nop_req, amdxdna_ccmd_read_sysfs_req, amdxdna_ccmd_wait_cmd_req,
        vdrm_ccmd_req, AMDXDNA_CCMD_ALIGN, AMDXDNA_INVALID_CTX_HANDLE,
    },
    resource::{Resource, VaccelIovec},
    table::HandleTable,
    RendererCallbacks,
};

/// Fence record kept for `get_fence_fd`; the retirement callback is driven
/// by the hwctx worker, not by this table.
pub struct DeviceFence {
    ring_idx: u32,
    sync_fd: Option<OwnedFd>,
}

/// Capset-specific state attached when the device is created.
struct XdnaDeviceCtx {
    drm_fd: OwnedFd,
    capset_id: u32,
}

pub struct Device {
    cookie: u64,
    capset_id: u32,
    callbacks: Arc<dyn RendererCallbacks>,
    contexts: HandleTable<u32, Context>,
    resources: HandleTable<u32, Resource>,
    fences: HandleTable<u64, DeviceFence>,
    device_ctx: Mutex<Option<XdnaDeviceCtx>>,
}

impl Device {
    pub fn new(cookie: u64, capset_id: u32, callbacks: Arc<dyn RendererCallbacks>) -> Device {
        Device {
            cookie,
            capset_id,
            callbacks,
            contexts: HandleTable::new(),
            resources: HandleTable::new(),
            fences: HandleTable::new(),
            device_ctx: Mutex::new(None),
        }
    }

    /// Capset-specific post-creation step. For AMDXDNA this probes the
    /// device fd through the VMM callback and keeps it for the device's
    /// lifetime.
    pub fn post_init(&self) -> Result<()> {
        let fd = self
            .callbacks
            .get_device_fd(self.cookie)
            .map_err(Error::DeviceFd)?;
        let dev_ctx = XdnaDeviceCtx {
            drm_fd: fd,
            capset_id: self.capset_id,
        };
        info!(
            "AMDXDNA device initialized: cookie={:#x}, fd={}, capset_id={}",
            self.cookie,
            dev_ctx.drm_fd.as_raw_fd(),
            dev_ctx.capset_id
        );
        *self.device_ctx.lock().unwrap() = Some(dev_ctx);
        Ok(())
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn capset_id(&self) -> u32 {
        self.capset_id
    }

    pub fn get_capset_info(&self, capset_id: u32) -> Result<(u32, u32)> {
        capset::capset_info(capset_id)
    }

    pub fn fill_capset(&self, capset_id: u32, version: u32, buf: &mut [u8]) -> Result<()> {
        capset::fill_capset(capset_id, version, buf)
    }

    pub fn ctx(&self, ctx_id: u32) -> Result<Arc<Context>> {
        self.contexts
            .lookup(&ctx_id)
            .ok_or(Error::ContextNotFound(ctx_id))
    }

    pub fn create_ctx(&self, ctx_id: u32, _ctx_flags: u32, name: Option<&str>) -> Result<()> {
        if self.contexts.contains(&ctx_id) {
            return Err(Error::ContextExists(ctx_id));
        }

        // Each context opens the device node itself; a guest may hold many
        // contexts on one device.
        let fd = self
            .callbacks
            .get_device_fd(self.cookie)
            .map_err(Error::DeviceFd)?;
        let ctx = Context::new(
            ctx_id,
            fd,
            AMDXDNA_CCMD_ALIGN,
            self.cookie,
            self.callbacks.clone(),
        );

        if let Some(name) = name {
            if let Err(e) = set_client_name(ctx.fd(), name) {
                warn!("Failed to set client name {name:?} on ctx {ctx_id}: {e}");
            }
        }

        if !self.contexts.insert(ctx_id, Arc::new(ctx)) {
            return Err(Error::ContextExists(ctx_id));
        }
        Ok(())
    }

    pub fn destroy_ctx(&self, ctx_id: u32) -> Result<()> {
        if !self.contexts.erase(&ctx_id) {
            return Err(Error::ContextNotFound(ctx_id));
        }
        Ok(())
    }

    pub fn resource(&self, res_id: u32) -> Result<Arc<Resource>> {
        self.resources
            .lookup(&res_id)
            .ok_or(Error::ResourceNotFound(res_id))
    }

    /// Registers a resource over guest-pinned iovecs.
    pub fn create_resource(
        &self,
        res_id: u32,
        size: u64,
        flags: u32,
        ctx_id: u32,
        iovs: &[VaccelIovec],
    ) -> Result<()> {
        let res = Resource::new(res_id, size, flags, ctx_id, iovs.to_vec());
        if !self.resources.insert(res_id, Arc::new(res)) {
            return Err(Error::ResourceExists(res_id));
        }
        Ok(())
    }

    /// Registers a resource backed by an exported BO (dma-buf), so the VMM
    /// can hand the buffer to another device or process.
    pub fn create_resource_from_blob(
        &self,
        res_id: u32,
        size: u64,
        ctx_id: u32,
        bo_handle: u32,
    ) -> Result<()> {
        if self.resources.contains(&res_id) {
            return Err(Error::ResourceExists(res_id));
        }
        let ctx = self.ctx(ctx_id)?;
        let fd = ctx.export_blob(bo_handle)?;
        let res = Resource::from_blob(res_id, size, ctx_id, fd);
        if !self.resources.insert(res_id, Arc::new(res)) {
            return Err(Error::ResourceExists(res_id));
        }
        Ok(())
    }

    pub fn destroy_resource(&self, res_id: u32) -> Result<()> {
        if !self.resources.erase(&res_id) {
            return Err(Error::ResourceNotFound(res_id));
        }
        Ok(())
    }

    pub fn export_resource_fd(&self, res_id: u32) -> Result<RawFd> {
        self.resource(res_id)?.export_fd()
    }

    /// Routes a guest fence. `AMDXDNA_INVALID_CTX_HANDLE` marks a
    /// free-floating fence that retires immediately on the caller's
    /// thread; anything else goes through the ring's hardware context.
    pub fn submit_fence(
        &self,
        ctx_id: u32,
        _flags: u32,
        ring_idx: u32,
        fence_id: u64,
    ) -> Result<()> {
        let ctx = self.ctx(ctx_id)?;

        if ring_idx == AMDXDNA_INVALID_CTX_HANDLE {
            let fence = DeviceFence {
                ring_idx,
                sync_fd: None,
            };
            if !self.fences.insert(fence_id, Arc::new(fence)) {
                return Err(Error::FenceExists(fence_id));
            }
            self.callbacks
                .write_context_fence(self.cookie, ctx_id, ring_idx, fence_id);
            return Ok(());
        }

        let hwctx = ctx.hwctx(ring_idx)?;
        let sync_fd = match syncobj_handle_to_fd(ctx.fd(), hwctx.syncobj_handle()) {
            Ok(fd) => Some(fd),
            Err(e) => {
                debug!("Fence fd export failed for fence {fence_id}: {e}");
                None
            }
        };
        let fence = DeviceFence { ring_idx, sync_fd };
        if !self.fences.insert(fence_id, Arc::new(fence)) {
            return Err(Error::FenceExists(fence_id));
        }
        hwctx.submit_fence(fence_id);
        Ok(())
    }

    /// Duplicates the sync fd recorded at fence submission.
    pub fn get_fence_fd(&self, fence_id: u64) -> Result<RawFd> {
        let fence = self
            .fences
            .lookup(&fence_id)
            .ok_or(Error::FenceNotFound(fence_id))?;
        debug!(
            "get_fence_fd: fence_id={fence_id}, ring_idx={}, has_fd={}",
            fence.ring_idx,
            fence.sync_fd.is_some()
        );
        let fd = fence
            .sync_fd
            .as_ref()
            .ok_or(Error::FenceNotFound(fence_id))?;
        Ok(dup_fd_cloexec(fd.as_raw_fd())?.into_raw_fd())
    }

    pub fn destroy_fence(&self, fence_id: u64) -> Result<()> {
        if !self.fences.erase(&fence_id) {
            return Err(Error::FenceNotFound(fence_id));
        }
        Ok(())
    }

    /// Walks a submit buffer, dispatching each CCMD at `ccmd_align`
    /// strides. Processing stops at the first failing command; its error
    /// is already written into the response resource by then.
    pub fn submit_ccmd(&self, ctx_id: u32, buf: &[u8]) -> Result<()> {
        let ctx = self.ctx(ctx_id)?;
        let align = ctx.ccmd_align() as usize;
        let mut offset = 0usize;

        while offset < buf.len() {
            let rest = &buf[offset..];
            let hdr: vdrm_ccmd_req =
                read_obj(rest).ok_or(Error::MalformedCommandBuffer("truncated ccmd header"))?;
            let len = hdr.len as usize;
            if len < size_of::<vdrm_ccmd_req>() || len > rest.len() {
                return Err(Error::MalformedCommandBuffer("ccmd length out of bounds"));
            }
            self.dispatch_ccmd(&ctx, &rest[..len])?;
            offset += align_up(len, align);
        }
        Ok(())
    }

    /// Decodes one CCMD and runs its handler. Handler failures are routed
    /// into the response resource as an error response before they
    /// propagate.
    pub fn dispatch_ccmd(&self, ctx: &Context, cmd: &[u8]) -> Result<()> {
        let hdr: vdrm_ccmd_req =
            read_obj(cmd).ok_or(Error::MalformedCommandBuffer("truncated ccmd header"))?;
        if hdr.cmd == 0 || hdr.cmd as usize > CCMD_DISPATCH.len() {
            error!("Unknown CCMD id {}", hdr.cmd);
            return Err(Error::InvalidCommand(hdr.cmd));
        }
        let info = &CCMD_DISPATCH[(hdr.cmd - 1) as usize];
        if hdr.len < info.min_len {
            error!(
                "CCMD {} too short: {} < {} bytes",
                info.name, hdr.len, info.min_len
            );
            return Err(Error::CommandTooShort(info.name, hdr.len, info.min_len));
        }
        trace!(
            "Dispatching CCMD {} (seqno={}, len={}, rsp_off={})",
            info.name,
            hdr.seqno,
            hdr.len,
            hdr.rsp_off
        );

        // Older guest, newer host: zero-fill the fields this revision
        // added. Oversized requests pass through untouched; handlers bound
        // their payload by hdr.len.
        let mut scratch = vec![0u8; (info.len as usize).max(cmd.len())];
        scratch[..cmd.len()].copy_from_slice(cmd);

        match (info.handler)(self, ctx, &scratch) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("CCMD {} failed: {e}", info.name);
                ctx.write_err_rsp(e.errno());
                Err(e)
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!(
            "Device destroyed: cookie={:#x}, contexts={}, resources={}, fences={}",
            self.cookie,
            self.contexts.size(),
            self.resources.size(),
            self.fences.size()
        );
    }
}

struct CcmdInfo {
    name: &'static str,
    /// Size of the request when the command was introduced; requests
    /// shorter than this are invalid.
    min_len: u32,
    /// Current size of the request struct; shorter legal requests are
    /// widened to it.
    len: u32,
    handler: fn(&Device, &Context, &[u8]) -> Result<()>,
}

const fn ccmd<T>(name: &'static str, handler: fn(&Device, &Context, &[u8]) -> Result<()>) -> CcmdInfo {
    CcmdInfo {
        name,
        min_len: size_of::<T>() as u32,
        len: size_of::<T>() as u32,
        handler,
    }
}

static CCMD_DISPATCH: [CcmdInfo; 11] = [
    ccmd::<amdxdna_ccmd_nop_req>("nop", ccmd_nop),
    ccmd::<amdxdna_ccmd_init_req>("init", ccmd_init),
    ccmd::<amdxdna_ccmd_create_bo_req>("create_bo", ccmd_create_bo),
    ccmd::<amdxdna_ccmd_destroy_bo_req>("destroy_bo", ccmd_destroy_bo),
    ccmd::<amdxdna_ccmd_create_ctx_req>("create_ctx", ccmd_create_ctx),
    ccmd::<amdxdna_ccmd_destroy_ctx_req>("destroy_ctx", ccmd_destroy_ctx),
    ccmd::<amdxdna_ccmd_config_ctx_req>("config_ctx", ccmd_config_ctx),
    // exec_cmd gained the trailing arg_count field after the first wire
    // revision.
    CcmdInfo {
        name: "exec_cmd",
        min_len: (size_of::<amdxdna_ccmd_exec_cmd_req>() - 4) as u32,
        len: size_of::<amdxdna_ccmd_exec_cmd_req>() as u32,
        handler: ccmd_exec_cmd,
    },
    ccmd::<amdxdna_ccmd_wait_cmd_req>("wait_cmd", ccmd_wait_cmd),
    ccmd::<amdxdna_ccmd_get_info_req>("get_info", ccmd_get_info),
    ccmd::<amdxdna_ccmd_read_sysfs_req>("read_sysfs", ccmd_read_sysfs),
];

fn parse<T: vm_memory::ByteValued + Default>(cmd: &[u8]) -> Result<T> {
    read_obj(cmd).ok_or(Error::MalformedCommandBuffer("request shorter than struct"))
}

fn ccmd_nop(_dev: &Device, _ctx: &Context, _cmd: &[u8]) -> Result<()> {
    Ok(())
}

fn ccmd_init(dev: &Device, ctx: &Context, cmd: &[u8]) -> Result<()> {
    let req: amdxdna_ccmd_init_req = parse(cmd)?;
    let res = dev.resource(req.rsp_res_id)?;
    ctx.bind_resp_res(res);
    ctx.write_ok_rsp(req.hdr.rsp_off)
}

fn ccmd_create_bo(dev: &Device, ctx: &Context, cmd: &[u8]) -> Result<()> {
    let req: amdxdna_ccmd_create_bo_req = parse(cmd)?;
    let res = if req.bo_type == AMDXDNA_BO_DEV {
        None
    } else {
        Some(dev.resource(req.res_id)?)
    };
    ctx.create_bo(res.as_deref(), &req)
}

fn ccmd_destroy_bo(_dev: &Device, ctx: &Context, cmd: &[u8]) -> Result<()> {
    let req: amdxdna_ccmd_destroy_bo_req = parse(cmd)?;
    ctx.remove_bo(req.handle, req.hdr.rsp_off)
}

fn ccmd_create_ctx(_dev: &Device, ctx: &Context, cmd: &[u8]) -> Result<()> {
    let req: amdxdna_ccmd_create_ctx_req = parse(cmd)?;
    ctx.create_hwctx(&req)
}

fn ccmd_destroy_ctx(_dev: &Device, ctx: &Context, cmd: &[u8]) -> Result<()> {
    let req: amdxdna_ccmd_destroy_ctx_req = parse(cmd)?;
    ctx.remove_hwctx(req.handle, req.hdr.rsp_off)
}

fn ccmd_config_ctx(_dev: &Device, ctx: &Context, cmd: &[u8]) -> Result<()> {
    let req: amdxdna_ccmd_config_ctx_req = parse(cmd)?;
    ctx.config_hwctx(&req, payload::<amdxdna_ccmd_config_ctx_req>(cmd, req.hdr.len))
}

fn ccmd_exec_cmd(_dev: &Device, ctx: &Context, cmd: &[u8]) -> Result<()> {
    let req: amdxdna_ccmd_exec_cmd_req = parse(cmd)?;
    ctx.exec_cmd(&req, payload::<amdxdna_ccmd_exec_cmd_req>(cmd, req.hdr.len))
}

fn ccmd_wait_cmd(_dev: &Device, ctx: &Context, cmd: &[u8]) -> Result<()> {
    let req: amdxdna_ccmd_wait_cmd_req = parse(cmd)?;
    ctx.wait_cmd(&req)
}

fn ccmd_get_info(dev: &Device, ctx: &Context, cmd: &[u8]) -> Result<()> {
    let req: amdxdna_ccmd_get_info_req = parse(cmd)?;
    let res = dev.resource(req.info_res_id)?;
    ctx.get_info(&res, &req)
}

fn ccmd_read_sysfs(_dev: &Device, ctx: &Context, cmd: &[u8]) -> Result<()> {
    let req: amdxdna_ccmd_read_sysfs_req = parse(cmd)?;
    ctx.read_sysfs(
        payload::<amdxdna_ccmd_read_sysfs_req>(cmd, req.hdr.len),
        req.hdr.rsp_off,
    )
}
