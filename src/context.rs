// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Per-guest execution contexts.
//!
//! A `Context` owns its own open of the device node (one `open` per
//! context, since a guest may hold many contexts on the same device), the
//! BO and hardware-context tables, and the response resource bound by the
//! `init` CCMD. All CCMD handler bodies live here; the dispatcher in
//! `device.rs` parses the request structs and routes them.

use std::{
    mem::size_of,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::{Arc, Mutex},
};

use log::{debug, error, warn};
use vm_memory::ByteValued;

use crate::{
    bo::Bo,
    drm::{
        amdxdna_drm_get_array, amdxdna_drm_get_info, drm_ioctl, prime_handle_to_fd,
        DRM_IOCTL_AMDXDNA_GET_ARRAY, DRM_IOCTL_AMDXDNA_GET_INFO, AMDXDNA_BO_DEV,
    },
    error::{Error, Result},
    hwctx::HwCtx,
    protocol::{
        amdxdna_ccmd_config_ctx_req, amdxdna_ccmd_create_bo_req, amdxdna_ccmd_create_bo_rsp,
        amdxdna_ccmd_create_ctx_req, amdxdna_ccmd_create_ctx_rsp, amdxdna_ccmd_exec_cmd_req,
        amdxdna_ccmd_exec_cmd_rsp, amdxdna_ccmd_get_info_req, amdxdna_ccmd_get_info_rsp,
        amdxdna_ccmd_read_sysfs_rsp, amdxdna_ccmd_rsp, amdxdna_ccmd_wait_cmd_req,
    },
    resource::Resource,
    table::HandleTable,
    RendererCallbacks,
};

pub struct Context {
    ctx_id: u32,
    ccmd_align: u32,
    cookie: u64,
    callbacks: Arc<dyn RendererCallbacks>,
    resp_res: Mutex<Option<Arc<Resource>>>,
    bos: HandleTable<u32, Bo>,
    hwctxs: HandleTable<u32, HwCtx>,
    // Declared last: the hwctx workers and BOs above use the raw fd and
    // must be torn down before it closes.
    fd: OwnedFd,
}

impl Context {
    pub fn new(
        ctx_id: u32,
        fd: OwnedFd,
        ccmd_align: u32,
        cookie: u64,
        callbacks: Arc<dyn RendererCallbacks>,
    ) -> Self {
        debug!("Context created: ctx_id={}, fd={}", ctx_id, fd.as_raw_fd());
        Self {
            ctx_id,
            ccmd_align,
            cookie,
            callbacks,
            resp_res: Mutex::new(None),
            bos: HandleTable::new(),
            hwctxs: HandleTable::new(),
            fd,
        }
    }

    pub fn ctx_id(&self) -> u32 {
        self.ctx_id
    }

    pub fn ccmd_align(&self) -> u32 {
        self.ccmd_align
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn bind_resp_res(&self, res: Arc<Resource>) {
        *self.resp_res.lock().unwrap() = Some(res);
    }

    fn resp_res(&self) -> Result<Arc<Resource>> {
        self.resp_res
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::ResponseNotBound)
    }

    /// Writes a response struct at `rsp_off` inside the bound response
    /// resource.
    pub fn write_rsp(&self, rsp: &[u8], rsp_off: u32) -> Result<()> {
        self.resp_res()?.write(u64::from(rsp_off), rsp)?;
        Ok(())
    }

    pub(crate) fn write_ok_rsp(&self, rsp_off: u32) -> Result<()> {
        let rsp = amdxdna_ccmd_rsp {
            ret: 0,
            len: size_of::<amdxdna_ccmd_rsp>() as u32,
        };
        self.write_rsp(rsp.as_slice(), rsp_off)
    }

    /// Best-effort error response at offset zero, so the guest always
    /// observes a completion for a failed CCMD.
    pub fn write_err_rsp(&self, errno: i32) {
        let rsp = amdxdna_ccmd_rsp {
            ret: errno,
            len: size_of::<amdxdna_ccmd_rsp>() as u32,
        };
        match self.resp_res() {
            Ok(res) => {
                if let Err(e) = res.write(0, rsp.as_slice()) {
                    error!("Failed to write error response: ctx_id={}: {e}", self.ctx_id);
                }
            }
            Err(_) => warn!(
                "Dropping error response, no resource bound: ctx_id={}, err={errno}",
                self.ctx_id
            ),
        }
    }

    pub fn create_bo(
        &self,
        res: Option<&Resource>,
        req: &amdxdna_ccmd_create_bo_req,
    ) -> Result<()> {
        let bo = match res {
            None => Bo::new(self.fd(), req)?,
            Some(res) => Bo::from_resource(res, self.fd(), req)?,
        };
        debug_assert!(req.bo_type == AMDXDNA_BO_DEV || res.is_some());

        let rsp = amdxdna_ccmd_create_bo_rsp {
            hdr: amdxdna_ccmd_rsp {
                ret: 0,
                len: size_of::<amdxdna_ccmd_create_bo_rsp>() as u32,
            },
            handle: bo.handle(),
            pad: 0,
            xdna_addr: bo.addr(),
        };
        self.write_rsp(rsp.as_slice(), req.hdr.rsp_off)?;

        let handle = bo.handle();
        if !self.bos.insert(handle, Arc::new(bo)) {
            return Err(Error::BoExists(handle));
        }
        Ok(())
    }

    pub fn remove_bo(&self, handle: u32, rsp_off: u32) -> Result<()> {
        if !self.bos.erase(&handle) {
            return Err(Error::BoNotFound(handle));
        }
        self.write_ok_rsp(rsp_off)
    }

    pub fn bo(&self, handle: u32) -> Result<Arc<Bo>> {
        self.bos.lookup(&handle).ok_or(Error::BoNotFound(handle))
    }

    /// Exports a BO as a dma-buf fd, for blob-backed resources.
    pub fn export_blob(&self, bo_handle: u32) -> Result<OwnedFd> {
        let bo = self.bo(bo_handle)?;
        prime_handle_to_fd(self.fd(), bo.handle())
    }

    pub fn create_hwctx(&self, req: &amdxdna_ccmd_create_ctx_req) -> Result<()> {
        let hwctx = HwCtx::new(
            self.fd(),
            self.ctx_id,
            self.cookie,
            self.callbacks.clone(),
            req,
        )?;
        let handle = hwctx.handle();

        let rsp = amdxdna_ccmd_create_ctx_rsp {
            hdr: amdxdna_ccmd_rsp {
                ret: 0,
                len: size_of::<amdxdna_ccmd_create_ctx_rsp>() as u32,
            },
            handle,
            pad: 0,
        };
        self.write_rsp(rsp.as_slice(), req.hdr.rsp_off)?;

        if !self.hwctxs.insert(handle, Arc::new(hwctx)) {
            return Err(Error::HwctxExists(handle));
        }
        Ok(())
    }

    pub fn remove_hwctx(&self, handle: u32, rsp_off: u32) -> Result<()> {
        if !self.hwctxs.erase(&handle) {
            return Err(Error::HwctxNotFound(handle));
        }
        self.write_ok_rsp(rsp_off)
    }

    pub fn hwctx(&self, ring_idx: u32) -> Result<Arc<HwCtx>> {
        self.hwctxs
            .lookup(&ring_idx)
            .ok_or(Error::HwctxNotFound(ring_idx))
    }

    pub fn config_hwctx(
        &self,
        req: &amdxdna_ccmd_config_ctx_req,
        param_val: &[u8],
    ) -> Result<()> {
        self.hwctx(req.handle)?.config(req, param_val)?;
        self.write_ok_rsp(req.hdr.rsp_off)
    }

    pub fn exec_cmd(&self, req: &amdxdna_ccmd_exec_cmd_req, payload: &[u8]) -> Result<()> {
        let mut cmds_n_args = Vec::with_capacity(payload.len() / 8);
        for chunk in payload.chunks_exact(8) {
            cmds_n_args.push(u64::from_ne_bytes(chunk.try_into().unwrap()));
        }

        let seq = self.hwctx(req.hwctx)?.exec_cmd(req, &cmds_n_args)?;

        let rsp = amdxdna_ccmd_exec_cmd_rsp {
            hdr: amdxdna_ccmd_rsp {
                ret: 0,
                len: size_of::<amdxdna_ccmd_exec_cmd_rsp>() as u32,
            },
            seq,
        };
        self.write_rsp(rsp.as_slice(), req.hdr.rsp_off)
    }

    /// Latches the sync point; never blocks. The next `submit_fence`
    /// queues the actual wait.
    pub fn wait_cmd(&self, req: &amdxdna_ccmd_wait_cmd_req) -> Result<()> {
        self.hwctx(req.hwctx)?
            .set_sync_point(req.seq, req.timeout_nsec);
        self.write_ok_rsp(req.hdr.rsp_off)
    }

    pub fn get_info(&self, info_res: &Resource, req: &amdxdna_ccmd_get_info_req) -> Result<()> {
        // Sizes travel as u32 on the wire, so the product must fit one.
        let total = if req.num_element == 0 {
            req.size
        } else {
            req.size
                .checked_mul(req.num_element)
                .ok_or(Error::InfoSizeOverflow(req.size, req.num_element))?
        };

        let mut scratch = vec![0u8; total as usize];
        info_res.read(0, &mut scratch)?;

        let rsp = if req.num_element == 0 {
            let mut gi = amdxdna_drm_get_info {
                param: req.param,
                buffer_size: total as u32,
                buffer: scratch.as_mut_ptr() as u64,
            };
            drm_ioctl(self.fd(), DRM_IOCTL_AMDXDNA_GET_INFO, &mut gi, "GET_INFO")?;
            amdxdna_ccmd_get_info_rsp {
                hdr: amdxdna_ccmd_rsp {
                    ret: 0,
                    len: size_of::<amdxdna_ccmd_get_info_rsp>() as u32,
                },
                size: gi.buffer_size,
                num_element: 0,
                element_size: 0,
                pad: 0,
            }
        } else {
            let mut ga = amdxdna_drm_get_array {
                param: req.param,
                element_size: req.size,
                num_element: req.num_element,
                pad: 0,
                buffer: scratch.as_mut_ptr() as u64,
            };
            drm_ioctl(self.fd(), DRM_IOCTL_AMDXDNA_GET_ARRAY, &mut ga, "GET_ARRAY")?;
            let size = ga
                .element_size
                .checked_mul(ga.num_element)
                .ok_or(Error::InfoSizeOverflow(ga.element_size, ga.num_element))?;
            amdxdna_ccmd_get_info_rsp {
                hdr: amdxdna_ccmd_rsp {
                    ret: 0,
                    len: size_of::<amdxdna_ccmd_get_info_rsp>() as u32,
                },
                size,
                num_element: ga.num_element,
                element_size: ga.element_size,
                pad: 0,
            }
        };

        // The kernel-filled buffer replaces the argument block at the
        // start of the info resource.
        info_res.write(0, &scratch)?;
        self.write_rsp(rsp.as_slice(), req.hdr.rsp_off)
    }

    pub fn read_sysfs(&self, node_name: &[u8], rsp_off: u32) -> Result<()> {
        let name_end = node_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(node_name.len());
        let name = std::str::from_utf8(&node_name[..name_end])
            .map_err(|_| Error::MalformedCommandBuffer("read_sysfs node name"))?;
        if name.is_empty() {
            return Err(Error::MalformedCommandBuffer("read_sysfs empty node name"));
        }

        let path = self.sysfs_node_path(name)?;
        let data = std::fs::read(&path).map_err(|e| Error::SysfsRead(path.clone(), e))?;

        let rsp = amdxdna_ccmd_read_sysfs_rsp {
            hdr: amdxdna_ccmd_rsp {
                ret: 0,
                len: (size_of::<amdxdna_ccmd_read_sysfs_rsp>() + data.len()) as u32,
            },
            val_len: data.len() as u32,
            pad: 0,
        };
        self.write_rsp(rsp.as_slice(), rsp_off)?;
        self.resp_res()?.write(
            u64::from(rsp_off) + size_of::<amdxdna_ccmd_read_sysfs_rsp>() as u64,
            &data,
        )?;
        Ok(())
    }

    /// Derives `/sys/dev/char/<maj>:<min>/device/<node>` from the
    /// context's device node.
    fn sysfs_node_path(&self, node_name: &str) -> Result<String> {
        // SAFETY: `st` is a plain output struct fully written by a
        // successful fstat.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: `fd` is owned by this context and `st` outlives the
        // call.
        if unsafe { libc::fstat(self.fd(), &mut st) } < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let (maj, min) = (libc::major(st.st_rdev), libc::minor(st.st_rdev));
        Ok(format!("/sys/dev/char/{maj}:{min}/device/{node_name}"))
    }

    /// Installs a worker-only hwctx over fabricated kernel handles, so
    /// dispatch paths can be exercised without an XDNA device.
    #[cfg(test)]
    pub(crate) fn add_test_hwctx(&self, ring_idx: u32) {
        let hwctx = HwCtx::spawn(
            ring_idx,
            1,
            -1,
            self.ctx_id,
            self.cookie,
            self.callbacks.clone(),
        );
        self.hwctxs.insert(ring_idx, Arc::new(hwctx));
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug!(
            "Context destroying: ctx_id={}, fd={}, bos={}, hwctxs={}",
            self.ctx_id,
            self.fd(),
            self.bos.size(),
            self.hwctxs.size()
        );
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        protocol::{read_obj, vdrm_ccmd_req},
        testutils::{GuestPages, TestCallbacks},
    };

    fn test_ctx() -> Context {
        let callbacks = Arc::new(TestCallbacks::default());
        let fd = callbacks.get_device_fd(0xD1).unwrap();
        Context::new(7, fd, 8, 0xD1, callbacks)
    }

    fn bound_ctx(pages: &mut GuestPages) -> Context {
        let ctx = test_ctx();
        ctx.bind_resp_res(Arc::new(Resource::new(1, 256, 0, 7, pages.iovs())));
        ctx
    }

    #[test]
    fn test_rsp_requires_bound_resource() {
        let ctx = test_ctx();
        assert_matches!(ctx.write_ok_rsp(0), Err(Error::ResponseNotBound));
        assert_eq!(Error::ResponseNotBound.errno(), -libc::EINVAL);
        // Best-effort error path must not panic without a resource.
        ctx.write_err_rsp(-libc::EIO);
    }

    #[test]
    fn test_write_rsp_lands_at_offset() {
        let mut pages = GuestPages::new(&[256]);
        let ctx = bound_ctx(&mut pages);

        ctx.write_ok_rsp(64).unwrap();
        let rsp: amdxdna_ccmd_rsp = read_obj(&pages.bytes(0)[64..]).unwrap();
        assert_eq!(rsp.ret, 0);
        assert_eq!(rsp.len, 8);
    }

    #[test]
    fn test_err_rsp_lands_at_offset_zero() {
        let mut pages = GuestPages::new(&[256]);
        let ctx = bound_ctx(&mut pages);

        ctx.write_err_rsp(-libc::ENOENT);
        let rsp: amdxdna_ccmd_rsp = read_obj(pages.bytes(0)).unwrap();
        assert_eq!(rsp.ret, -libc::ENOENT);
    }

    #[test]
    fn test_remove_missing_bo_and_hwctx() {
        let mut pages = GuestPages::new(&[64]);
        let ctx = bound_ctx(&mut pages);
        assert_matches!(ctx.remove_bo(5, 0), Err(Error::BoNotFound(5)));
        assert_matches!(ctx.remove_hwctx(5, 0), Err(Error::HwctxNotFound(5)));
    }

    #[test]
    fn test_wait_cmd_latches_without_blocking() {
        use std::time::Instant;

        let mut pages = GuestPages::new(&[64]);
        let ctx = bound_ctx(&mut pages);
        ctx.add_test_hwctx(0);

        let req = amdxdna_ccmd_wait_cmd_req {
            hdr: vdrm_ccmd_req {
                cmd: crate::protocol::AMDXDNA_CCMD_WAIT_CMD,
                len: 40,
                seqno: 1,
                rsp_off: 16,
            },
            hwctx: 0,
            pad: 0,
            seq: 42,
            timeout_nsec: i64::MAX,
        };
        let start = Instant::now();
        ctx.wait_cmd(&req).unwrap();
        // An unbounded timeout must not block the dispatch thread.
        assert!(start.elapsed().as_millis() < 100);

        let rsp: amdxdna_ccmd_rsp = read_obj(&pages.bytes(0)[16..]).unwrap();
        assert_eq!(rsp.ret, 0);
    }

    #[test]
    fn test_wait_cmd_unknown_ring() {
        let mut pages = GuestPages::new(&[64]);
        let ctx = bound_ctx(&mut pages);
        let req = amdxdna_ccmd_wait_cmd_req {
            hwctx: 9,
            ..Default::default()
        };
        assert_matches!(ctx.wait_cmd(&req), Err(Error::HwctxNotFound(9)));
    }

    #[test]
    fn test_get_info_overflow_rejected() {
        let mut pages = GuestPages::new(&[64]);
        let ctx = bound_ctx(&mut pages);
        let mut info_pages = GuestPages::new(&[64]);
        let res = Resource::new(2, 64, 0, 7, info_pages.iovs());
        let req = amdxdna_ccmd_get_info_req {
            param: 1,
            size: u32::MAX,
            num_element: 2,
            info_res_id: 2,
            ..Default::default()
        };
        let err = ctx.get_info(&res, &req).unwrap_err();
        assert_matches!(err, Error::InfoSizeOverflow(..));
        assert_eq!(err.errno(), -libc::EINVAL);
    }

    #[test]
    fn test_read_sysfs_rejects_bad_names() {
        let mut pages = GuestPages::new(&[64]);
        let ctx = bound_ctx(&mut pages);
        assert_matches!(
            ctx.read_sysfs(b"\0", 0),
            Err(Error::MalformedCommandBuffer(_))
        );
        assert_matches!(
            ctx.read_sysfs(&[0xff, 0xfe, 0], 0),
            Err(Error::MalformedCommandBuffer(_))
        );
    }

    #[test]
    fn test_read_sysfs_missing_node() {
        let mut pages = GuestPages::new(&[64]);
        let ctx = bound_ctx(&mut pages);
        // /dev/null has no XDNA sysfs device directory.
        let err = ctx.read_sysfs(b"vbnv\0", 0).unwrap_err();
        assert_matches!(err, Error::SysfsRead(..));
    }

    #[test]
    fn test_sysfs_path_format() {
        let ctx = test_ctx();
        let path = ctx.sysfs_node_path("vbnv").unwrap();
        // /dev/null is char 1:3.
        assert_eq!(path, "/sys/dev/char/1:3/device/vbnv");
    }
}
