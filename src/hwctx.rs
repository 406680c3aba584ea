// Copyright 2025 Advanced Micro Devices, Inc.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Hardware contexts and fence retirement.
//!
//! Each hardware context owns a kernel hwctx, its timeline syncobj and one
//! background worker that waits for queued sync points and reports each
//! fence back to the VMM. The worker deliberately captures only plain
//! values (cookie, ids, fd, syncobj handle), never the `Context`, so no
//! reference cycle can form between the thread and the object graph.
//!
//! Fence flow: `wait_cmd` latches a `(sync_point, timeout)` pair; the next
//! `submit_fence` consumes the latch and queues a `Fence` for the worker.
//! A `submit_fence` arriving with nothing latched retires synchronously on
//! the caller's thread.

use std::{
    os::fd::RawFd,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

use log::{debug, warn};

use crate::{
    drm::{
        amdxdna_drm_config_hwctx, amdxdna_drm_create_hwctx, amdxdna_drm_destroy_hwctx,
        amdxdna_drm_exec_cmd, amdxdna_qos_info, drm_ioctl, syncobj_destroy, syncobj_timeline_wait,
        DRM_IOCTL_AMDXDNA_CONFIG_HWCTX, DRM_IOCTL_AMDXDNA_CREATE_HWCTX,
        DRM_IOCTL_AMDXDNA_DESTROY_HWCTX, DRM_IOCTL_AMDXDNA_EXEC_CMD,
    },
    error::{Error, Result},
    protocol::{
        amdxdna_ccmd_config_ctx_req, amdxdna_ccmd_create_ctx_req, amdxdna_ccmd_exec_cmd_req,
    },
    RendererCallbacks,
};

/// Immutable record handed from submission to the retirement worker.
#[derive(Debug)]
pub struct Fence {
    pub id: u64,
    pub sync_point: u64,
    pub syncobj_handle: u32,
    pub ring_idx: u32,
    pub timeout_nsec: i64,
}

#[derive(Default)]
struct FenceQueue {
    pending: Vec<Fence>,
    sync_point: u64,
    timeout_nsec: i64,
    has_sync_point: bool,
    stop: bool,
}

pub struct HwCtx {
    hwctx_handle: u32,
    syncobj_handle: u32,
    ctx_fd: RawFd,
    ctx_id: u32,
    cookie: u64,
    callbacks: Arc<dyn RendererCallbacks>,
    queue: Arc<(Mutex<FenceQueue>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl HwCtx {
    pub fn new(
        ctx_fd: RawFd,
        ctx_id: u32,
        cookie: u64,
        callbacks: Arc<dyn RendererCallbacks>,
        req: &amdxdna_ccmd_create_ctx_req,
    ) -> Result<HwCtx> {
        if !callbacks.supports_context_fence() {
            return Err(Error::CallbackMissing("write_context_fence"));
        }

        let qos = amdxdna_qos_info {
            gops: req.qos.gops,
            fps: req.qos.fps,
            dma_bandwidth: req.qos.dma_bandwidth,
            latency: req.qos.latency,
            frame_exec_time: req.qos.frame_exec_time,
            priority: req.qos.priority,
        };
        let mut create = amdxdna_drm_create_hwctx {
            qos_p: &qos as *const amdxdna_qos_info as u64,
            umq_bo: req.umq_bo,
            log_buf_bo: req.log_buf_bo,
            max_opc: req.max_opc,
            num_tiles: req.num_tiles,
            mem_size: req.mem_size,
            ..Default::default()
        };
        drm_ioctl(ctx_fd, DRM_IOCTL_AMDXDNA_CREATE_HWCTX, &mut create, "CREATE_HWCTX")?;

        debug!(
            "hwctx created: ctx_id={}, handle={}, syncobj={}",
            ctx_id, create.handle, create.syncobj_handle
        );

        Ok(Self::spawn(
            create.handle,
            create.syncobj_handle,
            ctx_fd,
            ctx_id,
            cookie,
            callbacks,
        ))
    }

    /// Wraps already-created kernel handles and starts the retirement
    /// worker.
    pub(crate) fn spawn(
        hwctx_handle: u32,
        syncobj_handle: u32,
        ctx_fd: RawFd,
        ctx_id: u32,
        cookie: u64,
        callbacks: Arc<dyn RendererCallbacks>,
    ) -> HwCtx {
        let queue = Arc::new((Mutex::new(FenceQueue::default()), Condvar::new()));
        let worker = {
            let queue = queue.clone();
            let callbacks = callbacks.clone();
            thread::spawn(move || retire_loop(&queue, ctx_fd, cookie, ctx_id, hwctx_handle, &callbacks))
        };

        HwCtx {
            hwctx_handle,
            syncobj_handle,
            ctx_fd,
            ctx_id,
            cookie,
            callbacks,
            queue,
            worker: Some(worker),
        }
    }

    /// Hardware context handle; also the fence ring index.
    pub fn handle(&self) -> u32 {
        self.hwctx_handle
    }

    /// Latches the sync point the next submitted fence will wait on.
    pub fn set_sync_point(&self, sync_point: u64, timeout_nsec: i64) {
        let (lock, _) = &*self.queue;
        let mut q = lock.lock().unwrap();
        q.sync_point = sync_point;
        q.timeout_nsec = timeout_nsec;
        q.has_sync_point = true;
    }

    /// Queues the fence on the retirement worker, or retires it on the
    /// spot when no sync point is latched.
    pub fn submit_fence(&self, fence_id: u64) {
        let (lock, cv) = &*self.queue;
        let mut q = lock.lock().unwrap();
        if !q.has_sync_point {
            drop(q);
            debug!(
                "No sync point latched, retiring fence synchronously: fence_id={fence_id}"
            );
            self.callbacks
                .write_context_fence(self.cookie, self.ctx_id, self.hwctx_handle, fence_id);
            return;
        }
        let sync_point = q.sync_point;
        let timeout_nsec = q.timeout_nsec;
        q.pending.push(Fence {
            id: fence_id,
            sync_point,
            syncobj_handle: self.syncobj_handle,
            ring_idx: self.hwctx_handle,
            timeout_nsec,
        });
        q.has_sync_point = false;
        cv.notify_one();
    }

    pub fn syncobj_handle(&self) -> u32 {
        self.syncobj_handle
    }

    /// Submits command BOs for execution; returns the kernel sequence
    /// number.
    pub fn exec_cmd(&self, req: &amdxdna_ccmd_exec_cmd_req, cmds_n_args: &[u64]) -> Result<u64> {
        let cmd_count = req.cmd_count as usize;
        let arg_offset = req.arg_offset as usize;
        let arg_count = req.arg_count as usize;

        if cmd_count > cmds_n_args.len() {
            return Err(Error::MalformedCommandBuffer("exec_cmd command handles"));
        }
        if arg_count > 0
            && arg_offset
                .checked_add(arg_count)
                .map_or(true, |end| end > cmds_n_args.len())
        {
            return Err(Error::MalformedCommandBuffer("exec_cmd arguments"));
        }

        let cmd_handles = if cmd_count == 1 {
            cmds_n_args[0]
        } else {
            cmds_n_args.as_ptr() as u64
        };
        let args = if arg_count > 0 {
            cmds_n_args[arg_offset..].as_ptr() as u64
        } else {
            0
        };

        let mut exec = amdxdna_drm_exec_cmd {
            hwctx: self.hwctx_handle,
            type_: req.cmd_type,
            cmd_handles,
            args,
            cmd_count: req.cmd_count,
            arg_count: req.arg_count,
            ..Default::default()
        };
        drm_ioctl(self.ctx_fd, DRM_IOCTL_AMDXDNA_EXEC_CMD, &mut exec, "EXEC_CMD")?;
        Ok(exec.seq)
    }

    pub fn config(&self, req: &amdxdna_ccmd_config_ctx_req, param_val: &[u8]) -> Result<()> {
        let val = if req.param_val_size > 0 {
            if param_val.len() < req.param_val_size as usize {
                return Err(Error::MalformedCommandBuffer("config_ctx param value"));
            }
            param_val.as_ptr() as u64
        } else {
            req.inline_param
        };
        let mut cfg = amdxdna_drm_config_hwctx {
            handle: self.hwctx_handle,
            param_type: req.param_type,
            param_val: val,
            param_val_size: req.param_val_size,
            pad: 0,
        };
        drm_ioctl(self.ctx_fd, DRM_IOCTL_AMDXDNA_CONFIG_HWCTX, &mut cfg, "CONFIG_HWCTX")
    }
}

impl Drop for HwCtx {
    fn drop(&mut self) {
        {
            let (lock, cv) = &*self.queue;
            let mut q = lock.lock().unwrap();
            q.stop = true;
            cv.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("hwctx {} retirement worker panicked", self.hwctx_handle);
            }
        }

        // Fences the worker never picked up still get their callback; the
        // guest must not be left with an unretired fence.
        let leftovers = {
            let (lock, _) = &*self.queue;
            std::mem::take(&mut lock.lock().unwrap().pending)
        };
        for fence in leftovers {
            warn!(
                "Retiring fence without wait at hwctx teardown: fence_id={}",
                fence.id
            );
            self.callbacks
                .write_context_fence(self.cookie, self.ctx_id, self.hwctx_handle, fence.id);
        }

        if let Err(e) = syncobj_destroy(self.ctx_fd, self.syncobj_handle) {
            warn!("Failed to destroy syncobj {}: {e}", self.syncobj_handle);
        }
        let mut destroy = amdxdna_drm_destroy_hwctx {
            handle: self.hwctx_handle,
            pad: 0,
        };
        if let Err(e) = drm_ioctl(
            self.ctx_fd,
            DRM_IOCTL_AMDXDNA_DESTROY_HWCTX,
            &mut destroy,
            "DESTROY_HWCTX",
        ) {
            warn!("Failed to destroy hwctx {}: {e}", self.hwctx_handle);
        }
        debug!("hwctx destroyed: handle={}", self.hwctx_handle);
    }
}

fn retire_loop(
    queue: &(Mutex<FenceQueue>, Condvar),
    ctx_fd: RawFd,
    cookie: u64,
    ctx_id: u32,
    ring_idx: u32,
    callbacks: &Arc<dyn RendererCallbacks>,
) {
    let (lock, cv) = queue;
    loop {
        let pending = {
            let mut q = lock.lock().unwrap();
            while !q.stop && q.pending.is_empty() {
                q = cv.wait(q).unwrap();
            }
            if q.stop {
                break;
            }
            std::mem::take(&mut q.pending)
        };

        for fence in pending {
            if let Err(e) = syncobj_timeline_wait(
                ctx_fd,
                fence.syncobj_handle,
                fence.sync_point,
                fence.timeout_nsec,
            ) {
                // Retire regardless so the guest waiter wakes up.
                warn!(
                    "Fence wait failed: fence_id={}, sync_point={}: {e}",
                    fence.id, fence.sync_point
                );
            }
            callbacks.write_context_fence(cookie, ctx_id, ring_idx, fence.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::testutils::TestCallbacks;

    const COOKIE: u64 = 0xD1;
    const CTX_ID: u32 = 3;
    const RING: u32 = 0;

    fn test_hwctx(callbacks: &Arc<TestCallbacks>) -> HwCtx {
        // A closed-fd hwctx: every wait ioctl fails immediately, which the
        // retirement contract must tolerate.
        HwCtx::spawn(RING, 1, -1, CTX_ID, COOKIE, callbacks.clone())
    }

    fn wait_for_fences(callbacks: &TestCallbacks, count: usize) -> Vec<(u64, u32, u32, u64)> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let fences = callbacks.fences();
            if fences.len() >= count {
                return fences;
            }
            assert!(Instant::now() < deadline, "timed out waiting for fences");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_submit_without_sync_point_is_synchronous() {
        let callbacks = Arc::new(TestCallbacks::default());
        let hwctx = test_hwctx(&callbacks);

        hwctx.submit_fence(7);
        // No worker involved: the record is visible before we ever sleep.
        assert_eq!(callbacks.fences(), vec![(COOKIE, CTX_ID, RING, 7)]);
        drop(hwctx);
        assert_eq!(callbacks.fences().len(), 1);
    }

    #[test]
    fn test_latched_fence_retires_on_worker() {
        let callbacks = Arc::new(TestCallbacks::default());
        let hwctx = test_hwctx(&callbacks);

        hwctx.set_sync_point(42, 1_000_000);
        hwctx.submit_fence(7);
        let fences = wait_for_fences(&callbacks, 1);
        assert_eq!(fences, vec![(COOKIE, CTX_ID, RING, 7)]);

        // The latch was consumed: the next fence retires synchronously.
        hwctx.submit_fence(8);
        assert_eq!(callbacks.fences().len(), 2);
        assert_eq!(callbacks.fences()[1], (COOKIE, CTX_ID, RING, 8));
    }

    #[test]
    fn test_fences_retire_in_submission_order() {
        let callbacks = Arc::new(TestCallbacks::default());
        let hwctx = test_hwctx(&callbacks);

        for id in 1..=4u64 {
            hwctx.set_sync_point(id * 10, 1_000);
            hwctx.submit_fence(id);
        }
        let fences = wait_for_fences(&callbacks, 4);
        let ids: Vec<u64> = fences.iter().map(|f| f.3).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_callback_fires_exactly_once_per_fence() {
        let callbacks = Arc::new(TestCallbacks::default());
        let hwctx = test_hwctx(&callbacks);

        hwctx.set_sync_point(1, 1_000);
        hwctx.submit_fence(11);
        hwctx.set_sync_point(2, 1_000);
        hwctx.submit_fence(12);
        drop(hwctx);

        // Teardown joined the worker; whatever path each fence took, both
        // retired exactly once.
        let mut ids: Vec<u64> = callbacks.fences().iter().map(|f| f.3).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![11, 12]);
    }

    /// Callback that blocks the worker until released, to force fences to
    /// stay pending across a drop.
    #[derive(Default)]
    struct BlockingCallbacks {
        inner: TestCallbacks,
        gate: Mutex<()>,
    }

    impl RendererCallbacks for BlockingCallbacks {
        fn get_device_fd(&self, cookie: u64) -> std::io::Result<std::os::fd::OwnedFd> {
            self.inner.get_device_fd(cookie)
        }

        fn write_context_fence(&self, cookie: u64, ctx_id: u32, ring_idx: u32, fence_id: u64) {
            let _hold = self.gate.lock().unwrap();
            self.inner.write_context_fence(cookie, ctx_id, ring_idx, fence_id);
        }
    }

    #[test]
    fn test_drop_retires_pending_fences() {
        let callbacks = Arc::new(BlockingCallbacks::default());
        let hwctx = HwCtx::spawn(RING, 1, -1, CTX_ID, COOKIE, callbacks.clone());

        let gate = callbacks.gate.lock().unwrap();
        hwctx.set_sync_point(1, 1_000);
        hwctx.submit_fence(21);
        // Let the worker take fence 21 and block inside the callback, then
        // queue a fence it may never pick up.
        std::thread::sleep(Duration::from_millis(20));
        hwctx.set_sync_point(2, 1_000);
        hwctx.submit_fence(22);

        let dropper = std::thread::spawn(move || drop(hwctx));
        std::thread::sleep(Duration::from_millis(20));
        drop(gate);
        dropper.join().unwrap();

        let mut ids: Vec<u64> = callbacks.inner.fences().iter().map(|f| f.3).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![21, 22]);
    }
}
