//! CUDA device context management.
//!
//! A [`DeviceContext`] owns one driver context bound to one device and keeps it
//! pushed on the constructing thread's context stack for its whole life.
//! Buffers and program modules borrow the context they were created under, so
//! they are always dropped before it.

use std::cell::Cell;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::driver::ffi::{
    CU_CTX_SCHED_AUTO, CU_CTX_SCHED_BLOCKING_SYNC, CU_CTX_SCHED_SPIN, CU_CTX_SCHED_YIELD,
};
use crate::driver::{CuContext, CuDevice, Driver};
use crate::error::CudaError;
use crate::status::Check;

/// How the host thread waits on the device while synchronizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextFlags {
    #[default]
    SchedAuto,
    SchedSpin,
    SchedYield,
    SchedBlockingSync,
}

impl ContextFlags {
    fn bits(self) -> u32 {
        match self {
            ContextFlags::SchedAuto => CU_CTX_SCHED_AUTO,
            ContextFlags::SchedSpin => CU_CTX_SCHED_SPIN,
            ContextFlags::SchedYield => CU_CTX_SCHED_YIELD,
            ContextFlags::SchedBlockingSync => CU_CTX_SCHED_BLOCKING_SYNC,
        }
    }
}

/// Number of devices the driver reports.
pub fn device_count(driver: &dyn Driver) -> Result<usize, CudaError> {
    let count = driver.device_get_count().check(driver, "cuDeviceGetCount")?;
    Ok(count.max(0) as usize)
}

/// An execution context on one device, current on the thread that built it.
///
/// Not `Send`: the binding lives on the driver's per-thread context stack.
pub struct DeviceContext {
    driver: Arc<dyn Driver>,
    ordinal: usize,
    device: CuDevice,
    ctx: CuContext,
    current: Cell<bool>,
}

impl DeviceContext {
    /// Create a context on device `ordinal` with the default scheduling policy
    /// and make it current on this thread.
    pub fn new(driver: Arc<dyn Driver>, ordinal: usize) -> Result<Self, CudaError> {
        Self::with_flags(driver, ordinal, ContextFlags::default())
    }

    pub fn with_flags(
        driver: Arc<dyn Driver>,
        ordinal: usize,
        flags: ContextFlags,
    ) -> Result<Self, CudaError> {
        let available = device_count(&*driver)?;
        if ordinal >= available {
            return Err(CudaError::DeviceUnavailable { requested: ordinal, available });
        }

        let device = driver.device_get(ordinal as i32).check(&*driver, "cuDeviceGet")?;
        let ctx = driver.ctx_create(flags.bits(), device).check(&*driver, "cuCtxCreate")?;
        if let Err(e) = driver.ctx_push_current(ctx).check(&*driver, "cuCtxPushCurrent") {
            // Nothing else owns the fresh context yet.
            if let Err(destroy) = driver.ctx_destroy(ctx).check(&*driver, "cuCtxDestroy") {
                warn!("leaked context on device {}: {}", ordinal, destroy);
            }
            return Err(e);
        }

        debug!("context {:p} created on device {} ({:?})", ctx, ordinal, flags);
        Ok(Self { driver, ordinal, device, ctx, current: Cell::new(true) })
    }

    /// Block until all work enqueued under this context has finished.
    pub fn synchronize(&self) -> Result<(), CudaError> {
        self.driver.ctx_synchronize().check(&*self.driver, "cuCtxSynchronize")
    }

    /// Push this context back onto the thread's stack after [`deactivate`](Self::deactivate).
    /// No-op when already current.
    pub fn activate(&self) -> Result<(), CudaError> {
        if self.current.get() {
            return Ok(());
        }
        self.driver.ctx_push_current(self.ctx).check(&*self.driver, "cuCtxPushCurrent")?;
        self.current.set(true);
        Ok(())
    }

    /// Pop this context off the thread's stack. Driver calls that need a
    /// current context fail until [`activate`](Self::activate) is called.
    pub fn deactivate(&self) -> Result<(), CudaError> {
        if !self.current.get() {
            return Ok(());
        }
        self.pop(self.ctx)?;
        self.current.set(false);
        Ok(())
    }

    /// Whether this wrapper's push is still on the thread's stack.
    pub fn is_current(&self) -> bool {
        self.current.get()
    }

    /// Device ordinal this context was created for.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn device(&self) -> CuDevice {
        self.device
    }

    pub fn device_name(&self) -> Result<String, CudaError> {
        self.driver.device_get_name(self.device).check(&*self.driver, "cuDeviceGetName")
    }

    pub fn as_raw(&self) -> CuContext {
        self.ctx
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        &*self.driver
    }

    /// Pop and destroy the context now, reporting the first failure.
    pub fn close(mut self) -> Result<(), CudaError> {
        self.release()
    }

    /// Pop `ctx` off the thread's stack. A different context on top is pushed
    /// back untouched and reported as [`CudaError::NotCurrent`].
    fn pop(&self, ctx: CuContext) -> Result<(), CudaError> {
        let driver = &*self.driver;
        let popped = driver.ctx_pop_current().check(driver, "cuCtxPopCurrent")?;
        if popped != ctx {
            driver.ctx_push_current(popped).check(driver, "cuCtxPushCurrent")?;
            return Err(CudaError::NotCurrent { expected: ctx as usize, found: popped as usize });
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), CudaError> {
        if self.ctx.is_null() {
            return Ok(());
        }
        let ctx = std::mem::replace(&mut self.ctx, std::ptr::null_mut());
        let driver = &*self.driver;

        let popped = if self.current.replace(false) { self.pop(ctx) } else { Ok(()) };
        let destroyed = driver.ctx_destroy(ctx).check(driver, "cuCtxDestroy");
        debug!("context {:p} on device {} destroyed", ctx, self.ordinal);
        popped.and(destroyed)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("releasing context on device {}: {}", self.ordinal, e);
        }
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("ordinal", &self.ordinal)
            .field("device", &self.device)
            .field("ctx", &self.ctx)
            .field("current", &self.current.get())
            .finish()
    }
}
