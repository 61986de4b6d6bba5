//! The driver boundary.
//!
//! [`Driver`] is the fixed contract every wrapper talks to. [`load`] opens the
//! system CUDA driver (once per process); [`crate::mock::MockDriver`] is an
//! in-process stand-in with the same contract.

pub mod ffi;

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::sync::{Arc, OnceLock};

use tracing::debug;

pub use ffi::{CuContext, CuDevice, CuDevicePtr, CuFunction, CuModule, CuResult, CUDA_SUCCESS};

use crate::error::CudaError;
use crate::status::Check;
use ffi::CudaApi;

/// Raw driver operations. Every method returns the driver's status code on
/// failure; callers translate it with [`crate::status`] immediately.
///
/// Contexts follow push/pop semantics on a per-thread stack owned by the
/// driver. `ctx_create` returns a context that is *not* yet current; the
/// caller pushes it explicitly.
pub trait Driver: Send + Sync {
    fn init(&self, flags: u32) -> Result<(), CuResult>;

    fn device_get_count(&self) -> Result<i32, CuResult>;
    fn device_get(&self, ordinal: i32) -> Result<CuDevice, CuResult>;
    fn device_get_name(&self, device: CuDevice) -> Result<String, CuResult>;

    fn ctx_create(&self, flags: u32, device: CuDevice) -> Result<CuContext, CuResult>;
    fn ctx_push_current(&self, ctx: CuContext) -> Result<(), CuResult>;
    fn ctx_pop_current(&self) -> Result<CuContext, CuResult>;
    fn ctx_destroy(&self, ctx: CuContext) -> Result<(), CuResult>;
    fn ctx_synchronize(&self) -> Result<(), CuResult>;

    fn mem_alloc(&self, bytes: usize) -> Result<CuDevicePtr, CuResult>;
    fn mem_free(&self, ptr: CuDevicePtr) -> Result<(), CuResult>;
    fn memcpy_htod(&self, dst: CuDevicePtr, src: &[u8]) -> Result<(), CuResult>;
    fn memcpy_dtoh(&self, dst: &mut [u8], src: CuDevicePtr) -> Result<(), CuResult>;

    fn module_load(&self, path: &CStr) -> Result<CuModule, CuResult>;
    /// `image` must be NUL-terminated when it holds PTX text.
    fn module_load_data(&self, image: &[u8]) -> Result<CuModule, CuResult>;
    fn module_get_function(&self, module: CuModule, name: &CStr) -> Result<CuFunction, CuResult>;
    fn module_unload(&self, module: CuModule) -> Result<(), CuResult>;

    /// Enqueue `func` on the default stream with no dynamic shared memory.
    ///
    /// # Safety
    /// Every entry of `params` must point at a live value whose type matches
    /// the corresponding kernel parameter.
    unsafe fn launch_kernel(
        &self,
        func: CuFunction,
        grid_dim: [u32; 3],
        block_dim: [u32; 3],
        params: &mut [*mut c_void],
    ) -> Result<(), CuResult>;

    fn error_name(&self, code: CuResult) -> Option<String>;
    fn error_string(&self, code: CuResult) -> Option<String>;
}

fn status(res: CuResult) -> Result<(), CuResult> {
    if res == CUDA_SUCCESS { Ok(()) } else { Err(res) }
}

fn static_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

impl Driver for CudaApi {
    fn init(&self, flags: u32) -> Result<(), CuResult> {
        status(unsafe { (self.cu_init)(flags as c_uint) })
    }

    fn device_get_count(&self) -> Result<i32, CuResult> {
        let mut count: c_int = 0;
        status(unsafe { (self.cu_device_get_count)(&mut count) })?;
        Ok(count)
    }

    fn device_get(&self, ordinal: i32) -> Result<CuDevice, CuResult> {
        let mut device: CuDevice = 0;
        status(unsafe { (self.cu_device_get)(&mut device, ordinal) })?;
        Ok(device)
    }

    fn device_get_name(&self, device: CuDevice) -> Result<String, CuResult> {
        let mut buf = [0u8; 256];
        status(unsafe {
            (self.cu_device_get_name)(buf.as_mut_ptr() as *mut c_char, buf.len() as c_int, device)
        })?;
        let name = CStr::from_bytes_until_nul(&buf)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(name)
    }

    fn ctx_create(&self, flags: u32, device: CuDevice) -> Result<CuContext, CuResult> {
        let mut ctx: CuContext = std::ptr::null_mut();
        status(unsafe { (self.cu_ctx_create)(&mut ctx, flags as c_uint, device) })?;
        // cuCtxCreate binds the new context; detach it so the owner's push is the only one.
        let mut popped: CuContext = std::ptr::null_mut();
        if let Err(code) = status(unsafe { (self.cu_ctx_pop_current)(&mut popped) }) {
            unsafe { (self.cu_ctx_destroy)(ctx) };
            return Err(code);
        }
        Ok(ctx)
    }

    fn ctx_push_current(&self, ctx: CuContext) -> Result<(), CuResult> {
        status(unsafe { (self.cu_ctx_push_current)(ctx) })
    }

    fn ctx_pop_current(&self) -> Result<CuContext, CuResult> {
        let mut ctx: CuContext = std::ptr::null_mut();
        status(unsafe { (self.cu_ctx_pop_current)(&mut ctx) })?;
        Ok(ctx)
    }

    fn ctx_destroy(&self, ctx: CuContext) -> Result<(), CuResult> {
        status(unsafe { (self.cu_ctx_destroy)(ctx) })
    }

    fn ctx_synchronize(&self) -> Result<(), CuResult> {
        status(unsafe { (self.cu_ctx_synchronize)() })
    }

    fn mem_alloc(&self, bytes: usize) -> Result<CuDevicePtr, CuResult> {
        let mut ptr: CuDevicePtr = 0;
        status(unsafe { (self.cu_mem_alloc)(&mut ptr, bytes) })?;
        Ok(ptr)
    }

    fn mem_free(&self, ptr: CuDevicePtr) -> Result<(), CuResult> {
        status(unsafe { (self.cu_mem_free)(ptr) })
    }

    fn memcpy_htod(&self, dst: CuDevicePtr, src: &[u8]) -> Result<(), CuResult> {
        status(unsafe { (self.cu_memcpy_htod)(dst, src.as_ptr() as *const c_void, src.len()) })
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: CuDevicePtr) -> Result<(), CuResult> {
        status(unsafe { (self.cu_memcpy_dtoh)(dst.as_mut_ptr() as *mut c_void, src, dst.len()) })
    }

    fn module_load(&self, path: &CStr) -> Result<CuModule, CuResult> {
        let mut module: CuModule = std::ptr::null_mut();
        status(unsafe { (self.cu_module_load)(&mut module, path.as_ptr()) })?;
        Ok(module)
    }

    fn module_load_data(&self, image: &[u8]) -> Result<CuModule, CuResult> {
        let mut module: CuModule = std::ptr::null_mut();
        status(unsafe { (self.cu_module_load_data)(&mut module, image.as_ptr() as *const c_void) })?;
        Ok(module)
    }

    fn module_get_function(&self, module: CuModule, name: &CStr) -> Result<CuFunction, CuResult> {
        let mut func: CuFunction = std::ptr::null_mut();
        status(unsafe { (self.cu_module_get_function)(&mut func, module, name.as_ptr()) })?;
        Ok(func)
    }

    fn module_unload(&self, module: CuModule) -> Result<(), CuResult> {
        status(unsafe { (self.cu_module_unload)(module) })
    }

    unsafe fn launch_kernel(
        &self,
        func: CuFunction,
        grid_dim: [u32; 3],
        block_dim: [u32; 3],
        params: &mut [*mut c_void],
    ) -> Result<(), CuResult> {
        status((self.cu_launch_kernel)(
            func,
            grid_dim[0] as c_uint,
            grid_dim[1] as c_uint,
            grid_dim[2] as c_uint,
            block_dim[0] as c_uint,
            block_dim[1] as c_uint,
            block_dim[2] as c_uint,
            0,                    // shared mem bytes
            std::ptr::null_mut(), // default stream
            params.as_mut_ptr(),
            std::ptr::null_mut(), // extra
        ))
    }

    fn error_name(&self, code: CuResult) -> Option<String> {
        let mut ptr: *const c_char = std::ptr::null();
        status(unsafe { (self.cu_get_error_name)(code, &mut ptr) }).ok()?;
        static_str(ptr)
    }

    fn error_string(&self, code: CuResult) -> Option<String> {
        let mut ptr: *const c_char = std::ptr::null();
        status(unsafe { (self.cu_get_error_string)(code, &mut ptr) }).ok()?;
        static_str(ptr)
    }
}

// ---------------------------------------------------------------------------
// Process-wide driver
// ---------------------------------------------------------------------------

static CUDA_API: OnceLock<Result<Arc<CudaApi>, CudaError>> = OnceLock::new();

/// Run the driver's one-time initialization.
pub fn init(driver: &dyn Driver) -> Result<(), CudaError> {
    driver.init(0).check(driver, "cuInit")
}

/// Load the system CUDA driver and initialize it.
///
/// The library is opened and `cuInit` runs on the first call only; later
/// calls return the same driver (or the same failure).
pub fn load() -> Result<Arc<dyn Driver>, CudaError> {
    let api = CUDA_API
        .get_or_init(|| {
            let api = Arc::new(CudaApi::try_load().map_err(CudaError::NotAvailable)?);
            init(&*api)?;
            Ok(api)
        })
        .clone()?;
    Ok(api as Arc<dyn Driver>)
}

/// Check whether a CUDA driver is installed and reports at least one device.
pub fn is_cuda_available() -> bool {
    let driver = match load() {
        Ok(d) => d,
        Err(e) => {
            debug!("CUDA unavailable: {}", e);
            return false;
        }
    };
    matches!(driver.device_get_count(), Ok(n) if n > 0)
}
