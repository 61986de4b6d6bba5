//! Runtime-loaded CUDA driver function pointers via dlopen.
//!
//! Nothing here links against the CUDA toolkit at build time; any driver that
//! exports the `_v2` entry points of the driver API works.

use std::ffi::{c_char, c_int, c_uint, c_void};

use libloading::Library;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Status codes and opaque handles
// ---------------------------------------------------------------------------

pub type CuResult = c_int;
pub type CuDevice = c_int;
pub type CuContext = *mut c_void;
pub type CuModule = *mut c_void;
pub type CuFunction = *mut c_void;
pub type CuStream = *mut c_void;
pub type CuDevicePtr = u64;

pub const CUDA_SUCCESS: CuResult = 0;
pub const CUDA_ERROR_INVALID_VALUE: CuResult = 1;
pub const CUDA_ERROR_OUT_OF_MEMORY: CuResult = 2;
pub const CUDA_ERROR_NOT_INITIALIZED: CuResult = 3;
pub const CUDA_ERROR_DEINITIALIZED: CuResult = 4;
pub const CUDA_ERROR_NO_DEVICE: CuResult = 100;
pub const CUDA_ERROR_INVALID_DEVICE: CuResult = 101;
pub const CUDA_ERROR_INVALID_IMAGE: CuResult = 200;
pub const CUDA_ERROR_INVALID_CONTEXT: CuResult = 201;
pub const CUDA_ERROR_NO_BINARY_FOR_GPU: CuResult = 209;
pub const CUDA_ERROR_INVALID_PTX: CuResult = 218;
pub const CUDA_ERROR_FILE_NOT_FOUND: CuResult = 301;
pub const CUDA_ERROR_INVALID_HANDLE: CuResult = 400;
pub const CUDA_ERROR_NOT_FOUND: CuResult = 500;
pub const CUDA_ERROR_NOT_READY: CuResult = 600;
pub const CUDA_ERROR_ILLEGAL_ADDRESS: CuResult = 700;
pub const CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES: CuResult = 701;
pub const CUDA_ERROR_LAUNCH_TIMEOUT: CuResult = 702;
pub const CUDA_ERROR_LAUNCH_FAILED: CuResult = 719;
pub const CUDA_ERROR_NOT_SUPPORTED: CuResult = 801;
pub const CUDA_ERROR_UNKNOWN: CuResult = 999;

// CUctx_flags scheduling policies
pub const CU_CTX_SCHED_AUTO: c_uint = 0x00;
pub const CU_CTX_SCHED_SPIN: c_uint = 0x01;
pub const CU_CTX_SCHED_YIELD: c_uint = 0x02;
pub const CU_CTX_SCHED_BLOCKING_SYNC: c_uint = 0x04;

/// Canonical name of a status code, used when the driver cannot be asked.
pub fn status_name(code: CuResult) -> Option<&'static str> {
    let name = match code {
        CUDA_SUCCESS => "CUDA_SUCCESS",
        CUDA_ERROR_INVALID_VALUE => "CUDA_ERROR_INVALID_VALUE",
        CUDA_ERROR_OUT_OF_MEMORY => "CUDA_ERROR_OUT_OF_MEMORY",
        CUDA_ERROR_NOT_INITIALIZED => "CUDA_ERROR_NOT_INITIALIZED",
        CUDA_ERROR_DEINITIALIZED => "CUDA_ERROR_DEINITIALIZED",
        CUDA_ERROR_NO_DEVICE => "CUDA_ERROR_NO_DEVICE",
        CUDA_ERROR_INVALID_DEVICE => "CUDA_ERROR_INVALID_DEVICE",
        CUDA_ERROR_INVALID_IMAGE => "CUDA_ERROR_INVALID_IMAGE",
        CUDA_ERROR_INVALID_CONTEXT => "CUDA_ERROR_INVALID_CONTEXT",
        CUDA_ERROR_NO_BINARY_FOR_GPU => "CUDA_ERROR_NO_BINARY_FOR_GPU",
        CUDA_ERROR_INVALID_PTX => "CUDA_ERROR_INVALID_PTX",
        CUDA_ERROR_FILE_NOT_FOUND => "CUDA_ERROR_FILE_NOT_FOUND",
        CUDA_ERROR_INVALID_HANDLE => "CUDA_ERROR_INVALID_HANDLE",
        CUDA_ERROR_NOT_FOUND => "CUDA_ERROR_NOT_FOUND",
        CUDA_ERROR_NOT_READY => "CUDA_ERROR_NOT_READY",
        CUDA_ERROR_ILLEGAL_ADDRESS => "CUDA_ERROR_ILLEGAL_ADDRESS",
        CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES => "CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES",
        CUDA_ERROR_LAUNCH_TIMEOUT => "CUDA_ERROR_LAUNCH_TIMEOUT",
        CUDA_ERROR_LAUNCH_FAILED => "CUDA_ERROR_LAUNCH_FAILED",
        CUDA_ERROR_NOT_SUPPORTED => "CUDA_ERROR_NOT_SUPPORTED",
        CUDA_ERROR_UNKNOWN => "CUDA_ERROR_UNKNOWN",
        _ => return None,
    };
    Some(name)
}

// ---------------------------------------------------------------------------
// Driver API function signatures
// ---------------------------------------------------------------------------

type FnCuInit = unsafe extern "C" fn(c_uint) -> CuResult;
type FnCuDeviceGetCount = unsafe extern "C" fn(*mut c_int) -> CuResult;
type FnCuDeviceGet = unsafe extern "C" fn(*mut CuDevice, c_int) -> CuResult;
type FnCuDeviceGetName = unsafe extern "C" fn(*mut c_char, c_int, CuDevice) -> CuResult;
type FnCuCtxCreate = unsafe extern "C" fn(*mut CuContext, c_uint, CuDevice) -> CuResult;
type FnCuCtxDestroy = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuCtxPushCurrent = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuCtxPopCurrent = unsafe extern "C" fn(*mut CuContext) -> CuResult;
type FnCuCtxSynchronize = unsafe extern "C" fn() -> CuResult;
type FnCuMemAlloc = unsafe extern "C" fn(*mut CuDevicePtr, usize) -> CuResult;
type FnCuMemFree = unsafe extern "C" fn(CuDevicePtr) -> CuResult;
type FnCuMemcpyHtoD = unsafe extern "C" fn(CuDevicePtr, *const c_void, usize) -> CuResult;
type FnCuMemcpyDtoH = unsafe extern "C" fn(*mut c_void, CuDevicePtr, usize) -> CuResult;
type FnCuModuleLoad = unsafe extern "C" fn(*mut CuModule, *const c_char) -> CuResult;
type FnCuModuleLoadData = unsafe extern "C" fn(*mut CuModule, *const c_void) -> CuResult;
type FnCuModuleGetFunction = unsafe extern "C" fn(
    *mut CuFunction, CuModule, *const c_char,
) -> CuResult;
type FnCuModuleUnload = unsafe extern "C" fn(CuModule) -> CuResult;
type FnCuLaunchKernel = unsafe extern "C" fn(
    CuFunction,
    c_uint, c_uint, c_uint,   // grid x, y, z
    c_uint, c_uint, c_uint,   // block x, y, z
    c_uint,                   // shared mem bytes
    CuStream,                 // stream (null = default)
    *mut *mut c_void,         // kernel params
    *mut *mut c_void,         // extra (null)
) -> CuResult;
type FnCuGetErrorName = unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult;
type FnCuGetErrorString = unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult;

// ---------------------------------------------------------------------------
// Loaded API struct
// ---------------------------------------------------------------------------

pub struct CudaApi {
    _lib: Library,
    pub cu_init: FnCuInit,
    pub cu_device_get_count: FnCuDeviceGetCount,
    pub cu_device_get: FnCuDeviceGet,
    pub cu_device_get_name: FnCuDeviceGetName,
    pub cu_ctx_create: FnCuCtxCreate,
    pub cu_ctx_destroy: FnCuCtxDestroy,
    pub cu_ctx_push_current: FnCuCtxPushCurrent,
    pub cu_ctx_pop_current: FnCuCtxPopCurrent,
    pub cu_ctx_synchronize: FnCuCtxSynchronize,
    pub cu_mem_alloc: FnCuMemAlloc,
    pub cu_mem_free: FnCuMemFree,
    pub cu_memcpy_htod: FnCuMemcpyHtoD,
    pub cu_memcpy_dtoh: FnCuMemcpyDtoH,
    pub cu_module_load: FnCuModuleLoad,
    pub cu_module_load_data: FnCuModuleLoadData,
    pub cu_module_get_function: FnCuModuleGetFunction,
    pub cu_module_unload: FnCuModuleUnload,
    pub cu_launch_kernel: FnCuLaunchKernel,
    pub cu_get_error_name: FnCuGetErrorName,
    pub cu_get_error_string: FnCuGetErrorString,
}

impl CudaApi {
    /// Open the driver library and resolve every entry point this crate uses.
    pub fn try_load() -> Result<Self, String> {
        let lib = Self::load_library()?;
        unsafe {
            let api = CudaApi {
                cu_init: load_fn(&lib, "cuInit")?,
                cu_device_get_count: load_fn(&lib, "cuDeviceGetCount")?,
                cu_device_get: load_fn(&lib, "cuDeviceGet")?,
                cu_device_get_name: load_fn(&lib, "cuDeviceGetName")?,
                cu_ctx_create: load_fn(&lib, "cuCtxCreate_v2")?,
                cu_ctx_destroy: load_fn(&lib, "cuCtxDestroy_v2")?,
                cu_ctx_push_current: load_fn(&lib, "cuCtxPushCurrent_v2")?,
                cu_ctx_pop_current: load_fn(&lib, "cuCtxPopCurrent_v2")?,
                cu_ctx_synchronize: load_fn(&lib, "cuCtxSynchronize")?,
                cu_mem_alloc: load_fn(&lib, "cuMemAlloc_v2")?,
                cu_mem_free: load_fn(&lib, "cuMemFree_v2")?,
                cu_memcpy_htod: load_fn(&lib, "cuMemcpyHtoD_v2")?,
                cu_memcpy_dtoh: load_fn(&lib, "cuMemcpyDtoH_v2")?,
                cu_module_load: load_fn(&lib, "cuModuleLoad")?,
                cu_module_load_data: load_fn(&lib, "cuModuleLoadData")?,
                cu_module_get_function: load_fn(&lib, "cuModuleGetFunction")?,
                cu_module_unload: load_fn(&lib, "cuModuleUnload")?,
                cu_launch_kernel: load_fn(&lib, "cuLaunchKernel")?,
                cu_get_error_name: load_fn(&lib, "cuGetErrorName")?,
                cu_get_error_string: load_fn(&lib, "cuGetErrorString")?,
                _lib: lib,
            };
            info!("CUDA driver API resolved");
            Ok(api)
        }
    }

    fn load_library() -> Result<Library, String> {
        #[cfg(target_os = "windows")]
        let lib_names: &[&str] = &["nvcuda.dll"];

        #[cfg(not(target_os = "windows"))]
        let lib_names: &[&str] = &["libcuda.so.1", "libcuda.so"];

        let mut last_err = String::from("no candidate library names");
        for name in lib_names {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    info!("loaded CUDA driver from: {}", name);
                    return Ok(lib);
                }
                Err(e) => {
                    debug!("failed to load {}: {}", name, e);
                    last_err = format!("{}: {}", name, e);
                }
            }
        }
        Err(last_err)
    }
}

unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F, String> {
    lib.get::<F>(name.as_bytes())
        .map(|sym| *sym)
        .map_err(|e| format!("missing symbol {}: {}", name, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(status_name(CUDA_SUCCESS), Some("CUDA_SUCCESS"));
        assert_eq!(status_name(CUDA_ERROR_NOT_FOUND), Some("CUDA_ERROR_NOT_FOUND"));
        assert_eq!(status_name(CUDA_ERROR_FILE_NOT_FOUND), Some("CUDA_ERROR_FILE_NOT_FOUND"));
        assert_eq!(status_name(12345), None);
    }
}
