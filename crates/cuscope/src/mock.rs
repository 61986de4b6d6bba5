//! In-process stand-in for the CUDA driver.
//!
//! [`MockDriver`] implements [`Driver`] without a GPU: contexts live on
//! per-thread stacks, device memory is host memory behind fake addresses, and
//! kernels are Rust closures registered against image paths or bytes. It
//! counts every acquire/release and flags releases of handles it does not
//! know, so tests can assert exact lifetime behaviour.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{c_void, CStr};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::driver::ffi::{
    self, CUDA_ERROR_FILE_NOT_FOUND, CUDA_ERROR_INVALID_CONTEXT, CUDA_ERROR_INVALID_DEVICE,
    CUDA_ERROR_INVALID_HANDLE, CUDA_ERROR_INVALID_IMAGE, CUDA_ERROR_INVALID_VALUE,
    CUDA_ERROR_NOT_FOUND, CUDA_ERROR_NOT_INITIALIZED,
};
use crate::driver::{CuContext, CuDevice, CuDevicePtr, CuFunction, CuModule, CuResult, Driver};

const HANDLE_BASE: usize = 0x1000;
const DEVICE_HEAP_BASE: CuDevicePtr = 0x7f00_0000_0000;
const ALLOC_ALIGN: u64 = 256;

/// A kernel body. Runs synchronously inside `launch_kernel`; a non-zero return
/// becomes the launch status.
pub type MockKernel = Arc<dyn Fn(&mut MockMemory, &KernelLaunch<'_>) -> CuResult + Send + Sync>;

/// What a [`MockKernel`] sees of its launch.
pub struct KernelLaunch<'a> {
    pub grid_dim: [u32; 3],
    pub block_dim: [u32; 3],
    params: &'a [*mut c_void],
}

impl KernelLaunch<'_> {
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Total threads in the launch, saturating at `usize::MAX`.
    pub fn threads(&self) -> usize {
        self.grid_dim
            .iter()
            .chain(self.block_dim.iter())
            .fold(1usize, |acc, &d| acc.saturating_mul(d as usize))
    }

    /// Read parameter `index` as a `T`.
    ///
    /// # Safety
    /// The parameter must point at a live value of type `T`.
    pub unsafe fn param<T: Pod>(&self, index: usize) -> Option<T> {
        let ptr = *self.params.get(index)?;
        if ptr.is_null() {
            return None;
        }
        Some(std::ptr::read_unaligned(ptr as *const T))
    }
}

/// Fake device memory, addressed by [`CuDevicePtr`].
#[derive(Debug, Default)]
pub struct MockMemory {
    allocations: BTreeMap<CuDevicePtr, Vec<u8>>,
    next_addr: CuDevicePtr,
}

impl MockMemory {
    fn alloc(&mut self, bytes: usize) -> CuDevicePtr {
        if self.next_addr == 0 {
            self.next_addr = DEVICE_HEAP_BASE;
        }
        let ptr = self.next_addr;
        let span = (bytes as u64 + ALLOC_ALIGN - 1) / ALLOC_ALIGN * ALLOC_ALIGN;
        self.next_addr += span.max(ALLOC_ALIGN);
        self.allocations.insert(ptr, vec![0; bytes]);
        ptr
    }

    fn free(&mut self, ptr: CuDevicePtr) -> bool {
        self.allocations.remove(&ptr).is_some()
    }

    fn region(&self, ptr: CuDevicePtr, bytes: usize) -> Option<&[u8]> {
        let (&base, data) = self.allocations.range(..=ptr).next_back()?;
        let start = (ptr - base) as usize;
        data.get(start..start.checked_add(bytes)?)
    }

    fn region_mut(&mut self, ptr: CuDevicePtr, bytes: usize) -> Option<&mut [u8]> {
        let (&base, data) = self.allocations.range_mut(..=ptr).next_back()?;
        let start = (ptr - base) as usize;
        data.get_mut(start..start.checked_add(bytes)?)
    }

    /// Read `len` elements starting at `ptr`; `None` if out of bounds.
    pub fn read<T: Pod>(&self, ptr: CuDevicePtr, len: usize) -> Option<Vec<T>> {
        let bytes = self.region(ptr, len.checked_mul(std::mem::size_of::<T>())?)?;
        let mut out = vec![T::zeroed(); len];
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes);
        Some(out)
    }

    /// Write `data` starting at `ptr`; `false` if out of bounds.
    pub fn write<T: Pod>(&mut self, ptr: CuDevicePtr, data: &[T]) -> bool {
        let src: &[u8] = bytemuck::cast_slice(data);
        match self.region_mut(ptr, src.len()) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Number of live allocations.
    pub fn live(&self) -> usize {
        self.allocations.len()
    }
}

/// The kernels one program image exports.
#[derive(Clone, Default)]
pub struct MockImage {
    kernels: HashMap<String, MockKernel>,
}

impl MockImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(&mut MockMemory, &KernelLaunch<'_>) -> CuResult + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_string(), Arc::new(body));
        self
    }
}

/// Acquire/release counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub contexts_created: usize,
    pub contexts_destroyed: usize,
    pub pushes: usize,
    pub pops: usize,
    pub allocations: usize,
    pub frees: usize,
    pub modules_loaded: usize,
    pub modules_unloaded: usize,
    pub launches: usize,
    /// Releases of a handle that was never acquired or is already released.
    pub invalid_releases: usize,
}

struct LoadedModule {
    image: MockImage,
}

#[derive(Default)]
struct MockState {
    initialized: bool,
    next_handle: usize,
    contexts: HashMap<usize, CuDevice>,
    stacks: HashMap<ThreadId, Vec<usize>>,
    memory: MockMemory,
    modules: HashMap<usize, LoadedModule>,
    functions: HashMap<usize, (usize, MockKernel)>,
    faults: HashMap<&'static str, CuResult>,
    stats: MockStats,
}

impl MockState {
    fn handle(&mut self) -> usize {
        if self.next_handle == 0 {
            self.next_handle = HANDLE_BASE;
        }
        let h = self.next_handle;
        self.next_handle += 0x10;
        h
    }

    fn current(&self) -> Option<usize> {
        self.stacks.get(&thread::current().id()).and_then(|s| s.last().copied())
    }

    /// Common entry checks: injected fault, then initialization.
    fn enter(&mut self, call: &'static str) -> Result<(), CuResult> {
        if let Some(code) = self.faults.remove(call) {
            return Err(code);
        }
        if !self.initialized {
            return Err(CUDA_ERROR_NOT_INITIALIZED);
        }
        Ok(())
    }

    fn enter_with_context(&mut self, call: &'static str) -> Result<(), CuResult> {
        self.enter(call)?;
        match self.current() {
            Some(ctx) if self.contexts.contains_key(&ctx) => Ok(()),
            _ => Err(CUDA_ERROR_INVALID_CONTEXT),
        }
    }
}

/// A fake driver exposing `device_count` devices.
pub struct MockDriver {
    device_count: i32,
    files: HashMap<PathBuf, MockImage>,
    blobs: Vec<(Vec<u8>, MockImage)>,
    state: Mutex<MockState>,
}

impl MockDriver {
    /// A driver that still needs `init`, like the real one.
    pub fn new(device_count: i32) -> Self {
        Self {
            device_count,
            files: HashMap::new(),
            blobs: Vec::new(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// A driver that has already been initialized.
    pub fn initialized(device_count: i32) -> Self {
        let driver = Self::new(device_count);
        driver.state.lock().initialized = true;
        driver
    }

    /// Make `image` loadable from `path` via `module_load`.
    pub fn with_image_file(mut self, path: impl Into<PathBuf>, image: MockImage) -> Self {
        self.files.insert(path.into(), image);
        self
    }

    /// Make `image` loadable from `bytes` via `module_load_data`.
    pub fn with_image_data(mut self, bytes: &[u8], image: MockImage) -> Self {
        self.blobs.push((trim_nul(bytes).to_vec(), image));
        self
    }

    /// Fail the next call to `call` (driver API name, e.g. `"cuMemAlloc"`)
    /// with `code`.
    pub fn fail_next(&self, call: &'static str, code: CuResult) {
        self.state.lock().faults.insert(call, code);
    }

    pub fn stats(&self) -> MockStats {
        self.state.lock().stats
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().memory.live()
    }

    pub fn live_modules(&self) -> usize {
        self.state.lock().modules.len()
    }

    /// Depth of the calling thread's context stack.
    pub fn stack_depth(&self) -> usize {
        self.state.lock().stacks.get(&thread::current().id()).map_or(0, Vec::len)
    }

    /// Run `f` against device memory, e.g. to inspect a buffer directly.
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut MockMemory) -> R) -> R {
        f(&mut self.state.lock().memory)
    }
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(&[0]).unwrap_or(bytes)
}

fn key(ptr: *mut c_void) -> usize {
    ptr as usize
}

fn ptr(handle: usize) -> *mut c_void {
    handle as *mut c_void
}

impl Driver for MockDriver {
    fn init(&self, _flags: u32) -> Result<(), CuResult> {
        let mut st = self.state.lock();
        if let Some(code) = st.faults.remove("cuInit") {
            return Err(code);
        }
        st.initialized = true;
        Ok(())
    }

    fn device_get_count(&self) -> Result<i32, CuResult> {
        self.state.lock().enter("cuDeviceGetCount")?;
        Ok(self.device_count)
    }

    fn device_get(&self, ordinal: i32) -> Result<CuDevice, CuResult> {
        self.state.lock().enter("cuDeviceGet")?;
        if ordinal < 0 || ordinal >= self.device_count {
            return Err(CUDA_ERROR_INVALID_DEVICE);
        }
        Ok(ordinal)
    }

    fn device_get_name(&self, device: CuDevice) -> Result<String, CuResult> {
        self.state.lock().enter("cuDeviceGetName")?;
        if device < 0 || device >= self.device_count {
            return Err(CUDA_ERROR_INVALID_DEVICE);
        }
        Ok(format!("Mock Device {}", device))
    }

    fn ctx_create(&self, _flags: u32, device: CuDevice) -> Result<CuContext, CuResult> {
        let mut st = self.state.lock();
        st.enter("cuCtxCreate")?;
        if device < 0 || device >= self.device_count {
            return Err(CUDA_ERROR_INVALID_DEVICE);
        }
        let h = st.handle();
        st.contexts.insert(h, device);
        st.stats.contexts_created += 1;
        Ok(ptr(h))
    }

    fn ctx_push_current(&self, ctx: CuContext) -> Result<(), CuResult> {
        let mut st = self.state.lock();
        st.enter("cuCtxPushCurrent")?;
        let h = key(ctx);
        if !st.contexts.contains_key(&h) {
            return Err(CUDA_ERROR_INVALID_CONTEXT);
        }
        st.stacks.entry(thread::current().id()).or_default().push(h);
        st.stats.pushes += 1;
        Ok(())
    }

    fn ctx_pop_current(&self) -> Result<CuContext, CuResult> {
        let mut st = self.state.lock();
        st.enter("cuCtxPopCurrent")?;
        let h = st
            .stacks
            .get_mut(&thread::current().id())
            .and_then(Vec::pop)
            .ok_or(CUDA_ERROR_INVALID_CONTEXT)?;
        st.stats.pops += 1;
        Ok(ptr(h))
    }

    fn ctx_destroy(&self, ctx: CuContext) -> Result<(), CuResult> {
        let mut st = self.state.lock();
        st.enter("cuCtxDestroy")?;
        let h = key(ctx);
        if st.contexts.remove(&h).is_none() {
            st.stats.invalid_releases += 1;
            return Err(CUDA_ERROR_INVALID_CONTEXT);
        }
        for stack in st.stacks.values_mut() {
            stack.retain(|&c| c != h);
        }
        st.stats.contexts_destroyed += 1;
        Ok(())
    }

    fn ctx_synchronize(&self) -> Result<(), CuResult> {
        // Kernels run inline, so there is never outstanding work.
        self.state.lock().enter_with_context("cuCtxSynchronize")
    }

    fn mem_alloc(&self, bytes: usize) -> Result<CuDevicePtr, CuResult> {
        let mut st = self.state.lock();
        st.enter_with_context("cuMemAlloc")?;
        if bytes == 0 {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        let p = st.memory.alloc(bytes);
        st.stats.allocations += 1;
        Ok(p)
    }

    fn mem_free(&self, ptr: CuDevicePtr) -> Result<(), CuResult> {
        let mut st = self.state.lock();
        st.enter("cuMemFree")?;
        if !st.memory.free(ptr) {
            st.stats.invalid_releases += 1;
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        st.stats.frees += 1;
        Ok(())
    }

    fn memcpy_htod(&self, dst: CuDevicePtr, src: &[u8]) -> Result<(), CuResult> {
        let mut st = self.state.lock();
        st.enter_with_context("cuMemcpyHtoD")?;
        if st.memory.write(dst, src) { Ok(()) } else { Err(CUDA_ERROR_INVALID_VALUE) }
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: CuDevicePtr) -> Result<(), CuResult> {
        let mut st = self.state.lock();
        st.enter_with_context("cuMemcpyDtoH")?;
        let region = st.memory.region(src, dst.len()).ok_or(CUDA_ERROR_INVALID_VALUE)?;
        dst.copy_from_slice(region);
        Ok(())
    }

    fn module_load(&self, path: &CStr) -> Result<CuModule, CuResult> {
        let mut st = self.state.lock();
        st.enter_with_context("cuModuleLoad")?;
        let path = PathBuf::from(path.to_string_lossy().into_owned());
        let image = self.files.get(&path).cloned().ok_or(CUDA_ERROR_FILE_NOT_FOUND)?;
        let h = st.handle();
        st.modules.insert(h, LoadedModule { image });
        st.stats.modules_loaded += 1;
        Ok(ptr(h))
    }

    fn module_load_data(&self, image: &[u8]) -> Result<CuModule, CuResult> {
        let mut st = self.state.lock();
        st.enter_with_context("cuModuleLoadData")?;
        let bytes = trim_nul(image);
        let image = self
            .blobs
            .iter()
            .find(|(b, _)| b.as_slice() == bytes)
            .map(|(_, img)| img.clone())
            .ok_or(CUDA_ERROR_INVALID_IMAGE)?;
        let h = st.handle();
        st.modules.insert(h, LoadedModule { image });
        st.stats.modules_loaded += 1;
        Ok(ptr(h))
    }

    fn module_get_function(&self, module: CuModule, name: &CStr) -> Result<CuFunction, CuResult> {
        let mut st = self.state.lock();
        st.enter("cuModuleGetFunction")?;
        let m = key(module);
        let kernel = st
            .modules
            .get(&m)
            .ok_or(CUDA_ERROR_INVALID_HANDLE)?
            .image
            .kernels
            .get(&*name.to_string_lossy())
            .cloned()
            .ok_or(CUDA_ERROR_NOT_FOUND)?;
        let h = st.handle();
        st.functions.insert(h, (m, kernel));
        Ok(ptr(h))
    }

    fn module_unload(&self, module: CuModule) -> Result<(), CuResult> {
        let mut st = self.state.lock();
        st.enter("cuModuleUnload")?;
        let m = key(module);
        if st.modules.remove(&m).is_none() {
            st.stats.invalid_releases += 1;
            return Err(CUDA_ERROR_INVALID_HANDLE);
        }
        st.functions.retain(|_, (owner, _)| *owner != m);
        st.stats.modules_unloaded += 1;
        Ok(())
    }

    unsafe fn launch_kernel(
        &self,
        func: CuFunction,
        grid_dim: [u32; 3],
        block_dim: [u32; 3],
        params: &mut [*mut c_void],
    ) -> Result<(), CuResult> {
        let mut st = self.state.lock();
        st.enter_with_context("cuLaunchKernel")?;
        let kernel = st
            .functions
            .get(&key(func))
            .map(|(_, k)| Arc::clone(k))
            .ok_or(CUDA_ERROR_INVALID_HANDLE)?;
        if grid_dim.contains(&0) || block_dim.contains(&0) {
            return Err(CUDA_ERROR_INVALID_VALUE);
        }
        st.stats.launches += 1;
        let launch = KernelLaunch { grid_dim, block_dim, params };
        match kernel(&mut st.memory, &launch) {
            ffi::CUDA_SUCCESS => Ok(()),
            code => Err(code),
        }
    }

    fn error_name(&self, code: CuResult) -> Option<String> {
        ffi::status_name(code).map(str::to_owned)
    }

    fn error_string(&self, code: CuResult) -> Option<String> {
        let message = match code {
            ffi::CUDA_SUCCESS => "no error",
            CUDA_ERROR_INVALID_VALUE => "invalid argument",
            ffi::CUDA_ERROR_OUT_OF_MEMORY => "out of memory",
            CUDA_ERROR_NOT_INITIALIZED => "initialization error",
            CUDA_ERROR_INVALID_DEVICE => "invalid device ordinal",
            CUDA_ERROR_INVALID_IMAGE => "device kernel image is invalid",
            CUDA_ERROR_INVALID_CONTEXT => "invalid device context",
            CUDA_ERROR_FILE_NOT_FOUND => "file not found",
            CUDA_ERROR_INVALID_HANDLE => "invalid resource handle",
            CUDA_ERROR_NOT_FOUND => "named symbol not found",
            ffi::CUDA_ERROR_LAUNCH_FAILED => "unspecified launch failure",
            _ => return None,
        };
        Some(message.to_string())
    }
}
