//! Program modules: a loaded device image plus one resolved entry point.

use std::borrow::Cow;
use std::ffi::CString;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::context::DeviceContext;
use crate::driver::ffi::{
    CUDA_ERROR_DEINITIALIZED, CUDA_ERROR_INVALID_CONTEXT, CUDA_ERROR_NOT_INITIALIZED,
};
use crate::driver::{CuFunction, CuModule, CuResult, Driver};
use crate::error::CudaError;
use crate::launch::{KernelArgs, LaunchConfig};
use crate::status::{describe, driver_error, Check};

/// Where a program image came from, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    File(PathBuf),
    Memory { len: usize },
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::File(path) => write!(f, "'{}'", path.display()),
            ImageSource::Memory { len } => write!(f, "<in-memory image, {} bytes>", len),
        }
    }
}

/// A loaded program image and the entry point resolved from it.
///
/// The image is unloaded via `cuModuleUnload` on drop, which also invalidates
/// the entry point.
pub struct ProgramModule<'ctx> {
    ctx: &'ctx DeviceContext,
    module: CuModule,
    function: CuFunction,
    entry_point: String,
    source: ImageSource,
}

impl<'ctx> ProgramModule<'ctx> {
    /// Load the image at `path` (PTX, cubin or fatbin) and resolve `entry_point`.
    pub fn new(
        ctx: &'ctx DeviceContext,
        path: impl AsRef<Path>,
        entry_point: &str,
    ) -> Result<Self, CudaError> {
        let path = path.as_ref();
        let c_path = path
            .to_str()
            .and_then(|s| CString::new(s).ok())
            .ok_or_else(|| CudaError::InvalidName(path.display().to_string()))?;
        let c_entry = entry_name(entry_point)?;
        let source = ImageSource::File(path.to_path_buf());

        let driver = ctx.driver();
        let module = driver
            .module_load(&c_path)
            .map_err(|code| load_error(driver, "cuModuleLoad", code, &source))?;
        Self::resolve(ctx, module, source, entry_point, &c_entry)
    }

    /// Load an image held in memory (e.g. PTX from `include_bytes!`).
    pub fn from_image(
        ctx: &'ctx DeviceContext,
        image: &[u8],
        entry_point: &str,
    ) -> Result<Self, CudaError> {
        let c_entry = entry_name(entry_point)?;
        let source = ImageSource::Memory { len: image.len() };

        // PTX text is read up to its terminating NUL.
        let image: Cow<'_, [u8]> = if image.last() == Some(&0) {
            Cow::Borrowed(image)
        } else {
            let mut owned = image.to_vec();
            owned.push(0);
            Cow::Owned(owned)
        };

        let driver = ctx.driver();
        let module = driver
            .module_load_data(&image)
            .map_err(|code| load_error(driver, "cuModuleLoadData", code, &source))?;
        Self::resolve(ctx, module, source, entry_point, &c_entry)
    }

    fn resolve(
        ctx: &'ctx DeviceContext,
        module: CuModule,
        source: ImageSource,
        entry_point: &str,
        c_entry: &CString,
    ) -> Result<Self, CudaError> {
        let driver = ctx.driver();
        let function = match driver.module_get_function(module, c_entry) {
            Ok(f) => f,
            Err(code) => {
                let err = if is_environment_failure(code) {
                    driver_error(driver, "cuModuleGetFunction", code)
                } else {
                    CudaError::EntryPointNotFound {
                        name: entry_point.to_string(),
                        image: source.clone(),
                        status: describe(driver, code),
                    }
                };
                // The image is ours until construction succeeds.
                if let Err(e) = driver.module_unload(module).check(driver, "cuModuleUnload") {
                    warn!("leaked module {:p} from {}: {}", module, source, e);
                }
                return Err(err);
            }
        };

        debug!("loaded {} with entry point '{}'", source, entry_point);
        Ok(Self {
            ctx,
            module,
            function,
            entry_point: entry_point.to_string(),
            source,
        })
    }

    /// Enqueue the entry point on the default stream.
    ///
    /// Returns once the driver has accepted the launch; the kernel runs
    /// asynchronously. Copies issued afterwards on the same thread are ordered
    /// after it; otherwise call [`DeviceContext::synchronize`].
    ///
    /// # Safety
    /// `args` must match the kernel's parameter list in count, order and type,
    /// and every buffer it references must be large enough for the accesses
    /// the kernel makes under `config`.
    pub unsafe fn launch(
        &self,
        config: LaunchConfig,
        args: &mut KernelArgs<'_>,
    ) -> Result<(), CudaError> {
        let driver = self.ctx.driver();
        debug!(
            "launching '{}' grid={:?} block={:?} args={}",
            self.entry_point,
            config.grid_dim,
            config.block_dim,
            args.len()
        );
        driver
            .launch_kernel(self.function, config.grid(), config.block(), args.as_params())
            .check(driver, "cuLaunchKernel")
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn as_raw(&self) -> (CuModule, CuFunction) {
        (self.module, self.function)
    }

    /// Unload the image now instead of at drop, reporting the status.
    pub fn unload(mut self) -> Result<(), CudaError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), CudaError> {
        if self.module.is_null() {
            return Ok(());
        }
        let module = std::mem::replace(&mut self.module, std::ptr::null_mut());
        self.function = std::ptr::null_mut();
        let driver = self.ctx.driver();
        driver.module_unload(module).check(driver, "cuModuleUnload")?;
        debug!("unloaded {}", self.source);
        Ok(())
    }
}

impl Drop for ProgramModule<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("unloading {}: {}", self.source, e);
        }
    }
}

impl fmt::Debug for ProgramModule<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramModule")
            .field("source", &self.source)
            .field("entry_point", &self.entry_point)
            .field("module", &self.module)
            .finish()
    }
}

/// Failures that say nothing about the image: no usable context or driver.
fn is_environment_failure(code: CuResult) -> bool {
    matches!(
        code,
        CUDA_ERROR_INVALID_CONTEXT | CUDA_ERROR_NOT_INITIALIZED | CUDA_ERROR_DEINITIALIZED
    )
}

fn load_error(driver: &dyn Driver, call: &'static str, code: CuResult, image: &ImageSource) -> CudaError {
    if is_environment_failure(code) {
        driver_error(driver, call, code)
    } else {
        CudaError::ProgramLoadFailed { image: image.clone(), status: describe(driver, code) }
    }
}

fn entry_name(name: &str) -> Result<CString, CudaError> {
    CString::new(name).map_err(|_| CudaError::InvalidName(name.to_string()))
}
