//! # cuscope
//!
//! Scope-bound ownership for CUDA driver resources.
//!
//! Provides:
//! - Runtime-loaded driver API behind the [`Driver`] trait (no build-time CUDA dependency)
//! - Status translation: every failure carries the driver's error name and message
//! - [`DeviceContext`]: one context, pushed current for its lifetime
//! - [`DeviceBuffer`]: typed device memory with host↔device copies
//! - [`ProgramModule`]: a loaded program image plus one launchable entry point
//! - [`MockDriver`](mock::MockDriver): an in-process fake driver for tests
//!
//! Resources borrow the context they were created under, so the borrow checker
//! enforces teardown order: buffers and modules first, context last.
//!
//! ```no_run
//! use cuscope::{DeviceBuffer, DeviceContext, KernelArgs, LaunchConfig, ProgramModule};
//!
//! # fn main() -> Result<(), cuscope::CudaError> {
//! let driver = cuscope::driver::load()?;
//! let ctx = DeviceContext::new(driver, 0)?;
//! let a = DeviceBuffer::from_slice(&ctx, &[1.0f32, 2.0, 3.0])?;
//! let b = DeviceBuffer::from_slice(&ctx, &[4.0f32, 5.0, 6.0])?;
//! let c = DeviceBuffer::<f32>::new(&ctx, 3)?;
//! let n = 3i32;
//!
//! let kernel = ProgramModule::new(&ctx, "kernels/add_kernel.ptx", "addKernel")?;
//! let mut args = KernelArgs::new().buffer(&a).buffer(&b).buffer(&c).value(&n);
//! unsafe { kernel.launch(LaunchConfig::grid_1d(3, 256), &mut args)? };
//! assert_eq!(c.to_vec()?, vec![5.0, 7.0, 9.0]);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod driver;
pub mod error;
pub mod launch;
pub mod memory;
pub mod mock;
pub mod module;
pub mod status;

pub use context::{device_count, ContextFlags, DeviceContext};
pub use driver::Driver;
pub use error::{CudaError, DriverStatus};
pub use launch::{KernelArgs, LaunchConfig};
pub use memory::DeviceBuffer;
pub use module::{ImageSource, ProgramModule};
