//! Error types shared by every wrapper.

use std::fmt;

use crate::driver::CuResult;
use crate::module::ImageSource;

/// A translated driver status: the numeric code plus the driver's own name
/// and description for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub code: CuResult,
    pub name: String,
    pub message: String,
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.code, self.message)
    }
}

/// Failures reported by the driver wrappers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CudaError {
    #[error("CUDA driver not available: {0}")]
    NotAvailable(String),

    #[error("{call} failed: {status}")]
    Driver { call: &'static str, status: DriverStatus },

    #[error("device {requested} is not available ({available} device(s) found)")]
    DeviceUnavailable { requested: usize, available: usize },

    #[error("context {expected:#x} is not on top of this thread's context stack (found {found:#x})")]
    NotCurrent { expected: usize, found: usize },

    #[error("failed to load program image {image}: {status}")]
    ProgramLoadFailed { image: ImageSource, status: DriverStatus },

    #[error("entry point '{name}' not found in {image}: {status}")]
    EntryPointNotFound { name: String, image: ImageSource, status: DriverStatus },

    #[error("{0:?} contains an interior NUL byte")]
    InvalidName(String),

    #[error("host slice holds {actual} elements but the device buffer holds {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("{count} elements of {elem_size} bytes overflow the address space")]
    SizeOverflow { count: usize, elem_size: usize },
}

impl CudaError {
    /// The translated driver status behind this error, if the driver reported one.
    pub fn status(&self) -> Option<&DriverStatus> {
        match self {
            CudaError::Driver { status, .. }
            | CudaError::ProgramLoadFailed { status, .. }
            | CudaError::EntryPointNotFound { status, .. } => Some(status),
            _ => None,
        }
    }

    /// Raw driver code, if any.
    pub fn code(&self) -> Option<CuResult> {
        self.status().map(|s| s.code)
    }
}
