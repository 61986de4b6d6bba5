//! Driver status translation.
//!
//! Every driver call in this crate passes its status through [`Check`] before
//! the result reaches a caller. The [`Driver`] methods have already split
//! success from failure by comparing the code against `CUDA_SUCCESS`; the name
//! and message are only looked up for failures.

use crate::driver::{ffi, CuResult, Driver};
use crate::error::{CudaError, DriverStatus};

const UNKNOWN_NAME: &str = "CUDA_ERROR_UNRECOGNIZED";
const UNKNOWN_MESSAGE: &str = "no description available";

/// Ask the driver for the name and message of `code`.
///
/// Lookups that fail fall back to the built-in name table and a placeholder
/// message; this never panics.
pub fn describe(driver: &dyn Driver, code: CuResult) -> DriverStatus {
    let name = driver
        .error_name(code)
        .filter(|s| !s.is_empty())
        .or_else(|| ffi::status_name(code).map(str::to_owned))
        .unwrap_or_else(|| UNKNOWN_NAME.to_owned());
    let message = driver
        .error_string(code)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN_MESSAGE.to_owned());
    DriverStatus { code, name, message }
}

/// The failure for a non-success `code` returned by `call`.
pub(crate) fn driver_error(driver: &dyn Driver, call: &'static str, code: CuResult) -> CudaError {
    CudaError::Driver { call, status: describe(driver, code) }
}

/// Translation for results already split by the [`Driver`] methods.
pub trait Check<T> {
    fn check(self, driver: &dyn Driver, call: &'static str) -> Result<T, CudaError>;
}

impl<T> Check<T> for Result<T, CuResult> {
    fn check(self, driver: &dyn Driver, call: &'static str) -> Result<T, CudaError> {
        self.map_err(|code| driver_error(driver, call, code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ffi::{CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_OUT_OF_MEMORY};
    use crate::mock::MockDriver;

    #[test]
    fn test_success_is_not_an_error() {
        let driver = MockDriver::new(1);
        let res: Result<(), CuResult> = Ok(());
        assert!(res.check(&driver, "cuInit").is_ok());
    }

    #[test]
    fn test_failure_carries_name_and_message() {
        let driver = MockDriver::new(1);
        let res: Result<u64, CuResult> = Err(CUDA_ERROR_OUT_OF_MEMORY);
        let err = res.check(&driver, "cuMemAlloc").unwrap_err();
        match err {
            CudaError::Driver { call, status } => {
                assert_eq!(call, "cuMemAlloc");
                assert_eq!(status.code, CUDA_ERROR_OUT_OF_MEMORY);
                assert_eq!(status.name, "CUDA_ERROR_OUT_OF_MEMORY");
                assert_eq!(status.message, "out of memory");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_code_falls_back() {
        let driver = MockDriver::new(1);
        let status = describe(&driver, 4242);
        assert_eq!(status.code, 4242);
        assert_eq!(status.name, UNKNOWN_NAME);
        assert_eq!(status.message, UNKNOWN_MESSAGE);
    }

    #[test]
    fn test_result_check_maps_error_code() {
        let driver = MockDriver::new(1);
        let res: Result<u64, CuResult> = Err(CUDA_ERROR_INVALID_VALUE);
        let err = res.check(&driver, "cuMemcpyHtoD").unwrap_err();
        assert_eq!(err.code(), Some(CUDA_ERROR_INVALID_VALUE));
        assert!(err.to_string().starts_with("cuMemcpyHtoD failed: CUDA_ERROR_INVALID_VALUE (1)"));

        let ok: Result<u64, CuResult> = Ok(7);
        assert_eq!(ok.check(&driver, "cuMemAlloc").unwrap(), 7);
    }
}
