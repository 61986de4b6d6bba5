//! Device memory allocation and host↔device transfers.

use std::marker::PhantomData;

use bytemuck::Pod;
use tracing::{debug, warn};

use crate::context::DeviceContext;
use crate::driver::CuDevicePtr;
use crate::error::CudaError;
use crate::status::Check;

/// `len` elements of `T` in device memory, freed via `cuMemFree` on drop.
///
/// Borrows the [`DeviceContext`] it was allocated under, so it cannot outlive
/// it. Zero-length buffers still own a minimal one-byte allocation.
pub struct DeviceBuffer<'ctx, T: Pod> {
    ctx: &'ctx DeviceContext,
    ptr: CuDevicePtr,
    len: usize,
    _elem: PhantomData<T>,
}

impl<'ctx, T: Pod> DeviceBuffer<'ctx, T> {
    /// Allocate uninitialized room for `len` elements under `ctx`.
    pub fn new(ctx: &'ctx DeviceContext, len: usize) -> Result<Self, CudaError> {
        let elem_size = std::mem::size_of::<T>();
        let nbytes = elem_size
            .checked_mul(len)
            .ok_or(CudaError::SizeOverflow { count: len, elem_size })?;

        let driver = ctx.driver();
        let ptr = driver.mem_alloc(nbytes.max(1)).check(driver, "cuMemAlloc")?;
        debug!("allocated {} bytes at {:#x}", nbytes, ptr);
        Ok(Self { ctx, ptr, len, _elem: PhantomData })
    }

    /// Allocate a buffer and upload `data` into it (H2D).
    pub fn from_slice(ctx: &'ctx DeviceContext, data: &[T]) -> Result<Self, CudaError> {
        let mut buf = Self::new(ctx, data.len())?;
        buf.copy_from_host(data)?;
        Ok(buf)
    }

    /// Synchronous H2D copy of exactly `len` elements.
    pub fn copy_from_host(&mut self, src: &[T]) -> Result<(), CudaError> {
        self.check_len(src.len())?;
        if self.size_in_bytes() == 0 {
            return Ok(());
        }
        let driver = self.ctx.driver();
        driver
            .memcpy_htod(self.ptr, bytemuck::cast_slice(src))
            .check(driver, "cuMemcpyHtoD")
    }

    /// Synchronous D2H copy of exactly `len` elements.
    ///
    /// Ordered after any launch previously enqueued on the default stream.
    pub fn copy_to_host(&self, dst: &mut [T]) -> Result<(), CudaError> {
        self.check_len(dst.len())?;
        if self.size_in_bytes() == 0 {
            return Ok(());
        }
        let driver = self.ctx.driver();
        driver
            .memcpy_dtoh(bytemuck::cast_slice_mut(dst), self.ptr)
            .check(driver, "cuMemcpyDtoH")
    }

    /// Copy the buffer back to a new host vector (D2H).
    pub fn to_vec(&self) -> Result<Vec<T>, CudaError> {
        let mut host = vec![T::zeroed(); self.len];
        self.copy_to_host(&mut host)?;
        Ok(host)
    }

    /// Raw device address, for use as a kernel argument.
    pub fn device_ptr(&self) -> CuDevicePtr {
        self.ptr
    }

    /// The stored address itself; kernel parameter arrays point here.
    pub(crate) fn device_ptr_ref(&self) -> &CuDevicePtr {
        &self.ptr
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Free the allocation now instead of at drop, reporting the status.
    pub fn free(mut self) -> Result<(), CudaError> {
        self.release()
    }

    fn check_len(&self, actual: usize) -> Result<(), CudaError> {
        if actual != self.len {
            return Err(CudaError::LengthMismatch { expected: self.len, actual });
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), CudaError> {
        if self.ptr == 0 {
            return Ok(());
        }
        let ptr = std::mem::replace(&mut self.ptr, 0);
        let driver = self.ctx.driver();
        driver.mem_free(ptr).check(driver, "cuMemFree")?;
        debug!("freed {:#x}", ptr);
        Ok(())
    }
}

impl<T: Pod> Drop for DeviceBuffer<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("freeing device buffer: {}", e);
        }
    }
}

impl<T: Pod> std::fmt::Debug for DeviceBuffer<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("len", &self.len)
            .field("elem", &std::any::type_name::<T>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::ffi::{CUDA_ERROR_INVALID_CONTEXT, CUDA_ERROR_OUT_OF_MEMORY};
    use crate::mock::MockDriver;

    fn setup() -> (Arc<MockDriver>, DeviceContext) {
        let mock = Arc::new(MockDriver::initialized(1));
        let ctx = DeviceContext::new(mock.clone(), 0).unwrap();
        (mock, ctx)
    }

    #[test]
    fn test_roundtrip_f32() {
        let (_mock, ctx) = setup();
        let data: Vec<f32> = (0..257).map(|i| i as f32 * 0.25 - 3.0).collect();
        let mut buf = DeviceBuffer::<f32>::new(&ctx, data.len()).unwrap();
        buf.copy_from_host(&data).unwrap();
        let mut back = vec![0.0f32; data.len()];
        buf.copy_to_host(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_roundtrip_other_element_types() {
        let (_mock, ctx) = setup();
        let bytes = DeviceBuffer::from_slice(&ctx, &[1u8, 2, 255]).unwrap();
        assert_eq!(bytes.to_vec().unwrap(), vec![1u8, 2, 255]);

        let wide = DeviceBuffer::from_slice(&ctx, &[i64::MIN, -1, 0, i64::MAX]).unwrap();
        assert_eq!(wide.to_vec().unwrap(), vec![i64::MIN, -1, 0, i64::MAX]);
        assert_eq!(wide.size_in_bytes(), 32);

        let pairs = DeviceBuffer::from_slice(&ctx, &[[1.5f64, -2.0], [0.0, 9.0]]).unwrap();
        assert_eq!(pairs.to_vec().unwrap(), vec![[1.5, -2.0], [0.0, 9.0]]);
    }

    #[test]
    fn test_zero_length_buffer() {
        let (mock, ctx) = setup();
        let mut buf = DeviceBuffer::<f32>::new(&ctx, 0).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.size_in_bytes(), 0);
        assert_ne!(buf.device_ptr(), 0);
        buf.copy_from_host(&[]).unwrap();
        assert!(buf.to_vec().unwrap().is_empty());
        drop(buf);

        let stats = mock.stats();
        assert_eq!((stats.allocations, stats.frees), (1, 1));
    }

    #[test]
    fn test_length_mismatch() {
        let (_mock, ctx) = setup();
        let mut buf = DeviceBuffer::<u32>::new(&ctx, 4).unwrap();
        let err = buf.copy_from_host(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CudaError::LengthMismatch { expected: 4, actual: 3 }));
        let mut dst = [0u32; 5];
        assert!(buf.copy_to_host(&mut dst).is_err());
    }

    #[test]
    fn test_size_overflow() {
        let (mock, ctx) = setup();
        let err = DeviceBuffer::<u64>::new(&ctx, usize::MAX).unwrap_err();
        assert!(matches!(err, CudaError::SizeOverflow { elem_size: 8, .. }));
        assert_eq!(mock.stats().allocations, 0);
    }

    #[test]
    fn test_allocation_without_current_context_fails() {
        let (mock, ctx) = setup();
        ctx.deactivate().unwrap();
        let err = DeviceBuffer::<f32>::new(&ctx, 10).unwrap_err();
        assert!(matches!(err, CudaError::Driver { call: "cuMemAlloc", .. }));
        assert_eq!(err.code(), Some(CUDA_ERROR_INVALID_CONTEXT));
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_allocation_failure_is_translated() {
        let (mock, ctx) = setup();
        mock.fail_next("cuMemAlloc", CUDA_ERROR_OUT_OF_MEMORY);
        let err = DeviceBuffer::<f32>::new(&ctx, 1 << 20).unwrap_err();
        let status = err.status().unwrap();
        assert_eq!(status.name, "CUDA_ERROR_OUT_OF_MEMORY");
        assert_eq!(status.message, "out of memory");
    }

    #[test]
    fn test_move_frees_once() {
        let (mock, ctx) = setup();
        let buf = DeviceBuffer::from_slice(&ctx, &[1.0f32, 2.0]).unwrap();
        let ptr = buf.device_ptr();
        let mut holder = Vec::new();
        holder.push(buf);
        let moved = holder.pop().unwrap();
        assert_eq!(moved.device_ptr(), ptr);
        drop(moved);
        drop(holder);

        let stats = mock.stats();
        assert_eq!((stats.allocations, stats.frees), (1, 1));
        assert_eq!(stats.invalid_releases, 0);
    }

    #[test]
    fn test_explicit_free() {
        let (mock, ctx) = setup();
        let buf = DeviceBuffer::<u16>::new(&ctx, 8).unwrap();
        buf.free().unwrap();
        assert_eq!(mock.live_allocations(), 0);
        assert_eq!(mock.stats().frees, 1);
    }

    #[test]
    fn test_free_failure_is_reported() {
        let (mock, ctx) = setup();
        let buf = DeviceBuffer::<u16>::new(&ctx, 8).unwrap();
        mock.fail_next("cuMemFree", CUDA_ERROR_INVALID_CONTEXT);
        let err = buf.free().unwrap_err();
        assert!(matches!(err, CudaError::Driver { call: "cuMemFree", .. }));
    }

    #[test]
    fn test_upload_lands_in_device_memory() {
        let (mock, ctx) = setup();
        let buf = DeviceBuffer::from_slice(&ctx, &[7i32, 8, 9]).unwrap();
        let seen = mock.with_memory(|mem| mem.read::<i32>(buf.device_ptr(), 3));
        assert_eq!(seen, Some(vec![7, 8, 9]));
    }
}
