//! Kernel launch shapes and argument lists.

use std::ffi::c_void;
use std::marker::PhantomData;

use bytemuck::Pod;

use crate::memory::DeviceBuffer;

/// Grid and block dimensions for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
}

impl LaunchConfig {
    pub fn new(grid_dim: (u32, u32, u32), block_dim: (u32, u32, u32)) -> Self {
        Self { grid_dim, block_dim }
    }

    /// One-dimensional launch covering `n` threads with `block_size` threads
    /// per block. Always at least one block of at least one thread.
    pub fn grid_1d(n: usize, block_size: usize) -> Self {
        let block = block_size.clamp(1, u32::MAX as usize);
        let grid = n.div_ceil(block).clamp(1, u32::MAX as usize);
        Self {
            grid_dim: (grid as u32, 1, 1),
            block_dim: (block as u32, 1, 1),
        }
    }

    /// Total threads the launch will start, saturating at `u64::MAX`.
    pub fn threads(&self) -> u64 {
        let (gx, gy, gz) = self.grid_dim;
        let (bx, by, bz) = self.block_dim;
        [gx, gy, gz, bx, by, bz]
            .iter()
            .fold(1u64, |acc, &d| acc.saturating_mul(d as u64))
    }

    pub(crate) fn grid(&self) -> [u32; 3] {
        [self.grid_dim.0, self.grid_dim.1, self.grid_dim.2]
    }

    pub(crate) fn block(&self) -> [u32; 3] {
        [self.block_dim.0, self.block_dim.1, self.block_dim.2]
    }
}

/// Kernel parameter list, built from typed values and buffers.
///
/// Each entry is a pointer to the argument value: for a buffer, to the
/// buffer's stored device address; for a scalar, to the scalar. The borrows
/// keep every pointee alive while the list exists. Order and types must match
/// the kernel's declared parameters; nothing here can check that.
#[derive(Debug, Default)]
pub struct KernelArgs<'a> {
    params: Vec<*mut c_void>,
    _borrows: PhantomData<&'a ()>,
}

impl<'a> KernelArgs<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass a device buffer (the kernel sees a `T*`).
    pub fn buffer<T: Pod>(mut self, buf: &'a DeviceBuffer<'_, T>) -> Self {
        let slot: *const u64 = buf.device_ptr_ref();
        self.params.push(slot as *mut c_void);
        self
    }

    /// Pass a scalar by value.
    pub fn value<T: Pod>(mut self, value: &'a T) -> Self {
        self.params.push(value as *const T as *mut c_void);
        self
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub(crate) fn as_params(&mut self) -> &mut [*mut c_void] {
        &mut self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_1d_rounds_up() {
        let cfg = LaunchConfig::grid_1d(1000, 256);
        assert_eq!(cfg.grid_dim, (4, 1, 1));
        assert_eq!(cfg.block_dim, (256, 1, 1));
        assert_eq!(cfg.threads(), 1024);
    }

    #[test]
    fn test_grid_1d_exact_and_degenerate() {
        assert_eq!(LaunchConfig::grid_1d(10, 10).grid_dim, (1, 1, 1));
        let empty = LaunchConfig::grid_1d(0, 0);
        assert_eq!(empty.grid_dim, (1, 1, 1));
        assert_eq!(empty.block_dim, (1, 1, 1));
    }

    #[test]
    fn test_grid_1d_huge_element_count() {
        let cfg = LaunchConfig::grid_1d(usize::MAX, 256);
        assert_eq!(cfg.grid_dim, (u32::MAX, 1, 1));
        assert_eq!(cfg.block_dim, (256, 1, 1));
        assert_eq!(cfg.threads(), u32::MAX as u64 * 256);

        let single = LaunchConfig::grid_1d(usize::MAX, 1);
        assert_eq!(single.grid_dim, (u32::MAX, 1, 1));
    }

    #[test]
    fn test_threads_saturates_at_max_dimensions() {
        let cfg = LaunchConfig::new((u32::MAX, u32::MAX, u32::MAX), (1024, 1, 1));
        assert_eq!(cfg.threads(), u64::MAX);
        let widest = LaunchConfig::new((u32::MAX, 1, 1), (u32::MAX, 1, 1));
        assert_eq!(widest.threads(), u32::MAX as u64 * u32::MAX as u64);
    }

    #[test]
    fn test_scalar_args_point_at_values() {
        let n: i32 = 10;
        let scale: f32 = 0.5;
        let mut args = KernelArgs::new().value(&n).value(&scale);
        assert_eq!(args.len(), 2);
        let params = args.as_params();
        assert_eq!(unsafe { *(params[0] as *const i32) }, 10);
        assert_eq!(unsafe { *(params[1] as *const f32) }, 0.5);
    }
}
