//! End-to-end wrapper behaviour against the in-process driver.

use std::sync::Arc;

use cuscope::driver::ffi::{CUDA_ERROR_INVALID_VALUE, CUDA_SUCCESS};
use cuscope::mock::{KernelLaunch, MockDriver, MockImage, MockMemory};
use cuscope::{CudaError, DeviceBuffer, DeviceContext, KernelArgs, LaunchConfig, ProgramModule};

const IMAGE_PATH: &str = "kernels/add_kernel.ptx";

/// `c[i] = a[i] + b[i]` for every launched thread below `n`.
fn add_kernel(mem: &mut MockMemory, launch: &KernelLaunch<'_>) -> i32 {
    if launch.num_params() != 4 {
        return CUDA_ERROR_INVALID_VALUE;
    }
    let (a, b, c, n) = unsafe {
        match (
            launch.param::<u64>(0),
            launch.param::<u64>(1),
            launch.param::<u64>(2),
            launch.param::<i32>(3),
        ) {
            (Some(a), Some(b), Some(c), Some(n)) => (a, b, c, n),
            _ => return CUDA_ERROR_INVALID_VALUE,
        }
    };
    let n = (n.max(0) as usize).min(launch.threads());
    let (Some(a), Some(b)) = (mem.read::<f32>(a, n), mem.read::<f32>(b, n)) else {
        return CUDA_ERROR_INVALID_VALUE;
    };
    let sum: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
    if mem.write(c, &sum) { CUDA_SUCCESS } else { CUDA_ERROR_INVALID_VALUE }
}

fn gpu() -> Arc<MockDriver> {
    let image = MockImage::new().kernel("addKernel", add_kernel);
    Arc::new(MockDriver::new(1).with_image_file(IMAGE_PATH, image))
}

#[test]
fn vector_add_end_to_end() {
    let mock = gpu();
    cuscope::driver::init(&*mock).unwrap();

    {
        let ctx = DeviceContext::new(mock.clone(), 0).unwrap();
        let host: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let a = DeviceBuffer::from_slice(&ctx, &host).unwrap();
        let b = DeviceBuffer::from_slice(&ctx, &host).unwrap();
        let c = DeviceBuffer::<f32>::new(&ctx, 10).unwrap();
        let n = 10i32;

        let kernel = ProgramModule::new(&ctx, IMAGE_PATH, "addKernel").unwrap();
        let mut args = KernelArgs::new().buffer(&a).buffer(&b).buffer(&c).value(&n);
        let config = LaunchConfig::new((1, 1, 1), (10, 1, 1));
        unsafe { kernel.launch(config, &mut args).unwrap() };

        let result = c.to_vec().unwrap();
        let expected: Vec<f32> = (0..10).map(|i| (2 * i) as f32).collect();
        assert_eq!(result, expected);
    }

    let stats = mock.stats();
    assert_eq!(stats.contexts_created, 1);
    assert_eq!(stats.contexts_destroyed, 1);
    assert_eq!((stats.allocations, stats.frees), (3, 3));
    assert_eq!((stats.modules_loaded, stats.modules_unloaded), (1, 1));
    assert_eq!(stats.launches, 1);
    assert_eq!(stats.invalid_releases, 0);
    assert_eq!(mock.stack_depth(), 0);
}

#[test]
fn explicit_reverse_order_release_reports_success() {
    let mock = gpu();
    cuscope::driver::init(&*mock).unwrap();

    let ctx = DeviceContext::new(mock.clone(), 0).unwrap();
    let a = DeviceBuffer::from_slice(&ctx, &[1.0f32; 4]).unwrap();
    let b = DeviceBuffer::from_slice(&ctx, &[2.0f32; 4]).unwrap();
    let kernel = ProgramModule::new(&ctx, IMAGE_PATH, "addKernel").unwrap();

    kernel.unload().unwrap();
    b.free().unwrap();
    a.free().unwrap();
    ctx.close().unwrap();

    assert_eq!(mock.live_contexts(), 0);
    assert_eq!(mock.live_allocations(), 0);
    assert_eq!(mock.live_modules(), 0);
    assert_eq!(mock.stats().invalid_releases, 0);
}

#[test]
fn driver_must_be_initialized_first() {
    let mock = gpu();
    let err = DeviceContext::new(mock.clone(), 0).unwrap_err();
    let status = err.status().unwrap();
    assert_eq!(status.name, "CUDA_ERROR_NOT_INITIALIZED");
    assert_eq!(status.message, "initialization error");
}

#[test]
fn missing_device_is_reported_with_count() {
    let mock = gpu();
    cuscope::driver::init(&*mock).unwrap();
    let err = DeviceContext::new(mock, 1).unwrap_err();
    assert!(matches!(err, CudaError::DeviceUnavailable { requested: 1, available: 1 }));
    assert_eq!(err.to_string(), "device 1 is not available (1 device(s) found)");
}

#[test]
fn short_launch_leaves_tail_untouched() {
    let mock = gpu();
    cuscope::driver::init(&*mock).unwrap();

    let ctx = DeviceContext::new(mock.clone(), 0).unwrap();
    let a = DeviceBuffer::from_slice(&ctx, &[1.0f32; 8]).unwrap();
    let b = DeviceBuffer::from_slice(&ctx, &[1.0f32; 8]).unwrap();
    let mut c = DeviceBuffer::<f32>::new(&ctx, 8).unwrap();
    c.copy_from_host(&[-1.0; 8]).unwrap();
    let n = 8i32;

    let kernel = ProgramModule::new(&ctx, IMAGE_PATH, "addKernel").unwrap();
    let mut args = KernelArgs::new().buffer(&a).buffer(&b).buffer(&c).value(&n);
    // Four threads cover only the first half.
    unsafe { kernel.launch(LaunchConfig::grid_1d(4, 4), &mut args).unwrap() };
    ctx.synchronize().unwrap();

    assert_eq!(c.to_vec().unwrap(), vec![2.0, 2.0, 2.0, 2.0, -1.0, -1.0, -1.0, -1.0]);
}

#[test]
fn contexts_on_separate_threads_are_independent() {
    let mock = Arc::new(MockDriver::initialized(2));

    let handles: Vec<_> = (0..2)
        .map(|ordinal| {
            let mock = mock.clone();
            std::thread::spawn(move || {
                let ctx = DeviceContext::new(mock.clone(), ordinal).unwrap();
                assert_eq!(mock.stack_depth(), 1);
                let buf = DeviceBuffer::from_slice(&ctx, &[ordinal as u32; 16]).unwrap();
                buf.to_vec().unwrap()
            })
        })
        .collect();

    for (ordinal, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), vec![ordinal as u32; 16]);
    }
    assert_eq!(mock.live_contexts(), 0);
    assert_eq!(mock.stats().invalid_releases, 0);
}
