use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cuscope::{CudaError, DeviceBuffer, DeviceContext, KernelArgs, LaunchConfig, ProgramModule};

#[derive(Parser)]
#[command(
    name = "vecadd",
    about = "Add two vectors on a CUDA device",
    long_about = "Adds a = b = [0, 1, ..., len-1] element-wise on the GPU with a\nprecompiled kernel, checks the result on the host and prints one value per line.",
    version
)]
struct Cli {
    /// Device ordinal to run on
    #[arg(long, env = "CUSCOPE_DEVICE", default_value_t = 0)]
    device: usize,

    /// Compiled program image (PTX, cubin or fatbin)
    #[arg(long, env = "CUSCOPE_IMAGE", default_value = "kernels/add_kernel.ptx")]
    image: PathBuf,

    /// Entry point to launch
    #[arg(long, env = "CUSCOPE_KERNEL", default_value = "addKernel")]
    kernel: String,

    /// Number of elements per vector
    #[arg(long, env = "CUSCOPE_LEN", default_value_t = 10)]
    len: usize,

    /// Threads per block (clamped to the element count)
    #[arg(long, env = "CUSCOPE_BLOCK", default_value_t = 256)]
    block: usize,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Cuda(#[from] CudaError),
    #[error("--len {0} does not fit the kernel's int count")]
    TooLong(usize),
    #[error("result mismatch at {index}: expected {expected}, got {actual}")]
    Mismatch { index: usize, expected: f32, actual: f32 },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&cli) {
        Ok(values) => {
            for v in values {
                println!("{}", v);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("vecadd: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<Vec<f32>, RunError> {
    let n = i32::try_from(cli.len).map_err(|_| RunError::TooLong(cli.len))?;

    let driver = cuscope::driver::load()?;
    let ctx = DeviceContext::new(driver, cli.device)?;
    info!("using device {} ({})", ctx.ordinal(), ctx.device_name()?);

    let host: Vec<f32> = (0..cli.len).map(|i| i as f32).collect();
    let a = DeviceBuffer::from_slice(&ctx, &host)?;
    let b = DeviceBuffer::from_slice(&ctx, &host)?;
    let c = DeviceBuffer::<f32>::new(&ctx, cli.len)?;

    let kernel = ProgramModule::new(&ctx, &cli.image, &cli.kernel)?;
    let config = LaunchConfig::grid_1d(cli.len, cli.block.min(cli.len));
    info!("launching {} with grid {:?} block {:?}", cli.kernel, config.grid_dim, config.block_dim);

    let mut args = KernelArgs::new().buffer(&a).buffer(&b).buffer(&c).value(&n);
    // addKernel(const float*, const float*, float*, int) matches the list above.
    unsafe { kernel.launch(config, &mut args)? };

    let result = c.to_vec()?;
    verify(&host, &host, &result)?;
    Ok(result)
}

fn verify(a: &[f32], b: &[f32], c: &[f32]) -> Result<(), RunError> {
    for (index, ((x, y), &actual)) in a.iter().zip(b).zip(c).enumerate() {
        let expected = x + y;
        if actual != expected {
            return Err(RunError::Mismatch { index, expected, actual });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["vecadd"]);
        assert_eq!(cli.device, 0);
        assert_eq!(cli.image, PathBuf::from("kernels/add_kernel.ptx"));
        assert_eq!(cli.kernel, "addKernel");
        assert_eq!(cli.len, 10);
        assert_eq!(cli.block, 256);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from(["vecadd", "--device", "1", "--len", "4096", "-vv"]);
        assert_eq!(cli.device, 1);
        assert_eq!(cli.len, 4096);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_verify() {
        let a = [0.0, 1.0, 2.0];
        assert!(verify(&a, &a, &[0.0, 2.0, 4.0]).is_ok());
        match verify(&a, &a, &[0.0, 2.0, 5.0]) {
            Err(RunError::Mismatch { index, expected, actual }) => {
                assert_eq!(index, 2);
                assert_eq!(expected, 4.0);
                assert_eq!(actual, 5.0);
            }
            other => panic!("expected a mismatch, got {:?}", other),
        }
    }
}
