#![recursion_limit = "256"]

#[cfg(any(
    feature = "ndarray",
    feature = "ndarray-blas-netlib",
    feature = "ndarray-blas-openblas",
    feature = "ndarray-blas-accelerate",
))]
mod ndarray {
    use burn::backend::{
        ndarray::{NdArray, NdArrayDevice},
        Autodiff,
    };
    use cnn_mnist::{cli::Cli, error::EstimatorError};

    pub fn run(cli: Cli) -> Result<(), EstimatorError> {
        let device = NdArrayDevice::Cpu;
        cnn_mnist::cli::execute::<Autodiff<NdArray>>(cli, device)
    }
}

#[cfg(feature = "tch-gpu")]
mod tch_gpu {
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };
    use cnn_mnist::{cli::Cli, error::EstimatorError};

    pub fn run(cli: Cli) -> Result<(), EstimatorError> {
        #[cfg(not(target_os = "macos"))]
        let device = LibTorchDevice::Cuda(0);
        #[cfg(target_os = "macos")]
        let device = LibTorchDevice::Mps;

        cnn_mnist::cli::execute::<Autodiff<LibTorch>>(cli, device)
    }
}

#[cfg(feature = "tch-cpu")]
mod tch_cpu {
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };
    use cnn_mnist::{cli::Cli, error::EstimatorError};

    pub fn run(cli: Cli) -> Result<(), EstimatorError> {
        let device = LibTorchDevice::Cpu;
        cnn_mnist::cli::execute::<Autodiff<LibTorch>>(cli, device)
    }
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use burn::backend::{
        wgpu::{Wgpu, WgpuDevice},
        Autodiff,
    };
    use cnn_mnist::{cli::Cli, error::EstimatorError};

    pub fn run(cli: Cli) -> Result<(), EstimatorError> {
        let device = WgpuDevice::default();
        cnn_mnist::cli::execute::<Autodiff<Wgpu>>(cli, device)
    }
}

use clap::Parser;
use cnn_mnist::{cli::Cli, error::EstimatorError, logger::install_logger};

#[allow(unreachable_code)]
fn run(cli: Cli) -> Result<(), EstimatorError> {
    #[cfg(any(
        feature = "ndarray",
        feature = "ndarray-blas-netlib",
        feature = "ndarray-blas-openblas",
        feature = "ndarray-blas-accelerate",
    ))]
    return ndarray::run(cli);
    #[cfg(feature = "tch-gpu")]
    return tch_gpu::run(cli);
    #[cfg(feature = "tch-cpu")]
    return tch_cpu::run(cli);
    #[cfg(feature = "wgpu")]
    return wgpu::run(cli);

    unreachable!("At least one backend will be selected.")
}

fn main() {
    let cli = Cli::parse();
    install_logger(&cli.model_dir);

    if let Err(err) = run(cli) {
        log::error!("{err}");
        std::process::exit(1);
    }
}
