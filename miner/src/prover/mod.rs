use std::{ops::RangeInclusive, path::Path, sync::Arc};

use serde::Deserialize;
use tracing::*;

use crate::cancel::CancelToken;

pub mod cpu;
pub mod gpu;

pub use cpu::CpuProver;
pub use gpu::{detect_gpu, GpuProver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Found { nonce: u64, hash: String },
    NotFound,
    Cancelled,
    /// The execution environment is missing, e.g. no GPU binary.
    Unavailable,
}

/// Searches a nonce range for `md5(nonce ++ content_hash)` starting with
/// `challenge`.
///
/// `search` blocks the calling thread. It must check `cancel` at least once
/// a second and must not leave threads or child processes behind once it
/// returns, whatever the outcome.
pub trait Prover: Send + Sync {
    fn name(&self) -> &'static str;

    fn search(
        &self,
        challenge: &str,
        content_hash: &str,
        range: RangeInclusive<u64>,
        cancel: &CancelToken,
    ) -> Outcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProverKind {
    /// GPU when `nvidia-smi` reports one, CPU otherwise.
    #[default]
    Auto,
    Gpu,
    Cpu,
}

pub fn select(kind: ProverKind, gpu_detected: bool, cuda_bin: &Path, cores: usize) -> Arc<dyn Prover> {
    let use_gpu = match kind {
        ProverKind::Auto => gpu_detected,
        ProverKind::Gpu => true,
        ProverKind::Cpu => false,
    };
    if use_gpu {
        info!("using gpu prover: {}", cuda_bin.display());
        Arc::new(GpuProver::new(cuda_bin.to_path_buf()))
    } else {
        info!("using cpu prover, threads: {cores}");
        Arc::new(CpuProver::new(cores))
    }
}
