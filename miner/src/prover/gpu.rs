use std::{
    io::{self, BufRead, BufReader},
    ops::RangeInclusive,
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use shared::block::final_hash;
use thiserror::Error;
use tracing::*;

use super::{Outcome, Prover};
use crate::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
// how long to wait for the tail of stdout once the child is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);

// output lines of the md5_cuda binary
const NONCE_MARKER: &str = "Nonce encontrado:";
const HASH_MARKER: &str = "Hash resultante:";

#[derive(Debug, Error)]
pub enum ProverError {
    #[error("fail to spawn {path}: {source}")]
    Spawn { path: String, source: io::Error },
    #[error("fail to wait for child: {0}")]
    Wait(io::Error),
    #[error("no solution in output")]
    NoSolution,
    #[error("reported nonce {0} is outside the assigned range")]
    OutOfRange(u64),
    #[error("reported hash {reported} does not verify (expected {expected})")]
    Mismatch { reported: String, expected: String },
}

/// Runs the external CUDA search binary for the assigned range:
/// `md5_cuda <challenge> <content_hash> <from> <to>`.
pub struct GpuProver {
    binary: PathBuf,
}

impl GpuProver {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn spawn(&self, challenge: &str, content_hash: &str, range: &RangeInclusive<u64>) -> Result<Child, ProverError> {
        let mut command = Command::new(&self.binary);
        command
            .arg(challenge)
            .arg(content_hash)
            .arg(range.start().to_string())
            .arg(range.end().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        // own process group, so wrappers and their descendants die together
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        command.spawn().map_err(|source| ProverError::Spawn {
            path: self.binary.display().to_string(),
            source,
        })
    }
}

/// Kill the child's whole process group.
#[cfg(unix)]
fn kill_group(child: &mut Child) {
    use nix::{
        errno::Errno,
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    match killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            debug!("killpg {}: {err}", child.id());
            let _ = child.kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}

/// Kill and reap, so no zombie or orphan outlives the search.
fn terminate(child: &mut Child) {
    kill_group(child);
    if let Err(err) = child.wait() {
        error!("fail to reap child {}: {err}", child.id());
    }
}

/// Stream stdout lines from a helper thread so a chatty binary never blocks
/// on a full pipe.
fn collect_stdout(child: &mut Child) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    rx
}

/// Gather what the reader has seen, waiting at most `grace` for the pipe to
/// close. A descendant that escaped the group may hold it open forever.
fn drain(lines: &Receiver<String>, grace: Duration) -> String {
    let deadline = Instant::now() + grace;
    let mut out = String::new();
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match lines.recv_timeout(timeout) {
            Ok(line) => {
                out.push_str(&line);
                out.push('\n');
            }
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                debug!("stdout still open after child exit");
                break;
            }
        }
    }
    out
}

fn parse_output(stdout: &str) -> Option<(u64, String)> {
    let mut nonce = None;
    let mut hash = None;
    for line in stdout.lines() {
        if let Some((_, rest)) = line.split_once(NONCE_MARKER) {
            nonce = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok());
        }
        if let Some((_, rest)) = line.split_once(HASH_MARKER) {
            hash = rest
                .split_whitespace()
                .next()
                .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_hexdigit()))
                .map(str::to_ascii_lowercase);
        }
    }
    Some((nonce?, hash?))
}

/// Check a reported solution instead of trusting the binary.
fn verify(
    stdout: &str,
    challenge: &str,
    content_hash: &str,
    range: &RangeInclusive<u64>,
) -> Result<(u64, String), ProverError> {
    let (nonce, reported) = parse_output(stdout).ok_or(ProverError::NoSolution)?;
    if !range.contains(&nonce) {
        return Err(ProverError::OutOfRange(nonce));
    }
    let expected = final_hash(nonce, content_hash);
    if reported != expected || !expected.starts_with(challenge) {
        return Err(ProverError::Mismatch { reported, expected });
    }
    Ok((nonce, expected))
}

impl Prover for GpuProver {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn search(
        &self,
        challenge: &str,
        content_hash: &str,
        range: RangeInclusive<u64>,
        cancel: &CancelToken,
    ) -> Outcome {
        if !self.binary.exists() {
            error!("cuda executable not found at {}", self.binary.display());
            return Outcome::Unavailable;
        }

        let mut child = match self.spawn(challenge, content_hash, &range) {
            Ok(child) => child,
            Err(err) => {
                error!("{err}");
                return Outcome::Unavailable;
            }
        };
        debug!("gpu search started, pid: {}, range: {range:?}", child.id());
        let reader = collect_stdout(&mut child);

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    // background helpers of a wrapper go with it
                    kill_group(&mut child);
                    let stdout = drain(&reader, DRAIN_GRACE);
                    if !status.success() {
                        warn!("cuda binary exited with {status}");
                    }
                    return match verify(&stdout, challenge, content_hash, &range) {
                        Ok((nonce, hash)) => Outcome::Found { nonce, hash },
                        Err(ProverError::NoSolution) => Outcome::NotFound,
                        Err(err) => {
                            warn!("discarding gpu result: {err}");
                            Outcome::NotFound
                        }
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    error!("{}", ProverError::Wait(err));
                    terminate(&mut child);
                    return Outcome::NotFound;
                }
            }

            if cancel.is_cancelled() {
                debug!("cancelling gpu search, pid: {}", child.id());
                terminate(&mut child);
                return Outcome::Cancelled;
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// `nvidia-smi` exiting successfully is taken as a usable NVIDIA GPU.
pub fn detect_gpu() -> bool {
    match Command::new("nvidia-smi").stdout(Stdio::null()).stderr(Stdio::null()).status() {
        Ok(status) if status.success() => {
            info!("NVIDIA GPU detected and nvidia-smi is available");
            true
        }
        Ok(status) => {
            info!("nvidia-smi exited with {status}, no usable GPU");
            false
        }
        Err(err) => {
            info!("no NVIDIA GPU detected ({err})");
            false
        }
    }
}
