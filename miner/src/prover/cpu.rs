use std::{
    fmt::Write,
    ops::RangeInclusive,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Instant,
};

use md5::{Digest, Md5};
use shared::block::{digest_matches, final_hash};
use tracing::*;

use super::{Outcome, Prover};
use crate::cancel::CancelToken;

/// Nonces handed to a thread at a time. Blocks are claimed in ascending order.
const BLOCK_SIZE: u64 = 1 << 16;

/// Hashes between two checks of the cancel token.
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Multi-threaded MD5 search.
///
/// The range is cut into consecutive blocks claimed from a shared counter.
/// A thread stops its block at the first hit and records it with
/// `fetch_min`; blocks starting past the best hit are never claimed. Every
/// block below the winner is therefore searched in full, so the result is
/// always the smallest matching nonce regardless of thread scheduling.
pub struct CpuProver {
    cores: usize,
}

impl CpuProver {
    pub fn new(cores: usize) -> Self {
        Self {
            cores: cores.max(1),
        }
    }
}

struct Search<'a> {
    challenge: &'a str,
    content_hash: &'a str,
    start: u64,
    end: u64,
    total_blocks: u64,
    next_block: AtomicU64,
    best: AtomicU64,
    hashes: AtomicU64,
    cancelled: AtomicBool,
    cancel: &'a CancelToken,
}

impl Search<'_> {
    fn run(&self, cid: usize) {
        let mut input = String::with_capacity(self.content_hash.len() + 20);
        let mut hashes = 0u64;

        loop {
            let block = self.next_block.fetch_add(1, Ordering::SeqCst);
            if block >= self.total_blocks {
                break;
            }
            let block_start = self.start + block * BLOCK_SIZE;
            if block_start > self.best.load(Ordering::SeqCst) {
                break;
            }
            let block_end = block_start.saturating_add(BLOCK_SIZE - 1).min(self.end);

            let mut nonce = block_start;
            loop {
                if (nonce - block_start) % CANCEL_CHECK_INTERVAL == 0 {
                    if self.cancelled.load(Ordering::Relaxed) {
                        break;
                    }
                    if self.cancel.is_cancelled() {
                        self.cancelled.store(true, Ordering::SeqCst);
                        break;
                    }
                    // a lower block already produced a hit
                    if nonce > self.best.load(Ordering::Relaxed) {
                        break;
                    }
                }

                input.clear();
                let _ = write!(input, "{nonce}{}", self.content_hash);
                let digest = Md5::digest(input.as_bytes());
                hashes += 1;

                if digest_matches(&digest, self.challenge) {
                    self.best.fetch_min(nonce, Ordering::SeqCst);
                    break;
                }
                if nonce >= block_end {
                    break;
                }
                nonce += 1;
            }

            if self.cancelled.load(Ordering::Relaxed) {
                break;
            }
        }

        trace!("core: {cid}, hashes: {hashes}");
        self.hashes.fetch_add(hashes, Ordering::Relaxed);
    }
}

impl Prover for CpuProver {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn search(
        &self,
        challenge: &str,
        content_hash: &str,
        range: RangeInclusive<u64>,
        cancel: &CancelToken,
    ) -> Outcome {
        let (start, end) = range.into_inner();
        if start > end {
            return Outcome::NotFound;
        }

        let search = Search {
            challenge,
            content_hash,
            start,
            end,
            total_blocks: (end - start) / BLOCK_SIZE + 1,
            next_block: AtomicU64::new(0),
            best: AtomicU64::new(u64::MAX),
            hashes: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            cancel,
        };

        let threads = (self.cores as u64).min(search.total_blocks) as usize;
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let timer = Instant::now();

        std::thread::scope(|scope| {
            for cid in 0..threads {
                let search = &search;
                let core = core_ids.get(cid).copied();
                scope.spawn(move || {
                    // bound thread to core
                    if let Some(core) = core {
                        let _ = core_affinity::set_for_current(core);
                    }
                    search.run(cid);
                });
            }
        });

        let elapsed = timer.elapsed().as_secs_f64();
        let hashes = search.hashes.load(Ordering::Relaxed);
        if elapsed > 0.0 {
            debug!("mining power: {:.2} H/s", hashes as f64 / elapsed);
        }

        if search.cancelled.load(Ordering::SeqCst) {
            return Outcome::Cancelled;
        }
        match search.best.load(Ordering::SeqCst) {
            u64::MAX => Outcome::NotFound,
            nonce => Outcome::Found {
                nonce,
                hash: final_hash(nonce, content_hash),
            },
        }
    }
}
