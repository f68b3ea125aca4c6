// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Chunked byte-stream copying with offset-based resume, progress reporting,
//! and caller-orchestrated retry. The transfer itself never retries
//! internally; wrap an operation in [`TransferEngine::retry_with_backoff`]
//! where that behavior is wanted.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_CHUNK_SIZE: usize = 65536;

#[derive(Clone, Debug, Default)]
pub struct TransferResult {
    pub success: bool,
    pub error_message: String,
    pub bytes_transferred: u64,
    pub bytes_per_second: f64,
}

impl TransferResult {
    fn failure(message: String) -> Self {
        Self {
            success: false,
            error_message: message,
            ..Default::default()
        }
    }
}

struct PartialTransfer {
    dest_path: PathBuf,
    bytes_completed: u64,
}

pub type ProgressCallback = Box<dyn FnMut(f64) + Send>;

pub struct TransferEngine {
    max_retries: u32,
    base_backoff_ms: u64,
    chunk_size: usize,
    progress_callback: Option<ProgressCallback>,
    partial_transfers: BTreeMap<PathBuf, PartialTransfer>,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_callback: None,
            partial_transfers: BTreeMap::new(),
        }
    }
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_max_retries(&mut self, retries: u32) {
        self.max_retries = retries;
    }

    pub fn set_base_backoff_ms(&mut self, ms: u64) {
        self.base_backoff_ms = ms;
    }

    pub fn set_chunk_size(&mut self, bytes: usize) {
        self.chunk_size = bytes;
    }

    /// Register a progress callback. It receives a percentage in [0, 100]
    /// after every chunk, computed only when the total size is known.
    pub fn on_progress(&mut self, callback: impl FnMut(f64) + Send + 'static) {
        self.progress_callback = Some(Box::new(callback));
    }

    /// Copy `src` to `dst` from the beginning.
    pub fn transfer(&mut self, src: &Path, dst: &Path, cancel_signal: &AtomicBool) -> TransferResult {
        self.transfer_with_offset(src, dst, 0, cancel_signal)
    }

    /// Copy `src` to `dst`, skipping the first `offset` bytes of the source.
    /// With a non-zero offset, the destination is opened in append mode on
    /// the assumption that it already holds the skipped prefix; otherwise it
    /// is truncated.
    pub fn transfer_with_offset(
        &mut self,
        src: &Path,
        dst: &Path,
        offset: u64,
        cancel_signal: &AtomicBool,
    ) -> TransferResult {
        let total_size = match fs::metadata(src) {
            Ok(m) => m.len(),
            Err(e) => {
                return TransferResult::failure(format!("Source file not found: {src:?}: {e}"));
            }
        };

        let mut reader = match File::open(src) {
            Ok(f) => f,
            Err(e) => {
                return TransferResult::failure(format!("Cannot open source file: {src:?}: {e}"));
            }
        };

        if offset > 0 {
            if let Err(e) = reader.seek(SeekFrom::Start(offset)) {
                return TransferResult::failure(format!("Cannot seek source file: {src:?}: {e}"));
            }
        }

        let dst_result = if offset > 0 {
            OpenOptions::new().append(true).create(true).open(dst)
        } else {
            File::create(dst)
        };
        let mut writer = match dst_result {
            Ok(f) => f,
            Err(e) => {
                return TransferResult::failure(format!(
                    "Cannot open destination file: {dst:?}: {e}"
                ));
            }
        };

        let start_time = Instant::now();
        let mut bytes_written = offset;
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            if cancel_signal.load(Ordering::SeqCst) {
                return TransferResult::failure("Transfer cancelled".to_owned());
            }

            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    return TransferResult::failure(format!("Read error during transfer: {e}"));
                }
            };

            if let Err(e) = writer.write_all(&buf[..n]) {
                return TransferResult::failure(format!("Write error during transfer: {e}"));
            }

            bytes_written += n as u64;

            if let Some(callback) = &mut self.progress_callback {
                if total_size > 0 {
                    callback(bytes_written as f64 / total_size as f64 * 100.0);
                }
            }
        }

        let duration_ms = start_time.elapsed().as_millis();

        debug!("Transferred {bytes_written} bytes: {src:?} -> {dst:?}");

        TransferResult {
            success: true,
            error_message: String::new(),
            bytes_transferred: bytes_written,
            // A sub-millisecond transfer reports as if it took one second
            // rather than dividing by zero.
            bytes_per_second: if duration_ms > 0 {
                bytes_written as f64 / (duration_ms as f64 / 1000.0)
            } else {
                bytes_written as f64
            },
        }
    }

    /// Transfer multiple files sequentially. Best-effort: one failure does
    /// not abort the batch.
    pub fn transfer_batch(
        &mut self,
        pairs: &[(PathBuf, PathBuf)],
        cancel_signal: &AtomicBool,
    ) -> Vec<TransferResult> {
        pairs
            .iter()
            .map(|(src, dst)| {
                let result = self.transfer(src, dst, cancel_signal);
                if !result.success {
                    warn!("Batch transfer failed: {}", result.error_message);
                }
                result
            })
            .collect()
    }

    /// Record that a transfer completed `bytes_completed` bytes before being
    /// interrupted, so that a later [`Self::resume`] can pick it up.
    pub fn record_partial(&mut self, src: &Path, dst: &Path, bytes_completed: u64) {
        self.partial_transfers.insert(
            src.to_owned(),
            PartialTransfer {
                dest_path: dst.to_owned(),
                bytes_completed,
            },
        );
    }

    /// Resume a previously recorded transfer of `src`, consuming the record.
    /// Falls back to a fresh transfer if nothing was recorded.
    pub fn resume(&mut self, src: &Path, dst: &Path, cancel_signal: &AtomicBool) -> TransferResult {
        let Some(partial) = self.partial_transfers.remove(src) else {
            return self.transfer(src, dst, cancel_signal);
        };

        debug!(
            "Resuming transfer of {src:?} at byte {} (recorded destination {:?})",
            partial.bytes_completed, partial.dest_path,
        );

        self.transfer_with_offset(src, dst, partial.bytes_completed, cancel_signal)
    }

    /// Invoke `op` up to `max_retries` times, sleeping
    /// `base_backoff_ms * 2^attempt` between attempts. No sleep after the
    /// final failure.
    pub fn retry_with_backoff(&self, mut op: impl FnMut() -> bool) -> bool {
        for attempt in 0..self.max_retries {
            if op() {
                return true;
            }

            if attempt + 1 < self.max_retries {
                let backoff_ms = self.base_backoff_ms << attempt;
                debug!("Attempt {} failed; retrying in {backoff_ms} ms", attempt + 1);
                thread::sleep(Duration::from_millis(backoff_ms));
            }
        }

        false
    }
}
