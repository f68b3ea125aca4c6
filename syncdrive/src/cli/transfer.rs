/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{bail, Result};
use clap::Parser;
use tracing::debug;

use crate::{
    cli::status,
    transfer::{TransferEngine, DEFAULT_CHUNK_SIZE},
};

pub fn transfer_main(cli: &TransferCli, cancel_signal: &AtomicBool) -> Result<()> {
    let mut engine = TransferEngine::new();
    engine.set_chunk_size(cli.chunk_size);

    let mut last_percent = -1i64;
    engine.on_progress(move |percent| {
        let rounded = percent as i64;
        if rounded > last_percent {
            last_percent = rounded;
            debug!("Progress: {percent:.1}%");
        }
    });

    let result = match cli.offset {
        Some(offset) => engine.transfer_with_offset(&cli.input, &cli.output, offset, cancel_signal),
        None => engine.transfer(&cli.input, &cli.output, cancel_signal),
    };

    if !result.success {
        bail!("{}", result.error_message);
    }

    status!(
        "Transferred {} bytes ({:.0} bytes/s)",
        result.bytes_transferred,
        result.bytes_per_second,
    );

    Ok(())
}

/// Copy a file in chunks, optionally resuming at a byte offset.
#[derive(Debug, Parser)]
pub struct TransferCli {
    /// Path to source file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to destination file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Resume from this byte offset (destination must already hold the
    /// prefix).
    #[arg(long, value_name = "BYTES")]
    offset: Option<u64>,

    /// Chunk size in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
}
