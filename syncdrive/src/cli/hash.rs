/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::{cli::status, digest};

fn digest_subcommand(cli: &DigestCli, cancel_signal: &AtomicBool) -> Result<()> {
    let digest = digest::hash_file(&cli.input, cancel_signal)
        .with_context(|| format!("Failed to hash file: {:?}", cli.input))?;

    println!("{}", hex::encode(digest));

    Ok(())
}

fn verify_subcommand(cli: &VerifyCli, cancel_signal: &AtomicBool) -> Result<()> {
    if !digest::verify_file(&cli.input, &cli.sha256, cancel_signal) {
        bail!("Digest mismatch: {:?}", cli.input);
    }

    status!("Digest OK: {:?}", cli.input);

    Ok(())
}

pub fn hash_main(cli: &HashCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        HashCommand::Digest(c) => digest_subcommand(c, cancel_signal),
        HashCommand::Verify(c) => verify_subcommand(c, cancel_signal),
    }
}

/// Print the SHA-256 digest of a file.
#[derive(Debug, Parser)]
struct DigestCli {
    /// Path to input file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Verify the SHA-256 digest of a file.
#[derive(Debug, Parser)]
struct VerifyCli {
    /// Path to input file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Expected digest (64 lowercase hex characters).
    #[arg(short, long, value_name = "HEX")]
    sha256: String,
}

#[derive(Debug, Subcommand)]
enum HashCommand {
    Digest(DigestCli),
    Verify(VerifyCli),
}

/// Hash and verify files.
#[derive(Debug, Parser)]
pub struct HashCli {
    #[command(subcommand)]
    command: HashCommand,
}
