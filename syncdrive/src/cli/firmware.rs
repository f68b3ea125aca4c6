/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs, path::PathBuf, sync::atomic::AtomicBool};

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::{cli::status, firmware::FirmwareStager};

pub fn firmware_main(cli: &FirmwareCli, cancel_signal: &AtomicBool) -> Result<()> {
    let data = fs::read(&cli.input)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.input))?;

    let name = match &cli.name {
        Some(name) => name.clone(),
        None => cli
            .input
            .file_name()
            .context("Input path has no filename")?
            .to_string_lossy()
            .into_owned(),
    };

    let mut stager = FirmwareStager::new(&cli.staging, &cli.installed)?;

    if !stager.receive(&name, &data) {
        bail!("Failed to stage firmware: {name}");
    }

    if !stager.verify(&name, &cli.sha256, cancel_signal) {
        bail!("Digest verification failed: {name}");
    }

    status!("Verified {name}");

    if cli.no_apply {
        return Ok(());
    }

    if !stager.apply(&name) {
        bail!("Failed to apply firmware: {name}");
    }

    status!("Applied {name}");

    Ok(())
}

/// Stage a firmware package, verify its digest, and apply it.
#[derive(Debug, Parser)]
pub struct FirmwareCli {
    /// Path to firmware package.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Name to install as (default: input filename).
    #[arg(short, long, value_name = "NAME")]
    name: Option<String>,

    /// Expected SHA-256 digest (64 lowercase hex characters).
    #[arg(short, long, value_name = "HEX")]
    sha256: String,

    /// Staging directory.
    #[arg(long, value_name = "DIR", default_value = "/var/syncdrive/firmware/staging")]
    staging: PathBuf,

    /// Installed directory.
    #[arg(long, value_name = "DIR", default_value = "/var/syncdrive/firmware/installed")]
    installed: PathBuf,

    /// Stop after verification without applying.
    #[arg(long)]
    no_apply: bool,
}
