/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use crate::{
    cli::status,
    collect,
    config::Config,
    gadget::{GadgetConfig, LinuxBackend, UsbGadget},
};

fn gadget_from_env() -> UsbGadget<LinuxBackend> {
    let config = Config::from_env();

    let gadget_config = GadgetConfig {
        image_path: config.usb_image_path,
        mount_point: config.usb_mount_point,
        image_size_mib: config.usb_image_size_mib,
        ..Default::default()
    };

    UsbGadget::new(LinuxBackend, gadget_config)
}

fn init_subcommand(_cli: &InitCli) -> Result<()> {
    let mut gadget = gadget_from_env();

    if !gadget.init() {
        bail!("USB gadget initialization failed");
    }

    status!("USB gadget state: {}", gadget.state());

    Ok(())
}

fn refresh_subcommand(cli: &RefreshCli) -> Result<()> {
    let mut gadget = gadget_from_env();

    if !gadget.init() {
        bail!("USB gadget initialization failed");
    }

    let files = collect::collect_logs(&cli.source, true)
        .into_iter()
        .map(|log| (log.path, log.name))
        .collect::<Vec<_>>();

    if !gadget.prepare_image(&files) {
        bail!("Failed to prepare image");
    }

    if !gadget.expose() {
        bail!("Failed to expose gadget");
    }

    status!("Exposed {} files to the host", files.len());

    Ok(())
}

fn cleanup_subcommand(_cli: &CleanupCli) -> Result<()> {
    let mut gadget = gadget_from_env();

    gadget.cleanup();

    status!("USB gadget cleanup complete");

    Ok(())
}

pub fn usb_main(cli: &UsbCli) -> Result<()> {
    match &cli.command {
        UsbCommand::Init(c) => init_subcommand(c),
        UsbCommand::Refresh(c) => refresh_subcommand(c),
        UsbCommand::Cleanup(c) => cleanup_subcommand(c),
    }
}

/// Create the backing image and configfs gadget skeleton without exposing
/// anything to the host.
#[derive(Debug, Parser)]
struct InitCli {}

/// Write a directory's files into the image and expose it to the host.
#[derive(Debug, Parser)]
struct RefreshCli {
    /// Directory whose files become the drive contents.
    #[arg(short, long, value_name = "DIR", value_parser)]
    source: PathBuf,
}

/// Disconnect from the host and tear down the configfs gadget.
#[derive(Debug, Parser)]
struct CleanupCli {}

#[derive(Debug, Subcommand)]
enum UsbCommand {
    Init(InitCli),
    Refresh(RefreshCli),
    Cleanup(CleanupCli),
}

/// Manage the USB mass-storage gadget.
#[derive(Debug, Parser)]
pub struct UsbCli {
    #[command(subcommand)]
    command: UsbCommand,
}
