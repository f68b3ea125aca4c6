/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use crate::{
    cli::status,
    collect,
    config::Config,
    firmware::FirmwareStager,
    gadget::{GadgetConfig, LinuxBackend, UsbGadget},
    metadata::MetadataRegistry,
    serve::FileServer,
};

pub fn run_main(_cli: &RunCli, cancel_signal: &AtomicBool) -> Result<()> {
    let config = Config::from_env();

    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        warn!("Could not create log directory: {:?}: {e}", config.log_dir);
    }

    let mut server = FileServer::new(&config.log_dir);
    server.set_auth_token(&config.auth_token);
    if let Some(key) = &config.cipher_key {
        server.set_cipher_key(key);
        info!("Payload encryption enabled");
    }

    let stager = FirmwareStager::new(&config.firmware_staging_dir, &config.firmware_installed_dir)
        .context("Failed to initialize firmware stager")?;

    let registry = MetadataRegistry::new();

    let gadget_config = GadgetConfig {
        image_path: config.usb_image_path.clone(),
        mount_point: config.usb_mount_point.clone(),
        image_size_mib: config.usb_image_size_mib,
        ..Default::default()
    };
    let mut usb = UsbGadget::new(LinuxBackend, gadget_config);

    let mut usb_ready = false;
    if config.usb_enabled {
        usb_ready = usb.init();
        if !usb_ready {
            warn!("USB gadget init failed; continuing Wi-Fi only");
        }
    }

    status!("syncdrive agent ready");
    info!("Log dir: {:?}", config.log_dir);
    info!("Firmware staging: {:?}", config.firmware_staging_dir);
    info!("Firmware installed: {:?}", config.firmware_installed_dir);
    info!("Poll interval: {}s", config.poll_interval_secs);
    info!(
        "USB gadget: {}",
        if usb_ready { "enabled" } else { "disabled" },
    );
    info!(
        "Registered device parsers: {}",
        registry.registered_types().join(", "),
    );

    while !cancel_signal.load(Ordering::SeqCst) {
        let logs = collect::collect_logs(&config.log_dir, true);
        let total_bytes = logs.iter().map(|l| l.size).sum::<u64>();
        let servable = server.file_list();

        info!(
            "{} logs ({total_bytes} bytes), {} files servable",
            logs.len(),
            servable.len(),
        );

        if usb_ready && !logs.is_empty() {
            let mut usb_files = logs
                .iter()
                .map(|log| (log.path.clone(), log.name.clone()))
                .collect::<Vec<_>>();

            // Installed firmware rides along under a firmware/ prefix.
            for entry in collect::collect_logs(stager.installed_dir(), false) {
                usb_files.push((entry.path, format!("firmware/{}", entry.name)));
            }

            if usb.is_exposed() {
                // Full cycle: unexpose, rewrite, re-expose.
                usb.refresh(&usb_files);
            } else {
                // First time around there is nothing stale to disconnect.
                usb.prepare_image(&usb_files);
                usb.expose();
            }

            info!("USB gadget state: {}", usb.state());
        }

        // Sleep in 1 s increments so shutdown stays responsive.
        for _ in 0..config.poll_interval_secs {
            if cancel_signal.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    if usb_ready {
        usb.cleanup();
    }

    status!("Shutting down");

    Ok(())
}

/// Run the sync agent: collect logs, keep the USB pendrive contents fresh,
/// and serve the Wi-Fi boundary until interrupted.
#[derive(Debug, Parser)]
pub struct RunCli {}
