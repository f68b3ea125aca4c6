// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Environment-variable configuration for the agent. Values that fail to
//! parse fall back to the defaults rather than aborting; the device should
//! come up in a usable state even with a mangled unit file.

use std::{env, path::PathBuf};

use tracing::warn;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_USB_IMAGE_SIZE_MIB: u64 = 64;

#[derive(Clone, Debug)]
pub struct Config {
    pub log_dir: PathBuf,
    pub firmware_staging_dir: PathBuf,
    pub firmware_installed_dir: PathBuf,
    pub auth_token: String,
    /// Decoded key bytes; `None` disables payload encryption.
    pub cipher_key: Option<Vec<u8>>,
    pub poll_interval_secs: u64,
    pub usb_enabled: bool,
    pub usb_image_path: PathBuf,
    pub usb_mount_point: PathBuf,
    pub usb_image_size_mib: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/var/syncdrive/logs"),
            firmware_staging_dir: PathBuf::from("/var/syncdrive/firmware/staging"),
            firmware_installed_dir: PathBuf::from("/var/syncdrive/firmware/installed"),
            auth_token: "changeme".to_owned(),
            cipher_key: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            usb_enabled: true,
            usb_image_path: PathBuf::from("/var/syncdrive/usb/drive.img"),
            usb_mount_point: PathBuf::from("/var/syncdrive/usb/mnt"),
            usb_image_size_mib: DEFAULT_USB_IMAGE_SIZE_MIB,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            log_dir: env_path("SYNCDRIVE_LOG_DIR", defaults.log_dir),
            firmware_staging_dir: env_path("SYNCDRIVE_FW_STAGING", defaults.firmware_staging_dir),
            firmware_installed_dir: env_path(
                "SYNCDRIVE_FW_INSTALL",
                defaults.firmware_installed_dir,
            ),
            auth_token: env_or("SYNCDRIVE_AUTH_TOKEN").unwrap_or(defaults.auth_token),
            cipher_key: env_or("SYNCDRIVE_ENC_KEY").map(|raw| decode_key(&raw)),
            poll_interval_secs: env_parse("SYNCDRIVE_POLL_INTERVAL", defaults.poll_interval_secs),
            usb_enabled: env_or("SYNCDRIVE_USB_GADGET").map_or(defaults.usb_enabled, |v| v == "1"),
            usb_image_path: env_path("SYNCDRIVE_USB_IMAGE", defaults.usb_image_path),
            usb_mount_point: env_path("SYNCDRIVE_USB_MOUNT", defaults.usb_mount_point),
            usb_image_size_mib: env_parse("SYNCDRIVE_USB_SIZE_MB", defaults.usb_image_size_mib),
        }
    }
}

fn env_or(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_path(name: &str, default: PathBuf) -> PathBuf {
    env_or(name).map_or(default, PathBuf::from)
}

fn env_parse(name: &str, default: u64) -> u64 {
    let Some(raw) = env_or(name) else {
        return default;
    };

    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!("Invalid value for {name}: {raw:?}; using {default}");
            default
        }
    }
}

/// Keys are normally supplied as hex. A value that isn't valid hex is taken
/// as raw key bytes, which keeps short ad-hoc tokens working.
fn decode_key(raw: &str) -> Vec<u8> {
    match hex::decode(raw) {
        Ok(bytes) => bytes,
        Err(_) => raw.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::decode_key;

    #[test]
    fn key_decoding() {
        assert_eq!(decode_key("00ff"), vec![0x00, 0xff]);
        // Not hex: used verbatim.
        assert_eq!(decode_key("hunter2!"), b"hunter2!");
    }
}
