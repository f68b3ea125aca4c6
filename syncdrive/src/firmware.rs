// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Two-stage firmware promotion. A package lands in the staging directory,
//! must have its SHA-256 verified against an out-of-band digest, and only
//! then can be copied into the installed directory. The gate makes it
//! impossible to install bytes that were never hashed.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::digest;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to create firmware directory: {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FirmwareStatus {
    #[default]
    NotFound,
    Received,
    Verified,
    Applied,
    Failed,
}

/// Staging-to-installed promotion of named firmware blobs.
///
/// Filenames are treated as opaque leaf path components. The serving boundary
/// is responsible for rejecting unsafe names before they get here.
///
/// The status map is process-lifetime only. Nothing is persisted besides the
/// two directories.
#[derive(Debug)]
pub struct FirmwareStager {
    staging_dir: PathBuf,
    installed_dir: PathBuf,
    statuses: BTreeMap<String, FirmwareStatus>,
}

impl FirmwareStager {
    /// Create a stager over the two directories, creating them if absent.
    /// Failure to create either is fatal.
    pub fn new(staging_dir: impl Into<PathBuf>, installed_dir: impl Into<PathBuf>) -> Result<Self> {
        let staging_dir = staging_dir.into();
        let installed_dir = installed_dir.into();

        for dir in [&staging_dir, &installed_dir] {
            fs::create_dir_all(dir).map_err(|e| Error::CreateDir {
                path: dir.clone(),
                source: e,
            })?;
        }

        Ok(Self {
            staging_dir,
            installed_dir,
            statuses: BTreeMap::new(),
        })
    }

    pub fn installed_dir(&self) -> &Path {
        &self.installed_dir
    }

    /// Write firmware bytes under the staging directory. Empty data fails.
    /// Overwrites any previous package of the same name, including one in the
    /// `Failed` state.
    pub fn receive(&mut self, name: &str, data: &[u8]) -> bool {
        if data.is_empty() {
            warn!("Rejecting empty firmware package: {name}");
            self.statuses.insert(name.to_owned(), FirmwareStatus::Failed);
            return false;
        }

        let path = self.staging_dir.join(name);

        if let Err(e) = fs::write(&path, data) {
            warn!("Failed to stage firmware: {path:?}: {e}");
            self.statuses.insert(name.to_owned(), FirmwareStatus::Failed);
            return false;
        }

        debug!("Staged firmware: {name} ({} bytes)", data.len());
        self.statuses
            .insert(name.to_owned(), FirmwareStatus::Received);
        true
    }

    /// Verify the staged package against a 64-character lowercase hex SHA-256
    /// digest. A missing staged file returns false without touching the
    /// status; so does a call outside the `Received`/`Verified` states.
    pub fn verify(&mut self, name: &str, expected_hex: &str, cancel_signal: &AtomicBool) -> bool {
        let path = self.staging_dir.join(name);

        if !path.exists() {
            warn!("Firmware not staged: {name}");
            return false;
        }

        match self.status(name) {
            FirmwareStatus::Received | FirmwareStatus::Verified => {}
            status => {
                warn!("Cannot verify firmware in state {status:?}: {name}");
                return false;
            }
        }

        let valid = digest::verify_file(&path, expected_hex, cancel_signal);

        if valid {
            debug!("Firmware digest verified: {name}");
            self.statuses
                .insert(name.to_owned(), FirmwareStatus::Verified);
        } else {
            warn!("Firmware digest mismatch: {name}");
            self.statuses.insert(name.to_owned(), FirmwareStatus::Failed);
        }

        valid
    }

    /// Promote a verified package to the installed directory, overwriting any
    /// previous install of the same name. Refused unless the current status
    /// is exactly `Verified`.
    pub fn apply(&mut self, name: &str) -> bool {
        if self.status(name) != FirmwareStatus::Verified {
            warn!("Refusing to apply unverified firmware: {name}");
            return false;
        }

        let src = self.staging_dir.join(name);
        let dst = self.installed_dir.join(name);

        if let Err(e) = fs::copy(&src, &dst) {
            warn!("Failed to apply firmware: {src:?} -> {dst:?}: {e}");
            self.statuses.insert(name.to_owned(), FirmwareStatus::Failed);
            return false;
        }

        debug!("Applied firmware: {name}");
        self.statuses.insert(name.to_owned(), FirmwareStatus::Applied);
        true
    }

    pub fn status(&self, name: &str) -> FirmwareStatus {
        self.statuses.get(name).copied().unwrap_or_default()
    }
}
