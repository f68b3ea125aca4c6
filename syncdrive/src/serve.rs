// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The file-serving boundary behind the Wi-Fi pull API. The HTTP framing
//! itself lives outside this crate; whatever speaks the protocol calls in
//! here with already-parsed names and tokens and gets bytes back. This layer
//! owns authentication, filename sanitization, and the optional at-rest
//! encryption of served payloads.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{crypto::Cipher, digest, firmware::FirmwareStager};

/// Tokens shorter than this are rejected before comparison. The comparison
/// itself is constant-time; the length is not a secret.
pub const MIN_TOKEN_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),
    #[error("File not found: {0:?}")]
    NotFound(String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

pub struct FileServer {
    root_dir: PathBuf,
    auth_token: Option<String>,
    cipher: Option<Cipher>,
}

impl FileServer {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            auth_token: None,
            cipher: None,
        }
    }

    pub fn set_auth_token(&mut self, token: impl Into<String>) {
        self.auth_token = Some(token.into());
    }

    /// Configure at-rest encryption of served payloads. Without a key, raw
    /// bytes are served.
    pub fn set_cipher_key(&mut self, key: &[u8]) {
        self.cipher = Some(Cipher::new(key));
    }

    /// List the regular files directly inside the root directory. A missing
    /// root yields an empty list.
    pub fn file_list(&self) -> Vec<FileInfo> {
        let mut files = vec![];

        let Ok(entries) = fs::read_dir(&self.root_dir) else {
            return files;
        };

        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };

            if metadata.is_file() {
                files.push(FileInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                });
            }
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    /// Whether `name` is acceptable as a leaf filename under the root. The
    /// rules reject anything that could escape the directory or address a
    /// hidden file: empty names, path separators, `..`, NUL bytes, leading
    /// dots, and Windows drive-letter prefixes.
    pub fn is_path_safe(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }

        if name.contains("..")
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return false;
        }

        if name.as_bytes().get(1) == Some(&b':') {
            return false;
        }

        if name.starts_with('.') {
            return false;
        }

        true
    }

    /// Read the raw contents of a served file.
    pub fn file_content(&self, name: &str) -> Result<Vec<u8>> {
        if !self.is_path_safe(name) {
            warn!("Rejecting unsafe filename: {name:?}");
            return Err(Error::InvalidFilename(name.to_owned()));
        }

        let path = self.root_dir.join(name);

        if !path.is_file() {
            return Err(Error::NotFound(name.to_owned()));
        }

        Ok(fs::read(path)?)
    }

    /// Produce the body actually sent over the air: the raw bytes, or, when
    /// a cipher key is configured, the encrypted bytes in standard Base64
    /// with no line breaks.
    pub fn serve_payload(&mut self, name: &str) -> Result<Vec<u8>> {
        let content = self.file_content(name)?;

        match &mut self.cipher {
            Some(cipher) => {
                let encrypted = cipher.encrypt(&content);
                debug!("Serving {name} encrypted ({} bytes)", encrypted.len());
                Ok(STANDARD.encode(encrypted).into_bytes())
            }
            None => Ok(content),
        }
    }

    /// Compare a presented token against the configured one in constant
    /// time. Fails when no token is configured or the presented token is
    /// shorter than [`MIN_TOKEN_LEN`].
    pub fn authenticate(&self, token: &str) -> bool {
        if token.len() < MIN_TOKEN_LEN {
            return false;
        }

        let Some(expected) = &self.auth_token else {
            return false;
        };

        digest::eq_constant_time(token.as_bytes(), expected.as_bytes())
    }

    /// Route an inbound firmware package to the stager after filename
    /// sanitization. The stager itself treats names as opaque.
    pub fn receive_firmware(&self, stager: &mut FirmwareStager, name: &str, data: &[u8]) -> bool {
        if !self.is_path_safe(name) {
            warn!("Rejecting unsafe firmware filename: {name:?}");
            return false;
        }

        stager.receive(name, data)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use base64::{engine::general_purpose::STANDARD, Engine};

    use crate::crypto::Cipher;

    use super::FileServer;

    #[test]
    fn list_and_fetch() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("a.log"), b"alpha").unwrap();
        fs::write(temp_dir.path().join("b.log"), b"beta").unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();

        let server = FileServer::new(temp_dir.path());

        let list = server.file_list();
        assert_eq!(
            list.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            ["a.log", "b.log"],
        );
        assert_eq!(list[0].size, 5);

        assert_eq!(server.file_content("a.log").unwrap(), b"alpha");
        assert!(server.file_content("missing.log").is_err());
    }

    #[test]
    fn unsafe_filenames_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let server = FileServer::new(temp_dir.path());

        for name in [
            "",
            "../etc/passwd",
            "a/b",
            "a\\b",
            "a\0b",
            ".hidden",
            "..",
            "C:evil",
        ] {
            assert!(!server.is_path_safe(name), "{name:?}");
        }

        assert!(server.is_path_safe("device-01.log"));
        assert!(server.is_path_safe("fw.bin"));
    }

    #[test]
    fn authentication() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut server = FileServer::new(temp_dir.path());

        // No token configured.
        assert!(!server.authenticate("0123456789abcdef"));

        server.set_auth_token("0123456789abcdef");
        assert!(server.authenticate("0123456789abcdef"));
        assert!(!server.authenticate("0123456789abcdeX"));
        // Below the minimum length.
        assert!(!server.authenticate("short"));
    }

    #[test]
    fn served_payload_encrypted_when_key_configured() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("a.log"), b"plaintext line").unwrap();

        let mut server = FileServer::new(temp_dir.path());

        // Without a key: raw bytes.
        assert_eq!(server.serve_payload("a.log").unwrap(), b"plaintext line");

        let key = b"0123456789abcdef0123456789abcdef";
        server.set_cipher_key(key);

        let payload = server.serve_payload("a.log").unwrap();
        let encrypted = STANDARD.decode(&payload).unwrap();
        assert_ne!(encrypted, b"plaintext line");

        let cipher = Cipher::new(key);
        assert_eq!(cipher.decrypt(&encrypted), b"plaintext line");
    }
}
