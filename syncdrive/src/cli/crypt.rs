/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{cli::status, crypto::Cipher};

#[derive(Debug, Args)]
struct KeyGroup {
    /// Cipher key (hex; shorter than 32 bytes is zero-padded).
    #[arg(short, long, value_name = "HEX")]
    key: String,
}

impl KeyGroup {
    fn to_cipher(&self) -> Result<Cipher> {
        let key = hex::decode(&self.key).context("Invalid key")?;
        Ok(Cipher::new(&key))
    }
}

fn encrypt_subcommand(cli: &EncryptCli) -> Result<()> {
    let mut cipher = cli.key.to_cipher()?;

    let plaintext = fs::read(&cli.input)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.input))?;
    let ciphertext = cipher.encrypt(&plaintext);

    fs::write(&cli.output, &ciphertext)
        .with_context(|| format!("Failed to open for writing: {:?}", cli.output))?;

    status!("Encrypted {} bytes -> {:?}", plaintext.len(), cli.output);

    Ok(())
}

fn decrypt_subcommand(cli: &DecryptCli) -> Result<()> {
    let cipher = cli.key.to_cipher()?;

    let ciphertext = fs::read(&cli.input)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.input))?;
    let plaintext = cipher.decrypt(&ciphertext);

    if plaintext.is_empty() {
        bail!("Decryption failed (wrong key or corrupt input): {:?}", cli.input);
    }

    fs::write(&cli.output, &plaintext)
        .with_context(|| format!("Failed to open for writing: {:?}", cli.output))?;

    status!("Decrypted {} bytes -> {:?}", plaintext.len(), cli.output);

    Ok(())
}

pub fn crypt_main(cli: &CryptCli) -> Result<()> {
    match &cli.command {
        CryptCommand::Encrypt(c) => encrypt_subcommand(c),
        CryptCommand::Decrypt(c) => decrypt_subcommand(c),
    }
}

/// Encrypt a file (output is IV || ciphertext).
#[derive(Debug, Parser)]
struct EncryptCli {
    /// Path to input file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    #[command(flatten)]
    key: KeyGroup,
}

/// Decrypt a file produced by `encrypt`.
#[derive(Debug, Parser)]
struct DecryptCli {
    /// Path to input file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    #[command(flatten)]
    key: KeyGroup,
}

#[derive(Debug, Subcommand)]
enum CryptCommand {
    Encrypt(EncryptCli),
    Decrypt(DecryptCli),
}

/// Encrypt and decrypt files.
#[derive(Debug, Parser)]
pub struct CryptCli {
    #[command(subcommand)]
    command: CryptCommand,
}
