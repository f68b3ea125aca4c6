// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! AES-256 in CBC mode with PKCS#7 padding, implemented from first
//! principles. This provides confidentiality only. There is no MAC; callers
//! that need integrity must cross-check an out-of-band digest, which is
//! exactly what the firmware path does.

use std::{fs, path::Path};

use rand::{rngs::OsRng, RngCore};
use tracing::warn;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;

const NUM_ROUNDS: usize = 14;
const ROUND_KEY_WORDS: usize = 4 * (NUM_ROUNDS + 1);

const SBOX: [u8; 256] = [
    0x63, 0x7c, 0x77, 0x7b, 0xf2, 0x6b, 0x6f, 0xc5, 0x30, 0x01, 0x67, 0x2b, 0xfe, 0xd7, 0xab, 0x76,
    0xca, 0x82, 0xc9, 0x7d, 0xfa, 0x59, 0x47, 0xf0, 0xad, 0xd4, 0xa2, 0xaf, 0x9c, 0xa4, 0x72, 0xc0,
    0xb7, 0xfd, 0x93, 0x26, 0x36, 0x3f, 0xf7, 0xcc, 0x34, 0xa5, 0xe5, 0xf1, 0x71, 0xd8, 0x31, 0x15,
    0x04, 0xc7, 0x23, 0xc3, 0x18, 0x96, 0x05, 0x9a, 0x07, 0x12, 0x80, 0xe2, 0xeb, 0x27, 0xb2, 0x75,
    0x09, 0x83, 0x2c, 0x1a, 0x1b, 0x6e, 0x5a, 0xa0, 0x52, 0x3b, 0xd6, 0xb3, 0x29, 0xe3, 0x2f, 0x84,
    0x53, 0xd1, 0x00, 0xed, 0x20, 0xfc, 0xb1, 0x5b, 0x6a, 0xcb, 0xbe, 0x39, 0x4a, 0x4c, 0x58, 0xcf,
    0xd0, 0xef, 0xaa, 0xfb, 0x43, 0x4d, 0x33, 0x85, 0x45, 0xf9, 0x02, 0x7f, 0x50, 0x3c, 0x9f, 0xa8,
    0x51, 0xa3, 0x40, 0x8f, 0x92, 0x9d, 0x38, 0xf5, 0xbc, 0xb6, 0xda, 0x21, 0x10, 0xff, 0xf3, 0xd2,
    0xcd, 0x0c, 0x13, 0xec, 0x5f, 0x97, 0x44, 0x17, 0xc4, 0xa7, 0x7e, 0x3d, 0x64, 0x5d, 0x19, 0x73,
    0x60, 0x81, 0x4f, 0xdc, 0x22, 0x2a, 0x90, 0x88, 0x46, 0xee, 0xb8, 0x14, 0xde, 0x5e, 0x0b, 0xdb,
    0xe0, 0x32, 0x3a, 0x0a, 0x49, 0x06, 0x24, 0x5c, 0xc2, 0xd3, 0xac, 0x62, 0x91, 0x95, 0xe4, 0x79,
    0xe7, 0xc8, 0x37, 0x6d, 0x8d, 0xd5, 0x4e, 0xa9, 0x6c, 0x56, 0xf4, 0xea, 0x65, 0x7a, 0xae, 0x08,
    0xba, 0x78, 0x25, 0x2e, 0x1c, 0xa6, 0xb4, 0xc6, 0xe8, 0xdd, 0x74, 0x1f, 0x4b, 0xbd, 0x8b, 0x8a,
    0x70, 0x3e, 0xb5, 0x66, 0x48, 0x03, 0xf6, 0x0e, 0x61, 0x35, 0x57, 0xb9, 0x86, 0xc1, 0x1d, 0x9e,
    0xe1, 0xf8, 0x98, 0x11, 0x69, 0xd9, 0x8e, 0x94, 0x9b, 0x1e, 0x87, 0xe9, 0xce, 0x55, 0x28, 0xdf,
    0x8c, 0xa1, 0x89, 0x0d, 0xbf, 0xe6, 0x42, 0x68, 0x41, 0x99, 0x2d, 0x0f, 0xb0, 0x54, 0xbb, 0x16,
];

const INV_SBOX: [u8; 256] = [
    0x52, 0x09, 0x6a, 0xd5, 0x30, 0x36, 0xa5, 0x38, 0xbf, 0x40, 0xa3, 0x9e, 0x81, 0xf3, 0xd7, 0xfb,
    0x7c, 0xe3, 0x39, 0x82, 0x9b, 0x2f, 0xff, 0x87, 0x34, 0x8e, 0x43, 0x44, 0xc4, 0xde, 0xe9, 0xcb,
    0x54, 0x7b, 0x94, 0x32, 0xa6, 0xc2, 0x23, 0x3d, 0xee, 0x4c, 0x95, 0x0b, 0x42, 0xfa, 0xc3, 0x4e,
    0x08, 0x2e, 0xa1, 0x66, 0x28, 0xd9, 0x24, 0xb2, 0x76, 0x5b, 0xa2, 0x49, 0x6d, 0x8b, 0xd1, 0x25,
    0x72, 0xf8, 0xf6, 0x64, 0x86, 0x68, 0x98, 0x16, 0xd4, 0xa4, 0x5c, 0xcc, 0x5d, 0x65, 0xb6, 0x92,
    0x6c, 0x70, 0x48, 0x50, 0xfd, 0xed, 0xb9, 0xda, 0x5e, 0x15, 0x46, 0x57, 0xa7, 0x8d, 0x9d, 0x84,
    0x90, 0xd8, 0xab, 0x00, 0x8c, 0xbc, 0xd3, 0x0a, 0xf7, 0xe4, 0x58, 0x05, 0xb8, 0xb3, 0x45, 0x06,
    0xd0, 0x2c, 0x1e, 0x8f, 0xca, 0x3f, 0x0f, 0x02, 0xc1, 0xaf, 0xbd, 0x03, 0x01, 0x13, 0x8a, 0x6b,
    0x3a, 0x91, 0x11, 0x41, 0x4f, 0x67, 0xdc, 0xea, 0x97, 0xf2, 0xcf, 0xce, 0xf0, 0xb4, 0xe6, 0x73,
    0x96, 0xac, 0x74, 0x22, 0xe7, 0xad, 0x35, 0x85, 0xe2, 0xf9, 0x37, 0xe8, 0x1c, 0x75, 0xdf, 0x6e,
    0x47, 0xf1, 0x1a, 0x71, 0x1d, 0x29, 0xc5, 0x89, 0x6f, 0xb7, 0x62, 0x0e, 0xaa, 0x18, 0xbe, 0x1b,
    0xfc, 0x56, 0x3e, 0x4b, 0xc6, 0xd2, 0x79, 0x20, 0x9a, 0xdb, 0xc0, 0xfe, 0x78, 0xcd, 0x5a, 0xf4,
    0x1f, 0xdd, 0xa8, 0x33, 0x88, 0x07, 0xc7, 0x31, 0xb1, 0x12, 0x10, 0x59, 0x27, 0x80, 0xec, 0x5f,
    0x60, 0x51, 0x7f, 0xa9, 0x19, 0xb5, 0x4a, 0x0d, 0x2d, 0xe5, 0x7a, 0x9f, 0x93, 0xc9, 0x9c, 0xef,
    0xa0, 0xe0, 0x3b, 0x4d, 0xae, 0x2a, 0xf5, 0xb0, 0xc8, 0xeb, 0xbb, 0x3c, 0x83, 0x53, 0x99, 0x61,
    0x17, 0x2b, 0x04, 0x7e, 0xba, 0x77, 0xd6, 0x26, 0xe1, 0x69, 0x14, 0x63, 0x55, 0x21, 0x0c, 0x7d,
];

const RCON: [u8; 11] = [
    0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36,
];

/// Multiplication in GF(2^8) under the reducing polynomial 0x11b.
fn gmul(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0;

    for _ in 0..8 {
        if b & 1 != 0 {
            p ^= a;
        }
        let hi = a & 0x80 != 0;
        a <<= 1;
        if hi {
            a ^= 0x1b;
        }
        b >>= 1;
    }

    p
}

fn sub_word(w: u32) -> u32 {
    u32::from_be_bytes([
        SBOX[(w >> 24) as usize],
        SBOX[(w >> 16 & 0xff) as usize],
        SBOX[(w >> 8 & 0xff) as usize],
        SBOX[(w & 0xff) as usize],
    ])
}

fn expand_key(key: &[u8; KEY_SIZE]) -> [u32; ROUND_KEY_WORDS] {
    let mut w = [0u32; ROUND_KEY_WORDS];

    for (word, chunk) in w.iter_mut().zip(key.chunks_exact(4)) {
        *word = u32::from_be_bytes(chunk.try_into().unwrap());
    }

    for i in 8..ROUND_KEY_WORDS {
        let mut temp = w[i - 1];
        if i % 8 == 0 {
            temp = sub_word(temp.rotate_left(8)) ^ (u32::from(RCON[i / 8]) << 24);
        } else if i % 8 == 4 {
            temp = sub_word(temp);
        }
        w[i] = w[i - 8] ^ temp;
    }

    w
}

// The state is the FIPS-197 column-major layout flattened into 16 bytes:
// byte 4*c + r holds row r of column c.

fn sub_bytes(state: &mut [u8; BLOCK_SIZE]) {
    for b in state {
        *b = SBOX[*b as usize];
    }
}

fn inv_sub_bytes(state: &mut [u8; BLOCK_SIZE]) {
    for b in state {
        *b = INV_SBOX[*b as usize];
    }
}

fn shift_rows(state: &mut [u8; BLOCK_SIZE]) {
    // Row 1: rotate left by 1.
    let t = state[1];
    state[1] = state[5];
    state[5] = state[9];
    state[9] = state[13];
    state[13] = t;

    // Row 2: rotate left by 2.
    state.swap(2, 10);
    state.swap(6, 14);

    // Row 3: rotate left by 3.
    let t = state[15];
    state[15] = state[11];
    state[11] = state[7];
    state[7] = state[3];
    state[3] = t;
}

fn inv_shift_rows(state: &mut [u8; BLOCK_SIZE]) {
    // Row 1: rotate right by 1.
    let t = state[13];
    state[13] = state[9];
    state[9] = state[5];
    state[5] = state[1];
    state[1] = t;

    // Row 2: rotate right by 2.
    state.swap(2, 10);
    state.swap(6, 14);

    // Row 3: rotate right by 3.
    let t = state[3];
    state[3] = state[7];
    state[7] = state[11];
    state[11] = state[15];
    state[15] = t;
}

fn mix_columns(state: &mut [u8; BLOCK_SIZE]) {
    for column in state.chunks_exact_mut(4) {
        let [a0, a1, a2, a3] = [column[0], column[1], column[2], column[3]];
        column[0] = gmul(a0, 2) ^ gmul(a1, 3) ^ a2 ^ a3;
        column[1] = a0 ^ gmul(a1, 2) ^ gmul(a2, 3) ^ a3;
        column[2] = a0 ^ a1 ^ gmul(a2, 2) ^ gmul(a3, 3);
        column[3] = gmul(a0, 3) ^ a1 ^ a2 ^ gmul(a3, 2);
    }
}

fn inv_mix_columns(state: &mut [u8; BLOCK_SIZE]) {
    for column in state.chunks_exact_mut(4) {
        let [a0, a1, a2, a3] = [column[0], column[1], column[2], column[3]];
        column[0] = gmul(a0, 14) ^ gmul(a1, 11) ^ gmul(a2, 13) ^ gmul(a3, 9);
        column[1] = gmul(a0, 9) ^ gmul(a1, 14) ^ gmul(a2, 11) ^ gmul(a3, 13);
        column[2] = gmul(a0, 13) ^ gmul(a1, 9) ^ gmul(a2, 14) ^ gmul(a3, 11);
        column[3] = gmul(a0, 11) ^ gmul(a1, 13) ^ gmul(a2, 9) ^ gmul(a3, 14);
    }
}

fn add_round_key(state: &mut [u8; BLOCK_SIZE], round_key: &[u32]) {
    for (column, word) in state.chunks_exact_mut(4).zip(round_key) {
        for (b, k) in column.iter_mut().zip(word.to_be_bytes()) {
            *b ^= k;
        }
    }
}

fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    // Padding is always added, so an aligned input grows by a full block.
    let pad_len = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut padded = data.to_vec();
    padded.resize(data.len() + pad_len, pad_len as u8);
    padded
}

/// Strip PKCS#7 padding in place. Returns false if the padding is invalid.
fn pkcs7_unpad(data: &mut Vec<u8>) -> bool {
    let Some(&pad_len) = data.last() else {
        return false;
    };

    if pad_len == 0 || pad_len as usize > BLOCK_SIZE || pad_len as usize > data.len() {
        return false;
    }

    if !data[data.len() - pad_len as usize..]
        .iter()
        .all(|b| *b == pad_len)
    {
        return false;
    }

    data.truncate(data.len() - pad_len as usize);
    true
}

/// AES-256-CBC cipher with a per-call random IV prepended to the ciphertext.
///
/// The key material is accepted at any length: shorter inputs are zero-padded
/// to 32 bytes and longer inputs are truncated. This is an observable
/// contract relied on by deployments that configure short tokens.
///
/// The IV source is owned by the instance so that tests can inject a
/// deterministic one. The default is the OS entropy pool.
pub struct Cipher {
    round_keys: [u32; ROUND_KEY_WORDS],
    iv_source: Box<dyn RngCore + Send>,
}

impl Cipher {
    pub fn new(key: &[u8]) -> Self {
        Self::with_iv_source(key, Box::new(OsRng))
    }

    pub fn with_iv_source(key: &[u8], iv_source: Box<dyn RngCore + Send>) -> Self {
        let mut padded = [0u8; KEY_SIZE];
        let n = key.len().min(KEY_SIZE);
        padded[..n].copy_from_slice(&key[..n]);

        Self {
            round_keys: expand_key(&padded),
            iv_source,
        }
    }

    fn encrypt_block(&self, state: &mut [u8; BLOCK_SIZE]) {
        add_round_key(state, &self.round_keys[..4]);

        for round in 1..NUM_ROUNDS {
            sub_bytes(state);
            shift_rows(state);
            mix_columns(state);
            add_round_key(state, &self.round_keys[round * 4..round * 4 + 4]);
        }

        sub_bytes(state);
        shift_rows(state);
        add_round_key(state, &self.round_keys[NUM_ROUNDS * 4..]);
    }

    fn decrypt_block(&self, state: &mut [u8; BLOCK_SIZE]) {
        add_round_key(state, &self.round_keys[NUM_ROUNDS * 4..]);

        for round in (1..NUM_ROUNDS).rev() {
            inv_shift_rows(state);
            inv_sub_bytes(state);
            add_round_key(state, &self.round_keys[round * 4..round * 4 + 4]);
            inv_mix_columns(state);
        }

        inv_shift_rows(state);
        inv_sub_bytes(state);
        add_round_key(state, &self.round_keys[..4]);
    }

    /// Encrypt `plaintext` and return `IV || ciphertext`. The output length
    /// is always `16 + 16 * ceil((len + 1) / 16)`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_SIZE];
        self.iv_source.fill_bytes(&mut iv);

        let padded = pkcs7_pad(plaintext);
        let mut out = Vec::with_capacity(IV_SIZE + padded.len());
        out.extend_from_slice(&iv);

        let mut prev = iv;
        for chunk in padded.chunks_exact(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            for ((b, c), p) in block.iter_mut().zip(chunk).zip(prev) {
                *b = c ^ p;
            }

            self.encrypt_block(&mut block);

            out.extend_from_slice(&block);
            prev = block;
        }

        out
    }

    /// Decrypt `IV || ciphertext`. Malformed input (too short, misaligned,
    /// invalid padding) and a wrong key are surfaced identically as an empty
    /// result; callers that care must cross-check an out-of-band digest.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Vec<u8> {
        if ciphertext.len() < IV_SIZE + BLOCK_SIZE
            || (ciphertext.len() - IV_SIZE) % BLOCK_SIZE != 0
        {
            return vec![];
        }

        let mut prev: [u8; IV_SIZE] = ciphertext[..IV_SIZE].try_into().unwrap();
        let mut decrypted = Vec::with_capacity(ciphertext.len() - IV_SIZE);

        for chunk in ciphertext[IV_SIZE..].chunks_exact(BLOCK_SIZE) {
            let mut block: [u8; BLOCK_SIZE] = chunk.try_into().unwrap();
            self.decrypt_block(&mut block);

            for (b, p) in block.iter_mut().zip(prev) {
                *b ^= p;
            }

            decrypted.extend_from_slice(&block);
            prev = chunk.try_into().unwrap();
        }

        if !pkcs7_unpad(&mut decrypted) {
            return vec![];
        }

        decrypted
    }

    /// Encrypt `plaintext` and write the result to `path`. Returns false on
    /// I/O failure.
    pub fn store_to_file(&mut self, path: &Path, plaintext: &[u8]) -> bool {
        let encrypted = self.encrypt(plaintext);

        if let Err(e) = fs::write(path, encrypted) {
            warn!("Failed to write encrypted file: {path:?}: {e}");
            return false;
        }

        true
    }

    /// Read `path` and decrypt its contents. Returns empty on I/O or
    /// decryption failure.
    pub fn load_from_file(&self, path: &Path) -> Vec<u8> {
        match fs::read(path) {
            Ok(ciphertext) => self.decrypt(&ciphertext),
            Err(e) => {
                warn!("Failed to read encrypted file: {path:?}: {e}");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::mock::StepRng;

    use super::{Cipher, BLOCK_SIZE, IV_SIZE};

    fn zero_iv_cipher(key: &[u8]) -> Cipher {
        Cipher::with_iv_source(key, Box::new(StepRng::new(0, 0)))
    }

    #[test]
    fn fips_197_block_vector() {
        // FIPS-197 appendix C.3.
        let key = hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
            .unwrap();
        let cipher = Cipher::new(&key);

        let mut block: [u8; BLOCK_SIZE] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();

        cipher.encrypt_block(&mut block);
        assert_eq!(hex::encode(block), "8ea2b7ca516745bfeafc49904b496089");

        cipher.decrypt_block(&mut block);
        assert_eq!(hex::encode(block), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn cbc_first_block_matches_ecb_with_zero_iv() {
        let key = hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
            .unwrap();
        let mut cipher = zero_iv_cipher(&key);

        let plaintext = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        let ciphertext = cipher.encrypt(&plaintext);

        // IV(16) || block || padding block.
        assert_eq!(ciphertext.len(), IV_SIZE + 2 * BLOCK_SIZE);
        assert_eq!(&ciphertext[..IV_SIZE], &[0u8; IV_SIZE]);
        assert_eq!(
            hex::encode(&ciphertext[IV_SIZE..IV_SIZE + BLOCK_SIZE]),
            "8ea2b7ca516745bfeafc49904b496089",
        );
    }

    #[test]
    fn round_trip() {
        let mut cipher = Cipher::new(b"0123456789abcdef0123456789abcdef");

        for len in [0, 1, 15, 16, 17, 31, 32, 1000] {
            let plaintext = (0..len).map(|i| i as u8).collect::<Vec<_>>();
            let ciphertext = cipher.encrypt(&plaintext);

            assert_eq!(ciphertext.len(), 16 + 16 * (plaintext.len() / 16 + 1));
            assert_eq!(cipher.decrypt(&ciphertext), plaintext, "length {len}");
        }
    }

    #[test]
    fn round_trip_sensitive_log_line() {
        let mut cipher = Cipher::new(b"0123456789abcdef0123456789abcdef");
        let plaintext = b"This is sensitive log data from a device.";

        let first = cipher.encrypt(plaintext);
        let second = cipher.encrypt(plaintext);

        // Fresh IV per call.
        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(&first), plaintext);
        assert_eq!(cipher.decrypt(&second), plaintext);
    }

    #[test]
    fn short_key_is_zero_padded() {
        let mut short = Cipher::new(b"short key");

        let mut padded_key = [0u8; 32];
        padded_key[..9].copy_from_slice(b"short key");
        let full = Cipher::new(&padded_key);

        let ciphertext = short.encrypt(b"payload");
        assert_eq!(full.decrypt(&ciphertext), b"payload");
    }

    #[test]
    fn long_key_is_truncated() {
        let mut long = Cipher::new(b"0123456789abcdef0123456789abcdefEXTRA");
        let exact = Cipher::new(b"0123456789abcdef0123456789abcdef");

        let ciphertext = long.encrypt(b"payload");
        assert_eq!(exact.decrypt(&ciphertext), b"payload");
    }

    #[test]
    fn wrong_key_fails() {
        let mut cipher = Cipher::new(b"correct key");
        let other = Cipher::new(b"incorrect key");

        let plaintext = b"secret bytes that must not leak";
        let ciphertext = cipher.encrypt(plaintext);

        // Either the padding check rejects the garbage plaintext or the
        // output differs. Both count as failure.
        assert_ne!(other.decrypt(&ciphertext), plaintext);
    }

    #[test]
    fn malformed_ciphertext_fails() {
        let cipher = Cipher::new(b"key");

        // Too short.
        assert!(cipher.decrypt(b"").is_empty());
        assert!(cipher.decrypt(&[0u8; 16]).is_empty());
        assert!(cipher.decrypt(&[0u8; 31]).is_empty());
        // Misaligned.
        assert!(cipher.decrypt(&[0u8; 33]).is_empty());
    }

    #[test]
    fn invalid_padding_fails() {
        let key = b"0123456789abcdef0123456789abcdef";
        let mut cipher = zero_iv_cipher(key);

        let mut ciphertext = cipher.encrypt(b"four");

        // Corrupt the final block so the padding bytes no longer validate.
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(cipher.decrypt(&ciphertext).is_empty());
    }

    #[test]
    fn file_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("secret.bin");

        let mut cipher = Cipher::new(b"file key");
        assert!(cipher.store_to_file(&path, b"at-rest data"));

        let raw = std::fs::read(&path).unwrap();
        assert_ne!(raw, b"at-rest data");

        assert_eq!(cipher.load_from_file(&path), b"at-rest data");
        assert!(cipher
            .load_from_file(&temp_dir.path().join("missing"))
            .is_empty());
    }
}
