//! Iccode: the self-keyed block stream cipher used for session encryption
//! and for masking the dynamic key during authentication.
//!
//! The cipher works on 1024-byte blocks. Each block is masked with a
//! keystream derived from the rolling buffer key; the buffer key then
//! absorbs the plaintext of that block, so the keystream of the next block
//! depends on everything encoded before it. Callers synchronise both peers
//! by calling [`Iccode::reset`] at the start of every logical message.

use sha2::{Digest, Sha512};

use super::CryptoError;

/// Block size in bytes; equals the length of the expanded key.
pub const BLOCK_SIZE: usize = 1024;

/// Number of SHA-512 rounds used to expand a key to [`BLOCK_SIZE`] bytes.
const EXPANSION_ROUNDS: usize = BLOCK_SIZE / 64;

#[derive(Clone)]
pub struct Iccode {
    base_key: Vec<u8>,
    buffer_key: Vec<u8>,
    keystream: Vec<u8>,
    fingerprint_level: u32,
    step: u64,
}

impl Iccode {
    pub fn new(base_key: &[u8], fingerprint_level: u32) -> Result<Self, CryptoError> {
        if base_key.len() <= 1 {
            return Err(CryptoError::KeyTooShort(base_key.len()));
        }
        if fingerprint_level == 0 {
            return Err(CryptoError::InvalidFingerprintLevel);
        }

        let base_key = expand_key(base_key);
        Ok(Self {
            buffer_key: base_key.clone(),
            base_key,
            keystream: vec![0u8; BLOCK_SIZE],
            fingerprint_level,
            step: 0,
        })
    }

    /// Number of bytes processed since the last reset.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Rewind the cipher. With `None` the buffer key returns to the base
    /// key, otherwise it is re-derived from `key`.
    pub fn reset(&mut self, key: Option<&[u8]>) {
        self.step = 0;
        self.buffer_key = match key {
            Some(key) => expand_key(key),
            None => self.base_key.clone(),
        };
    }

    pub fn encode(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for &plain in data {
            let pos = self.enter_position();
            out.push(plain.wrapping_add(self.keystream[pos]));
            self.absorb(pos, plain);
        }
        out
    }

    pub fn decode(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for &cipher in data {
            let pos = self.enter_position();
            let plain = cipher.wrapping_sub(self.keystream[pos]);
            out.push(plain);
            self.absorb(pos, plain);
        }
        out
    }

    fn enter_position(&mut self) -> usize {
        let pos = (self.step % BLOCK_SIZE as u64) as usize;
        if pos == 0 {
            self.sign_buffer_key();
        }
        pos
    }

    fn absorb(&mut self, pos: usize, plain: u8) {
        self.buffer_key[pos] = self.buffer_key[pos].wrapping_add(plain.wrapping_mul(self.base_key[pos]));
        self.step += 1;
    }

    /// Fingerprint the current buffer key into the keystream of the block
    /// being entered.
    fn sign_buffer_key(&mut self) {
        for (pos, slot) in self.keystream.iter_mut().enumerate() {
            let mut mixed = self.buffer_key[pos].wrapping_add(self.base_key[pos]);
            for round in 1..self.fingerprint_level {
                mixed = mixed.wrapping_add(mixed.wrapping_pow(round + 1));
            }
            *slot = mixed;
        }
    }
}

impl std::fmt::Debug for Iccode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iccode")
            .field("fingerprint_level", &self.fingerprint_level)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

/// Stretch `key` to [`BLOCK_SIZE`] bytes by repeatedly hashing the growing
/// material and keeping only the appended digests.
fn expand_key(key: &[u8]) -> Vec<u8> {
    let mut material = key.to_vec();
    for _ in 0..EXPANSION_ROUNDS {
        let digest = Sha512::digest(&material);
        material.extend_from_slice(&digest);
    }
    material.split_off(key.len())
}
