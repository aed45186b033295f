//! Symmetric sealing of gossip packets with a shared pre-shared key.
//!
//! Packets are encrypted with a SHA-256-derived keystream and
//! authenticated with HMAC-SHA256 (encrypt-then-MAC). Layout:
//!
//! ```text
//! [1 byte flag][16 byte nonce][ciphertext][32 byte tag]   flag = 0x01
//! [1 byte flag][plaintext]                                flag = 0x00
//! ```
//!
//! A keyed node rejects plaintext packets and an unkeyed node rejects
//! sealed ones, so a cluster is either fully encrypted or not at all.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

const FLAG_PLAIN: u8 = 0x00;
const FLAG_SEALED: u8 = 0x01;

/// Holds the optional cluster key. An empty `--encrypt` flag yields a
/// plaintext keyring.
#[derive(Clone)]
pub struct Keyring {
    key: Option<[u8; KEY_LEN]>,
}

impl Keyring {
    pub fn plaintext() -> Self {
        Keyring { key: None }
    }

    /// Decodes the base64 key material. Anything that is not exactly a
    /// 32-byte key is fatal at startup.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        if encoded.is_empty() {
            return Ok(Keyring::plaintext());
        }
        let raw = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| Error::Config(format!("invalid encryption key: {e}")))?;
        if raw.len() != KEY_LEN {
            return Err(Error::Config(format!(
                "invalid encryption key: expected {KEY_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&raw);
        Ok(Keyring { key: Some(key) })
    }

    pub fn is_sealed(&self) -> bool {
        self.key.is_some()
    }

    pub fn seal(&self, plain: &[u8]) -> Vec<u8> {
        let key = match &self.key {
            Some(key) => key,
            None => {
                let mut out = Vec::with_capacity(1 + plain.len());
                out.push(FLAG_PLAIN);
                out.extend_from_slice(plain);
                return out;
            }
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut out = Vec::with_capacity(1 + NONCE_LEN + plain.len() + TAG_LEN);
        out.push(FLAG_SEALED);
        out.extend_from_slice(&nonce);
        let mut body = plain.to_vec();
        xor_keystream(key, &nonce, &mut body);
        out.extend_from_slice(&body);

        let tag = compute_tag(key, &out);
        out.extend_from_slice(&tag);
        out
    }

    pub fn open(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let (flag, rest) = packet
            .split_first()
            .ok_or_else(|| Error::Membership("empty gossip packet".into()))?;

        match (*flag, &self.key) {
            (FLAG_PLAIN, None) => Ok(rest.to_vec()),
            (FLAG_PLAIN, Some(_)) => Err(Error::Membership(
                "plaintext packet on an encrypted cluster".into(),
            )),
            (FLAG_SEALED, None) => Err(Error::Membership(
                "sealed packet but no encryption key configured".into(),
            )),
            (FLAG_SEALED, Some(key)) => {
                if rest.len() < NONCE_LEN + TAG_LEN {
                    return Err(Error::Membership("truncated sealed packet".into()));
                }
                let (head, tag) = packet.split_at(packet.len() - TAG_LEN);
                let expected = compute_tag(key, head);
                if !bool::from(expected[..].ct_eq(tag)) {
                    return Err(Error::Membership("gossip packet failed authentication".into()));
                }
                let nonce = &head[1..1 + NONCE_LEN];
                let mut body = head[1 + NONCE_LEN..].to_vec();
                xor_keystream(key, nonce, &mut body);
                Ok(body)
            }
            (other, _) => Err(Error::Membership(format!(
                "unknown gossip packet flag {other:#04x}"
            ))),
        }
    }
}

fn compute_tag(key: &[u8; KEY_LEN], data: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    tag
}

fn xor_keystream(key: &[u8; KEY_LEN], nonce: &[u8], buf: &mut [u8]) {
    let mut counter: u64 = 0;
    for chunk in buf.chunks_mut(32) {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(nonce);
        hasher.update(counter.to_le_bytes());
        let block = hasher.finalize();
        for (b, k) in chunk.iter_mut().zip(block.iter()) {
            *b ^= k;
        }
        counter += 1;
    }
}
