//! Transport AEAD encryptors.
//!
//! Discord's `rtpsize` SRTP variants encrypt the RTP payload with the
//! unencrypted header as associated data. The nonce is a 32-bit big-endian
//! counter zero-padded on the left to the cipher's nonce width; only the
//! low four bytes travel on the wire, appended after the ciphertext.

use std::sync::atomic::{AtomicU32, Ordering};

use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, KeyInit, Payload},
};
use chacha20poly1305::XChaCha20Poly1305;

use crate::common::errors::{Result, StreamError};

/// Wire name of the AES-256-GCM SRTP mode.
pub const AEAD_AES256_GCM: &str = "aead_aes256_gcm_rtpsize";
/// Wire name of the XChaCha20-Poly1305 SRTP mode.
pub const AEAD_XCHACHA20_POLY1305: &str = "aead_xchacha20_poly1305_rtpsize";

/// The AEAD families a session can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Aes256Gcm,
    XChaCha20Poly1305,
}

impl CipherMode {
    pub fn wire_name(self) -> &'static str {
        match self {
            CipherMode::Aes256Gcm => AEAD_AES256_GCM,
            CipherMode::XChaCha20Poly1305 => AEAD_XCHACHA20_POLY1305,
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            AEAD_AES256_GCM => Some(CipherMode::Aes256Gcm),
            AEAD_XCHACHA20_POLY1305 => Some(CipherMode::XChaCha20Poly1305),
            _ => None,
        }
    }

    /// Picks the session mode from the peer's advertised set.
    ///
    /// AES-256-GCM wins when the peer offers it, unless ChaCha20 is forced
    /// by configuration.
    pub fn select(advertised: &[String], force_chacha20: bool) -> CipherMode {
        let aes_available = advertised.iter().any(|m| m == AEAD_AES256_GCM);
        if aes_available && !force_chacha20 {
            CipherMode::Aes256Gcm
        } else {
            CipherMode::XChaCha20Poly1305
        }
    }
}

/// Ciphertext (with appended tag) plus the nonce counter that sealed it.
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub counter: u32,
}

impl SealedPayload {
    /// The four nonce bytes appended to the wire packet.
    pub fn nonce_suffix(&self) -> [u8; 4] {
        self.counter.to_be_bytes()
    }
}

enum CipherKind {
    Aes256Gcm(Aes256Gcm),
    XChaCha20Poly1305(XChaCha20Poly1305),
}

/// One session encryptor keyed from the negotiated master key.
///
/// The nonce counter is shared by every caller on this key (both RTP
/// streams and their RTCP reports), so it lives in an atomic and each
/// encryption claims the next value.
pub struct TransportCipher {
    kind: CipherKind,
    counter: AtomicU32,
}

/// Expands a wire counter into a full nonce: counter in the trailing four
/// bytes, leading bytes zero.
fn expand_nonce<const W: usize>(counter: u32) -> [u8; W] {
    let mut nonce = [0u8; W];
    nonce[W - 4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

impl TransportCipher {
    pub fn new(mode: CipherMode, key: &[u8; 32]) -> Result<Self> {
        let kind = match mode {
            CipherMode::Aes256Gcm => CipherKind::Aes256Gcm(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|e| StreamError::Crypto(format!("AES-256-GCM key import: {e}")))?,
            ),
            CipherMode::XChaCha20Poly1305 => CipherKind::XChaCha20Poly1305(
                XChaCha20Poly1305::new_from_slice(key).map_err(|e| {
                    StreamError::Crypto(format!("XChaCha20-Poly1305 key import: {e}"))
                })?,
            ),
        };
        Ok(Self {
            kind,
            counter: AtomicU32::new(0),
        })
    }

    pub fn mode(&self) -> CipherMode {
        match self.kind {
            CipherKind::Aes256Gcm(_) => CipherMode::Aes256Gcm,
            CipherKind::XChaCha20Poly1305(_) => CipherMode::XChaCha20Poly1305,
        }
    }

    /// Seals `plaintext` under the next nonce with `aad` authenticated.
    ///
    /// The counter wraps modulo 2^32, matching the four bytes the receiver
    /// gets to reconstruct the nonce.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<SealedPayload> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let ciphertext = match &self.kind {
            CipherKind::Aes256Gcm(cipher) => {
                let nonce = expand_nonce::<12>(counter);
                cipher.encrypt((&nonce).into(), payload)
            }
            CipherKind::XChaCha20Poly1305(cipher) => {
                let nonce = expand_nonce::<24>(counter);
                cipher.encrypt((&nonce).into(), payload)
            }
        }
        .map_err(|_| StreamError::Crypto("AEAD encryption failed".into()))?;

        Ok(SealedPayload { counter, ciphertext })
    }

    /// Opens a sealed payload given the wire counter. Used to verify the
    /// send path; there is no receive pipeline.
    pub(crate) fn decrypt(&self, ciphertext: &[u8], aad: &[u8], counter: u32) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match &self.kind {
            CipherKind::Aes256Gcm(cipher) => {
                let nonce = expand_nonce::<12>(counter);
                cipher.decrypt((&nonce).into(), payload)
            }
            CipherKind::XChaCha20Poly1305(cipher) => {
                let nonce = expand_nonce::<24>(counter);
                cipher.decrypt((&nonce).into(), payload)
            }
        }
        .map_err(|_| StreamError::Crypto("AEAD authentication failed".into()))
    }
}
