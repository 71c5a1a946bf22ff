use crate::error::PacketRejected;
use crate::pipeline::PacketLayer;
use aead::{AeadInPlace, KeyInit, Nonce};
use aes_gcm::Aes256Gcm;
use anyhow::anyhow;
use bytes::{BufMut, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// AES-256-GCM encryption of the entire datagram. The ciphertext is followed by the GCM tag
///  (16 bytes) and the nonce (12 bytes):
///
/// ```ascii
/// 0: ciphertext (same length as the plaintext)
/// *: tag (16 bytes)
/// *: nonce (12 bytes) - u32 fixed per layer instance, u64 counter
/// ```
pub struct Aes256GcmLayer {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}

impl Aes256GcmLayer {
    pub const TAG_LEN: usize = 16;
    pub const NONCE_LEN: usize = 12;

    pub fn new(key: &[u8; 32]) -> Aes256GcmLayer {
        Aes256GcmLayer {
            cipher: Aes256Gcm::new(aead::Key::<Aes256Gcm>::from_slice(key)),
            nonce_fixed: rand::random(),
            nonce_incremented: AtomicU64::new(0),
        }
    }

    fn next_nonce(&self) -> [u8; Self::NONCE_LEN] {
        let mut nonce = [0u8; Self::NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        nonce[4..].copy_from_slice(&self.nonce_incremented.fetch_add(1, Ordering::AcqRel).to_be_bytes());
        nonce
    }
}

impl PacketLayer for Aes256GcmLayer {
    fn name(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn trailer_len(&self) -> usize {
        Self::TAG_LEN + Self::NONCE_LEN
    }

    fn process_outbound(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let nonce = self.next_nonce();
        self.cipher.encrypt_in_place(Nonce::<Aes256Gcm>::from_slice(&nonce), b"", buf)
            .map_err(|e| anyhow!("encryption error: {}", e))?;
        buf.put_slice(&nonce);
        Ok(())
    }

    fn process_inbound(&self, buf: &mut BytesMut) -> Result<(), PacketRejected> {
        if buf.len() < self.trailer_len() {
            return Err(PacketRejected::Undersized { len: buf.len(), min_len: self.trailer_len() });
        }

        let nonce_offs = buf.len() - Self::NONCE_LEN;
        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(&buf[nonce_offs..]);
        buf.truncate(nonce_offs);

        self.cipher.decrypt_in_place(&nonce, b"", buf)
            .map_err(|_| PacketRejected::DecryptionFailed)
    }
}
