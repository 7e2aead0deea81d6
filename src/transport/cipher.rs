use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rand::RngCore;

use crate::transport::constants::{EVEN_KEY, ODD_KEY};

const KEY_LEN: usize = 32;
const NONCE_PREFIX_LEN: usize = 4;

/// One symmetric key slot: AES-256 key material plus the fixed nonce prefix.
///  The full 12-byte nonce of a data packet is the prefix followed by a
///  per-packet counter that travels in the clear.
#[derive(Clone, Eq, PartialEq)]
pub struct CipherKey {
    pub key: [u8; KEY_LEN],
    pub nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // key material stays out of logs
        write!(f, "CipherKey(..)")
    }
}

impl CipherKey {
    pub fn generate() -> CipherKey {
        let mut key = [0u8; KEY_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        rand::rng().fill_bytes(&mut key);
        rand::rng().fill_bytes(&mut nonce_prefix);
        CipherKey { key, nonce_prefix }
    }
}

/// The even/odd key pair exchanged via `UpdateCipherKeys`. Data packets pick
///  one of the two with the cipher index bit in their header flags, which is
///  what lets a key rotation happen without interrupting the stream.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CipherKeySet {
    pub active_index: usize,
    pub keys: [CipherKey; 2],
}

impl CipherKeySet {
    pub fn generate(active_index: usize) -> CipherKeySet {
        CipherKeySet {
            active_index,
            keys: [CipherKey::generate(), CipherKey::generate()],
        }
    }

    /// A rotated set keeps nothing from its predecessor and flips the active
    ///  selector.
    pub fn rotate(&self) -> CipherKeySet {
        CipherKeySet::generate(self.active_index ^ 1)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.active_index as u8);
        for index in [EVEN_KEY, ODD_KEY] {
            buf.put_u32(KEY_LEN as u32);
            buf.put_slice(&self.keys[index].key);
            buf.put_u32(NONCE_PREFIX_LEN as u32);
            buf.put_slice(&self.keys[index].nonce_prefix);
        }
    }

    pub fn try_deser(mut buf: impl Buf) -> anyhow::Result<CipherKeySet> {
        let active_index = buf.try_get_u8()? as usize;
        if active_index > 1 {
            bail!("invalid active cipher index {}", active_index);
        }

        let mut keys = Vec::with_capacity(2);
        for _ in [EVEN_KEY, ODD_KEY] {
            let key_len = buf.try_get_u32()? as usize;
            if key_len != KEY_LEN {
                bail!("unexpected cipher key length {}", key_len);
            }
            let mut key = [0u8; KEY_LEN];
            buf.copy_to_slice(&mut key);

            let prefix_len = buf.try_get_u32()? as usize;
            if prefix_len != NONCE_PREFIX_LEN {
                bail!("unexpected nonce prefix length {}", prefix_len);
            }
            let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
            buf.copy_to_slice(&mut nonce_prefix);

            keys.push(CipherKey { key, nonce_prefix });
        }

        Ok(CipherKeySet {
            active_index,
            keys: [keys[0].clone(), keys[1].clone()],
        })
    }
}

/// Seals and opens data packet payloads with one of the two active keys.
pub struct DataCipher {
    ciphers: [Aes256Gcm; 2],
    nonce_prefixes: [[u8; NONCE_PREFIX_LEN]; 2],
    counter: AtomicU64,
}

impl DataCipher {
    pub fn new(key_set: &CipherKeySet) -> DataCipher {
        DataCipher {
            ciphers: [
                Aes256Gcm::new((&key_set.keys[EVEN_KEY].key).into()),
                Aes256Gcm::new((&key_set.keys[ODD_KEY].key).into()),
            ],
            nonce_prefixes: [
                key_set.keys[EVEN_KEY].nonce_prefix,
                key_set.keys[ODD_KEY].nonce_prefix,
            ],
            counter: AtomicU64::new(0),
        }
    }

    fn nonce(&self, cipher_index: usize, counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..NONCE_PREFIX_LEN].copy_from_slice(&self.nonce_prefixes[cipher_index]);
        nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Produces `[u64 nonce counter][ciphertext + tag]`.
    pub fn seal(&self, cipher_index: usize, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let counter = self.counter.fetch_add(1, Ordering::AcqRel);
        let nonce = self.nonce(cipher_index, counter);

        let ciphertext = self.ciphers[cipher_index]
            .encrypt(Nonce::from_slice(&nonce), Payload::from(plaintext))
            .map_err(|e| anyhow!("data packet encryption failed: {}", e))?;

        let mut sealed = Vec::with_capacity(8 + ciphertext.len());
        sealed.extend_from_slice(&counter.to_be_bytes());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, cipher_index: usize, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
        if sealed.len() < 8 {
            bail!("sealed data packet shorter than its nonce counter");
        }
        let counter = u64::from_be_bytes(sealed[..8].try_into()?);
        let nonce = self.nonce(cipher_index, counter);

        self.ciphers[cipher_index]
            .decrypt(Nonce::from_slice(&nonce), Payload::from(&sealed[8..]))
            .map_err(|e| anyhow!("data packet decryption failed: {}", e))
    }
}
