//! Streaming AES-CTR decryption for encrypted payloads.
//!
//! Hosts that serve encrypted blobs (the ciphertext is what travels over
//! HTTP) publish an AES key and counter IV alongside the file. CTR mode is a
//! keystream cipher, so decryption happens in-order as chunks arrive; the
//! [`Decryptor`] tracks the keystream offset and every chunk must be applied
//! exactly once, in arrival order. Because the keystream position is bound
//! to the byte offset, encrypted transfers never resume mid-file.

use aes::cipher::{KeyIvInit, StreamCipher};

use super::error::DownloadError;
use super::task::FileInfo;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Decryption state for a transfer.
///
/// `None` for plaintext sources; `AesCtr` carries the cipher and the current
/// keystream offset for encrypted ones.
pub(crate) enum Decryptor {
    /// Plaintext source; chunks pass through untouched.
    None,
    /// AES-CTR keystream decryption.
    AesCtr(AesCtrState),
}

/// AES-CTR cipher plus the byte offset the keystream has advanced to.
pub(crate) struct AesCtrState {
    cipher: CtrCipher,
    offset: u64,
}

enum CtrCipher {
    Aes128(Box<Aes128Ctr>),
    Aes192(Box<Aes192Ctr>),
    Aes256(Box<Aes256Ctr>),
}

impl Decryptor {
    /// Builds the decryptor for a task, validating key material.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError::Config` when the task is marked encrypted but
    /// the key or IV is missing or has an unsupported length. Key must be
    /// 16, 24, or 32 bytes; IV must be 16 bytes.
    pub(crate) fn for_file(info: &FileInfo) -> Result<Self, DownloadError> {
        if !info.encrypted {
            return Ok(Self::None);
        }

        let key = info
            .encryption_key
            .as_deref()
            .ok_or_else(|| DownloadError::config("encrypted source is missing its key"))?;
        let iv = info
            .encryption_iv
            .as_deref()
            .ok_or_else(|| DownloadError::config("encrypted source is missing its IV"))?;

        if iv.len() != 16 {
            return Err(DownloadError::config(format!(
                "AES-CTR IV must be 16 bytes, got {}",
                iv.len()
            )));
        }

        let cipher = match key.len() {
            16 => CtrCipher::Aes128(Box::new(Aes128Ctr::new(key.into(), iv.into()))),
            24 => CtrCipher::Aes192(Box::new(Aes192Ctr::new(key.into(), iv.into()))),
            32 => CtrCipher::Aes256(Box::new(Aes256Ctr::new(key.into(), iv.into()))),
            other => {
                return Err(DownloadError::config(format!(
                    "AES key must be 16, 24, or 32 bytes, got {other}"
                )));
            }
        };

        Ok(Self::AesCtr(AesCtrState { cipher, offset: 0 }))
    }

    /// Returns true when decryption is active.
    pub(crate) fn is_active(&self) -> bool {
        matches!(self, Self::AesCtr(_))
    }

    /// Applies the keystream to a chunk in place, advancing the offset.
    ///
    /// Chunks must be applied in arrival order; the offset advances by the
    /// chunk length each call so the keystream stays contiguous.
    pub(crate) fn apply(&mut self, chunk: &mut [u8]) {
        match self {
            Self::None => {}
            Self::AesCtr(state) => {
                match &mut state.cipher {
                    CtrCipher::Aes128(c) => c.apply_keystream(chunk),
                    CtrCipher::Aes192(c) => c.apply_keystream(chunk),
                    CtrCipher::Aes256(c) => c.apply_keystream(chunk),
                }
                state.offset += chunk.len() as u64;
            }
        }
    }

    /// Keystream offset in bytes (0 for plaintext transfers).
    #[cfg(test)]
    pub(crate) fn offset(&self) -> u64 {
        match self {
            Self::None => 0,
            Self::AesCtr(state) => state.offset,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn encrypted_info(key_len: usize, iv_len: usize) -> FileInfo {
        let mut info = FileInfo::new("https://example.com/blob.enc", "blob.bin");
        info.encrypted = true;
        info.encryption_key = Some(vec![0x42; key_len]);
        info.encryption_iv = Some(vec![0x24; iv_len]);
        info
    }

    fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
        // CTR is symmetric: applying the keystream to plaintext encrypts it
        let mut cipher = Aes128Ctr::new(key.into(), iv.into());
        let mut buf = plaintext.to_vec();
        cipher.apply_keystream(&mut buf);
        buf
    }

    #[test]
    fn test_plaintext_source_gets_noop_decryptor() {
        let info = FileInfo::new("https://example.com/file.bin", "file.bin");
        let decryptor = Decryptor::for_file(&info).unwrap();
        assert!(!decryptor.is_active());
        assert_eq!(decryptor.offset(), 0);
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let mut info = FileInfo::new("https://example.com/blob.enc", "blob.bin");
        info.encrypted = true;
        info.encryption_iv = Some(vec![0; 16]);
        let result = Decryptor::for_file(&info);
        assert!(matches!(result, Err(DownloadError::Config { .. })));
    }

    #[test]
    fn test_missing_iv_is_config_error() {
        let mut info = FileInfo::new("https://example.com/blob.enc", "blob.bin");
        info.encrypted = true;
        info.encryption_key = Some(vec![0; 16]);
        let result = Decryptor::for_file(&info);
        assert!(matches!(result, Err(DownloadError::Config { .. })));
    }

    #[test]
    fn test_bad_key_length_is_config_error() {
        let result = Decryptor::for_file(&encrypted_info(15, 16));
        assert!(matches!(result, Err(DownloadError::Config { .. })));
    }

    #[test]
    fn test_bad_iv_length_is_config_error() {
        let result = Decryptor::for_file(&encrypted_info(16, 12));
        assert!(matches!(result, Err(DownloadError::Config { .. })));
    }

    #[test]
    fn test_all_key_sizes_accepted() {
        for key_len in [16, 24, 32] {
            let decryptor = Decryptor::for_file(&encrypted_info(key_len, 16)).unwrap();
            assert!(decryptor.is_active(), "key length {key_len}");
        }
    }

    #[test]
    fn test_chunked_decryption_matches_whole_buffer() {
        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let plaintext: Vec<u8> = (0..100u8).cycle().take(5000).collect();
        let ciphertext = encrypt(&key, &iv, &plaintext);

        let mut info = FileInfo::new("https://example.com/blob.enc", "blob.bin");
        info.encrypted = true;
        info.encryption_key = Some(key.to_vec());
        info.encryption_iv = Some(iv.to_vec());
        let mut decryptor = Decryptor::for_file(&info).unwrap();

        // Decrypt in uneven chunk sizes that straddle the 16-byte block size
        let mut recovered = Vec::new();
        let mut rest = ciphertext.as_slice();
        for size in [1usize, 7, 16, 33, 1000, 4096] {
            let take = size.min(rest.len());
            let mut chunk = rest[..take].to_vec();
            decryptor.apply(&mut chunk);
            recovered.extend_from_slice(&chunk);
            rest = &rest[take..];
        }
        let mut tail = rest.to_vec();
        decryptor.apply(&mut tail);
        recovered.extend_from_slice(&tail);

        assert_eq!(recovered, plaintext);
        assert_eq!(decryptor.offset(), plaintext.len() as u64);
    }

    #[test]
    fn test_offset_advances_per_chunk() {
        let mut decryptor = Decryptor::for_file(&encrypted_info(16, 16)).unwrap();
        let mut a = vec![0u8; 10];
        let mut b = vec![0u8; 22];
        decryptor.apply(&mut a);
        assert_eq!(decryptor.offset(), 10);
        decryptor.apply(&mut b);
        assert_eq!(decryptor.offset(), 32);
    }
}
