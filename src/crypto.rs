//! # Stream Encryption
//!
//! Symmetric encryption of byte streams for data moving between nodes.
//!
//! - AES-256 in counter mode (128-bit big-endian counter)
//! - A fresh random IV per stream, written as a plaintext prefix
//! - Bounded 32 KiB copy buffer, so arbitrarily large inputs never sit in memory
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use distvault::crypto::{copy_decrypt, copy_encrypt, new_encryption_key};
//!
//! async fn roundtrip() -> anyhow::Result<()> {
//!     let key = new_encryption_key();
//!     let mut ciphertext = Vec::new();
//!     copy_encrypt(&key, &mut &b"secret"[..], &mut ciphertext).await?;
//!
//!     let mut plaintext = Vec::new();
//!     copy_decrypt(&key, &mut ciphertext.as_slice(), &mut plaintext).await?;
//!     assert_eq!(plaintext, b"secret");
//!     Ok(())
//! }
//! ```

use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Required key length in bytes.
pub const KEY_LEN: usize = 32;

/// IV length in bytes (the AES block size).
pub const IV_LEN: usize = 16;

// max amount copied into memory per read
const COPY_BUF_SIZE: usize = 32 * 1024;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("stream too short to contain a {IV_LEN} byte IV")]
    TruncatedIv,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Generate a random 32 byte key suitable for [`copy_encrypt`].
pub fn new_encryption_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Generate a random node identifier (32 random bytes, hex encoded).
pub fn generate_id() -> String {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Encrypt everything in `src` into `dst`.
///
/// The IV is written first, in the clear. Returns the number of bytes written
/// to `dst`, which is always `IV_LEN` more than the plaintext length.
pub async fn copy_encrypt<R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    check_key(key)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    dst.write_all(&iv).await?;

    let mut cipher = new_cipher(key, &iv)?;
    let n = copy_stream(&mut cipher, src, dst).await?;
    Ok(n + IV_LEN as u64)
}

/// Decrypt a stream produced by [`copy_encrypt`].
///
/// Returns the number of plaintext bytes written to `dst`.
pub async fn copy_decrypt<R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    check_key(key)?;

    let mut iv = [0u8; IV_LEN];
    if let Err(e) = src.read_exact(&mut iv).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => CryptoError::TruncatedIv,
            _ => CryptoError::Io(e),
        });
    }

    let mut cipher = new_cipher(key, &iv)?;
    copy_stream(&mut cipher, src, dst).await
}

fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    Ok(())
}

fn new_cipher(key: &[u8], iv: &[u8; IV_LEN]) -> Result<Aes256Ctr, CryptoError> {
    Aes256Ctr::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength(key.len()))
}

async fn copy_stream<R, W>(cipher: &mut Aes256Ctr, src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut written = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }

    dst.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    async fn encrypt(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        copy_encrypt(key, &mut &data[..], &mut out).await.unwrap();
        out
    }

    async fn decrypt(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        copy_decrypt(key, &mut &data[..], &mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let key = new_encryption_key();
        let payload = b"Foo not bar";

        let mut ciphertext = Vec::new();
        let written = copy_encrypt(&key, &mut &payload[..], &mut ciphertext).await.unwrap();
        assert_eq!(written, (payload.len() + IV_LEN) as u64);
        assert_eq!(ciphertext.len(), payload.len() + IV_LEN);
        assert_ne!(&ciphertext[IV_LEN..], &payload[..]);

        let mut plaintext = Vec::new();
        let read = copy_decrypt(&key, &mut ciphertext.as_slice(), &mut plaintext).await.unwrap();
        assert_eq!(read, payload.len() as u64);
        assert_eq!(plaintext, payload.to_vec());
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let key = new_encryption_key();
        let ciphertext = encrypt(&key, b"").await;
        assert_eq!(ciphertext.len(), IV_LEN);
        assert!(decrypt(&key, &ciphertext).await.is_empty());
    }

    #[tokio::test]
    async fn test_payload_larger_than_copy_buffer() {
        let key = new_encryption_key();
        let payload: Vec<u8> = (0..COPY_BUF_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();

        let ciphertext = encrypt(&key, &payload).await;
        assert_eq!(ciphertext.len(), payload.len() + IV_LEN);
        assert_eq!(decrypt(&key, &ciphertext).await, payload);
    }

    #[tokio::test]
    async fn test_fresh_iv_per_stream() {
        let key = new_encryption_key();
        let a = encrypt(&key, b"same bytes").await;
        let b = encrypt(&key, b"same bytes").await;
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
    }

    #[tokio::test]
    async fn test_invalid_key_length() {
        let mut out = Vec::new();
        let err = copy_encrypt(&[0u8; 16], &mut &b"data"[..], &mut out).await.unwrap_err();
        assert_matches!(err, CryptoError::InvalidKeyLength(16));
        assert!(out.is_empty());

        let err = copy_decrypt(&[0u8; 31], &mut &[0u8; 32][..], &mut out).await.unwrap_err();
        assert_matches!(err, CryptoError::InvalidKeyLength(31));
    }

    #[tokio::test]
    async fn test_truncated_iv() {
        let key = new_encryption_key();
        let mut out = Vec::new();
        let err = copy_decrypt(&key, &mut &[1u8; IV_LEN - 1][..], &mut out).await.unwrap_err();
        assert_matches!(err, CryptoError::TruncatedIv);
    }

    #[tokio::test]
    async fn test_wrong_key_does_not_recover_plaintext() {
        let ciphertext = encrypt(&new_encryption_key(), b"attack at dawn").await;
        assert_ne!(decrypt(&new_encryption_key(), &ciphertext).await, b"attack at dawn".to_vec());
    }

    #[test]
    fn test_generate_id() {
        let id = generate_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_id());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let key = new_encryption_key();
            let (ciphertext, plaintext) = rt.block_on(async {
                let ciphertext = encrypt(&key, &payload).await;
                let plaintext = decrypt(&key, &ciphertext).await;
                (ciphertext, plaintext)
            });
            prop_assert_eq!(ciphertext.len(), payload.len() + IV_LEN);
            prop_assert_eq!(plaintext, payload);
        }
    }
}
