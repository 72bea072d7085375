//! AES-128-CBC segment decryption
//!
//! HLS segments encrypted with `METHOD=AES-128` use one key for a run of
//! segments and a per-segment IV: the manifest's explicit `IV` attribute
//! when present, otherwise the 16-byte big-endian encoding of the segment's
//! media-sequence number.

use aes::Aes128;
use cbc::Decryptor;
use cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

use crate::core::error_handling::DownloadError;

/// IV for a segment: explicit manifest IV, else the big-endian sequence
/// number padded to 16 bytes (the HLS default convention).
pub fn derive_iv(explicit: Option<[u8; 16]>, sequence: u64) -> [u8; 16] {
    match explicit {
        Some(iv) => iv,
        None => (sequence as u128).to_be_bytes(),
    }
}

/// Decrypt one segment with AES-128-CBC and strip PKCS#7 padding.
pub fn decrypt_segment(
    ciphertext: &[u8],
    key: &[u8; 16],
    iv: &[u8; 16],
    index: usize,
) -> Result<Vec<u8>, DownloadError> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(DownloadError::Decryption {
            index,
            message: format!("ciphertext length {} is not a block multiple", ciphertext.len()),
        });
    }

    let decryptor =
        Decryptor::<Aes128>::new_from_slices(key, iv).map_err(|e| DownloadError::Decryption {
            index,
            message: e.to_string(),
        })?;

    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| DownloadError::Decryption {
            index,
            message: "bad PKCS#7 padding".to_string(),
        })
}
