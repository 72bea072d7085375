//! HLS pipeline integration tests
//!
//! Exercises the decrypt-and-assemble stages together, the way the segment
//! workers drive them: parse a manifest, encrypt known plaintext the way a
//! CDN would, complete segments out of order, and verify the assembled
//! output byte for byte.

#[cfg(test)]
mod tests {
    use super::super::assembler::SegmentSink;
    use super::super::decrypt::{decrypt_segment, derive_iv};
    use super::super::error_handling::{DownloadError, RetryPolicy};
    use super::super::playlist::{parse_playlist, Parsed};
    use aes::Aes128;
    use cbc::Encryptor;
    use cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
    use tempfile::tempdir;
    use url::Url;

    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        Encryptor::<Aes128>::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    fn base() -> Url {
        Url::parse("https://cdn.example.com/course/index.m3u8").unwrap()
    }

    /// Full manifest-to-file run: three AES-128 segments with default IVs,
    /// completing in reverse order, must still assemble in manifest order.
    #[tokio::test]
    async fn encrypted_segments_assemble_in_manifest_order() {
        let body = "#EXTM3U\n\
            #EXT-X-MEDIA-SEQUENCE:7\n\
            #EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"\n\
            #EXTINF:4.0,\n\
            s0.ts\n\
            #EXTINF:4.0,\n\
            s1.ts\n\
            #EXTINF:4.0,\n\
            s2.ts\n";

        let Parsed::Media(playlist) = parse_playlist(&base(), body).unwrap() else {
            panic!("expected media playlist");
        };
        assert!(playlist.is_encrypted());

        let key = [0u8; 16];
        let plains: Vec<Vec<u8>> = vec![
            b"first segment ".to_vec(),
            b"second segment, longer than one aes block for realism".to_vec(),
            b"third".to_vec(),
        ];

        // Encrypt each segment with its sequence-derived IV (7, 8, 9)
        let ciphers: Vec<Vec<u8>> = playlist
            .segments
            .iter()
            .zip(&plains)
            .map(|(seg, plain)| {
                let iv = derive_iv(None, seg.sequence);
                encrypt(plain, &key, &iv)
            })
            .collect();

        let dir = tempdir().unwrap();
        let mut sink = SegmentSink::create(dir.path(), base().as_str(), 7, 3)
            .await
            .unwrap();

        // Workers finish in reverse order
        for index in [2usize, 1, 0] {
            let seg = &playlist.segments[index];
            let iv = derive_iv(None, seg.sequence);
            let plain = decrypt_segment(&ciphers[index], &key, &iv, index).unwrap();
            sink.push(index, plain).await.unwrap();
        }

        let temp = sink.finalize().await.unwrap();
        let assembled = tokio::fs::read(&temp).await.unwrap();
        let expected: Vec<u8> = plains.concat();
        assert_eq!(assembled, expected);
    }

    /// An explicit IV on the key tag overrides the sequence-derived default.
    #[test]
    fn explicit_iv_overrides_sequence_default() {
        let explicit = [0xAB; 16];
        assert_eq!(derive_iv(Some(explicit), 999), explicit);

        // Default: 16-byte big-endian media-sequence number
        let derived = derive_iv(None, 0x0102);
        let mut expected = [0u8; 16];
        expected[14] = 0x01;
        expected[15] = 0x02;
        assert_eq!(derived, expected);
    }

    /// Decrypting with the wrong IV must fail or produce different bytes,
    /// never silently yield the original plaintext.
    #[test]
    fn wrong_iv_never_round_trips() {
        let key = [3u8; 16];
        let plaintext = b"sixteen byte msg plus some tail";
        let cipher = encrypt(plaintext, &key, &derive_iv(None, 5));

        match decrypt_segment(&cipher, &key, &derive_iv(None, 6), 0) {
            Ok(wrong) => assert_ne!(wrong, plaintext.to_vec()),
            Err(DownloadError::Decryption { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    /// Retry backoff grows per attempt and stays under the cap.
    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        let d1 = policy.delay_for_attempt(1);
        let d2 = policy.delay_for_attempt(2);
        let d3 = policy.delay_for_attempt(3);

        // With 20% jitter the windows of consecutive attempts cannot overlap
        assert!(d1 < d2 && d2 < d3, "{d1:?} {d2:?} {d3:?}");
        assert!(policy.delay_for_attempt(30) <= policy.max_delay);
    }

    /// Exhausted segment retries surface the index and attempt count so the
    /// failure message can name the culprit.
    #[test]
    fn exhausted_fetch_error_names_the_segment() {
        let err = DownloadError::SegmentFetch {
            index: 17,
            attempts: 3,
            message: "HTTP 503 Service Unavailable".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("17"), "{text}");
        assert!(text.contains('3'), "{text}");
        assert!(err.is_retryable());
    }
}
