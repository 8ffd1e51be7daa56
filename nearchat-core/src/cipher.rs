//! Payload encryption: AES-256-CBC with PKCS#7 padding, base64 text on the wire.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::identity::SessionKeys;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Encrypt `plaintext` and return base64 text. Key must be 32 bytes, IV 16 bytes.
pub fn encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<String, CryptoError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::KeyLength)?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    Ok(STANDARD.encode(ciphertext))
}

/// Decrypt base64 text produced by [`encrypt`].
pub fn decrypt(ciphertext: &str, key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::KeyLength)?;
    let bytes = STANDARD
        .decode(ciphertext.trim())
        .map_err(|_| CryptoError::Base64)?;
    if bytes.is_empty() || bytes.len() % 16 != 0 {
        return Err(CryptoError::Length(bytes.len()));
    }
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&bytes)
        .map_err(|_| CryptoError::Padding)
}

/// Encrypt UTF-8 text under session keys.
pub fn encrypt_text(plaintext: &str, keys: &SessionKeys) -> Result<String, CryptoError> {
    encrypt(plaintext.as_bytes(), keys.key(), keys.iv())
}

/// Decrypt to UTF-8 text under session keys.
pub fn decrypt_text(ciphertext: &str, keys: &SessionKeys) -> Result<String, CryptoError> {
    let plain = decrypt(ciphertext, keys.key(), keys.iv())?;
    String::from_utf8(plain).map_err(|_| CryptoError::Utf8)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key or iv length")]
    KeyLength,
    #[error("malformed base64")]
    Base64,
    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    Length(usize),
    #[error("bad padding")]
    Padding,
    #[error("plaintext is not valid utf-8")]
    Utf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_derived_keys() {
        let keys = SessionKeys::from_identifier("816012345");
        let long = "x".repeat(1000);
        for plain in ["", "a", "hello nearchat", long.as_str()] {
            let text = encrypt_text(plain, &keys).unwrap();
            assert_eq!(decrypt_text(&text, &keys).unwrap(), plain);
        }
    }

    #[test]
    fn empty_plaintext_is_one_block() {
        let keys = SessionKeys::from_identifier("816012345");
        let text = encrypt(b"", keys.key(), keys.iv()).unwrap();
        assert_eq!(STANDARD.decode(text).unwrap().len(), 16);
    }

    #[test]
    fn wrong_key_length_rejected() {
        assert!(matches!(
            encrypt(b"hi", &[0u8; 16], &[0u8; 16]),
            Err(CryptoError::KeyLength)
        ));
        assert!(matches!(
            decrypt("AAAA", &[0u8; 32], &[0u8; 8]),
            Err(CryptoError::KeyLength)
        ));
    }

    #[test]
    fn malformed_input_is_typed_failure() {
        let keys = SessionKeys::from_identifier("816012345");
        assert!(matches!(
            decrypt_text("not base64!!", &keys),
            Err(CryptoError::Base64)
        ));
        // 5 bytes: not block aligned.
        assert!(matches!(
            decrypt_text(&STANDARD.encode([1u8; 5]), &keys),
            Err(CryptoError::Length(5))
        ));
    }

    #[test]
    fn other_identifier_does_not_recover_plaintext() {
        let honest = SessionKeys::from_identifier("816012345");
        let other = SessionKeys::from_identifier("816000000");
        let text = encrypt_text("challenge-1234", &other).unwrap();
        match decrypt_text(&text, &honest) {
            Ok(plain) => assert_ne!(plain, "challenge-1234"),
            Err(_) => {}
        }
    }
}
