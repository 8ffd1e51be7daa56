//! Identity and key material: student identifiers, device addresses, and the
//! identifier-to-key derivation both ends run without ever sending the key.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// CBC initialization vector length in bytes.
pub const IV_LEN: usize = 16;

/// Student identifier: exactly nine ASCII digits.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct StudentId(String);

impl StudentId {
    /// Parse and validate an identifier. Surrounding whitespace is ignored.
    pub fn parse(s: &str) -> Result<Self, InvalidStudentId> {
        let s = s.trim();
        if s.len() == 9 && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(StudentId(s.to_string()))
        } else {
            Err(InvalidStudentId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid student id {0:?}: expected nine digits")]
pub struct InvalidStudentId(pub String);

/// Opaque device address reported by the discovery service (MAC-style, 6 bytes).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        DeviceAddress(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Random locally-administered unicast address.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] | 0x02) & 0xfe;
        DeviceAddress(bytes)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = InvalidDeviceAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for b in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| InvalidDeviceAddress(s.to_string()))?;
            if part.len() != 2 {
                return Err(InvalidDeviceAddress(s.to_string()));
            }
            *b = u8::from_str_radix(part, 16).map_err(|_| InvalidDeviceAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(InvalidDeviceAddress(s.to_string()));
        }
        Ok(DeviceAddress(bytes))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid device address {0:?}")]
pub struct InvalidDeviceAddress(pub String);

/// SHA-256 digest of a seed string.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SeedDigest([u8; 32]);

impl SeedDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex text, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Digest of the UTF-8 encoding of `seed`.
pub fn hash(seed: &str) -> SeedDigest {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    SeedDigest(hasher.finalize().into())
}

/// Key bytes: the first 32 characters of the digest's hex text, right-padded with `'0'`.
pub fn derive_key(digest: &SeedDigest) -> [u8; KEY_LEN] {
    take_padded(&digest.to_hex())
}

/// IV bytes: the first 16 characters of the digest's hex text, right-padded with `'0'`.
pub fn derive_iv(digest: &SeedDigest) -> [u8; IV_LEN] {
    take_padded(&digest.to_hex())
}

fn take_padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [b'0'; N];
    for (dst, src) in out.iter_mut().zip(text.bytes()) {
        *dst = src;
    }
    out
}

/// Key and IV derived from a shared identifier.
///
/// The IV is fixed for the whole session and reused for every payload. Identical
/// plaintexts therefore produce identical ciphertexts; CBC confidentiality is weaker
/// than with a per-message IV. Both ends depend on this exact derivation, so it is
/// kept as is.
#[derive(Clone, Eq, PartialEq)]
pub struct SessionKeys {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SessionKeys {
    pub fn from_identifier(identifier: &str) -> Self {
        let digest = hash(identifier);
        Self {
            key: derive_key(&digest),
            iv: derive_iv(&digest),
        }
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn student_id_validation() {
        assert!(StudentId::parse("816012345").is_ok());
        assert_eq!(StudentId::parse(" 816012345\n").unwrap().as_str(), "816012345");
        assert!(StudentId::parse("81601234").is_err());
        assert!(StudentId::parse("8160123456").is_err());
        assert!(StudentId::parse("81601234a").is_err());
        assert!(StudentId::parse("").is_err());
    }

    #[test]
    fn hash_known_vector() {
        // sha256("abc")
        assert_eq!(
            hash("abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn key_and_iv_are_hex_prefixes() {
        let digest = hash("abc");
        assert_eq!(&derive_key(&digest), b"ba7816bf8f01cfea414140de5dae2223");
        assert_eq!(&derive_iv(&digest), b"ba7816bf8f01cfea");
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = SessionKeys::from_identifier("816012345");
        let b = SessionKeys::from_identifier("816012345");
        assert_eq!(a, b);
        let c = SessionKeys::from_identifier("816000000");
        assert_ne!(a, c);
    }

    #[test]
    fn short_text_is_zero_padded() {
        let k: [u8; 8] = take_padded("abc");
        assert_eq!(&k, b"abc00000");
    }

    #[test]
    fn device_address_display_parse() {
        let addr = DeviceAddress::generate();
        let parsed: DeviceAddress = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
        assert!("aa:bb:cc".parse::<DeviceAddress>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<DeviceAddress>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<DeviceAddress>().is_err());
    }
}
