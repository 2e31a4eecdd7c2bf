use bytes::Bytes;
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use thiserror::Error;

/// A raw content digest, displayed as lowercase hex.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(Bytes);

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid hex digest: {0:?}")]
    InvalidHex(String),

    #[error("empty digest")]
    Empty,

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl Digest {
    /// Decodes a hex digest. Upper case input is accepted.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::Empty);
        }
        HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map(|b| Self(b.into()))
            .map_err(|_| Error::InvalidHex(s.to_string()))
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Digest> for Bytes {
    fn from(val: Digest) -> Self {
        val.0
    }
}

impl From<&[u8]> for Digest {
    fn from(value: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for Digest {
    fn from(value: Vec<u8>) -> Self {
        Self(value.into())
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Digest algorithms an inventory may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha512,
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha512 => "sha512",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn hash(&self, data: &[u8]) -> Digest {
        match self {
            DigestAlgorithm::Sha512 => sha2::Sha512::digest(data).to_vec().into(),
            DigestAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec().into(),
        }
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha512" => Ok(DigestAlgorithm::Sha512),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            other => Err(Error::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{Digest, DigestAlgorithm, Error};

    #[test]
    fn hex_roundtrip_normalizes_case() {
        let d = Digest::from_hex("ABCDEF01").expect("must parse");
        assert_eq!("abcdef01", d.to_string());
        assert_eq!(4, d.len());
    }

    #[test]
    fn rejects_bad_hex() {
        assert_eq!(
            Err(Error::InvalidHex("xyz".to_string())),
            Digest::from_hex("xyz")
        );
        assert_eq!(Err(Error::Empty), Digest::from_hex(""));
    }

    #[test]
    fn sha256_known_value() {
        assert_eq!(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            DigestAlgorithm::Sha256.hash(b"").to_hex()
        );
        assert_eq!(64, DigestAlgorithm::Sha512.hash(b"").len());
    }
}
