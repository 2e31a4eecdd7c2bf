//! Parsing and structural validation of object inventories
//! (`inventory.json`).
//!
//! Validation covers only what indexing relies on: a known inventory type,
//! a contiguous version sequence ending at `head`, a well-formed manifest,
//! and version states that reference manifest entries. Fixity blocks are
//! parsed but not checked.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

use crate::digests::{Digest, DigestAlgorithm};
use crate::tree::LeafEntry;

pub const INVENTORY_FILE: &str = "inventory.json";
pub const DEFAULT_CONTENT_DIRECTORY: &str = "content";

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("unable to parse inventory: {0}")]
    Parse(String),

    #[error("unknown inventory type: {0}")]
    UnknownType(String),

    #[error("inventory id is empty")]
    EmptyId,

    #[error("head {0} is not among the inventory versions")]
    MissingHead(VNum),

    #[error("expected version {expected}, found {found}")]
    VersionSequence { expected: VNum, found: VNum },

    #[error("invalid content directory: {0:?}")]
    InvalidContentDirectory(String),

    #[error("invalid digest in manifest: {0:?}")]
    InvalidDigest(String),

    #[error("manifest entry {0} lists no content paths")]
    EmptyManifestEntry(String),

    #[error("version {version} references digest {digest} missing from the manifest")]
    UnknownDigest { version: VNum, digest: String },

    #[error("invalid version number: {0:?}")]
    InvalidVNum(String),

    #[error("sidecar digest mismatch: expected {expected}, got {actual}")]
    SidecarMismatch { expected: String, actual: String },

    #[error("malformed sidecar: {0:?}")]
    MalformedSidecar(String),
}

/// A version number such as `v1` or the zero-padded `v0003`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, DeserializeFromStr, SerializeDisplay)]
pub struct VNum {
    num: u32,
    padding: u8,
}

impl VNum {
    pub fn new(num: u32) -> Self {
        Self { num, padding: 0 }
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn padding(&self) -> u8 {
        self.padding
    }

    /// The version number following this one, with the same padding.
    pub fn next(&self) -> Self {
        Self {
            num: self.num + 1,
            padding: self.padding,
        }
    }
}

impl Ord for VNum {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.num
            .cmp(&other.num)
            .then(self.padding.cmp(&other.padding))
    }
}

impl PartialOrd for VNum {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::str::FromStr for VNum {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidVNum(s.to_string());
        let digits = s.strip_prefix('v').ok_or_else(invalid)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let num: u32 = digits.parse().map_err(|_| invalid())?;
        if num == 0 {
            return Err(invalid());
        }
        let padding = if digits.starts_with('0') {
            u8::try_from(digits.len()).map_err(|_| invalid())?
        } else {
            0
        };
        Ok(Self { num, padding })
    }
}

impl std::fmt::Display for VNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.padding > 0 {
            write!(f, "v{:0width$}", self.num, width = self.padding as usize)
        } else {
            write!(f, "v{}", self.num)
        }
    }
}

/// OCFL specification version an inventory declares through its `type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, DeserializeFromStr, SerializeDisplay)]
pub enum Spec {
    Ocfl1_0,
    Ocfl1_1,
}

impl Spec {
    fn from_type(t: &str) -> Result<Self, Error> {
        match t {
            "https://ocfl.io/1.0/spec/#inventory" => Ok(Spec::Ocfl1_0),
            "https://ocfl.io/1.1/spec/#inventory" => Ok(Spec::Ocfl1_1),
            other => Err(Error::UnknownType(other.to_string())),
        }
    }
}

impl std::str::FromStr for Spec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(Spec::Ocfl1_0),
            "1.1" => Ok(Spec::Ocfl1_1),
            other => Err(Error::UnknownType(other.to_string())),
        }
    }
}

impl std::fmt::Display for Spec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Spec::Ocfl1_0 => f.write_str("1.0"),
            Spec::Ocfl1_1 => f.write_str("1.1"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Version {
    pub created: DateTime<FixedOffset>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user: Option<User>,
    /// digest → logical paths
    pub state: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub id: String,
    #[serde(rename = "type")]
    pub inventory_type: String,
    pub digest_algorithm: DigestAlgorithm,
    pub head: VNum,
    #[serde(default)]
    pub content_directory: Option<String>,
    /// digest → content paths, relative to the object root
    pub manifest: BTreeMap<String, Vec<String>>,
    pub versions: BTreeMap<VNum, Version>,
    #[serde(default)]
    pub fixity: BTreeMap<String, BTreeMap<String, Vec<String>>>,

    #[serde(skip)]
    digest: Digest,
}

impl Inventory {
    /// Parses and validates the raw bytes of an `inventory.json`.
    /// The inventory digest is computed over the same bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let mut inv: Inventory =
            serde_json::from_slice(data).map_err(|e| Error::Parse(e.to_string()))?;
        inv.validate()?;
        inv.digest = inv.digest_algorithm.hash(data);
        Ok(inv)
    }

    /// Digest of the inventory file itself, using its own algorithm.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn spec(&self) -> Result<Spec, Error> {
        Spec::from_type(&self.inventory_type)
    }

    pub fn content_directory(&self) -> &str {
        self.content_directory
            .as_deref()
            .unwrap_or(DEFAULT_CONTENT_DIRECTORY)
    }

    pub fn head_version(&self) -> Option<&Version> {
        self.versions.get(&self.head)
    }

    /// Name of the sidecar file holding the inventory digest.
    pub fn sidecar_name(&self) -> String {
        format!("{}.{}", INVENTORY_FILE, self.digest_algorithm)
    }

    /// Checks the contents of the sidecar file against the inventory digest.
    pub fn check_sidecar(&self, sidecar: &[u8]) -> Result<(), Error> {
        let text = std::str::from_utf8(sidecar)
            .map_err(|_| Error::MalformedSidecar("not utf-8".to_string()))?;
        let mut fields = text.split_whitespace();
        let (Some(expected), Some(INVENTORY_FILE), None) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::MalformedSidecar(text.trim().to_string()));
        };
        let expected =
            Digest::from_hex(expected).map_err(|e| Error::MalformedSidecar(e.to_string()))?;
        if expected != self.digest {
            return Err(Error::SidecarMismatch {
                expected: expected.to_hex(),
                actual: self.digest.to_hex(),
            });
        }
        Ok(())
    }

    /// Returns the leaves of a version's logical state. Each leaf carries
    /// the first manifest path for its digest as content path.
    pub fn version_entries(&self, vnum: &VNum) -> Option<Vec<LeafEntry>> {
        let version = self.versions.get(vnum)?;
        let mut entries = Vec::new();
        for (digest, logical_paths) in &version.state {
            let content_path = self.manifest.get(digest)?.first()?;
            for logical_path in logical_paths {
                entries.push(LeafEntry {
                    logical_path: logical_path.clone(),
                    digest: digest.clone(),
                    content_path: content_path.clone(),
                });
            }
        }
        Some(entries)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.id.is_empty() {
            return Err(Error::EmptyId);
        }
        self.spec()?;

        let content_dir = self.content_directory();
        if content_dir.is_empty()
            || content_dir.contains('/')
            || content_dir == "."
            || content_dir == ".."
        {
            return Err(Error::InvalidContentDirectory(content_dir.to_string()));
        }

        if !self.versions.contains_key(&self.head) {
            return Err(Error::MissingHead(self.head));
        }
        let mut expected = VNum {
            num: 1,
            padding: self.head.padding,
        };
        for vnum in self.versions.keys() {
            if *vnum != expected {
                return Err(Error::VersionSequence {
                    expected,
                    found: *vnum,
                });
            }
            expected = expected.next();
        }

        for (digest, paths) in &self.manifest {
            Digest::from_hex(digest).map_err(|_| Error::InvalidDigest(digest.clone()))?;
            if paths.is_empty() || paths.iter().any(|p| p.is_empty()) {
                return Err(Error::EmptyManifestEntry(digest.clone()));
            }
        }

        for (vnum, version) in &self.versions {
            for digest in version.state.keys() {
                if !self.manifest.contains_key(digest) {
                    return Err(Error::UnknownDigest {
                        version: *vnum,
                        digest: digest.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Inventory, Spec, VNum};
    use crate::digests::DigestAlgorithm;
    use rstest::rstest;

    const DIGEST_A: &str = "aa11";
    const DIGEST_B: &str = "bb22";

    fn inventory_json(head: &str, versions: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "ark:/12345/obj",
            "type": "https://ocfl.io/1.1/spec/#inventory",
            "digestAlgorithm": "sha512",
            "head": head,
            "manifest": {
                DIGEST_A: ["v1/content/a.txt"],
                DIGEST_B: ["v2/content/b.txt", "v2/content/b-copy.txt"],
            },
            "versions": versions,
        }))
        .unwrap()
    }

    fn version(state: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "created": "2021-03-04T05:06:07Z",
            "message": "msg",
            "user": {"name": "A Person", "address": "mailto:a@example.org"},
            "state": state,
        })
    }

    #[test]
    fn parse_valid() {
        let data = inventory_json(
            "v2",
            serde_json::json!({
                "v1": version(serde_json::json!({DIGEST_A: ["a.txt"]})),
                "v2": version(serde_json::json!({DIGEST_A: ["a.txt"], DIGEST_B: ["dir/b.txt"]})),
            }),
        );
        let inv = Inventory::from_bytes(&data).expect("must parse");

        assert_eq!(Ok(Spec::Ocfl1_1), inv.spec());
        assert_eq!("content", inv.content_directory());
        assert_eq!(DigestAlgorithm::Sha512.hash(&data), *inv.digest());
        assert_eq!("inventory.json.sha512", inv.sidecar_name());

        let entries = inv.version_entries(&VNum::new(2)).expect("v2 exists");
        assert_eq!(2, entries.len());
        let b = entries
            .iter()
            .find(|e| e.logical_path == "dir/b.txt")
            .expect("b present");
        assert_eq!("v2/content/b.txt", b.content_path);
    }

    #[test]
    fn missing_head() {
        let data = inventory_json(
            "v2",
            serde_json::json!({"v1": version(serde_json::json!({DIGEST_A: ["a.txt"]}))}),
        );
        assert_eq!(
            Error::MissingHead(VNum::new(2)),
            Inventory::from_bytes(&data).unwrap_err()
        );
    }

    #[test]
    fn version_gap() {
        let data = inventory_json(
            "v3",
            serde_json::json!({
                "v1": version(serde_json::json!({})),
                "v3": version(serde_json::json!({})),
            }),
        );
        assert!(matches!(
            Inventory::from_bytes(&data),
            Err(Error::VersionSequence { .. })
        ));
    }

    #[test]
    fn unknown_state_digest() {
        let data = inventory_json(
            "v1",
            serde_json::json!({"v1": version(serde_json::json!({"cc33": ["c.txt"]}))}),
        );
        assert!(matches!(
            Inventory::from_bytes(&data),
            Err(Error::UnknownDigest { .. })
        ));
    }

    #[test]
    fn not_json() {
        assert!(matches!(
            Inventory::from_bytes(b"{not json"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn sidecar() {
        let data = inventory_json(
            "v1",
            serde_json::json!({"v1": version(serde_json::json!({}))}),
        );
        let inv = Inventory::from_bytes(&data).unwrap();
        let good = format!("{}  inventory.json\n", inv.digest().to_hex());
        inv.check_sidecar(good.as_bytes()).expect("sidecar matches");

        let bad = format!("{}  inventory.json\n", DigestAlgorithm::Sha512.hash(b"x"));
        assert!(matches!(
            inv.check_sidecar(bad.as_bytes()),
            Err(Error::SidecarMismatch { .. })
        ));
        assert!(matches!(
            inv.check_sidecar(b"garbage"),
            Err(Error::MalformedSidecar(_))
        ));
    }

    #[rstest]
    #[case::plain("v1", 1, 0)]
    #[case::padded("v003", 3, 3)]
    #[case::large("v120", 120, 0)]
    fn vnum_parse(#[case] s: &str, #[case] num: u32, #[case] padding: u8) {
        let v: VNum = s.parse().expect("must parse");
        assert_eq!(num, v.num());
        assert_eq!(padding, v.padding());
        assert_eq!(s, v.to_string());
    }

    #[rstest]
    #[case::zero("v0")]
    #[case::no_prefix("1")]
    #[case::empty("v")]
    #[case::sign("v+1")]
    fn vnum_invalid(#[case] s: &str) {
        assert!(s.parse::<VNum>().is_err());
    }

    #[test]
    fn vnum_orders_numerically() {
        let mut v: Vec<VNum> = ["v10", "v2", "v1"].iter().map(|s| s.parse().unwrap()).collect();
        v.sort();
        assert_eq!(vec![VNum::new(1), VNum::new(2), VNum::new(10)], v);
    }
}
