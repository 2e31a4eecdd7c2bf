//! OCFL objects for tests, written into a [MemoryFs].

use bytes::Bytes;
use lazy_static::lazy_static;
use serde_json::{json, Value};

use crate::digests::{Digest, DigestAlgorithm};
use crate::fs::{join, MemoryFs, OBJECT_DECLARATION_PREFIX};
use crate::inventory::INVENTORY_FILE;

pub const FILE_A_CONTENTS: &[u8] = b"hello";
pub const FILE_B_CONTENTS: &[u8] = b"goodbye";
pub const FILE_C_CONTENTS: &[u8] = b"0123456789";

pub const INVENTORY_TYPE_1_1: &str = "https://ocfl.io/1.1/spec/#inventory";

lazy_static! {
    pub static ref FILE_A_DIGEST: Digest = DigestAlgorithm::Sha512.hash(FILE_A_CONTENTS);
    pub static ref FILE_B_DIGEST: Digest = DigestAlgorithm::Sha512.hash(FILE_B_CONTENTS);
    pub static ref FILE_C_DIGEST: Digest = DigestAlgorithm::Sha512.hash(FILE_C_CONTENTS);

    /// `obj-1` with a single version holding `a.txt` (5 bytes) and
    /// `b/c.txt` (7 bytes).
    pub static ref OBJECT_1: FixtureObject = FixtureObject::new("obj-1")
        .version("M1", &[("a.txt", FILE_A_CONTENTS), ("b/c.txt", FILE_B_CONTENTS)]);

    /// `obj-2` sharing the `b` directory of [OBJECT_1], in two versions.
    pub static ref OBJECT_2: FixtureObject = FixtureObject::new("obj-2")
        .version("first", &[("b/c.txt", FILE_B_CONTENTS)])
        .version(
            "second",
            &[("b/c.txt", FILE_B_CONTENTS), ("d/e/f.txt", FILE_C_CONTENTS)],
        );
}

#[derive(Clone, Debug)]
pub struct FixtureVersion {
    pub message: String,
    /// RFC 3339
    pub created: String,
    /// logical path → contents
    pub files: Vec<(String, Bytes)>,
}

/// An OCFL object using sha512, with content stored below the version that
/// introduced it.
#[derive(Clone, Debug)]
pub struct FixtureObject {
    pub id: String,
    pub versions: Vec<FixtureVersion>,
}

impl FixtureObject {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            versions: Vec::new(),
        }
    }

    /// Appends a version created on the n-th of January 2024.
    pub fn version(self, message: &str, files: &[(&str, &[u8])]) -> Self {
        let created = format!("2024-01-{:02}T00:00:00Z", self.versions.len() + 1);
        self.version_at(message, &created, files)
    }

    pub fn version_at(mut self, message: &str, created: &str, files: &[(&str, &[u8])]) -> Self {
        self.versions.push(FixtureVersion {
            message: message.to_string(),
            created: created.to_string(),
            files: files
                .iter()
                .map(|(path, data)| (path.to_string(), Bytes::copy_from_slice(data)))
                .collect(),
        });
        self
    }

    /// Content paths and their contents, relative to the object root.
    pub fn content(&self) -> Vec<(String, Bytes)> {
        let mut seen = std::collections::HashSet::new();
        let mut content = Vec::new();
        for (n, version) in self.versions.iter().enumerate() {
            for (path, data) in &version.files {
                if seen.insert(DigestAlgorithm::Sha512.hash(data)) {
                    content.push((format!("v{}/content/{}", n + 1, path), data.clone()));
                }
            }
        }
        content
    }

    pub fn inventory(&self) -> Value {
        let mut manifest = serde_json::Map::new();
        for (path, data) in self.content() {
            manifest.insert(
                DigestAlgorithm::Sha512.hash(&data).to_hex(),
                json!([path]),
            );
        }

        let mut versions = serde_json::Map::new();
        for (n, version) in self.versions.iter().enumerate() {
            let mut state = serde_json::Map::new();
            for (path, data) in &version.files {
                let digest = DigestAlgorithm::Sha512.hash(data).to_hex();
                match state.get_mut(&digest) {
                    Some(Value::Array(paths)) => paths.push(json!(path)),
                    _ => {
                        state.insert(digest, json!([path]));
                    }
                }
            }
            versions.insert(
                format!("v{}", n + 1),
                json!({
                    "created": version.created,
                    "message": version.message,
                    "user": {"name": "Tester", "address": "mailto:tester@example.org"},
                    "state": state,
                }),
            );
        }

        json!({
            "id": self.id,
            "type": INVENTORY_TYPE_1_1,
            "digestAlgorithm": "sha512",
            "head": format!("v{}", self.versions.len()),
            "manifest": manifest,
            "versions": versions,
        })
    }

    /// Writes the object declaration, inventory, sidecar and content files
    /// below `root`.
    pub fn write_to(&self, fs: &MemoryFs, root: &str) {
        fs.insert(
            join(root, &format!("{}1.1", OBJECT_DECLARATION_PREFIX)),
            "ocfl_object_1.1\n",
        );
        write_inventory(fs, root, &self.inventory());
        for (path, data) in self.content() {
            fs.insert(join(root, &path), data);
        }
    }
}

/// Writes an inventory and its sidecar below `root`.
pub fn write_inventory(fs: &MemoryFs, root: &str, inventory: &Value) {
    let data = serde_json::to_vec_pretty(inventory).expect("inventory must serialize");
    let digest = DigestAlgorithm::Sha512.hash(&data);
    fs.insert(
        join(root, &format!("{}.sha512", INVENTORY_FILE)),
        format!("{} {}\n", digest, INVENTORY_FILE),
    );
    fs.insert(join(root, INVENTORY_FILE), data);
}

/// Declares a storage root using the flat-direct layout.
pub fn write_flat_direct_layout(fs: &MemoryFs) {
    fs.insert("0=ocfl_1.1", "ocfl_1.1\n");
    fs.insert(
        "ocfl_layout.json",
        json!({
            "extension": "0002-flat-direct-storage-layout",
            "description": "one object per directory, named by id",
        })
        .to_string(),
    );
}
