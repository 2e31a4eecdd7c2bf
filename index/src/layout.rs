//! Storage layouts map object ids to object root paths.
//!
//! Only used when re-indexing objects by id. The layout of a storage root
//! is read from its `ocfl_layout.json`, with parameters optionally taken
//! from `extensions/<name>/config.json`.

use serde::Deserialize;
use tracing::debug;

use crate::digests::DigestAlgorithm;
use crate::fs::{join, ObjectFs, EXTENSIONS_DIR};
use crate::Error;

pub const LAYOUT_FILE: &str = "ocfl_layout.json";
pub const FLAT_DIRECT: &str = "0002-flat-direct-storage-layout";
pub const HASHED_N_TUPLE: &str = "0004-hashed-n-tuple-storage-layout";

pub trait PathResolver: Send + Sync {
    /// Returns the object root path for the given object id.
    fn resolve(&self, id: &str) -> Result<String, Error>;
}

/// Uses the object id as object root path.
#[derive(Clone, Debug, Default)]
pub struct FlatDirect;

impl PathResolver for FlatDirect {
    fn resolve(&self, id: &str) -> Result<String, Error> {
        if id.is_empty() || id == "." || id == ".." || id.contains('/') {
            return Err(Error::InvalidArgument(format!(
                "object id {:?} can not be used as a path",
                id
            )));
        }
        Ok(id.to_string())
    }
}

/// Splits a digest of the object id into tuples forming the parent
/// directories of the object root.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HashedNTuple {
    pub digest_algorithm: DigestAlgorithm,
    pub tuple_size: usize,
    pub number_of_tuples: usize,
    pub short_object_root: bool,
}

impl Default for HashedNTuple {
    fn default() -> Self {
        Self {
            digest_algorithm: DigestAlgorithm::Sha256,
            tuple_size: 3,
            number_of_tuples: 3,
            short_object_root: false,
        }
    }
}

impl HashedNTuple {
    fn check(&self) -> Result<(), Error> {
        let hex_len = self.digest_algorithm.hash(b"").len() * 2;
        let used = self.tuple_size * self.number_of_tuples;
        if (self.tuple_size == 0) != (self.number_of_tuples == 0)
            || used > hex_len
            || (self.short_object_root && used == hex_len)
        {
            return Err(Error::InvalidArgument(format!(
                "invalid {} configuration",
                HASHED_N_TUPLE
            )));
        }
        Ok(())
    }
}

impl PathResolver for HashedNTuple {
    fn resolve(&self, id: &str) -> Result<String, Error> {
        self.check()?;
        let hex = self.digest_algorithm.hash(id.as_bytes()).to_hex();
        let used = self.tuple_size * self.number_of_tuples;

        let mut parts: Vec<&str> = (0..self.number_of_tuples)
            .map(|i| &hex[i * self.tuple_size..(i + 1) * self.tuple_size])
            .collect();
        parts.push(if self.short_object_root {
            &hex[used..]
        } else {
            &hex
        });
        Ok(parts.join("/"))
    }
}

#[derive(Deserialize)]
struct LayoutDeclaration {
    extension: String,
}

/// Reads the layout of the storage root, returning None if it does not
/// declare one.
pub async fn from_storage_root(fs: &dyn ObjectFs) -> Result<Option<Box<dyn PathResolver>>, Error> {
    let decl = match fs.read_file(LAYOUT_FILE).await {
        Ok(data) => data,
        Err(Error::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let decl: LayoutDeclaration = serde_json::from_slice(&decl)
        .map_err(|e| Error::Validation(format!("invalid {}: {}", LAYOUT_FILE, e)))?;

    let config_path = join(&join(EXTENSIONS_DIR, &decl.extension), "config.json");
    let config = match fs.read_file(&config_path).await {
        Ok(data) => Some(data),
        Err(Error::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    debug!(layout = %decl.extension, has_config = config.is_some(), "storage layout");

    match decl.extension.as_str() {
        FLAT_DIRECT => Ok(Some(Box::new(FlatDirect))),
        HASHED_N_TUPLE => {
            let layout: HashedNTuple = match config {
                Some(config) => serde_json::from_slice(&config)
                    .map_err(|e| Error::Validation(format!("invalid {}: {}", config_path, e)))?,
                None => HashedNTuple::default(),
            };
            layout.check()?;
            Ok(Some(Box::new(layout)))
        }
        other => Err(Error::InvalidArgument(format!(
            "unsupported storage layout: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{from_storage_root, FlatDirect, HashedNTuple, PathResolver};
    use crate::digests::DigestAlgorithm;
    use crate::fs::MemoryFs;

    #[test]
    fn flat_direct() {
        assert_eq!(Ok("obj-1".to_string()), FlatDirect.resolve("obj-1"));
        assert!(FlatDirect.resolve("a/b").is_err());
        assert!(FlatDirect.resolve("..").is_err());
    }

    #[test]
    fn hashed_n_tuple() {
        let hex = DigestAlgorithm::Sha256.hash(b"object-01").to_hex();
        let layout = HashedNTuple::default();
        assert_eq!(
            Ok(format!("{}/{}/{}/{}", &hex[0..3], &hex[3..6], &hex[6..9], hex)),
            layout.resolve("object-01")
        );

        let short = HashedNTuple {
            short_object_root: true,
            ..Default::default()
        };
        assert_eq!(
            Ok(format!("{}/{}/{}/{}", &hex[0..3], &hex[3..6], &hex[6..9], &hex[9..])),
            short.resolve("object-01")
        );

        let flat = HashedNTuple {
            tuple_size: 0,
            number_of_tuples: 0,
            ..Default::default()
        };
        assert_eq!(Ok(hex.clone()), flat.resolve("object-01"));

        // tuples beyond the digest length
        let long = HashedNTuple {
            tuple_size: 40,
            number_of_tuples: 3,
            ..Default::default()
        };
        assert!(matches!(
            long.resolve("object-01"),
            Err(crate::Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn reads_declaration() {
        let fs = MemoryFs::default();
        assert!(from_storage_root(&fs).await.unwrap().is_none());

        fs.insert(
            "ocfl_layout.json",
            r#"{"extension": "0004-hashed-n-tuple-storage-layout", "description": "x"}"#,
        );
        fs.insert(
            "extensions/0004-hashed-n-tuple-storage-layout/config.json",
            r#"{"extensionName": "0004-hashed-n-tuple-storage-layout", "digestAlgorithm": "sha512", "tupleSize": 2, "numberOfTuples": 1}"#,
        );
        let resolver = from_storage_root(&fs).await.unwrap().expect("layout declared");
        let hex = DigestAlgorithm::Sha512.hash(b"x").to_hex();
        assert_eq!(Ok(format!("{}/{}", &hex[0..2], hex)), resolver.resolve("x"));

        fs.insert("ocfl_layout.json", r#"{"extension": "9999-unknown"}"#);
        assert!(from_storage_root(&fs).await.is_err());
    }
}
