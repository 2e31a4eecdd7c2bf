//! Access to the files of a storage root.
//!
//! Paths handed to and returned by an [ObjectFs] are relative to the
//! storage root and use `/` as separator. The empty string names the
//! storage root itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Error;

mod local;
mod memory;

pub use self::local::LocalFs;
pub use self::memory::MemoryFs;

/// Prefix of the file declaring a directory to be an object root.
pub const OBJECT_DECLARATION_PREFIX: &str = "0=ocfl_object_";

/// Name of the reserved extensions directory at the storage root.
pub const EXTENSIONS_DIR: &str = "extensions";

/// Decides whether a directory (by its relative path) is skipped when
/// looking for object roots.
pub type SkipFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Skips the extensions directory of the storage root and hidden directories.
pub fn default_skip() -> SkipFn {
    Arc::new(|path: &str| {
        path == EXTENSIONS_DIR || path.rsplit('/').next().is_some_and(|n| n.starts_with('.'))
    })
}

#[async_trait]
pub trait ObjectFs: Send + Sync {
    /// Finds all object roots below `dir`. Directories matching `skip` are
    /// not entered, and object roots are not descended into.
    fn object_roots(&self, dir: &str, skip: SkipFn) -> BoxStream<'static, Result<String, Error>>;

    /// Opens a file for reading.
    async fn open_file(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, Error>;

    /// Returns the size of every file below `prefix`, keyed by the path
    /// relative to `prefix`.
    async fn file_sizes(&self, prefix: &str) -> Result<HashMap<String, u64>, Error>;

    /// Reads a whole file into memory.
    async fn read_file(&self, path: &str) -> Result<Bytes, Error> {
        let mut r = self.open_file(path).await?;
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await?;
        Ok(buf.into())
    }
}

#[async_trait]
impl<A> ObjectFs for A
where
    A: AsRef<dyn ObjectFs> + Send + Sync,
{
    fn object_roots(&self, dir: &str, skip: SkipFn) -> BoxStream<'static, Result<String, Error>> {
        self.as_ref().object_roots(dir, skip)
    }

    async fn open_file(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, Error> {
        self.as_ref().open_file(path).await
    }

    async fn file_sizes(&self, prefix: &str) -> Result<HashMap<String, u64>, Error> {
        self.as_ref().file_sizes(prefix).await
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, Error> {
        self.as_ref().read_file(path).await
    }
}

/// Joins two relative paths.
pub fn join(base: &str, name: &str) -> String {
    match (base.trim_end_matches('/'), name.trim_start_matches('/')) {
        ("", name) => name.to_string(),
        (base, "") => base.to_string(),
        (base, name) => format!("{}/{}", base, name),
    }
}

#[cfg(test)]
mod tests {
    use super::{default_skip, join};

    #[test]
    fn join_paths() {
        assert_eq!("a/b", join("a", "b"));
        assert_eq!("b", join("", "b"));
        assert_eq!("a", join("a/", ""));
        assert_eq!("a/b/c", join("a/b/", "/c"));
    }

    #[test]
    fn skips() {
        let skip = default_skip();
        assert!(skip("extensions"));
        assert!(skip(".git"));
        assert!(skip("a/.cache"));
        assert!(!skip("a/extensions"));
        assert!(!skip("objects"));
    }
}
