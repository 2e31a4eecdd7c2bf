use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use tokio::io::AsyncRead;
use tracing::instrument;

use super::{join, ObjectFs, SkipFn, OBJECT_DECLARATION_PREFIX};
use crate::Error;

/// An in-memory storage root, keyed by relative file path.
#[derive(Clone, Default)]
pub struct MemoryFs {
    files: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryFs {
    pub fn insert(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.files.write().insert(path.into(), data.into());
    }

    /// Removes every file below `prefix`.
    pub fn remove_dir(&self, prefix: &str) {
        let dir = join(prefix, "");
        self.files
            .write()
            .retain(|path, _| !(path.starts_with(&dir) && path[dir.len()..].starts_with('/')));
    }
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

#[async_trait]
impl ObjectFs for MemoryFs {
    fn object_roots(&self, dir: &str, skip: SkipFn) -> BoxStream<'static, Result<String, Error>> {
        let files = self.files.read();
        let mut roots: Vec<String> = Vec::new();

        for path in files.keys() {
            let (dir_path, name) = path.rsplit_once('/').unwrap_or(("", path));
            if !name.starts_with(OBJECT_DECLARATION_PREFIX) {
                continue;
            }
            if !dir.is_empty() && !(dir_path == dir || dir_path.starts_with(&format!("{}/", dir))) {
                continue;
            }

            // any skipped ancestor or enclosing object root hides this one
            let mut hidden = false;
            let mut ancestor = dir_path;
            while !ancestor.is_empty() {
                if skip(ancestor) || (ancestor != dir_path && roots.iter().any(|r| r == ancestor)) {
                    hidden = true;
                    break;
                }
                ancestor = parent(ancestor);
            }
            if !hidden && roots.last().map(String::as_str) != Some(dir_path) {
                roots.push(dir_path.to_string());
            }
        }

        Box::pin(futures::stream::iter(roots.into_iter().map(Ok)))
    }

    #[instrument(skip(self), err)]
    async fn open_file(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, Error> {
        let data = self
            .files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn file_sizes(&self, prefix: &str) -> Result<HashMap<String, u64>, Error> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        Ok(self
            .files
            .read()
            .iter()
            .filter_map(|(path, data)| {
                let rel = if prefix.is_empty() {
                    path.as_str()
                } else {
                    path.strip_prefix(&dir)?
                };
                Some((rel.to_string(), data.len() as u64))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::MemoryFs;
    use crate::fs::{default_skip, ObjectFs};

    #[tokio::test]
    async fn object_roots_and_removal() {
        let fs = MemoryFs::default();
        fs.insert("0=ocfl_1.1", "ocfl_1.1\n");
        fs.insert("x/obj1/0=ocfl_object_1.1", "");
        fs.insert("x/obj1/v1/content/0=ocfl_object_1.1", "");
        fs.insert("x/obj2/0=ocfl_object_1.1", "");
        fs.insert("extensions/obj3/0=ocfl_object_1.1", "");

        let roots: Vec<String> = fs.object_roots("", default_skip()).try_collect().await.unwrap();
        assert_eq!(vec!["x/obj1".to_string(), "x/obj2".to_string()], roots);

        fs.remove_dir("x/obj1");
        let roots: Vec<String> = fs.object_roots("x", default_skip()).try_collect().await.unwrap();
        assert_eq!(vec!["x/obj2".to_string()], roots);
    }

    #[tokio::test]
    async fn sizes() {
        let fs = MemoryFs::default();
        fs.insert("obj/v1/content/a.txt", "hello");
        fs.insert("objx/other", "nope");
        let sizes = fs.file_sizes("obj").await.unwrap();
        assert_eq!(1, sizes.len());
        assert_eq!(Some(&5), sizes.get("v1/content/a.txt"));
    }
}
