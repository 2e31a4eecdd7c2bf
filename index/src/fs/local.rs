use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::AsyncRead;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{instrument, warn};
use walkdir::WalkDir;

use super::{ObjectFs, SkipFn, OBJECT_DECLARATION_PREFIX};
use crate::Error;

/// A storage root on the local file system.
#[derive(Clone, Debug)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf, Error> {
        if path.split('/').any(|s| s == "..") {
            return Err(Error::InvalidArgument(format!("invalid path: {}", path)));
        }
        Ok(self.root.join(path.trim_start_matches('/')))
    }
}

/// Converts a path below `base` to a slash-separated relative path.
fn relative(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

#[async_trait]
impl ObjectFs for LocalFs {
    #[instrument(skip(self, skip), fields(fs.root = %self.root.display()))]
    fn object_roots(&self, dir: &str, skip: SkipFn) -> BoxStream<'static, Result<String, Error>> {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let root = self.root.clone();
        let start = self.full_path(dir);

        tokio::task::spawn_blocking(move || {
            let start = match start {
                Ok(start) => start,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };

            let mut it = WalkDir::new(&start)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter();
            while let Some(entry) = it.next() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(err=%e, "failed to walk storage root");
                        let _ = tx.blocking_send(Err(Error::StorageError(e.to_string())));
                        return;
                    }
                };
                let Some(rel) = relative(&root, entry.path()) else {
                    warn!(path=%entry.path().display(), "skipping non-utf8 path");
                    if entry.file_type().is_dir() {
                        it.skip_current_dir();
                    }
                    continue;
                };

                if entry.file_type().is_dir() {
                    if entry.depth() > 0 && skip(&rel) {
                        it.skip_current_dir();
                    }
                    continue;
                }

                let is_declaration = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(OBJECT_DECLARATION_PREFIX));
                if is_declaration {
                    let object_root = rel.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
                    if tx.blocking_send(Ok(object_root.to_string())).is_err() {
                        // receiver went away
                        return;
                    }
                    // skip the rest of the object root
                    it.skip_current_dir();
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    #[instrument(skip(self), err)]
    async fn open_file(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, Error> {
        let f = tokio::fs::File::open(self.full_path(path)?).await?;
        Ok(Box::new(f))
    }

    #[instrument(skip(self), err)]
    async fn file_sizes(&self, prefix: &str) -> Result<HashMap<String, u64>, Error> {
        let base = self.full_path(prefix)?;
        tokio::task::spawn_blocking(move || {
            let mut sizes = HashMap::new();
            for entry in WalkDir::new(&base).follow_links(false) {
                let entry = entry.map_err(|e| Error::StorageError(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(rel) = relative(&base, entry.path()) else {
                    continue;
                };
                let len = entry
                    .metadata()
                    .map_err(|e| Error::StorageError(e.to_string()))?
                    .len();
                sizes.insert(rel, len);
            }
            Ok(sizes)
        })
        .await?
    }
}
