//! The indexing pipeline and the [Index] facade.
//!
//! A run enumerates object roots, parses their inventories with a bounded
//! number of concurrent workers, and applies changed inventories from a
//! single committer in enumeration order. Writes are batched into
//! transactions of [INVENTORIES_PER_TX] inventories (or [ROOTS_PER_TX]
//! object roots while syncing the catalog).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    IndexBackend, InventoryRecord, Object, ObjectList, ObjectListOptions, ObjectRootList,
    PathInfo, StateQuery, Summary, MAX_PAGE_SIZE,
};
use crate::digests::Digest;
use crate::fs::{default_skip, join, ObjectFs};
use crate::inventory::{Inventory, VNum, INVENTORY_FILE};
use crate::layout::PathResolver;
use crate::scheduler::MonitorWriter;
use crate::tree::PathTree;
use crate::Error;

mod commit;
mod tx;

pub use self::commit::{apply_inventory, commit_tree};
use self::tx::SharedTx;

/// Changed inventories applied per transaction.
pub const INVENTORIES_PER_TX: usize = 10;

/// Object roots upserted per transaction while syncing the catalog.
pub const ROOTS_PER_TX: usize = 1000;

/// Name and version of the running program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildInfo {
    pub name: String,
    pub version: String,
}

impl BuildInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexMode {
    /// Rebuild the object root catalog and index every object.
    FullScan,
    /// Index the objects with these ids, resolved through the storage layout.
    ObjectIds(Vec<String>),
    /// Index the objects at these object root paths.
    ObjectPaths(Vec<String>),
}

pub struct IndexOptions {
    pub mode: IndexMode,
    /// number of inventories parsed concurrently
    pub concurrency: usize,
    /// also record file sizes, read from the storage root
    pub with_sizes: bool,
    pub progress: Option<MonitorWriter>,
    pub cancel: CancellationToken,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            mode: IndexMode::FullScan,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            with_sizes: false,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl IndexOptions {
    async fn report(&self, line: String) {
        if let Some(progress) = &self.progress {
            if let Err(e) = progress.send(line).await {
                debug!(err=%e, "dropping progress message");
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// object roots found while syncing the catalog
    pub roots_found: u64,
    pub indexed: u64,
    pub unchanged: u64,
    pub failed: u64,
    /// object roots removed because they were not found again
    pub removed: u64,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} indexed, {} unchanged, {} failed, {} removed",
            self.indexed, self.unchanged, self.failed, self.removed
        )
    }
}

/// Result of parsing one object root.
enum Job {
    Failed { path: String, err: Error },
    Unchanged { path: String },
    Changed(Box<ChangedInventory>),
}

struct ChangedInventory {
    path: String,
    inventory: Inventory,
    trees: Vec<(VNum, PathTree)>,
    prior: Option<InventoryRecord>,
}

/// An index over the objects of one storage root.
pub struct Index {
    backend: Arc<dyn IndexBackend>,
    fs: Arc<dyn ObjectFs>,
    resolver: Option<Arc<dyn PathResolver>>,
    build: BuildInfo,
}

impl Index {
    pub fn new(backend: Arc<dyn IndexBackend>, fs: Arc<dyn ObjectFs>, build: BuildInfo) -> Self {
        Self {
            backend,
            fs,
            resolver: None,
            build,
        }
    }

    /// Sets the storage layout used to find objects by id.
    pub fn with_resolver(mut self, resolver: Arc<dyn PathResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    pub fn build_info(&self) -> &BuildInfo {
        &self.build
    }

    /// Runs one pass of the pipeline. Committed batches stay committed if
    /// the run fails or is cancelled.
    #[instrument(skip_all, fields(mode = ?opts.mode))]
    pub async fn index(&self, opts: IndexOptions) -> Result<IndexStats, Error> {
        let started = now();
        info!(build = %self.build, "starting index run");
        opts.report(format!("{}: indexing started", self.build)).await;

        let tx = SharedTx::begin(self.backend.clone()).await?;
        let mut stats = IndexStats::default();
        if let Err(e) = self.run(&tx, &opts, started, &mut stats).await {
            tx.rollback().await;
            warn!(err=%e, "index run failed");
            opts.report(format!("indexing failed: {}", e)).await;
            return Err(e);
        }

        info!(%stats, "index run complete");
        opts.report(format!("indexing complete: {}", stats)).await;
        Ok(stats)
    }

    async fn run(
        &self,
        tx: &SharedTx,
        opts: &IndexOptions,
        started: DateTime<Utc>,
        stats: &mut IndexStats,
    ) -> Result<(), Error> {
        let full_scan = opts.mode == IndexMode::FullScan;
        if full_scan {
            stats.roots_found = self.sync_roots(tx, opts, started).await?;
            opts.report(format!("found {} object roots", stats.roots_found))
                .await;
        }

        let paths: BoxStream<'_, Result<String, Error>> = match &opts.mode {
            IndexMode::FullScan => catalogued_roots(self.backend.as_ref(), started),
            IndexMode::ObjectIds(ids) => {
                let resolver = self.resolver.as_ref().ok_or_else(|| {
                    Error::InvalidArgument("no storage layout to resolve object ids".to_string())
                })?;
                let paths: Vec<_> = ids.iter().map(|id| resolver.resolve(id)).collect();
                stream::iter(paths).boxed()
            }
            IndexMode::ObjectPaths(paths) => stream::iter(paths.clone().into_iter().map(Ok)).boxed(),
        };

        let with_sizes = opts.with_sizes;
        let mut jobs = paths
            .map(|path| async move {
                match path {
                    Ok(path) => self.parse(path, with_sizes).await,
                    Err(e) => Err(e),
                }
            })
            .buffered(opts.concurrency.max(1));

        let mut uncommitted = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = opts.cancel.cancelled() => return Err(Error::Cancelled),
                next = jobs.next() => next,
            };
            let Some(job) = next else { break };

            match job? {
                Job::Failed { path, err } => {
                    stats.failed += 1;
                    warn!(object.root = %path, err = %err, "failed to parse inventory");
                    opts.report(format!("{}: {}", path, err)).await;
                    if !full_scan {
                        return Err(err);
                    }
                }
                Job::Unchanged { path } => {
                    stats.unchanged += 1;
                    debug!(object.root = %path, "inventory unchanged");
                }
                Job::Changed(changed) => {
                    let ChangedInventory {
                        path,
                        inventory,
                        trees,
                        prior,
                    } = *changed;
                    let line = match &prior {
                        Some(prior) if prior.ocfl_id == inventory.id => format!(
                            "{}: updated {} ({} to {})",
                            path, inventory.id, prior.head, inventory.head
                        ),
                        _ => format!("{}: indexed {} ({})", path, inventory.id, inventory.head),
                    };

                    tx.with(move |t| apply_inventory(t, &path, &inventory, &trees, started))
                        .await?;
                    stats.indexed += 1;
                    opts.report(line).await;

                    uncommitted += 1;
                    if uncommitted >= INVENTORIES_PER_TX {
                        tx.commit_and_renew().await?;
                        uncommitted = 0;
                    }
                }
            }
        }
        drop(jobs);

        if full_scan {
            if opts.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            stats.removed = tx
                .with(move |t| t.remove_object_roots_before(started))
                .await?;
            if stats.removed > 0 {
                info!(removed = stats.removed, "removed stale object roots");
            }
        }
        tx.commit().await
    }

    /// Walks the storage root and refreshes the object root catalog.
    async fn sync_roots(
        &self,
        tx: &SharedTx,
        opts: &IndexOptions,
        started: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let mut batches = self
            .fs
            .object_roots("", default_skip())
            .chunks(ROOTS_PER_TX);
        let mut found = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = opts.cancel.cancelled() => return Err(Error::Cancelled),
                next = batches.next() => next,
            };
            let Some(batch) = next else { break };
            let batch = batch.into_iter().collect::<Result<Vec<String>, Error>>()?;
            found += batch.len() as u64;

            tx.with(move |t| {
                for path in &batch {
                    t.upsert_object_root(path, started)?;
                }
                Ok(())
            })
            .await?;
            tx.commit_and_renew().await?;
            debug!(found, "synced object roots");
        }
        Ok(found)
    }

    /// Parses an object root against committed index state. Only the
    /// committer writes, so workers never wait on the write transaction.
    async fn parse(&self, path: String, with_sizes: bool) -> Result<Job, Error> {
        let inventory = match self.load_inventory(&path).await {
            Ok(inventory) => inventory,
            Err(err) => return Ok(Job::Failed { path, err }),
        };

        let prior = match self.backend.get_inventory_by_path(&path).await {
            Ok(record) => Some(record),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if let Some(prior) = &prior {
            if prior.ocfl_id == inventory.id && prior.inventory_digest == *inventory.digest() {
                return Ok(Job::Unchanged { path });
            }
        }

        match self.build_trees(&path, inventory, with_sizes).await {
            Ok((inventory, trees)) => Ok(Job::Changed(Box::new(ChangedInventory {
                path,
                inventory,
                trees,
                prior,
            }))),
            Err(err) => Ok(Job::Failed { path, err }),
        }
    }

    /// Reads and validates the inventory of an object root, checking its
    /// sidecar if there is one.
    async fn load_inventory(&self, path: &str) -> Result<Inventory, Error> {
        let data = self.fs.read_file(&join(path, INVENTORY_FILE)).await?;
        let inventory = Inventory::from_bytes(&data)?;
        match self.fs.read_file(&join(path, &inventory.sidecar_name())).await {
            Ok(sidecar) => inventory.check_sidecar(&sidecar)?,
            Err(Error::NotFound(_)) => debug!(object.root = %path, "no inventory sidecar"),
            Err(e) => return Err(e),
        }
        Ok(inventory)
    }

    /// Builds the tree of every version, in ascending version order.
    async fn build_trees(
        &self,
        path: &str,
        inventory: Inventory,
        with_sizes: bool,
    ) -> Result<(Inventory, Vec<(VNum, PathTree)>), Error> {
        let sizes = match with_sizes {
            true => Some(self.fs.file_sizes(path).await?),
            false => None,
        };
        tokio::task::spawn_blocking(move || {
            let mut trees = Vec::with_capacity(inventory.versions.len());
            for vnum in inventory.versions.keys() {
                let entries = inventory.version_entries(vnum).ok_or_else(|| {
                    Error::MissingValue(format!("state of version {} of {}", vnum, inventory.id))
                })?;
                trees.push((*vnum, PathTree::build(&entries, sizes.as_ref())?));
            }
            Ok((inventory, trees))
        })
        .await?
    }

    pub async fn summary(&self) -> Result<Summary, Error> {
        self.backend.summary().await
    }

    pub async fn schema_version(&self) -> Result<(u64, u64), Error> {
        self.backend.schema_version().await
    }

    pub async fn list_object_roots(&self, limit: usize, cursor: &str) -> Result<ObjectRootList, Error> {
        self.backend.list_object_roots(limit, cursor).await
    }

    pub async fn list_objects(&self, opts: &ObjectListOptions) -> Result<ObjectList, Error> {
        self.backend.list_objects(opts).await
    }

    pub async fn get_object(&self, ocfl_id: &str) -> Result<Object, Error> {
        self.backend.get_object(ocfl_id).await
    }

    pub async fn get_object_by_path(&self, root_path: &str) -> Result<Object, Error> {
        self.backend.get_object_by_path(root_path).await
    }

    pub async fn get_object_state(&self, query: &StateQuery) -> Result<PathInfo, Error> {
        self.backend.get_object_state(query).await
    }

    pub async fn get_content_path(&self, digest: &Digest) -> Result<String, Error> {
        self.backend.get_content_path(digest).await
    }

    /// Opens the stored file with the given digest.
    pub async fn open_content(
        &self,
        digest: &Digest,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, Error> {
        let path = self.backend.get_content_path(digest).await?;
        self.fs.open_file(&path).await
    }
}

/// Catalogued object roots refreshed at or after `since`. The catalog is
/// committed before enumeration starts.
fn catalogued_roots(
    backend: &dyn IndexBackend,
    since: DateTime<Utc>,
) -> BoxStream<'_, Result<String, Error>> {
    Box::pin(async_stream::try_stream! {
        let mut cursor = String::new();
        loop {
            let page = backend.list_object_roots(MAX_PAGE_SIZE, &cursor).await?;
            for root in page.roots {
                if root.indexed_at >= since {
                    yield root.path;
                }
            }
            if page.next_cursor.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
    })
}

/// The current time, at the precision object roots are stored with.
fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}
