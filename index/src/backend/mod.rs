//! Persistent storage of the index.
//!
//! Writes go through a [BackendTx], which the indexer batches. Reads used
//! by consumers go through [IndexBackend] directly and see committed data
//! only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::digests::{Digest, DigestAlgorithm};
use crate::inventory::{Spec, User, VNum};
use crate::Error;

mod from_addr;
mod redb;

pub use self::from_addr::from_addr;
pub use self::redb::{RedbIndexBackend, RedbIndexBackendConfig};

#[cfg(test)]
mod tests;

/// Page size used when a listing asks for zero items, and the upper bound
/// for any page.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Turns a requested page size into the effective one.
pub fn page_size(limit: usize) -> usize {
    if limit == 0 {
        MAX_PAGE_SIZE
    } else {
        limit.min(MAX_PAGE_SIZE)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRoot {
    pub id: u64,
    pub path: String,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectRootList {
    pub roots: Vec<ObjectRoot>,
    /// empty when there are no more pages
    pub next_cursor: String,
}

/// The stored record of an object's inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryRecord {
    pub id: u64,
    pub ocfl_id: String,
    pub root_id: u64,
    pub root_path: String,
    pub spec: Spec,
    pub digest_algorithm: DigestAlgorithm,
    pub inventory_digest: Digest,
    pub head: VNum,
    pub indexed_at: DateTime<Utc>,
}

/// Arguments to [BackendTx::upsert_inventory].
#[derive(Clone, Debug)]
pub struct InventoryUpsert {
    pub ocfl_id: String,
    pub root_id: u64,
    pub spec: Spec,
    pub digest_algorithm: DigestAlgorithm,
    pub inventory_digest: Digest,
    pub head: VNum,
    pub indexed_at: DateTime<Utc>,
}

/// Arguments to [BackendTx::insert_version].
#[derive(Clone, Debug)]
pub struct VersionInsert {
    pub num: VNum,
    pub message: String,
    pub created: DateTime<Utc>,
    pub user: Option<User>,
    pub node_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectVersion {
    pub num: VNum,
    pub message: String,
    pub created: DateTime<Utc>,
    pub user: Option<User>,
    /// size of the version state, if known
    pub size: Option<u64>,
    /// digest of the version state's root directory
    pub digest: Digest,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    pub inventory: InventoryRecord,
    /// ascending by version number
    pub versions: Vec<ObjectVersion>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ObjectSort {
    #[default]
    Id,
    V1Created,
    HeadCreated,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectListOptions {
    pub sort: ObjectSort,
    pub descending: bool,
    pub limit: usize,
    pub cursor: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectListItem {
    pub ocfl_id: String,
    pub spec: Spec,
    pub head: VNum,
    pub v1_created: Option<DateTime<Utc>>,
    pub head_created: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectList {
    pub objects: Vec<ObjectListItem>,
    pub next_cursor: String,
}

/// Selects a path inside an object version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateQuery {
    pub object_id: String,
    /// head version if unset
    pub version: Option<VNum>,
    /// logical path, empty for the version's root directory
    pub base_path: String,
    /// list all files below the path instead of direct children
    pub recursive: bool,
    pub limit: usize,
    pub cursor: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathItem {
    /// child name, or path relative to the queried path for recursive
    /// listings
    pub name: String,
    pub is_dir: bool,
    pub digest: Digest,
    pub size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathInfo {
    pub is_dir: bool,
    pub digest: Digest,
    pub size: Option<u64>,
    pub children: Vec<PathItem>,
    pub next_cursor: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub object_roots: u64,
    pub inventories: u64,
    pub nodes: u64,
    pub names: u64,
    pub content_paths: u64,
    pub indexed_at: Option<DateTime<Utc>>,
}

/// What [BackendTx::get_or_create_node] did to the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Created,
    /// The node existed without a size and got one.
    SizeFilled,
    Existing,
}

impl NodeState {
    /// Whether the entries below the node still need to be written.
    pub fn is_incomplete(&self) -> bool {
        *self != NodeState::Existing
    }
}

/// A write transaction. Dropping it without calling [BackendTx::commit]
/// discards all changes.
pub trait BackendTx: Send {
    /// Creates or refreshes an object root, returning its id. `indexed_at`
    /// is stored with microsecond precision.
    fn upsert_object_root(&mut self, path: &str, indexed_at: DateTime<Utc>) -> Result<u64, Error>;

    /// Creates or replaces the inventory record for `ocfl_id`, returning
    /// its id. Replacing keeps the id.
    fn upsert_inventory(&mut self, inv: &InventoryUpsert) -> Result<u64, Error>;

    /// Inserts a version row, or verifies an existing one is unchanged.
    /// A difference is reported as [Error::IndexValueDrift].
    fn insert_version(&mut self, inventory_id: u64, version: &VersionInsert) -> Result<(), Error>;

    /// Returns the id of the node and what this call changed about it.
    /// An unknown size on an existing node is replaced by `size`.
    fn get_or_create_node(
        &mut self,
        digest: &Digest,
        is_dir: bool,
        size: Option<u64>,
    ) -> Result<(u64, NodeState), Error>;

    fn insert_name(&mut self, parent_id: u64, child_id: u64, name: &str) -> Result<(), Error>;

    fn insert_content_path(
        &mut self,
        inventory_id: u64,
        digest: &Digest,
        file_path: &str,
    ) -> Result<(), Error>;

    /// Deletes object roots last indexed before `before`, together with
    /// their inventories, versions and content paths. Returns the number of
    /// removed object roots.
    fn remove_object_roots_before(&mut self, before: DateTime<Utc>) -> Result<u64, Error>;

    fn get_inventory_by_path(&self, path: &str) -> Result<Option<InventoryRecord>, Error>;

    fn list_object_roots(&self, limit: usize, cursor: &str) -> Result<ObjectRootList, Error>;

    fn commit(self: Box<Self>) -> Result<(), Error>;

    fn rollback(self: Box<Self>) -> Result<(), Error>;
}

#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Opens a write transaction. Only one may be open at a time; callers
    /// wait for the previous one to finish.
    async fn begin_tx(&self) -> Result<Box<dyn BackendTx>, Error>;

    async fn summary(&self) -> Result<Summary, Error>;

    /// The (major, minor) schema version of the stored index.
    async fn schema_version(&self) -> Result<(u64, u64), Error>;

    async fn list_object_roots(&self, limit: usize, cursor: &str) -> Result<ObjectRootList, Error>;

    async fn list_objects(&self, opts: &ObjectListOptions) -> Result<ObjectList, Error>;

    async fn get_object(&self, ocfl_id: &str) -> Result<Object, Error>;

    async fn get_object_by_path(&self, root_path: &str) -> Result<Object, Error>;

    /// The inventory record stored for an object root, without its
    /// versions.
    async fn get_inventory_by_path(&self, root_path: &str) -> Result<InventoryRecord, Error>;

    async fn get_object_state(&self, query: &StateQuery) -> Result<PathInfo, Error>;

    /// Returns the path of a stored file with the given digest, relative to
    /// the storage root.
    async fn get_content_path(&self, digest: &Digest) -> Result<String, Error>;
}

#[async_trait]
impl<A> IndexBackend for A
where
    A: AsRef<dyn IndexBackend> + Send + Sync,
{
    async fn begin_tx(&self) -> Result<Box<dyn BackendTx>, Error> {
        self.as_ref().begin_tx().await
    }

    async fn summary(&self) -> Result<Summary, Error> {
        self.as_ref().summary().await
    }

    async fn schema_version(&self) -> Result<(u64, u64), Error> {
        self.as_ref().schema_version().await
    }

    async fn list_object_roots(&self, limit: usize, cursor: &str) -> Result<ObjectRootList, Error> {
        self.as_ref().list_object_roots(limit, cursor).await
    }

    async fn list_objects(&self, opts: &ObjectListOptions) -> Result<ObjectList, Error> {
        self.as_ref().list_objects(opts).await
    }

    async fn get_object(&self, ocfl_id: &str) -> Result<Object, Error> {
        self.as_ref().get_object(ocfl_id).await
    }

    async fn get_object_by_path(&self, root_path: &str) -> Result<Object, Error> {
        self.as_ref().get_object_by_path(root_path).await
    }

    async fn get_inventory_by_path(&self, root_path: &str) -> Result<InventoryRecord, Error> {
        self.as_ref().get_inventory_by_path(root_path).await
    }

    async fn get_object_state(&self, query: &StateQuery) -> Result<PathInfo, Error> {
        self.as_ref().get_object_state(query).await
    }

    async fn get_content_path(&self, digest: &Digest) -> Result<String, Error> {
        self.as_ref().get_content_path(digest).await
    }
}

/// Runs `f` in its own transaction, committing on success and rolling back
/// on failure.
pub async fn with_tx<F, R>(backend: &dyn IndexBackend, f: F) -> Result<R, Error>
where
    F: FnOnce(&mut dyn BackendTx) -> Result<R, Error> + Send + 'static,
    R: Send + 'static,
{
    let mut tx = backend.begin_tx().await?;
    tokio::task::spawn_blocking(move || match f(tx.as_mut()) {
        Ok(r) => {
            tx.commit()?;
            Ok(r)
        }
        Err(e) => {
            tx.rollback()?;
            Err(e)
        }
    })
    .await?
}
