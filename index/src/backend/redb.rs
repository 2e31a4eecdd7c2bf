use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use data_encoding::BASE64URL_NOPAD;
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use super::{
    page_size, BackendTx, IndexBackend, InventoryRecord, InventoryUpsert, Object, ObjectList,
    ObjectListItem, ObjectListOptions, ObjectRoot, ObjectRootList, ObjectSort, ObjectVersion,
    NodeState, PathInfo, PathItem, StateQuery, Summary, VersionInsert,
};
use crate::digests::{Digest, DigestAlgorithm};
use crate::fs::join;
use crate::inventory::{Spec, User, VNum};
use crate::Error;

/// Major and minor version of the table layout below.
pub const SCHEMA_VERSION: (u64, u64) = (1, 0);

const SCHEMA_TABLE: TableDefinition<&str, u64> = TableDefinition::new("schema");
const SEQUENCE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");
/// path → [ObjectRootRow]
const OBJECT_ROOT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("object_roots");
/// id → path
const OBJECT_ROOT_ID_TABLE: TableDefinition<u64, &str> = TableDefinition::new("object_root_ids");
/// ocfl id → [InventoryRow]
const INVENTORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("inventories");
/// id → ocfl id
const INVENTORY_ID_TABLE: TableDefinition<u64, &str> = TableDefinition::new("inventory_ids");
/// object root id → ocfl id
const INVENTORY_ROOT_TABLE: TableDefinition<u64, &str> = TableDefinition::new("inventory_roots");
/// [version_key] → [VersionRow]
const VERSION_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("versions");
/// [node_key] → [NodeValue]
const NODE_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("nodes");
/// id → [node_key]
const NODE_ID_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("node_ids");
/// [name_key] → child node id
const NAME_TABLE: TableDefinition<&[u8], u64> = TableDefinition::new("names");
/// [content_key], ordered by digest
const CONTENT_PATH_TABLE: TableDefinition<&[u8], ()> = TableDefinition::new("content_paths");
/// [content_inventory_key], ordered by inventory
const CONTENT_PATH_INVENTORY_TABLE: TableDefinition<&[u8], ()> =
    TableDefinition::new("content_paths_by_inventory");
/// [created_key] of the first and the head version of each object
const CREATED_INDEX_TABLE: TableDefinition<&[u8], ()> = TableDefinition::new("created_index");

const CREATED_V1: u8 = 0;
const CREATED_HEAD: u8 = 1;

#[derive(Serialize, Deserialize)]
struct ObjectRootRow {
    id: u64,
    indexed_at: i64,
}

#[derive(Serialize, Deserialize)]
struct InventoryRow {
    id: u64,
    root_id: u64,
    spec: Spec,
    digest_algorithm: DigestAlgorithm,
    inventory_digest: String,
    head: VNum,
    indexed_at: i64,
    v1_created: Option<i64>,
    head_created: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct VersionRow {
    name: VNum,
    message: String,
    created: i64,
    user: Option<User>,
    node_id: u64,
}

/// id, followed by a presence byte and the size.
struct NodeValue {
    id: u64,
    size: Option<u64>,
}

impl NodeValue {
    fn encode(&self) -> [u8; 17] {
        let mut buf = [0u8; 17];
        buf[..8].copy_from_slice(&self.id.to_be_bytes());
        if let Some(size) = self.size {
            buf[8] = 1;
            buf[9..].copy_from_slice(&size.to_be_bytes());
        }
        buf
    }

    fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() != 17 {
            return Err(Error::StorageError("invalid node record".to_string()));
        }
        let id = u64::from_be_bytes(data[..8].try_into().unwrap_or_default());
        let size = (data[8] == 1).then(|| u64::from_be_bytes(data[9..].try_into().unwrap_or_default()));
        Ok(Self { id, size })
    }
}

struct NodeRecord {
    id: u64,
    digest: Digest,
    is_dir: bool,
    size: Option<u64>,
}

impl NodeRecord {
    fn item(&self, name: String) -> PathItem {
        PathItem {
            name,
            is_dir: self.is_dir,
            digest: self.digest.clone(),
            size: self.size,
        }
    }
}

fn version_key(inventory_id: u64, num: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&inventory_id.to_be_bytes());
    key[8..].copy_from_slice(&num.to_be_bytes());
    key
}

fn node_key(digest: &Digest, is_dir: bool) -> Vec<u8> {
    let mut key = Vec::with_capacity(digest.len() + 1);
    key.push(is_dir as u8);
    key.extend_from_slice(digest.as_slice());
    key
}

fn name_key(parent_id: u64, name: &str) -> Vec<u8> {
    let mut key = parent_id.to_be_bytes().to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

fn digest_prefix(digest: &Digest) -> Vec<u8> {
    let mut key = Vec::with_capacity(digest.len() + 1);
    key.push(digest.len() as u8);
    key.extend_from_slice(digest.as_slice());
    key
}

fn content_key(digest: &Digest, inventory_id: u64, path: &str) -> Vec<u8> {
    let mut key = digest_prefix(digest);
    key.extend_from_slice(&inventory_id.to_be_bytes());
    key.extend_from_slice(path.as_bytes());
    key
}

fn content_inventory_key(inventory_id: u64, digest: &Digest, path: &str) -> Vec<u8> {
    let mut key = inventory_id.to_be_bytes().to_vec();
    key.extend_from_slice(&digest_prefix(digest));
    key.extend_from_slice(path.as_bytes());
    key
}

/// Splits the part of a content key following the inventory id into digest
/// and path.
fn split_digest_path(data: &[u8]) -> Option<(Digest, String)> {
    let (&len, rest) = data.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let path = std::str::from_utf8(&rest[len..]).ok()?;
    Some((rest[..len].into(), path.to_string()))
}

/// Timestamps are stored with a flipped sign bit so that their big endian
/// encoding sorts chronologically.
fn created_key(kind: u8, created: i64, ocfl_id: &str) -> Vec<u8> {
    let mut key = vec![kind];
    key.extend_from_slice(&((created as u64) ^ (1 << 63)).to_be_bytes());
    key.extend_from_slice(ocfl_id.as_bytes());
    key
}

fn to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

/// Indexing times are kept in microseconds, so that runs started within
/// the same second still tell each other's object roots apart.
fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

fn decode_row<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, Error> {
    Ok(serde_json::from_slice(data)?)
}

fn decode_cursor(cursor: &str) -> Result<Vec<u8>, Error> {
    BASE64URL_NOPAD
        .decode(cursor.as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("malformed cursor: {:?}", cursor)))
}

fn utf8(data: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(data).map_err(|e| Error::StorageError(e.to_string()))
}

fn validate_segment(segment: &str) -> Result<(), Error> {
    if segment == "." || segment == ".." {
        return Err(Error::InvalidArgument(format!(
            "invalid path segment: {:?}",
            segment
        )));
    }
    Ok(())
}

/// Lookups shared by read and write transactions.
trait Reads {
    fn root_row(&self, path: &str) -> Result<Option<ObjectRootRow>, Error>;
    fn root_path(&self, root_id: u64) -> Result<Option<String>, Error>;
    fn inventory_row(&self, ocfl_id: &str) -> Result<Option<InventoryRow>, Error>;
    fn inventory_id_of_root(&self, root_id: u64) -> Result<Option<String>, Error>;
    fn ocfl_id_of(&self, inventory_id: u64) -> Result<Option<String>, Error>;
    fn inventory_record(&self, ocfl_id: &str) -> Result<Option<InventoryRecord>, Error>;
    fn inventory_by_path(&self, path: &str) -> Result<Option<InventoryRecord>, Error>;
    fn roots_page(&self, limit: usize, cursor: &str) -> Result<ObjectRootList, Error>;
    fn node_value(&self, key: &[u8]) -> Result<Option<NodeValue>, Error>;
    fn node_by_id(&self, id: u64) -> Result<NodeRecord, Error>;
    fn name_child(&self, parent_id: u64, name: &str) -> Result<Option<u64>, Error>;
    fn children_page(
        &self,
        parent_id: u64,
        limit: usize,
        cursor: &str,
    ) -> Result<Vec<(String, u64)>, Error>;
    fn version_row(&self, inventory_id: u64, num: u32) -> Result<Option<VersionRow>, Error>;
    fn object(&self, ocfl_id: &str) -> Result<Object, Error>;
    fn objects_page(&self, opts: &ObjectListOptions) -> Result<ObjectList, Error>;
    fn object_state(&self, query: &StateQuery) -> Result<PathInfo, Error>;
    fn recursive_files(
        &self,
        dir_id: u64,
        limit: usize,
        cursor: &str,
    ) -> Result<(Vec<PathItem>, String), Error>;
    fn content_path(&self, digest: &Digest) -> Result<String, Error>;
    fn summary(&self) -> Result<Summary, Error>;
}

/// [ReadTransaction] and [WriteTransaction] share no trait for opening
/// tables, but their `open_table` methods are used identically here.
macro_rules! impl_reads {
    ($txn:ty) => {
        impl Reads for $txn {
            fn root_row(&self, path: &str) -> Result<Option<ObjectRootRow>, Error> {
                let table = self.open_table(OBJECT_ROOT_TABLE)?;
                let row = match table.get(path)? {
                    Some(v) => Some(decode_row(v.value())?),
                    None => None,
                };
                Ok(row)
            }

            fn root_path(&self, root_id: u64) -> Result<Option<String>, Error> {
                let table = self.open_table(OBJECT_ROOT_ID_TABLE)?;
                let path = table.get(root_id)?.map(|v| v.value().to_string());
                Ok(path)
            }

            fn inventory_row(&self, ocfl_id: &str) -> Result<Option<InventoryRow>, Error> {
                let table = self.open_table(INVENTORY_TABLE)?;
                let row = match table.get(ocfl_id)? {
                    Some(v) => Some(decode_row(v.value())?),
                    None => None,
                };
                Ok(row)
            }

            fn inventory_id_of_root(&self, root_id: u64) -> Result<Option<String>, Error> {
                let table = self.open_table(INVENTORY_ROOT_TABLE)?;
                let id = table.get(root_id)?.map(|v| v.value().to_string());
                Ok(id)
            }

            fn ocfl_id_of(&self, inventory_id: u64) -> Result<Option<String>, Error> {
                let table = self.open_table(INVENTORY_ID_TABLE)?;
                let id = table.get(inventory_id)?.map(|v| v.value().to_string());
                Ok(id)
            }

            fn inventory_record(&self, ocfl_id: &str) -> Result<Option<InventoryRecord>, Error> {
                let Some(row) = self.inventory_row(ocfl_id)? else {
                    return Ok(None);
                };
                let root_path = self.root_path(row.root_id)?.ok_or_else(|| {
                    Error::StorageError(format!("object root of {} is missing", ocfl_id))
                })?;
                Ok(Some(InventoryRecord {
                    id: row.id,
                    ocfl_id: ocfl_id.to_string(),
                    root_id: row.root_id,
                    root_path,
                    spec: row.spec,
                    digest_algorithm: row.digest_algorithm,
                    inventory_digest: Digest::from_hex(&row.inventory_digest)
                        .map_err(|e| Error::StorageError(e.to_string()))?,
                    head: row.head,
                    indexed_at: from_micros(row.indexed_at),
                }))
            }

            fn inventory_by_path(&self, path: &str) -> Result<Option<InventoryRecord>, Error> {
                let Some(root) = self.root_row(path)? else {
                    return Ok(None);
                };
                match self.inventory_id_of_root(root.id)? {
                    Some(ocfl_id) => self.inventory_record(&ocfl_id),
                    None => Ok(None),
                }
            }

            fn roots_page(&self, limit: usize, cursor: &str) -> Result<ObjectRootList, Error> {
                let limit = page_size(limit);
                let table = self.open_table(OBJECT_ROOT_TABLE)?;
                let lower = if cursor.is_empty() {
                    Bound::Unbounded
                } else {
                    Bound::Excluded(cursor)
                };

                let mut roots = Vec::new();
                for entry in table.range::<&str>((lower, Bound::Unbounded))? {
                    let (k, v) = entry?;
                    let row: ObjectRootRow = decode_row(v.value())?;
                    roots.push(ObjectRoot {
                        id: row.id,
                        path: k.value().to_string(),
                        indexed_at: from_micros(row.indexed_at),
                    });
                    if roots.len() > limit {
                        break;
                    }
                }

                let mut next_cursor = String::new();
                if roots.len() > limit {
                    roots.truncate(limit);
                    next_cursor = roots.last().map(|r| r.path.clone()).unwrap_or_default();
                }
                Ok(ObjectRootList { roots, next_cursor })
            }

            fn node_value(&self, key: &[u8]) -> Result<Option<NodeValue>, Error> {
                let table = self.open_table(NODE_TABLE)?;
                let value = match table.get(key)? {
                    Some(v) => Some(NodeValue::decode(v.value())?),
                    None => None,
                };
                Ok(value)
            }

            fn node_by_id(&self, id: u64) -> Result<NodeRecord, Error> {
                let key = {
                    let table = self.open_table(NODE_ID_TABLE)?;
                    let key = table.get(id)?.map(|v| v.value().to_vec());
                    key.ok_or_else(|| Error::StorageError(format!("node {} is missing", id)))?
                };
                let value = self
                    .node_value(&key)?
                    .ok_or_else(|| Error::StorageError(format!("node {} is missing", id)))?;
                let (&is_dir, digest) = key
                    .split_first()
                    .ok_or_else(|| Error::StorageError(format!("node {} has an empty key", id)))?;
                Ok(NodeRecord {
                    id,
                    digest: digest.into(),
                    is_dir: is_dir == 1,
                    size: value.size,
                })
            }

            fn name_child(&self, parent_id: u64, name: &str) -> Result<Option<u64>, Error> {
                let table = self.open_table(NAME_TABLE)?;
                let child = table.get(name_key(parent_id, name).as_slice())?.map(|v| v.value());
                Ok(child)
            }

            fn children_page(
                &self,
                parent_id: u64,
                limit: usize,
                cursor: &str,
            ) -> Result<Vec<(String, u64)>, Error> {
                let table = self.open_table(NAME_TABLE)?;
                let prefix = parent_id.to_be_bytes();
                let start = name_key(parent_id, cursor);
                let lower = if cursor.is_empty() {
                    Bound::Included(start.as_slice())
                } else {
                    Bound::Excluded(start.as_slice())
                };

                let mut children = Vec::new();
                for entry in table.range::<&[u8]>((lower, Bound::Unbounded))? {
                    let (k, v) = entry?;
                    let key = k.value();
                    if !key.starts_with(&prefix) || children.len() >= limit {
                        break;
                    }
                    children.push((utf8(&key[8..])?.to_string(), v.value()));
                }
                Ok(children)
            }

            fn version_row(&self, inventory_id: u64, num: u32) -> Result<Option<VersionRow>, Error> {
                let table = self.open_table(VERSION_TABLE)?;
                let row = match table.get(version_key(inventory_id, num).as_slice())? {
                    Some(v) => Some(decode_row(v.value())?),
                    None => None,
                };
                Ok(row)
            }

            fn object(&self, ocfl_id: &str) -> Result<Object, Error> {
                let inventory = self
                    .inventory_record(ocfl_id)?
                    .ok_or_else(|| Error::NotFound(format!("object {}", ocfl_id)))?;

                let rows: Vec<VersionRow> = {
                    let table = self.open_table(VERSION_TABLE)?;
                    let prefix = inventory.id.to_be_bytes();
                    let mut rows = Vec::new();
                    for entry in table.range::<&[u8]>(prefix.as_slice()..)? {
                        let (k, v) = entry?;
                        if !k.value().starts_with(&prefix) {
                            break;
                        }
                        rows.push(decode_row(v.value())?);
                    }
                    rows
                };

                let mut versions = Vec::with_capacity(rows.len());
                for row in rows {
                    let node = self.node_by_id(row.node_id)?;
                    versions.push(ObjectVersion {
                        num: row.name,
                        message: row.message,
                        created: to_datetime(row.created),
                        user: row.user,
                        size: node.size,
                        digest: node.digest,
                    });
                }
                Ok(Object {
                    inventory,
                    versions,
                })
            }

            fn objects_page(&self, opts: &ObjectListOptions) -> Result<ObjectList, Error> {
                let limit = page_size(opts.limit);
                let cursor = if opts.cursor.is_empty() {
                    None
                } else {
                    Some(decode_cursor(&opts.cursor)?)
                };

                // (ocfl id, cursor bytes) in listing order
                let mut keys: Vec<(String, Vec<u8>)> = Vec::new();
                match opts.sort {
                    ObjectSort::Id => {
                        let cursor = match &cursor {
                            Some(c) => Some(
                                std::str::from_utf8(c)
                                    .map_err(|_| Error::InvalidArgument("malformed cursor".into()))?,
                            ),
                            None => None,
                        };
                        let bounds = match (cursor, opts.descending) {
                            (None, _) => (Bound::Unbounded, Bound::Unbounded),
                            (Some(c), false) => (Bound::Excluded(c), Bound::Unbounded),
                            (Some(c), true) => (Bound::Unbounded, Bound::Excluded(c)),
                        };
                        let table = self.open_table(INVENTORY_TABLE)?;
                        let mut range = table.range::<&str>(bounds)?;
                        while keys.len() <= limit {
                            let next = if opts.descending {
                                range.next_back()
                            } else {
                                range.next()
                            };
                            let Some(entry) = next else { break };
                            let (k, _) = entry?;
                            let id = k.value().to_string();
                            let cursor = id.as_bytes().to_vec();
                            keys.push((id, cursor));
                        }
                    }
                    ObjectSort::V1Created | ObjectSort::HeadCreated => {
                        let kind = if opts.sort == ObjectSort::V1Created {
                            CREATED_V1
                        } else {
                            CREATED_HEAD
                        };
                        let kind_start = vec![kind];
                        let kind_end = vec![kind + 1];
                        let position = cursor.map(|c| {
                            let mut key = vec![kind];
                            key.extend_from_slice(&c);
                            key
                        });
                        let bounds = match (&position, opts.descending) {
                            (None, _) => (
                                Bound::Included(kind_start.as_slice()),
                                Bound::Excluded(kind_end.as_slice()),
                            ),
                            (Some(p), false) => (
                                Bound::Excluded(p.as_slice()),
                                Bound::Excluded(kind_end.as_slice()),
                            ),
                            (Some(p), true) => (
                                Bound::Included(kind_start.as_slice()),
                                Bound::Excluded(p.as_slice()),
                            ),
                        };
                        let table = self.open_table(CREATED_INDEX_TABLE)?;
                        let mut range = table.range::<&[u8]>(bounds)?;
                        while keys.len() <= limit {
                            let next = if opts.descending {
                                range.next_back()
                            } else {
                                range.next()
                            };
                            let Some(entry) = next else { break };
                            let (k, _) = entry?;
                            let key = k.value();
                            if key.len() < 9 || key[0] != kind {
                                break;
                            }
                            keys.push((utf8(&key[9..])?.to_string(), key[1..].to_vec()));
                        }
                    }
                }

                let mut next_cursor = String::new();
                if keys.len() > limit {
                    keys.truncate(limit);
                    next_cursor = keys
                        .last()
                        .map(|(_, c)| BASE64URL_NOPAD.encode(c))
                        .unwrap_or_default();
                }

                let mut objects = Vec::with_capacity(keys.len());
                for (ocfl_id, _) in keys {
                    let row = self.inventory_row(&ocfl_id)?.ok_or_else(|| {
                        Error::StorageError(format!("indexed object {} is missing", ocfl_id))
                    })?;
                    objects.push(ObjectListItem {
                        ocfl_id,
                        spec: row.spec,
                        head: row.head,
                        v1_created: row.v1_created.map(to_datetime),
                        head_created: row.head_created.map(to_datetime),
                    });
                }
                Ok(ObjectList {
                    objects,
                    next_cursor,
                })
            }

            fn object_state(&self, query: &StateQuery) -> Result<PathInfo, Error> {
                let row = self
                    .inventory_row(&query.object_id)?
                    .ok_or_else(|| Error::NotFound(format!("object {}", query.object_id)))?;
                let vnum = query.version.unwrap_or(row.head);
                let version = self.version_row(row.id, vnum.num())?.ok_or_else(|| {
                    Error::NotFound(format!("version {} of object {}", vnum, query.object_id))
                })?;

                let mut node = self.node_by_id(version.node_id)?;
                for segment in query.base_path.split('/').filter(|s| !s.is_empty()) {
                    validate_segment(segment)?;
                    let child = match node.is_dir {
                        true => self.name_child(node.id, segment)?,
                        false => None,
                    };
                    let child = child.ok_or_else(|| {
                        Error::NotFound(format!(
                            "{:?} in version {} of object {}",
                            query.base_path, vnum, query.object_id
                        ))
                    })?;
                    node = self.node_by_id(child)?;
                }

                let mut info = PathInfo {
                    is_dir: node.is_dir,
                    digest: node.digest.clone(),
                    size: node.size,
                    children: Vec::new(),
                    next_cursor: String::new(),
                };
                if !node.is_dir {
                    return Ok(info);
                }

                let limit = page_size(query.limit);
                if query.recursive {
                    let (children, next_cursor) =
                        self.recursive_files(node.id, limit, &query.cursor)?;
                    info.children = children;
                    info.next_cursor = next_cursor;
                    return Ok(info);
                }

                let page = self.children_page(node.id, limit + 1, &query.cursor)?;
                for (name, child_id) in page {
                    let child = self.node_by_id(child_id)?;
                    info.children.push(child.item(name));
                }
                if info.children.len() > limit {
                    info.children.truncate(limit);
                    info.next_cursor = info
                        .children
                        .last()
                        .map(|c| c.name.clone())
                        .unwrap_or_default();
                }
                Ok(info)
            }

            fn recursive_files(
                &self,
                dir_id: u64,
                limit: usize,
                cursor: &str,
            ) -> Result<(Vec<PathItem>, String), Error> {
                enum Visit {
                    Dir(u64, String),
                    File(String, NodeRecord),
                }

                let mut files: Vec<PathItem> = Vec::new();
                let mut stack = vec![Visit::Dir(dir_id, String::new())];
                while let Some(visit) = stack.pop() {
                    match visit {
                        Visit::File(path, node) => {
                            if cursor.is_empty() || path.as_str() > cursor {
                                files.push(node.item(path));
                                if files.len() > limit {
                                    break;
                                }
                            }
                        }
                        Visit::Dir(id, prefix) => {
                            // every path below prefix sorts before the cursor
                            if !prefix.is_empty()
                                && prefix.as_str() < cursor
                                && !cursor.starts_with(&prefix)
                            {
                                continue;
                            }

                            let mut children = Vec::new();
                            let mut child_cursor = String::new();
                            loop {
                                let page = self.children_page(id, super::MAX_PAGE_SIZE, &child_cursor)?;
                                let Some((last, _)) = page.last() else { break };
                                child_cursor = last.clone();
                                for (name, child_id) in page {
                                    children.push((name, self.node_by_id(child_id)?));
                                }
                            }
                            // full paths sort like names with a trailing slash on directories
                            children.sort_by_cached_key(|(name, node)| {
                                if node.is_dir {
                                    format!("{}/", name)
                                } else {
                                    name.clone()
                                }
                            });
                            for (name, child) in children.into_iter().rev() {
                                let path = format!("{}{}", prefix, name);
                                stack.push(if child.is_dir {
                                    Visit::Dir(child.id, format!("{}/", path))
                                } else {
                                    Visit::File(path, child)
                                });
                            }
                        }
                    }
                }

                let mut next_cursor = String::new();
                if files.len() > limit {
                    files.truncate(limit);
                    next_cursor = files.last().map(|f| f.name.clone()).unwrap_or_default();
                }
                Ok((files, next_cursor))
            }

            fn content_path(&self, digest: &Digest) -> Result<String, Error> {
                let prefix = digest_prefix(digest);
                let found = {
                    let table = self.open_table(CONTENT_PATH_TABLE)?;
                    let mut found = None;
                    if let Some(entry) = table.range::<&[u8]>(prefix.as_slice()..)?.next() {
                        let (k, _) = entry?;
                        let key = k.value();
                        if key.starts_with(&prefix) && key.len() >= prefix.len() + 8 {
                            let rest = &key[prefix.len()..];
                            let inventory_id =
                                u64::from_be_bytes(rest[..8].try_into().unwrap_or_default());
                            found = Some((inventory_id, utf8(&rest[8..])?.to_string()));
                        }
                    }
                    found
                };
                let (inventory_id, file_path) =
                    found.ok_or_else(|| Error::NotFound(format!("content {}", digest)))?;

                let record = match self.ocfl_id_of(inventory_id)? {
                    Some(ocfl_id) => self.inventory_record(&ocfl_id)?,
                    None => None,
                };
                let record = record.ok_or_else(|| {
                    Error::StorageError(format!("inventory {} is missing", inventory_id))
                })?;
                Ok(join(&record.root_path, &file_path))
            }

            fn summary(&self) -> Result<Summary, Error> {
                let mut summary = Summary::default();
                {
                    let table = self.open_table(OBJECT_ROOT_TABLE)?;
                    for entry in table.iter()? {
                        entry?;
                        summary.object_roots += 1;
                    }
                }
                {
                    let table = self.open_table(INVENTORY_TABLE)?;
                    for entry in table.iter()? {
                        let (_, v) = entry?;
                        let row: InventoryRow = decode_row(v.value())?;
                        summary.inventories += 1;
                        let at = from_micros(row.indexed_at);
                        if summary.indexed_at.map_or(true, |prev| prev < at) {
                            summary.indexed_at = Some(at);
                        }
                    }
                }
                {
                    let table = self.open_table(NODE_TABLE)?;
                    for entry in table.iter()? {
                        entry?;
                        summary.nodes += 1;
                    }
                }
                {
                    let table = self.open_table(NAME_TABLE)?;
                    for entry in table.iter()? {
                        entry?;
                        summary.names += 1;
                    }
                }
                {
                    let table = self.open_table(CONTENT_PATH_TABLE)?;
                    for entry in table.iter()? {
                        entry?;
                        summary.content_paths += 1;
                    }
                }
                Ok(summary)
            }
        }
    };
}

impl_reads!(ReadTransaction);
impl_reads!(WriteTransaction);

/// Ensures all tables are present and the stored schema version matches
/// [SCHEMA_VERSION]. An empty database is stamped with it.
fn create_schema(db: &Database) -> Result<(), Error> {
    let txn = db.begin_write()?;
    {
        txn.open_table(SEQUENCE_TABLE)?;
        txn.open_table(OBJECT_ROOT_TABLE)?;
        txn.open_table(OBJECT_ROOT_ID_TABLE)?;
        txn.open_table(INVENTORY_TABLE)?;
        txn.open_table(INVENTORY_ID_TABLE)?;
        txn.open_table(INVENTORY_ROOT_TABLE)?;
        txn.open_table(VERSION_TABLE)?;
        txn.open_table(NODE_TABLE)?;
        txn.open_table(NODE_ID_TABLE)?;
        txn.open_table(NAME_TABLE)?;
        txn.open_table(CONTENT_PATH_TABLE)?;
        txn.open_table(CONTENT_PATH_INVENTORY_TABLE)?;
        txn.open_table(CREATED_INDEX_TABLE)?;

        let mut schema = txn.open_table(SCHEMA_TABLE)?;
        let major = schema.get("major")?.map(|v| v.value());
        let minor = schema.get("minor")?.map(|v| v.value());
        match (major, minor) {
            (None, None) => {
                schema.insert("major", SCHEMA_VERSION.0)?;
                schema.insert("minor", SCHEMA_VERSION.1)?;
            }
            (Some(major), Some(minor)) if (major, minor) == SCHEMA_VERSION => {}
            (major, minor) => {
                let show = |v: Option<u64>| v.map_or("?".to_string(), |v| v.to_string());
                return Err(Error::SchemaVersion {
                    found: format!("{}.{}", show(major), show(minor)),
                    expected: format!("{}.{}", SCHEMA_VERSION.0, SCHEMA_VERSION.1),
                });
            }
        }
    }
    txn.commit()?;

    Ok(())
}

/// Returns the next value of the named id sequence, starting at 1.
fn next_id(txn: &WriteTransaction, sequence: &str) -> Result<u64, Error> {
    let mut table = txn.open_table(SEQUENCE_TABLE)?;
    let next = table.get(sequence)?.map(|v| v.value()).unwrap_or(0) + 1;
    table.insert(sequence, next)?;
    Ok(next)
}

/// An index stored in a single redb database.
#[derive(Clone)]
pub struct RedbIndexBackend {
    // We wrap the db in an Arc to be able to move it into spawn_blocking,
    // as discussed in https://github.com/cberner/redb/issues/789
    db: Arc<Database>,
}

impl RedbIndexBackend {
    /// Opens or creates the index at the given path.
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        if path == PathBuf::from("/") {
            return Err(Error::StorageError(
                "cowardly refusing to open / with redb".to_string(),
            ));
        }

        let db = tokio::task::spawn_blocking(|| -> Result<_, Error> {
            let db = redb::Database::create(path)?;
            create_schema(&db)?;
            Ok(db)
        })
        .await??;

        Ok(Self { db: Arc::new(db) })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;

        create_schema(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Runs `f` on a fresh read transaction in the blocking thread pool.
    async fn read<F, R>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&ReadTransaction) -> Result<R, Error> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read()?;
            f(&txn)
        })
        .await?
    }
}

#[async_trait]
impl IndexBackend for RedbIndexBackend {
    #[instrument(skip_all)]
    async fn begin_tx(&self) -> Result<Box<dyn BackendTx>, Error> {
        let db = self.db.clone();
        let txn = tokio::task::spawn_blocking(move || db.begin_write())
            .await?
            .map_err(|e| {
                warn!(err=%e, "failed to begin write transaction");
                Error::from(e)
            })?;
        Ok(Box::new(RedbTx { txn }))
    }

    #[instrument(skip_all)]
    async fn summary(&self) -> Result<Summary, Error> {
        self.read(|txn| txn.summary()).await
    }

    #[instrument(skip_all)]
    async fn schema_version(&self) -> Result<(u64, u64), Error> {
        self.read(|txn| {
            let table = txn.open_table(SCHEMA_TABLE)?;
            let major = table.get("major")?.map(|v| v.value());
            let minor = table.get("minor")?.map(|v| v.value());
            match (major, minor) {
                (Some(major), Some(minor)) => Ok((major, minor)),
                _ => Err(Error::MissingValue("schema version".to_string())),
            }
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_object_roots(&self, limit: usize, cursor: &str) -> Result<ObjectRootList, Error> {
        let cursor = cursor.to_string();
        self.read(move |txn| txn.roots_page(limit, &cursor)).await
    }

    #[instrument(skip(self))]
    async fn list_objects(&self, opts: &ObjectListOptions) -> Result<ObjectList, Error> {
        let opts = opts.clone();
        self.read(move |txn| txn.objects_page(&opts)).await
    }

    #[instrument(skip(self))]
    async fn get_object(&self, ocfl_id: &str) -> Result<Object, Error> {
        let ocfl_id = ocfl_id.to_string();
        self.read(move |txn| txn.object(&ocfl_id)).await
    }

    #[instrument(skip(self))]
    async fn get_object_by_path(&self, root_path: &str) -> Result<Object, Error> {
        let root_path = root_path.to_string();
        self.read(move |txn| match txn.inventory_by_path(&root_path)? {
            Some(record) => txn.object(&record.ocfl_id),
            None => Err(Error::NotFound(format!("object root {}", root_path))),
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_inventory_by_path(&self, root_path: &str) -> Result<InventoryRecord, Error> {
        let root_path = root_path.to_string();
        self.read(move |txn| {
            txn.inventory_by_path(&root_path)?
                .ok_or_else(|| Error::NotFound(format!("object root {}", root_path)))
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_object_state(&self, query: &StateQuery) -> Result<PathInfo, Error> {
        let query = query.clone();
        self.read(move |txn| txn.object_state(&query)).await
    }

    #[instrument(skip(self, digest), fields(content.digest = %digest))]
    async fn get_content_path(&self, digest: &Digest) -> Result<String, Error> {
        let digest = digest.clone();
        self.read(move |txn| txn.content_path(&digest)).await
    }
}

pub struct RedbTx {
    txn: WriteTransaction,
}

impl RedbTx {
    /// Removes an inventory along with its versions and content paths.
    fn delete_inventory(&mut self, ocfl_id: &str) -> Result<(), Error> {
        let Some(row) = self.txn.inventory_row(ocfl_id)? else {
            return Ok(());
        };

        self.txn.open_table(INVENTORY_TABLE)?.remove(ocfl_id)?;
        self.txn.open_table(INVENTORY_ID_TABLE)?.remove(row.id)?;
        if self.txn.inventory_id_of_root(row.root_id)?.as_deref() == Some(ocfl_id) {
            self.txn.open_table(INVENTORY_ROOT_TABLE)?.remove(row.root_id)?;
        }

        let prefix = row.id.to_be_bytes();
        {
            let mut table = self.txn.open_table(VERSION_TABLE)?;
            let mut keys = Vec::new();
            for entry in table.range::<&[u8]>(prefix.as_slice()..)? {
                let (k, _) = entry?;
                if !k.value().starts_with(&prefix) {
                    break;
                }
                keys.push(k.value().to_vec());
            }
            for key in keys {
                table.remove(key.as_slice())?;
            }
        }
        {
            let mut by_inventory = self.txn.open_table(CONTENT_PATH_INVENTORY_TABLE)?;
            let mut by_digest = self.txn.open_table(CONTENT_PATH_TABLE)?;
            let mut keys = Vec::new();
            for entry in by_inventory.range::<&[u8]>(prefix.as_slice()..)? {
                let (k, _) = entry?;
                if !k.value().starts_with(&prefix) {
                    break;
                }
                keys.push(k.value().to_vec());
            }
            for key in keys {
                if let Some((digest, path)) = split_digest_path(&key[8..]) {
                    by_digest.remove(content_key(&digest, row.id, &path).as_slice())?;
                }
                by_inventory.remove(key.as_slice())?;
            }
        }
        {
            let mut index = self.txn.open_table(CREATED_INDEX_TABLE)?;
            if let Some(created) = row.v1_created {
                index.remove(created_key(CREATED_V1, created, ocfl_id).as_slice())?;
            }
            if let Some(created) = row.head_created {
                index.remove(created_key(CREATED_HEAD, created, ocfl_id).as_slice())?;
            }
        }
        Ok(())
    }

    /// Points the created index of `row` at the stored versions v1 and
    /// head, if present. The caller persists `row`.
    fn refresh_created(&mut self, ocfl_id: &str, row: &mut InventoryRow) -> Result<(), Error> {
        let v1 = self.txn.version_row(row.id, 1)?.map(|v| v.created);
        let head = self.txn.version_row(row.id, row.head.num())?.map(|v| v.created);

        let mut index = self.txn.open_table(CREATED_INDEX_TABLE)?;
        for (kind, current, stored) in [
            (CREATED_V1, &mut row.v1_created, v1),
            (CREATED_HEAD, &mut row.head_created, head),
        ] {
            if *current == stored {
                continue;
            }
            if let Some(old) = *current {
                index.remove(created_key(kind, old, ocfl_id).as_slice())?;
            }
            if let Some(new) = stored {
                index.insert(created_key(kind, new, ocfl_id).as_slice(), ())?;
            }
            *current = stored;
        }
        Ok(())
    }

    fn write_inventory_row(&mut self, ocfl_id: &str, row: &InventoryRow) -> Result<(), Error> {
        let data = serde_json::to_vec(row)?;
        self.txn
            .open_table(INVENTORY_TABLE)?
            .insert(ocfl_id, data.as_slice())?;
        Ok(())
    }
}

impl BackendTx for RedbTx {
    fn upsert_object_root(&mut self, path: &str, indexed_at: DateTime<Utc>) -> Result<u64, Error> {
        let id = match self.txn.root_row(path)? {
            Some(row) => row.id,
            None => {
                let id = next_id(&self.txn, "object_roots")?;
                self.txn.open_table(OBJECT_ROOT_ID_TABLE)?.insert(id, path)?;
                id
            }
        };
        let data = serde_json::to_vec(&ObjectRootRow {
            id,
            indexed_at: indexed_at.timestamp_micros(),
        })?;
        self.txn
            .open_table(OBJECT_ROOT_TABLE)?
            .insert(path, data.as_slice())?;
        Ok(id)
    }

    #[instrument(level = "debug", skip_all, fields(ocfl.id = %inv.ocfl_id), err)]
    fn upsert_inventory(&mut self, inv: &InventoryUpsert) -> Result<u64, Error> {
        if self.txn.root_path(inv.root_id)?.is_none() {
            return Err(Error::NotFound(format!("object root {}", inv.root_id)));
        }

        // an object root holds a single object
        if let Some(other) = self.txn.inventory_id_of_root(inv.root_id)? {
            if other != inv.ocfl_id {
                warn!(previous = %other, "object root now holds a different object");
                self.delete_inventory(&other)?;
            }
        }

        let existing = self.txn.inventory_row(&inv.ocfl_id)?;
        let (id, v1_created, head_created) = match existing {
            Some(row) => {
                if row.root_id != inv.root_id {
                    self.txn.open_table(INVENTORY_ROOT_TABLE)?.remove(row.root_id)?;
                }
                (row.id, row.v1_created, row.head_created)
            }
            None => {
                let id = next_id(&self.txn, "inventories")?;
                self.txn
                    .open_table(INVENTORY_ID_TABLE)?
                    .insert(id, inv.ocfl_id.as_str())?;
                (id, None, None)
            }
        };

        let mut row = InventoryRow {
            id,
            root_id: inv.root_id,
            spec: inv.spec,
            digest_algorithm: inv.digest_algorithm,
            inventory_digest: inv.inventory_digest.to_hex(),
            head: inv.head,
            indexed_at: inv.indexed_at.timestamp_micros(),
            v1_created,
            head_created,
        };
        self.refresh_created(&inv.ocfl_id, &mut row)?;
        self.write_inventory_row(&inv.ocfl_id, &row)?;
        self.txn
            .open_table(INVENTORY_ROOT_TABLE)?
            .insert(inv.root_id, inv.ocfl_id.as_str())?;
        Ok(id)
    }

    #[instrument(level = "debug", skip(self, version), fields(version.num = %version.num), err)]
    fn insert_version(&mut self, inventory_id: u64, version: &VersionInsert) -> Result<(), Error> {
        let ocfl_id = self
            .txn
            .ocfl_id_of(inventory_id)?
            .ok_or_else(|| Error::NotFound(format!("inventory {}", inventory_id)))?;

        if let Some(existing) = self.txn.version_row(inventory_id, version.num.num())? {
            let changed = if existing.message != version.message {
                Some("message")
            } else if existing.created != version.created.timestamp() {
                Some("created")
            } else if existing.user != version.user {
                Some("user")
            } else if existing.node_id != version.node_id {
                Some("state")
            } else {
                None
            };
            return match changed {
                Some(field) => Err(Error::IndexValueDrift(format!(
                    "{} of version {} of object {} changed",
                    field, version.num, ocfl_id
                ))),
                None => Ok(()),
            };
        }

        let data = serde_json::to_vec(&VersionRow {
            name: version.num,
            message: version.message.clone(),
            created: version.created.timestamp(),
            user: version.user.clone(),
            node_id: version.node_id,
        })?;
        self.txn.open_table(VERSION_TABLE)?.insert(
            version_key(inventory_id, version.num.num()).as_slice(),
            data.as_slice(),
        )?;

        let mut row = self
            .txn
            .inventory_row(&ocfl_id)?
            .ok_or_else(|| Error::NotFound(format!("object {}", ocfl_id)))?;
        self.refresh_created(&ocfl_id, &mut row)?;
        self.write_inventory_row(&ocfl_id, &row)
    }

    fn get_or_create_node(
        &mut self,
        digest: &Digest,
        is_dir: bool,
        size: Option<u64>,
    ) -> Result<(u64, NodeState), Error> {
        let key = node_key(digest, is_dir);
        if let Some(mut node) = self.txn.node_value(&key)? {
            if node.size.is_some() || size.is_none() {
                return Ok((node.id, NodeState::Existing));
            }
            node.size = size;
            self.txn
                .open_table(NODE_TABLE)?
                .insert(key.as_slice(), node.encode().as_slice())?;
            return Ok((node.id, NodeState::SizeFilled));
        }

        let id = next_id(&self.txn, "nodes")?;
        self.txn
            .open_table(NODE_TABLE)?
            .insert(key.as_slice(), NodeValue { id, size }.encode().as_slice())?;
        self.txn
            .open_table(NODE_ID_TABLE)?
            .insert(id, key.as_slice())?;
        Ok((id, NodeState::Created))
    }

    fn insert_name(&mut self, parent_id: u64, child_id: u64, name: &str) -> Result<(), Error> {
        match self.txn.name_child(parent_id, name)? {
            Some(existing) if existing == child_id => Ok(()),
            Some(existing) => Err(Error::IndexValueDrift(format!(
                "entry {:?} of node {} points to node {}, not {}",
                name, parent_id, existing, child_id
            ))),
            None => {
                self.txn
                    .open_table(NAME_TABLE)?
                    .insert(name_key(parent_id, name).as_slice(), child_id)?;
                Ok(())
            }
        }
    }

    fn insert_content_path(
        &mut self,
        inventory_id: u64,
        digest: &Digest,
        file_path: &str,
    ) -> Result<(), Error> {
        self.txn
            .open_table(CONTENT_PATH_TABLE)?
            .insert(content_key(digest, inventory_id, file_path).as_slice(), ())?;
        self.txn.open_table(CONTENT_PATH_INVENTORY_TABLE)?.insert(
            content_inventory_key(inventory_id, digest, file_path).as_slice(),
            (),
        )?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    fn remove_object_roots_before(&mut self, before: DateTime<Utc>) -> Result<u64, Error> {
        let cutoff = before.timestamp_micros();
        let stale: Vec<(String, u64)> = {
            let table = self.txn.open_table(OBJECT_ROOT_TABLE)?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                let row: ObjectRootRow = decode_row(v.value())?;
                if row.indexed_at < cutoff {
                    stale.push((k.value().to_string(), row.id));
                }
            }
            stale
        };

        for (path, id) in &stale {
            if let Some(ocfl_id) = self.txn.inventory_id_of_root(*id)? {
                self.delete_inventory(&ocfl_id)?;
            }
            self.txn.open_table(OBJECT_ROOT_TABLE)?.remove(path.as_str())?;
            self.txn.open_table(OBJECT_ROOT_ID_TABLE)?.remove(*id)?;
        }
        Ok(stale.len() as u64)
    }

    fn get_inventory_by_path(&self, path: &str) -> Result<Option<InventoryRecord>, Error> {
        self.txn.inventory_by_path(path)
    }

    fn list_object_roots(&self, limit: usize, cursor: &str) -> Result<ObjectRootList, Error> {
        self.txn.roots_page(limit, cursor)
    }

    fn commit(self: Box<Self>) -> Result<(), Error> {
        self.txn.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), Error> {
        self.txn.abort()?;
        Ok(())
    }
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedbIndexBackendConfig {
    is_temporary: bool,
    #[serde(default)]
    /// required when is_temporary = false
    path: Option<PathBuf>,
}

impl TryFrom<url::Url> for RedbIndexBackendConfig {
    type Error = Box<dyn std::error::Error + Send + Sync>;
    fn try_from(url: url::Url) -> Result<Self, Self::Error> {
        // redb doesn't support host, and a path can be provided (otherwise
        // it'll live in memory only).
        if url.has_host() {
            return Err(Error::StorageError("no host allowed".to_string()).into());
        }

        Ok(if url.path().is_empty() {
            RedbIndexBackendConfig {
                is_temporary: true,
                path: None,
            }
        } else {
            RedbIndexBackendConfig {
                is_temporary: false,
                path: Some(url.path().into()),
            }
        })
    }
}

impl RedbIndexBackendConfig {
    pub async fn build(&self) -> Result<RedbIndexBackend, Error> {
        match self {
            RedbIndexBackendConfig {
                is_temporary: true,
                path: None,
            } => RedbIndexBackend::new_temporary(),
            RedbIndexBackendConfig {
                is_temporary: true,
                path: Some(_),
            } => Err(Error::StorageError(
                "temporary RedbIndexBackend can not have path".into(),
            )),
            RedbIndexBackendConfig {
                is_temporary: false,
                path: None,
            } => Err(Error::StorageError("RedbIndexBackend is missing path".into())),
            RedbIndexBackendConfig {
                is_temporary: false,
                path: Some(path),
            } => RedbIndexBackend::new(path.clone()).await,
        }
    }
}
