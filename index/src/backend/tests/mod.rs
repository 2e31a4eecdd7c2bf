//! This contains test scenarios that a given [IndexBackend] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all backends we want to test
//! against, and then apply this template to all test functions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use rstest::*;
use rstest_reuse::{self, *};

use super::{
    from_addr, with_tx, BackendTx, IndexBackend, InventoryUpsert, NodeState, ObjectListOptions,
    ObjectSort, StateQuery, Summary, VersionInsert,
};
use crate::digests::{Digest, DigestAlgorithm};
use crate::fixtures::{
    FILE_A_CONTENTS, FILE_A_DIGEST, FILE_B_CONTENTS, FILE_B_DIGEST, FILE_C_CONTENTS,
};
use crate::indexer::commit_tree;
use crate::inventory::{Spec, User, VNum};
use crate::tree::{LeafEntry, PathTree};
use crate::Error;

async fn redb_on_disk() -> Arc<dyn IndexBackend> {
    let dir = tempfile::TempDir::new().unwrap().into_path();
    from_addr(&format!("redb://{}", dir.join("index.redb").display()))
        .await
        .unwrap()
}

/// This produces a template, which will be applied to all individual test functions.
/// See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::redb_temporary(from_addr("redb://").await.unwrap())]
#[case::redb_file(redb_on_disk().await)]
pub fn backends(#[case] backend: impl IndexBackend) {}

type Files = &'static [(&'static str, &'static [u8])];

const NESTED: Files = &[
    ("a.txt", FILE_A_CONTENTS),
    ("b/c.txt", FILE_B_CONTENTS),
    ("b/d/e.txt", FILE_C_CONTENTS),
    ("z.txt", FILE_A_CONTENTS),
];

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn entries(files: Files) -> Vec<LeafEntry> {
    files
        .iter()
        .map(|(path, data)| LeafEntry {
            logical_path: path.to_string(),
            digest: DigestAlgorithm::Sha512.hash(data).to_hex(),
            content_path: format!("v1/content/{}", path),
        })
        .collect()
}

fn sizes(files: Files) -> HashMap<String, u64> {
    files
        .iter()
        .map(|(path, data)| (format!("v1/content/{}", path), data.len() as u64))
        .collect()
}

fn version(created: i64, message: &str, node_id: u64) -> VersionInsert {
    VersionInsert {
        num: VNum::new(1),
        message: message.to_string(),
        created: at(created),
        user: Some(User {
            name: "Tester".to_string(),
            address: "mailto:tester@example.org".to_string(),
        }),
        node_id,
    }
}

/// Stores a single-version object with the given files below `root`,
/// returning its inventory id.
fn put_object(
    tx: &mut dyn BackendTx,
    root: &str,
    ocfl_id: &str,
    created: i64,
    files: Files,
) -> Result<u64, Error> {
    let root_id = tx.upsert_object_root(root, at(created))?;
    let inventory_id = tx.upsert_inventory(&InventoryUpsert {
        ocfl_id: ocfl_id.to_string(),
        root_id,
        spec: Spec::Ocfl1_1,
        digest_algorithm: DigestAlgorithm::Sha512,
        inventory_digest: DigestAlgorithm::Sha512.hash(ocfl_id.as_bytes()),
        head: VNum::new(1),
        indexed_at: at(created),
    })?;

    let tree = PathTree::build(&entries(files), Some(&sizes(files)))?;
    let node_id = commit_tree(tx, &tree)?;
    tx.insert_version(inventory_id, &version(created, "initial", node_id))?;

    for entry in entries(files) {
        tx.insert_content_path(
            inventory_id,
            &Digest::from_hex(&entry.digest)?,
            &entry.content_path,
        )?;
    }
    Ok(inventory_id)
}

fn names(info: &super::PathInfo) -> Vec<&str> {
    info.children.iter().map(|c| c.name.as_str()).collect()
}

/// An empty index lists nothing and finds nothing.
#[apply(backends)]
#[tokio::test]
async fn empty(backend: impl IndexBackend) {
    let roots = backend.list_object_roots(0, "").await.unwrap();
    assert!(roots.roots.is_empty());
    assert_eq!("", roots.next_cursor);

    let objects = backend
        .list_objects(&ObjectListOptions::default())
        .await
        .unwrap();
    assert!(objects.objects.is_empty());

    assert_eq!(Summary::default(), backend.summary().await.unwrap());
    assert!(matches!(
        backend.get_object("obj-1").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        backend.get_object_by_path("obj-1").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        backend.get_content_path(&FILE_A_DIGEST).await,
        Err(Error::NotFound(_))
    ));
}

#[apply(backends)]
#[tokio::test]
async fn schema_version(backend: impl IndexBackend) {
    assert_eq!(
        super::redb::SCHEMA_VERSION,
        backend.schema_version().await.unwrap()
    );
}

/// Upserting an object root twice keeps its id, and refreshes its time.
#[apply(backends)]
#[tokio::test]
async fn object_root_idempotent(backend: impl IndexBackend) {
    let (first, second) = with_tx(&backend, |tx| {
        let first = tx.upsert_object_root("a/b", at(100))?;
        let second = tx.upsert_object_root("a/b", at(200))?;
        Ok((first, second))
    })
    .await
    .unwrap();
    assert_eq!(first, second);

    let roots = backend.list_object_roots(0, "").await.unwrap();
    assert_eq!(1, roots.roots.len());
    assert_eq!(at(200), roots.roots[0].indexed_at);
}

/// Concatenating all pages yields the unpaginated listing, for any limit.
#[apply(backends)]
#[tokio::test]
async fn object_root_pages(backend: impl IndexBackend) {
    with_tx(&backend, |tx| {
        for i in 0..25 {
            tx.upsert_object_root(&format!("root/{:02}", i), at(100))?;
        }
        Ok(())
    })
    .await
    .unwrap();

    let all = backend.list_object_roots(0, "").await.unwrap();
    assert_eq!(25, all.roots.len());
    assert_eq!("", all.next_cursor);

    for limit in 1..=7 {
        let mut paged = Vec::new();
        let mut cursor = String::new();
        loop {
            let page = backend.list_object_roots(limit, &cursor).await.unwrap();
            assert!(page.roots.len() <= limit);
            paged.extend(page.roots);
            if page.next_cursor.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
        assert_eq!(all.roots, paged, "limit {}", limit);
    }

    // past the end
    let page = backend.list_object_roots(10, "root/99").await.unwrap();
    assert!(page.roots.is_empty());
}

/// Nodes are unique by kind and digest, and learn their size once known.
#[apply(backends)]
#[tokio::test]
async fn node_dedup_and_size_backfill(backend: impl IndexBackend) {
    let (a, b, c, d) = with_tx(&backend, |tx| {
        let a = tx.get_or_create_node(&FILE_A_DIGEST, false, None)?;
        let b = tx.get_or_create_node(&FILE_A_DIGEST, false, Some(5))?;
        let c = tx.get_or_create_node(&FILE_A_DIGEST, true, None)?;
        let d = tx.get_or_create_node(&FILE_A_DIGEST, false, None)?;
        Ok((a, b, c, d))
    })
    .await
    .unwrap();

    assert_eq!(NodeState::Created, a.1);
    assert_eq!((a.0, NodeState::SizeFilled), b);
    assert_eq!(NodeState::Created, c.1, "a directory with the same digest is another node");
    assert_ne!(a.0, c.0);
    assert_eq!((a.0, NodeState::Existing), d);
    assert_eq!(2, backend.summary().await.unwrap().nodes);
}

/// A name edge can be repeated, but not repointed.
#[apply(backends)]
#[tokio::test]
async fn name_edges(backend: impl IndexBackend) {
    let result = with_tx(&backend, |tx| {
        let (dir, _) = tx.get_or_create_node(&DIR_DIGEST, true, None)?;
        let (a, _) = tx.get_or_create_node(&FILE_A_DIGEST, false, Some(5))?;
        let (b, _) = tx.get_or_create_node(&FILE_B_DIGEST, false, Some(7))?;
        tx.insert_name(dir, a, "x")?;
        tx.insert_name(dir, a, "x")?;
        tx.insert_name(dir, b, "y")?;
        tx.insert_name(dir, b, "x")
    })
    .await;
    assert!(matches!(result, Err(Error::IndexValueDrift(_))));

    // the failed transaction was rolled back
    assert_eq!(Summary::default(), backend.summary().await.unwrap());
}

lazy_static::lazy_static! {
    static ref DIR_DIGEST: Digest = DigestAlgorithm::Sha256.hash(b"some directory");
}

/// Stored versions are immutable.
#[apply(backends)]
#[tokio::test]
async fn version_drift(backend: impl IndexBackend) {
    let inventory_id = with_tx(&backend, |tx| put_object(tx, "obj-1", "obj-1", 100, NESTED))
        .await
        .unwrap();
    let node_id = with_tx(&backend, |tx| {
        let tree = PathTree::build(&entries(NESTED), Some(&sizes(NESTED)))?;
        commit_tree(tx, &tree)
    })
    .await
    .unwrap();

    // identical: accepted
    with_tx(&backend, move |tx| {
        tx.insert_version(inventory_id, &version(100, "initial", node_id))
    })
    .await
    .expect("unchanged version");

    for changed in [
        version(100, "edited", node_id),
        version(101, "initial", node_id),
        VersionInsert {
            user: None,
            ..version(100, "initial", node_id)
        },
    ] {
        let result = with_tx(&backend, move |tx| tx.insert_version(inventory_id, &changed)).await;
        assert!(
            matches!(result, Err(Error::IndexValueDrift(_))),
            "got {:?}",
            result
        );
    }
}

/// Replacing an inventory keeps its id, and an object root holds only one
/// object.
#[apply(backends)]
#[tokio::test]
async fn inventory_upsert(backend: impl IndexBackend) {
    let first = with_tx(&backend, |tx| put_object(tx, "r1", "obj-x", 100, NESTED))
        .await
        .unwrap();
    let second = with_tx(&backend, |tx| put_object(tx, "r1", "obj-x", 100, NESTED))
        .await
        .unwrap();
    assert_eq!(first, second);

    let object = backend.get_object_by_path("r1").await.unwrap();
    assert_eq!("obj-x", object.inventory.ocfl_id);

    with_tx(&backend, |tx| put_object(tx, "r1", "obj-y", 100, NESTED))
        .await
        .unwrap();
    assert!(matches!(
        backend.get_object("obj-x").await,
        Err(Error::NotFound(_))
    ));
    let object = backend.get_object_by_path("r1").await.unwrap();
    assert_eq!("obj-y", object.inventory.ocfl_id);
    assert_eq!(1, backend.summary().await.unwrap().inventories);
}

#[apply(backends)]
#[tokio::test]
async fn object_and_state(backend: impl IndexBackend) {
    with_tx(&backend, |tx| put_object(tx, "o/1", "obj-1", 100, NESTED))
        .await
        .unwrap();

    let object = backend.get_object("obj-1").await.unwrap();
    assert_eq!("o/1", object.inventory.root_path);
    assert_eq!(VNum::new(1), object.inventory.head);
    assert_eq!(1, object.versions.len());
    assert_eq!(Some(27), object.versions[0].size);
    assert_eq!("initial", object.versions[0].message);
    assert_eq!(at(100), object.versions[0].created);
    assert_eq!(object, backend.get_object_by_path("o/1").await.unwrap());
    assert_eq!(
        object.inventory,
        backend.get_inventory_by_path("o/1").await.unwrap()
    );
    assert!(matches!(
        backend.get_inventory_by_path("o/2").await,
        Err(Error::NotFound(_))
    ));

    // a.txt and z.txt share a node
    let summary = backend.summary().await.unwrap();
    assert_eq!(6, summary.nodes);
    assert_eq!(6, summary.names);
    assert_eq!(Some(at(100)), summary.indexed_at);

    let query = StateQuery {
        object_id: "obj-1".to_string(),
        ..Default::default()
    };
    let root = backend.get_object_state(&query).await.unwrap();
    assert!(root.is_dir);
    assert_eq!(Some(27), root.size);
    assert_eq!(object.versions[0].digest, root.digest);
    assert_eq!(vec!["a.txt", "b", "z.txt"], names(&root));
    assert_eq!(Some(17), root.children[1].size);
    assert!(root.children[1].is_dir);
    assert_eq!(root.children[0].digest, root.children[2].digest);

    let b = backend
        .get_object_state(&StateQuery {
            base_path: "b".to_string(),
            version: Some(VNum::new(1)),
            ..query.clone()
        })
        .await
        .unwrap();
    assert_eq!(vec!["c.txt", "d"], names(&b));

    let file = backend
        .get_object_state(&StateQuery {
            base_path: "b/d/e.txt".to_string(),
            ..query.clone()
        })
        .await
        .unwrap();
    assert!(!file.is_dir);
    assert_eq!(Some(10), file.size);
    assert!(file.children.is_empty());

    let recursive = backend
        .get_object_state(&StateQuery {
            recursive: true,
            ..query.clone()
        })
        .await
        .unwrap();
    assert_eq!(
        vec!["a.txt", "b/c.txt", "b/d/e.txt", "z.txt"],
        names(&recursive)
    );

    for (path, version) in [("missing", None), ("a.txt/x", None), ("", Some(VNum::new(2)))] {
        let result = backend
            .get_object_state(&StateQuery {
                base_path: path.to_string(),
                version,
                ..query.clone()
            })
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))), "{:?}", path);
    }
    assert!(matches!(
        backend
            .get_object_state(&StateQuery {
                base_path: "b/../a.txt".to_string(),
                ..query.clone()
            })
            .await,
        Err(Error::InvalidArgument(_))
    ));
}

/// Children and recursive listings page like every other listing.
#[apply(backends)]
#[tokio::test]
async fn state_pages(backend: impl IndexBackend) {
    with_tx(&backend, |tx| put_object(tx, "o/1", "obj-1", 100, NESTED))
        .await
        .unwrap();

    for recursive in [false, true] {
        let query = StateQuery {
            object_id: "obj-1".to_string(),
            recursive,
            ..Default::default()
        };
        let all = backend.get_object_state(&query).await.unwrap();
        assert_eq!("", all.next_cursor);

        for limit in 1..=3 {
            let mut paged = Vec::new();
            let mut cursor = String::new();
            loop {
                let page = backend
                    .get_object_state(&StateQuery {
                        limit,
                        cursor: cursor.clone(),
                        ..query.clone()
                    })
                    .await
                    .unwrap();
                assert!(page.children.len() <= limit);
                paged.extend(page.children);
                if page.next_cursor.is_empty() {
                    break;
                }
                cursor = page.next_cursor;
            }
            assert_eq!(all.children, paged, "recursive {}, limit {}", recursive, limit);
        }
    }
}

#[apply(backends)]
#[tokio::test]
async fn list_objects_sorted(backend: impl IndexBackend) {
    with_tx(&backend, |tx| {
        put_object(tx, "r/a", "obj-a", 300, NESTED)?;
        put_object(tx, "r/b", "obj-b", 100, NESTED)?;
        put_object(tx, "r/c", "obj-c", 200, NESTED)?;
        Ok(())
    })
    .await
    .unwrap();

    for (sort, descending, expected) in [
        (ObjectSort::Id, false, ["obj-a", "obj-b", "obj-c"]),
        (ObjectSort::Id, true, ["obj-c", "obj-b", "obj-a"]),
        (ObjectSort::V1Created, false, ["obj-b", "obj-c", "obj-a"]),
        (ObjectSort::V1Created, true, ["obj-a", "obj-c", "obj-b"]),
        (ObjectSort::HeadCreated, false, ["obj-b", "obj-c", "obj-a"]),
    ] {
        let opts = ObjectListOptions {
            sort,
            descending,
            ..Default::default()
        };
        let all = backend.list_objects(&opts).await.unwrap();
        let ids: Vec<&str> = all.objects.iter().map(|o| o.ocfl_id.as_str()).collect();
        assert_eq!(expected.to_vec(), ids, "{:?} descending={}", sort, descending);
        assert_eq!("", all.next_cursor);

        let mut paged = Vec::new();
        let mut cursor = String::new();
        loop {
            let page = backend
                .list_objects(&ObjectListOptions {
                    limit: 1,
                    cursor: cursor.clone(),
                    ..opts.clone()
                })
                .await
                .unwrap();
            paged.extend(page.objects);
            if page.next_cursor.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
        assert_eq!(all.objects, paged, "{:?} descending={}", sort, descending);
    }

    let listed = backend
        .list_objects(&ObjectListOptions::default())
        .await
        .unwrap();
    assert_eq!(Some(at(300)), listed.objects[0].v1_created);
    assert_eq!(Some(at(300)), listed.objects[0].head_created);

    assert!(matches!(
        backend
            .list_objects(&ObjectListOptions {
                cursor: "not a cursor!".to_string(),
                ..Default::default()
            })
            .await,
        Err(Error::InvalidArgument(_))
    ));
}

#[apply(backends)]
#[tokio::test]
async fn content_paths(backend: impl IndexBackend) {
    with_tx(&backend, |tx| put_object(tx, "r/x", "obj-x", 100, NESTED))
        .await
        .unwrap();
    assert_eq!(
        "r/x/v1/content/b/c.txt",
        backend.get_content_path(&FILE_B_DIGEST).await.unwrap()
    );
    // repeated inserts are no-ops
    with_tx(&backend, |tx| put_object(tx, "r/x", "obj-x", 100, NESTED))
        .await
        .unwrap();
    assert_eq!(4, backend.summary().await.unwrap().content_paths);
}

/// Removing stale object roots takes their objects along.
#[apply(backends)]
#[tokio::test]
async fn remove_stale_roots(backend: impl IndexBackend) {
    const ONLY_A: Files = &[("a.txt", FILE_A_CONTENTS)];
    const ONLY_B: Files = &[("b.txt", FILE_B_CONTENTS)];
    with_tx(&backend, |tx| {
        put_object(tx, "r1", "obj-a", 100, ONLY_A)?;
        put_object(tx, "r2", "obj-b", 200, ONLY_B)?;
        Ok(())
    })
    .await
    .unwrap();

    let removed = with_tx(&backend, |tx| tx.remove_object_roots_before(at(200)))
        .await
        .unwrap();
    assert_eq!(1, removed);

    assert!(matches!(
        backend.get_object("obj-a").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        backend.get_content_path(&FILE_A_DIGEST).await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(
        "r2/v1/content/b.txt",
        backend.get_content_path(&FILE_B_DIGEST).await.unwrap()
    );

    let listed = backend
        .list_objects(&ObjectListOptions {
            sort: ObjectSort::V1Created,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(1, listed.objects.len());
    assert_eq!("obj-b", listed.objects[0].ocfl_id);

    let roots = backend.list_object_roots(0, "").await.unwrap();
    assert_eq!(vec!["r2"], roots.roots.iter().map(|r| r.path.as_str()).collect::<Vec<_>>());
}

/// Reads inside a transaction see its own writes, and nothing survives a
/// rollback.
#[apply(backends)]
#[tokio::test]
async fn rollback(backend: impl IndexBackend) {
    let tx = backend.begin_tx().await.unwrap();
    tokio::task::spawn_blocking(move || {
        let mut tx = tx;
        put_object(tx.as_mut(), "r1", "obj-1", 100, NESTED)?;
        assert_eq!(
            "obj-1",
            tx.get_inventory_by_path("r1")?.expect("own write").ocfl_id
        );
        assert_eq!(1, tx.list_object_roots(0, "")?.roots.len());
        tx.rollback()
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(Summary::default(), backend.summary().await.unwrap());
}
