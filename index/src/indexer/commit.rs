use chrono::{DateTime, Utc};

use crate::backend::{BackendTx, InventoryUpsert, VersionInsert};
use crate::digests::Digest;
use crate::inventory::{Inventory, VNum};
use crate::tree::PathTree;
use crate::Error;

/// Persists the nodes and name edges of a tree, returning the node id of
/// its root. Directories that already exist are not descended into, unless
/// this tree supplied their size, in which case their entries get sizes too.
pub fn commit_tree(tx: &mut dyn BackendTx, tree: &PathTree) -> Result<u64, Error> {
    let mut root_id = None;
    // (arena index, parent node id)
    let mut stack = vec![(PathTree::ROOT, None)];
    while let Some((idx, parent)) = stack.pop() {
        let node = tree.node(idx);
        let (id, state) = tx.get_or_create_node(&node.val.digest, node.is_dir, node.val.size())?;
        match parent {
            Some(parent) => tx.insert_name(parent, id, &node.name)?,
            None => root_id = Some(id),
        }
        if node.is_dir && state.is_incomplete() {
            stack.extend(node.children.values().map(|&child| (child, Some(id))));
        }
    }
    root_id.ok_or_else(|| Error::StorageError("tree has no root".to_string()))
}

/// Writes a changed inventory: object root, inventory record, all version
/// trees in ascending order, and the content paths of the manifest.
pub fn apply_inventory(
    tx: &mut dyn BackendTx,
    root_path: &str,
    inventory: &Inventory,
    trees: &[(VNum, PathTree)],
    indexed_at: DateTime<Utc>,
) -> Result<u64, Error> {
    let root_id = tx.upsert_object_root(root_path, indexed_at)?;
    let inventory_id = tx.upsert_inventory(&InventoryUpsert {
        ocfl_id: inventory.id.clone(),
        root_id,
        spec: inventory.spec()?,
        digest_algorithm: inventory.digest_algorithm,
        inventory_digest: inventory.digest().clone(),
        head: inventory.head,
        indexed_at,
    })?;

    for (vnum, tree) in trees {
        let version = inventory
            .versions
            .get(vnum)
            .ok_or_else(|| Error::MissingValue(format!("version {} of {}", vnum, inventory.id)))?;
        let node_id = commit_tree(tx, tree)?;
        tx.insert_version(
            inventory_id,
            &VersionInsert {
                num: *vnum,
                message: version.message.clone(),
                created: version.created.with_timezone(&Utc),
                user: version.user.clone(),
                node_id,
            },
        )?;
    }

    for (digest, paths) in &inventory.manifest {
        let digest = Digest::from_hex(digest)?;
        for path in paths {
            tx.insert_content_path(inventory_id, &digest, path)?;
        }
    }
    Ok(inventory_id)
}
