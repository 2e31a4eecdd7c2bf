#[cfg(test)]
use rstest_reuse;

mod digests;
mod errors;

pub mod backend;
pub mod fixtures;
pub mod fs;
pub mod indexer;
pub mod inventory;
pub mod layout;
pub mod scheduler;
pub mod tree;

pub use digests::{Digest, DigestAlgorithm};
pub use errors::Error;
pub use indexer::{BuildInfo, Index, IndexMode, IndexOptions, IndexStats};
