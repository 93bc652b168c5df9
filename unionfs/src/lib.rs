//! A union filesystem: several backing directories ("sources") presented as
//! one mount, plus an offline tool to rebalance what's already been written
//! across them.
//!
//! The model lives in three small, independent pieces:
//! - [router] decides, for any given logical path, which source a read or a
//!   new write lands on.
//! - [aggregator] handles the handful of operations that are inherently
//!   whole-mount rather than single-path: listing the root, merging
//!   `statvfs`, and the startup duplicate-name check.
//! - [balancer] is the offline companion: given a quiescent set of sources,
//!   it relocates whole top-level entries to even out used space.
//!
//! [fs] bridges all of the above to `fuse-backend-rs`'s synchronous
//! `FileSystem` trait; everything above it is plain path-in, path-out code
//! with no notion of inodes or open file handles.

pub mod aggregator;
pub mod balancer;
pub mod config;
pub mod error;
pub mod fs;
pub mod inode;
pub mod router;
pub mod source;

pub use aggregator::NamespaceAggregator;
pub use balancer::{Balancer, Move};
pub use config::MountOptions;
pub use error::{Error, Result};
pub use fs::UnionFs;
pub use router::PathRouter;
pub use source::Source;
