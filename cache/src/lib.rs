//! A copy-on-write page layer for a block cache.
//!
//! `snapcache` owns the in-memory representation of disk blocks for a cache
//! sitting between a block serializer (durability) and transactional index
//! code (callers). A [page::Page] tracks whether bytes are resident, whether
//! a disk token backs them, and how many snapshots pin the page, plus the
//! waiters and at-most-one in-flight load that connect them.
//! [page::Snapshot] is the
//! owning handle (copy-on-write forks happen when a writer shares a page),
//! [page::Acquisition] the short-lived handle that waits for residency and
//! grants buffer access, and the [evicter::Evicter] files every page under
//! the category an eviction policy would search.
//!
//! Loads are spawned on the runtime context and may suspend; a page that is
//! logically destroyed mid-load trips a sentinel the loader re-checks before
//! committing, and shutdown drains outstanding loads through
//! [drainer::Drainer].
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Runner};
//! use snapcache::{
//!     cache::Cache,
//!     mocks,
//!     page::{Acquisition, Page, Snapshot},
//!     serializer::BlockId,
//! };
//! use std::time::Duration;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     // An in-memory serializer holding one 64-byte block.
//!     let serializer = mocks::Memory::new(context.clone(), 64, Duration::from_millis(1));
//!     serializer.put(BlockId(7), vec![0xAB; 64]);
//!     let cache = Cache::new(context.clone(), serializer);
//!
//!     // Pin a page for block 7 and wait for its bytes.
//!     let snapshot = Snapshot::new(Page::load(&cache, BlockId(7)));
//!     let mut acq = Acquisition::new();
//!     acq.init_read(snapshot.page_for_read());
//!     assert_eq!(acq.buf_size().await.unwrap(), 64);
//!     assert_eq!(acq.read().await.unwrap()[0], 0xAB);
//! });
//! ```

pub mod cache;
pub mod drainer;
pub mod evicter;
pub mod mocks;
pub mod page;
pub mod serializer;

use serializer::BlockId;
use thiserror::Error;

/// Errors surfaced by the page layer.
///
/// Load failures reach waiters as `Arc<Error>`: one failed read may have to
/// be delivered to any number of concurrently attached acquisitions.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("missing block: {0}")]
    MissingBlock(BlockId),
    #[error("block read failed: {0}")]
    ReadFailed(BlockId),
}
