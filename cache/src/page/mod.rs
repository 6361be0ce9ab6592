//! The page lifecycle: residency, snapshots, waiters, and loads.
//!
//! A [Page] represents at most one disk block. Its state is the product of
//! three mostly independent concerns:
//!
//! - **Residency**: the block's bytes may or may not be in memory. Bytes
//!   arrive through one of three loaders (by block id, by an existing token
//!   after eviction, or by copying a forked page) and leave through
//!   [Page::evict_self].
//! - **Backing**: a [crate::serializer::Token] may assert that the resident
//!   bytes match the block's durable image. Writing detaches the token;
//!   writeback re-attaches one via [Page::set_token].
//! - **Snapshots**: a count of live [Snapshot] handles. The page is
//!   destroyed the moment the count returns to zero; a load still in flight
//!   at that point observes a sentinel and discards its work.
//!
//! Access goes through an [Acquisition]: it registers as a waiter, its
//! `ready` signal pulses once bytes are resident, and only then does it hand
//! out buffer views. A write acquisition keeps the page pinned unevictable
//! for as long as it is attached. [Snapshot::page_for_write] is the sole
//! copy-on-write trigger: a page shared by more than one snapshot is forked
//! before a writer may touch it.
//!
//! Every state change recomputes the page's eviction category with the
//! [crate::evicter::Evicter] in the same non-suspending critical section, so
//! the evicter's bags are never stale across a suspension point.

mod storage;
pub use storage::{Acquisition, BufRead, BufWrite, Page, Snapshot};
