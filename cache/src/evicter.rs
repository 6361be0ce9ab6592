//! Eviction-category bookkeeping for pages.
//!
//! The evicter never picks victims itself (that is the concern of whatever
//! policy sits above the cache); it keeps every page filed in the bag such a
//! policy would search, maintains the access-time tick stream, and accounts
//! for resident bytes. Bag membership is updated in a two-phase pattern
//! (compute the page's current bag, mutate page state, then commit the move)
//! inside one non-suspending critical section, so no other task ever
//! observes a page filed under a stale category.

use commonware_runtime::Metrics;
use parking_lot::Mutex;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use std::{
    collections::HashMap,
    sync::{atomic::AtomicU64, Arc},
};
use tracing::trace;

/// The categories a page can be filed under.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Bag {
    /// Pages with attached waiters, an in-flight load, or a sticky load
    /// failure. Never offered to a policy.
    Unevictable,
    /// Pages with no resident bytes and a disk token to rehydrate from.
    Evicted,
    /// Resident pages with no disk token. There is nothing to fall back on,
    /// so these cannot be dropped until written back.
    EvictableUnbacked,
    /// Resident pages whose bytes match the durable image; valid victims.
    EvictableDiskBacked,
}

/// The page-state booleans categorization depends on.
#[derive(Clone, Copy, Debug)]
pub struct Status {
    /// Bytes are resident.
    pub resident: bool,
    /// A disk token is attached.
    pub backed: bool,
    /// At least one waiter is attached.
    pub waiting: bool,
    /// A load is in flight.
    pub loading: bool,
    /// A block-id load failed and the page has nothing to retry from.
    pub failed: bool,
}

/// Files every live page under its eviction category and tracks the
/// accounting an eviction policy needs.
///
/// The evicter never takes a page's lock: callers pass in a [Status] snapshot
/// of the state they just mutated, and access times live in a shared atomic.
/// This keeps the lock order strict (page before evicter) everywhere.
#[derive(Clone)]
pub struct Evicter {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,

    resident: Gauge,
    unevictable: Gauge,
    evicted: Gauge,
    evictable_unbacked: Gauge,
    evictable_disk_backed: Gauge,
    evictions: Counter,
}

struct State {
    pages: HashMap<u64, Tracked>,
    access_counter: u64,
    next_page_id: u64,
}

struct Tracked {
    bag: Bag,
    /// Resident bytes currently accounted to this page.
    resident: u32,
    /// Shared with the page so a policy can rank victims without locking it.
    #[allow(dead_code)]
    access_time: Arc<AtomicU64>,
}

impl Evicter {
    /// The first tick [Evicter::next_access_time] hands out. The counter
    /// starts high enough above the read-ahead stamp that one-at-a-time
    /// increments keep ordinary pages distinguishable from read-ahead ones
    /// even across (absurdly long) counter histories.
    pub const INITIAL_ACCESS_TIME: u64 = 1 << 62;

    /// Access time stamped on read-ahead pages so a recency-based policy
    /// prefers them as victims.
    pub const READ_AHEAD_ACCESS_TIME: u64 = Self::INITIAL_ACCESS_TIME - 1;

    pub fn new(context: &impl Metrics) -> Self {
        let resident = Gauge::default();
        context.register("resident", "Bytes of resident page buffers", resident.clone());
        let unevictable = Gauge::default();
        context.register(
            "unevictable",
            "Pages with waiters or an in-flight load",
            unevictable.clone(),
        );
        let evicted = Gauge::default();
        context.register(
            "evicted",
            "Pages with a token but no resident bytes",
            evicted.clone(),
        );
        let evictable_unbacked = Gauge::default();
        context.register(
            "evictable_unbacked",
            "Resident pages with no disk token",
            evictable_unbacked.clone(),
        );
        let evictable_disk_backed = Gauge::default();
        context.register(
            "evictable_disk_backed",
            "Resident pages matching their durable image",
            evictable_disk_backed.clone(),
        );
        let evictions = Counter::default();
        context.register("evictions", "Number of resident buffers dropped", evictions.clone());
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    pages: HashMap::new(),
                    access_counter: Self::INITIAL_ACCESS_TIME,
                    next_page_id: 0,
                }),
                resident,
                unevictable,
                evicted,
                evictable_unbacked,
                evictable_disk_backed,
                evictions,
            }),
        }
    }

    /// The bag a page with `status` belongs in.
    pub fn categorize(status: Status) -> Bag {
        if status.loading || status.waiting || status.failed {
            Bag::Unevictable
        } else if !status.resident {
            // An unloaded page must have a token, or it could never be
            // loaded again.
            assert!(status.backed, "unloaded page is not in a loadable state");
            Bag::Evicted
        } else if status.backed {
            Bag::EvictableDiskBacked
        } else {
            Bag::EvictableUnbacked
        }
    }

    /// Hand out a fresh page id.
    pub(crate) fn next_page_id(&self) -> u64 {
        let mut state = self.inner.state.lock();
        let id = state.next_page_id;
        state.next_page_id += 1;
        id
    }

    /// Next monotone access-time tick.
    pub fn next_access_time(&self) -> u64 {
        let mut state = self.inner.state.lock();
        let tick = state.access_counter;
        state.access_counter += 1;
        tick
    }

    /// File a page that was created with a load already in flight.
    pub(crate) fn add_not_yet_loaded(&self, id: u64, access_time: Arc<AtomicU64>) {
        self.file(id, access_time, Bag::Unevictable, 0);
    }

    /// File a freshly allocated page: resident bytes, no disk image yet.
    pub(crate) fn add_to_evictable_unbacked(&self, id: u64, access_time: Arc<AtomicU64>, size: u32) {
        self.file(id, access_time, Bag::EvictableUnbacked, size);
    }

    /// File a read-ahead page: resident bytes that match the durable image.
    pub(crate) fn add_to_evictable_disk_backed(
        &self,
        id: u64,
        access_time: Arc<AtomicU64>,
        size: u32,
    ) {
        self.file(id, access_time, Bag::EvictableDiskBacked, size);
    }

    fn file(&self, id: u64, access_time: Arc<AtomicU64>, bag: Bag, resident: u32) {
        let mut state = self.inner.state.lock();
        let previous = state.pages.insert(
            id,
            Tracked {
                bag,
                resident,
                access_time,
            },
        );
        assert!(previous.is_none(), "page {id} filed twice");
        self.bag_gauge(bag).inc();
        if resident > 0 {
            self.inner.resident.inc_by(i64::from(resident));
        }
        trace!(page = id, ?bag, "filed");
    }

    /// First phase of a category update: the bag the page belongs in right
    /// now, before the caller mutates its state.
    pub(crate) fn correct_eviction_category(&self, id: u64, status: Status) -> Bag {
        let bag = Self::categorize(status);
        debug_assert_eq!(
            self.inner.state.lock().pages.get(&id).map(|t| t.bag),
            Some(bag),
            "page {id} filed under a stale category"
        );
        bag
    }

    /// Second phase: commit the move implied by the page's post-mutation
    /// `status`. Also reconciles resident-byte accounting when the page just
    /// lost its buffer.
    pub(crate) fn change_to_correct_eviction_bag(&self, old: Bag, id: u64, status: Status) {
        let new = Self::categorize(status);
        let mut state = self.inner.state.lock();
        let tracked = state.pages.get_mut(&id).expect("page not filed");
        if !status.resident && tracked.resident > 0 {
            self.inner.resident.dec_by(i64::from(tracked.resident));
            tracked.resident = 0;
            self.inner.evictions.inc();
        }
        if new == old {
            return;
        }
        assert_eq!(tracked.bag, old, "page {id} moved out from under a bag change");
        tracked.bag = new;
        drop(state);
        self.bag_gauge(old).dec();
        self.bag_gauge(new).inc();
        trace!(page = id, from = ?old, to = ?new, "changed bag");
    }

    /// Account bytes that just became resident through a load commit.
    pub(crate) fn add_now_loaded_size(&self, id: u64, size: u32) {
        let mut state = self.inner.state.lock();
        let tracked = state.pages.get_mut(&id).expect("page not filed");
        assert_eq!(tracked.resident, 0, "page {id} already accounted as resident");
        tracked.resident = size;
        self.inner.resident.inc_by(i64::from(size));
    }

    /// Final deregistration: the page has been destroyed.
    pub(crate) fn remove_page(&self, id: u64) {
        let tracked = self
            .inner
            .state
            .lock()
            .pages
            .remove(&id)
            .expect("page not filed");
        self.bag_gauge(tracked.bag).dec();
        if tracked.resident > 0 {
            self.inner.resident.dec_by(i64::from(tracked.resident));
        }
        trace!(page = id, "removed");
    }

    /// Debug-assertion support: is the page currently filed as unevictable?
    pub fn page_is_in_unevictable_bag(&self, id: u64) -> bool {
        self.inner
            .state
            .lock()
            .pages
            .get(&id)
            .map(|tracked| tracked.bag == Bag::Unevictable)
            .unwrap_or(false)
    }

    /// Number of pages currently filed.
    pub fn tracked(&self) -> usize {
        self.inner.state.lock().pages.len()
    }

    fn bag_gauge(&self, bag: Bag) -> &Gauge {
        match bag {
            Bag::Unevictable => &self.inner.unevictable,
            Bag::Evicted => &self.inner.evicted,
            Bag::EvictableUnbacked => &self.inner.evictable_unbacked,
            Bag::EvictableDiskBacked => &self.inner.evictable_disk_backed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Metrics, Runner};
    use std::sync::atomic::AtomicU64;

    fn status(resident: bool, backed: bool, waiting: bool, loading: bool) -> Status {
        Status {
            resident,
            backed,
            waiting,
            loading,
            failed: false,
        }
    }

    #[test]
    fn test_categorize() {
        // Waiters and loads dominate everything else.
        assert_eq!(Evicter::categorize(status(true, true, true, false)), Bag::Unevictable);
        assert_eq!(Evicter::categorize(status(false, false, false, true)), Bag::Unevictable);
        // Quiescent pages split on residency and backing.
        assert_eq!(Evicter::categorize(status(false, true, false, false)), Bag::Evicted);
        assert_eq!(
            Evicter::categorize(status(true, false, false, false)),
            Bag::EvictableUnbacked
        );
        assert_eq!(
            Evicter::categorize(status(true, true, false, false)),
            Bag::EvictableDiskBacked
        );
        // Sticky failures stay unevictable.
        assert_eq!(
            Evicter::categorize(Status {
                resident: false,
                backed: false,
                waiting: false,
                loading: false,
                failed: true,
            }),
            Bag::Unevictable
        );
    }

    #[test]
    #[should_panic(expected = "not in a loadable state")]
    fn test_categorize_unloadable() {
        Evicter::categorize(status(false, false, false, false));
    }

    #[test]
    fn test_access_time_ticks() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let evicter = Evicter::new(&context);
            let first = evicter.next_access_time();
            assert_eq!(first, Evicter::INITIAL_ACCESS_TIME);
            assert!(Evicter::READ_AHEAD_ACCESS_TIME < first);
            assert_eq!(evicter.next_access_time(), first + 1);
        });
    }

    #[test_traced]
    fn test_bag_accounting() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let evicter = Evicter::new(&context);
            let at = Arc::new(AtomicU64::new(0));
            let id = evicter.next_page_id();
            evicter.add_to_evictable_disk_backed(id, at.clone(), 64);
            assert_eq!(evicter.tracked(), 1);
            let buffer = context.encode();
            assert!(buffer.contains("resident 64"));
            assert!(buffer.contains("evictable_disk_backed 1"));

            // A waiter arrives: resident bytes stay, the bag changes.
            let old = evicter.correct_eviction_category(id, status(true, true, false, false));
            evicter.change_to_correct_eviction_bag(old, id, status(true, true, true, false));
            assert!(evicter.page_is_in_unevictable_bag(id));
            let buffer = context.encode();
            assert!(buffer.contains("unevictable 1"));
            assert!(buffer.contains("evictable_disk_backed 0"));

            // The waiter leaves and the page self-evicts: bytes are
            // deaccounted and an eviction is counted.
            let old = evicter.correct_eviction_category(id, status(true, true, true, false));
            evicter.change_to_correct_eviction_bag(old, id, status(true, true, false, false));
            let old = evicter.correct_eviction_category(id, status(true, true, false, false));
            evicter.change_to_correct_eviction_bag(old, id, status(false, true, false, false));
            let buffer = context.encode();
            assert!(buffer.contains("resident 0"));
            assert!(buffer.contains("evicted 1"));
            assert!(buffer.contains("evictions_total 1"));

            evicter.remove_page(id);
            assert_eq!(evicter.tracked(), 0);
            let buffer = context.encode();
            assert!(buffer.contains("evicted 0"));
        });
    }

    #[test_traced]
    fn test_remove_page_deaccounts_resident() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let evicter = Evicter::new(&context);
            let id = evicter.next_page_id();
            evicter.add_not_yet_loaded(id, Arc::new(AtomicU64::new(0)));
            evicter.add_now_loaded_size(id, 128);
            let buffer = context.encode();
            assert!(buffer.contains("resident 128"));

            evicter.remove_page(id);
            let buffer = context.encode();
            assert!(buffer.contains("resident 0"));
            // Deregistration is not an eviction.
            assert!(buffer.contains("evictions_total 0"));
        });
    }
}
