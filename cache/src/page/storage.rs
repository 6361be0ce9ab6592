use crate::{
    cache::Cache,
    drainer::Lease,
    evicter::Status,
    serializer::{BlockId, Serializer, Token},
    Error,
};
use commonware_runtime::{Metrics, Spawner};
use parking_lot::{Mutex, MutexGuard};
use futures::channel::oneshot;
use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, trace, warn};

/// In-memory representation of at most one disk block.
///
/// `Page` is a cheap-clone handle; cloning it does not extend the page's
/// logical lifetime (only [Snapshot] does that). The page's state lives
/// behind a mutex whose guard is never held across a suspension point, so
/// every operation below is atomic with respect to all other tasks.
pub struct Page<E: Spawner + Metrics, S: Serializer> {
    id: u64,
    cache: Cache<E, S>,
    /// Outside the mutex so an eviction policy can rank victims without
    /// taking the page lock.
    access_time: Arc<AtomicU64>,
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    /// Serialized size in bytes; valid whenever `buf` or `token` is present.
    size: u32,
    buf: Option<Vec<u8>>,
    token: Option<Token>,
    waiters: Vec<Waiter>,
    next_waiter: u64,
    snapshot_refs: usize,
    /// Outstanding write acquisitions; at most one.
    writers: usize,
    loading: bool,
    /// Destroy sentinel: set when the page is destroyed while `loading`, and
    /// re-checked by the loader before it commits.
    aborted: bool,
    destroyed: bool,
    /// Sticky failure of a block-id load; there is no token to retry from.
    failed: Option<Arc<Error>>,
}

struct Waiter {
    id: u64,
    /// Taken when the waiter is pulsed.
    sender: Option<oneshot::Sender<Result<(), Arc<Error>>>>,
}

impl Inner {
    fn loading() -> Self {
        Self {
            size: 0,
            buf: None,
            token: None,
            waiters: Vec::new(),
            next_waiter: 0,
            snapshot_refs: 0,
            writers: 0,
            loading: true,
            aborted: false,
            destroyed: false,
            failed: None,
        }
    }

    fn resident(size: u32, buf: Vec<u8>, token: Option<Token>) -> Self {
        Self {
            size,
            buf: Some(buf),
            token,
            waiters: Vec::new(),
            next_waiter: 0,
            snapshot_refs: 0,
            writers: 0,
            loading: false,
            aborted: false,
            destroyed: false,
            failed: None,
        }
    }

    fn status(&self) -> Status {
        Status {
            resident: self.buf.is_some(),
            backed: self.token.is_some(),
            waiting: !self.waiters.is_empty(),
            loading: self.loading,
            failed: self.failed.is_some(),
        }
    }
}

impl<E: Spawner + Metrics, S: Serializer> Page<E, S> {
    fn alloc(cache: &Cache<E, S>, inner: Inner, access_time: u64) -> Self {
        Self {
            id: cache.evicter().next_page_id(),
            cache: cache.clone(),
            access_time: Arc::new(AtomicU64::new(access_time)),
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Construct a page for `block_id` and spawn the load that fills it.
    ///
    /// The returned page has no resident bytes yet; bind an [Acquisition] to
    /// wait for them. Does not suspend.
    pub fn load(cache: &Cache<E, S>, block_id: BlockId) -> Self {
        let page = Self::alloc(cache, Inner::loading(), cache.evicter().next_access_time());
        cache.evicter().add_not_yet_loaded(page.id, page.access_time.clone());
        // The lease is taken here, not in the spawned task, so a drain that
        // starts before the task first runs still waits for it.
        let lease = cache.drainer().lease();
        Self::spawn_load_by_id(page.clone(), block_id, lease);
        page
    }

    /// Construct a page for a brand-new block: resident bytes, no disk image.
    ///
    /// `buf` must come from the serializer's [Serializer::malloc]. Does not
    /// suspend.
    pub fn fresh(cache: &Cache<E, S>, buf: Vec<u8>) -> Self {
        assert_eq!(buf.len(), cache.serializer().block_size());
        let size = buf.len() as u32;
        let page = Self::alloc(
            cache,
            Inner::resident(size, buf, None),
            cache.evicter().next_access_time(),
        );
        cache
            .evicter()
            .add_to_evictable_unbacked(page.id, page.access_time.clone(), size);
        page
    }

    /// Construct a page from bytes and a token the caller already obtained
    /// (the read-ahead path).
    ///
    /// Stamped with the cold access time so a recency-based policy prefers it
    /// as a victim. Does not suspend.
    pub fn read_ahead(cache: &Cache<E, S>, buf: Vec<u8>, token: Token) -> Self {
        assert_eq!(buf.len(), cache.serializer().block_size());
        assert!(token.size() as usize <= buf.len());
        let size = token.size();
        let page = Self::alloc(
            cache,
            Inner::resident(size, buf, Some(token)),
            crate::evicter::Evicter::READ_AHEAD_ACCESS_TIME,
        );
        cache
            .evicter()
            .add_to_evictable_disk_backed(page.id, page.access_time.clone(), size);
        page
    }

    /// Fork this page. Does not suspend.
    ///
    /// A resident copyee is copied before control returns, so a snapshot
    /// taken ahead of a write always observes the pre-write bytes. An
    /// unloaded copyee is copied by a spawned task that chains onto its load.
    pub fn make_copy(&self) -> Self {
        let mut copied = None;
        {
            let inner = self.inner.lock();
            if let Some(bytes) = &inner.buf {
                let mut buf = self.cache.serializer().malloc();
                buf[..bytes.len()].copy_from_slice(bytes);
                copied = Some((buf, inner.size));
            }
        }
        if let Some((buf, size)) = copied {
            let page = Self::alloc(
                &self.cache,
                Inner::resident(size, buf, None),
                self.cache.evicter().next_access_time(),
            );
            self.cache
                .evicter()
                .add_to_evictable_unbacked(page.id, page.access_time.clone(), size);
            self.cache.loads().inc();
            debug!(page = page.id, size, "copy committed");
            return page;
        }

        let page = Self::alloc(
            &self.cache,
            Inner::loading(),
            self.cache.evicter().next_access_time(),
        );
        self.cache
            .evicter()
            .add_not_yet_loaded(page.id, page.access_time.clone());
        let lease = self.cache.drainer().lease();
        // Pin the copyee before control returns, so it cannot be destroyed
        // before the copy task first runs.
        let pin = Snapshot::new(self.clone());
        Self::spawn_copy(page.clone(), pin, lease);
        page
    }

    // --- Snapshot accounting ---

    /// Record one more live [Snapshot]. Does not suspend (the copy loader
    /// calls this from inside a load).
    fn add_snapshotter(&self) {
        let mut inner = self.inner.lock();
        assert!(!inner.destroyed, "snapshot of a destroyed page");
        inner.snapshot_refs += 1;
    }

    /// Record one [Snapshot] gone; destroys the page when none remain.
    fn remove_snapshotter(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.snapshot_refs > 0, "snapshot count underflow");
        inner.snapshot_refs -= 1;
        if inner.snapshot_refs > 0 {
            return;
        }

        // Every Acquisition is bounded by the lifetime of some Snapshot on
        // the same page, so none can still be attached.
        assert!(inner.waiters.is_empty(), "page destroyed with attached waiters");
        if inner.loading {
            // Let the in-flight load discover the abandonment when it
            // resumes; it will discard its work without touching us.
            inner.aborted = true;
        }
        inner.destroyed = true;
        inner.buf = None;
        inner.token = None;
        inner.failed = None;
        self.cache.evicter().remove_page(self.id);
        trace!(page = self.id, "destroyed");
    }

    /// Number of live snapshots; drives the copy-on-write decision.
    pub fn num_snapshot_refs(&self) -> usize {
        self.inner.lock().snapshot_refs
    }

    // --- Waiters ---

    fn add_waiter(&self, write: bool) -> (u64, oneshot::Receiver<Result<(), Arc<Error>>>) {
        let mut inner = self.inner.lock();
        assert!(
            inner.snapshot_refs > 0,
            "acquisition must be pinned by a snapshot"
        );
        if write {
            assert_eq!(inner.writers, 0, "page already has an outstanding writer");
            inner.writers += 1;
        }
        let before = inner.status();
        let old = self.cache.evicter().correct_eviction_category(self.id, before);

        let id = inner.next_waiter;
        inner.next_waiter += 1;
        let (sender, receiver) = oneshot::channel();
        let mut sender = Some(sender);
        let mut reload = None;
        if inner.buf.is_some() {
            // Resident: ready before control returns to the caller.
            let _ = sender.take().unwrap().send(Ok(()));
        } else if let Some(err) = &inner.failed {
            let _ = sender.take().unwrap().send(Err(err.clone()));
        } else if inner.loading {
            // The in-flight load pulses every waiter when it commits.
        } else if let Some(token) = inner.token.clone() {
            // Evicted: rehydrate from the disk image.
            inner.loading = true;
            reload = Some(token);
        } else {
            panic!("unloaded page is not in a loadable state");
        }
        inner.waiters.push(Waiter { id, sender });
        self.cache
            .evicter()
            .change_to_correct_eviction_bag(old, self.id, inner.status());
        drop(inner);

        if let Some(token) = reload {
            let lease = self.cache.drainer().lease();
            Self::spawn_reload(self.clone(), token, lease);
        }
        (id, receiver)
    }

    fn remove_waiter(&self, id: u64, write: bool) {
        let mut inner = self.inner.lock();
        let before = inner.status();
        let old = self.cache.evicter().correct_eviction_category(self.id, before);
        let position = inner
            .waiters
            .iter()
            .position(|waiter| waiter.id == id)
            .expect("waiter not attached");
        inner.waiters.remove(position);
        if write {
            assert!(inner.writers > 0);
            inner.writers -= 1;
        }
        self.cache
            .evicter()
            .change_to_correct_eviction_bag(old, self.id, inner.status());

        // Every Acquisition must be outlived by a Snapshot on the same page.
        assert!(
            inner.snapshot_refs > 0,
            "acquisition outlived every snapshot of its page"
        );
    }

    pub(crate) fn has_waiters(&self) -> bool {
        !self.inner.lock().waiters.is_empty()
    }

    // --- Buffer access ---

    /// Serialized size of the block. Requires resident bytes.
    pub fn buf_size(&self) -> u32 {
        let inner = self.inner.lock();
        assert!(inner.buf.is_some(), "bytes not resident");
        inner.size
    }

    /// Readable view of the resident bytes. Bumps the access time.
    ///
    /// The view holds the page lock: do not hold it across a suspension
    /// point.
    pub fn read(&self) -> BufRead<'_> {
        let inner = self.inner.lock();
        assert!(inner.buf.is_some(), "bytes not resident");
        self.access_time.store(
            self.cache.evicter().next_access_time(),
            Ordering::Relaxed,
        );
        BufRead { inner }
    }

    /// Writable view of the resident bytes.
    ///
    /// Detaches the token first: the bytes are about to diverge from the
    /// durable image, and only the writeback path may re-attach one. Requires
    /// an attached waiter, which is what keeps the page unevictable while the
    /// writer holds the view.
    fn write(&self) -> BufWrite<'_> {
        let mut inner = self.inner.lock();
        assert!(inner.buf.is_some(), "bytes not resident");
        assert!(
            !inner.waiters.is_empty(),
            "write access without an attached acquisition"
        );
        inner.token = None;
        self.access_time.store(
            self.cache.evicter().next_access_time(),
            Ordering::Relaxed,
        );
        BufWrite { inner }
    }

    /// Drop the resident buffer. Only legal for a quiescent page whose bytes
    /// match the durable image.
    pub fn evict_self(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.waiters.is_empty(), "evicting a page with waiters");
        assert!(inner.token.is_some(), "evicting a page with no disk copy");
        assert!(inner.buf.is_some(), "evicting a page with no resident bytes");
        let before = inner.status();
        let old = self.cache.evicter().correct_eviction_category(self.id, before);
        inner.buf = None;
        self.cache
            .evicter()
            .change_to_correct_eviction_bag(old, self.id, inner.status());
        debug!(page = self.id, size = inner.size, "self-evicted");
    }

    /// Attach a token after writeback: the resident bytes once again match
    /// the durable image, so the page becomes a valid eviction candidate.
    pub fn set_token(&self, token: Token) {
        let mut inner = self.inner.lock();
        assert!(inner.buf.is_some(), "writeback of a page with no resident bytes");
        assert!(inner.token.is_none(), "page already has a token");
        assert!(token.size() as usize <= inner.buf.as_ref().unwrap().len());
        let before = inner.status();
        let old = self.cache.evicter().correct_eviction_category(self.id, before);
        inner.size = token.size();
        inner.token = Some(token);
        self.cache
            .evicter()
            .change_to_correct_eviction_bag(old, self.id, inner.status());
    }

    /// Whether the page's bytes are resident.
    pub fn is_resident(&self) -> bool {
        self.inner.lock().buf.is_some()
    }

    /// Whether a disk token is attached.
    pub fn has_token(&self) -> bool {
        self.inner.lock().token.is_some()
    }

    /// Whether a load is in flight.
    pub fn is_loading(&self) -> bool {
        self.inner.lock().loading
    }

    // --- Loaders ---
    //
    // Each loader takes its drainer lease before its first suspension, does
    // all suspending work up front, and then commits (or discards) in a
    // single critical section that re-checks the destroy sentinel.

    fn spawn_load_by_id(page: Self, block_id: BlockId, lease: Lease) {
        let cache = page.cache.clone();
        let context = cache.context().with_label("page_load");
        context.spawn(move |_| async move {
            let _lease = lease;
            // Allocate here so the buffer is freed where it was allocated.
            let buf = cache.serializer().malloc();
            let result = match cache.serializer().index_read(block_id).await {
                Ok(token) => cache
                    .serializer()
                    .block_read(token.clone(), buf)
                    .await
                    .map(|buf| (buf, token)),
                Err(err) => Err(err),
            };
            match result {
                Ok((buf, token)) => {
                    let size = token.size();
                    page.finish_load(Some(token), size, buf);
                }
                Err(err) => {
                    warn!(page = page.id, block = %block_id, "block load failed");
                    page.fail_load(Arc::new(err), true);
                }
            }
        });
    }

    fn spawn_reload(page: Self, token: Token, lease: Lease) {
        let cache = page.cache.clone();
        let context = cache.context().with_label("page_reload");
        context.spawn(move |_| async move {
            let _lease = lease;
            let buf = cache.serializer().malloc();
            match cache.serializer().block_read(token.clone(), buf).await {
                Ok(buf) => page.finish_load(None, token.size(), buf),
                Err(err) => {
                    warn!(page = page.id, block = %token.block_id(), "block reload failed");
                    // The token is still attached; the next waiter retries.
                    page.fail_load(Arc::new(err), false);
                }
            }
        });
    }

    fn spawn_copy(page: Self, pin: Snapshot<E, S>, lease: Lease) {
        let cache = page.cache.clone();
        let context = cache.context().with_label("page_copy");
        context.spawn(move |_| async move {
            let _lease = lease;
            // The pin keeps the copyee alive across the suspension while its
            // own bytes arrive. Rebound locally so it is released before the
            // lease.
            let pin = pin;
            let mut acq = Acquisition::new();
            acq.init_read(pin.page_for_read());
            let result = acq.ready().await;
            match result {
                Ok(()) => {
                    let mut buf = cache.serializer().malloc();
                    let size = {
                        let inner = pin.page_for_read().inner.lock();
                        let bytes = inner.buf.as_ref().expect("copyee bytes not resident");
                        buf[..bytes.len()].copy_from_slice(bytes);
                        inner.size
                    };
                    page.finish_load(None, size, buf);
                }
                Err(err) => page.fail_load(err, true),
            }
        });
    }

    /// Commit phase shared by all three loaders. Does not suspend.
    fn finish_load(&self, token: Option<Token>, size: u32, buf: Vec<u8>) {
        let mut inner = self.inner.lock();
        assert!(inner.loading, "load commit without a load in flight");
        if inner.aborted {
            // The page was logically destroyed while the load was suspended
            // and has already been removed from the evicter. Drop everything
            // on the floor; nobody may observe these bytes.
            self.cache.load_aborts().inc();
            debug!(page = self.id, "discarding load for destroyed page");
            return;
        }
        assert!(inner.buf.is_none(), "load commit onto resident bytes");
        debug_assert!(self.cache.evicter().page_is_in_unevictable_bag(self.id));

        let before = inner.status();
        inner.loading = false;
        if let Some(token) = token {
            assert!(inner.token.is_none(), "load commit onto an attached token");
            inner.token = Some(token);
        }
        inner.size = size;
        inner.buf = Some(buf);
        self.cache.evicter().add_now_loaded_size(self.id, size);

        // Pulse everything that queued up while the load was in flight; the
        // order in which waiters observe readiness is unspecified.
        for waiter in inner.waiters.iter_mut() {
            if let Some(sender) = waiter.sender.take() {
                let _ = sender.send(Ok(()));
            }
        }
        let old = self.cache.evicter().correct_eviction_category(self.id, before);
        self.cache
            .evicter()
            .change_to_correct_eviction_bag(old, self.id, inner.status());
        self.cache.loads().inc();
        debug!(page = self.id, size, "load committed");
    }

    /// Failure counterpart of [Page::finish_load]. Does not suspend.
    ///
    /// `sticky` failures (no token to retry from) are replayed to every
    /// future waiter; non-sticky ones leave the token in place so the next
    /// waiter retries the read.
    fn fail_load(&self, err: Arc<Error>, sticky: bool) {
        let mut inner = self.inner.lock();
        assert!(inner.loading, "load failure without a load in flight");
        if inner.aborted {
            self.cache.load_aborts().inc();
            return;
        }
        let before = inner.status();
        inner.loading = false;
        if sticky {
            inner.failed = Some(err.clone());
        }
        for waiter in inner.waiters.iter_mut() {
            if let Some(sender) = waiter.sender.take() {
                let _ = sender.send(Err(err.clone()));
            }
        }
        let old = self.cache.evicter().correct_eviction_category(self.id, before);
        self.cache
            .evicter()
            .change_to_correct_eviction_bag(old, self.id, inner.status());
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let inner = self.inner.lock();
        if inner.destroyed {
            assert_eq!(inner.snapshot_refs, 0);
            assert!(inner.waiters.is_empty());
            return;
        }
        if inner.loading {
            assert!(inner.buf.is_none());
        }
        if inner.snapshot_refs == 0 {
            assert!(inner.waiters.is_empty());
        }
        if inner.buf.is_none() && inner.token.is_none() {
            assert!(inner.loading || inner.failed.is_some());
        }
        assert!(inner.writers <= 1);
    }
}

impl<E: Spawner + Metrics, S: Serializer> Clone for Page<E, S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cache: self.cache.clone(),
            access_time: self.access_time.clone(),
            inner: self.inner.clone(),
        }
    }
}

/// Read access to a page's resident bytes.
///
/// Holds the page lock: do not hold a view across a suspension point.
pub struct BufRead<'a> {
    inner: MutexGuard<'a, Inner>,
}

impl Deref for BufRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.inner.buf.as_deref().expect("bytes not resident")
    }
}

/// Write access to a page's resident bytes.
///
/// Holds the page lock: do not hold a view across a suspension point.
pub struct BufWrite<'a> {
    inner: MutexGuard<'a, Inner>,
}

impl Deref for BufWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.inner.buf.as_deref().expect("bytes not resident")
    }
}

impl DerefMut for BufWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.inner.buf.as_deref_mut().expect("bytes not resident")
    }
}

/// Short-lived handle awaiting residency of a page's bytes.
///
/// An acquisition never extends a page's lifetime; it must be outlived by
/// some [Snapshot] on the same page. It registers as a waiter at `init` time
/// and removes itself on drop.
pub struct Acquisition<E: Spawner + Metrics, S: Serializer> {
    state: Option<AcqState<E, S>>,
}

struct AcqState<E: Spawner + Metrics, S: Serializer> {
    page: Page<E, S>,
    waiter: u64,
    write: bool,
    ready: Ready,
}

enum Ready {
    Pending(oneshot::Receiver<Result<(), Arc<Error>>>),
    Done(Result<(), Arc<Error>>),
}

impl<E: Spawner + Metrics, S: Serializer> Acquisition<E, S> {
    pub fn new() -> Self {
        Self { state: None }
    }

    pub fn has(&self) -> bool {
        self.state.is_some()
    }

    /// Register for read access. May be called at most once per acquisition.
    pub fn init_read(&mut self, page: &Page<E, S>) {
        self.init(page, false);
    }

    /// Register for write access. A page admits at most one outstanding
    /// writer. May be called at most once per acquisition.
    pub fn init_write(&mut self, page: &Page<E, S>) {
        self.init(page, true);
    }

    fn init(&mut self, page: &Page<E, S>, write: bool) {
        assert!(self.state.is_none(), "acquisition already initialized");
        let (waiter, receiver) = page.add_waiter(write);
        self.state = Some(AcqState {
            page: page.clone(),
            waiter,
            write,
            ready: Ready::Pending(receiver),
        });
    }

    /// Resolves once the page's bytes are resident, or with the error that
    /// prevented them from becoming so. Resolves at most once; later calls
    /// return the same result without suspending.
    pub async fn ready(&mut self) -> Result<(), Arc<Error>> {
        let state = self.state.as_mut().expect("acquisition not initialized");
        if let Ready::Pending(receiver) = &mut state.ready {
            let result = receiver.await.expect("waiter dropped without a pulse");
            state.ready = Ready::Done(result);
        }
        match &state.ready {
            Ready::Done(result) => result.clone(),
            Ready::Pending(_) => unreachable!(),
        }
    }

    /// Serialized size of the block; waits for residency first.
    pub async fn buf_size(&mut self) -> Result<u32, Arc<Error>> {
        self.ready().await?;
        Ok(self.state.as_ref().unwrap().page.buf_size())
    }

    /// Readable view of the bytes; waits for residency first.
    pub async fn read(&mut self) -> Result<BufRead<'_>, Arc<Error>> {
        self.ready().await?;
        Ok(self.state.as_ref().unwrap().page.read())
    }

    /// Writable view of the bytes; waits for residency first, then detaches
    /// the page's token before handing the view out.
    pub async fn write(&mut self) -> Result<BufWrite<'_>, Arc<Error>> {
        self.ready().await?;
        let state = self.state.as_ref().unwrap();
        assert!(state.write, "write access through a read acquisition");
        Ok(state.page.write())
    }
}

impl<E: Spawner + Metrics, S: Serializer> Default for Acquisition<E, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Spawner + Metrics, S: Serializer> Drop for Acquisition<E, S> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.page.remove_waiter(state.waiter, state.write);
        }
    }
}

/// Owning snapshot handle: pins a page from construction until reset or drop.
///
/// A page exists exactly as long as at least one snapshot pins it. Snapshots
/// are movable but deliberately not cloneable; sharing a page is what
/// [Snapshot::page_for_write] detects to trigger copy-on-write.
pub struct Snapshot<E: Spawner + Metrics, S: Serializer> {
    page: Option<Page<E, S>>,
}

impl<E: Spawner + Metrics, S: Serializer> Snapshot<E, S> {
    /// Pin `page`.
    pub fn new(page: Page<E, S>) -> Self {
        page.add_snapshotter();
        Self { page: Some(page) }
    }

    /// An unbound snapshot.
    pub fn empty() -> Self {
        Self { page: None }
    }

    pub fn has(&self) -> bool {
        self.page.is_some()
    }

    /// Unpin; destroys the page if this was the last snapshot.
    pub fn reset(&mut self) {
        if let Some(page) = self.page.take() {
            page.remove_snapshotter();
        }
    }

    /// The pinned page, for reading.
    pub fn page_for_read(&self) -> &Page<E, S> {
        self.page.as_ref().expect("empty snapshot")
    }

    /// The pinned page, for writing. If other snapshots share the page, this
    /// snapshot is retargeted to a fork first, leaving the original bytes
    /// intact for the other holders. This is the sole copy-on-write trigger.
    pub fn page_for_write(&mut self) -> Page<E, S> {
        let page = self.page.as_ref().expect("empty snapshot");
        if page.num_snapshot_refs() > 1 {
            let copy = page.make_copy();
            // Pin the fork before releasing the original.
            *self = Snapshot::new(copy);
        }
        self.page.clone().unwrap()
    }
}

impl<E: Spawner + Metrics, S: Serializer> Drop for Snapshot<E, S> {
    fn drop(&mut self) {
        self.reset();
    }
}
