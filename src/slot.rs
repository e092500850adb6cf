//! A bucketed table of held lock names.
//!
//! The table is laid out as a single segment that another process could map:
//! `B` buckets, each aligned to a cache line, each holding `S` slots of
//! `{hash: u64, ticket: u64, acquired_at_ms: i64}` next to the spin lock that
//! guards them.
//!
//! A lock name is hashed with MD5. The first eight digest bytes form the slot
//! key, the ninth picks the bucket and the tenth picks where the scan of that
//! bucket starts. A slot is held while it carries a key, and free when its key
//! is zero.
//!
//! Every acquisition, steals included, draws a fresh ticket from its bucket.
//! A release only frees the slot if it still carries the releaser's ticket.
//!
//! The table only offers non-blocking attempts. [`SlotLockManager`] wraps
//! each [`SlotLock`] in a [`PollingLock`] to get timed waits and stealing.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, trace};

use crate::clock::Clock;
use crate::error::{ConfigError, TryLockError};
use crate::lock::{NamedLock, NamedLockManager, TryLock};
use crate::polling::{PollPolicy, PollingLock};
use crate::relax::{Relax, SpinBackoff};
use crate::scheduler::Scheduler;
use crate::spin::RawSpinLock;

/// Largest bucket count a single digest byte can address.
const MAX_BUCKETS: usize = 256;

/// Ticket of a handle that holds nothing. Buckets never hand it out.
const NOT_ACQUIRED: u64 = 0;

/// The table used by [`SlotLockManager`] unless told otherwise.
pub type DefaultSlotTable = SlotTable<256, 16, SpinBackoff>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
struct Slot {
    hash: u64,
    ticket: u64,
    acquired_at_ms: i64,
}

impl Slot {
    const EMPTY: Self = Self { hash: 0, ticket: NOT_ACQUIRED, acquired_at_ms: 0 };

    fn is_empty(&self) -> bool {
        self.hash == Self::EMPTY.hash
    }
}

#[repr(C)]
struct Slots<const S: usize> {
    next_ticket: u64,
    entries: [Slot; S],
}

impl<const S: usize> Slots<S> {
    fn issue_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1).max(1);
        ticket
    }
}

#[repr(C, align(64))]
struct Bucket<const S: usize, R> {
    slots: lock_api::Mutex<RawSpinLock<R>, Slots<S>>,
}

impl<const S: usize, R: Relax> Bucket<S, R> {
    fn new() -> Self {
        Self { slots: lock_api::Mutex::new(Slots { next_ticket: 1, entries: [Slot::EMPTY; S] }) }
    }
}

/// Where a lock name lives in a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotKey {
    hash: u64,
    bucket: usize,
    probe: usize,
}

impl SlotKey {
    pub fn bucket(&self) -> usize {
        self.bucket
    }
}

/// A fixed table of `B` buckets with `S` slots each, recording which lock
/// names are held and since when.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use namedlock::clock::MockClock;
/// use namedlock::error::TryLockError;
/// use namedlock::slot::DefaultSlotTable;
///
/// let clock = Arc::new(MockClock::new(0));
/// let table = DefaultSlotTable::new(clock.clone()).unwrap();
/// let key = table.key("lock");
///
/// let ticket = table.try_acquire(key, None).unwrap();
/// assert_eq!(table.try_acquire(key, None), Err(TryLockError::Held));
///
/// clock.advance_ms(10);
/// let thief = table.try_acquire(key, Some(10)).unwrap();
/// // The first holder's release finds its slot taken over and leaves it be.
/// table.release(key, ticket);
/// assert_eq!(table.try_acquire(key, None), Err(TryLockError::Held));
/// table.release(key, thief);
/// assert!(table.try_acquire(key, None).is_ok());
/// ```
pub struct SlotTable<const B: usize, const S: usize, R = SpinBackoff> {
    buckets: Box<[Bucket<S, R>]>,
    clock: Arc<dyn Clock>,
}

impl<const B: usize, const S: usize, R: Relax> SlotTable<B, S, R> {
    /// Creates an empty table reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        if B == 0 {
            return Err(ConfigError::ZeroBuckets);
        }
        if S == 0 {
            return Err(ConfigError::ZeroSlots);
        }
        if B > MAX_BUCKETS {
            return Err(ConfigError::TooManyBuckets { buckets: B });
        }
        let buckets = (0..B).map(|_| Bucket::new()).collect();
        Ok(Self { buckets, clock })
    }

    /// Bytes a segment holding this table occupies.
    pub const fn segment_size() -> usize {
        B * core::mem::size_of::<Bucket<S, R>>()
    }

    /// Locates `name` in the table.
    pub fn key(&self, name: &str) -> SlotKey {
        let digest = md5::compute(name.as_bytes());
        let mut hash_bytes = [0; 8];
        hash_bytes.copy_from_slice(&digest[..8]);
        // Zero marks a free slot.
        let hash = match u64::from_le_bytes(hash_bytes) {
            0 => 1,
            hash => hash,
        };
        SlotKey { hash, bucket: usize::from(digest[8]) % B, probe: usize::from(digest[9]) % S }
    }

    /// Marks `key` as held, taking it over from a holder that acquired it at
    /// least `steal_ms` ago. Returns the ticket to present to [`release`].
    ///
    /// [`release`]: SlotTable::release
    pub fn try_acquire(&self, key: SlotKey, steal_ms: Option<i64>) -> Result<u64, TryLockError> {
        let now_ms = self.clock.now_ms();
        let mut slots = self.buckets[key.bucket].slots.lock();
        let mut free = None;
        for offset in 0..S {
            let index = (key.probe + offset) % S;
            let slot = slots.entries[index];
            if slot.hash == key.hash {
                let age_ms = now_ms.saturating_sub(slot.acquired_at_ms);
                return match steal_ms {
                    Some(steal_ms) if age_ms >= steal_ms => {
                        debug!("slot {index} of bucket {} stolen at {now_ms}ms", key.bucket);
                        let ticket = slots.issue_ticket();
                        slots.entries[index] =
                            Slot { hash: key.hash, ticket, acquired_at_ms: now_ms };
                        Ok(ticket)
                    }
                    _ => Err(TryLockError::Held),
                };
            }
            if free.is_none() && slot.is_empty() {
                free = Some(index);
            }
        }
        let Some(index) = free else {
            info!("bucket {} is full, refusing {:#018x}", key.bucket, key.hash);
            return Err(TryLockError::Overloaded { bucket: key.bucket });
        };
        trace!("slot {index} of bucket {} taken at {now_ms}ms", key.bucket);
        let ticket = slots.issue_ticket();
        slots.entries[index] = Slot { hash: key.hash, ticket, acquired_at_ms: now_ms };
        Ok(ticket)
    }

    /// Frees `key` if it is still held under `ticket`.
    ///
    /// A holder that was stolen from finds the slot carrying another ticket
    /// and leaves it to the thief.
    pub fn release(&self, key: SlotKey, ticket: u64) {
        let mut slots = self.buckets[key.bucket].slots.lock();
        let held =
            slots.entries.iter_mut().find(|slot| slot.hash == key.hash && slot.ticket == ticket);
        match held {
            Some(slot) => *slot = Slot::EMPTY,
            None => {
                debug!("{:#018x} was stolen from its holder in bucket {}", key.hash, key.bucket)
            }
        }
    }

    /// Number of held slots in `bucket`.
    pub fn occupancy(&self, bucket: usize) -> usize {
        self.buckets.get(bucket).map_or(0, |bucket| {
            bucket.slots.lock().entries.iter().filter(|slot| !slot.is_empty()).count()
        })
    }
}

impl<const B: usize, const S: usize, R> fmt::Debug for SlotTable<B, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable").field("buckets", &B).field("slots", &S).finish_non_exhaustive()
    }
}

/// A handle on one lock name of a [`SlotTable`].
///
/// The handle remembers the ticket of its slot, and releases it on drop.
pub struct SlotLock<const B: usize = 256, const S: usize = 16, R: Relax = SpinBackoff> {
    table: Arc<SlotTable<B, S, R>>,
    name: Arc<str>,
    key: SlotKey,
    ticket: AtomicU64,
}

impl<const B: usize, const S: usize, R: Relax> SlotLock<B, S, R> {
    pub fn new(table: Arc<SlotTable<B, S, R>>, name: &str) -> Self {
        let key = table.key(name);
        Self { table, name: Arc::from(name), key, ticket: AtomicU64::new(NOT_ACQUIRED) }
    }

    fn acquire(&self, steal_ms: Option<i64>) -> Result<(), TryLockError> {
        let ticket = self.table.try_acquire(self.key, steal_ms)?;
        self.ticket.store(ticket, Ordering::Release);
        Ok(())
    }
}

impl<const B: usize, const S: usize, R> TryLock for SlotLock<B, S, R>
where
    R: Relax + 'static,
{
    fn try_lock(&self) -> Result<(), TryLockError> {
        self.acquire(None)
    }

    fn try_lock_steal_old(&self, steal_ms: i64) -> Result<(), TryLockError> {
        self.acquire(Some(steal_ms))
    }

    fn unlock(&self) {
        let ticket = self.ticket.swap(NOT_ACQUIRED, Ordering::AcqRel);
        if ticket != NOT_ACQUIRED {
            self.table.release(self.key, ticket);
        }
    }

    fn held(&self) -> bool {
        self.ticket.load(Ordering::Acquire) != NOT_ACQUIRED
    }

    fn name(&self) -> String {
        self.name.to_string()
    }
}

impl<const B: usize, const S: usize, R: Relax> Drop for SlotLock<B, S, R> {
    fn drop(&mut self) {
        let ticket = *self.ticket.get_mut();
        if ticket != NOT_ACQUIRED {
            self.table.release(self.key, ticket);
        }
    }
}

impl<const B: usize, const S: usize, R: Relax> fmt::Debug for SlotLock<B, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLock")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("ticket", &self.ticket.load(Ordering::Relaxed))
            .finish()
    }
}

/// Hands out [`PollingLock`]s over a shared [`SlotTable`].
pub struct SlotLockManager<const B: usize = 256, const S: usize = 16, R = SpinBackoff> {
    table: Arc<SlotTable<B, S, R>>,
    scheduler: Arc<Scheduler>,
    policy: PollPolicy,
}

impl<const B: usize, const S: usize, R> SlotLockManager<B, S, R>
where
    R: Relax + 'static,
{
    pub fn new(table: Arc<SlotTable<B, S, R>>, scheduler: Arc<Scheduler>) -> Self {
        Self::with_policy(table, scheduler, PollPolicy::default())
    }

    pub fn with_policy(
        table: Arc<SlotTable<B, S, R>>,
        scheduler: Arc<Scheduler>,
        policy: PollPolicy,
    ) -> Self {
        Self { table, scheduler, policy }
    }

    pub fn create_named_lock(&self, name: &str) -> PollingLock<SlotLock<B, S, R>> {
        let backend = SlotLock::new(Arc::clone(&self.table), name);
        PollingLock::with_policy(backend, Arc::clone(&self.scheduler), self.policy)
    }

    pub fn table(&self) -> &Arc<SlotTable<B, S, R>> {
        &self.table
    }
}

impl<const B: usize, const S: usize, R> NamedLockManager for SlotLockManager<B, S, R>
where
    R: Relax + 'static,
{
    fn create_named_lock(&self, name: &str) -> Box<dyn NamedLock> {
        Box::new(SlotLockManager::create_named_lock(self, name))
    }
}

impl<const B: usize, const S: usize, R> fmt::Debug for SlotLockManager<B, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLockManager")
            .field("table", &self.table)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;

    use super::{Bucket, DefaultSlotTable, SlotLock, SlotLockManager, SlotTable};
    use crate::clock::MockClock;
    use crate::error::{ConfigError, TryLockError};
    use crate::lock::{NamedLockManager, TryLock};
    use crate::relax::{Spin, SpinBackoff};
    use crate::scheduler::Scheduler;
    use crate::test::{tests, Harness};

    struct SlotHarness {
        clock: Arc<MockClock>,
        scheduler: Arc<Scheduler>,
        manager: SlotLockManager,
    }

    impl Harness for SlotHarness {
        fn new(clock: Arc<MockClock>) -> Self {
            let scheduler = Arc::new(Scheduler::new(clock.clone()));
            let table = Arc::new(DefaultSlotTable::new(clock.clone()).unwrap());
            let manager = SlotLockManager::new(table, Arc::clone(&scheduler));
            Self { clock, scheduler, manager }
        }

        fn manager(&self) -> &dyn NamedLockManager {
            &self.manager
        }

        fn quiesce(&self) {
            let mut scheduler = self.scheduler.lock();
            while let Some(wakeup_us) = scheduler.run_alarms() {
                self.clock.set_time_us(wakeup_us);
            }
        }
    }

    fn table<const B: usize, const S: usize>() -> (Arc<MockClock>, Arc<SlotTable<B, S, Spin>>) {
        let clock = Arc::new(MockClock::new(0));
        let table = SlotTable::new(clock.clone()).unwrap();
        (clock, Arc::new(table))
    }

    #[test]
    fn rejects_bad_geometry() {
        let clock = Arc::new(MockClock::new(0));
        let zero_buckets = SlotTable::<0, 16, Spin>::new(clock.clone()).unwrap_err();
        assert_eq!(zero_buckets, ConfigError::ZeroBuckets);
        let zero_slots = SlotTable::<1, 0, Spin>::new(clock.clone()).unwrap_err();
        assert_eq!(zero_slots, ConfigError::ZeroSlots);
        assert_eq!(
            SlotTable::<257, 1, Spin>::new(clock).unwrap_err(),
            ConfigError::TooManyBuckets { buckets: 257 }
        );
    }

    #[test]
    fn buckets_fill_cache_lines() {
        assert_eq!(core::mem::align_of::<Bucket<16, SpinBackoff>>(), 64);
        assert_eq!(core::mem::size_of::<Bucket<16, SpinBackoff>>() % 64, 0);
        let bucket_size = core::mem::size_of::<Bucket<16, SpinBackoff>>();
        assert_eq!(DefaultSlotTable::segment_size(), 256 * bucket_size);
        assert!(DefaultSlotTable::segment_size() >= 256 * 16 * 16);
    }

    #[test]
    fn keys_are_stable_and_spread() {
        let (_clock, table) = table::<256, 16>();
        assert_eq!(table.key("lock"), table.key("lock"));
        assert_ne!(table.key("lock"), table.key("lock2"));
    }

    #[test]
    fn same_name_excludes() {
        let (_clock, table) = table::<4, 4>();
        let lock1 = SlotLock::new(Arc::clone(&table), "lock");
        let lock2 = SlotLock::new(Arc::clone(&table), "lock");
        let other = SlotLock::new(table, "other");
        assert_eq!(lock1.try_lock(), Ok(()));
        assert!(lock1.held());
        assert_eq!(lock2.try_lock(), Err(TryLockError::Held));
        assert_eq!(other.try_lock(), Ok(()));
        lock1.unlock();
        assert!(!lock1.held());
        assert_eq!(lock2.try_lock(), Ok(()));
    }

    #[test]
    fn steal_needs_old_enough_holder() {
        let (clock, table) = table::<4, 4>();
        let lock1 = SlotLock::new(Arc::clone(&table), "lock");
        let lock2 = SlotLock::new(Arc::clone(&table), "lock");
        assert_eq!(lock1.try_lock(), Ok(()));
        clock.advance_ms(9);
        assert_eq!(lock2.try_lock_steal_old(10), Err(TryLockError::Held));
        clock.advance_ms(1);
        assert_eq!(lock2.try_lock_steal_old(10), Ok(()));
    }

    #[test]
    fn unlock_after_steal_keeps_thief() {
        let (clock, table) = table::<4, 4>();
        let lock1 = SlotLock::new(Arc::clone(&table), "lock");
        let lock2 = SlotLock::new(Arc::clone(&table), "lock");
        let lock3 = SlotLock::new(Arc::clone(&table), "lock");
        assert_eq!(lock1.try_lock(), Ok(()));
        clock.advance_ms(10);
        assert_eq!(lock2.try_lock_steal_old(10), Ok(()));
        lock1.unlock();
        assert_eq!(lock3.try_lock(), Err(TryLockError::Held));
        lock2.unlock();
        assert_eq!(lock3.try_lock(), Ok(()));
    }

    #[test]
    fn same_millisecond_steal_keeps_thief() {
        let (_clock, table) = table::<4, 4>();
        let victim = SlotLock::new(Arc::clone(&table), "lock");
        let thief = SlotLock::new(Arc::clone(&table), "lock");
        let other = SlotLock::new(Arc::clone(&table), "lock");
        assert_eq!(victim.try_lock(), Ok(()));
        assert_eq!(thief.try_lock_steal_old(0), Ok(()));
        victim.unlock();
        assert_eq!(other.try_lock(), Err(TryLockError::Held));
        assert!(thief.held());

        // A later holder acquiring within the same millisecond is safe too.
        assert_eq!(victim.try_lock_steal_old(0), Ok(()));
        thief.unlock();
        assert_eq!(other.try_lock(), Err(TryLockError::Held));
        victim.unlock();
        assert_eq!(other.try_lock(), Ok(()));
        assert_eq!(table.occupancy(table.key("lock").bucket()), 1);
    }

    #[test]
    fn full_bucket_overloads() {
        let (_clock, table) = table::<1, 2>();
        let locks: Vec<_> =
            ["a", "b", "c"].iter().map(|name| SlotLock::new(Arc::clone(&table), name)).collect();
        assert_eq!(locks[0].try_lock(), Ok(()));
        assert_eq!(locks[1].try_lock(), Ok(()));
        assert_eq!(table.occupancy(0), 2);
        assert_eq!(locks[2].try_lock(), Err(TryLockError::Overloaded { bucket: 0 }));
        locks[0].unlock();
        assert_eq!(locks[2].try_lock(), Ok(()));
    }

    #[test]
    fn drop_releases_slot() {
        let (_clock, table) = table::<1, 1>();
        {
            let lock = SlotLock::new(Arc::clone(&table), "lock");
            assert_eq!(lock.try_lock(), Ok(()));
            assert_eq!(table.occupancy(0), 1);
        }
        assert_eq!(table.occupancy(0), 0);
    }

    #[cfg(feature = "yield")]
    #[test]
    fn contended_bucket_yield_backoff() {
        use crate::relax::YieldBackoff;

        const THREADS: usize = 4;
        const ITERS: usize = 200;
        let clock = Arc::new(MockClock::new(0));
        let table = Arc::new(SlotTable::<1, 8, YieldBackoff>::new(clock).unwrap());
        let handles: Vec<_> = (0..THREADS)
            .map(|thread| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let lock = SlotLock::new(table, &format!("lock{thread}"));
                    for _ in 0..ITERS {
                        assert_eq!(lock.try_lock(), Ok(()));
                        lock.unlock();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.occupancy(0), 0);
    }

    #[test]
    fn lock_unlock() {
        tests::lock_unlock::<SlotHarness>();
    }

    #[test]
    fn double_lock_unlock() {
        tests::double_lock_unlock::<SlotHarness>();
    }

    #[test]
    fn unlock_on_drop() {
        tests::unlock_on_drop::<SlotHarness>();
    }

    #[test]
    fn lock_independence() {
        tests::lock_independence::<SlotHarness>();
    }

    #[test]
    fn timeout_expires() {
        tests::timeout_expires::<SlotHarness>();
    }

    #[test]
    fn timeout_before_steal() {
        tests::timeout_before_steal::<SlotHarness>();
    }

    #[test]
    fn steal_before_timeout() {
        tests::steal_before_timeout::<SlotHarness>();
    }

    #[test]
    fn wait_for_release() {
        tests::wait_for_release::<SlotHarness>();
    }
}
