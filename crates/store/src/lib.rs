//! drydock store: the single owner of `EngineState`.
//!
//! All mutation goes through [`Store::dispatch`], which applies an [`Action`] under one mutex,
//! publishes a fresh immutable snapshot and bumps the epoch. Subscribers are not told what
//! changed; they re-read the snapshot and diff against their own bookkeeping.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use drydock_core::EngineState;
use metrics::counter;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod action;

pub use action::{reduce, Action};

/// A controller: reacts to "state changed", reads what it needs, acts.
///
/// `on_change` must be idempotent: running it twice against the same state is a no-op.
/// Implementations must not hold a store lock across external I/O.
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn on_change(&self, ctx: &CancellationToken, store: &Store);

    /// Called once when the session shuts down.
    async fn teardown(&self) {}
}

pub struct Store {
    state: Mutex<EngineState>,
    snap: ArcSwap<EngineState>,
    epoch_tx: watch::Sender<u64>,
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
}

impl Store {
    pub fn new(initial: EngineState) -> Arc<Self> {
        let (epoch_tx, _) = watch::channel(0u64);
        Arc::new(Self {
            snap: ArcSwap::from_pointee(initial.clone()),
            state: Mutex::new(initial),
            epoch_tx,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Apply one action under the guard, then publish and notify.
    pub fn dispatch(&self, action: Action) {
        let name = action.name();
        let mut guard = self.lock_state();
        reduce(&mut guard, action);
        self.publish(&guard);
        drop(guard);
        counter!("store_actions", 1, "action" => name);
        debug!(action = name, epoch = self.epoch(), "store: action applied");
    }

    /// Point-in-time read. The returned state is shared and never mutated.
    pub fn snapshot(&self) -> Arc<EngineState> { self.snap.load_full() }

    pub fn epoch(&self) -> u64 { *self.epoch_tx.borrow() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn add_subscriber(&self, sub: Arc<dyn Subscriber>) {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(sub);
    }

    /// Drive every registered subscriber until `ctx` is cancelled. Each subscriber runs on its
    /// own task, once at start and then after each epoch bump; bursts of changes coalesce.
    pub async fn run(self: &Arc<Self>, ctx: CancellationToken) {
        let subs: Vec<Arc<dyn Subscriber>> = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).clone();
        info!(subscribers = subs.len(), "store: running subscribers");
        let tasks: Vec<_> = subs
            .into_iter()
            .map(|sub| {
                let store = Arc::clone(self);
                let ctx = ctx.clone();
                tokio::spawn(async move { drive(store, sub, ctx).await })
            })
            .collect();
        for t in tasks {
            let _ = t.await;
        }
        info!("store: subscribers stopped");
    }

    /// Direct mutable access for test harnesses. Dropping the guard publishes and notifies,
    /// unless the test body panicked while holding it.
    #[cfg(any(test, feature = "testing"))]
    pub fn lock_mutable_state_for_testing(&self) -> MutableStateGuard<'_> {
        MutableStateGuard { store: self, guard: self.lock_state() }
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        // A panic mid-mutation may have left the state half-applied; nothing may read or build on it.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("store state poisoned: a mutation panicked while holding the lock"),
        }
    }

    // Must be called while holding the state guard so snapshots are published in order.
    fn publish(&self, state: &EngineState) {
        self.snap.store(Arc::new(state.clone()));
        self.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
    }
}

async fn drive(store: Arc<Store>, sub: Arc<dyn Subscriber>, ctx: CancellationToken) {
    let mut rx = store.subscribe_epoch();
    rx.borrow_and_update();
    debug!(subscriber = sub.name(), "subscriber started");
    sub.on_change(&ctx, &store).await;
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() { break; }
                rx.borrow_and_update();
                sub.on_change(&ctx, &store).await;
            }
        }
    }
    sub.teardown().await;
    debug!(subscriber = sub.name(), "subscriber stopped");
}

#[cfg(any(test, feature = "testing"))]
pub struct MutableStateGuard<'a> {
    store: &'a Store,
    guard: MutexGuard<'a, EngineState>,
}

#[cfg(any(test, feature = "testing"))]
impl std::ops::Deref for MutableStateGuard<'_> {
    type Target = EngineState;
    fn deref(&self) -> &EngineState { &self.guard }
}

#[cfg(any(test, feature = "testing"))]
impl std::ops::DerefMut for MutableStateGuard<'_> {
    fn deref_mut(&mut self) -> &mut EngineState { &mut self.guard }
}

#[cfg(any(test, feature = "testing"))]
impl Drop for MutableStateGuard<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.store.publish(&self.guard);
        }
    }
}
