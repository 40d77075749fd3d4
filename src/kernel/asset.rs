//! Asset monitors.
//!
//! An [`AssetMonitor`] parks job nodes until an asset (a sourced managed
//! object, a thread's completion) becomes available. Waiters may carry a
//! deadline; [`AssetManager::check_on_assets`] expires them. Monitors never
//! run job nodes themselves: they push [`Activation`]s into an
//! [`ActivationSet`] that the caller dispatches once every kernel lock has
//! been released.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use super::escalation::Failure;
use super::job::JobNode;
use super::list::{ComparatorLinkedListSet, EntryArena, OwnerId};
use super::lock;
use super::thread::ThreadState;

/// Correlates a timed wait with the timeout failure it may produce.
///
/// When one waiter under a token expires, every waiter on the same monitor
/// holding that token fails with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaitToken(pub u64);

/// A job node scheduled to run, optionally carrying a failure to escalate.
#[derive(Debug, Clone)]
pub struct Activation {
    pub(crate) node: Arc<JobNode>,
    pub(crate) failure: Option<Failure>,
}

impl Activation {
    pub fn node(&self) -> &Arc<JobNode> {
        &self.node
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }
}

/// Job nodes collected under locks, dispatched after the locks are released.
///
/// Also carries threads to abort after their process was terminated; those
/// are locked only once the caller holds no other thread lock.
#[derive(Debug, Default)]
pub struct ActivationSet {
    activations: Vec<Activation>,
    aborts: Vec<Arc<ThreadState>>,
}

impl ActivationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: Arc<JobNode>, failure: Option<Failure>) {
        self.activations.push(Activation { node, failure });
    }

    pub(crate) fn abort_thread(&mut self, thread: Arc<ThreadState>) {
        self.aborts.push(thread);
    }

    pub(crate) fn into_parts(self) -> (Vec<Activation>, Vec<Arc<ThreadState>>) {
        (self.activations, self.aborts)
    }

    /// Number of activations.
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty() && self.aborts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Activation> {
        self.activations.iter()
    }

    /// Number of activations carrying a failure.
    pub fn failed(&self) -> usize {
        self.activations.iter().filter(|a| a.failure.is_some()).count()
    }
}

impl IntoIterator for ActivationSet {
    type Item = Activation;
    type IntoIter = std::vec::IntoIter<Activation>;

    fn into_iter(self) -> Self::IntoIter {
        self.activations.into_iter()
    }
}

#[derive(Debug)]
struct Waiter {
    node: Arc<JobNode>,
    deadline: Option<Instant>,
    token: WaitToken,
}

fn same_node(a: &Waiter, b: &Waiter) -> bool {
    a.node.id() == b.node.id()
}

#[derive(Debug)]
struct MonitorInner {
    owner: OwnerId,
    satisfied: bool,
    registered: bool,
    arena: EntryArena<Waiter>,
    waiters: ComparatorLinkedListSet<Waiter>,
}

/// Parks job nodes until an asset is ready.
#[derive(Debug)]
pub struct AssetMonitor {
    name: String,
    inner: Mutex<MonitorInner>,
}

impl AssetMonitor {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let owner = OwnerId::next();
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(MonitorInner {
                owner,
                satisfied: false,
                registered: false,
                arena: EntryArena::new(),
                waiters: ComparatorLinkedListSet::new(owner, same_node),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Park `node` until the asset completes.
    ///
    /// Returns `false` when the asset is already satisfied; the node is then
    /// added to `set` straight away. A node already waiting here is not
    /// queued twice.
    pub fn wait_on_asset(
        self: &Arc<Self>,
        manager: &AssetManager,
        node: &Arc<JobNode>,
        timeout: Option<Duration>,
        token: WaitToken,
        now: Instant,
        set: &mut ActivationSet,
    ) -> bool {
        let mut inner = lock(&self.inner);
        if inner.satisfied {
            set.push(node.clone(), None);
            return false;
        }

        let MonitorInner {
            owner,
            arena,
            waiters,
            ..
        } = &mut *inner;
        let waiter = Waiter {
            node: node.clone(),
            deadline: timeout.map(|t| now + t),
            token,
        };
        let id = arena.insert(*owner, waiter);
        match waiters.add(arena, id) {
            Ok(true) => {}
            Ok(false) => {
                let _ = arena.remove(id);
                tracing::trace!("wait_coalesced: monitor={}, node={}", self.name, node.id());
            }
            Err(err) => {
                let _ = arena.remove(id);
                tracing::error!("wait_rejected: monitor={}, error={}", self.name, err);
            }
        }

        if !inner.registered {
            inner.registered = true;
            manager.register(self);
        }
        true
    }

    /// Fail every waiter whose token has a waiter past its deadline.
    pub fn check_on_asset(&self, now: Instant, set: &mut ActivationSet) -> usize {
        let mut inner = lock(&self.inner);
        let MonitorInner { arena, waiters, .. } = &mut *inner;

        let mut expired: Vec<WaitToken> = Vec::new();
        for id in waiters.copy(arena) {
            if let Some(waiter) = arena.get(id) {
                let late = waiter.deadline.map(|d| now > d).unwrap_or(false);
                if late && !expired.contains(&waiter.token) {
                    expired.push(waiter.token);
                }
            }
        }
        if expired.is_empty() {
            return 0;
        }

        let mut count = 0;
        for id in waiters.copy(arena) {
            let matches = arena
                .get(id)
                .map(|w| expired.contains(&w.token))
                .unwrap_or(false);
            if !matches || waiters.remove(arena, id).is_err() {
                continue;
            }
            if let Ok(waiter) = arena.remove(id) {
                let failure = Failure::timeout(
                    waiter.token,
                    format!("wait on {} exceeded its deadline", self.name),
                );
                set.push(waiter.node, Some(failure));
                count += 1;
            }
        }
        tracing::debug!("asset_timeouts: monitor={}, failed={}", self.name, count);
        count
    }

    /// Release every waiter, optionally failing them, without changing the
    /// satisfied state.
    pub fn activate_job_nodes(&self, set: &mut ActivationSet, failure: Option<Failure>) -> usize {
        let mut inner = lock(&self.inner);
        Self::release_all(&mut inner, set, failure)
    }

    /// Mark the asset satisfied and release every waiter.
    pub fn complete(&self, set: &mut ActivationSet) -> usize {
        let mut inner = lock(&self.inner);
        inner.satisfied = true;
        Self::release_all(&mut inner, set, None)
    }

    /// Make the asset unsatisfied again so later waits park.
    pub fn reset(&self) {
        lock(&self.inner).satisfied = false;
    }

    pub fn is_satisfied(&self) -> bool {
        lock(&self.inner).satisfied
    }

    pub fn waiting(&self) -> usize {
        lock(&self.inner).waiters.len()
    }

    fn release_all(inner: &mut MonitorInner, set: &mut ActivationSet, failure: Option<Failure>) -> usize {
        let MonitorInner { arena, waiters, .. } = inner;
        let mut count = 0;
        for id in waiters.purge(arena) {
            if let Ok(waiter) = arena.remove(id) {
                set.push(waiter.node, failure.clone());
                count += 1;
            }
        }
        count
    }
}

/// Registry of monitors checked by the periodic sweep.
///
/// Monitors register themselves on their first wait. The manager holds them
/// weakly, so a monitor is forgotten once its owner drops it.
#[derive(Debug, Default)]
pub struct AssetManager {
    registry: Mutex<Registry>,
}

/// Registered monitors. Dead entries are dropped on every sweep, and on
/// registration whenever the list has doubled since the last prune.
#[derive(Debug, Default)]
struct Registry {
    monitors: Vec<Weak<AssetMonitor>>,
    prune_at: usize,
}

const MIN_PRUNE_AT: usize = 32;

impl Registry {
    fn prune(&mut self) {
        self.monitors.retain(|m| m.strong_count() > 0);
        self.prune_at = (self.monitors.len() * 2).max(MIN_PRUNE_AT);
    }
}

impl AssetManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, monitor: &Arc<AssetMonitor>) {
        let mut registry = lock(&self.registry);
        if registry.monitors.len() >= registry.prune_at {
            registry.prune();
        }
        registry.monitors.push(Arc::downgrade(monitor));
    }

    /// Expire overdue waits on every live monitor.
    pub fn check_on_assets(&self, now: Instant) -> ActivationSet {
        let live: Vec<Arc<AssetMonitor>> = {
            let mut registry = lock(&self.registry);
            registry.prune();
            registry.monitors.iter().filter_map(Weak::upgrade).collect()
        };

        let mut set = ActivationSet::new();
        for monitor in live {
            monitor.check_on_asset(now, &mut set);
        }
        set
    }

    pub fn monitor_count(&self) -> usize {
        lock(&self.registry)
            .monitors
            .iter()
            .filter(|m| m.strong_count() > 0)
            .count()
    }
}
