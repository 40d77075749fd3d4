//! Managed objects.
//!
//! A [`ManagedObjectSource`] supplies objects to the kernel, synchronously or
//! later from any thread, through a one-shot [`ManagedObjectUser`]. Each
//! process or thread scope holds one [`ManagedObjectContainer`] per bound
//! object; the container drives the object through
//! `Unloaded → Sourcing → Loaded → Ready → Recycling → Unloaded`.

use crossbeam::queue::SegQueue;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use super::asset::{ActivationSet, AssetMonitor, WaitToken};
use super::escalation::Failure;
use super::job::{JobNode, Value};
use super::metadata::{FlowIndex, ManagedObjectMetaData};
use super::process::ProcessHandle;
use super::recovery::{recover_or, with_recovery};
use super::{lock, KernelCore};
use crate::types::{Error, JobNodeId, Result};

/// A sourced object as seen by jobs.
pub type ManagedObject = Value;

/// Wait token shared by every job node waiting on one container's sourcing.
const SOURCING_TOKEN: WaitToken = WaitToken(0);

/// How the scope that used an object ended.
#[derive(Debug, Clone)]
pub enum RecycleOutcome {
    Clean,
    Failed(Failure),
    /// The object arrived after its scope had already gone.
    Abandoned,
}

impl RecycleOutcome {
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            RecycleOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// What to do with an object after recycling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recycle {
    /// Return it to the pool, if the binding has one.
    Pool,
    Discard,
}

/// Supplies managed objects.
pub trait ManagedObjectSource: Send + Sync + fmt::Debug {
    /// Called once by `Kernel::start` before any process runs.
    fn start(&self, _context: &mut SourceContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Supply an object through `user`, now or later from any thread.
    /// Dropping the user without supplying anything fails the sourcing.
    fn source(&self, user: ManagedObjectUser);

    /// Wire a freshly loaded object to its dependencies.
    fn coordinate(
        &self,
        _object: &ManagedObject,
        _dependencies: &[ManagedObject],
    ) -> std::result::Result<(), Failure> {
        Ok(())
    }

    /// Decide the fate of an object when its scope ends.
    fn recycle(&self, _object: &ManagedObject, outcome: &RecycleOutcome) -> Recycle {
        match outcome {
            RecycleOutcome::Clean => Recycle::Pool,
            _ => Recycle::Discard,
        }
    }
}

/// Pool of reusable objects for one binding.
pub trait ManagedObjectPool: Send + Sync + fmt::Debug {
    fn take(&self) -> Option<ManagedObject>;

    fn give_back(&self, object: ManagedObject);

    /// The object will not come back.
    fn lost(&self, _object: ManagedObject, _failure: Option<&Failure>) {}
}

/// Lock-free pool keeping up to `max_idle` objects.
#[derive(Debug)]
pub struct QueuePool {
    queue: SegQueue<ManagedObject>,
    max_idle: usize,
}

impl QueuePool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            max_idle,
        }
    }

    pub fn idle(&self) -> usize {
        self.queue.len()
    }
}

impl ManagedObjectPool for QueuePool {
    fn take(&self) -> Option<ManagedObject> {
        self.queue.pop()
    }

    fn give_back(&self, object: ManagedObject) {
        if self.queue.len() < self.max_idle {
            self.queue.push(object);
        }
    }
}

/// Passed to [`ManagedObjectSource::start`].
#[derive(Debug)]
pub struct SourceContext<'a> {
    core: &'a Arc<KernelCore>,
    name: &'a str,
    input_slot: Option<usize>,
}

impl<'a> SourceContext<'a> {
    pub(crate) fn new(core: &'a Arc<KernelCore>, name: &'a str, input_slot: Option<usize>) -> Self {
        Self {
            core,
            name,
            input_slot,
        }
    }

    /// Name of the (first) managed object bound to this source.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Handle the source keeps to start processes on `flow`.
    pub fn flow(&mut self, flow: &str) -> Result<FlowInvoker> {
        let index = self
            .core
            .office()
            .flow_by_name(flow)
            .ok_or_else(|| Error::not_found(format!("flow {}", flow)))?;
        Ok(FlowInvoker {
            core: Arc::downgrade(self.core),
            flow: index,
            input_slot: self.input_slot,
        })
    }
}

/// Starts processes on behalf of a managed object source.
#[derive(Debug, Clone)]
pub struct FlowInvoker {
    core: Weak<KernelCore>,
    flow: FlowIndex,
    input_slot: Option<usize>,
}

impl FlowInvoker {
    /// Start a process, binding `input` to this source's input slot.
    pub fn invoke(&self, parameter: Option<Value>, input: Option<ManagedObject>) -> Result<ProcessHandle> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| Error::state_transition("kernel has shut down"))?;
        let input = match (input, self.input_slot) {
            (None, _) => None,
            (Some(object), Some(slot)) => Some((slot, object)),
            (Some(_), None) => {
                return Err(Error::validation(
                    "source is not bound as an input managed object",
                ));
            }
        };
        core.invoke(self.flow, parameter, input)
    }
}

#[derive(Debug, Default)]
struct SlotState {
    result: Option<std::result::Result<ManagedObject, Failure>>,
    abandoned: bool,
}

/// Rendezvous between one sourcing attempt and its container.
#[derive(Debug)]
struct SourcingSlot {
    name: String,
    source: Arc<dyn ManagedObjectSource>,
    monitor: Arc<AssetMonitor>,
    state: Mutex<SlotState>,
}

impl SourcingSlot {
    fn deliver(&self, result: std::result::Result<ManagedObject, Failure>, core: &Weak<KernelCore>) {
        let late = {
            let mut state = lock(&self.state);
            if state.abandoned {
                Some(result)
            } else if state.result.is_some() {
                None
            } else {
                state.result = Some(result);
                None
            }
        };

        if let Some(result) = late {
            if let Ok(object) = result {
                self.recycle_abandoned(object);
            }
            return;
        }

        let mut set = ActivationSet::new();
        self.monitor.complete(&mut set);
        if let Some(core) = core.upgrade() {
            core.dispatch(set);
        }
    }

    fn take_result(&self) -> Option<std::result::Result<ManagedObject, Failure>> {
        lock(&self.state).result.take()
    }

    fn abandon(&self) {
        let pending = {
            let mut state = lock(&self.state);
            state.abandoned = true;
            state.result.take()
        };
        if let Some(Ok(object)) = pending {
            self.recycle_abandoned(object);
        }
    }

    fn recycle_abandoned(&self, object: ManagedObject) {
        tracing::debug!("managed_object_abandoned: name={}", self.name);
        recover_or(
            || self.source.recycle(&object, &RecycleOutcome::Abandoned),
            &self.name,
            Recycle::Discard,
        );
    }
}

/// One-shot handle a source uses to supply an object.
pub struct ManagedObjectUser {
    slot: Option<Arc<SourcingSlot>>,
    core: Weak<KernelCore>,
}

impl fmt::Debug for ManagedObjectUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectUser")
            .field("managed_object", &self.managed_object_name())
            .finish()
    }
}

impl ManagedObjectUser {
    pub fn managed_object_name(&self) -> &str {
        self.slot.as_ref().map(|s| s.name.as_str()).unwrap_or("")
    }

    pub fn set_object(mut self, object: ManagedObject) {
        if let Some(slot) = self.slot.take() {
            slot.deliver(Ok(object), &self.core);
        }
    }

    pub fn set_failure(mut self, failure: Failure) {
        if let Some(slot) = self.slot.take() {
            slot.deliver(Err(failure), &self.core);
        }
    }
}

impl Drop for ManagedObjectUser {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let failure = Failure::sourcing(
                slot.name.clone(),
                "source released the user without supplying an object",
            );
            slot.deliver(Err(failure), &self.core);
        }
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Unloaded,
    Sourcing,
    Loaded,
    Ready,
    Recycling,
}

/// Result of asking a container for its object.
#[derive(Debug)]
pub enum LoadStatus {
    Ready(ManagedObject),
    /// The job node is parked on the container's monitor.
    Waiting,
    Failed(Failure),
}

/// Holds one managed object for one scope.
#[derive(Debug)]
pub struct ManagedObjectContainer {
    meta: Arc<ManagedObjectMetaData>,
    state: ContainerState,
    object: Option<ManagedObject>,
    sourcing: Option<Arc<SourcingSlot>>,
    monitor: Arc<AssetMonitor>,
    first_requester: Option<JobNodeId>,
    pending_failure: Option<(JobNodeId, Failure)>,
}

impl ManagedObjectContainer {
    pub(crate) fn new(meta: Arc<ManagedObjectMetaData>) -> Self {
        let monitor = AssetMonitor::new(format!("managed object {}", meta.name));
        Self {
            meta,
            state: ContainerState::Unloaded,
            object: None,
            sourcing: None,
            monitor,
            first_requester: None,
            pending_failure: None,
        }
    }

    /// Container pre-filled with an object handed in at process invocation.
    pub(crate) fn with_input(meta: Arc<ManagedObjectMetaData>, object: ManagedObject) -> Self {
        let mut container = Self::new(meta);
        container.object = Some(object);
        container.state = ContainerState::Loaded;
        container
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// Drive the container towards `Ready` on behalf of `node`.
    pub(crate) fn load(
        &mut self,
        node: &Arc<JobNode>,
        dependencies: &[ManagedObject],
        core: &Arc<KernelCore>,
        set: &mut ActivationSet,
    ) -> LoadStatus {
        if let Some((requester, _)) = &self.pending_failure {
            if *requester == node.id() {
                if let Some((_, failure)) = self.pending_failure.take() {
                    return LoadStatus::Failed(failure);
                }
            }
        }

        loop {
            match self.state {
                ContainerState::Unloaded => {
                    if self.meta.input {
                        return LoadStatus::Failed(Failure::sourcing(
                            self.meta.name.clone(),
                            "input managed object was not supplied",
                        ));
                    }
                    self.first_requester = Some(node.id());
                    let pooled = self.meta.pool.as_ref().and_then(|pool| pool.take());
                    match pooled {
                        Some(object) => {
                            self.object = Some(object);
                            self.state = ContainerState::Loaded;
                        }
                        None => self.begin_sourcing(core),
                    }
                }
                ContainerState::Sourcing => {
                    let result = self.sourcing.as_ref().and_then(|slot| slot.take_result());
                    match result {
                        Some(Ok(object)) => {
                            self.sourcing = None;
                            self.object = Some(object);
                            self.state = ContainerState::Loaded;
                        }
                        Some(Err(failure)) => {
                            self.sourcing = None;
                            self.state = ContainerState::Unloaded;
                            let requester = self.first_requester.take().unwrap_or_else(|| node.id());
                            tracing::warn!(
                                "sourcing_failed: managed_object={}, failure={}",
                                self.meta.name,
                                failure
                            );
                            if requester == node.id() {
                                return LoadStatus::Failed(failure);
                            }
                            self.pending_failure = Some((requester, failure));
                        }
                        None => {
                            let timeout = self
                                .meta
                                .timeout
                                .unwrap_or(core.config().monitor.default_sourcing_timeout);
                            // If the object arrived since the check, the
                            // node is activated at once and loads again.
                            self.monitor.wait_on_asset(
                                core.assets(),
                                node,
                                Some(timeout),
                                SOURCING_TOKEN,
                                Instant::now(),
                                set,
                            );
                            return LoadStatus::Waiting;
                        }
                    }
                }
                ContainerState::Loaded => {
                    let Some(object) = self.object.clone() else {
                        self.state = ContainerState::Unloaded;
                        continue;
                    };
                    let source = self.meta.source.clone();
                    let coordinated = with_recovery(
                        || source.coordinate(&object, dependencies),
                        &self.meta.name,
                    );
                    if let Err(failure) = coordinated {
                        return LoadStatus::Failed(failure);
                    }
                    self.state = ContainerState::Ready;
                }
                ContainerState::Ready => {
                    return match self.object.clone() {
                        Some(object) => LoadStatus::Ready(object),
                        None => {
                            self.state = ContainerState::Unloaded;
                            continue;
                        }
                    };
                }
                ContainerState::Recycling => {
                    return LoadStatus::Failed(Failure::sourcing(
                        self.meta.name.clone(),
                        "managed object is being recycled",
                    ));
                }
            }
        }
    }

    fn begin_sourcing(&mut self, core: &Arc<KernelCore>) {
        self.monitor.reset();
        let slot = Arc::new(SourcingSlot {
            name: self.meta.name.clone(),
            source: self.meta.source.clone(),
            monitor: self.monitor.clone(),
            state: Mutex::new(SlotState::default()),
        });
        self.sourcing = Some(slot.clone());
        self.state = ContainerState::Sourcing;

        let user = ManagedObjectUser {
            slot: Some(slot),
            core: Arc::downgrade(core),
        };
        let source = self.meta.source.clone();
        // A panicking source drops the user during unwinding, which records
        // the sourcing failure.
        recover_or(|| source.source(user), &self.meta.name, ());
    }

    /// Release the object back to its source (and pool). Job nodes still
    /// parked on the container belong to a finished scope and are released
    /// as stale.
    pub(crate) fn unload(&mut self, outcome: &RecycleOutcome, set: &mut ActivationSet) {
        self.monitor.activate_job_nodes(set, None);
        if let Some(slot) = self.sourcing.take() {
            slot.abandon();
        }
        if let Some(object) = self.object.take() {
            self.state = ContainerState::Recycling;
            let source = self.meta.source.clone();
            let decision = recover_or(|| source.recycle(&object, outcome), &self.meta.name, Recycle::Discard);
            match (&self.meta.pool, decision) {
                (Some(pool), Recycle::Pool) => pool.give_back(object),
                (Some(pool), Recycle::Discard) => pool.lost(object, outcome.failure()),
                (None, _) => {}
            }
        }
        self.state = ContainerState::Unloaded;
        self.first_requester = None;
        self.pending_failure = None;
    }
}
