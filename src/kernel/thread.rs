//! Thread state.
//!
//! A thread is one line of execution within a process. It owns its active
//! job sequences, its thread-scoped managed object and administrator
//! containers, and the failure currently being escalated. All of it is
//! guarded by the thread lock; see [`crate::kernel`] for the lock order.

use std::fmt;
use std::iter;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::administration::AdministratorContainer;
use super::asset::{ActivationSet, AssetMonitor, WaitToken};
use super::escalation::{
    EscalationFloor, EscalationLevel, EscalationProcedure, EscalationRecord, EscalationResolution,
    Failure,
};
use super::job::{JobNode, Value};
use super::list::{EntryArena, EntryId, LinkedListSet, OwnerId};
use super::managed_object::{ManagedObjectContainer, RecycleOutcome};
use super::metadata::{AdministratorIndex, FlowIndex, OfficeMetaData};
use super::process::ProcessState;
use super::lock;
use crate::types::{Error, Result, ThreadId};

/// One active job sequence: a flow being walked job by job.
#[derive(Debug, Clone)]
pub(crate) struct SequenceRecord {
    pub(crate) flow: FlowIndex,
    /// Flows that invoked this one, nearest first.
    pub(crate) enclosing: Vec<FlowIndex>,
    pub(crate) floor: EscalationFloor,
}

impl SequenceRecord {
    /// Own flow followed by the enclosing flows.
    pub(crate) fn chain(&self) -> Vec<FlowIndex> {
        iter::once(self.flow).chain(self.enclosing.iter().copied()).collect()
    }
}

/// State guarded by the thread lock.
#[derive(Debug)]
pub struct ThreadInner {
    owner: OwnerId,
    sequences: EntryArena<SequenceRecord>,
    active: LinkedListSet,
    containers: Vec<Option<ManagedObjectContainer>>,
    administrators: Vec<Option<AdministratorContainer>>,
    failure: Option<Failure>,
    escalation_level: Option<EscalationLevel>,
    escalating: u32,
    complete: bool,
}

impl ThreadInner {
    fn new(office: &OfficeMetaData) -> Self {
        let owner = OwnerId::next();
        Self {
            owner,
            sequences: EntryArena::new(),
            active: LinkedListSet::new(owner),
            containers: (0..office.thread.managed_objects.len()).map(|_| None).collect(),
            administrators: (0..office.thread.administrators.len()).map(|_| None).collect(),
            failure: None,
            escalation_level: None,
            escalating: 0,
            complete: false,
        }
    }

    pub fn active_sequences(&self) -> usize {
        self.active.len()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Failure currently being escalated.
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// How far the current escalation search has climbed.
    pub fn escalation_level(&self) -> Option<EscalationLevel> {
        self.escalation_level
    }

    pub(crate) fn has_sequence(&self, sequence: EntryId) -> bool {
        self.active.contains(&self.sequences, sequence)
    }

    pub(crate) fn sequence(&self, sequence: EntryId) -> Option<&SequenceRecord> {
        self.sequences.get(sequence)
    }

    /// Thread-scoped container, created on first use.
    pub fn managed_object_container(
        &mut self,
        office: &OfficeMetaData,
        index: usize,
    ) -> Option<&mut ManagedObjectContainer> {
        let slot = self.containers.get_mut(index)?;
        if slot.is_none() {
            let meta = office.thread.managed_objects.get(index)?.clone();
            *slot = Some(ManagedObjectContainer::new(meta));
        }
        slot.as_mut()
    }

    /// Administrator container, created on first use.
    pub fn administrator_container(&mut self, index: AdministratorIndex) -> Option<&mut AdministratorContainer> {
        let slot = self.administrators.get_mut(index.get())?;
        if slot.is_none() {
            *slot = Some(AdministratorContainer::new(index));
        }
        slot.as_mut()
    }

    pub(crate) fn escalation_start(&mut self) {
        self.escalating += 1;
        self.escalation_level = Some(EscalationLevel::Flow);
    }

    /// Returns true once no escalation is in progress.
    pub(crate) fn escalation_complete(&mut self) -> bool {
        self.escalating = self.escalating.saturating_sub(1);
        if self.escalating == 0 {
            self.escalation_level = None;
        }
        self.escalating == 0
    }
}

/// A thread of a process.
pub struct ThreadState {
    id: ThreadId,
    process: Arc<ProcessState>,
    completion: Arc<AssetMonitor>,
    inner: Mutex<ThreadInner>,
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("process", self.process.id())
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl ThreadState {
    pub(crate) fn new(process: Arc<ProcessState>) -> Arc<Self> {
        let id = ThreadId::new();
        let inner = ThreadInner::new(process.office());
        Arc::new(Self {
            completion: AssetMonitor::new(format!("thread {}", id)),
            id,
            process,
            inner: Mutex::new(inner),
        })
    }

    pub fn id(&self) -> &ThreadId {
        &self.id
    }

    pub fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_satisfied()
    }

    pub(crate) fn thread_lock(&self) -> MutexGuard<'_, ThreadInner> {
        lock(&self.inner)
    }

    /// Start walking `flow`; its first job node goes into `set`.
    pub(crate) fn create_job_sequence(
        self: &Arc<Self>,
        inner: &mut ThreadInner,
        flow: FlowIndex,
        parameter: Option<Value>,
        enclosing: Vec<FlowIndex>,
        floor: EscalationFloor,
        set: &mut ActivationSet,
    ) -> Result<EntryId> {
        let flow_meta = self.process.office().flow(flow);
        let first = *flow_meta
            .jobs
            .first()
            .ok_or_else(|| Error::internal(format!("flow {} has no jobs", flow_meta.name)))?;

        let ThreadInner {
            owner,
            sequences,
            active,
            ..
        } = inner;
        let sequence = sequences.insert(
            *owner,
            SequenceRecord {
                flow,
                enclosing,
                floor,
            },
        );
        if let Err(err) = active.add(sequences, sequence) {
            let _ = sequences.remove(sequence);
            return Err(err.into());
        }

        tracing::trace!("job_sequence_created: tid={}, flow={}", self.id, flow_meta.name);
        set.push(JobNode::new(self.clone(), sequence, flow, 0, first, parameter), None);
        Ok(sequence)
    }

    /// The sequence ran out of jobs (or was cut short by escalation).
    pub(crate) fn sequence_complete(&self, inner: &mut ThreadInner, sequence: EntryId, set: &mut ActivationSet) {
        let ThreadInner {
            sequences, active, ..
        } = &mut *inner;
        if active.remove(sequences, sequence).is_ok() {
            let _ = sequences.remove(sequence);
        }
        if inner.escalating == 0 && inner.active.is_empty() {
            self.thread_complete(inner, set);
        }
    }

    /// Drop every active sequence; their parked job nodes become stale.
    pub(crate) fn abort(&self, inner: &mut ThreadInner, set: &mut ActivationSet) {
        if inner.complete {
            return;
        }
        let ThreadInner {
            sequences, active, ..
        } = &mut *inner;
        let purged = active.purge(sequences);
        for sequence in &purged {
            let _ = sequences.remove(*sequence);
        }
        tracing::debug!("thread_aborted: tid={}, sequences={}", self.id, purged.len());
        if inner.escalating == 0 {
            self.thread_complete(inner, set);
        }
    }

    fn thread_complete(&self, inner: &mut ThreadInner, set: &mut ActivationSet) {
        if inner.complete {
            return;
        }
        inner.complete = true;

        let failure = inner.failure.clone().or_else(|| self.process.failure());
        let outcome = match failure {
            Some(failure) => RecycleOutcome::Failed(failure),
            None => RecycleOutcome::Clean,
        };
        for container in inner.containers.iter_mut().flatten() {
            container.unload(&outcome, set);
        }
        for administrator in inner.administrators.iter_mut().flatten() {
            administrator.unload();
        }

        let joined = self.completion.complete(set);
        tracing::debug!(
            "thread_completed: tid={}, pid={}, joined={}",
            self.id,
            self.process.id(),
            joined
        );
        self.process.thread_complete(&self.id, set);
    }

    /// Park `node` until this thread completes. Waiting on the node's own
    /// thread would never finish, so that case activates at once.
    pub(crate) fn wait_on_flow(
        &self,
        node: &Arc<JobNode>,
        timeout: Option<Duration>,
        token: WaitToken,
        set: &mut ActivationSet,
    ) -> bool {
        if std::ptr::eq(Arc::as_ptr(node.thread()), self) {
            set.push(node.clone(), None);
            return false;
        }
        self.completion.wait_on_asset(
            self.process.core().assets(),
            node,
            timeout,
            token,
            Instant::now(),
            set,
        )
    }

    /// Route `failure` raised by `node` to its handler.
    pub(crate) fn escalate(
        self: &Arc<Self>,
        inner: &mut ThreadInner,
        node: &Arc<JobNode>,
        failure: Failure,
        set: &mut ActivationSet,
    ) {
        let core = self.process.core();
        let office = core.office();
        let Some(record) = inner.sequence(node.sequence()) else {
            tracing::warn!("escalation_without_sequence: tid={}, node={}", self.id, node.id());
            return;
        };
        let chain = record.chain();
        let floor = record.floor;
        let failure = failure.with_job(office.job(node.job()).name.clone());

        inner.escalation_start();
        inner.failure = Some(failure.clone());
        let mut escalation = EscalationRecord::new(failure, node.id());
        let resolution = EscalationProcedure::new(office).resolve(&mut escalation, &chain, floor);
        inner.escalation_level = Some(escalation.scope);
        tracing::info!(
            "escalation: pid={}, tid={}, node={}, failure={}, level={:?}",
            self.process.id(),
            self.id,
            escalation.origin,
            escalation.failure,
            escalation.scope
        );

        self.sequence_complete(inner, node.sequence(), set);

        let parameter: Value = Arc::new(escalation.failure.clone());
        let handled = match resolution {
            EscalationResolution::Flow { handler, depth } => self
                .create_job_sequence(inner, handler, Some(parameter), chain[depth + 1..].to_vec(), floor, set)
                .is_ok(),
            EscalationResolution::Thread { handler } => self
                .create_job_sequence(inner, handler, Some(parameter), Vec::new(), EscalationFloor::Process, set)
                .is_ok(),
            EscalationResolution::Process { handler } => self
                .process
                .create_thread(handler, Some(parameter), EscalationFloor::TopLevel, set)
                .is_ok(),
            EscalationResolution::TopLevel => false,
        };

        if handled {
            inner.failure = None;
            core.counters.escalations_handled.inc();
        } else {
            core.handle_top_level(self.process.id(), &escalation.failure);
            for other in self.process.terminate(escalation.failure) {
                if !Arc::ptr_eq(&other, self) {
                    set.abort_thread(other);
                }
            }
            let ThreadInner {
                sequences, active, ..
            } = &mut *inner;
            for sequence in active.purge(sequences) {
                let _ = sequences.remove(sequence);
            }
        }

        if inner.escalation_complete() && inner.active.is_empty() {
            self.thread_complete(inner, set);
        }
    }
}
