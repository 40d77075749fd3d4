//! Process state.
//!
//! A process is one invocation of the office: a set of threads sharing the
//! process-scoped managed objects. It completes when its last thread does,
//! at which point process containers are recycled and the outcome is
//! published to every [`ProcessHandle`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;

use super::asset::ActivationSet;
use super::escalation::{EscalationFloor, Failure};
use super::job::{JobNode, Value};
use super::managed_object::{LoadStatus, ManagedObject, ManagedObjectContainer, RecycleOutcome};
use super::metadata::{FlowIndex, OfficeMetaData};
use super::thread::ThreadState;
use super::{lock, KernelCore};
use crate::types::{Error, ProcessId, Result, ThreadId};

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Set when an unhandled escalation terminated the process.
    pub failure: Option<Failure>,
    pub threads: u64,
    pub completed_at: DateTime<Utc>,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug)]
struct ProcessInner {
    threads: HashMap<ThreadId, Weak<ThreadState>>,
    threads_completed: u64,
    containers: Vec<Option<ManagedObjectContainer>>,
    failure: Option<Failure>,
    complete: bool,
}

pub struct ProcessState {
    id: ProcessId,
    core: Arc<KernelCore>,
    inner: Mutex<ProcessInner>,
    terminated: AtomicBool,
    outcome: watch::Sender<Option<ProcessOutcome>>,
    started_at: DateTime<Utc>,
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessState")
            .field("id", &self.id)
            .field("terminated", &self.is_terminated())
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl ProcessState {
    /// New process, optionally with an input object already bound to its slot.
    pub(crate) fn new(core: Arc<KernelCore>, input: Option<(usize, ManagedObject)>) -> Result<Arc<Self>> {
        let office = core.office();
        let mut containers: Vec<Option<ManagedObjectContainer>> =
            (0..office.process.managed_objects.len()).map(|_| None).collect();

        if let Some((slot, object)) = input {
            let meta = office
                .process
                .managed_objects
                .get(slot)
                .filter(|meta| meta.input)
                .ok_or_else(|| Error::validation(format!("slot {} is not an input managed object", slot)))?;
            containers[slot] = Some(ManagedObjectContainer::with_input(meta.clone(), object));
        }

        let (outcome, _) = watch::channel(None);
        Ok(Arc::new(Self {
            id: ProcessId::new(),
            core,
            inner: Mutex::new(ProcessInner {
                threads: HashMap::new(),
                threads_completed: 0,
                containers,
                failure: None,
                complete: false,
            }),
            terminated: AtomicBool::new(false),
            outcome,
            started_at: Utc::now(),
        }))
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.process_lock().complete
    }

    pub fn active_threads(&self) -> usize {
        self.process_lock().threads.len()
    }

    pub fn completed_threads(&self) -> u64 {
        self.process_lock().threads_completed
    }

    /// Failure that terminated the process, if any.
    pub fn failure(&self) -> Option<Failure> {
        self.process_lock().failure.clone()
    }

    pub(crate) fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }

    pub(crate) fn office(&self) -> &OfficeMetaData {
        self.core.office()
    }

    fn process_lock(&self) -> MutexGuard<'_, ProcessInner> {
        lock(&self.inner)
    }

    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            id: self.id.clone(),
            outcome: self.outcome.subscribe(),
        }
    }

    /// Start a new thread on `flow`.
    pub(crate) fn create_thread(
        self: &Arc<Self>,
        flow: FlowIndex,
        parameter: Option<Value>,
        floor: EscalationFloor,
        set: &mut ActivationSet,
    ) -> Result<Arc<ThreadState>> {
        let thread = ThreadState::new(self.clone());
        {
            let mut inner = self.process_lock();
            if inner.complete || self.is_terminated() {
                return Err(Error::state_transition(format!(
                    "process {} no longer accepts threads",
                    self.id
                )));
            }
            inner.threads.insert(thread.id().clone(), Arc::downgrade(&thread));
        }

        let created = {
            let mut inner = thread.thread_lock();
            thread.create_job_sequence(&mut inner, flow, parameter, Vec::new(), floor, set)
        };
        if let Err(err) = created {
            let mut inner = thread.thread_lock();
            thread.abort(&mut inner, set);
            return Err(err);
        }

        self.core.counters.threads_created.inc();
        tracing::debug!(
            "thread_created: pid={}, tid={}, flow={}",
            self.id,
            thread.id(),
            self.office().flow(flow).name
        );
        Ok(thread)
    }

    /// Called exactly once per thread, from its completion.
    pub(crate) fn thread_complete(&self, thread: &ThreadId, set: &mut ActivationSet) {
        let outcome = {
            let mut inner = self.process_lock();
            if inner.threads.remove(thread).is_none() {
                tracing::warn!("unknown_thread_completed: pid={}, tid={}", self.id, thread);
                return;
            }
            inner.threads_completed += 1;
            if !inner.threads.is_empty() || inner.complete {
                return;
            }
            inner.complete = true;

            let failure = inner.failure.clone();
            let recycle = match &failure {
                Some(failure) => RecycleOutcome::Failed(failure.clone()),
                None => RecycleOutcome::Clean,
            };
            for container in inner.containers.iter_mut().flatten() {
                container.unload(&recycle, set);
            }
            ProcessOutcome {
                failure,
                threads: inner.threads_completed,
                completed_at: Utc::now(),
            }
        };

        tracing::info!(
            "process_completed: pid={}, threads={}, terminated={}",
            self.id,
            outcome.threads,
            !outcome.is_success()
        );
        self.core.process_completed(&self.id, &outcome);
        self.outcome.send_replace(Some(outcome));
    }

    /// Mark the process terminated and return its live threads so the caller
    /// can abort them once it holds no thread lock.
    pub(crate) fn terminate(&self, failure: Failure) -> Vec<Arc<ThreadState>> {
        self.terminated.store(true, Ordering::Release);
        let mut inner = self.process_lock();
        if inner.failure.is_none() {
            tracing::warn!("process_terminated: pid={}, failure={}", self.id, failure);
            inner.failure = Some(failure);
        }
        inner.threads.values().filter_map(Weak::upgrade).collect()
    }

    /// Load a process-scoped managed object on behalf of `node`.
    pub(crate) fn load_managed_object(
        &self,
        index: usize,
        node: &Arc<JobNode>,
        dependencies: &[ManagedObject],
        set: &mut ActivationSet,
    ) -> LoadStatus {
        let mut inner = self.process_lock();
        let Some(slot) = inner.containers.get_mut(index) else {
            return LoadStatus::Failed(Failure::sourcing(
                format!("process object {}", index),
                "no such process managed object",
            ));
        };
        if slot.is_none() {
            match self.core.office().process.managed_objects.get(index) {
                Some(meta) => *slot = Some(ManagedObjectContainer::new(meta.clone())),
                None => {
                    return LoadStatus::Failed(Failure::sourcing(
                        format!("process object {}", index),
                        "no such process managed object",
                    ));
                }
            }
        }
        match slot.as_mut() {
            Some(container) => container.load(node, dependencies, &self.core, set),
            None => LoadStatus::Failed(Failure::sourcing(
                format!("process object {}", index),
                "container missing",
            )),
        }
    }
}

/// Caller's view of a running process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: ProcessId,
    outcome: watch::Receiver<Option<ProcessOutcome>>,
}

impl ProcessHandle {
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the process to complete.
    pub async fn wait(&self) -> Result<ProcessOutcome> {
        let mut receiver = self.outcome.clone();
        let outcome = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::internal(format!("process {} dropped before completing", self.id)))?;
        outcome
            .clone()
            .ok_or_else(|| Error::internal(format!("process {} has no outcome", self.id)))
    }
}
