//! Kernel - runs jobs of an office inside process, thread and job sequence
//! scopes.
//!
//! The [`Kernel`] owns the validated [`OfficeMetaData`], the asset manager
//! and the registry of live processes. Subsystems (monitors, containers,
//! escalation) are plain structs owned by the scope objects, not actors.
//!
//! Locks are always taken in the order thread → process → monitor, and job
//! nodes activated under a lock are collected in an [`ActivationSet`] that is
//! dispatched to teams only after every lock has been released.

pub mod administration;
pub mod asset;
pub mod escalation;
pub mod job;
pub mod list;
pub mod managed_object;
pub mod metadata;
pub mod process;
pub mod recovery;
pub mod sweep;
pub mod team;
pub mod thread;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::types::{Config, Error, ProcessId, Result};

pub use administration::{AdministrationContext, AdministratorContainer, AdministratorSource, Duty};
pub use asset::{Activation, ActivationSet, AssetManager, AssetMonitor, WaitToken};
pub use escalation::{
    EscalationLevel, Failure, FailureKind, FailureMatcher, LoggingEscalationHandler,
    TopLevelEscalationHandler,
};
pub use job::{FlowHandle, JobContext, JobNode, Value};
pub use list::{ComparatorLinkedListSet, EntryArena, EntryId, LinkedListSet, ListError, OwnerId};
pub use managed_object::{
    ContainerState, FlowInvoker, ManagedObject, ManagedObjectPool, ManagedObjectSource,
    ManagedObjectUser, QueuePool, Recycle, RecycleOutcome, SourceContext,
};
pub use metadata::{
    AdministratorConfig, FlowConfig, JobConfig, ManagedObjectConfig, OfficeBuilder, OfficeMetaData,
};
pub use process::{ProcessHandle, ProcessOutcome, ProcessState};
pub use recovery::with_recovery;
pub use sweep::{MonitorSweep, SweepStats};
pub use team::{Job, PassiveTeam, Team, TeamOverload, WorkerTeam};
pub use thread::ThreadState;

use escalation::EscalationFloor;
use metadata::FlowIndex;
use recovery::recover_or;

/// Lock a kernel mutex. A panic never unwinds while one is held (user code
/// runs under `catch_unwind`), so a poisoned lock still guards valid state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct KernelCounters {
    pub(crate) processes_invoked: Counter,
    pub(crate) processes_completed: Counter,
    pub(crate) processes_terminated: Counter,
    pub(crate) threads_created: Counter,
    pub(crate) jobs_executed: Counter,
    pub(crate) escalations_handled: Counter,
    pub(crate) top_level_escalations: Counter,
    pub(crate) timeouts: Counter,
    pub(crate) team_overloads: Counter,
}

/// Kernel statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelStats {
    pub processes_invoked: u64,
    pub processes_completed: u64,
    pub processes_terminated: u64,
    pub active_processes: usize,
    pub threads_created: u64,
    pub jobs_executed: u64,
    pub escalations_handled: u64,
    pub top_level_escalations: u64,
    pub timeouts: u64,
    pub team_overloads: u64,
}

/// State shared by everything the kernel runs.
#[derive(Debug)]
pub struct KernelCore {
    office: OfficeMetaData,
    config: Config,
    assets: AssetManager,
    top_level: Arc<dyn TopLevelEscalationHandler>,
    processes: DashMap<ProcessId, Arc<ProcessState>>,
    started: AtomicBool,
    pub(crate) counters: KernelCounters,
}

impl KernelCore {
    pub(crate) fn new(
        office: OfficeMetaData,
        config: Config,
        top_level: Arc<dyn TopLevelEscalationHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            office,
            config,
            assets: AssetManager::new(),
            top_level,
            processes: DashMap::new(),
            started: AtomicBool::new(false),
            counters: KernelCounters::default(),
        })
    }

    pub fn office(&self) -> &OfficeMetaData {
        &self.office
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn assets(&self) -> &AssetManager {
        &self.assets
    }

    /// Hand activated job nodes to their teams. Must be called with no
    /// kernel lock held.
    pub(crate) fn dispatch(self: &Arc<Self>, set: ActivationSet) {
        team::dispatch(self, set);
    }

    /// Start a process on `flow`.
    pub(crate) fn invoke(
        self: &Arc<Self>,
        flow: FlowIndex,
        parameter: Option<Value>,
        input: Option<(usize, ManagedObject)>,
    ) -> Result<ProcessHandle> {
        let process = ProcessState::new(self.clone(), input)?;
        let handle = process.handle();
        self.processes.insert(process.id().clone(), process.clone());

        let mut set = ActivationSet::new();
        if let Err(err) = process.create_thread(flow, parameter, EscalationFloor::Thread, &mut set) {
            self.processes.remove(process.id());
            return Err(err);
        }
        self.counters.processes_invoked.inc();
        tracing::debug!(
            "process_invoked: pid={}, flow={}",
            process.id(),
            self.office.flow(flow).name
        );

        self.dispatch(set);
        Ok(handle)
    }

    pub(crate) fn process_completed(&self, id: &ProcessId, outcome: &ProcessOutcome) {
        self.processes.remove(id);
        self.counters.processes_completed.inc();
        if !outcome.is_success() {
            self.counters.processes_terminated.inc();
        }
    }

    /// Hand an unhandled failure to the top-level handler.
    pub(crate) fn handle_top_level(&self, process: &ProcessId, failure: &Failure) {
        self.counters.top_level_escalations.inc();
        let handler = self.top_level.clone();
        recover_or(
            || handler.handle_escalation(process, failure),
            "top_level_escalation",
            (),
        );
    }

    /// Expire overdue waits and run the failed job nodes.
    pub(crate) fn check_on_assets(self: &Arc<Self>) -> usize {
        let set = self.assets.check_on_assets(Instant::now());
        let timed_out = set.failed();
        self.counters.timeouts.add(timed_out as u64);
        self.dispatch(set);
        timed_out
    }
}

/// Entry point: runs processes of one office.
#[derive(Debug, Clone)]
pub struct Kernel {
    core: Arc<KernelCore>,
}

impl Kernel {
    /// Kernel logging unhandled escalations.
    pub fn new(office: OfficeMetaData, config: Config) -> Self {
        Self::with_top_level_handler(office, config, Arc::new(LoggingEscalationHandler))
    }

    pub fn with_top_level_handler(
        office: OfficeMetaData,
        config: Config,
        handler: Arc<dyn TopLevelEscalationHandler>,
    ) -> Self {
        Self {
            core: KernelCore::new(office, config, handler),
        }
    }

    pub fn office(&self) -> &OfficeMetaData {
        self.core.office()
    }

    pub fn config(&self) -> &Config {
        self.core.config()
    }

    /// Start every managed object source once, before any process runs.
    pub fn start(&self) -> Result<()> {
        if self
            .core
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::state_transition(format!(
                "office {} already started",
                self.core.office.name
            )));
        }

        for binding in &self.core.office.sources {
            let mut context = SourceContext::new(&self.core, &binding.name, binding.input_slot);
            binding.source.start(&mut context).map_err(|err| {
                tracing::error!("source_start_failed: source={}, error={}", binding.name, err);
                err
            })?;
        }
        tracing::info!(
            "office_started: name={}, sources={}",
            self.core.office.name,
            self.core.office.sources.len()
        );
        Ok(())
    }

    /// Start a process on the named flow.
    pub fn invoke_process(&self, flow: &str, parameter: Option<Value>) -> Result<ProcessHandle> {
        let index = self.flow_index(flow)?;
        self.core.invoke(index, parameter, None)
    }

    /// Start a process with `input` bound to the named input managed object.
    pub fn invoke_process_with_input(
        &self,
        flow: &str,
        parameter: Option<Value>,
        managed_object: &str,
        input: ManagedObject,
    ) -> Result<ProcessHandle> {
        let index = self.flow_index(flow)?;
        let slot = self.core.office.input_slot(managed_object).ok_or_else(|| {
            Error::not_found(format!("input managed object {}", managed_object))
        })?;
        self.core.invoke(index, parameter, Some((slot, input)))
    }

    /// Expire overdue waits now. Returns the number of job nodes failed.
    pub fn check_on_assets(&self) -> usize {
        self.core.check_on_assets()
    }

    /// Sweep calling [`Kernel::check_on_assets`] at the configured interval.
    /// Not running until started.
    pub fn monitor_sweep(&self) -> MonitorSweep {
        MonitorSweep::new(&self.core, self.core.config.monitor.sweep_interval)
    }

    /// Start the background sweep on the current tokio runtime. The sweep
    /// stops when the returned value is dropped.
    pub fn start_monitor_sweep(&self) -> Result<MonitorSweep> {
        tokio::runtime::Handle::try_current().map_err(|err| {
            Error::configuration(format!("monitor sweep needs a tokio runtime: {}", err))
        })?;
        let mut sweep = self.monitor_sweep();
        sweep.start();
        tracing::info!(
            "monitor_sweep_started: office={}, interval={:?}",
            self.core.office.name,
            sweep.interval()
        );
        Ok(sweep)
    }

    /// Live processes.
    pub fn process_count(&self) -> usize {
        self.core.processes.len()
    }

    pub fn process(&self, id: &ProcessId) -> Option<Arc<ProcessState>> {
        self.core.processes.get(id).map(|entry| entry.value().clone())
    }

    pub fn stats(&self) -> KernelStats {
        let c = &self.core.counters;
        KernelStats {
            processes_invoked: c.processes_invoked.get(),
            processes_completed: c.processes_completed.get(),
            processes_terminated: c.processes_terminated.get(),
            active_processes: self.core.processes.len(),
            threads_created: c.threads_created.get(),
            jobs_executed: c.jobs_executed.get(),
            escalations_handled: c.escalations_handled.get(),
            top_level_escalations: c.top_level_escalations.get(),
            timeouts: c.timeouts.get(),
            team_overloads: c.team_overloads.get(),
        }
    }

    fn flow_index(&self, flow: &str) -> Result<FlowIndex> {
        self.core
            .office
            .flow_by_name(flow)
            .ok_or_else(|| Error::not_found(format!("flow {}", flow)))
    }
}
