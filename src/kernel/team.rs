//! Teams.
//!
//! A team decides where and when a job runs. [`PassiveTeam`] runs it on the
//! caller's thread; [`WorkerTeam`] hands it to tokio's blocking pool, bounded
//! by a semaphore. A team that cannot take a job returns it in a
//! [`TeamOverload`] and the kernel runs it inline instead.
//!
//! Dispatch drains a per-thread queue: a dispatch started while another is
//! draining on the same thread is queued behind it, so jobs run inline
//! (passive teams, overload fallback) never nest.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use super::asset::{Activation, ActivationSet};
use super::job::execute;
use super::KernelCore;
use crate::types::{Error, JobNodeId, Result, TeamConfig};

/// A job node ready to run on a team.
pub struct Job {
    activation: Activation,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("node", &self.id())
            .field("job", &self.job_name())
            .field("escalating", &self.activation.failure.is_some())
            .finish()
    }
}

impl Job {
    pub(crate) fn new(activation: Activation) -> Self {
        Self { activation }
    }

    pub fn id(&self) -> JobNodeId {
        self.activation.node.id()
    }

    pub fn job_name(&self) -> &str {
        self.activation.node.job_name()
    }

    /// Execute the job on the current thread, then dispatch what it
    /// activated.
    pub fn run(self) {
        let (core, set) = self.execute();
        dispatch(&core, set);
    }

    pub(crate) fn execute(self) -> (Arc<KernelCore>, ActivationSet) {
        execute(self.activation)
    }
}

/// A team refused a job; the job is handed back.
#[derive(Error, Debug)]
#[error("team {team} is at capacity ({capacity})")]
pub struct TeamOverload {
    team: String,
    capacity: usize,
    job: Job,
}

impl TeamOverload {
    pub fn new(team: impl Into<String>, capacity: usize, job: Job) -> Self {
        Self {
            team: team.into(),
            capacity,
            job,
        }
    }

    pub fn team(&self) -> &str {
        &self.team
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn into_job(self) -> Job {
        self.job
    }
}

pub trait Team: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn assign_job(&self, job: Job) -> std::result::Result<(), TeamOverload>;
}

thread_local! {
    static DISPATCH_QUEUE: RefCell<Option<VecDeque<(Arc<KernelCore>, ActivationSet)>>> =
        const { RefCell::new(None) };
}

/// Clears the dispatch queue when the draining frame exits.
struct Draining;

impl Drop for Draining {
    fn drop(&mut self) {
        let _ = DISPATCH_QUEUE.try_with(|queue| *queue.borrow_mut() = None);
    }
}

/// Hand `set` to its teams. If this thread is already draining, `set` runs
/// after the current one.
pub(crate) fn dispatch(core: &Arc<KernelCore>, set: ActivationSet) {
    if set.is_empty() {
        return;
    }
    let first = DISPATCH_QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        match queue.as_mut() {
            Some(pending) => {
                pending.push_back((core.clone(), set));
                None
            }
            None => {
                *queue = Some(VecDeque::new());
                Some((core.clone(), set))
            }
        }
    });

    let Some(first) = first else {
        return;
    };
    let _draining = Draining;

    let mut next = Some(first);
    while let Some((core, set)) = next {
        assign(&core, set);
        next = DISPATCH_QUEUE.with(|queue| queue.borrow_mut().as_mut().and_then(VecDeque::pop_front));
    }
}

fn assign(core: &Arc<KernelCore>, set: ActivationSet) {
    let (activations, aborts) = set.into_parts();

    let mut follow_up = ActivationSet::new();
    for thread in aborts {
        let mut inner = thread.thread_lock();
        thread.abort(&mut inner, &mut follow_up);
    }

    let office = core.office();
    for activation in activations {
        let team = office.team(office.job(activation.node.job()).team).clone();
        if let Err(overload) = team.assign_job(Job::new(activation)) {
            core.counters.team_overloads.inc();
            tracing::warn!(
                "team_overloaded: team={}, capacity={}, running inline",
                overload.team(),
                overload.capacity()
            );
            let (core, set) = overload.into_job().execute();
            dispatch(&core, set);
        }
    }

    dispatch(core, follow_up);
}

/// Runs jobs on the assigning thread.
#[derive(Debug, Clone)]
pub struct PassiveTeam {
    name: String,
}

impl PassiveTeam {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Team for PassiveTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_job(&self, job: Job) -> std::result::Result<(), TeamOverload> {
        job.run();
        Ok(())
    }
}

/// Runs jobs on tokio's blocking pool, at most `capacity` at a time.
#[derive(Debug)]
pub struct WorkerTeam {
    name: String,
    capacity: usize,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

impl WorkerTeam {
    /// Team on the current tokio runtime.
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let name = name.into();
        let runtime = Handle::try_current().map_err(|err| {
            Error::configuration(format!("worker team {} needs a tokio runtime: {}", name, err))
        })?;
        Ok(Self::with_handle(name, capacity, runtime))
    }

    pub fn with_handle(name: impl Into<String>, capacity: usize, runtime: Handle) -> Self {
        Self {
            name: name.into(),
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            runtime,
        }
    }

    pub fn from_config(name: impl Into<String>, config: &TeamConfig) -> Result<Self> {
        Self::new(name, config.worker_capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held by a running job.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Team for WorkerTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn assign_job(&self, job: Job) -> std::result::Result<(), TeamOverload> {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(TeamOverload::new(self.name.clone(), self.capacity, job)),
        };
        self.runtime.spawn_blocking(move || {
            let (core, set) = job.execute();
            // Free the slot first so the next job of this sequence can take it.
            drop(permit);
            dispatch(&core, set);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_team_requires_runtime() {
        let err = WorkerTeam::new("workers", 2).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_worker_team_from_config() {
        let team = WorkerTeam::from_config("workers", &TeamConfig { worker_capacity: 3 }).unwrap();
        assert_eq!(team.name(), "workers");
        assert_eq!(team.capacity(), 3);
        assert_eq!(team.available(), 3);
    }
}
