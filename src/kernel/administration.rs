//! Administration duties.
//!
//! An administrator wraps a job with a `Pre` duty (before the job function)
//! and a `Post` duty (after it succeeds), operating on the managed objects it
//! was configured for. Each thread keeps one [`AdministratorContainer`] per
//! administrator, lazily created, holding state that survives between duties
//! of the same thread.

use std::any::Any;
use std::fmt;

use super::escalation::Failure;
use super::job::Value;
use super::managed_object::ManagedObject;
use super::metadata::{AdministratorIndex, AdministratorMetaData};
use super::recovery::with_recovery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Duty {
    Pre,
    Post,
}

impl fmt::Display for Duty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Duty::Pre => write!(f, "pre"),
            Duty::Post => write!(f, "post"),
        }
    }
}

pub trait AdministratorSource: Send + Sync + fmt::Debug {
    fn administer(&self, duty: Duty, context: &mut AdministrationContext<'_>) -> Result<(), Failure>;
}

/// What an administrator sees during one duty.
#[derive(Debug)]
pub struct AdministrationContext<'a> {
    job: &'a str,
    objects: &'a [ManagedObject],
    state: &'a mut Option<Value>,
}

impl<'a> AdministrationContext<'a> {
    /// Name of the job being administered.
    pub fn job_name(&self) -> &str {
        self.job
    }

    pub fn objects(&self) -> &[ManagedObject] {
        self.objects
    }

    pub fn object_as<T: Any>(&self, index: usize) -> Option<&T> {
        self.objects.get(index).and_then(|o| o.downcast_ref::<T>())
    }

    /// Per-thread state carried between duties.
    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    pub fn set_state(&mut self, value: Value) {
        *self.state = Some(value);
    }

    pub fn take_state(&mut self) -> Option<Value> {
        self.state.take()
    }
}

#[derive(Debug)]
pub struct AdministratorContainer {
    index: AdministratorIndex,
    state: Option<Value>,
    duties: u64,
}

impl AdministratorContainer {
    pub(crate) fn new(index: AdministratorIndex) -> Self {
        Self {
            index,
            state: None,
            duties: 0,
        }
    }

    pub fn index(&self) -> AdministratorIndex {
        self.index
    }

    /// Duties performed so far in this thread.
    pub fn duties(&self) -> u64 {
        self.duties
    }

    pub(crate) fn administer(
        &mut self,
        meta: &AdministratorMetaData,
        duty: Duty,
        job: &str,
        objects: &[ManagedObject],
    ) -> Result<(), Failure> {
        self.duties += 1;
        let mut context = AdministrationContext {
            job,
            objects,
            state: &mut self.state,
        };
        tracing::trace!("administer: administrator={}, duty={}, job={}", meta.name, duty, job);
        with_recovery(|| meta.source.administer(duty, &mut context), &meta.name)
    }

    pub(crate) fn unload(&mut self) {
        self.state = None;
    }
}
