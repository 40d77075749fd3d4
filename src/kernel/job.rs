//! Job nodes and their execution.
//!
//! A [`JobNode`] is one position in a job sequence of a thread. Executing it
//! loads the job's managed objects (parking the node if one is still being
//! sourced), runs pre-administration, the job function and post-administration,
//! then either activates the next node of the sequence or completes it.
//! Every failure along the way goes to the thread's escalation procedure.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::administration::Duty;
use super::asset::{Activation, ActivationSet, WaitToken};
use super::escalation::{EscalationFloor, Failure};
use super::list::EntryId;
use super::managed_object::{LoadStatus, ManagedObject};
use super::metadata::{
    FlowIndex, JobIndex, JobMetaData, ManagedObjectIndex, ManagedObjectScope, OfficeMetaData,
};
use super::recovery::with_recovery;
use super::thread::{ThreadInner, ThreadState};
use super::KernelCore;
use crate::types::{JobNodeId, ProcessId, ThreadId};

/// Opaque value passed between jobs (parameters, managed objects, failures).
pub type Value = Arc<dyn Any + Send + Sync>;

pub struct JobNode {
    id: JobNodeId,
    thread: Arc<ThreadState>,
    sequence: EntryId,
    flow: FlowIndex,
    position: usize,
    job: JobIndex,
    parameter: Option<Value>,
}

impl fmt::Debug for JobNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobNode")
            .field("id", &self.id)
            .field("thread", self.thread.id())
            .field("flow", &self.flow)
            .field("position", &self.position)
            .field("job", &self.job)
            .finish()
    }
}

impl JobNode {
    pub(crate) fn new(
        thread: Arc<ThreadState>,
        sequence: EntryId,
        flow: FlowIndex,
        position: usize,
        job: JobIndex,
        parameter: Option<Value>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: JobNodeId::next(),
            thread,
            sequence,
            flow,
            position,
            job,
            parameter,
        })
    }

    pub fn id(&self) -> JobNodeId {
        self.id
    }

    pub fn thread(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    pub(crate) fn sequence(&self) -> EntryId {
        self.sequence
    }

    pub fn flow(&self) -> FlowIndex {
        self.flow
    }

    pub fn job(&self) -> JobIndex {
        self.job
    }

    pub fn job_name(&self) -> &str {
        &self.thread.process().office().job(self.job).name
    }

    pub fn parameter(&self) -> Option<&Value> {
        self.parameter.as_ref()
    }

    /// Node bound to a fresh, unregistered thread; never executed.
    #[cfg(test)]
    pub(crate) fn detached() -> Arc<Self> {
        use super::escalation::LoggingEscalationHandler;
        use super::metadata::{FlowConfig, JobConfig, OfficeBuilder};
        use super::process::ProcessState;
        use super::team::PassiveTeam;
        use crate::types::Config;

        let office = OfficeBuilder::new("detached")
            .team("passive", Arc::new(PassiveTeam::new("passive")))
            .job(JobConfig::new("noop", |_| Ok(())))
            .flow(FlowConfig::new("noop").job("noop"))
            .build()
            .unwrap();
        let core = KernelCore::new(office, Config::default(), Arc::new(LoggingEscalationHandler));
        let process = ProcessState::new(core, None).unwrap();
        let thread = ThreadState::new(process);
        Self::new(thread, EntryId::dangling(), FlowIndex::new(0), 0, JobIndex::new(0), None)
    }
}

/// Handle to another thread (or this one), used to join on its completion.
#[derive(Debug, Clone)]
pub struct FlowHandle {
    thread: Arc<ThreadState>,
}

impl FlowHandle {
    pub fn thread_id(&self) -> &ThreadId {
        self.thread.id()
    }

    pub fn is_complete(&self) -> bool {
        self.thread.is_complete()
    }
}

#[derive(Debug)]
struct Join {
    target: Arc<ThreadState>,
    timeout: Option<Duration>,
    token: WaitToken,
}

/// What a job asked for, applied once it returned successfully.
#[derive(Debug, Default)]
struct JobActions {
    flows: Vec<(FlowIndex, Option<Value>)>,
    join: Option<Join>,
    next_parameter: Option<Value>,
}

/// The job function's view of the kernel.
pub struct JobContext<'a> {
    node: &'a Arc<JobNode>,
    meta: &'a JobMetaData,
    thread: &'a Arc<ThreadState>,
    objects: &'a [ManagedObject],
    set: &'a mut ActivationSet,
    actions: JobActions,
}

impl fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("node", &self.node.id())
            .field("job", &self.meta.name)
            .field("objects", &self.objects.len())
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}

impl<'a> JobContext<'a> {
    fn new(
        node: &'a Arc<JobNode>,
        meta: &'a JobMetaData,
        thread: &'a Arc<ThreadState>,
        objects: &'a [ManagedObject],
        set: &'a mut ActivationSet,
    ) -> Self {
        Self {
            node,
            meta,
            thread,
            objects,
            set,
            actions: JobActions::default(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.meta.name
    }

    pub fn node_id(&self) -> JobNodeId {
        self.node.id
    }

    pub fn thread_id(&self) -> &ThreadId {
        self.thread.id()
    }

    pub fn process_id(&self) -> &ProcessId {
        self.thread.process().id()
    }

    pub fn parameter(&self) -> Option<&Value> {
        self.node.parameter.as_ref()
    }

    pub fn parameter_as<T: Any>(&self) -> Option<&T> {
        self.node.parameter.as_deref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Managed object at `index` of the job's configured objects.
    pub fn object(&self, index: usize) -> Result<&ManagedObject, Failure> {
        self.objects.get(index).ok_or_else(|| {
            Failure::new(
                "kernel.invalid_object",
                format!("job {} has no managed object {}", self.meta.name, index),
            )
        })
    }

    pub fn object_as<T: Any>(&self, index: usize) -> Result<&T, Failure> {
        self.object(index)?.downcast_ref::<T>().ok_or_else(|| {
            Failure::new(
                "kernel.object_type",
                format!("managed object {} of job {} has another type", index, self.meta.name),
            )
        })
    }

    fn flow_index(&self, index: usize) -> Result<FlowIndex, Failure> {
        self.meta.flows.get(index).copied().ok_or_else(|| {
            Failure::new(
                "kernel.invalid_flow",
                format!("job {} has no flow {}", self.meta.name, index),
            )
        })
    }

    /// Invoke the job's flow `index` in this thread once the job returns.
    pub fn invoke_flow(&mut self, index: usize, parameter: Option<Value>) -> Result<(), Failure> {
        let flow = self.flow_index(index)?;
        self.actions.flows.push((flow, parameter));
        Ok(())
    }

    /// Start the job's flow `index` in a new thread of this process, now.
    pub fn spawn_thread(&mut self, index: usize, parameter: Option<Value>) -> Result<FlowHandle, Failure> {
        let flow = self.flow_index(index)?;
        let thread = self
            .thread
            .process()
            .create_thread(flow, parameter, EscalationFloor::Thread, self.set)
            .map_err(|err| Failure::new("kernel.spawn", err.to_string()))?;
        Ok(FlowHandle { thread })
    }

    /// Handle to the current thread.
    pub fn current_flow(&self) -> FlowHandle {
        FlowHandle {
            thread: self.thread.clone(),
        }
    }

    /// Hold the next job of this sequence until `handle`'s thread completes.
    /// With a timeout, the wait fails with a timeout failure carrying `token`.
    pub fn wait_on_flow(&mut self, handle: &FlowHandle, timeout: Option<Duration>, token: WaitToken) {
        self.actions.join = Some(Join {
            target: handle.thread.clone(),
            timeout,
            token,
        });
    }

    /// Parameter for the next job of this sequence (defaults to this job's).
    pub fn set_next_parameter(&mut self, value: Value) {
        self.actions.next_parameter = Some(value);
    }

    fn finish(self) -> JobActions {
        self.actions
    }
}

/// Run one activation under the thread lock. Returns whatever the execution
/// activated; the caller dispatches it once the lock is released.
pub(crate) fn execute(activation: Activation) -> (Arc<KernelCore>, ActivationSet) {
    let Activation { node, failure } = activation;
    let thread = node.thread.clone();
    let core = thread.process().core().clone();
    let mut set = ActivationSet::new();
    {
        let mut inner = thread.thread_lock();
        run(&thread, &mut inner, &core, &node, failure, &mut set);
    }
    (core, set)
}

fn run(
    thread: &Arc<ThreadState>,
    inner: &mut ThreadInner,
    core: &Arc<KernelCore>,
    node: &Arc<JobNode>,
    failure: Option<Failure>,
    set: &mut ActivationSet,
) {
    if inner.is_complete() || !inner.has_sequence(node.sequence) {
        tracing::trace!("stale_job_node: node={}, tid={}", node.id, thread.id());
        return;
    }
    if thread.process().is_terminated() {
        tracing::debug!("job_node_aborted: node={}, pid={}", node.id, thread.process().id());
        thread.abort(inner, set);
        return;
    }
    if let Some(failure) = failure {
        thread.escalate(inner, node, failure, set);
        return;
    }

    let office = core.office();
    let job = office.job(node.job);

    let loaded = match load_objects(thread, inner, core, node, job, set) {
        Ok(Some(loaded)) => loaded,
        Ok(None) => return,
        Err(failure) => {
            thread.escalate(inner, node, failure, set);
            return;
        }
    };

    if let Err(failure) = administer(inner, office, job, Duty::Pre, &loaded) {
        thread.escalate(inner, node, failure, set);
        return;
    }

    let objects: Vec<ManagedObject> = job
        .objects
        .iter()
        .filter_map(|index| loaded.get(index).cloned())
        .collect();
    let mut context = JobContext::new(node, job, thread, &objects, set);
    let result = with_recovery(|| (job.function)(&mut context), &job.name);
    let actions = context.finish();
    core.counters.jobs_executed.inc();

    if let Err(failure) = result {
        thread.escalate(inner, node, failure, set);
        return;
    }
    if let Err(failure) = administer(inner, office, job, Duty::Post, &loaded) {
        thread.escalate(inner, node, failure, set);
        return;
    }

    if !actions.flows.is_empty() {
        if let Some(record) = inner.sequence(node.sequence) {
            let enclosing = record.chain();
            let floor = record.floor;
            for (flow, parameter) in actions.flows {
                if let Err(err) =
                    thread.create_job_sequence(inner, flow, parameter, enclosing.clone(), floor, set)
                {
                    tracing::error!("invoke_flow_failed: node={}, error={}", node.id, err);
                }
            }
        }
    }

    match office.flow(node.flow).jobs.get(node.position + 1) {
        Some(next_job) => {
            let parameter = actions.next_parameter.or_else(|| node.parameter.clone());
            let next = JobNode::new(
                thread.clone(),
                node.sequence,
                node.flow,
                node.position + 1,
                *next_job,
                parameter,
            );
            match actions.join {
                Some(join) => {
                    join.target.wait_on_flow(&next, join.timeout, join.token, set);
                }
                None => set.push(next, None),
            }
        }
        None => {
            if actions.join.is_some() {
                tracing::debug!("join_without_next_job: node={}", node.id);
            }
            thread.sequence_complete(inner, node.sequence, set);
        }
    }
}

/// Load every object the job needs in dependency order. `Ok(None)` means the
/// node is parked on a container still being sourced.
fn load_objects(
    thread: &Arc<ThreadState>,
    inner: &mut ThreadInner,
    core: &Arc<KernelCore>,
    node: &Arc<JobNode>,
    job: &JobMetaData,
    set: &mut ActivationSet,
) -> Result<Option<HashMap<ManagedObjectIndex, ManagedObject>>, Failure> {
    let office = core.office();
    let mut loaded = HashMap::with_capacity(job.load_order.len());
    for index in &job.load_order {
        let meta = office.managed_object(*index);
        let dependencies: Vec<ManagedObject> = meta
            .dependencies
            .iter()
            .filter_map(|dependency| loaded.get(dependency).cloned())
            .collect();

        let status = match index.scope {
            ManagedObjectScope::Process => {
                thread
                    .process()
                    .load_managed_object(index.index, node, &dependencies, set)
            }
            ManagedObjectScope::Thread => match inner.managed_object_container(office, index.index) {
                Some(container) => container.load(node, &dependencies, core, set),
                None => LoadStatus::Failed(Failure::sourcing(
                    meta.name.clone(),
                    "no container for thread managed object",
                )),
            },
        };

        match status {
            LoadStatus::Ready(object) => {
                loaded.insert(*index, object);
            }
            LoadStatus::Waiting => {
                tracing::trace!("job_node_waiting: node={}, managed_object={}", node.id, meta.name);
                return Ok(None);
            }
            LoadStatus::Failed(failure) => return Err(failure),
        }
    }
    Ok(Some(loaded))
}

/// Run the job's administrators: in order for `Pre`, reversed for `Post`.
fn administer(
    inner: &mut ThreadInner,
    office: &OfficeMetaData,
    job: &JobMetaData,
    duty: Duty,
    loaded: &HashMap<ManagedObjectIndex, ManagedObject>,
) -> Result<(), Failure> {
    let mut order = job.administration.clone();
    if duty == Duty::Post {
        order.reverse();
    }
    for index in order {
        let meta = office.administrator(index);
        let objects: Vec<ManagedObject> = meta
            .objects
            .iter()
            .filter_map(|object| loaded.get(object).cloned())
            .collect();
        let container = inner.administrator_container(index).ok_or_else(|| {
            Failure::new(
                "kernel.invalid_administrator",
                format!("no container for administrator {}", meta.name),
            )
        })?;
        container.administer(meta, duty, &job.name, &objects)?;
    }
    Ok(())
}
