//! Office metadata.
//!
//! [`OfficeBuilder`] collects named configuration (teams, managed objects,
//! administrators, jobs, flows, escalation tables), resolves every name to an
//! index and validates the graph once. The resulting [`OfficeMetaData`] is
//! immutable and shared by every process the kernel runs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::administration::AdministratorSource;
use super::escalation::{EscalationTable, Failure, FailureMatcher};
use super::job::JobContext;
use super::managed_object::{ManagedObjectPool, ManagedObjectSource};
use super::team::Team;
use crate::types::{Error, Result};

/// Scope a managed object is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagedObjectScope {
    Process,
    Thread,
}

/// Position of a managed object within its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagedObjectIndex {
    pub scope: ManagedObjectScope,
    pub index: usize,
}

macro_rules! define_index {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            pub(crate) fn new(index: usize) -> Self {
                Self(index)
            }

            pub fn get(self) -> usize {
                self.0
            }
        }
    };
}

define_index!(FlowIndex);
define_index!(JobIndex);
define_index!(TeamIndex);
define_index!(AdministratorIndex);

/// Function run by a job.
pub type JobFn = Arc<dyn Fn(&mut JobContext<'_>) -> std::result::Result<(), Failure> + Send + Sync>;

pub struct ManagedObjectMetaData {
    pub name: String,
    pub index: ManagedObjectIndex,
    pub source: Arc<dyn ManagedObjectSource>,
    /// Supplied by whoever invokes the process rather than sourced.
    pub input: bool,
    pub dependencies: Vec<ManagedObjectIndex>,
    pub pool: Option<Arc<dyn ManagedObjectPool>>,
    /// Sourcing timeout; the kernel default applies when unset.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for ManagedObjectMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObjectMetaData")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("input", &self.input)
            .field("dependencies", &self.dependencies)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct AdministratorMetaData {
    pub name: String,
    pub index: AdministratorIndex,
    pub source: Arc<dyn AdministratorSource>,
    pub objects: Vec<ManagedObjectIndex>,
}

pub struct JobMetaData {
    pub name: String,
    pub index: JobIndex,
    pub team: TeamIndex,
    pub function: JobFn,
    pub objects: Vec<ManagedObjectIndex>,
    pub flows: Vec<FlowIndex>,
    pub administration: Vec<AdministratorIndex>,
    /// Every object the job and its administrators need, dependencies first.
    pub load_order: Vec<ManagedObjectIndex>,
}

impl fmt::Debug for JobMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobMetaData")
            .field("name", &self.name)
            .field("team", &self.team)
            .field("objects", &self.objects)
            .field("flows", &self.flows)
            .field("administration", &self.administration)
            .finish()
    }
}

#[derive(Debug)]
pub struct FlowMetaData {
    pub name: String,
    pub index: FlowIndex,
    pub jobs: Vec<JobIndex>,
    pub escalations: EscalationTable,
}

#[derive(Debug, Default)]
pub struct ThreadMetaData {
    pub managed_objects: Vec<Arc<ManagedObjectMetaData>>,
    pub administrators: Vec<Arc<AdministratorMetaData>>,
    pub escalations: EscalationTable,
}

#[derive(Debug, Default)]
pub struct ProcessMetaData {
    pub managed_objects: Vec<Arc<ManagedObjectMetaData>>,
    pub escalations: EscalationTable,
}

/// A distinct managed object source and the input slots bound to it.
#[derive(Debug, Clone)]
pub struct SourceBinding {
    pub name: String,
    pub source: Arc<dyn ManagedObjectSource>,
    pub input_slot: Option<usize>,
}

/// Immutable, validated description of an office.
#[derive(Debug)]
pub struct OfficeMetaData {
    pub name: String,
    pub teams: Vec<Arc<dyn Team>>,
    pub process: ProcessMetaData,
    pub thread: ThreadMetaData,
    pub jobs: Vec<JobMetaData>,
    pub flows: Vec<FlowMetaData>,
    pub sources: Vec<SourceBinding>,
}

impl OfficeMetaData {
    pub fn flow_by_name(&self, name: &str) -> Option<FlowIndex> {
        self.flows.iter().find(|f| f.name == name).map(|f| f.index)
    }

    pub fn flow(&self, index: FlowIndex) -> &FlowMetaData {
        &self.flows[index.0]
    }

    pub fn job(&self, index: JobIndex) -> &JobMetaData {
        &self.jobs[index.0]
    }

    pub fn team(&self, index: TeamIndex) -> &Arc<dyn Team> {
        &self.teams[index.0]
    }

    pub fn managed_object(&self, index: ManagedObjectIndex) -> &Arc<ManagedObjectMetaData> {
        match index.scope {
            ManagedObjectScope::Process => &self.process.managed_objects[index.index],
            ManagedObjectScope::Thread => &self.thread.managed_objects[index.index],
        }
    }

    pub fn administrator(&self, index: AdministratorIndex) -> &Arc<AdministratorMetaData> {
        &self.thread.administrators[index.0]
    }

    /// Process slot of the input object with this name.
    pub fn input_slot(&self, name: &str) -> Option<usize> {
        self.process
            .managed_objects
            .iter()
            .find(|mo| mo.input && mo.name == name)
            .map(|mo| mo.index.index)
    }
}

fn same_source(a: &Arc<dyn ManagedObjectSource>, b: &Arc<dyn ManagedObjectSource>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Binding of a named managed object.
#[derive(Debug)]
pub struct ManagedObjectConfig {
    name: String,
    source: Arc<dyn ManagedObjectSource>,
    input: bool,
    dependencies: Vec<String>,
    pool: Option<Arc<dyn ManagedObjectPool>>,
    timeout: Option<Duration>,
}

impl ManagedObjectConfig {
    /// An object the kernel sources from `source` on first use.
    pub fn new(name: impl Into<String>, source: Arc<dyn ManagedObjectSource>) -> Self {
        Self {
            name: name.into(),
            source,
            input: false,
            dependencies: Vec::new(),
            pool: None,
            timeout: None,
        }
    }

    /// An object handed in by `source` when it invokes a process.
    pub fn input(name: impl Into<String>, source: Arc<dyn ManagedObjectSource>) -> Self {
        Self {
            input: true,
            ..Self::new(name, source)
        }
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn pooled(mut self, pool: Arc<dyn ManagedObjectPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug)]
pub struct AdministratorConfig {
    name: String,
    source: Arc<dyn AdministratorSource>,
    objects: Vec<String>,
}

impl AdministratorConfig {
    pub fn new(name: impl Into<String>, source: Arc<dyn AdministratorSource>) -> Self {
        Self {
            name: name.into(),
            source,
            objects: Vec::new(),
        }
    }

    pub fn administers(mut self, managed_object: impl Into<String>) -> Self {
        self.objects.push(managed_object.into());
        self
    }
}

pub struct JobConfig {
    name: String,
    function: JobFn,
    team: Option<String>,
    objects: Vec<String>,
    flows: Vec<String>,
    administration: Vec<String>,
}

impl fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobConfig")
            .field("name", &self.name)
            .field("team", &self.team)
            .field("objects", &self.objects)
            .field("flows", &self.flows)
            .finish_non_exhaustive()
    }
}

impl JobConfig {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut JobContext<'_>) -> std::result::Result<(), Failure> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            function: Arc::new(function),
            team: None,
            objects: Vec::new(),
            flows: Vec::new(),
            administration: Vec::new(),
        }
    }

    /// Team the job is assigned to; the first registered team otherwise.
    pub fn team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Managed object available to the job at the next object index.
    pub fn uses(mut self, managed_object: impl Into<String>) -> Self {
        self.objects.push(managed_object.into());
        self
    }

    /// Flow the job may invoke, at the next flow index.
    pub fn flow(mut self, flow: impl Into<String>) -> Self {
        self.flows.push(flow.into());
        self
    }

    pub fn administered_by(mut self, administrator: impl Into<String>) -> Self {
        self.administration.push(administrator.into());
        self
    }
}

#[derive(Debug)]
pub struct FlowConfig {
    name: String,
    jobs: Vec<String>,
    escalations: Vec<(FailureMatcher, String)>,
}

impl FlowConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
            escalations: Vec::new(),
        }
    }

    pub fn job(mut self, job: impl Into<String>) -> Self {
        self.jobs.push(job.into());
        self
    }

    pub fn jobs<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.jobs.extend(jobs.into_iter().map(Into::into));
        self
    }

    pub fn on_escalation(mut self, matcher: FailureMatcher, handler: impl Into<String>) -> Self {
        self.escalations.push((matcher, handler.into()));
        self
    }
}

/// Collects office configuration and validates it into [`OfficeMetaData`].
#[derive(Debug)]
pub struct OfficeBuilder {
    name: String,
    teams: Vec<(String, Arc<dyn Team>)>,
    process_objects: Vec<ManagedObjectConfig>,
    thread_objects: Vec<ManagedObjectConfig>,
    administrators: Vec<AdministratorConfig>,
    jobs: Vec<JobConfig>,
    flows: Vec<FlowConfig>,
    thread_escalations: Vec<(FailureMatcher, String)>,
    process_escalations: Vec<(FailureMatcher, String)>,
}

struct Slot {
    config: ManagedObjectConfig,
}

impl OfficeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            teams: Vec::new(),
            process_objects: Vec::new(),
            thread_objects: Vec::new(),
            administrators: Vec::new(),
            jobs: Vec::new(),
            flows: Vec::new(),
            thread_escalations: Vec::new(),
            process_escalations: Vec::new(),
        }
    }

    pub fn team(mut self, name: impl Into<String>, team: Arc<dyn Team>) -> Self {
        self.teams.push((name.into(), team));
        self
    }

    pub fn process_object(mut self, config: ManagedObjectConfig) -> Self {
        self.process_objects.push(config);
        self
    }

    pub fn thread_object(mut self, config: ManagedObjectConfig) -> Self {
        self.thread_objects.push(config);
        self
    }

    pub fn administrator(mut self, config: AdministratorConfig) -> Self {
        self.administrators.push(config);
        self
    }

    pub fn job(mut self, config: JobConfig) -> Self {
        self.jobs.push(config);
        self
    }

    pub fn flow(mut self, config: FlowConfig) -> Self {
        self.flows.push(config);
        self
    }

    pub fn thread_escalation(mut self, matcher: FailureMatcher, handler: impl Into<String>) -> Self {
        self.thread_escalations.push((matcher, handler.into()));
        self
    }

    pub fn process_escalation(mut self, matcher: FailureMatcher, handler: impl Into<String>) -> Self {
        self.process_escalations.push((matcher, handler.into()));
        self
    }

    /// Resolve and validate. Every configuration problem is reported here,
    /// before any job can run.
    pub fn build(self) -> Result<OfficeMetaData> {
        let OfficeBuilder {
            name,
            teams,
            process_objects,
            thread_objects,
            administrators,
            jobs,
            flows,
            thread_escalations,
            process_escalations,
        } = self;

        // Teams
        if teams.is_empty() {
            return Err(Error::configuration(format!("office {} has no team", name)));
        }
        let mut team_index = HashMap::new();
        for (i, (team_name, _)) in teams.iter().enumerate() {
            if team_index.insert(team_name.clone(), TeamIndex(i)).is_some() {
                return Err(Error::configuration(format!("duplicate team {}", team_name)));
            }
        }

        // Managed object names
        let process_slots = merge_process_objects(process_objects)?;
        let mut process_index: HashMap<String, usize> = HashMap::new();
        for (i, slot) in process_slots.iter().enumerate() {
            process_index.insert(slot.config.name.clone(), i);
        }
        let mut thread_index: HashMap<String, usize> = HashMap::new();
        for (i, config) in thread_objects.iter().enumerate() {
            if process_index.contains_key(&config.name) || thread_index.contains_key(&config.name) {
                return Err(Error::configuration(format!(
                    "managed object {} is bound more than once",
                    config.name
                )));
            }
            if config.input {
                return Err(Error::configuration(format!(
                    "input managed object {} must be process scoped",
                    config.name
                )));
            }
            thread_index.insert(config.name.clone(), i);
        }

        let resolve_object = |object: &str| -> Option<ManagedObjectIndex> {
            if let Some(&index) = thread_index.get(object) {
                return Some(ManagedObjectIndex {
                    scope: ManagedObjectScope::Thread,
                    index,
                });
            }
            process_index.get(object).map(|&index| ManagedObjectIndex {
                scope: ManagedObjectScope::Process,
                index,
            })
        };

        // Dependencies
        let mut process_mos = Vec::with_capacity(process_slots.len());
        for (i, slot) in process_slots.into_iter().enumerate() {
            let mut dependencies = Vec::new();
            for dependency in &slot.config.dependencies {
                match resolve_object(dependency) {
                    Some(index) if index.scope == ManagedObjectScope::Thread => {
                        return Err(Error::configuration(format!(
                            "process managed object {} cannot depend on thread managed object {}",
                            slot.config.name, dependency
                        )));
                    }
                    Some(index) => dependencies.push(index),
                    None => return Err(unresolved("dependency", dependency, &slot.config.name)),
                }
            }
            process_mos.push(Arc::new(into_meta(
                slot.config,
                ManagedObjectIndex {
                    scope: ManagedObjectScope::Process,
                    index: i,
                },
                dependencies,
            )));
        }

        let mut thread_mos = Vec::with_capacity(thread_objects.len());
        for (i, config) in thread_objects.into_iter().enumerate() {
            let mut dependencies = Vec::new();
            for dependency in &config.dependencies {
                match resolve_object(dependency) {
                    Some(index) => dependencies.push(index),
                    None => return Err(unresolved("dependency", dependency, &config.name)),
                }
            }
            thread_mos.push(Arc::new(into_meta(
                config,
                ManagedObjectIndex {
                    scope: ManagedObjectScope::Thread,
                    index: i,
                },
                dependencies,
            )));
        }

        let graph = DependencyGraph {
            process: &process_mos,
            thread: &thread_mos,
        };
        graph.check_acyclic()?;

        // Flow names first: jobs refer to them.
        let mut flow_index = HashMap::new();
        for (i, flow) in flows.iter().enumerate() {
            if flow_index.insert(flow.name.clone(), FlowIndex(i)).is_some() {
                return Err(Error::configuration(format!("duplicate flow {}", flow.name)));
            }
        }
        let resolve_flow = |flow: &str, referrer: &str| -> Result<FlowIndex> {
            flow_index
                .get(flow)
                .copied()
                .ok_or_else(|| unresolved("flow", flow, referrer))
        };

        // Administrators
        let mut admin_index = HashMap::new();
        let mut admin_metas = Vec::with_capacity(administrators.len());
        for (i, admin) in administrators.into_iter().enumerate() {
            if admin_index.insert(admin.name.clone(), AdministratorIndex(i)).is_some() {
                return Err(Error::configuration(format!(
                    "duplicate administrator {}",
                    admin.name
                )));
            }
            let mut objects = Vec::with_capacity(admin.objects.len());
            for object in &admin.objects {
                objects.push(resolve_object(object).ok_or_else(|| unresolved("managed object", object, &admin.name))?);
            }
            admin_metas.push(Arc::new(AdministratorMetaData {
                name: admin.name,
                index: AdministratorIndex(i),
                source: admin.source,
                objects,
            }));
        }

        // Jobs
        let mut job_index = HashMap::new();
        let mut job_metas = Vec::with_capacity(jobs.len());
        for (i, job) in jobs.into_iter().enumerate() {
            if job_index.insert(job.name.clone(), JobIndex(i)).is_some() {
                return Err(Error::configuration(format!("duplicate job {}", job.name)));
            }
            let team = match &job.team {
                Some(team) => *team_index
                    .get(team)
                    .ok_or_else(|| unresolved("team", team, &job.name))?,
                None => TeamIndex(0),
            };
            let mut objects = Vec::with_capacity(job.objects.len());
            for object in &job.objects {
                objects.push(resolve_object(object).ok_or_else(|| unresolved("managed object", object, &job.name))?);
            }
            let mut job_flows = Vec::with_capacity(job.flows.len());
            for flow in &job.flows {
                job_flows.push(resolve_flow(flow, &job.name)?);
            }
            let mut administration = Vec::with_capacity(job.administration.len());
            for admin in &job.administration {
                administration.push(
                    *admin_index
                        .get(admin)
                        .ok_or_else(|| unresolved("administrator", admin, &job.name))?,
                );
            }

            let mut roots = objects.clone();
            for admin in &administration {
                roots.extend(admin_metas[admin.0].objects.iter().copied());
            }
            let load_order = graph.load_order(&roots);

            job_metas.push(JobMetaData {
                name: job.name,
                index: JobIndex(i),
                team,
                function: job.function,
                objects,
                flows: job_flows,
                administration,
                load_order,
            });
        }

        // Flows
        let mut flow_metas = Vec::with_capacity(flows.len());
        for (i, flow) in flows.into_iter().enumerate() {
            if flow.jobs.is_empty() {
                return Err(Error::configuration(format!("flow {} has no jobs", flow.name)));
            }
            let mut flow_jobs = Vec::with_capacity(flow.jobs.len());
            for job in &flow.jobs {
                flow_jobs.push(
                    *job_index
                        .get(job)
                        .ok_or_else(|| unresolved("job", job, &flow.name))?,
                );
            }
            let mut escalations = EscalationTable::new();
            for (matcher, handler) in flow.escalations {
                escalations.push(matcher, resolve_flow(&handler, &flow.name)?);
            }
            flow_metas.push(FlowMetaData {
                name: flow.name,
                index: FlowIndex(i),
                jobs: flow_jobs,
                escalations,
            });
        }

        let mut thread_table = EscalationTable::new();
        for (matcher, handler) in thread_escalations {
            thread_table.push(matcher, resolve_flow(&handler, "thread escalations")?);
        }
        let mut process_table = EscalationTable::new();
        for (matcher, handler) in process_escalations {
            process_table.push(matcher, resolve_flow(&handler, "process escalations")?);
        }

        let sources = collect_sources(&process_mos, &thread_mos)?;

        tracing::debug!(
            "office_built: name={}, flows={}, jobs={}, process_objects={}, thread_objects={}",
            name,
            flow_metas.len(),
            job_metas.len(),
            process_mos.len(),
            thread_mos.len()
        );

        Ok(OfficeMetaData {
            name,
            teams: teams.into_iter().map(|(_, team)| team).collect(),
            process: ProcessMetaData {
                managed_objects: process_mos,
                escalations: process_table,
            },
            thread: ThreadMetaData {
                managed_objects: thread_mos,
                administrators: admin_metas,
                escalations: thread_table,
            },
            jobs: job_metas,
            flows: flow_metas,
            sources,
        })
    }
}

fn unresolved(what: &str, name: &str, referrer: &str) -> Error {
    Error::configuration(format!("unresolved {} {} referenced by {}", what, name, referrer))
}

fn into_meta(
    config: ManagedObjectConfig,
    index: ManagedObjectIndex,
    dependencies: Vec<ManagedObjectIndex>,
) -> ManagedObjectMetaData {
    ManagedObjectMetaData {
        name: config.name,
        index,
        source: config.source,
        input: config.input,
        dependencies,
        pool: config.pool,
        timeout: config.timeout,
    }
}

/// Merge input and sourced bindings of the same name that share a source.
fn merge_process_objects(configs: Vec<ManagedObjectConfig>) -> Result<Vec<Slot>> {
    let mut slots: Vec<Slot> = Vec::with_capacity(configs.len());
    for config in configs {
        match slots.iter_mut().find(|s| s.config.name == config.name) {
            None => slots.push(Slot { config }),
            Some(existing)
                if existing.config.input != config.input
                    && same_source(&existing.config.source, &config.source) =>
            {
                existing.config.input = true;
                existing.config.dependencies.extend(config.dependencies);
                if existing.config.pool.is_none() {
                    existing.config.pool = config.pool;
                }
                if existing.config.timeout.is_none() {
                    existing.config.timeout = config.timeout;
                }
            }
            Some(_) => {
                return Err(Error::configuration(format!(
                    "managed object {} is bound more than once",
                    config.name
                )));
            }
        }
    }
    Ok(slots)
}

fn collect_sources(
    process: &[Arc<ManagedObjectMetaData>],
    thread: &[Arc<ManagedObjectMetaData>],
) -> Result<Vec<SourceBinding>> {
    let mut sources: Vec<SourceBinding> = Vec::new();
    for mo in process.iter().chain(thread.iter()) {
        let input_slot = mo.input.then_some(mo.index.index);
        match sources.iter_mut().find(|b| same_source(&b.source, &mo.source)) {
            None => sources.push(SourceBinding {
                name: mo.name.clone(),
                source: mo.source.clone(),
                input_slot,
            }),
            Some(binding) => match (binding.input_slot, input_slot) {
                (Some(_), Some(_)) => {
                    return Err(Error::configuration(format!(
                        "source of {} is bound as input to more than one managed object",
                        mo.name
                    )));
                }
                (None, Some(slot)) => {
                    binding.input_slot = Some(slot);
                    binding.name = mo.name.clone();
                }
                _ => {}
            },
        }
    }
    Ok(sources)
}

struct DependencyGraph<'a> {
    process: &'a [Arc<ManagedObjectMetaData>],
    thread: &'a [Arc<ManagedObjectMetaData>],
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DependencyGraph<'_> {
    fn get(&self, index: ManagedObjectIndex) -> &ManagedObjectMetaData {
        match index.scope {
            ManagedObjectScope::Process => &self.process[index.index],
            ManagedObjectScope::Thread => &self.thread[index.index],
        }
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut marks = HashMap::new();
        for mo in self.process.iter().chain(self.thread.iter()) {
            self.visit(mo.index, &mut marks)?;
        }
        Ok(())
    }

    fn visit(&self, index: ManagedObjectIndex, marks: &mut HashMap<ManagedObjectIndex, Mark>) -> Result<()> {
        match marks.get(&index) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(Error::configuration(format!(
                    "dependency cycle through managed object {}",
                    self.get(index).name
                )));
            }
            None => {}
        }
        marks.insert(index, Mark::Visiting);
        for dependency in &self.get(index).dependencies {
            self.visit(*dependency, marks)?;
        }
        marks.insert(index, Mark::Done);
        Ok(())
    }

    /// Dependencies-first order over `roots` and everything they reach.
    fn load_order(&self, roots: &[ManagedObjectIndex]) -> Vec<ManagedObjectIndex> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        for root in roots {
            self.collect(*root, &mut seen, &mut order);
        }
        order
    }

    fn collect(
        &self,
        index: ManagedObjectIndex,
        seen: &mut HashSet<ManagedObjectIndex>,
        order: &mut Vec<ManagedObjectIndex>,
    ) {
        if !seen.insert(index) {
            return;
        }
        for dependency in &self.get(index).dependencies {
            self.collect(*dependency, seen, order);
        }
        order.push(index);
    }
}
