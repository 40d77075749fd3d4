//! Escalation procedure.
//!
//! A failing job produces a [`Failure`]. The kernel routes it to the nearest
//! handler by walking, in order:
//!
//! 1. the escalation tables of the failing job's flow and its enclosing flows
//!    (nearest first),
//! 2. the thread-level table,
//! 3. the process (office) table,
//! 4. the top-level [`TopLevelEscalationHandler`], which always exists.
//!
//! Tables are ordered lists of [`FailureMatcher`] → handler flow; the first
//! matching entry wins.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::asset::WaitToken;
use super::metadata::{FlowIndex, OfficeMetaData};
use crate::types::{JobNodeId, ProcessId};

/// Closed classification of runtime failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Raised by a job; the name is a dotted type path such as `"io.closed"`.
    Job(String),
    /// A wait exceeded its deadline.
    Timeout { token: WaitToken },
    /// A managed object could not be sourced.
    Sourcing { managed_object: String },
    /// A job, source or administrator panicked.
    Panic,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Job(name) => write!(f, "{}", name),
            FailureKind::Timeout { token } => write!(f, "timeout[{}]", token.0),
            FailureKind::Sourcing { managed_object } => write!(f, "sourcing[{}]", managed_object),
            FailureKind::Panic => write!(f, "panic"),
        }
    }
}

/// A failure travelling through the escalation procedure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct Failure {
    kind: FailureKind,
    message: String,
    job: Option<String>,
}

impl Failure {
    /// Application failure of the given type.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Job(type_name.into()),
            message: message.into(),
            job: None,
        }
    }

    pub fn timeout(token: WaitToken, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout { token },
            message: message.into(),
            job: None,
        }
    }

    pub fn sourcing(managed_object: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Sourcing {
                managed_object: managed_object.into(),
            },
            message: message.into(),
            job: None,
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panic,
            message: message.into(),
            job: None,
        }
    }

    /// Attach the name of the job the failure surfaced in, unless already set.
    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        if self.job.is_none() {
            self.job = Some(job.into());
        }
        self
    }

    pub fn kind(&self) -> &FailureKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn job(&self) -> Option<&str> {
        self.job.as_deref()
    }

    /// Correlation token of a timeout failure.
    pub fn token(&self) -> Option<WaitToken> {
        match self.kind {
            FailureKind::Timeout { token } => Some(token),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout { .. })
    }
}

/// Selects the failures an escalation table entry handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureMatcher {
    /// Job failures of this type or any dotted sub-type (`"io"` covers `"io.closed"`).
    Job(String),
    AnyJob,
    Timeout,
    Sourcing,
    Panic,
    Any,
}

impl FailureMatcher {
    pub fn job(type_name: impl Into<String>) -> Self {
        Self::Job(type_name.into())
    }

    pub fn matches(&self, failure: &Failure) -> bool {
        match (self, &failure.kind) {
            (FailureMatcher::Any, _) => true,
            (FailureMatcher::AnyJob, FailureKind::Job(_)) => true,
            (FailureMatcher::Job(declared), FailureKind::Job(actual)) => is_assignable(actual, declared),
            (FailureMatcher::Timeout, FailureKind::Timeout { .. }) => true,
            (FailureMatcher::Sourcing, FailureKind::Sourcing { .. }) => true,
            (FailureMatcher::Panic, FailureKind::Panic) => true,
            _ => false,
        }
    }
}

fn is_assignable(actual: &str, declared: &str) -> bool {
    actual == declared
        || actual
            .strip_prefix(declared)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false)
}

/// One entry of an escalation table.
#[derive(Debug, Clone)]
pub struct EscalationEntry {
    pub matcher: FailureMatcher,
    pub handler: FlowIndex,
}

/// Ordered failure → handler flow table.
#[derive(Debug, Clone, Default)]
pub struct EscalationTable {
    entries: Vec<EscalationEntry>,
}

impl EscalationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, matcher: FailureMatcher, handler: FlowIndex) {
        self.entries.push(EscalationEntry { matcher, handler });
    }

    /// First handler whose matcher accepts the failure.
    pub fn find(&self, failure: &Failure) -> Option<FlowIndex> {
        self.entries
            .iter()
            .find(|entry| entry.matcher.matches(failure))
            .map(|entry| entry.handler)
    }

    pub fn entries(&self) -> &[EscalationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How far an escalation search has risen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationLevel {
    Flow,
    Thread,
    Process,
}

/// Lowest non-flow level a job sequence may escalate to.
///
/// Handler sequences start above the level that started them so a failing
/// handler never re-enters its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EscalationFloor {
    Thread,
    Process,
    TopLevel,
}

/// Transient record of one failure being routed.
#[derive(Debug, Clone)]
pub struct EscalationRecord {
    pub failure: Failure,
    pub origin: JobNodeId,
    pub scope: EscalationLevel,
}

impl EscalationRecord {
    pub fn new(failure: Failure, origin: JobNodeId) -> Self {
        Self {
            failure,
            origin,
            scope: EscalationLevel::Flow,
        }
    }
}

/// Where the handler for an escalation was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationResolution {
    /// Handler of the flow at `depth` in the enclosing chain (0 = own flow).
    Flow { handler: FlowIndex, depth: usize },
    Thread { handler: FlowIndex },
    Process { handler: FlowIndex },
    TopLevel,
}

/// Ordered handler lookup over one office's tables.
#[derive(Debug)]
pub struct EscalationProcedure<'a> {
    office: &'a OfficeMetaData,
}

impl<'a> EscalationProcedure<'a> {
    pub fn new(office: &'a OfficeMetaData) -> Self {
        Self { office }
    }

    /// Walk flow chain → thread → process, raising `record.scope` as the
    /// search climbs.
    pub fn resolve(
        &self,
        record: &mut EscalationRecord,
        chain: &[FlowIndex],
        floor: EscalationFloor,
    ) -> EscalationResolution {
        record.scope = EscalationLevel::Flow;
        for (depth, flow) in chain.iter().enumerate() {
            if let Some(handler) = self.office.flow(*flow).escalations.find(&record.failure) {
                return EscalationResolution::Flow { handler, depth };
            }
        }

        if floor <= EscalationFloor::Thread {
            record.scope = EscalationLevel::Thread;
            if let Some(handler) = self.office.thread.escalations.find(&record.failure) {
                return EscalationResolution::Thread { handler };
            }
        }

        if floor <= EscalationFloor::Process {
            record.scope = EscalationLevel::Process;
            if let Some(handler) = self.office.process.escalations.find(&record.failure) {
                return EscalationResolution::Process { handler };
            }
        }

        EscalationResolution::TopLevel
    }
}

/// Framework handler for failures no table handles.
///
/// Must not fail; panics are caught and logged by the kernel.
pub trait TopLevelEscalationHandler: Send + Sync + fmt::Debug {
    fn handle_escalation(&self, process: &ProcessId, failure: &Failure);
}

/// Default top-level handler: logs the failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEscalationHandler;

impl TopLevelEscalationHandler for LoggingEscalationHandler {
    fn handle_escalation(&self, process: &ProcessId, failure: &Failure) {
        tracing::error!(
            "unhandled_escalation: pid={}, job={}, failure={}",
            process,
            failure.job().unwrap_or("-"),
            failure
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::metadata::{FlowConfig, JobConfig, OfficeBuilder};
    use crate::kernel::team::PassiveTeam;
    use std::sync::Arc;

    fn office() -> OfficeMetaData {
        OfficeBuilder::new("escalation")
            .team("passive", Arc::new(PassiveTeam::new("passive")))
            .job(JobConfig::new("noop", |_| Ok(())))
            .flow(FlowConfig::new("outer").job("noop"))
            .flow(
                FlowConfig::new("inner")
                    .job("noop")
                    .on_escalation(FailureMatcher::job("io"), "flow_handler"),
            )
            .flow(FlowConfig::new("flow_handler").job("noop"))
            .flow(FlowConfig::new("outer_handler").job("noop"))
            .flow(FlowConfig::new("thread_handler").job("noop"))
            .flow(FlowConfig::new("process_handler").job("noop"))
            .thread_escalation(FailureMatcher::job("io"), "thread_handler")
            .thread_escalation(FailureMatcher::Timeout, "thread_handler")
            .process_escalation(FailureMatcher::AnyJob, "process_handler")
            .build()
            .unwrap()
    }

    fn index(office: &OfficeMetaData, name: &str) -> FlowIndex {
        office.flow_by_name(name).unwrap()
    }

    #[test]
    fn test_matcher_assignability() {
        let closed = Failure::new("io.closed", "socket closed");
        assert!(FailureMatcher::job("io").matches(&closed));
        assert!(FailureMatcher::job("io.closed").matches(&closed));
        assert!(!FailureMatcher::job("i").matches(&closed));
        assert!(!FailureMatcher::job("io.closed.late").matches(&closed));
        assert!(FailureMatcher::AnyJob.matches(&closed));
        assert!(!FailureMatcher::Timeout.matches(&closed));
        assert!(FailureMatcher::Any.matches(&Failure::panic("boom")));
    }

    #[test]
    fn test_table_first_match_wins() {
        let mut table = EscalationTable::new();
        table.push(FailureMatcher::job("io"), FlowIndex::new(1));
        table.push(FailureMatcher::AnyJob, FlowIndex::new(2));
        assert_eq!(table.find(&Failure::new("io.read", "x")), Some(FlowIndex::new(1)));
        assert_eq!(table.find(&Failure::new("db", "x")), Some(FlowIndex::new(2)));
        assert_eq!(table.find(&Failure::panic("x")), None);
    }

    #[test]
    fn test_flow_handler_beats_thread_handler() {
        let office = office();
        let procedure = EscalationProcedure::new(&office);
        let mut record = EscalationRecord::new(Failure::new("io", "E"), JobNodeId::next());
        let chain = [index(&office, "inner"), index(&office, "outer")];

        let resolution = procedure.resolve(&mut record, &chain, EscalationFloor::Thread);
        assert_eq!(
            resolution,
            EscalationResolution::Flow {
                handler: index(&office, "flow_handler"),
                depth: 0
            }
        );
        assert_eq!(record.scope, EscalationLevel::Flow);
    }

    #[test]
    fn test_enclosing_flow_searched_before_thread() {
        let office = office();
        let procedure = EscalationProcedure::new(&office);
        let mut record = EscalationRecord::new(Failure::new("io", "E"), JobNodeId::next());
        let chain = [index(&office, "outer"), index(&office, "inner")];

        let resolution = procedure.resolve(&mut record, &chain, EscalationFloor::Thread);
        assert!(matches!(resolution, EscalationResolution::Flow { depth: 1, .. }));
    }

    #[test]
    fn test_search_rises_through_levels() {
        let office = office();
        let procedure = EscalationProcedure::new(&office);
        let chain = [index(&office, "outer")];

        let mut timeout = EscalationRecord::new(
            Failure::timeout(WaitToken(3), "late"),
            JobNodeId::next(),
        );
        assert_eq!(
            procedure.resolve(&mut timeout, &chain, EscalationFloor::Thread),
            EscalationResolution::Thread {
                handler: index(&office, "thread_handler")
            }
        );
        assert_eq!(timeout.scope, EscalationLevel::Thread);

        let mut db = EscalationRecord::new(Failure::new("db", "down"), JobNodeId::next());
        assert_eq!(
            procedure.resolve(&mut db, &chain, EscalationFloor::Thread),
            EscalationResolution::Process {
                handler: index(&office, "process_handler")
            }
        );
        assert_eq!(db.scope, EscalationLevel::Process);

        let mut panic = EscalationRecord::new(Failure::panic("boom"), JobNodeId::next());
        assert_eq!(
            procedure.resolve(&mut panic, &chain, EscalationFloor::Thread),
            EscalationResolution::TopLevel
        );
    }

    #[test]
    fn test_floor_skips_levels() {
        let office = office();
        let procedure = EscalationProcedure::new(&office);
        let chain = [index(&office, "thread_handler")];

        let mut record = EscalationRecord::new(Failure::new("io", "again"), JobNodeId::next());
        assert_eq!(
            procedure.resolve(&mut record, &chain, EscalationFloor::Process),
            EscalationResolution::Process {
                handler: index(&office, "process_handler")
            }
        );

        let mut record = EscalationRecord::new(Failure::new("io", "again"), JobNodeId::next());
        assert_eq!(
            procedure.resolve(&mut record, &chain, EscalationFloor::TopLevel),
            EscalationResolution::TopLevel
        );
    }

    #[test]
    fn test_failure_accessors() {
        let failure = Failure::timeout(WaitToken(9), "late").with_job("first").with_job("second");
        assert_eq!(failure.token(), Some(WaitToken(9)));
        assert!(failure.is_timeout());
        assert_eq!(failure.job(), Some("first"));
        assert_eq!(failure.to_string(), "timeout[9]: late");
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_logging_handler_logs_unhandled_failure() {
        let failure = Failure::new("db.down", "connection refused").with_job("query");
        LoggingEscalationHandler.handle_escalation(&ProcessId::new(), &failure);
        assert!(logs_contain("unhandled_escalation"));
        assert!(logs_contain("job=query"));
    }
}
