//! Kernel integration tests: offices run on a passive team, so every process
//! that is not waiting on an asset has completed when `invoke_process` returns.

use office_kernel::kernel::{
    AdministrationContext, AdministratorConfig, AdministratorSource, Duty, FailureKind, FlowInvoker,
    ManagedObject, ManagedObjectSource, ManagedObjectUser, QueuePool, Recycle, RecycleOutcome,
    SourceContext, TopLevelEscalationHandler, WaitToken,
};
use office_kernel::types::ProcessId;
use office_kernel::{
    Config, Error, Failure, FailureMatcher, FlowConfig, JobConfig, Kernel, ManagedObjectConfig,
    OfficeBuilder, PassiveTeam,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Helpers
// =============================================================================

#[derive(Debug, Default)]
struct Recorder(Mutex<Vec<String>>);

impl Recorder {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

fn office(name: &str) -> OfficeBuilder {
    OfficeBuilder::new(name).team("passive", Arc::new(PassiveTeam::new("passive")))
}

fn record(recorder: &Arc<Recorder>, name: &'static str) -> JobConfig {
    let recorder = recorder.clone();
    JobConfig::new(name, move |_| {
        recorder.push(name);
        Ok(())
    })
}

fn fail(name: &'static str, type_name: &'static str, message: &'static str) -> JobConfig {
    JobConfig::new(name, move |_| Err(Failure::new(type_name, message)))
}

/// Handler job recording the failure it was given.
fn handler(recorder: &Arc<Recorder>, name: &'static str) -> JobConfig {
    let recorder = recorder.clone();
    JobConfig::new(name, move |ctx| {
        let failure = ctx
            .parameter_as::<Failure>()
            .ok_or_else(|| Failure::new("test.parameter", "handler got no failure"))?;
        recorder.push(format!("{}:{}", name, failure.message()));
        Ok(())
    })
}

/// Supplies objects only when the test says so.
#[derive(Debug, Default)]
struct DeferredSource {
    pending: Mutex<Vec<ManagedObjectUser>>,
    recycled: Mutex<Vec<String>>,
}

impl DeferredSource {
    fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn supply(&self, object: ManagedObject) {
        let user = self.pending.lock().unwrap().pop().unwrap();
        user.set_object(object);
    }

    fn fail(&self, failure: Failure) {
        let user = self.pending.lock().unwrap().pop().unwrap();
        user.set_failure(failure);
    }
}

impl ManagedObjectSource for DeferredSource {
    fn source(&self, user: ManagedObjectUser) {
        self.pending.lock().unwrap().push(user);
    }

    fn recycle(&self, _object: &ManagedObject, outcome: &RecycleOutcome) -> Recycle {
        self.recycled.lock().unwrap().push(format!("{:?}", outcome));
        Recycle::Discard
    }
}

/// Supplies a fresh counter value synchronously.
#[derive(Debug, Default)]
struct CountingSource {
    sourced: AtomicUsize,
    recycled: Mutex<Vec<String>>,
}

impl ManagedObjectSource for CountingSource {
    fn source(&self, user: ManagedObjectUser) {
        let n = self.sourced.fetch_add(1, Ordering::SeqCst) + 1;
        user.set_object(Arc::new(n));
    }

    fn recycle(&self, _object: &ManagedObject, outcome: &RecycleOutcome) -> Recycle {
        let label = match outcome {
            RecycleOutcome::Clean => "clean",
            RecycleOutcome::Failed(_) => "failed",
            RecycleOutcome::Abandoned => "abandoned",
        };
        self.recycled.lock().unwrap().push(label.to_string());
        match outcome {
            RecycleOutcome::Clean => Recycle::Pool,
            _ => Recycle::Discard,
        }
    }
}

#[derive(Debug, Default)]
struct CapturingHandler(Mutex<Vec<(ProcessId, Failure)>>);

impl TopLevelEscalationHandler for CapturingHandler {
    fn handle_escalation(&self, process: &ProcessId, failure: &Failure) {
        self.0.lock().unwrap().push((process.clone(), failure.clone()));
    }
}

// =============================================================================
// Job sequences
// =============================================================================

#[test]
fn test_sequence_runs_jobs_in_order() {
    let recorder = Arc::new(Recorder::default());
    let kernel = Kernel::new(
        office("sequence")
            .job(record(&recorder, "a"))
            .job(record(&recorder, "b"))
            .job(record(&recorder, "c"))
            .flow(FlowConfig::new("main").jobs(["a", "b", "c"]))
            .build()
            .unwrap(),
        Config::default(),
    );
    kernel.start().unwrap();

    let handle = kernel.invoke_process("main", None).unwrap();
    let outcome = handle.outcome().unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.threads, 1);
    assert_eq!(recorder.take(), vec!["a", "b", "c"]);
    assert_eq!(kernel.process_count(), 0);

    let stats = kernel.stats();
    assert_eq!(stats.jobs_executed, 3);
    assert_eq!(stats.processes_invoked, 1);
    assert_eq!(stats.processes_completed, 1);
    assert_eq!(stats.processes_terminated, 0);
}

#[test]
fn test_parameter_flows_to_next_job() {
    let recorder = Arc::new(Recorder::default());
    let seen = recorder.clone();
    let kernel = Kernel::new(
        office("parameters")
            .job(JobConfig::new("double", |ctx| {
                let n = ctx.parameter_as::<u32>().copied().unwrap_or(0);
                ctx.set_next_parameter(Arc::new(n * 2));
                Ok(())
            }))
            .job(JobConfig::new("show", move |ctx| {
                seen.push(format!("{}", ctx.parameter_as::<u32>().copied().unwrap_or(0)));
                Ok(())
            }))
            .flow(FlowConfig::new("main").jobs(["double", "show"]))
            .build()
            .unwrap(),
        Config::default(),
    );

    kernel.invoke_process("main", Some(Arc::new(21u32))).unwrap();
    assert_eq!(recorder.take(), vec!["42"]);
}

#[test]
fn test_invoked_flow_runs_in_same_thread() {
    let recorder = Arc::new(Recorder::default());
    let parent = recorder.clone();
    let kernel = Kernel::new(
        office("nested")
            .job(
                JobConfig::new("parent", move |ctx| {
                    parent.push("parent");
                    ctx.invoke_flow(0, None)
                })
                .flow("child"),
            )
            .job(record(&recorder, "child_job"))
            .job(record(&recorder, "parent_next"))
            .flow(FlowConfig::new("main").jobs(["parent", "parent_next"]))
            .flow(FlowConfig::new("child").job("child_job"))
            .build()
            .unwrap(),
        Config::default(),
    );

    let outcome = kernel.invoke_process("main", None).unwrap().outcome().unwrap();
    assert_eq!(recorder.take(), vec!["parent", "child_job", "parent_next"]);
    assert_eq!(outcome.threads, 1);
}

#[test]
fn test_thread_unloads_once_after_all_sequences_complete() {
    let recorder = Arc::new(Recorder::default());
    let fanned = recorder.clone();
    let branched = recorder.clone();
    let source = Arc::new(CountingSource::default());
    let kernel = Kernel::new(
        office("fan_out")
            .thread_object(ManagedObjectConfig::new("buffer", source.clone()))
            .job(
                JobConfig::new("fan", move |ctx| {
                    fanned.push(format!("fan:{}", ctx.object_as::<usize>(0)?));
                    for _ in 0..3 {
                        ctx.invoke_flow(0, None)?;
                    }
                    Ok(())
                })
                .uses("buffer")
                .flow("branch"),
            )
            .job(
                JobConfig::new("branch_job", move |ctx| {
                    branched.push(format!("branch:{}", ctx.object_as::<usize>(0)?));
                    Ok(())
                })
                .uses("buffer"),
            )
            .flow(FlowConfig::new("main").job("fan"))
            .flow(FlowConfig::new("branch").job("branch_job"))
            .build()
            .unwrap(),
        Config::default(),
    );

    let outcome = kernel.invoke_process("main", None).unwrap().outcome().unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.threads, 1);
    assert_eq!(
        recorder.take(),
        vec!["fan:1", "branch:1", "branch:1", "branch:1"]
    );
    assert_eq!(source.sourced.load(Ordering::SeqCst), 1);
    assert_eq!(*source.recycled.lock().unwrap(), vec!["clean"]);

    let stats = kernel.stats();
    assert_eq!(stats.jobs_executed, 4);
    assert_eq!(stats.processes_completed, 1);
    assert_eq!(stats.active_processes, 0);
}

// =============================================================================
// Escalation
// =============================================================================

#[test]
fn test_flow_handler_replaces_rest_of_sequence() {
    let recorder = Arc::new(Recorder::default());
    let kernel = Kernel::new(
        office("flow_handler")
            .job(fail("job1", "io", "E"))
            .job(record(&recorder, "job2"))
            .job(handler(&recorder, "recover"))
            .job(handler(&recorder, "thread_recover"))
            .flow(
                FlowConfig::new("main")
                    .jobs(["job1", "job2"])
                    .on_escalation(FailureMatcher::job("io"), "recover_flow"),
            )
            .flow(FlowConfig::new("recover_flow").job("recover"))
            .flow(FlowConfig::new("thread_flow").job("thread_recover"))
            .thread_escalation(FailureMatcher::Any, "thread_flow")
            .build()
            .unwrap(),
        Config::default(),
    );

    let outcome = kernel.invoke_process("main", None).unwrap().outcome().unwrap();
    assert!(outcome.is_success());
    assert_eq!(recorder.take(), vec!["recover:E"]);
    assert_eq!(kernel.stats().escalations_handled, 1);
}

#[test]
fn test_handler_receives_attributed_failure() {
    let captured = Arc::new(Mutex::new(None));
    let slot = captured.clone();
    let kernel = Kernel::new(
        office("attribution")
            .job(fail("reader", "io.closed", "socket closed"))
            .job(JobConfig::new("recover", move |ctx| {
                *slot.lock().unwrap() = ctx.parameter_as::<Failure>().cloned();
                Ok(())
            }))
            .flow(FlowConfig::new("main").job("reader"))
            .flow(FlowConfig::new("recover_flow").job("recover"))
            .thread_escalation(FailureMatcher::job("io"), "recover_flow")
            .build()
            .unwrap(),
        Config::default(),
    );

    kernel.invoke_process("main", None).unwrap();
    let failure = captured.lock().unwrap().clone().unwrap();
    assert_eq!(failure.kind(), &FailureKind::Job("io.closed".to_string()));
    assert_eq!(failure.job(), Some("reader"));
}

#[test]
fn test_enclosing_flow_handles_nested_failure() {
    let recorder = Arc::new(Recorder::default());
    let kernel = Kernel::new(
        office("enclosing")
            .job(JobConfig::new("parent", |ctx| ctx.invoke_flow(0, None)).flow("child"))
            .job(fail("child_job", "io.read", "short read"))
            .job(record(&recorder, "parent_next"))
            .job(handler(&recorder, "recover"))
            .flow(
                FlowConfig::new("main")
                    .jobs(["parent", "parent_next"])
                    .on_escalation(FailureMatcher::job("io"), "recover_flow"),
            )
            .flow(FlowConfig::new("child").job("child_job"))
            .flow(FlowConfig::new("recover_flow").job("recover"))
            .build()
            .unwrap(),
        Config::default(),
    );

    let outcome = kernel.invoke_process("main", None).unwrap().outcome().unwrap();
    assert!(outcome.is_success());
    assert_eq!(recorder.take(), vec!["parent_next", "recover:short read"]);
}

#[test]
fn test_process_handler_runs_in_new_thread() {
    let threads = Arc::new(Recorder::default());
    let failing = threads.clone();
    let recovering = threads.clone();
    let kernel = Kernel::new(
        office("process_handler")
            .job(JobConfig::new("main_job", move |ctx| {
                failing.push(ctx.thread_id().to_string());
                Err(Failure::new("db", "down"))
            }))
            .job(JobConfig::new("recover", move |ctx| {
                recovering.push(ctx.thread_id().to_string());
                Ok(())
            }))
            .flow(FlowConfig::new("main").job("main_job"))
            .flow(FlowConfig::new("recover_flow").job("recover"))
            .process_escalation(FailureMatcher::AnyJob, "recover_flow")
            .build()
            .unwrap(),
        Config::default(),
    );

    let outcome = kernel.invoke_process("main", None).unwrap().outcome().unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.threads, 2);
    let ids = threads.take();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
}

#[test]
fn test_failing_handler_does_not_reenter_its_level() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let top_level = Arc::new(CapturingHandler::default());
    let kernel = Kernel::with_top_level_handler(
        office("looping")
            .job(fail("main_job", "io", "first"))
            .job(JobConfig::new("recover", move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(Failure::new("io", "again"))
            }))
            .flow(FlowConfig::new("main").job("main_job"))
            .flow(FlowConfig::new("recover_flow").job("recover"))
            .thread_escalation(FailureMatcher::job("io"), "recover_flow")
            .build()
            .unwrap(),
        Config::default(),
        top_level.clone(),
    );

    let outcome = kernel.invoke_process("main", None).unwrap().outcome().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.failure.map(|f| f.message().to_string()), Some("again".to_string()));
    assert_eq!(top_level.0.lock().unwrap().len(), 1);
}

#[test]
fn test_unhandled_failure_terminates_process() {
    let top_level = Arc::new(CapturingHandler::default());
    let kernel = Kernel::with_top_level_handler(
        office("unhandled")
            .job(fail("main_job", "db.down", "connection refused"))
            .flow(FlowConfig::new("main").job("main_job"))
            .build()
            .unwrap(),
        Config::default(),
        top_level.clone(),
    );

    let handle = kernel.invoke_process("main", None).unwrap();
    let outcome = handle.outcome().unwrap();
    assert!(!outcome.is_success());

    let captured = top_level.0.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(&captured[0].0, handle.id());
    assert_eq!(captured[0].1.message(), "connection refused");

    let stats = kernel.stats();
    assert_eq!(stats.top_level_escalations, 1);
    assert_eq!(stats.processes_terminated, 1);
}

#[test]
fn test_panicking_job_escalates_as_panic() {
    let recorder = Arc::new(Recorder::default());
    let kernel = Kernel::new(
        office("panics")
            .job(JobConfig::new("explode", |_| panic!("kaboom")))
            .job(handler(&recorder, "recover"))
            .flow(FlowConfig::new("main").job("explode"))
            .flow(FlowConfig::new("recover_flow").job("recover"))
            .thread_escalation(FailureMatcher::Panic, "recover_flow")
            .build()
            .unwrap(),
        Config::default(),
    );

    let outcome = kernel.invoke_process("main", None).unwrap().outcome().unwrap();
    assert!(outcome.is_success());
    let entries = recorder.take();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].contains("kaboom"));
}

#[test]
fn test_termination_aborts_other_threads_only_in_that_process() {
    let recorder = Arc::new(Recorder::default());
    let fork = recorder.clone();
    let kernel = Kernel::new(
        office("termination")
            .job(
                JobConfig::new("fork", move |ctx| {
                    let worker = ctx.spawn_thread(0, None)?;
                    fork.push("fork");
                    ctx.wait_on_flow(&worker, None, WaitToken(1));
                    Ok(())
                })
                .flow("work"),
            )
            .job(record(&recorder, "after_join"))
            .job(fail("work_job", "fatal", "worker died"))
            .job(record(&recorder, "healthy"))
            .flow(FlowConfig::new("main").jobs(["fork", "after_join"]))
            .flow(FlowConfig::new("work").job("work_job"))
            .flow(FlowConfig::new("other").job("healthy"))
            .build()
            .unwrap(),
        Config::default(),
    );

    let outcome = kernel.invoke_process("main", None).unwrap().outcome().unwrap();
    assert!(!outcome.is_success());
    assert_eq!(outcome.threads, 2);
    assert_eq!(recorder.take(), vec!["fork"]);

    let other = kernel.invoke_process("other", None).unwrap().outcome().unwrap();
    assert!(other.is_success());
    assert_eq!(recorder.take(), vec!["healthy"]);
    assert_eq!(kernel.process_count(), 0);
}

// =============================================================================
// Threads
// =============================================================================

#[test]
fn test_join_waits_for_spawned_thread() {
    let recorder = Arc::new(Recorder::default());
    let fork = recorder.clone();
    let kernel = Kernel::new(
        office("join")
            .job(
                JobConfig::new("fork", move |ctx| {
                    let worker = ctx.spawn_thread(0, None)?;
                    fork.push("fork");
                    ctx.wait_on_flow(&worker, None, WaitToken(1));
                    Ok(())
                })
                .flow("work"),
            )
            .job(record(&recorder, "after_join"))
            .job(record(&recorder, "worker"))
            .flow(FlowConfig::new("main").jobs(["fork", "after_join"]))
            .flow(FlowConfig::new("work").job("worker"))
            .build()
            .unwrap(),
        Config::default(),
    );

    let outcome = kernel.invoke_process("main", None).unwrap().outcome().unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.threads, 2);
    assert_eq!(recorder.take(), vec!["fork", "worker", "after_join"]);
    assert_eq!(kernel.stats().threads_created, 2);
}

#[test]
fn test_join_on_own_thread_continues_immediately() {
    let recorder = Arc::new(Recorder::default());
    let kernel = Kernel::new(
        office("self_join")
            .job(JobConfig::new("self_wait", |ctx| {
                let me = ctx.current_flow();
                ctx.wait_on_flow(&me, Some(Duration::from_secs(60)), WaitToken(5));
                Ok(())
            }))
            .job(record(&recorder, "next"))
            .flow(FlowConfig::new("main").jobs(["self_wait", "next"]))
            .build()
            .unwrap(),
        Config::default(),
    );

    assert!(kernel.invoke_process("main", None).unwrap().is_complete());
    assert_eq!(recorder.take(), vec!["next"]);
}

// =============================================================================
// Managed objects
// =============================================================================

#[test]
fn test_asynchronous_sourcing_resumes_job() {
    let recorder = Arc::new(Recorder::default());
    let seen = recorder.clone();
    let source = Arc::new(DeferredSource::default());
    let kernel = Kernel::new(
        office("async")
            .thread_object(ManagedObjectConfig::new("conn", source.clone()))
            .job(
                JobConfig::new("query", move |ctx| {
                    seen.push(ctx.object_as::<String>(0)?.clone());
                    Ok(())
                })
                .uses("conn"),
            )
            .flow(FlowConfig::new("main").job("query"))
            .build()
            .unwrap(),
        Config::default(),
    );

    let handle = kernel.invoke_process("main", None).unwrap();
    assert!(!handle.is_complete());
    assert_eq!(source.pending(), 1);
    assert_eq!(kernel.process_count(), 1);

    let supplier = source.clone();
    std::thread::spawn(move || supplier.supply(Arc::new("conn-1".to_string())))
        .join()
        .unwrap();

    assert!(handle.is_complete());
    assert_eq!(recorder.take(), vec!["conn-1"]);
    assert_eq!(*source.recycled.lock().unwrap(), vec!["Clean".to_string()]);
}

#[test]
fn test_sourcing_failure_escalates() {
    let recorder = Arc::new(Recorder::default());
    let source = Arc::new(DeferredSource::default());
    let kernel = Kernel::new(
        office("sourcing_failure")
            .process_object(ManagedObjectConfig::new("db", source.clone()))
            .job(record(&recorder, "query").uses("db"))
            .job(handler(&recorder, "recover"))
            .flow(FlowConfig::new("main").job("query"))
            .flow(FlowConfig::new("recover_flow").job("recover"))
            .thread_escalation(FailureMatcher::Sourcing, "recover_flow")
            .build()
            .unwrap(),
        Config::default(),
    );

    let handle = kernel.invoke_process("main", None).unwrap();
    source.fail(Failure::sourcing("db", "no route to host"));

    assert!(handle.outcome().unwrap().is_success());
    assert_eq!(recorder.take(), vec!["recover:no route to host"]);
}

#[test]
fn test_sourcing_timeout_and_late_object_is_abandoned() {
    let recorder = Arc::new(Recorder::default());
    let source = Arc::new(DeferredSource::default());
    let kernel = Kernel::new(
        office("timeouts")
            .thread_object(
                ManagedObjectConfig::new("slow", source.clone()).timeout(Duration::from_millis(10)),
            )
            .job(record(&recorder, "query").uses("slow"))
            .job(handler(&recorder, "on_timeout"))
            .flow(FlowConfig::new("main").job("query"))
            .flow(FlowConfig::new("timeout_flow").job("on_timeout"))
            .thread_escalation(FailureMatcher::Timeout, "timeout_flow")
            .build()
            .unwrap(),
        Config::default(),
    );

    let handle = kernel.invoke_process("main", None).unwrap();
    assert_eq!(kernel.check_on_assets(), 0);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(kernel.check_on_assets(), 1);

    assert!(handle.outcome().unwrap().is_success());
    let entries = recorder.take();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].starts_with("on_timeout:"));
    assert_eq!(kernel.stats().timeouts, 1);

    source.supply(Arc::new("too late".to_string()));
    assert_eq!(*source.recycled.lock().unwrap(), vec!["Abandoned".to_string()]);
}

#[test]
fn test_pooled_object_is_reused_across_processes() {
    let recorder = Arc::new(Recorder::default());
    let seen = recorder.clone();
    let source = Arc::new(CountingSource::default());
    let pool = Arc::new(QueuePool::new(2));
    let kernel = Kernel::new(
        office("pooling")
            .thread_object(ManagedObjectConfig::new("buffer", source.clone()).pooled(pool.clone()))
            .job(
                JobConfig::new("use", move |ctx| {
                    seen.push(format!("{}", ctx.object_as::<usize>(0)?));
                    Ok(())
                })
                .uses("buffer"),
            )
            .flow(FlowConfig::new("main").job("use"))
            .build()
            .unwrap(),
        Config::default(),
    );

    kernel.invoke_process("main", None).unwrap();
    kernel.invoke_process("main", None).unwrap();

    assert_eq!(source.sourced.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.take(), vec!["1", "1"]);
    assert_eq!(pool.idle(), 1);
    assert_eq!(*source.recycled.lock().unwrap(), vec!["clean", "clean"]);
}

#[test]
fn test_failed_scope_discards_pooled_object() {
    let source = Arc::new(CountingSource::default());
    let pool = Arc::new(QueuePool::new(2));
    let kernel = Kernel::new(
        office("discard")
            .thread_object(ManagedObjectConfig::new("buffer", source.clone()).pooled(pool.clone()))
            .job(JobConfig::new("use", |ctx| {
                ctx.object(0)?;
                Err(Failure::new("fatal", "corrupted buffer"))
            })
            .uses("buffer"))
            .flow(FlowConfig::new("main").job("use"))
            .build()
            .unwrap(),
        Config::default(),
    );

    assert!(!kernel.invoke_process("main", None).unwrap().outcome().unwrap().is_success());
    assert_eq!(pool.idle(), 0);
    assert_eq!(*source.recycled.lock().unwrap(), vec!["failed"]);
}

#[derive(Debug, Default)]
struct TransactionSource {
    coordinated: Mutex<Vec<usize>>,
}

impl ManagedObjectSource for TransactionSource {
    fn source(&self, user: ManagedObjectUser) {
        user.set_object(Arc::new("tx".to_string()));
    }

    fn coordinate(&self, _object: &ManagedObject, dependencies: &[ManagedObject]) -> Result<(), Failure> {
        let db = dependencies
            .first()
            .and_then(|d| d.downcast_ref::<usize>())
            .ok_or_else(|| Failure::new("tx.dependency", "database missing"))?;
        self.coordinated.lock().unwrap().push(*db);
        Ok(())
    }
}

#[test]
fn test_dependencies_load_first_and_coordinate() {
    let db = Arc::new(CountingSource::default());
    let tx = Arc::new(TransactionSource::default());
    let kernel = Kernel::new(
        office("dependencies")
            .process_object(ManagedObjectConfig::new("db", db.clone()))
            .thread_object(ManagedObjectConfig::new("tx", tx.clone()).depends_on("db"))
            .job(JobConfig::new("work", |ctx| ctx.object(0).map(|_| ())).uses("tx"))
            .flow(FlowConfig::new("main").jobs(["work", "work"]))
            .build()
            .unwrap(),
        Config::default(),
    );

    assert!(kernel.invoke_process("main", None).unwrap().outcome().unwrap().is_success());
    assert_eq!(db.sourced.load(Ordering::SeqCst), 1);
    assert_eq!(*tx.coordinated.lock().unwrap(), vec![1]);
}

#[derive(Debug, Default)]
struct RequestSource {
    invoker: Mutex<Option<FlowInvoker>>,
}

impl ManagedObjectSource for RequestSource {
    fn start(&self, context: &mut SourceContext<'_>) -> office_kernel::Result<()> {
        *self.invoker.lock().unwrap() = Some(context.flow("serve")?);
        Ok(())
    }

    fn source(&self, user: ManagedObjectUser) {
        user.set_failure(Failure::new("request.missing", "requests only arrive as input"));
    }
}

#[test]
fn test_input_object_from_started_source() {
    let recorder = Arc::new(Recorder::default());
    let seen = recorder.clone();
    let source = Arc::new(RequestSource::default());
    let kernel = Kernel::new(
        office("input")
            .process_object(ManagedObjectConfig::input("request", source.clone()))
            .job(
                JobConfig::new("serve_job", move |ctx| {
                    seen.push(ctx.object_as::<String>(0)?.clone());
                    Ok(())
                })
                .uses("request"),
            )
            .flow(FlowConfig::new("serve").job("serve_job"))
            .build()
            .unwrap(),
        Config::default(),
    );

    kernel.start().unwrap();
    assert!(matches!(kernel.start(), Err(Error::StateTransition(_))));

    let invoker = source.invoker.lock().unwrap().clone().unwrap();
    let handle = invoker
        .invoke(None, Some(Arc::new("GET /".to_string())))
        .unwrap();
    assert!(handle.outcome().unwrap().is_success());

    kernel
        .invoke_process_with_input("serve", None, "request", Arc::new("POST /".to_string()))
        .unwrap();
    assert_eq!(recorder.take(), vec!["GET /", "POST /"]);

    let missing = kernel.invoke_process("serve", None).unwrap().outcome().unwrap();
    assert!(matches!(
        missing.failure.map(|f| f.kind().clone()),
        Some(FailureKind::Sourcing { .. })
    ));
}

#[test]
fn test_unknown_names_are_rejected() {
    let kernel = Kernel::new(
        office("names")
            .job(JobConfig::new("noop", |_| Ok(())))
            .flow(FlowConfig::new("main").job("noop"))
            .build()
            .unwrap(),
        Config::default(),
    );
    assert!(matches!(kernel.invoke_process("missing", None), Err(Error::NotFound(_))));
    assert!(matches!(
        kernel.invoke_process_with_input("main", None, "nothing", Arc::new(())),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(kernel.start_monitor_sweep(), Err(Error::Configuration(_))));
}

// =============================================================================
// Administration
// =============================================================================

#[derive(Debug)]
struct AuditAdministrator(Arc<Recorder>);

impl AdministratorSource for AuditAdministrator {
    fn administer(&self, duty: Duty, context: &mut AdministrationContext<'_>) -> Result<(), Failure> {
        self.0.push(format!("{}:{}", duty, context.job_name()));
        Ok(())
    }
}

#[test]
fn test_administration_wraps_job() {
    let recorder = Arc::new(Recorder::default());
    let top_level = Arc::new(CapturingHandler::default());
    let kernel = Kernel::with_top_level_handler(
        office("administration")
            .administrator(AdministratorConfig::new(
                "audit",
                Arc::new(AuditAdministrator(recorder.clone())),
            ))
            .job(record(&recorder, "work").administered_by("audit"))
            .job(fail("broken", "fatal", "nope").administered_by("audit"))
            .flow(FlowConfig::new("ok").job("work"))
            .flow(FlowConfig::new("bad").job("broken"))
            .build()
            .unwrap(),
        Config::default(),
        top_level,
    );

    kernel.invoke_process("ok", None).unwrap();
    assert_eq!(recorder.take(), vec!["pre:work", "work", "post:work"]);

    kernel.invoke_process("bad", None).unwrap();
    assert_eq!(recorder.take(), vec!["pre:broken"]);
}
