//! Convergence engine.
//!
//! Walks the dependency graph and, for each resource whose predecessors have
//! all succeeded, resolves deferred outputs, inspects, diffs and applies.
//! With one worker resources run strictly in graph order; with more, any
//! resource whose predecessors are done may run alongside others. Both modes
//! share one scheduler.

use super::declare::Resource;
use super::error::{Error, Result};
use super::graph::Graph;
use super::report::{FailureReason, Outcome, OutcomeStatus, RunReport, RunState};
use super::resolver::{self, TemplateContext};
use super::types::{FailurePolicy, Outputs, Policy, ProvenanceEvent};
use crate::providers::{CallContext, Provider, ProviderRegistry, ResolvedResource};
use crate::resources;
use crate::tripwire::eventlog;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cooperative cancellation flag, shared with signal handlers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. In-flight resources finish; nothing new starts.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Knobs for one convergence run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub policy: FailurePolicy,
    /// Resources converged concurrently (1 = strictly sequential)
    pub workers: usize,
    /// Per provider call timeout
    pub timeout: Duration,
    pub cancel: CancelToken,
    /// Append provenance events to `<dir>/events.jsonl` when set
    pub event_log: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_policy(&Policy::default())
    }
}

impl RunOptions {
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            policy: policy.failure,
            workers: policy.workers.max(1),
            timeout: Duration::from_secs(policy.timeout_secs),
            cancel: CancelToken::new(),
            event_log: None,
        }
    }
}

/// Per-resource lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePhase {
    Pending,
    Inspecting,
    Applying,
    Unchanged,
    Updated,
    Failed,
}

impl ResourcePhase {
    pub fn can_transition_to(self, next: ResourcePhase) -> bool {
        use ResourcePhase::*;
        matches!(
            (self, next),
            (Pending, Inspecting)
                | (Pending, Failed)
                | (Inspecting, Unchanged)
                | (Inspecting, Applying)
                | (Inspecting, Failed)
                | (Applying, Updated)
                | (Applying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Unchanged | Self::Updated | Self::Failed)
    }
}

struct PhaseTracker<'a> {
    resource: &'a str,
    phase: ResourcePhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(resource: &'a str) -> Self {
        Self {
            resource,
            phase: ResourcePhase::Pending,
        }
    }

    fn advance(&mut self, next: ResourcePhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "{}: illegal transition {:?} -> {:?}",
            self.resource,
            self.phase,
            next
        );
        debug!(resource = %self.resource, from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }
}

/// Scheduler state guarded by one mutex.
struct Schedule {
    /// Unfinished predecessors per position
    waiting_on: Vec<usize>,
    ready: BTreeSet<usize>,
    in_flight: usize,
    outcomes: Vec<Option<Outcome>>,
    outputs: HashMap<String, Outputs>,
    halted: bool,
    cancelled: bool,
}

struct Run<'g> {
    graph: &'g Graph,
    providers: Vec<Arc<dyn Provider>>,
    options: &'g RunOptions,
    run_id: String,
    schedule: Mutex<Schedule>,
    wake: Condvar,
}

/// Converge every resource in `graph`.
///
/// Fails before any provider call when a kind in the graph has no
/// registered provider. Per-resource failures do not fail the call; they
/// are recorded in the returned [`RunReport`].
pub fn converge(graph: &Graph, registry: &ProviderRegistry, options: &RunOptions) -> Result<RunReport> {
    let providers = graph
        .resources()
        .iter()
        .map(|r| registry.resolve(r.kind()))
        .collect::<Result<Vec<_>>>()?;
    Ok(Run::new(graph, providers, options).execute())
}

/// Like [`converge`], but an unsuccessful run is an error.
pub fn converge_strict(
    graph: &Graph,
    registry: &ProviderRegistry,
    options: &RunOptions,
) -> Result<RunReport> {
    let report = converge(graph, registry, options)?;
    if report.success() && report.skipped.is_empty() {
        Ok(report)
    } else {
        Err(Error::RunFailed {
            failed: report.failed_count(),
            skipped: report.skipped.len(),
        })
    }
}

fn lock(m: &Mutex<Schedule>) -> MutexGuard<'_, Schedule> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<'g> Run<'g> {
    fn new(graph: &'g Graph, providers: Vec<Arc<dyn Provider>>, options: &'g RunOptions) -> Self {
        let n = graph.len();
        let waiting_on: Vec<usize> = (0..n).map(|pos| graph.predecessors(pos).len()).collect();
        let ready = (0..n).filter(|&pos| waiting_on[pos] == 0).collect();
        Self {
            graph,
            providers,
            options,
            run_id: eventlog::generate_run_id(),
            schedule: Mutex::new(Schedule {
                waiting_on,
                ready,
                in_flight: 0,
                outcomes: vec![None; n],
                outputs: HashMap::new(),
                halted: false,
                cancelled: false,
            }),
            wake: Condvar::new(),
        }
    }

    fn execute(self) -> RunReport {
        let started = Instant::now();
        let workers = self.options.workers.clamp(1, self.graph.len().max(1));
        info!(
            run_id = %self.run_id,
            resources = self.graph.len(),
            policy = %self.options.policy,
            workers,
            "convergence started"
        );
        self.log_event(ProvenanceEvent::RunStarted {
            run_id: self.run_id.clone(),
            resources: self.graph.len(),
            policy: self.options.policy.to_string(),
            cairn_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        if workers == 1 {
            self.work();
        } else {
            thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|| self.work());
                }
            });
        }

        let mut schedule = self
            .schedule
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);

        // A halt leaves dependents of failed resources unstarted; they are
        // failures too. Graph order settles chains in one pass.
        for pos in 0..self.graph.len() {
            if schedule.outcomes[pos].is_some() {
                continue;
            }
            if let Some(dependency) = failed_predecessor(self.graph, &schedule.outcomes, pos) {
                let outcome = dependency_failed(self.graph.resource(pos), dependency);
                warn!(resource = %outcome.resource, "failed: dependency failed");
                append(
                    self.options,
                    ProvenanceEvent::ResourceFailed {
                        run_id: self.run_id.clone(),
                        resource: outcome.resource.clone(),
                        error: outcome.failure().map(ToString::to_string).unwrap_or_default(),
                    },
                );
                schedule.outcomes[pos] = Some(outcome);
            }
        }

        let mut outcomes = Vec::with_capacity(self.graph.len());
        let mut skipped = Vec::new();
        for (pos, outcome) in schedule.outcomes.into_iter().enumerate() {
            match outcome {
                Some(o) => outcomes.push(o),
                None => skipped.push(self.graph.resource(pos).reference().to_string()),
            }
        }

        let state = if skipped.is_empty() {
            RunState::Completed
        } else {
            RunState::Aborted
        };
        let report = RunReport {
            run_id: self.run_id.clone(),
            state,
            cancelled: schedule.cancelled,
            outcomes,
            skipped,
            duration: started.elapsed(),
        };

        info!(
            run_id = %report.run_id,
            state = %report.state,
            updated = report.updated_count(),
            unchanged = report.unchanged_count(),
            failed = report.failed_count(),
            skipped = report.skipped.len(),
            "convergence finished"
        );
        let run_completed = ProvenanceEvent::RunCompleted {
            run_id: report.run_id.clone(),
            state: report.state.to_string(),
            resources_updated: report.updated_count() as u32,
            resources_unchanged: report.unchanged_count() as u32,
            resources_failed: report.failed_count() as u32,
            resources_skipped: report.skipped.len() as u32,
            total_seconds: report.duration.as_secs_f64(),
        };
        append(self.options, run_completed);
        report
    }

    /// Worker loop: take the next ready resource until none remain.
    fn work(&self) {
        while let Some((pos, upstream)) = self.next_job() {
            let (outcome, outputs) = self.converge_one(pos, &upstream);
            let mut schedule = lock(&self.schedule);
            self.record(&mut schedule, pos, outcome, outputs);
            schedule.in_flight -= 1;
            drop(schedule);
            self.wake.notify_all();
        }
    }

    /// Block until a resource is ready, or return `None` when the run is
    /// over for this worker.
    fn next_job(&self) -> Option<(usize, HashMap<String, Outputs>)> {
        let mut schedule = lock(&self.schedule);
        loop {
            if !schedule.halted && self.options.cancel.is_cancelled() {
                warn!(run_id = %self.run_id, "cancellation requested, no further resources will start");
                schedule.halted = true;
                schedule.cancelled = true;
                self.wake.notify_all();
            }
            if schedule.halted {
                return None;
            }

            if let Some(pos) = schedule.ready.pop_first() {
                if let Some(dependency) = failed_predecessor(self.graph, &schedule.outcomes, pos) {
                    let outcome = dependency_failed(self.graph.resource(pos), dependency);
                    self.record(&mut schedule, pos, outcome, None);
                    continue;
                }
                schedule.in_flight += 1;
                return Some((pos, schedule.outputs.clone()));
            }

            if schedule.in_flight == 0 {
                return None;
            }
            schedule = self
                .wake
                .wait(schedule)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Store an outcome and release successors.
    fn record(&self, schedule: &mut Schedule, pos: usize, outcome: Outcome, outputs: Option<Outputs>) {
        let resource = self.graph.resource(pos);
        if let Some(outputs) = outputs {
            for name in resource.names() {
                schedule.outputs.insert(name.to_string(), outputs.clone());
            }
        }

        self.log_outcome(&outcome);
        let failed = outcome.is_failed();
        schedule.outcomes[pos] = Some(outcome);

        for &succ in self.graph.successors(pos) {
            schedule.waiting_on[succ] -= 1;
            if schedule.waiting_on[succ] == 0 {
                schedule.ready.insert(succ);
            }
        }

        if failed && self.options.policy == FailurePolicy::FailFast && !schedule.halted {
            warn!(resource = %resource.reference(), "fail-fast: halting run");
            schedule.halted = true;
        }
    }

    /// Resolve, inspect, diff and apply one resource. Never panics on
    /// provider errors; they become a failed outcome.
    fn converge_one(&self, pos: usize, upstream: &HashMap<String, Outputs>) -> (Outcome, Option<Outputs>) {
        let resource = self.graph.resource(pos);
        let provider = self.providers[pos].as_ref();
        let started = Instant::now();
        let mut phase = PhaseTracker::new(resource.reference());

        let result = self.attempt(resource, provider, upstream, &mut phase);
        let (status, changes, outputs) = match result {
            Ok((true, changes, outputs)) => (OutcomeStatus::Updated, changes, Some(outputs)),
            Ok((false, _, outputs)) => (OutcomeStatus::Unchanged, Vec::new(), Some(outputs)),
            Err(reason) => {
                phase.advance(ResourcePhase::Failed);
                (OutcomeStatus::Failed(reason), Vec::new(), None)
            }
        };

        let outcome = Outcome {
            resource: resource.reference().to_string(),
            kind: resource.kind(),
            status,
            changes,
            duration: started.elapsed(),
        };
        (outcome, outputs)
    }

    fn attempt(
        &self,
        resource: &Resource,
        provider: &dyn Provider,
        upstream: &HashMap<String, Outputs>,
        phase: &mut PhaseTracker<'_>,
    ) -> std::result::Result<(bool, Vec<String>, Outputs), FailureReason> {
        let ctx = CallContext {
            timeout: self.options.timeout,
        };
        phase.advance(ResourcePhase::Inspecting);

        let attributes =
            resolver::resolve_attributes(resource.attributes(), &TemplateContext::outputs(upstream))
                .map_err(|e| FailureReason::Resolve(e.to_string()))?;
        let desired = resources::parse_desired(resource.kind(), resource.name(), &attributes)
            .map_err(FailureReason::Resolve)?;
        let mut resolved = ResolvedResource {
            reference: resource.reference().to_string(),
            kind: resource.kind(),
            name: resource.name().to_string(),
            desired,
        };

        provider
            .prepare(&mut resolved, &ctx)
            .map_err(FailureReason::Inspection)?;
        let observed = provider
            .inspect(&resolved, &ctx)
            .map_err(FailureReason::Inspection)?;
        let changes = provider.converge(&resolved, &observed);

        if changes.is_empty() {
            phase.advance(ResourcePhase::Unchanged);
            return Ok((false, Vec::new(), observed.outputs()));
        }

        phase.advance(ResourcePhase::Applying);
        let descriptions = changes.descriptions();
        debug!(resource = %resolved.reference, changes = ?descriptions, "applying");
        let applied = provider
            .apply(&resolved, &changes, &ctx)
            .map_err(FailureReason::Apply)?;
        phase.advance(ResourcePhase::Updated);

        let outputs = if resolved.desired.is_absent() {
            applied
        } else {
            let mut merged = observed.outputs();
            merged.extend(applied);
            merged
        };
        Ok((true, descriptions, outputs))
    }

    fn log_outcome(&self, outcome: &Outcome) {
        let event = match outcome.status {
            OutcomeStatus::Failed(ref reason) => {
                warn!(resource = %outcome.resource, %reason, "failed");
                ProvenanceEvent::ResourceFailed {
                    run_id: self.run_id.clone(),
                    resource: outcome.resource.clone(),
                    error: reason.to_string(),
                }
            }
            ref status => {
                let updated = *status == OutcomeStatus::Updated;
                if updated {
                    info!(resource = %outcome.resource, changes = ?outcome.changes, "updated");
                } else {
                    info!(resource = %outcome.resource, "unchanged");
                }
                ProvenanceEvent::ResourceConverged {
                    run_id: self.run_id.clone(),
                    resource: outcome.resource.clone(),
                    updated,
                    changes: outcome.changes.clone(),
                    duration_seconds: outcome.duration.as_secs_f64(),
                }
            }
        };
        self.log_event(event);
    }

    fn log_event(&self, event: ProvenanceEvent) {
        append(self.options, event);
    }
}

/// First predecessor of `pos` with a failed outcome.
fn failed_predecessor(graph: &Graph, outcomes: &[Option<Outcome>], pos: usize) -> Option<String> {
    graph
        .predecessors(pos)
        .iter()
        .find(|&&p| outcomes[p].as_ref().is_some_and(Outcome::is_failed))
        .map(|&p| graph.resource(p).reference().to_string())
}

fn dependency_failed(resource: &Resource, dependency: String) -> Outcome {
    let mut phase = PhaseTracker::new(resource.reference());
    phase.advance(ResourcePhase::Failed);
    Outcome {
        resource: resource.reference().to_string(),
        kind: resource.kind(),
        status: OutcomeStatus::Failed(FailureReason::DependencyFailed { dependency }),
        changes: Vec::new(),
        duration: Duration::ZERO,
    }
}

fn append(options: &RunOptions, event: ProvenanceEvent) {
    if let Some(ref dir) = options.event_log {
        if let Err(e) = eventlog::append_event(dir, event) {
            warn!(dir = %dir.display(), error = %e, "cannot write event log");
        }
    }
}
