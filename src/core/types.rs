//! Declaration schema, policy, plan and provenance types.
//!
//! Defines the YAML schema for `cairn.yaml` and the shared vocabulary of the
//! engine: resource kinds, references, constraints, failure policy, plan
//! actions and provenance events.

use super::error::Error;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Desired attributes of a resource, in declaration order.
pub type Attributes = IndexMap<String, serde_yaml_ng::Value>;

/// String outputs a resource exposes to later resources (`{{output.ref.key}}`).
pub type Outputs = BTreeMap<String, String>;

// ============================================================================
// Top-level cairn.yaml
// ============================================================================

/// Root configuration: the declared desired state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CairnConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable name of the declaration set
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Global parameters (`{{params.key}}`)
    #[serde(default)]
    pub params: HashMap<String, serde_yaml_ng::Value>,

    /// Host that package, service and file resources are converged on
    #[serde(default)]
    pub target: Target,

    /// Directory holding templates for file resources
    #[serde(default)]
    pub templates: Option<String>,

    /// Per-kind default attributes, merged under each declaration
    #[serde(default)]
    pub defaults: IndexMap<String, Attributes>,

    /// Resource declarations (order is significant)
    #[serde(default)]
    pub resources: Vec<Declaration>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,
}

/// A single resource declaration as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Declaration {
    /// Resource kind (package, service, file, security_group, ...)
    pub kind: String,

    /// Resource name, unique per kind
    pub name: String,

    /// Optional alias used by other declarations' constraints
    #[serde(default)]
    pub id: Option<String>,

    /// Expand into `count` resources, substituting `{{index}}`
    #[serde(default)]
    pub count: Option<u32>,

    /// Kind-specific desired attributes
    #[serde(default)]
    pub attributes: Attributes,

    /// Resources that must converge before this one
    #[serde(default)]
    pub after: Vec<String>,

    /// Resources that must converge after this one
    #[serde(default)]
    pub before: Vec<String>,
}

// ============================================================================
// Target host
// ============================================================================

/// The host that local-kind resources are converged on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Network address (IP or DNS)
    #[serde(default = "default_addr")]
    pub addr: String,

    /// SSH user
    #[serde(default = "default_user")]
    pub user: String,

    /// Path to SSH private key
    #[serde(default)]
    pub ssh_key: Option<String>,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            user: default_user(),
            ssh_key: None,
        }
    }
}

fn default_addr() -> String {
    "localhost".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

// ============================================================================
// Resource kinds and references
// ============================================================================

/// The closed set of resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Package,
    Service,
    File,
    SecurityGroup,
    LoadBalancer,
    ComputeInstance,
}

impl ResourceKind {
    /// Every kind, in a stable order.
    pub const ALL: [ResourceKind; 6] = [
        Self::Package,
        Self::Service,
        Self::File,
        Self::SecurityGroup,
        Self::LoadBalancer,
        Self::ComputeInstance,
    ];

    /// Whether the kind is backed by a cloud API rather than the target host.
    pub fn is_cloud(self) -> bool {
        matches!(
            self,
            Self::SecurityGroup | Self::LoadBalancer | Self::ComputeInstance
        )
    }

    /// Canonical snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::Service => "service",
            Self::File => "file",
            Self::SecurityGroup => "security_group",
            Self::LoadBalancer => "load_balancer",
            Self::ComputeInstance => "compute_instance",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| Error::UnknownResourceKind(s.to_string()))
    }
}

/// Canonical reference of a resource: `kind[name]`.
pub fn canonical_ref(kind: ResourceKind, name: &str) -> String {
    format!("{}[{}]", kind, name)
}

/// Ordering constraints of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    /// References that must converge before this resource
    pub after: Vec<String>,
    /// References that must converge after this resource
    pub before: Vec<String>,
}

impl Constraints {
    pub fn after<I, S>(refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            after: refs.into_iter().map(Into::into).collect(),
            before: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.after.is_empty() && self.before.is_empty()
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Failure handling
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Concurrent convergence workers (1 = strictly sequential)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per provider call timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Append provenance events to `<state_dir>/events.jsonl`
    #[serde(default = "default_true")]
    pub event_log: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            workers: default_workers(),
            timeout_secs: default_timeout_secs(),
            event_log: true,
        }
    }
}

fn default_workers() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Failure handling strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt the run after the first failed resource.
    #[default]
    FailFast,
    /// Skip dependents of failed resources, keep converging independent ones.
    BestEffort,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast => write!(f, "fail-fast"),
            Self::BestEffort => write!(f, "best-effort"),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Action to take on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    Destroy,
    NoOp,
    /// Depends on outputs only known after upstream resources are applied.
    Deferred,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Destroy => write!(f, "DESTROY"),
            Self::NoOp => write!(f, "NO-OP"),
            Self::Deferred => write!(f, "DEFERRED"),
        }
    }
}

/// A single planned change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    /// Resource reference
    pub resource: String,

    /// Resource kind
    pub kind: ResourceKind,

    /// Action to take
    pub action: PlanAction,

    /// Human-readable description
    pub description: String,
}

/// Full execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Config name
    pub name: String,

    /// Planned changes in convergence order
    pub changes: Vec<PlannedChange>,

    /// Summary counts
    pub to_create: u32,
    pub to_update: u32,
    pub to_destroy: u32,
    pub unchanged: u32,
    pub deferred: u32,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        run_id: String,
        resources: usize,
        policy: String,
        cairn_version: String,
    },
    ResourceConverged {
        run_id: String,
        resource: String,
        updated: bool,
        changes: Vec<String>,
        duration_seconds: f64,
    },
    ResourceFailed {
        run_id: String,
        resource: String,
        error: String,
    },
    RunCompleted {
        run_id: String,
        state: String,
        resources_updated: u32,
        resources_unchanged: u32,
        resources_failed: u32,
        resources_skipped: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Template helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for template resolution.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        serde_yaml_ng::Value::Sequence(items) => items
            .iter()
            .map(yaml_value_to_string)
            .collect::<Vec<_>>()
            .join("\n"),
        other => format!("{:?}", other),
    }
}

// ============================================================================
// Tests
// ============================================================================
