//! Provider registry and the provider contract.
//!
//! A provider adapts one or more resource kinds to the real world:
//! `inspect` observes, `converge` diffs (pure, no side effects) and `apply`
//! carries out a non-empty change set. Every call gets a [`CallContext`]
//! whose timeout the provider must honor.

pub mod cloud;
pub mod file;
pub mod memory;
pub mod package;
pub mod service;

use crate::core::error::{ApplyError, Error, InspectionError, Result};
use crate::core::types::{Outputs, PlanAction, ResourceKind, Target};
use crate::resources::Desired;
use crate::transport::{ExecOutput, Transport};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use cloud::{CloudClient, CloudError, CloudObject, CloudProvider};
pub use file::{DirRenderer, FileProvider, Renderer};
pub use memory::{CallKind, InMemoryCloud, MemoryProvider, ProviderCall};
pub use package::PackageProvider;
pub use service::ServiceProvider;

/// Per-call context handed to providers.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    /// Deadline for a single provider call
    pub timeout: Duration,
}

/// A resource with every deferred value resolved, ready for a provider.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    pub reference: String,
    pub kind: ResourceKind,
    pub name: String,
    pub desired: Desired,
}

/// Observed file attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileObservation {
    pub exists: bool,
    pub content_hash: Option<String>,
    pub mode: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// Real-world state as observed by `inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    Package { installed: Option<String> },
    Service { active: bool, enabled: bool },
    File(FileObservation),
    Cloud(Option<CloudObject>),
    Simulated {
        fingerprint: Option<String>,
        outputs: Outputs,
    },
}

impl ResourceState {
    /// Values later resources may read through `{{output.<ref>.<key>}}`.
    pub fn outputs(&self) -> Outputs {
        let mut out = Outputs::new();
        match self {
            Self::Package { installed } => {
                if let Some(v) = installed {
                    out.insert("version".into(), v.clone());
                }
            }
            Self::Service { active, enabled } => {
                out.insert("active".into(), active.to_string());
                out.insert("enabled".into(), enabled.to_string());
            }
            Self::File(obs) => {
                out.insert("exists".into(), obs.exists.to_string());
                if let Some(ref h) = obs.content_hash {
                    out.insert("content_hash".into(), h.clone());
                }
            }
            Self::Cloud(Some(obj)) => return obj.outputs(),
            Self::Cloud(None) => {}
            Self::Simulated { outputs, .. } => return outputs.clone(),
        }
        out
    }
}

/// One primitive mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    InstallPackage {
        name: String,
        version: Option<String>,
        /// Version being replaced, if any
        from: Option<String>,
    },
    RemovePackage { name: String },
    StartService { name: String },
    StopService { name: String },
    EnableService { name: String },
    DisableService { name: String },
    WriteContent { path: String, create: bool },
    SetMode { path: String, mode: u32 },
    SetOwnership {
        path: String,
        owner: Option<String>,
        group: Option<String>,
    },
    RemoveFile { path: String },
    CreateCloud {
        kind: ResourceKind,
        name: String,
        attributes: BTreeMap<String, String>,
    },
    UpdateCloud {
        kind: ResourceKind,
        id: String,
        /// Only the attributes that differ
        attributes: BTreeMap<String, String>,
    },
    DestroyCloud { kind: ResourceKind, id: String },
    Simulated { description: String, action: PlanAction },
}

impl Change {
    pub fn action(&self) -> PlanAction {
        match self {
            Self::InstallPackage { from: None, .. } => PlanAction::Create,
            Self::InstallPackage { from: Some(_), .. } => PlanAction::Update,
            Self::WriteContent { create: true, .. } | Self::CreateCloud { .. } => {
                PlanAction::Create
            }
            Self::RemovePackage { .. } | Self::RemoveFile { .. } | Self::DestroyCloud { .. } => {
                PlanAction::Destroy
            }
            Self::Simulated { action, .. } => *action,
            _ => PlanAction::Update,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstallPackage { name, version, from } => {
                write!(f, "install {}", name)?;
                if let Some(v) = version {
                    write!(f, " {}", v)?;
                }
                if let Some(old) = from {
                    write!(f, " (was {})", old)?;
                }
                Ok(())
            }
            Self::RemovePackage { name } => write!(f, "remove {}", name),
            Self::StartService { name } => write!(f, "start {}", name),
            Self::StopService { name } => write!(f, "stop {}", name),
            Self::EnableService { name } => write!(f, "enable {}", name),
            Self::DisableService { name } => write!(f, "disable {}", name),
            Self::WriteContent { path, create: true } => write!(f, "create {}", path),
            Self::WriteContent { path, create: false } => write!(f, "rewrite {}", path),
            Self::SetMode { path, mode } => write!(f, "chmod {:04o} {}", mode, path),
            Self::SetOwnership { path, owner, group } => write!(
                f,
                "chown {}:{} {}",
                owner.as_deref().unwrap_or(""),
                group.as_deref().unwrap_or(""),
                path
            ),
            Self::RemoveFile { path } => write!(f, "delete {}", path),
            Self::CreateCloud { kind, name, .. } => write!(f, "create {} {}", kind, name),
            Self::UpdateCloud { id, attributes, .. } => {
                let keys: Vec<&str> = attributes.keys().map(String::as_str).collect();
                write!(f, "update {} ({})", id, keys.join(", "))
            }
            Self::DestroyCloud { kind, id } => write!(f, "destroy {} {}", kind, id),
            Self::Simulated { description, .. } => f.write_str(description),
        }
    }
}

/// Ordered set of changes that takes observed state to desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    /// Dominant action: create beats destroy beats update.
    pub fn action(&self) -> PlanAction {
        let actions: Vec<PlanAction> = self.changes.iter().map(Change::action).collect();
        if actions.is_empty() {
            PlanAction::NoOp
        } else if actions.contains(&PlanAction::Create) {
            PlanAction::Create
        } else if actions.contains(&PlanAction::Destroy) {
            PlanAction::Destroy
        } else {
            PlanAction::Update
        }
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.changes.iter().map(ToString::to_string).collect()
    }
}

impl FromIterator<Change> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Change>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Adapter between declared resources of some kinds and the real world.
pub trait Provider: Send + Sync {
    /// Short name for logs and error messages.
    fn name(&self) -> &'static str;

    /// Fill in derived desired state (e.g. rendered templates) before
    /// inspection.
    fn prepare(&self, _resource: &mut ResolvedResource, _ctx: &CallContext) -> std::result::Result<(), InspectionError> {
        Ok(())
    }

    /// Observe current state. Must not mutate anything.
    fn inspect(&self, resource: &ResolvedResource, ctx: &CallContext) -> std::result::Result<ResourceState, InspectionError>;

    /// Changes that take `observed` to the desired state. Pure.
    fn converge(&self, resource: &ResolvedResource, observed: &ResourceState) -> ChangeSet;

    /// Carry out a non-empty change set. Returns outputs for later resources.
    fn apply(
        &self,
        resource: &ResolvedResource,
        changes: &ChangeSet,
        ctx: &CallContext,
    ) -> std::result::Result<Outputs, ApplyError>;
}

/// Providers by resource kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ResourceKind, Arc<dyn Provider>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: BTreeMap<&str, &str> = self
            .providers
            .iter()
            .map(|(k, p)| (k.as_str(), p.name()))
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &entries)
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the provider for `kind`.
    pub fn register(&mut self, kind: ResourceKind, provider: Arc<dyn Provider>) -> &mut Self {
        self.providers.insert(kind, provider);
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, kind: ResourceKind, provider: Arc<dyn Provider>) -> Self {
        self.register(kind, provider);
        self
    }

    pub fn resolve(&self, kind: ResourceKind) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnknownResourceKind(kind.to_string()))
    }

    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.providers.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.providers.keys().copied()
    }

    /// Real providers for host kinds on `target`. Cloud kinds are left
    /// unregistered; callers add a [`CloudProvider`] per kind.
    pub fn host(target: Target, templates: PathBuf) -> Self {
        let local = target.is_local();
        let transport: Arc<dyn Transport> = Arc::new(target);
        let renderer = Arc::new(DirRenderer::new(templates));
        let files = if local {
            FileProvider::new(renderer, Arc::clone(&transport))
        } else {
            FileProvider::over_transport(renderer, Arc::clone(&transport))
        };
        Self::new()
            .with(
                ResourceKind::Package,
                Arc::new(PackageProvider::new(Arc::clone(&transport))),
            )
            .with(
                ResourceKind::Service,
                Arc::new(ServiceProvider::new(Arc::clone(&transport))),
            )
            .with(ResourceKind::File, Arc::new(files))
    }

    /// Register a [`CloudProvider`] over `client` for every cloud kind.
    pub fn with_cloud<C: CloudClient>(mut self, client: Arc<C>) -> Self {
        for kind in ResourceKind::ALL.into_iter().filter(|k| k.is_cloud()) {
            self.register(kind, Arc::new(CloudProvider::new(Arc::clone(&client))));
        }
        self
    }

    /// In-memory providers for every kind. Nothing outside the process is
    /// touched.
    pub fn simulated() -> Self {
        let memory: Arc<dyn Provider> = Arc::new(MemoryProvider::new());
        let mut registry = Self::new();
        for kind in ResourceKind::ALL.into_iter().filter(|k| !k.is_cloud()) {
            registry.register(kind, Arc::clone(&memory));
        }
        registry.with_cloud(Arc::new(InMemoryCloud::new()))
    }
}

/// Run a script and turn a non-zero exit into an [`ApplyError`].
pub(crate) fn run_checked(
    transport: &dyn Transport,
    script: &str,
    timeout: Duration,
) -> std::result::Result<ExecOutput, ApplyError> {
    let out = transport.exec(script, timeout)?;
    if out.success() {
        Ok(out)
    } else {
        Err(ApplyError::Command {
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

/// Run a query script and turn a non-zero exit into an [`InspectionError`].
pub(crate) fn query_checked(
    transport: &dyn Transport,
    script: &str,
    timeout: Duration,
) -> std::result::Result<ExecOutput, InspectionError> {
    let out = transport.exec(script, timeout)?;
    if out.success() {
        Ok(out)
    } else {
        Err(InspectionError::Query {
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

/// Error for a provider handed a resource of a kind it does not manage.
pub(crate) fn kind_mismatch(provider: &'static str, resource: &ResolvedResource) -> InspectionError {
    InspectionError::KindMismatch {
        provider,
        kind: resource.kind.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for provider tests.

    use crate::transport::{ExecOutput, Transport, TransportError};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replies to scripts in order and records what it was asked to run.
    #[derive(Default)]
    pub struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<ExecOutput, TransportError>>>,
        scripts: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn reply(self, exit_code: i32, stdout: &str) -> Self {
            self.replies
                .lock()
                .unwrap()
                .push_back(Ok(ExecOutput {
                    exit_code,
                    stdout: stdout.to_string(),
                    stderr: if exit_code == 0 { String::new() } else { "failed".into() },
                }));
            self
        }

        pub fn fail(self, err: TransportError) -> Self {
            self.replies.lock().unwrap().push_back(Err(err));
            self
        }

        pub fn scripts(&self) -> Vec<String> {
            self.scripts.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn exec(&self, script: &str, _timeout: Duration) -> Result<ExecOutput, TransportError> {
            self.scripts.lock().unwrap().push(script.to_string());
            self.replies.lock().unwrap().pop_front().unwrap_or(Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }))
        }
    }
}
