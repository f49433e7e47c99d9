//! Package provider: dnf/apt over a script transport.

use super::{
    kind_mismatch, query_checked, run_checked, CallContext, Change, ChangeSet, Provider,
    ResolvedResource, ResourceState,
};
use crate::core::error::{ApplyError, InspectionError};
use crate::core::types::Outputs;
use crate::resources::package::{self, PackageState};
use crate::resources::{Desired, PackageSpec};
use crate::transport::Transport;
use std::sync::Arc;
use tracing::debug;

pub struct PackageProvider {
    transport: Arc<dyn Transport>,
}

impl PackageProvider {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn spec<'r>(&self, resource: &'r ResolvedResource) -> Result<&'r PackageSpec, InspectionError> {
        match resource.desired {
            Desired::Package(ref spec) => Ok(spec),
            _ => Err(kind_mismatch(self.name(), resource)),
        }
    }
}

impl Provider for PackageProvider {
    fn name(&self) -> &'static str {
        "package"
    }

    fn inspect(
        &self,
        resource: &ResolvedResource,
        ctx: &CallContext,
    ) -> Result<ResourceState, InspectionError> {
        let spec = self.spec(resource)?;
        let script = package::query_script(&resource.name, spec.manager);
        let out = query_checked(self.transport.as_ref(), &script, ctx.timeout)?;
        let installed = package::parse_query_output(&out.stdout);
        debug!(package = %resource.name, ?installed, "queried package");
        Ok(ResourceState::Package { installed })
    }

    fn converge(&self, resource: &ResolvedResource, observed: &ResourceState) -> ChangeSet {
        let (Desired::Package(spec), ResourceState::Package { installed }) =
            (&resource.desired, observed)
        else {
            return ChangeSet::new();
        };

        let mut changes = ChangeSet::new();
        if spec.satisfied_by(installed.as_deref()) {
            return changes;
        }
        match spec.state {
            PackageState::Installed => changes.push(Change::InstallPackage {
                name: resource.name.clone(),
                version: spec.version.clone(),
                from: installed.clone(),
            }),
            PackageState::Absent => changes.push(Change::RemovePackage {
                name: resource.name.clone(),
            }),
        }
        changes
    }

    fn apply(
        &self,
        resource: &ResolvedResource,
        changes: &ChangeSet,
        ctx: &CallContext,
    ) -> Result<Outputs, ApplyError> {
        let spec = self
            .spec(resource)
            .map_err(|e| ApplyError::Other(e.to_string()))?;

        for change in changes {
            let script = match change {
                Change::InstallPackage { name, version, .. } => {
                    package::install_script(name, version.as_deref(), spec.manager)
                }
                Change::RemovePackage { name } => package::remove_script(name, spec.manager),
                other => {
                    return Err(ApplyError::Other(format!(
                        "package provider cannot apply '{}'",
                        other
                    )))
                }
            };
            run_checked(self.transport.as_ref(), &script, ctx.timeout)?;
        }

        // Postcondition: report what is installed now.
        Ok(self
            .inspect(resource, ctx)
            .map(|state| state.outputs())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Attributes, ResourceKind};
    use crate::providers::testing::ScriptedTransport;
    use crate::resources::parse_desired;
    use crate::transport::TransportError;
    use std::time::Duration;

    const CTX: CallContext = CallContext {
        timeout: Duration::from_secs(5),
    };

    fn resource(yaml: &str) -> ResolvedResource {
        let attrs: Attributes = serde_yaml_ng::from_str(yaml).unwrap();
        ResolvedResource {
            reference: "package[httpd]".into(),
            kind: ResourceKind::Package,
            name: "httpd".into(),
            desired: parse_desired(ResourceKind::Package, "httpd", &attrs).unwrap(),
        }
    }

    #[test]
    fn test_inspect_missing_package() {
        let transport = Arc::new(ScriptedTransport::default().reply(0, "MISSING\n"));
        let provider = PackageProvider::new(transport.clone());
        let state = provider.inspect(&resource("{}"), &CTX).unwrap();
        assert_eq!(state, ResourceState::Package { installed: None });
        assert!(transport.scripts()[0].contains("rpm -q"));
    }

    #[test]
    fn test_converge_installs_missing() {
        let provider = PackageProvider::new(Arc::new(ScriptedTransport::default()));
        let changes = provider.converge(&resource("{}"), &ResourceState::Package { installed: None });
        assert_eq!(changes.descriptions(), vec!["install httpd"]);
    }

    #[test]
    fn test_converge_satisfied_is_empty() {
        let provider = PackageProvider::new(Arc::new(ScriptedTransport::default()));
        let observed = ResourceState::Package {
            installed: Some("2.4.6-99.el9".into()),
        };
        assert!(provider.converge(&resource("version: 2.4.6"), &observed).is_empty());
        assert!(provider.converge(&resource("{}"), &observed).is_empty());
    }

    #[test]
    fn test_converge_wrong_version_upgrades() {
        let provider = PackageProvider::new(Arc::new(ScriptedTransport::default()));
        let observed = ResourceState::Package {
            installed: Some("2.4.5-1".into()),
        };
        let changes = provider.converge(&resource("version: 2.4.6"), &observed);
        assert_eq!(changes.descriptions(), vec!["install httpd 2.4.6 (was 2.4.5-1)"]);
    }

    #[test]
    fn test_converge_absent_removes() {
        let provider = PackageProvider::new(Arc::new(ScriptedTransport::default()));
        let observed = ResourceState::Package {
            installed: Some("2.4.6-99.el9".into()),
        };
        let changes = provider.converge(&resource("state: absent"), &observed);
        assert_eq!(changes.descriptions(), vec!["remove httpd"]);
    }

    #[test]
    fn test_apply_runs_install_then_requeries() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .reply(0, "")
                .reply(0, "2.4.6-99.el9\n"),
        );
        let provider = PackageProvider::new(transport.clone());
        let r = resource("{}");
        let changes = provider.converge(&r, &ResourceState::Package { installed: None });
        let outputs = provider.apply(&r, &changes, &CTX).unwrap();
        assert_eq!(outputs.get("version").map(String::as_str), Some("2.4.6-99.el9"));
        let scripts = transport.scripts();
        assert!(scripts[0].contains("dnf install -y -q 'httpd'"));
        assert!(scripts[1].contains("rpm -q"));
    }

    #[test]
    fn test_apply_command_failure() {
        let transport = Arc::new(ScriptedTransport::default().reply(1, ""));
        let provider = PackageProvider::new(transport);
        let r = resource("{}");
        let changes = provider.converge(&r, &ResourceState::Package { installed: None });
        let err = provider.apply(&r, &changes, &CTX).unwrap_err();
        assert!(matches!(err, ApplyError::Command { exit_code: 1, .. }));
    }

    #[test]
    fn test_inspect_timeout_maps() {
        let transport = Arc::new(
            ScriptedTransport::default().fail(TransportError::Timeout(Duration::from_secs(5))),
        );
        let provider = PackageProvider::new(transport);
        let err = provider.inspect(&resource("{}"), &CTX).unwrap_err();
        assert_eq!(err, InspectionError::Timeout(Duration::from_secs(5)));
    }
}
