//! Service provider: systemd units over a script transport.

use super::{
    kind_mismatch, query_checked, run_checked, CallContext, Change, ChangeSet, Provider,
    ResolvedResource, ResourceState,
};
use crate::core::error::{ApplyError, InspectionError};
use crate::core::types::Outputs;
use crate::resources::service;
use crate::resources::Desired;
use crate::transport::Transport;
use std::sync::Arc;

pub struct ServiceProvider {
    transport: Arc<dyn Transport>,
}

impl ServiceProvider {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl Provider for ServiceProvider {
    fn name(&self) -> &'static str {
        "service"
    }

    fn inspect(
        &self,
        resource: &ResolvedResource,
        ctx: &CallContext,
    ) -> Result<ResourceState, InspectionError> {
        if !matches!(resource.desired, Desired::Service(_)) {
            return Err(kind_mismatch(self.name(), resource));
        }
        let script = service::query_script(&resource.name);
        let out = query_checked(self.transport.as_ref(), &script, ctx.timeout)?;
        let (active, enabled) = service::parse_query_output(&out.stdout);
        Ok(ResourceState::Service { active, enabled })
    }

    fn converge(&self, resource: &ResolvedResource, observed: &ResourceState) -> ChangeSet {
        let (Desired::Service(spec), ResourceState::Service { active, enabled }) =
            (&resource.desired, observed)
        else {
            return ChangeSet::new();
        };

        let name = resource.name.clone();
        let mut changes = ChangeSet::new();
        match (spec.wants_active(), *active) {
            (true, false) => changes.push(Change::StartService { name: name.clone() }),
            (false, true) => changes.push(Change::StopService { name: name.clone() }),
            _ => {}
        }
        match (spec.enabled, *enabled) {
            (Some(true), false) => changes.push(Change::EnableService { name }),
            (Some(false), true) => changes.push(Change::DisableService { name }),
            _ => {}
        }
        changes
    }

    fn apply(
        &self,
        resource: &ResolvedResource,
        changes: &ChangeSet,
        ctx: &CallContext,
    ) -> Result<Outputs, ApplyError> {
        let mut verbs = Vec::with_capacity(changes.len());
        for change in changes {
            verbs.push(match change {
                Change::StartService { .. } => "start",
                Change::StopService { .. } => "stop",
                Change::EnableService { .. } => "enable",
                Change::DisableService { .. } => "disable",
                other => {
                    return Err(ApplyError::Other(format!(
                        "service provider cannot apply '{}'",
                        other
                    )))
                }
            });
        }

        let script = service::systemctl_script(&resource.name, &verbs);
        run_checked(self.transport.as_ref(), &script, ctx.timeout)?;

        Ok(self
            .inspect(resource, ctx)
            .map(|state| state.outputs())
            .unwrap_or_default())
    }
}
