//! Plan generation: inspect and diff every resource without applying.
//!
//! A resource whose attributes read outputs of a resource that would change
//! cannot be diffed yet; it is planned as [`PlanAction::Deferred`].

use super::error::{Error, Result, TemplateError};
use super::graph::Graph;
use super::resolver::{self, TemplateContext};
use super::types::{ExecutionPlan, Outputs, PlanAction, PlannedChange};
use crate::providers::{CallContext, ProviderRegistry, ResolvedResource};
use crate::resources;
use std::collections::HashMap;
use std::time::Duration;

/// Build an execution plan for `graph`.
pub fn plan(name: &str, graph: &Graph, registry: &ProviderRegistry, timeout: Duration) -> Result<ExecutionPlan> {
    let providers = graph
        .resources()
        .iter()
        .map(|r| registry.resolve(r.kind()))
        .collect::<Result<Vec<_>>>()?;
    let ctx = CallContext { timeout };

    let mut outputs: HashMap<String, Outputs> = HashMap::new();
    let mut changes = Vec::with_capacity(graph.len());
    let (mut to_create, mut to_update, mut to_destroy, mut unchanged, mut deferred) =
        (0u32, 0u32, 0u32, 0u32, 0u32);

    for (resource, provider) in graph.resources().iter().zip(&providers) {
        let reference = resource.reference().to_string();
        let planned = |action: PlanAction, description: String| PlannedChange {
            resource: reference.clone(),
            kind: resource.kind(),
            action,
            description,
        };

        let attributes = match resolver::resolve_attributes(
            resource.attributes(),
            &TemplateContext::outputs(&outputs),
        ) {
            Ok(attrs) => attrs,
            Err(TemplateError::UnresolvedOutput { resource: upstream, .. }) => {
                deferred += 1;
                changes.push(planned(
                    PlanAction::Deferred,
                    format!("{}: waits on outputs of {}", reference, upstream),
                ));
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let desired = resources::parse_desired(resource.kind(), resource.name(), &attributes)
            .map_err(|m| Error::invalid(&reference, m))?;
        let mut resolved = ResolvedResource {
            reference: reference.clone(),
            kind: resource.kind(),
            name: resource.name().to_string(),
            desired,
        };

        let inspected = provider
            .prepare(&mut resolved, &ctx)
            .and_then(|()| provider.inspect(&resolved, &ctx));
        let observed = match inspected {
            Ok(state) => state,
            Err(e) => {
                deferred += 1;
                changes.push(planned(
                    PlanAction::Deferred,
                    format!("{}: cannot inspect ({})", reference, e),
                ));
                continue;
            }
        };

        let diff = provider.converge(&resolved, &observed);
        let action = diff.action();
        match action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::Destroy => to_destroy += 1,
            PlanAction::NoOp => unchanged += 1,
            PlanAction::Deferred => deferred += 1,
        }

        let description = if diff.is_empty() {
            for name in resource.names() {
                outputs.insert(name.to_string(), observed.outputs());
            }
            format!("{}: in sync", reference)
        } else {
            format!("{}: {}", reference, diff.descriptions().join(", "))
        };
        changes.push(planned(action, description));
    }

    Ok(ExecutionPlan {
        name: name.to_string(),
        changes,
        to_create,
        to_update,
        to_destroy,
        unchanged,
        deferred,
    })
}
