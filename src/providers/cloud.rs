//! Cloud provider: security groups, compute instances and load balancers
//! behind a [`CloudClient`].
//!
//! Objects are looked up by name. Only attributes a declaration sets are
//! compared, so server-assigned attributes never show up as drift.

use super::{kind_mismatch, CallContext, Change, ChangeSet, Provider, ResolvedResource, ResourceState};
use crate::core::error::{ApplyError, InspectionError};
use crate::core::types::{Outputs, ResourceKind};
use crate::resources::cloud::CloudSpec;
use crate::resources::Desired;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A remote object as the cloud API reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloudObject {
    pub id: String,
    pub attributes: BTreeMap<String, String>,
}

impl CloudObject {
    pub fn outputs(&self) -> Outputs {
        let mut out = self.attributes.clone();
        out.insert("id".into(), self.id.clone());
        out
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Api(String),
}

/// Minimal cloud API surface the provider needs.
pub trait CloudClient: Send + Sync + 'static {
    fn describe(&self, kind: ResourceKind, name: &str) -> Result<Option<CloudObject>, CloudError>;

    fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<CloudObject, CloudError>;

    fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<CloudObject, CloudError>;

    fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), CloudError>;
}

enum CallError {
    Timeout(Duration),
    Cloud(CloudError),
}

impl From<CallError> for InspectionError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Timeout(d) => Self::Timeout(d),
            CallError::Cloud(e) => Self::Cloud(e.to_string()),
        }
    }
}

impl From<CallError> for ApplyError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Timeout(d) => Self::Timeout(d),
            CallError::Cloud(e) => Self::Cloud(e.to_string()),
        }
    }
}

/// Run a client call on a helper thread and stop waiting after `timeout`.
///
/// A call that outlives its deadline is abandoned; its result is dropped
/// when it eventually arrives.
fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, CallError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CloudError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(call());
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result.map_err(CallError::Cloud),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(CallError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(CallError::Cloud(CloudError::Api(
            "cloud call ended without a result".into(),
        ))),
    }
}

fn cloud_spec(desired: &Desired) -> Option<&dyn CloudSpec> {
    match desired {
        Desired::SecurityGroup(s) => Some(s as &dyn CloudSpec),
        Desired::LoadBalancer(l) => Some(l as &dyn CloudSpec),
        Desired::ComputeInstance(i) => Some(i as &dyn CloudSpec),
        _ => None,
    }
}

pub struct CloudProvider<C: CloudClient> {
    client: Arc<C>,
}

impl<C: CloudClient> CloudProvider<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

impl<C: CloudClient> Provider for CloudProvider<C> {
    fn name(&self) -> &'static str {
        "cloud"
    }

    fn inspect(
        &self,
        resource: &ResolvedResource,
        ctx: &CallContext,
    ) -> Result<ResourceState, InspectionError> {
        if cloud_spec(&resource.desired).is_none() {
            return Err(kind_mismatch(self.name(), resource));
        }
        let client = Arc::clone(&self.client);
        let (kind, name) = (resource.kind, resource.name.clone());
        let found = call_with_timeout(ctx.timeout, move || client.describe(kind, &name))?;
        debug!(resource = %resource.reference, found = found.is_some(), "described cloud object");
        Ok(ResourceState::Cloud(found))
    }

    fn converge(&self, resource: &ResolvedResource, observed: &ResourceState) -> ChangeSet {
        let (Some(spec), ResourceState::Cloud(current)) = (cloud_spec(&resource.desired), observed)
        else {
            return ChangeSet::new();
        };

        let mut changes = ChangeSet::new();
        match (spec.presence().is_present(), current) {
            (true, None) => changes.push(Change::CreateCloud {
                kind: resource.kind,
                name: resource.name.clone(),
                attributes: spec.attributes(),
            }),
            (true, Some(obj)) => {
                let differing: BTreeMap<String, String> = spec
                    .attributes()
                    .into_iter()
                    .filter(|(k, v)| obj.attributes.get(k) != Some(v))
                    .collect();
                if !differing.is_empty() {
                    changes.push(Change::UpdateCloud {
                        kind: resource.kind,
                        id: obj.id.clone(),
                        attributes: differing,
                    });
                }
            }
            (false, Some(obj)) => changes.push(Change::DestroyCloud {
                kind: resource.kind,
                id: obj.id.clone(),
            }),
            (false, None) => {}
        }
        changes
    }

    fn apply(
        &self,
        _resource: &ResolvedResource,
        changes: &ChangeSet,
        ctx: &CallContext,
    ) -> Result<Outputs, ApplyError> {
        let mut outputs = Outputs::new();
        for change in changes {
            let client = Arc::clone(&self.client);
            match change.clone() {
                Change::CreateCloud {
                    kind,
                    name,
                    attributes,
                } => {
                    let obj = call_with_timeout(ctx.timeout, move || {
                        client.create(kind, &name, &attributes)
                    })?;
                    outputs = obj.outputs();
                }
                Change::UpdateCloud {
                    kind,
                    id,
                    attributes,
                } => {
                    let obj = call_with_timeout(ctx.timeout, move || {
                        client.update(kind, &id, &attributes)
                    })?;
                    outputs = obj.outputs();
                }
                Change::DestroyCloud { kind, id } => {
                    call_with_timeout(ctx.timeout, move || client.delete(kind, &id))?;
                    outputs.clear();
                }
                other => {
                    return Err(ApplyError::Other(format!(
                        "cloud provider cannot apply '{}'",
                        other
                    )))
                }
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Attributes;
    use crate::providers::InMemoryCloud;
    use crate::resources::parse_desired;

    const CTX: CallContext = CallContext {
        timeout: Duration::from_secs(5),
    };

    fn instance(yaml: &str) -> ResolvedResource {
        let attrs: Attributes = serde_yaml_ng::from_str(yaml).unwrap();
        ResolvedResource {
            reference: "compute_instance[webserver-1]".into(),
            kind: ResourceKind::ComputeInstance,
            name: "webserver-1".into(),
            desired: parse_desired(ResourceKind::ComputeInstance, "webserver-1", &attrs).unwrap(),
        }
    }

    fn cycle(p: &CloudProvider<InMemoryCloud>, r: &ResolvedResource) -> (ChangeSet, Outputs) {
        let observed = p.inspect(r, &CTX).unwrap();
        let changes = p.converge(r, &observed);
        let outputs = if changes.is_empty() {
            observed.outputs()
        } else {
            p.apply(r, &changes, &CTX).unwrap()
        };
        (changes, outputs)
    }

    #[test]
    fn test_create_then_unchanged() {
        let cloud = Arc::new(InMemoryCloud::new());
        let p = CloudProvider::new(Arc::clone(&cloud));
        let r = instance("{ instance_type: t1.micro, image_id: ami-b6bdde86 }");

        let (changes, outputs) = cycle(&p, &r);
        assert_eq!(changes.descriptions(), vec!["create compute_instance webserver-1"]);
        assert!(outputs["id"].starts_with("i-"));

        let (changes, again) = cycle(&p, &r);
        assert!(changes.is_empty());
        assert_eq!(again["id"], outputs["id"]);
    }

    #[test]
    fn test_update_only_differing_attributes() {
        let cloud = Arc::new(InMemoryCloud::new());
        let p = CloudProvider::new(Arc::clone(&cloud));
        cycle(&p, &instance("{ instance_type: t1.micro, image_id: ami-1 }"));

        let (changes, outputs) = cycle(&p, &instance("{ instance_type: m5.large, image_id: ami-1 }"));
        match changes.iter().next() {
            Some(Change::UpdateCloud { attributes, .. }) => {
                assert_eq!(attributes.keys().collect::<Vec<_>>(), vec!["instance_type"]);
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(outputs["instance_type"], "m5.large");
    }

    #[test]
    fn test_absent_destroys() {
        let cloud = Arc::new(InMemoryCloud::new());
        let p = CloudProvider::new(Arc::clone(&cloud));
        cycle(&p, &instance("{ instance_type: t1.micro, image_id: ami-1 }"));
        let (changes, outputs) = cycle(&p, &instance("state: absent"));
        assert_eq!(changes.action(), crate::core::types::PlanAction::Destroy);
        assert!(outputs.is_empty());
        assert!(cloud.object(ResourceKind::ComputeInstance, "webserver-1").is_none());
    }

    #[test]
    fn test_slow_client_times_out() {
        let cloud = Arc::new(InMemoryCloud::with_latency(Duration::from_millis(500)));
        let p = CloudProvider::new(cloud);
        let ctx = CallContext {
            timeout: Duration::from_millis(20),
        };
        let err = p
            .inspect(&instance("{ instance_type: t1.micro, image_id: ami-1 }"), &ctx)
            .unwrap_err();
        assert_eq!(err, InspectionError::Timeout(Duration::from_millis(20)));
    }
}
