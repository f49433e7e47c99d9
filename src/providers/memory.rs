//! In-process providers for simulation and tests.
//!
//! [`MemoryProvider`] handles any kind by fingerprinting the desired state
//! into a map. [`InMemoryCloud`] is a [`CloudClient`] backed by a map, so the
//! real [`CloudProvider`](super::CloudProvider) can run against it.

use super::cloud::{CloudClient, CloudError, CloudObject};
use super::{CallContext, Change, ChangeSet, Provider, ResolvedResource, ResourceState};
use crate::core::error::{ApplyError, InspectionError};
use crate::core::types::{Outputs, PlanAction, ResourceKind};
use crate::tripwire::hasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Provider operation recorded by [`MemoryProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Inspect,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub kind: CallKind,
    pub resource: String,
}

/// Fake provider that converges resources into an in-memory world.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    world: Mutex<HashMap<String, String>>,
    fail_inspect: Mutex<HashSet<String>>,
    fail_apply: Mutex<HashSet<String>>,
    calls: Mutex<Vec<ProviderCall>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every inspect and apply sleeps for `delay`. A call whose delay
    /// exceeds its timeout gives up at the deadline with a timeout error.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Make `apply` fail for `reference`.
    pub fn fail_apply(&self, reference: &str) {
        lock(&self.fail_apply).insert(reference.to_string());
    }

    /// Make `inspect` fail for `reference`.
    pub fn fail_inspect(&self, reference: &str) {
        lock(&self.fail_inspect).insert(reference.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.fail_apply).clear();
        lock(&self.fail_inspect).clear();
    }

    /// Forget a converged resource, as if changed behind our back.
    pub fn drift(&self, reference: &str) {
        lock(&self.world).remove(reference);
    }

    pub fn is_present(&self, reference: &str) -> bool {
        lock(&self.world).contains_key(reference)
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// References `apply` was called for, in call order.
    pub fn applied(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.kind == CallKind::Apply)
            .map(|c| c.resource.clone())
            .collect()
    }

    pub fn was_called(&self, reference: &str) -> bool {
        lock(&self.calls).iter().any(|c| c.resource == reference)
    }

    /// Highest number of calls that overlapped.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Record the call and sleep out the delay. False when the delay
    /// outlasts `timeout`.
    fn enter(&self, kind: CallKind, reference: &str, timeout: Duration) -> bool {
        lock(&self.calls).push(ProviderCall {
            kind,
            resource: reference.to_string(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay.min(timeout));
        }
        self.delay <= timeout
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn fingerprint(resource: &ResolvedResource) -> String {
        let json = serde_json::to_string(&resource.desired).unwrap_or_default();
        hasher::hash_string(&json)
    }

    fn outputs_for(resource: &ResolvedResource) -> Outputs {
        let mut out = Outputs::new();
        out.insert("id".into(), format!("sim-{}", resource.name));
        out
    }
}

impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn inspect(
        &self,
        resource: &ResolvedResource,
        ctx: &CallContext,
    ) -> Result<ResourceState, InspectionError> {
        let in_time = self.enter(CallKind::Inspect, &resource.reference, ctx.timeout);
        let result = if !in_time {
            Err(InspectionError::Timeout(ctx.timeout))
        } else if lock(&self.fail_inspect).contains(&resource.reference) {
            Err(InspectionError::Other("injected inspection failure".into()))
        } else {
            let fingerprint = lock(&self.world).get(&resource.reference).cloned();
            let outputs = match fingerprint {
                Some(_) => Self::outputs_for(resource),
                None => Outputs::new(),
            };
            Ok(ResourceState::Simulated {
                fingerprint,
                outputs,
            })
        };
        self.leave();
        result
    }

    fn converge(&self, resource: &ResolvedResource, observed: &ResourceState) -> ChangeSet {
        let ResourceState::Simulated { fingerprint, .. } = observed else {
            return ChangeSet::new();
        };
        let mut changes = ChangeSet::new();
        if resource.desired.is_absent() {
            if fingerprint.is_some() {
                changes.push(Change::Simulated {
                    description: format!("remove {}", resource.reference),
                    action: PlanAction::Destroy,
                });
            }
            return changes;
        }
        let want = Self::fingerprint(resource);
        match fingerprint {
            None => changes.push(Change::Simulated {
                description: format!("create {}", resource.reference),
                action: PlanAction::Create,
            }),
            Some(have) if *have != want => changes.push(Change::Simulated {
                description: format!("update {}", resource.reference),
                action: PlanAction::Update,
            }),
            Some(_) => {}
        }
        changes
    }

    fn apply(
        &self,
        resource: &ResolvedResource,
        _changes: &ChangeSet,
        ctx: &CallContext,
    ) -> Result<Outputs, ApplyError> {
        let in_time = self.enter(CallKind::Apply, &resource.reference, ctx.timeout);
        let result = if !in_time {
            Err(ApplyError::Timeout(ctx.timeout))
        } else if lock(&self.fail_apply).contains(&resource.reference) {
            Err(ApplyError::Other("injected apply failure".into()))
        } else if resource.desired.is_absent() {
            lock(&self.world).remove(&resource.reference);
            Ok(Outputs::new())
        } else {
            lock(&self.world).insert(resource.reference.clone(), Self::fingerprint(resource));
            Ok(Self::outputs_for(resource))
        };
        self.leave();
        result
    }
}

/// [`CloudClient`] backed by a map keyed by (kind, name).
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    objects: Mutex<BTreeMap<(ResourceKind, String), CloudObject>>,
    next_id: AtomicU64,
    latency: Duration,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every API call sleeps for `latency` first.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn object(&self, kind: ResourceKind, name: &str) -> Option<CloudObject> {
        lock(&self.objects).get(&(kind, name.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pause(&self) {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
    }
}

impl CloudClient for InMemoryCloud {
    fn describe(&self, kind: ResourceKind, name: &str) -> Result<Option<CloudObject>, CloudError> {
        self.pause();
        Ok(self.object(kind, name))
    }

    fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<CloudObject, CloudError> {
        self.pause();
        let mut objects = lock(&self.objects);
        if objects.contains_key(&(kind, name.to_string())) {
            return Err(CloudError::Api(format!("{} '{}' already exists", kind, name)));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let prefix = match kind {
            ResourceKind::SecurityGroup => "sg",
            ResourceKind::LoadBalancer => "lb",
            _ => "i",
        };
        let mut attrs = attributes.clone();
        match kind {
            ResourceKind::LoadBalancer => {
                attrs.insert("dns_name".into(), format!("{}.elb.internal", name));
            }
            ResourceKind::ComputeInstance => {
                attrs.insert(
                    "private_ip".into(),
                    format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff),
                );
            }
            _ => {}
        }
        let obj = CloudObject {
            id: format!("{}-{:08x}", prefix, n),
            attributes: attrs,
        };
        objects.insert((kind, name.to_string()), obj.clone());
        Ok(obj)
    }

    fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<CloudObject, CloudError> {
        self.pause();
        let mut objects = lock(&self.objects);
        let obj = objects
            .iter_mut()
            .find(|((k, _), o)| *k == kind && o.id == id)
            .map(|(_, o)| o)
            .ok_or_else(|| CloudError::NotFound(id.to_string()))?;
        obj.attributes
            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(obj.clone())
    }

    fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), CloudError> {
        self.pause();
        let mut objects = lock(&self.objects);
        let key = objects
            .iter()
            .find(|((k, _), o)| *k == kind && o.id == id)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| CloudError::NotFound(id.to_string()))?;
        objects.remove(&key);
        Ok(())
    }
}
