//! Cloud resources: security groups, compute instances, load balancers.
//!
//! Each spec flattens into a string attribute map. The cloud provider diffs
//! that map against the remote object's attributes, so only keys a
//! declaration actually sets are ever compared.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static CLOUD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,254}$").expect("static regex"));

/// Whether a cloud object should exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    #[default]
    Present,
    Absent,
}

impl Presence {
    pub fn is_present(self) -> bool {
        self == Self::Present
    }
}

/// Common view of cloud specs used by the cloud provider.
pub trait CloudSpec {
    fn presence(&self) -> Presence;

    /// Desired attributes as the cloud API stores them.
    fn attributes(&self) -> BTreeMap<String, String>;
}

fn validate_name(name: &str) -> Result<(), String> {
    if CLOUD_NAME.is_match(name) {
        Ok(())
    } else {
        Err(format!("invalid cloud resource name '{}'", name))
    }
}

fn join_list(items: &[String]) -> String {
    items.join(",")
}

fn sorted_list(items: &[String]) -> String {
    let mut sorted = items.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted.join(",")
}

// ============================================================================
// Security group
// ============================================================================

/// Inbound rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngressRule {
    pub port: u16,
    #[serde(default = "default_tcp")]
    pub protocol: String,
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
}

fn default_tcp() -> String {
    "tcp".to_string()
}

fn default_sources() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityGroupSpec {
    #[serde(default)]
    pub state: Presence,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub inbound: Vec<IngressRule>,
}

impl SecurityGroupSpec {
    pub fn validate(&self, name: &str) -> Result<(), String> {
        validate_name(name)?;
        if let Some(rule) = self.inbound.iter().find(|r| r.port == 0) {
            return Err(format!("inbound rule has port 0 ({})", rule.protocol));
        }
        Ok(())
    }
}

impl CloudSpec for SecurityGroupSpec {
    fn presence(&self) -> Presence {
        self.state
    }

    fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        if let Some(ref d) = self.description {
            attrs.insert("description".to_string(), d.clone());
        }
        if let Some(ref v) = self.vpc_id {
            attrs.insert("vpc_id".to_string(), v.clone());
        }
        if !self.inbound.is_empty() {
            let rules = serde_json::to_string(&self.inbound).unwrap_or_default();
            attrs.insert("inbound".to_string(), rules);
        }
        attrs
    }
}

// ============================================================================
// Compute instance
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceSpec {
    #[serde(default)]
    pub state: Presence,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub ssh_username: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
}

impl InstanceSpec {
    pub fn validate(&self, name: &str) -> Result<(), String> {
        validate_name(name)?;
        if self.state.is_present() {
            if self.instance_type.is_none() {
                return Err("instance_type is required".to_string());
            }
            if self.image_id.is_none() {
                return Err("image_id is required".to_string());
            }
        }
        Ok(())
    }
}

impl CloudSpec for InstanceSpec {
    fn presence(&self) -> Presence {
        self.state
    }

    fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        if let Some(ref t) = self.instance_type {
            attrs.insert("instance_type".to_string(), t.clone());
        }
        if let Some(ref i) = self.image_id {
            attrs.insert("image_id".to_string(), i.clone());
        }
        if let Some(ref u) = self.ssh_username {
            attrs.insert("ssh_username".to_string(), u.clone());
        }
        if !self.tags.is_empty() {
            attrs.insert("tags".to_string(), sorted_list(&self.tags));
        }
        if !self.security_groups.is_empty() {
            attrs.insert(
                "security_groups".to_string(),
                sorted_list(&self.security_groups),
            );
        }
        attrs
    }
}

// ============================================================================
// Load balancer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Listener {
    pub port: u16,
    #[serde(default = "default_http")]
    pub protocol: String,
    pub instance_port: u16,
    #[serde(default = "default_http")]
    pub instance_protocol: String,
}

fn default_http() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadBalancerSpec {
    #[serde(default)]
    pub state: Presence,
    #[serde(default)]
    pub availability_zones: Vec<String>,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    /// Registered instances (usually `{{output.compute_instance[..].id}}`)
    #[serde(default)]
    pub machines: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
}

impl LoadBalancerSpec {
    pub fn validate(&self, name: &str) -> Result<(), String> {
        validate_name(name)?;
        if self.state.is_present() && self.listeners.is_empty() {
            return Err("a load balancer needs at least one listener".to_string());
        }
        if self
            .listeners
            .iter()
            .any(|l| l.port == 0 || l.instance_port == 0)
        {
            return Err("listener ports must be non-zero".to_string());
        }
        Ok(())
    }
}

impl CloudSpec for LoadBalancerSpec {
    fn presence(&self) -> Presence {
        self.state
    }

    fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        if !self.availability_zones.is_empty() {
            attrs.insert(
                "availability_zones".to_string(),
                join_list(&self.availability_zones),
            );
        }
        if !self.listeners.is_empty() {
            let listeners = serde_json::to_string(&self.listeners).unwrap_or_default();
            attrs.insert("listeners".to_string(), listeners);
        }
        if !self.machines.is_empty() {
            attrs.insert("machines".to_string(), sorted_list(&self.machines));
        }
        if !self.security_groups.is_empty() {
            attrs.insert(
                "security_groups".to_string(),
                sorted_list(&self.security_groups),
            );
        }
        attrs
    }
}
