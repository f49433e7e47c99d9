//! Typed desired state per resource kind.
//!
//! Each kind module provides:
//! 1. A spec struct deserialized from the declaration's attributes
//!    (unknown attributes are rejected)
//! 2. Validation of the resource name and attribute values
//! 3. For host kinds, the purified shell that queries and converges state

pub mod cloud;
pub mod file;
pub mod package;
pub mod service;

use crate::core::types::{Attributes, ResourceKind};
use serde::Serialize;

pub use cloud::{InstanceSpec, LoadBalancerSpec, SecurityGroupSpec};
pub use file::FileSpec;
pub use package::PackageSpec;
pub use service::ServiceSpec;

/// Desired state of one resource, parsed against its kind's schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Desired {
    Package(PackageSpec),
    Service(ServiceSpec),
    File(FileSpec),
    SecurityGroup(SecurityGroupSpec),
    LoadBalancer(LoadBalancerSpec),
    ComputeInstance(InstanceSpec),
}

impl Desired {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Package(_) => ResourceKind::Package,
            Self::Service(_) => ResourceKind::Service,
            Self::File(_) => ResourceKind::File,
            Self::SecurityGroup(_) => ResourceKind::SecurityGroup,
            Self::LoadBalancer(_) => ResourceKind::LoadBalancer,
            Self::ComputeInstance(_) => ResourceKind::ComputeInstance,
        }
    }

    /// Whether the declaration asks for the resource to not exist.
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Package(p) => p.state == package::PackageState::Absent,
            Self::Service(_) => false,
            Self::File(f) => f.state == file::FileState::Absent,
            Self::SecurityGroup(s) => !s.state.is_present(),
            Self::LoadBalancer(l) => !l.state.is_present(),
            Self::ComputeInstance(i) => !i.state.is_present(),
        }
    }
}

/// Parse and validate attributes against the schema of `kind`.
pub fn parse_desired(
    kind: ResourceKind,
    name: &str,
    attributes: &Attributes,
) -> Result<Desired, String> {
    let value = serde_yaml_ng::Value::Mapping(
        attributes
            .iter()
            .map(|(k, v)| (serde_yaml_ng::Value::String(k.clone()), v.clone()))
            .collect(),
    );

    let desired = match kind {
        ResourceKind::Package => Desired::Package(from_value(value)?),
        ResourceKind::Service => Desired::Service(from_value(value)?),
        ResourceKind::File => Desired::File(from_value(value)?),
        ResourceKind::SecurityGroup => Desired::SecurityGroup(from_value(value)?),
        ResourceKind::LoadBalancer => Desired::LoadBalancer(from_value(value)?),
        ResourceKind::ComputeInstance => Desired::ComputeInstance(from_value(value)?),
    };

    match &desired {
        Desired::Package(p) => p.validate(name)?,
        Desired::Service(s) => s.validate(name)?,
        Desired::File(f) => f.validate(name)?,
        Desired::SecurityGroup(s) => s.validate(name)?,
        Desired::LoadBalancer(l) => l.validate(name)?,
        Desired::ComputeInstance(i) => i.validate(name)?,
    }

    Ok(desired)
}

fn from_value<T: serde::de::DeserializeOwned>(value: serde_yaml_ng::Value) -> Result<T, String> {
    serde_yaml_ng::from_value(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(yaml: &str) -> Attributes {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_package_defaults() {
        let d = parse_desired(ResourceKind::Package, "httpd", &Attributes::new()).unwrap();
        assert_eq!(d.kind(), ResourceKind::Package);
        assert!(!d.is_absent());
    }

    #[test]
    fn test_parse_rejects_unknown_attribute() {
        let err = parse_desired(ResourceKind::Service, "httpd", &attrs("colour: blue")).unwrap_err();
        assert!(err.contains("colour"), "{}", err);
    }

    #[test]
    fn test_parse_absent_file() {
        let d = parse_desired(ResourceKind::File, "/tmp/x", &attrs("state: absent")).unwrap();
        assert!(d.is_absent());
    }

    #[test]
    fn test_parse_validates_name() {
        assert!(parse_desired(ResourceKind::File, "relative/path", &Attributes::new()).is_err());
    }

    #[test]
    fn test_desired_serializes_with_kind_tag() {
        let d = parse_desired(ResourceKind::Service, "httpd", &Attributes::new()).unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"kind\":\"service\""));
    }
}
