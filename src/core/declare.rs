//! Resource declarations.
//!
//! Declaring a resource validates its attributes against the kind's schema
//! and registers its identity. Nothing here touches real-world state.

use super::error::{Error, Result};
use super::types::{canonical_ref, Attributes, Constraints, ResourceKind};
use crate::resources;
use rustc_hash::FxHashMap;

/// A declared resource. Immutable once declared.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    kind: ResourceKind,
    name: String,
    reference: String,
    alias: Option<String>,
    attributes: Attributes,
    constraints: Constraints,
    seq: usize,
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical `kind[name]` reference.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Alias when declared, canonical reference otherwise.
    pub fn label(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.reference)
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Position in declaration order.
    pub fn seq(&self) -> usize {
        self.seq
    }

    /// Every name this resource can be referenced by.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.reference.as_str()).chain(self.alias.as_deref())
    }
}

/// The set of resources declared for one run, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Declarations {
    resources: Vec<Resource>,
    by_identity: FxHashMap<(ResourceKind, String), usize>,
    by_ref: FxHashMap<String, usize>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a resource referenced by its canonical `kind[name]`.
    pub fn declare(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        attributes: Attributes,
        constraints: Constraints,
    ) -> Result<&Resource> {
        self.declare_with_id(kind, name, None, attributes, constraints)
    }

    /// Declare a resource that can also be referenced by `id`.
    pub fn declare_with_id(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        id: Option<String>,
        attributes: Attributes,
        constraints: Constraints,
    ) -> Result<&Resource> {
        let name = name.into();
        let reference = canonical_ref(kind, &name);

        // An earlier alias may already spell this canonical reference.
        if self.by_identity.contains_key(&(kind, name.clone()))
            || self.by_ref.contains_key(&reference)
        {
            return Err(Error::DuplicateResource(reference));
        }
        if let Some(ref alias) = id {
            if alias.is_empty() {
                return Err(Error::invalid(&reference, "id must not be empty"));
            }
            if self.by_ref.contains_key(alias) || *alias == reference {
                return Err(Error::DuplicateResource(alias.clone()));
            }
        }
        if name.is_empty() {
            return Err(Error::invalid(&reference, "name must not be empty"));
        }

        resources::parse_desired(kind, &name, &attributes)
            .map_err(|message| Error::invalid(&reference, message))?;

        let seq = self.resources.len();
        self.by_identity.insert((kind, name.clone()), seq);
        self.by_ref.insert(reference.clone(), seq);
        if let Some(ref alias) = id {
            self.by_ref.insert(alias.clone(), seq);
        }
        self.resources.push(Resource {
            kind,
            name,
            reference,
            alias: id,
            attributes,
            constraints,
            seq,
        });
        Ok(&self.resources[seq])
    }

    /// Find a resource by alias or canonical reference.
    pub fn lookup(&self, reference: &str) -> Option<&Resource> {
        self.index_of(reference).map(|i| &self.resources[i])
    }

    pub fn index_of(&self, reference: &str) -> Option<usize> {
        self.by_ref.get(reference).copied()
    }

    pub fn get(&self, seq: usize) -> Option<&Resource> {
        self.resources.get(seq)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resource> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl<'a> IntoIterator for &'a Declarations {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
