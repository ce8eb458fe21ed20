//! Identifier registry.
//!
//! Maps caller-chosen string identifiers to the construction recipe of a
//! derived event: its filter and a reference to its source.  Recipes are
//! stored postcard-encoded so a restore rebuilds the chain from the
//! serialised form and never from live graph state.
//!
//! The registry belongs to the [`Device`](crate::device::Device) and
//! outlives individual connections, which is what makes restoring after
//! a reconnect possible.  Filters live on the board across connections,
//! so each binding also remembers whether the board still holds its
//! chain.  The slots of such resident chains stay reserved until they
//! are restored.

use std::collections::{BTreeMap, HashSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::FilterSpec;
use crate::register::{DataKind, RegisterAddr};

/// Nesting limit for recipe chains (inline sources plus identifier hops).
pub const MAX_RECIPE_DEPTH: usize = 32;

/// Where a derived event takes its input from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceRef {
    /// A physical occurrence register.
    Root { addr: RegisterAddr, kind: DataKind },
    /// Another identified event, looked up again at restore time.
    Identifier(String),
    /// An anonymous derived event, described inline.
    Filter(Box<EventRecipe>),
}

/// Everything needed to rebuild one derived event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecipe {
    pub source: SourceRef,
    pub filter: FilterSpec,
    /// Filter output register the event was built at.
    pub output: RegisterAddr,
}

impl EventRecipe {
    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|_| Error::Encoding("event recipe"))
    }

    /// Decode and sanity-check a stored recipe.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let recipe: Self =
            postcard::from_bytes(bytes).map_err(|_| Error::Encoding("event recipe"))?;
        if recipe.inline_depth() > MAX_RECIPE_DEPTH {
            return Err(Error::InvalidArgument("event recipe nested too deeply"));
        }
        Ok(recipe)
    }

    /// Number of filters described inline, this one included.
    pub fn inline_depth(&self) -> usize {
        let mut depth = 1;
        let mut source = &self.source;
        while let SourceRef::Filter(inner) = source {
            depth += 1;
            source = &inner.source;
        }
        depth
    }

    /// Filter slots of this recipe and of every filter described inline.
    pub fn slots(&self) -> Vec<u8> {
        let mut slots = vec![self.output.index];
        let mut source = &self.source;
        while let SourceRef::Filter(inner) = source {
            slots.push(inner.output.index);
            source = &inner.source;
        }
        slots
    }
}

#[derive(Debug)]
struct Binding {
    recipe: Vec<u8>,
    slots: Vec<u8>,
    /// Whether the board holds the chain from an earlier session.
    resident: bool,
}

/// Identifier → recipe table.
#[derive(Debug, Default)]
pub struct IdentifierRegistry {
    entries: BTreeMap<String, Binding>,
}

impl IdentifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identifier` to `recipe`.  An already bound identifier is
    /// left untouched.
    pub fn bind(&mut self, identifier: &str, recipe: &EventRecipe) -> Result<()> {
        self.check_available(identifier)?;
        let bytes = recipe.encode()?;
        debug!(
            "registry: bound '{}' ({} bytes, {})",
            identifier,
            bytes.len(),
            recipe.filter
        );
        self.entries.insert(
            identifier.to_owned(),
            Binding {
                recipe: bytes,
                slots: recipe.slots(),
                resident: false,
            },
        );
        Ok(())
    }

    /// Record whether the board holds the chain bound to `identifier`.
    pub fn set_resident(&mut self, identifier: &str, resident: bool) {
        if let Some(binding) = self.entries.get_mut(identifier) {
            if binding.resident != resident {
                debug!("registry: '{}' resident on board: {}", identifier, resident);
                binding.resident = resident;
            }
        }
    }

    pub fn is_resident(&self, identifier: &str) -> bool {
        self.entries.get(identifier).is_some_and(|b| b.resident)
    }

    /// Filter slots held on the board by resident bindings.
    pub fn reserved_slots(&self) -> HashSet<u8> {
        self.entries
            .values()
            .filter(|b| b.resident)
            .flat_map(|b| b.slots.iter().copied())
            .collect()
    }

    /// Whether `identifier` could be bound right now.
    pub fn check_available(&self, identifier: &str) -> Result<()> {
        if identifier.is_empty() {
            return Err(Error::InvalidArgument("identifier must not be empty"));
        }
        if self.entries.contains_key(identifier) {
            return Err(Error::DuplicateIdentifier(identifier.to_owned()));
        }
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Result<Option<EventRecipe>> {
        self.entries
            .get(identifier)
            .map(|b| EventRecipe::decode(&b.recipe))
            .transpose()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }

    /// Unbind `identifier`.  Returns whether it was bound.
    pub fn forget(&mut self, identifier: &str) -> bool {
        self.entries.remove(identifier).is_some()
    }

    /// Bound identifiers in lexicographic order.
    pub fn identifiers(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decoded copy of every binding.
    pub fn snapshot(&self) -> Result<RegistrySnapshot> {
        let mut entries = BTreeMap::new();
        for (id, binding) in &self.entries {
            entries.insert(id.clone(), EventRecipe::decode(&binding.recipe)?);
        }
        Ok(RegistrySnapshot { entries })
    }
}

/// Serialisable view of the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub entries: BTreeMap<String, EventRecipe>,
}

impl RegistrySnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|_| Error::Encoding("registry snapshot"))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|_| Error::Encoding("registry snapshot"))
    }
}
