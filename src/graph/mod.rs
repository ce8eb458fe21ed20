//! Event graph.
//!
//! A directed acyclic graph of event nodes for one connection session:
//!
//! ```text
//!   switch (root) ──▶ accumulate ──▶ periodic-sample(1000)
//!        │
//!        └──────────▶ read-coupled(temperature)
//! ```
//!
//! Root nodes are physical occurrences and are memoised by register
//! address: asking twice returns the same [`Event`].  Derived nodes are
//! filters, created fresh on every derivation.  The graph keeps only a
//! weak reference to a derived event's handle; once the caller drops the
//! last handle and no live descendant depends on the node, it is pruned.
//!
//! Propagation is push-based and pre-order: a node's own firing is
//! recorded before any of its children are evaluated, and children are
//! visited in edge order.

pub mod filter;

pub use filter::{Comparison, Evaluation, FilterSpec, FilterState};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::{Rc, Weak};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::register::{DataKind, Register, RegisterAddr, Value};
use crate::registry::{EventRecipe, SourceRef};
use crate::session::ConnectionId;

// ---------------------------------------------------------------------------
// Event handle
// ---------------------------------------------------------------------------

/// Graph-local identity of an event node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u32);

#[derive(Debug)]
struct EventHandle {
    id: EventId,
    addr: RegisterAddr,
    kind: DataKind,
    connection: ConnectionId,
    root: bool,
}

/// Caller-held handle to an event.
///
/// Cloning shares the handle.  Two `Event`s compare equal only when they
/// are the same instance.
#[derive(Debug, Clone)]
pub struct Event {
    inner: Rc<EventHandle>,
}

impl Event {
    pub fn id(&self) -> EventId {
        self.inner.id
    }

    /// `true` for physical occurrences, `false` for filter outputs.
    pub fn is_root(&self) -> bool {
        self.inner.root
    }
}

impl Register for Event {
    fn addr(&self) -> RegisterAddr {
        self.inner.addr
    }

    fn kind(&self) -> DataKind {
        self.inner.kind
    }

    fn connection(&self) -> ConnectionId {
        self.inner.connection
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Event {}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

enum Holder {
    /// Root events are owned by the graph itself.
    Strong(Rc<EventHandle>),
    /// Derived events are owned by the caller.
    Weak(Weak<EventHandle>),
}

struct Node {
    holder: Holder,
    addr: RegisterAddr,
    kind: DataKind,
    source: Option<EventId>,
    children: Vec<EventId>,
    filter: Option<FilterState>,
    identifier: Option<String>,
    /// Whether the board has been told to instantiate this filter.
    materialized: bool,
}

impl Node {
    fn handle(&self) -> Option<Rc<EventHandle>> {
        match &self.holder {
            Holder::Strong(rc) => Some(Rc::clone(rc)),
            Holder::Weak(weak) => weak.upgrade(),
        }
    }

    fn is_held(&self) -> bool {
        match &self.holder {
            Holder::Strong(_) => true,
            Holder::Weak(weak) => weak.strong_count() > 0,
        }
    }
}

/// A derived node removed by [`EventGraph::prune`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedNode {
    pub id: EventId,
    pub addr: RegisterAddr,
    pub materialized: bool,
    pub identifier: Option<String>,
}

/// Result of one propagation pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Propagation {
    /// Every node that fired, in pre-order, with its computed value.
    pub firings: Vec<(EventId, Value)>,
    /// Read-coupled nodes whose branch is suspended on a register read.
    pub reads: Vec<(EventId, RegisterAddr)>,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// The event graph of one connection session.
pub struct EventGraph {
    connection: ConnectionId,
    nodes: BTreeMap<EventId, Node>,
    roots: HashMap<RegisterAddr, EventId>,
    next_id: u32,
}

impl EventGraph {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            nodes: BTreeMap::new(),
            roots: HashMap::new(),
            next_id: 0,
        }
    }

    // ── Construction ──────────────────────────────────────────

    /// Memoising factory for root events.
    pub fn root(&mut self, addr: RegisterAddr, kind: DataKind) -> Result<Event> {
        if addr.is_filter_output() {
            return Err(Error::InvalidArgument("filter outputs cannot be root events"));
        }
        if let Some(node) = self.roots.get(&addr).and_then(|id| self.nodes.get(id)) {
            if node.kind != kind {
                return Err(Error::InvalidArgument(
                    "root event already exists with a different data kind",
                ));
            }
            if let Some(handle) = node.handle() {
                return Ok(Event { inner: handle });
            }
        }

        let id = self.alloc_id();
        let handle = Rc::new(EventHandle {
            id,
            addr,
            kind,
            connection: self.connection,
            root: true,
        });
        self.nodes.insert(
            id,
            Node {
                holder: Holder::Strong(Rc::clone(&handle)),
                addr,
                kind,
                source: None,
                children: Vec::new(),
                filter: None,
                identifier: None,
                materialized: true,
            },
        );
        self.roots.insert(addr, id);
        debug!("graph: root event {} at {}", id.0, addr);
        Ok(Event { inner: handle })
    }

    /// Plain constructor for derived events.
    ///
    /// `max_filters` bounds the number of derived nodes alive at once;
    /// `reserved` slots are never picked.
    pub fn derive(
        &mut self,
        source: &Event,
        spec: FilterSpec,
        max_filters: u8,
        reserved: &HashSet<u8>,
    ) -> Result<Event> {
        spec.validate()?;
        self.source_kind(source)?;
        let slot = self
            .free_slot(max_filters, reserved)
            .ok_or(Error::ResourceExhausted("no free filter slot on the board"))?;
        self.derive_at(source, spec, slot, false)
    }

    /// Derived event at a given filter slot.  `materialized` marks a
    /// filter the board already holds.
    pub fn derive_at(
        &mut self,
        source: &Event,
        spec: FilterSpec,
        slot: u8,
        materialized: bool,
    ) -> Result<Event> {
        spec.validate()?;
        let source_id = source.id();
        let source_kind = self.source_kind(source)?;
        if self.slot_in_use(slot) {
            return Err(Error::InvalidArgument("filter slot already in use"));
        }

        let id = self.alloc_id();
        let addr = RegisterAddr::filter_output(slot);
        let kind = spec.output_kind(source_kind);
        let handle = Rc::new(EventHandle {
            id,
            addr,
            kind,
            connection: self.connection,
            root: false,
        });
        debug!(
            "graph: derived event {} ({}) from {} at {}",
            id.0, spec, source_id.0, addr
        );
        self.nodes.insert(
            id,
            Node {
                holder: Holder::Weak(Rc::downgrade(&handle)),
                addr,
                kind,
                source: Some(source_id),
                children: Vec::new(),
                filter: Some(FilterState::new(spec)),
                identifier: None,
                materialized,
            },
        );
        if let Some(parent) = self.nodes.get_mut(&source_id) {
            parent.children.push(id);
        }
        Ok(Event { inner: handle })
    }

    /// Hand out a fresh handle for a node whose previous handles were all
    /// dropped while a descendant kept it alive.
    pub fn revive(&mut self, id: EventId) -> Option<Event> {
        let node = self.nodes.get_mut(&id)?;
        if let Some(handle) = node.handle() {
            return Some(Event { inner: handle });
        }
        let handle = Rc::new(EventHandle {
            id,
            addr: node.addr,
            kind: node.kind,
            connection: self.connection,
            root: node.source.is_none(),
        });
        node.holder = Holder::Weak(Rc::downgrade(&handle));
        Some(Event { inner: handle })
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn root_by_addr(&self, addr: RegisterAddr) -> Option<EventId> {
        self.roots.get(&addr).copied()
    }

    /// Derived node occupying the filter output `addr`.
    pub fn derived_at(&self, addr: RegisterAddr) -> Option<EventId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.source.is_some() && n.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn slot_in_use(&self, slot: u8) -> bool {
        self.nodes
            .values()
            .any(|n| n.source.is_some() && n.addr.index == slot)
    }

    pub fn addr_of(&self, id: EventId) -> Option<RegisterAddr> {
        self.nodes.get(&id).map(|n| n.addr)
    }

    pub fn kind_of(&self, id: EventId) -> Option<DataKind> {
        self.nodes.get(&id).map(|n| n.kind)
    }

    pub fn filter_of(&self, id: EventId) -> Option<&FilterSpec> {
        self.nodes.get(&id)?.filter.as_ref().map(FilterState::spec)
    }

    /// Walk upstream to the root of `id`'s chain.
    pub fn root_of(&self, id: EventId) -> Option<EventId> {
        let mut current = id;
        loop {
            match self.nodes.get(&current)?.source {
                Some(parent) => current = parent,
                None => return Some(current),
            }
        }
    }

    /// Ancestors of `id` (inclusive), root first.
    pub fn chain(&self, id: EventId) -> Vec<EventId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            let Some(node) = self.nodes.get(&cur) else {
                break;
            };
            chain.push(cur);
            current = node.source;
        }
        chain.reverse();
        chain
    }

    /// `id` and every node downstream of it.
    pub fn subtree(&self, id: EventId) -> Vec<EventId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.nodes.get(&cur) {
                out.push(cur);
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// `ids` plus all of their ancestors.
    pub fn with_ancestors(&self, ids: impl IntoIterator<Item = EventId>) -> HashSet<EventId> {
        let mut out = HashSet::new();
        for id in ids {
            for ancestor in self.chain(id) {
                out.insert(ancestor);
            }
        }
        out
    }

    pub fn set_identifier(&mut self, id: EventId, identifier: &str) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.identifier = Some(identifier.to_owned());
        }
    }

    pub fn clear_identifier(&mut self, id: EventId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.identifier = None;
        }
    }

    /// Every identified node with whether it is materialized.
    pub fn identified(&self) -> impl Iterator<Item = (&str, bool)> + '_ {
        self.nodes
            .values()
            .filter_map(|n| n.identifier.as_deref().map(|name| (name, n.materialized)))
    }

    /// Node currently carrying `identifier`, if any.
    pub fn find_identified(&self, identifier: &str) -> Option<EventId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.identifier.as_deref() == Some(identifier))
            .map(|(id, _)| *id)
    }

    pub fn is_materialized(&self, id: EventId) -> bool {
        self.nodes.get(&id).is_some_and(|n| n.materialized)
    }

    pub fn mark_materialized(&mut self, id: EventId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.materialized = true;
        }
    }

    /// Construction recipe of a derived node.  Sources that carry their
    /// own identifier are referenced by name; anonymous derived sources
    /// are inlined.  Returns `None` for roots and unknown ids.
    pub fn recipe_of(&self, id: EventId) -> Option<EventRecipe> {
        let node = self.nodes.get(&id)?;
        let filter = node.filter.as_ref()?.spec().clone();
        let source_id = node.source?;
        let source_node = self.nodes.get(&source_id)?;

        let source = if source_node.source.is_none() {
            SourceRef::Root {
                addr: source_node.addr,
                kind: source_node.kind,
            }
        } else if let Some(name) = &source_node.identifier {
            SourceRef::Identifier(name.clone())
        } else {
            SourceRef::Filter(Box::new(self.recipe_of(source_id)?))
        };
        Some(EventRecipe {
            source,
            filter,
            output: node.addr,
        })
    }

    // ── Propagation ───────────────────────────────────────────

    /// Push a firing of `start` carrying `value` through the graph.
    ///
    /// `start` itself is recorded as fired, then its children are
    /// evaluated depth-first in edge order.  A read-coupled child only
    /// suspends on a read when it is in `read_wanted`; otherwise its
    /// branch ends there.
    pub fn propagate(
        &mut self,
        start: EventId,
        value: Value,
        timestamp_ms: u64,
        read_wanted: &HashSet<EventId>,
    ) -> Propagation {
        let mut out = Propagation::default();
        let mut stack = vec![(start, value)];

        while let Some((id, value)) = stack.pop() {
            let children = match self.nodes.get(&id) {
                Some(node) => node.children.clone(),
                None => continue,
            };
            trace!("graph: node {} fired with {}", id.0, value);

            let mut fired_children = Vec::new();
            for child in children {
                let Some(filter) = self.nodes.get_mut(&child).and_then(|n| n.filter.as_mut())
                else {
                    continue;
                };
                match filter.evaluate(&value, timestamp_ms) {
                    Evaluation::Fire(v) => fired_children.push((child, v)),
                    Evaluation::Suppress => {}
                    Evaluation::Read(addr) => {
                        if read_wanted.contains(&child) {
                            out.reads.push((child, addr));
                        }
                    }
                }
            }

            out.firings.push((id, value));
            // Reverse so the first child is popped (visited) first.
            stack.extend(fired_children.into_iter().rev());
        }
        out
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Remove derived nodes that nobody holds and nothing depends on.
    pub fn prune(&mut self) -> Vec<PrunedNode> {
        let mut removed = Vec::new();
        loop {
            let dead: Vec<EventId> = self
                .nodes
                .iter()
                .filter(|(_, n)| n.source.is_some() && n.children.is_empty() && !n.is_held())
                .map(|(id, _)| *id)
                .collect();
            if dead.is_empty() {
                break;
            }
            for id in dead {
                if let Some(node) = self.nodes.remove(&id) {
                    if let Some(parent) = node.source.and_then(|p| self.nodes.get_mut(&p)) {
                        parent.children.retain(|c| *c != id);
                    }
                    debug!("graph: pruned derived event {} at {}", id.0, node.addr);
                    removed.push(PrunedNode {
                        id,
                        addr: node.addr,
                        materialized: node.materialized,
                        identifier: node.identifier,
                    });
                }
            }
        }
        removed
    }

    // ── Internal ──────────────────────────────────────────────

    fn alloc_id(&mut self) -> EventId {
        let id = EventId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn source_kind(&self, source: &Event) -> Result<DataKind> {
        match self.nodes.get(&source.id()) {
            Some(node) if source.connection() == self.connection => Ok(node.kind),
            _ => Err(Error::InvalidatedSession),
        }
    }

    /// Lowest filter slot neither used by a live derived node nor reserved.
    fn free_slot(&self, max_filters: u8, reserved: &HashSet<u8>) -> Option<u8> {
        let used: HashSet<u8> = self
            .nodes
            .values()
            .filter(|n| n.source.is_some())
            .map(|n| n.addr.index)
            .collect();
        (0..max_filters).find(|slot| !used.contains(slot) && !reserved.contains(slot))
    }
}
