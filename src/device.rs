//! The device: one board, its connection sessions and everything bound
//! to them.
//!
//! ```text
//!                 ┌──────────────────────── Device ───────────────────────┐
//!  caller ──────▶ │ registry (survives reconnects)                        │
//!  (Event API)    │ ┌─────────────── Connection (one session) ──────────┐ │
//!                 │ │ graph · subscriptions · logging · pending · dl's  │ │ ──▶ Transport
//!  Inbound ─────▶ │ └───────────────────────────────────────────────────┘ │
//!                 └───────────────────────────────────────────────────────┘
//! ```
//!
//! Every public operation validates its handles synchronously and reports
//! construction-time problems as an `Err`.  Anything that depends on the
//! board answers later through the callback the caller supplied.  The
//! device does no threading of its own: inbound traffic arrives through
//! [`Device::handle`], [`Device::drain`] or [`Device::next_inbound`].

use std::collections::{HashMap, HashSet};

use log::{debug, info, trace, warn};

use crate::codec::{DecodeError, EntryDecoder, LeDecoder};
use crate::config::SessionConfig;
use crate::datalog::{LogDownload, LogEntry, LoggingTable, ProgressHandler};
use crate::error::{Error, Result};
use crate::graph::{Comparison, Event, EventGraph, EventId, FilterSpec};
use crate::link::{DeviceCommand, Inbound, Inbox, RawLogEntry, RequestId, Transport, TransportError};
use crate::notify::{StreamChange, Subscriptions};
use crate::program::{CommandRecorder, Completion, ReadHandler, RegisterOps};
use crate::register::{DataKind, DataRegister, Register, RegisterAddr, Value};
use crate::registry::{
    EventRecipe, IdentifierRegistry, MAX_RECIPE_DEPTH, RegistrySnapshot, SourceRef,
};
use crate::session::ConnectionId;

// ---------------------------------------------------------------------------
// Pending requests
// ---------------------------------------------------------------------------

/// What to do when the response to a request arrives.
enum Pending {
    /// Command or register write acknowledgement.
    Ack {
        command: &'static str,
        on_done: Option<Completion>,
    },
    /// Logging start/stop; a failure makes the cached state unknown.
    Logging {
        event: EventId,
        command: &'static str,
    },
    /// Direct data register read.
    Read {
        addr: RegisterAddr,
        kind: DataKind,
        on_value: Option<ReadHandler>,
    },
    /// Read issued by a read-coupled node; resumes propagation.
    Coupled {
        event: EventId,
        data: RegisterAddr,
        timestamp_ms: u64,
    },
    /// `is_logging` round trip.
    Query { event: EventId },
}

// ---------------------------------------------------------------------------
// Connection session
// ---------------------------------------------------------------------------

/// State bound to one connect/disconnect span.  Dropped on disconnect.
struct Connection {
    id: ConnectionId,
    graph: EventGraph,
    /// Data registers handed out this session.
    data: HashMap<RegisterAddr, DataKind>,
    /// Last value seen per register.
    cache: HashMap<RegisterAddr, Value>,
    subscriptions: Subscriptions,
    logging: LoggingTable,
    /// Instruction count of the program bound to each trigger.
    programs: HashMap<EventId, usize>,
    pending: HashMap<RequestId, Pending>,
    downloads: HashMap<RequestId, LogDownload>,
    /// Identifiers whose filters were removed from the board this session.
    released: Vec<String>,
}

impl Connection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            graph: EventGraph::new(id),
            data: HashMap::new(),
            cache: HashMap::new(),
            subscriptions: Subscriptions::new(),
            logging: LoggingTable::new(),
            programs: HashMap::new(),
            pending: HashMap::new(),
            downloads: HashMap::new(),
            released: Vec::new(),
        }
    }

    fn track(&mut self, request: RequestId, pending: Pending) {
        if self.pending.insert(request, pending).is_some() {
            warn!("{}: transport reused {}", self.id, request);
        }
    }

    /// Send `cmd` and log a failed acknowledgement.
    fn command<T: Transport>(&mut self, transport: &mut T, cmd: &DeviceCommand) -> Result<()> {
        let request = send_command(transport, cmd)?;
        self.track(
            request,
            Pending::Ack {
                command: cmd.name(),
                on_done: None,
            },
        );
        Ok(())
    }

    fn set_logging<T: Transport>(
        &mut self,
        transport: &mut T,
        event: EventId,
        source: RegisterAddr,
        enable: bool,
    ) -> Result<()> {
        let cmd = if enable {
            DeviceCommand::StartLogging { source }
        } else {
            DeviceCommand::StopLogging { source }
        };
        let request = send_command(transport, &cmd)?;
        self.track(
            request,
            Pending::Logging {
                event,
                command: cmd.name(),
            },
        );
        self.logging.set(event, enable);
        Ok(())
    }

    // ── Graph ─────────────────────────────────────────────────

    fn derive(
        &mut self,
        source: &Event,
        spec: FilterSpec,
        max_filters: u8,
        reserved: &HashSet<u8>,
    ) -> Result<Event> {
        let event = self.graph.derive(source, spec, max_filters, reserved)?;
        self.adopt(&event);
        Ok(event)
    }

    /// Rebuild a recipe's node at the slot it was built at.  With
    /// `resident` set the board still holds that filter.  Falls back to a
    /// fresh slot when the recorded one is taken.
    fn rebuild(
        &mut self,
        source: &Event,
        recipe: &EventRecipe,
        resident: bool,
        max_filters: u8,
        reserved: &HashSet<u8>,
    ) -> Result<Event> {
        let slot = recipe.output.index;
        let event = if recipe.output.is_filter_output()
            && slot < max_filters
            && !self.graph.slot_in_use(slot)
        {
            self.graph.derive_at(source, recipe.filter.clone(), slot, resident)?
        } else {
            warn!(
                "{}: {} is taken, rebuilding {} elsewhere",
                self.id, recipe.output, recipe.filter
            );
            self.graph.derive(source, recipe.filter.clone(), max_filters, reserved)?
        };
        self.adopt(&event);
        Ok(event)
    }

    /// Session bookkeeping for a node that just joined the graph.  A node
    /// the board already holds starts with its logging state unknown.
    fn adopt(&mut self, event: &Event) {
        if self.graph.is_materialized(event.id()) {
            self.logging.forget(event.id());
        } else {
            self.logging.set(event.id(), false);
        }
        if let Some(FilterSpec::ReadCoupled { data, kind }) = self.graph.filter_of(event.id()) {
            self.data.entry(*data).or_insert(*kind);
        }
    }

    /// Create every not-yet-instantiated filter on the path to `id`,
    /// root-most first.
    fn materialize<T: Transport>(&mut self, transport: &mut T, id: EventId) -> Result<()> {
        let chain = self.graph.chain(id);
        for pair in chain.windows(2) {
            let (parent, node) = (pair[0], pair[1]);
            if self.graph.is_materialized(node) {
                continue;
            }
            let (Some(source), Some(output), Some(filter)) = (
                self.graph.addr_of(parent),
                self.graph.addr_of(node),
                self.graph.filter_of(node).cloned(),
            ) else {
                continue;
            };
            debug!("{}: creating {} at {}", self.id, filter, output);
            self.command(
                transport,
                &DeviceCommand::CreateFilter {
                    output,
                    source,
                    filter,
                },
            )?;
            self.graph.mark_materialized(node);
        }
        Ok(())
    }

    /// Drop unreachable derived events along with their sinks.
    fn prune<T: Transport>(&mut self, transport: &mut T) {
        for node in self.graph.prune() {
            if let StreamChange::Close(root) = self.subscriptions.remove(node.id) {
                close_stream(transport, root);
            }
            self.logging.remove(node.id);
            self.programs.remove(&node.id);
            self.cache.remove(&node.addr);
            if node.materialized {
                if let Err(e) =
                    self.command(transport, &DeviceCommand::RemoveFilter { output: node.addr })
                {
                    warn!("{}: removing filter {} failed: {}", self.id, node.addr, e);
                }
                if let Some(name) = node.identifier {
                    self.released.push(name);
                }
            }
        }
    }

    // ── Notification delivery ─────────────────────────────────

    /// Run a firing of `start` through the graph and deliver it to every
    /// subscribed node it reaches.
    fn propagate<T: Transport>(
        &mut self,
        transport: &mut T,
        start: EventId,
        value: Value,
        timestamp_ms: u64,
    ) {
        let wanted = self.graph.with_ancestors(self.subscriptions.subscribed());
        let outcome = self.graph.propagate(start, value, timestamp_ms, &wanted);

        for (id, value) in outcome.firings {
            if let Some(addr) = self.graph.addr_of(id) {
                self.cache.insert(addr, value.clone());
            }
            self.subscriptions.deliver(id, Ok(value));
        }
        for (id, data) in outcome.reads {
            match transport.read_register(data) {
                Ok(request) => self.track(
                    request,
                    Pending::Coupled {
                        event: id,
                        data,
                        timestamp_ms,
                    },
                ),
                Err(e) => self.fail_subtree(id, &Error::Transport(e)),
            }
        }
    }

    /// Hand `err` to every subscribed node at or below `id`.
    fn fail_subtree(&mut self, id: EventId, err: &Error) {
        for node in self.graph.subtree(id) {
            self.subscriptions.deliver(node, Err(err.clone()));
        }
    }

    // ── Inbound ───────────────────────────────────────────────

    fn on_notification<T: Transport, D: EntryDecoder>(
        &mut self,
        transport: &mut T,
        decoder: &D,
        source: RegisterAddr,
        timestamp_ms: u64,
        payload: &[u8],
    ) {
        self.prune(transport);
        let Some(root) = self.graph.root_by_addr(source) else {
            debug!("{}: notification from {} without an event", self.id, source);
            return;
        };
        let Some(kind) = self.graph.kind_of(root) else {
            return;
        };
        match decoder.decode(kind, payload) {
            Ok(value) => self.propagate(transport, root, value, timestamp_ms),
            Err(e) => {
                warn!("{}: undecodable notification from {}: {}", self.id, source, e);
                self.fail_subtree(root, &Error::Decode(e));
            }
        }
    }

    fn on_stream_error(&mut self, source: RegisterAddr, error: TransportError) {
        warn!("{}: stream from {} failed: {}", self.id, source, error);
        if let Some(root) = self.graph.root_by_addr(source) {
            self.fail_subtree(root, &Error::Transport(error));
        }
    }

    fn on_response<T: Transport, D: EntryDecoder>(
        &mut self,
        transport: &mut T,
        decoder: &D,
        request: RequestId,
        result: std::result::Result<Vec<u8>, TransportError>,
    ) {
        if let Some(pending) = self.pending.remove(&request) {
            self.resolve(transport, decoder, pending, result);
            return;
        }
        if self.downloads.contains_key(&request) {
            // An Ok here only acknowledges the download; chunks follow.
            if let Err(e) = result {
                if let Some(download) = self.downloads.remove(&request) {
                    warn!(
                        "{}: log download from {} failed: {}",
                        self.id,
                        download.source(),
                        e
                    );
                    download.finish(Err(Error::Transport(e)));
                }
            }
            return;
        }
        warn!("{}: response to unknown {}", self.id, request);
    }

    fn resolve<T: Transport, D: EntryDecoder>(
        &mut self,
        transport: &mut T,
        decoder: &D,
        pending: Pending,
        result: std::result::Result<Vec<u8>, TransportError>,
    ) {
        match pending {
            Pending::Ack { command, on_done } => {
                let result = result.map(|_| ()).map_err(Error::Transport);
                match on_done {
                    Some(done) => done(result),
                    None => {
                        if let Err(e) = result {
                            warn!("{}: {} failed: {}", self.id, command, e);
                        }
                    }
                }
            }
            Pending::Logging { event, command } => {
                if let Err(e) = result {
                    warn!("{}: {} failed: {}", self.id, command, e);
                    self.logging.forget(event);
                }
            }
            Pending::Read {
                addr,
                kind,
                on_value,
            } => {
                let value = decode_response(decoder, kind, result);
                if let Ok(v) = &value {
                    self.cache.insert(addr, v.clone());
                }
                if let Some(on_value) = on_value {
                    on_value(value);
                }
            }
            Pending::Coupled {
                event,
                data,
                timestamp_ms,
            } => {
                let Some(kind) = self.graph.kind_of(event) else {
                    debug!("{}: read-coupled event pruned before its read completed", self.id);
                    return;
                };
                match decode_response(decoder, kind, result) {
                    Ok(value) => {
                        self.cache.insert(data, value.clone());
                        self.propagate(transport, event, value, timestamp_ms);
                    }
                    Err(e) => self.fail_subtree(event, &e),
                }
            }
            Pending::Query { event } => {
                let answer = result.map_err(Error::Transport).and_then(|bytes| {
                    match bytes.as_slice() {
                        [flag] => Ok(*flag != 0),
                        other => Err(Error::Decode(DecodeError::LengthMismatch {
                            kind: DataKind::Bool,
                            expected: 1,
                            actual: other.len(),
                        })),
                    }
                });
                self.logging.resolve(event, answer);
            }
        }
    }

    fn on_log_chunk<T: Transport, D: EntryDecoder>(
        &mut self,
        transport: &mut T,
        decoder: &D,
        config: &SessionConfig,
        request: RequestId,
        total_entries: u32,
        entries: Vec<RawLogEntry>,
    ) {
        let complete = match self.downloads.get_mut(&request) {
            Some(download) => download.feed(total_entries, entries),
            None => {
                warn!("{}: log chunk for unknown {}", self.id, request);
                return;
            }
        };
        if !complete {
            return;
        }
        let Some(mut download) = self.downloads.remove(&request) else {
            return;
        };

        let source = download.source();
        match download.decode(decoder) {
            Ok(entries) => {
                if download.stop_after() {
                    if let Err(e) = self.set_logging(transport, download.event(), source, false) {
                        warn!("{}: stopping log of {} failed: {}", self.id, source, e);
                    }
                }
                if config.clear_log_after_download {
                    if let Err(e) = self.command(transport, &DeviceCommand::ClearLog { source }) {
                        warn!("{}: clearing log of {} failed: {}", self.id, source, e);
                    }
                }
                info!(
                    "{}: downloaded {} log entries from {}",
                    self.id,
                    entries.len(),
                    source
                );
                download.finish(Ok(entries));
            }
            Err(e) => {
                warn!("{}: log download from {} failed: {}", self.id, source, e);
                download.finish(Err(e));
            }
        }
    }

    /// Fail everything still waiting on the board.
    fn teardown(mut self) {
        let lost = Error::Transport(TransportError::ConnectionLost);
        for (_, download) in self.downloads.drain() {
            download.finish(Err(lost.clone()));
        }
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Ack {
                    on_done: Some(done),
                    ..
                } => done(Err(lost.clone())),
                Pending::Read {
                    on_value: Some(on_value),
                    ..
                } => on_value(Err(lost.clone())),
                _ => {}
            }
        }
        self.logging.fail_all(lost);
    }
}

fn send_command<T: Transport>(transport: &mut T, cmd: &DeviceCommand) -> Result<RequestId> {
    let payload = cmd.encode()?;
    trace!("sending {} ({} bytes)", cmd.name(), payload.len());
    Ok(transport.send_command(cmd.target(), &payload)?)
}

fn close_stream<T: Transport>(transport: &mut T, root: RegisterAddr) {
    debug!("closing stream for {}", root);
    if let Err(e) = transport.unsubscribe(root) {
        warn!("unsubscribing {} failed: {}", root, e);
    }
}

fn decode_response<D: EntryDecoder>(
    decoder: &D,
    kind: DataKind,
    result: std::result::Result<Vec<u8>, TransportError>,
) -> Result<Value> {
    let bytes = result?;
    Ok(decoder.decode(kind, &bytes)?)
}

/// Route a synchronous failure into the completion when there is one.
fn complete_or_err(on_done: Option<Completion>, err: Error) -> Result<()> {
    match on_done {
        Some(done) => {
            done(Err(err));
            Ok(())
        }
        None => Err(err),
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Host-side model of one board.
pub struct Device<T: Transport, D: EntryDecoder = LeDecoder> {
    transport: T,
    decoder: D,
    config: SessionConfig,
    registry: IdentifierRegistry,
    connection: Option<Connection>,
    /// Every session this device has owned, current one included.
    history: HashSet<ConnectionId>,
}

impl<T: Transport> Device<T> {
    /// Device decoding plain little-endian registers.
    pub fn new(transport: T, config: SessionConfig) -> Result<Self> {
        Self::with_decoder(transport, LeDecoder, config)
    }
}

impl<T: Transport, D: EntryDecoder> Device<T, D> {
    pub fn with_decoder(transport: T, decoder: D, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            decoder,
            config,
            registry: IdentifierRegistry::new(),
            connection: None,
            history: HashSet::new(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Id of the current connection session.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|c| c.id)
    }

    // ── Session checks ────────────────────────────────────────

    fn stale(&self, owner: ConnectionId) -> Error {
        if self.history.contains(&owner) {
            Error::InvalidatedSession
        } else {
            Error::CrossSession
        }
    }

    /// Current session, provided `owner` is it.
    fn session(&mut self, owner: ConnectionId) -> Result<(&mut T, &mut Connection)> {
        if self.connection_id() != Some(owner) {
            return Err(self.stale(owner));
        }
        match self.connection.as_mut() {
            Some(conn) => Ok((&mut self.transport, conn)),
            None => Err(Error::InvalidatedSession),
        }
    }

    fn session_ref(&self, owner: ConnectionId) -> Result<&Connection> {
        match self.connection.as_ref() {
            Some(conn) if conn.id == owner => Ok(conn),
            _ => Err(self.stale(owner)),
        }
    }

    /// Current session, whatever it is.
    fn live(&mut self) -> Result<(&mut T, &mut Connection)> {
        match self.connection.as_mut() {
            Some(conn) => Ok((&mut self.transport, conn)),
            None => Err(Error::Transport(TransportError::NotConnected)),
        }
    }

    // ── Registers ─────────────────────────────────────────────

    /// Root event for the physical occurrence at `addr`.  Repeated calls
    /// within a session return the same event.
    pub fn event(&mut self, addr: RegisterAddr, kind: DataKind) -> Result<Event> {
        let (transport, conn) = self.live()?;
        conn.prune(transport);
        conn.graph.root(addr, kind)
    }

    /// Readable data register at `addr`.
    pub fn data(&mut self, addr: RegisterAddr, kind: DataKind) -> Result<DataRegister> {
        if addr.is_filter_output() {
            return Err(Error::InvalidArgument("filter outputs are not data registers"));
        }
        let (_, conn) = self.live()?;
        match conn.data.get(&addr) {
            Some(existing) if *existing != kind => Err(Error::InvalidArgument(
                "data register already exists with a different data kind",
            )),
            _ => {
                conn.data.insert(addr, kind);
                Ok(DataRegister::new(addr, kind, conn.id))
            }
        }
    }

    /// Read `data` and hand its value to `on_value`.
    pub fn read(
        &mut self,
        data: &DataRegister,
        on_value: impl FnOnce(Result<Value>) + 'static,
    ) -> Result<()> {
        self.read_data(data, Some(Box::new(on_value)))
    }

    /// Last value read from or fired by `register` this session.
    pub fn cached_value(&self, register: &impl Register) -> Result<Option<Value>> {
        let conn = self.session_ref(register.connection())?;
        Ok(conn.cache.get(&register.addr()).cloned())
    }

    // ── Filters ───────────────────────────────────────────────

    pub fn derive_accumulate(&mut self, source: &Event) -> Result<Event> {
        self.derive(source, FilterSpec::Accumulate, None)
    }

    pub fn derive_accumulate_as(&mut self, source: &Event, identifier: &str) -> Result<Event> {
        self.derive(source, FilterSpec::Accumulate, Some(identifier))
    }

    pub fn derive_periodic_sample(&mut self, source: &Event, period_ms: u32) -> Result<Event> {
        self.derive(source, FilterSpec::PeriodicSample { period_ms }, None)
    }

    pub fn derive_periodic_sample_as(
        &mut self,
        source: &Event,
        period_ms: u32,
        identifier: &str,
    ) -> Result<Event> {
        self.derive(
            source,
            FilterSpec::PeriodicSample { period_ms },
            Some(identifier),
        )
    }

    pub fn derive_read_coupled(&mut self, source: &Event, data: &DataRegister) -> Result<Event> {
        self.derive_read_coupled_inner(source, data, None)
    }

    pub fn derive_read_coupled_as(
        &mut self,
        source: &Event,
        data: &DataRegister,
        identifier: &str,
    ) -> Result<Event> {
        self.derive_read_coupled_inner(source, data, Some(identifier))
    }

    pub fn derive_compare(
        &mut self,
        source: &Event,
        op: Comparison,
        reference: Value,
    ) -> Result<Event> {
        self.derive(source, FilterSpec::Compare { op, reference }, None)
    }

    pub fn derive_compare_as(
        &mut self,
        source: &Event,
        op: Comparison,
        reference: Value,
        identifier: &str,
    ) -> Result<Event> {
        self.derive(
            source,
            FilterSpec::Compare { op, reference },
            Some(identifier),
        )
    }

    fn derive_read_coupled_inner(
        &mut self,
        source: &Event,
        data: &DataRegister,
        identifier: Option<&str>,
    ) -> Result<Event> {
        self.session_ref(source.connection())?;
        if data.connection() != source.connection() {
            return Err(Error::CrossSession);
        }
        let spec = FilterSpec::ReadCoupled {
            data: data.addr(),
            kind: data.kind(),
        };
        self.derive(source, spec, identifier)
    }

    fn derive(
        &mut self,
        source: &Event,
        spec: FilterSpec,
        identifier: Option<&str>,
    ) -> Result<Event> {
        self.session_ref(source.connection())?;
        if let Some(name) = identifier {
            self.registry.check_available(name)?;
        }
        let reserved = self.reserved_slots()?;
        let max_filters = self.config.max_filters;
        let (_, conn) = self.session(source.connection())?;
        let event = conn.derive(source, spec, max_filters, &reserved)?;

        if let Some(name) = identifier {
            let recipe = conn
                .graph
                .recipe_of(event.id())
                .ok_or(Error::InvalidArgument("derived event has no recipe"))?;
            self.registry.bind(name, &recipe)?;
            if let Some(conn) = self.connection.as_mut() {
                conn.graph.set_identifier(event.id(), name);
            }
            info!("bound '{}' to {}", name, event.addr());
        }
        Ok(event)
    }

    /// Construction recipe of a derived event; `None` for roots.
    pub fn recipe(&self, event: &Event) -> Result<Option<EventRecipe>> {
        let conn = self.session_ref(event.connection())?;
        Ok(conn.graph.recipe_of(event.id()))
    }

    // ── Identifier registry ───────────────────────────────────

    /// The event bound to `identifier` in the current session.  Rebuilds
    /// its filter chain when it is not live.  `None` when nothing is
    /// bound to `identifier`.
    pub fn restore(&mut self, identifier: &str) -> Result<Option<Event>> {
        self.live()?;
        self.sync_registry();
        if !self.registry.contains(identifier) {
            return Ok(None);
        }
        let event = self.restore_identified(identifier, 0)?;
        info!("restored '{}' at {}", identifier, event.addr());
        Ok(Some(event))
    }

    fn restore_identified(&mut self, identifier: &str, depth: usize) -> Result<Event> {
        if depth > MAX_RECIPE_DEPTH {
            return Err(Error::InvalidArgument("identifier chain too deep"));
        }
        let (_, conn) = self.live()?;
        if let Some(id) = conn.graph.find_identified(identifier) {
            if let Some(event) = conn.graph.revive(id) {
                return Ok(event);
            }
        }
        let recipe = self
            .registry
            .get(identifier)?
            .ok_or_else(|| Error::UnknownIdentifier(identifier.to_owned()))?;
        let resident = self.registry.is_resident(identifier);
        let event = self.build(&recipe, resident, depth)?;
        let (_, conn) = self.live()?;
        conn.graph.set_identifier(event.id(), identifier);
        Ok(event)
    }

    /// Rebuild `recipe`.  Anonymous sources described inline share the
    /// residency of the binding they belong to.
    fn build(&mut self, recipe: &EventRecipe, resident: bool, depth: usize) -> Result<Event> {
        if depth > MAX_RECIPE_DEPTH {
            return Err(Error::InvalidArgument("identifier chain too deep"));
        }
        let source = match &recipe.source {
            SourceRef::Root { addr, kind } => self.event(*addr, *kind)?,
            SourceRef::Identifier(name) => self.restore_identified(name, depth + 1)?,
            SourceRef::Filter(inner) => match self.live_intermediate(inner) {
                Some(event) => event,
                None => self.build(inner, resident, depth + 1)?,
            },
        };
        let reserved = self.reserved_slots()?;
        let max_filters = self.config.max_filters;
        let (_, conn) = self.live()?;
        conn.rebuild(&source, recipe, resident, max_filters, &reserved)
    }

    /// Anonymous intermediate still live at the slot `recipe` records.
    fn live_intermediate(&mut self, recipe: &EventRecipe) -> Option<Event> {
        let conn = self.connection.as_mut()?;
        let id = conn.graph.derived_at(recipe.output)?;
        if conn.graph.recipe_of(id).as_ref() != Some(recipe) {
            return None;
        }
        conn.graph.revive(id)
    }

    /// Prune the session, then collect the filter slots bound chains hold
    /// on the board outside of it.
    fn reserved_slots(&mut self) -> Result<HashSet<u8>> {
        let (transport, conn) = self.live()?;
        conn.prune(transport);
        self.sync_registry();
        Ok(self.registry.reserved_slots())
    }

    /// Record in the registry which bound chains the board holds.
    fn sync_registry(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        for name in conn.released.drain(..) {
            self.registry.set_resident(&name, false);
        }
        for (name, materialized) in conn.graph.identified() {
            self.registry.set_resident(name, materialized);
        }
    }

    /// Unbind `identifier`.  A live event carrying it keeps working but
    /// can no longer be restored.
    pub fn forget(&mut self, identifier: &str) -> bool {
        let removed = self.registry.forget(identifier);
        if let Some(conn) = self.connection.as_mut() {
            if let Some(id) = conn.graph.find_identified(identifier) {
                conn.graph.clear_identifier(id);
            }
        }
        removed
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.registry.identifiers()
    }

    pub fn registry_snapshot(&self) -> Result<RegistrySnapshot> {
        self.registry.snapshot()
    }

    // ── Notifications ─────────────────────────────────────────

    /// Make `handler` the sole receiver of `event`'s firings.
    pub fn start_notifications(
        &mut self,
        event: &Event,
        handler: impl FnMut(Result<Value>) + 'static,
    ) -> Result<()> {
        let (transport, conn) = self.session(event.connection())?;
        let root = conn
            .graph
            .root_of(event.id())
            .and_then(|r| conn.graph.addr_of(r))
            .ok_or(Error::InvalidatedSession)?;

        let change = conn.subscriptions.insert(event.id(), root, Box::new(handler));
        if let StreamChange::Open(addr) = change {
            debug!("{}: opening stream for {}", conn.id, addr);
            if let Err(e) = transport.subscribe(addr) {
                warn!("{}: subscribing to {} failed: {}", conn.id, addr, e);
                conn.subscriptions.stream_failed(addr);
                conn.subscriptions.deliver(event.id(), Err(Error::Transport(e)));
            }
        }
        Ok(())
    }

    /// Remove `event`'s handler.  No-op when none is set.
    pub fn stop_notifications(&mut self, event: &Event) -> Result<()> {
        let (transport, conn) = self.session(event.connection())?;
        if let StreamChange::Close(addr) = conn.subscriptions.remove(event.id()) {
            close_stream(transport, addr);
        }
        Ok(())
    }

    pub fn is_subscribed(&self, event: &Event) -> Result<bool> {
        let conn = self.session_ref(event.connection())?;
        Ok(conn.subscriptions.is_subscribed(event.id()))
    }

    // ── Command programs ──────────────────────────────────────

    /// Capture the register operations `block` performs on the recorder
    /// and bind them to `event` on the board, replacing any previous
    /// program.  `on_uploaded` receives the board's acknowledgement.
    pub fn program_commands<F>(
        &mut self,
        event: &Event,
        block: F,
        on_uploaded: Option<Completion>,
    ) -> Result<()>
    where
        F: FnOnce(&mut CommandRecorder) -> Result<()>,
    {
        let owner = self.session_ref(event.connection())?.id;
        let mut recorder = CommandRecorder::new(owner);
        block(&mut recorder)?;
        let instructions = recorder.finish()?;
        let count = instructions.len();

        let (transport, conn) = self.session(event.connection())?;
        let sent = conn.materialize(transport, event.id()).and_then(|()| {
            send_command(
                transport,
                &DeviceCommand::BindProgram {
                    trigger: event.addr(),
                    instructions,
                },
            )
        });
        match sent {
            Ok(request) => {
                info!(
                    "{}: uploading {} instructions to {}",
                    conn.id,
                    count,
                    event.addr()
                );
                conn.programs.insert(event.id(), count);
                conn.track(
                    request,
                    Pending::Ack {
                        command: "bind-program",
                        on_done: on_uploaded,
                    },
                );
                Ok(())
            }
            Err(e) => complete_or_err(on_uploaded, e),
        }
    }

    /// Clear the program bound to `event`.  Idempotent.
    pub fn erase_commands(&mut self, event: &Event) -> Result<()> {
        let (transport, conn) = self.session(event.connection())?;
        conn.programs.remove(&event.id());
        let cmd = DeviceCommand::EraseProgram {
            trigger: event.addr(),
        };
        if let Err(e) = conn.command(transport, &cmd) {
            warn!("{}: erasing program of {} failed: {}", conn.id, event.addr(), e);
        }
        Ok(())
    }

    /// Whether a program has been bound to `event` this session.
    pub fn is_programmed(&self, event: &Event) -> Result<bool> {
        let conn = self.session_ref(event.connection())?;
        Ok(conn.programs.contains_key(&event.id()))
    }

    // ── Logging ───────────────────────────────────────────────

    /// Log every firing of `event` to board flash.  Idempotent.
    pub fn start_logging(&mut self, event: &Event) -> Result<()> {
        let (transport, conn) = self.session(event.connection())?;
        if conn.logging.get(event.id()) == Some(true) {
            return Ok(());
        }
        let result = conn
            .materialize(transport, event.id())
            .and_then(|()| conn.set_logging(transport, event.id(), event.addr(), true));
        if let Err(e) = result {
            warn!("{}: starting log of {} failed: {}", conn.id, event.addr(), e);
        }
        Ok(())
    }

    /// Stop logging `event`.  Idempotent.
    pub fn stop_logging(&mut self, event: &Event) -> Result<()> {
        let (transport, conn) = self.session(event.connection())?;
        if conn.logging.get(event.id()) == Some(false) {
            return Ok(());
        }
        if let Err(e) = conn.set_logging(transport, event.id(), event.addr(), false) {
            warn!("{}: stopping log of {} failed: {}", conn.id, event.addr(), e);
        }
        Ok(())
    }

    /// Ask whether the board is logging `event`.  Answered at once when
    /// the state is known this session, otherwise after a round trip.
    pub fn is_logging(
        &mut self,
        event: &Event,
        on_answer: impl FnOnce(Result<bool>) + 'static,
    ) -> Result<()> {
        let (transport, conn) = self.session(event.connection())?;
        if let Some(known) = conn.logging.get(event.id()) {
            on_answer(Ok(known));
            return Ok(());
        }
        if !conn.logging.wait(event.id(), Box::new(on_answer)) {
            return Ok(());
        }
        let cmd = DeviceCommand::QueryLogging {
            source: event.addr(),
        };
        match send_command(transport, &cmd) {
            Ok(request) => conn.track(request, Pending::Query { event: event.id() }),
            Err(e) => conn.logging.resolve(event.id(), Err(e)),
        }
        Ok(())
    }

    /// Retrieve every entry the board has logged for `event`.
    ///
    /// `on_progress` sees non-decreasing fractions and exactly one 1.0,
    /// strictly before `on_complete` receives the result, failures
    /// included.  When `stop_after` is set, logging is stopped once every
    /// entry has arrived; a failed download leaves logging alone.
    pub fn download_log(
        &mut self,
        event: &Event,
        stop_after: bool,
        on_complete: impl FnOnce(Result<Vec<LogEntry>>) + 'static,
        on_progress: Option<ProgressHandler>,
    ) -> Result<()> {
        let chunk_entries = self.config.download_chunk_entries;
        let (transport, conn) = self.session(event.connection())?;
        if conn.downloads.values().any(|d| d.event() == event.id()) {
            return Err(Error::DownloadInProgress);
        }

        let download = LogDownload::new(
            event.id(),
            event.addr(),
            event.kind(),
            stop_after,
            Box::new(on_complete),
            on_progress,
        );
        let sent = conn.materialize(transport, event.id()).and_then(|()| {
            send_command(
                transport,
                &DeviceCommand::DownloadLog {
                    source: event.addr(),
                    chunk_entries,
                },
            )
        });
        match sent {
            Ok(request) => {
                info!("{}: downloading log of {}", conn.id, event.addr());
                conn.downloads.insert(request, download);
            }
            Err(e) => {
                warn!("{}: log download from {} failed: {}", conn.id, event.addr(), e);
                download.finish(Err(e));
            }
        }
        Ok(())
    }

    // ── Inbound traffic ───────────────────────────────────────

    /// Process one message from the transport.
    pub fn handle(&mut self, msg: Inbound) {
        trace!("inbound {}", msg.name());
        match msg {
            Inbound::Connected => self.connect(),
            Inbound::Disconnected => self.disconnect(),
            other => {
                let Self {
                    transport,
                    decoder,
                    config,
                    connection,
                    ..
                } = self;
                let Some(conn) = connection.as_mut() else {
                    warn!("dropping {} message: not connected", other.name());
                    return;
                };
                match other {
                    Inbound::Notification {
                        source,
                        timestamp_ms,
                        payload,
                    } => conn.on_notification(transport, decoder, source, timestamp_ms, &payload),
                    Inbound::StreamError { source, error } => conn.on_stream_error(source, error),
                    Inbound::Response { request, result } => {
                        conn.on_response(transport, decoder, request, result);
                    }
                    Inbound::LogChunk {
                        request,
                        total_entries,
                        entries,
                    } => conn.on_log_chunk(
                        transport,
                        decoder,
                        config,
                        request,
                        total_entries,
                        entries,
                    ),
                    Inbound::Connected | Inbound::Disconnected => {}
                }
            }
        }
    }

    /// Handle queued messages without waiting, at most
    /// `inbox_drain_limit` of them.  Returns how many were handled.
    pub fn drain(&mut self, inbox: &Inbox) -> usize {
        let limit = usize::from(self.config.inbox_drain_limit);
        let mut handled = 0;
        while handled < limit {
            let Ok(msg) = inbox.try_receive() else {
                break;
            };
            self.handle(msg);
            handled += 1;
        }
        handled
    }

    /// Wait for the next queued message and handle it.
    pub async fn next_inbound(&mut self, inbox: &Inbox) {
        let msg = inbox.receive().await;
        self.handle(msg);
    }

    /// Block the calling thread until a message is queued, then handle it.
    pub fn handle_next_blocking(&mut self, inbox: &Inbox) {
        futures_lite::future::block_on(self.next_inbound(inbox));
    }

    fn connect(&mut self) {
        if self.connection.is_some() {
            warn!("connected while a session was active; dropping it");
            self.disconnect();
        }
        let id = ConnectionId::next();
        self.history.insert(id);
        self.connection = Some(Connection::new(id));
        info!(
            "{} established, {} identifiers restorable",
            id,
            self.registry.len()
        );
    }

    fn disconnect(&mut self) {
        self.sync_registry();
        match self.connection.take() {
            Some(conn) => {
                info!("{} lost", conn.id);
                conn.teardown();
            }
            None => debug!("disconnect while not connected"),
        }
    }
}

impl<T: Transport, D: EntryDecoder> RegisterOps for Device<T, D> {
    /// Transport failures go to `on_done` when given, otherwise they are
    /// returned.
    fn write_register(
        &mut self,
        target: RegisterAddr,
        payload: &[u8],
        on_done: Option<Completion>,
    ) -> Result<()> {
        let (transport, conn) = match self.live() {
            Ok(parts) => parts,
            Err(e) => return complete_or_err(on_done, e),
        };
        match transport.send_command(target, payload) {
            Ok(request) => {
                conn.track(
                    request,
                    Pending::Ack {
                        command: "write",
                        on_done,
                    },
                );
                Ok(())
            }
            Err(e) => complete_or_err(on_done, Error::Transport(e)),
        }
    }

    fn read_data(&mut self, data: &DataRegister, on_value: Option<ReadHandler>) -> Result<()> {
        let (transport, conn) = self.session(data.connection())?;
        match transport.read_register(data.addr()) {
            Ok(request) => {
                conn.track(
                    request,
                    Pending::Read {
                        addr: data.addr(),
                        kind: data.kind(),
                        on_value,
                    },
                );
                Ok(())
            }
            Err(e) => {
                let err = Error::Transport(e);
                match on_value {
                    Some(on_value) => {
                        on_value(Err(err));
                        Ok(())
                    }
                    None => Err(err),
                }
            }
        }
    }
}
