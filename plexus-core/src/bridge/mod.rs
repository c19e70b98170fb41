//! Sync bridge between the editor's diagram model and the shared document.
//!
//! Local commands become tagged document transactions; remote document
//! changes become model mutations. The bridge is a single owner of all
//! sync state, so loop prevention is an explicit [`SyncContext`] value
//! rather than a lock:
//!
//! - while a remote change is applied, model mutations produce command
//!   notifications that are swallowed instead of written back;
//! - changes carrying a local-class origin are never applied to the model.
//!
//! Nothing here sleeps. Deferred work (geometry flushes, endpoint retries,
//! deferred creates, full resyncs) is queued on a [`Scheduler`] and runs
//! from [`SyncBridge::tick`].

mod command;
pub mod position;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::conflict::{
    ConflictConfig, ConflictEngine, ConflictError, ConflictKind, ConflictOutcome, DetectionInput,
    ManualParams, Resolution, StrategyContext, SuggestedAction, Suggestion,
};
use crate::document::{
    DocOrigin, DocumentChange, DocumentError, EntryChange, EntryChangeKind, SharedDocument,
};
use crate::model::{DiagramModel, ModelError, PermissiveRules, RuleChecker};
use crate::schedule::{Cooldown, Scheduler, TaskId};
use crate::{Bounds, DiagramElement, ElementId, ElementKind, FieldGroup, Point};

pub use command::LocalCommand;
pub use position::{PositionResolver, PositionSource};

/// Hard cap on nested bridge entry points.
pub const MAX_CALL_DEPTH: usize = 8;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interval between geometry buffer flushes
    pub flush_interval: Duration,
    /// Delay before retrying a connection whose endpoint is missing
    pub endpoint_retry_delay: Duration,
    /// Hold bare creates this long so a following append can absorb them.
    /// Zero writes immediately and relies on the `AppendBegin` signal.
    pub create_defer: Duration,
    /// Minimum spacing between surfaced error events
    pub error_cooldown: Duration,
    /// Delay between an error and the full resync it triggers
    pub resync_delay: Duration,
    /// How long a local edit counts as unsettled for conflict detection
    pub local_edit_window: Duration,
    pub fallback_position: Point,
    /// Size given to shapes created without any geometry
    pub default_size: (f64, f64),
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(50),
            endpoint_retry_delay: Duration::from_millis(100),
            create_defer: Duration::ZERO,
            error_cooldown: Duration::from_secs(5),
            resync_delay: Duration::from_secs(1),
            local_edit_window: Duration::from_secs(2),
            fallback_position: Point::new(100.0, 100.0),
            default_size: (100.0, 80.0),
        }
    }
}

impl BridgeConfig {
    pub fn for_testing() -> Self {
        Self {
            flush_interval: Duration::from_millis(5),
            endpoint_retry_delay: Duration::from_millis(10),
            error_cooldown: Duration::from_millis(100),
            resync_delay: Duration::from_millis(20),
            local_edit_window: Duration::from_millis(500),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    Document(DocumentError),
    Model(ModelError),
    Conflict(ConflictError),
    /// Re-entrant bridge calls nested deeper than [`MAX_CALL_DEPTH`]
    DepthExceeded { depth: usize },
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Document(e) => write!(f, "Document error: {e}"),
            BridgeError::Model(e) => write!(f, "Model error: {e}"),
            BridgeError::Conflict(e) => write!(f, "Conflict error: {e}"),
            BridgeError::DepthExceeded { depth } => {
                write!(f, "Bridge call depth {depth} exceeds limit of {MAX_CALL_DEPTH}")
            }
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<DocumentError> for BridgeError {
    fn from(e: DocumentError) -> Self {
        BridgeError::Document(e)
    }
}

impl From<ModelError> for BridgeError {
    fn from(e: ModelError) -> Self {
        BridgeError::Model(e)
    }
}

impl From<ConflictError> for BridgeError {
    fn from(e: ConflictError) -> Self {
        BridgeError::Conflict(e)
    }
}

/// Re-entrancy state threaded through every bridge entry point.
#[derive(Debug, Default)]
pub struct SyncContext {
    applying_remote: bool,
    depth: usize,
}

impl SyncContext {
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn enter(&mut self) -> Result<(), BridgeError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(BridgeError::DepthExceeded { depth: self.depth + 1 });
        }
        self.depth += 1;
        Ok(())
    }

    fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeTask {
    FlushGeometry,
    RetryConnection { id: ElementId },
    DeferredCreate { id: ElementId, position: Option<Point> },
    FullResync,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Error { message: String },
    ResyncCompleted { elements: usize },
    ConflictEscalated {
        conflict_id: Uuid,
        element_id: ElementId,
        kind: ConflictKind,
        suggestions: Vec<Suggestion>,
    },
    ConflictResolved { conflict_id: Uuid, element_id: ElementId },
    ConnectionDropped { id: ElementId, missing: Vec<ElementId> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Local transactions that wrote to the document
    pub local_writes: u64,
    /// Remote entry changes applied to the model
    pub remote_applied: u64,
    /// Local commands swallowed while a remote change was applied
    pub suppressed_commands: u64,
    /// Local-class document changes skipped on the way back in
    pub ignored_echoes: u64,
    pub dropped_connections: u64,
    pub resyncs: u64,
    pub errors: u64,
}

#[derive(Debug, Clone)]
struct LocalEdit {
    groups: BTreeSet<FieldGroup>,
    at: Instant,
}

pub struct SyncBridge<M: DiagramModel> {
    model: M,
    document: SharedDocument,
    changes: mpsc::Receiver<DocumentChange>,
    conflicts: ConflictEngine,
    rules: Box<dyn RuleChecker>,
    config: BridgeConfig,
    ctx: SyncContext,
    positions: PositionResolver,
    geometry_buffer: BTreeMap<ElementId, BTreeSet<FieldGroup>>,
    flush_task: Option<TaskId>,
    append_latch: BTreeSet<ElementId>,
    deferred_creates: HashMap<ElementId, TaskId>,
    retries: HashMap<ElementId, TaskId>,
    resync_task: Option<TaskId>,
    local_edits: HashMap<ElementId, LocalEdit>,
    scheduler: Scheduler<BridgeTask>,
    error_cooldown: Cooldown,
    events: VecDeque<BridgeEvent>,
    stats: BridgeStats,
}

impl<M: DiagramModel> SyncBridge<M> {
    pub fn new(model: M, mut document: SharedDocument, config: BridgeConfig) -> Self {
        let changes = document.observe();
        Self {
            model,
            document,
            changes,
            conflicts: ConflictEngine::new(ConflictConfig::default()),
            rules: Box::new(PermissiveRules),
            positions: PositionResolver::new(config.fallback_position),
            error_cooldown: Cooldown::new(config.error_cooldown),
            scheduler: Scheduler::new(Instant::now()),
            config,
            ctx: SyncContext::default(),
            geometry_buffer: BTreeMap::new(),
            flush_task: None,
            append_latch: BTreeSet::new(),
            deferred_creates: HashMap::new(),
            retries: HashMap::new(),
            resync_task: None,
            local_edits: HashMap::new(),
            events: VecDeque::new(),
            stats: BridgeStats::default(),
        }
    }

    pub fn with_rules(mut self, rules: Box<dyn RuleChecker>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_conflict_config(mut self, config: ConflictConfig) -> Self {
        self.conflicts = ConflictEngine::new(config);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable model access for the host editor. Follow edits with
    /// [`pump`](Self::pump) so their command notifications are synced.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn conflicts(&self) -> &ConflictEngine {
        &self.conflicts
    }

    pub fn conflicts_mut(&mut self) -> &mut ConflictEngine {
        &mut self.conflicts
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Bridge clock: the latest instant passed to [`tick`](Self::tick).
    pub fn now(&self) -> Instant {
        self.scheduler.now()
    }

    pub fn pending_tasks(&self) -> Vec<BridgeTask> {
        self.scheduler.pending().cloned().collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        self.document.take_outbound()
    }

    pub fn drain_events(&mut self) -> Vec<BridgeEvent> {
        self.events.drain(..).collect()
    }

    pub fn capture_drop_point(&mut self, point: Point) {
        self.positions.capture_drop_point(point);
    }

    pub fn set_default_target(&mut self, target: Option<ElementId>) {
        self.positions.set_default_target(target);
    }

    pub fn note_pointer(&mut self, point: Point) {
        self.positions.note_pointer(point);
    }

    /// Feed every queued model command notification through the bridge.
    pub fn pump(&mut self) -> Result<(), BridgeError> {
        let mut first_error = None;
        for command in self.model.take_command_events() {
            if let Err(e) = self.on_local_command(command) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn on_local_command(&mut self, command: LocalCommand) -> Result<(), BridgeError> {
        if self.ctx.applying_remote {
            self.stats.suppressed_commands += 1;
            log::trace!("suppressed {} while applying remote change", command.name());
            return Ok(());
        }
        let result = self.guarded(|bridge| bridge.dispatch_local(command));
        if let Err(e) = &result {
            self.report_error(e);
        }
        self.process_document_changes();
        result
    }

    fn dispatch_local(&mut self, command: LocalCommand) -> Result<(), BridgeError> {
        log::trace!("local command {}", command.name());
        match command {
            LocalCommand::Create { id, position } => {
                if self.append_latch.contains(&id) {
                    return Ok(());
                }
                if !self.config.create_defer.is_zero() {
                    let task = self
                        .scheduler
                        .schedule_in(self.config.create_defer, BridgeTask::DeferredCreate {
                            id: id.clone(),
                            position,
                        });
                    if let Some(previous) = self.deferred_creates.insert(id, task) {
                        self.scheduler.cancel(previous);
                    }
                    return Ok(());
                }
                self.write_created(&id, position)
            }
            LocalCommand::Connect { id } => {
                if self.append_latch.contains(&id) {
                    return Ok(());
                }
                self.write_connection(&id)
            }
            LocalCommand::Delete { ids } => self.write_deletion(&ids),
            LocalCommand::Disconnect { id } => self.write_deletion(&[id]),
            LocalCommand::Move { ids } => {
                for id in ids {
                    let group = match self.model.element(&id) {
                        Some(e) if e.is_connection() => FieldGroup::Waypoints,
                        Some(_) => FieldGroup::Geometry,
                        None => continue,
                    };
                    self.buffer_geometry(id, group);
                }
                Ok(())
            }
            LocalCommand::Resize { id } => {
                self.buffer_geometry(id, FieldGroup::Geometry);
                Ok(())
            }
            LocalCommand::UpdateWaypoints { id } => {
                self.buffer_geometry(id, FieldGroup::Waypoints);
                Ok(())
            }
            LocalCommand::UpdateProperties { id } => {
                self.write_groups(&id, &[FieldGroup::Payload])
            }
            LocalCommand::Reconnect { id } => {
                self.write_groups(&id, &[FieldGroup::Endpoints, FieldGroup::Waypoints])
            }
            LocalCommand::Reparent { id } => self.write_groups(&id, &[FieldGroup::Parent]),
            LocalCommand::AppendBegin { shape_id, connection_id } => {
                if let Some(task) = self.deferred_creates.remove(&shape_id) {
                    self.scheduler.cancel(task);
                }
                self.append_latch.insert(shape_id);
                self.append_latch.insert(connection_id);
                Ok(())
            }
            LocalCommand::Append { source_id, shape_id, connection_id, position } => {
                self.append_latch.remove(&shape_id);
                self.append_latch.remove(&connection_id);
                if let Some(task) = self.deferred_creates.remove(&shape_id) {
                    self.scheduler.cancel(task);
                }
                self.write_append(&source_id, &shape_id, &connection_id, position)
            }
        }
    }

    /// Give a shape usable geometry, resolving a position when needed.
    fn placed_shape(&mut self, id: &str, explicit: Option<Point>) -> Option<DiagramElement> {
        let mut element = self.model.element(id)?;
        if element.kind != ElementKind::Shape {
            return Some(element);
        }
        let needs_position = element.bounds.map_or(true, |b| b.is_placeholder());
        if !needs_position {
            return Some(element);
        }

        let (point, source) = self.positions.resolve(explicit, &self.model);
        let (w, h) = self.config.default_size;
        let bounds = match element.bounds {
            Some(b) if b.width.is_finite() && b.height.is_finite() => b.moved_to(point),
            _ => Bounds::new(point.x, point.y, w, h),
        };
        log::debug!("placed {id} at ({}, {}) from {source:?}", point.x, point.y);
        element.bounds = Some(bounds);
        let id = id.to_string();
        let outcome = self.quietly(|model| model.resize_shape(&id, bounds));
        if let Err(e) = outcome {
            log::warn!("could not store resolved position for {id}: {e}");
        }
        Some(element)
    }

    fn write_created(&mut self, id: &str, explicit: Option<Point>) -> Result<(), BridgeError> {
        let Some(element) = self.placed_shape(id, explicit) else {
            log::debug!("create for {id} ignored: element no longer in model");
            return Ok(());
        };
        let wrote = self.document.transact(DocOrigin::Local, |txn| {
            // Re-check inside the transaction; a concurrent writer may have won.
            if txn.contains(&element.id) {
                return Ok(0);
            }
            txn.set(&element)
        })?;
        self.note_local_write(wrote);
        Ok(())
    }

    /// Write a connection and any endpoint the document does not hold yet.
    fn write_connection(&mut self, id: &str) -> Result<(), BridgeError> {
        let Some(connection) = self.model.element(id) else {
            return Ok(());
        };
        let mut endpoints = Vec::new();
        for endpoint in [&connection.source, &connection.target].into_iter().flatten() {
            if self.document.contains(endpoint) {
                continue;
            }
            if let Some(task) = self.deferred_creates.remove(endpoint.as_str()) {
                self.scheduler.cancel(task);
            }
            if let Some(element) = self.placed_shape(endpoint, None) {
                endpoints.push(element);
            }
        }

        let wrote = self.document.transact(DocOrigin::Local, |txn| {
            let mut wrote = 0;
            for endpoint in &endpoints {
                if !txn.contains(&endpoint.id) {
                    wrote += txn.set(endpoint)?;
                }
            }
            if !txn.contains(&connection.id) {
                wrote += txn.set(&connection)?;
            }
            Ok(wrote)
        })?;
        self.note_local_write(wrote);
        Ok(())
    }

    fn write_append(
        &mut self,
        source_id: &str,
        shape_id: &str,
        connection_id: &str,
        position: Option<Point>,
    ) -> Result<(), BridgeError> {
        let source = self.model.element(source_id);
        let shape = self.placed_shape(shape_id, position);
        let connection = self.model.element(connection_id);
        let (Some(shape), Some(connection)) = (shape, connection) else {
            log::warn!("append {source_id} -> {shape_id} incomplete in model, skipped");
            return Ok(());
        };

        // Source, shape and connection land in one transaction so no
        // observer sees the connection before its endpoints.
        let wrote = self.document.transact(DocOrigin::Local, |txn| {
            let mut wrote = 0;
            if let Some(source) = &source {
                if !txn.contains(&source.id) {
                    wrote += txn.set(source)?;
                }
            }
            if !txn.contains(&shape.id) {
                wrote += txn.set(&shape)?;
            }
            if !txn.contains(&connection.id) {
                wrote += txn.set(&connection)?;
            }
            Ok(wrote)
        })?;
        self.note_local_write(wrote);
        Ok(())
    }

    fn write_deletion(&mut self, ids: &[ElementId]) -> Result<(), BridgeError> {
        for id in ids {
            self.forget(id);
        }
        let model = &self.model;
        let wrote = self.document.transact(DocOrigin::Local, |txn| {
            let mut wrote = 0;
            for id in ids {
                if txn.delete(id) {
                    wrote += 1;
                }
            }
            // Entries left pointing at removed ids that the model no longer has.
            for other in txn.ids() {
                let dangling = txn.get(&other).is_some_and(|e| {
                    ids.iter().any(|id| e.references(id)) && !model.contains(&other)
                });
                if dangling && txn.delete(&other) {
                    wrote += 1;
                }
            }
            Ok(wrote)
        })?;
        self.note_local_write(wrote);
        Ok(())
    }

    fn write_groups(&mut self, id: &str, groups: &[FieldGroup]) -> Result<(), BridgeError> {
        let Some(element) = self.model.element(id) else {
            return Ok(());
        };
        let groups: BTreeSet<FieldGroup> = groups.iter().copied().collect();
        self.mark_local_edit(id, &groups);
        let wrote = self
            .document
            .transact(DocOrigin::Local, |txn| txn.set_groups(&element, &groups))?;
        self.note_local_write(wrote);
        Ok(())
    }

    fn buffer_geometry(&mut self, id: ElementId, group: FieldGroup) {
        self.mark_local_edit(&id, &BTreeSet::from([group]));
        self.geometry_buffer.entry(id).or_default().insert(group);
        if self.flush_task.is_none() {
            let task = self
                .scheduler
                .schedule_in(self.config.flush_interval, BridgeTask::FlushGeometry);
            self.flush_task = Some(task);
        }
    }

    /// Write all buffered geometry in one transaction.
    pub fn flush(&mut self) -> Result<(), BridgeError> {
        if let Some(task) = self.flush_task.take() {
            self.scheduler.cancel(task);
        }
        if self.geometry_buffer.is_empty() {
            return Ok(());
        }
        let buffered = std::mem::take(&mut self.geometry_buffer);
        let pending: Vec<(DiagramElement, BTreeSet<FieldGroup>)> = buffered
            .into_iter()
            .filter_map(|(id, groups)| self.model.element(&id).map(|e| (e, groups)))
            .collect();

        let wrote = self.document.transact(DocOrigin::Local, |txn| {
            let mut wrote = 0;
            for (element, groups) in &pending {
                wrote += txn.set_groups(element, groups)?;
            }
            Ok(wrote)
        })?;
        log::trace!("flushed geometry for {} elements ({wrote} writes)", pending.len());
        self.note_local_write(wrote);
        self.process_document_changes();
        Ok(())
    }

    fn note_local_write(&mut self, writes: usize) {
        if writes > 0 {
            self.stats.local_writes += 1;
        }
    }

    fn mark_local_edit(&mut self, id: &str, groups: &BTreeSet<FieldGroup>) {
        let now = self.scheduler.now();
        let edit = self
            .local_edits
            .entry(id.to_string())
            .or_insert_with(|| LocalEdit { groups: BTreeSet::new(), at: now });
        edit.groups.extend(groups.iter().copied());
        edit.at = now;
    }

    fn unsettled_edits(&self, id: &str) -> BTreeSet<FieldGroup> {
        match self.local_edits.get(id) {
            Some(edit)
                if self.scheduler.now().saturating_duration_since(edit.at)
                    < self.config.local_edit_window =>
            {
                edit.groups.clone()
            }
            _ => BTreeSet::new(),
        }
    }

    /// Drop every piece of pending sync state for an element.
    fn forget(&mut self, id: &str) {
        self.geometry_buffer.remove(id);
        self.local_edits.remove(id);
        self.append_latch.remove(id);
        if let Some(task) = self.deferred_creates.remove(id) {
            self.scheduler.cancel(task);
        }
        if let Some(task) = self.retries.remove(id) {
            self.scheduler.cancel(task);
        }
    }

    /// Apply an encoded update received from a peer.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<(), BridgeError> {
        if let Err(e) = self.document.apply_update(update, DocOrigin::Remote) {
            let error = BridgeError::from(e);
            self.report_error(&error);
            return Err(error);
        }
        self.process_document_changes();
        Ok(())
    }

    /// Handle everything the document observer has queued.
    pub fn process_document_changes(&mut self) {
        loop {
            let batch: Vec<DocumentChange> = self.changes.try_iter().collect();
            if batch.is_empty() {
                break;
            }
            for change in batch {
                if change.is_local_class() {
                    self.stats.ignored_echoes += change.entries.len() as u64;
                    continue;
                }
                if let Err(e) = self.apply_remote_batch(change.entries) {
                    self.report_error(&e);
                }
            }
        }
    }

    /// Apply a single remote entry change.
    pub fn on_remote_entry_change(&mut self, id: &str, kind: EntryChangeKind) -> Result<(), BridgeError> {
        let result = self.apply_remote_batch(vec![EntryChange { id: id.to_string(), kind }]);
        if let Err(e) = &result {
            self.report_error(e);
        }
        self.process_document_changes();
        result
    }

    fn apply_remote_batch(&mut self, entries: Vec<EntryChange>) -> Result<(), BridgeError> {
        self.with_remote_guard(|bridge| {
            // Shapes before connections so endpoints exist, removals last.
            let mut shapes = Vec::new();
            let mut connections = Vec::new();
            let mut removals = Vec::new();
            for entry in entries {
                match entry.kind {
                    EntryChangeKind::Removed => removals.push(entry),
                    _ => match bridge.document.get(&entry.id).map(|e| e.kind) {
                        Some(ElementKind::Connection) => connections.push(entry),
                        _ => shapes.push(entry),
                    },
                }
            }
            let removed: BTreeSet<ElementId> = removals.iter().map(|e| e.id.clone()).collect();

            let mut first_error = None;
            for entry in shapes.into_iter().chain(connections).chain(removals) {
                if let Err(e) = bridge.apply_remote_entry(&entry.id, &entry.kind, &removed) {
                    log::warn!("remote change to {} not applied: {}", entry.id, e);
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }

    fn apply_remote_entry(
        &mut self,
        id: &str,
        kind: &EntryChangeKind,
        removed_in_batch: &BTreeSet<ElementId>,
    ) -> Result<(), BridgeError> {
        let local = self.model.element(id);
        let remote = self.document.get(id);

        match (kind, &local, &remote) {
            (EntryChangeKind::Removed, None, _) => Ok(()),
            (EntryChangeKind::Removed, Some(_), _) => {
                self.detect_and_resolve(id, kind, local.as_ref(), None, removed_in_batch)
            }
            (_, _, None) => Ok(()),
            (_, None, Some(remote)) => self.materialize(remote.clone(), false),
            (_, Some(local), Some(remote)) => {
                let kind = match kind {
                    EntryChangeKind::Added => EntryChangeKind::Updated {
                        fields: BTreeSet::new(),
                    },
                    other => other.clone(),
                };
                let groups = match &kind {
                    EntryChangeKind::Updated { fields } if fields.is_empty() => {
                        local.differing_groups(remote)
                    }
                    other => other.groups(),
                };
                if self.unsettled_edits(id).is_empty() {
                    return self.apply_remote_fields(local, remote, &groups);
                }
                let change = EntryChangeKind::Updated {
                    fields: groups_as_fields(&groups, &kind),
                };
                self.detect_and_resolve(id, &change, Some(local), Some(remote), removed_in_batch)
            }
        }
    }

    fn detect_and_resolve(
        &mut self,
        id: &str,
        change: &EntryChangeKind,
        local: Option<&DiagramElement>,
        remote: Option<&DiagramElement>,
        removed_in_batch: &BTreeSet<ElementId>,
    ) -> Result<(), BridgeError> {
        let edits = self.unsettled_edits(id);
        let detected = self.conflicts.detect(DetectionInput {
            element_id: id,
            change,
            local,
            remote,
            local_edits: &edits,
        });
        let Some(conflict) = detected else {
            // Either the sides already agree or the edit did not overlap.
            return match (local, remote) {
                (Some(local), Some(remote)) => {
                    self.apply_remote_fields(local, remote, &change.groups())
                }
                _ => Ok(()),
            };
        };

        let critical = self.conflicts.config().critical_fields.clone();
        let ctx = StrategyContext {
            model: &self.model,
            rules: self.rules.as_ref(),
            locally_modified: !edits.is_empty(),
            removed_in_batch,
            critical_fields: &critical,
        };
        let conflict_id = conflict.id;
        let snapshot = conflict.clone();
        match self.conflicts.process(conflict, &ctx) {
            ConflictOutcome::Resolved(resolution) => {
                self.apply_resolution(&snapshot.element_id, snapshot.local.as_ref(), &resolution)
            }
            ConflictOutcome::Escalated { conflict_id: _, suggestions } => {
                self.events.push_back(BridgeEvent::ConflictEscalated {
                    conflict_id,
                    element_id: snapshot.element_id.clone(),
                    kind: snapshot.kind,
                    suggestions,
                });
                Ok(())
            }
        }
    }

    fn apply_resolution(
        &mut self,
        id: &str,
        local: Option<&DiagramElement>,
        resolution: &Resolution,
    ) -> Result<(), BridgeError> {
        let current = self.model.element(id);
        let remote = self.document.get(id);
        match resolution {
            Resolution::AcceptRemote => match (current, remote) {
                (Some(current), Some(remote)) => {
                    let groups = current.differing_groups(&remote);
                    self.apply_remote_fields(&current, &remote, &groups)
                }
                (None, Some(remote)) => self.materialize(remote, false),
                _ => Ok(()),
            },
            Resolution::SyncToModel => match remote {
                Some(remote) if current.is_none() => self.materialize(remote, false),
                _ => Ok(()),
            },
            Resolution::KeepLocal | Resolution::SyncToDocument => {
                let Some(local) = current.or_else(|| local.cloned()) else {
                    return Ok(());
                };
                if !self.model.contains(id) {
                    self.materialize(local.clone(), false)?;
                }
                let wrote = self.document.transact(DocOrigin::Local, |txn| txn.set(&local))?;
                self.note_local_write(wrote);
                Ok(())
            }
            Resolution::Merge { element } => {
                match current {
                    Some(current) => {
                        self.apply_remote_fields(&current, element, &current.differing_groups(element))?
                    }
                    None => self.materialize(element.clone(), false)?,
                }
                let wrote = self.document.transact(DocOrigin::Local, |txn| txn.set(element))?;
                self.note_local_write(wrote);
                Ok(())
            }
            Resolution::AcceptDeletion => {
                self.forget(id);
                if self.model.contains(id) {
                    let ids = vec![id.to_string()];
                    self.quietly(|model| model.remove_elements(&ids))?;
                    self.stats.remote_applied += 1;
                }
                Ok(())
            }
        }
    }

    /// Create a document-only element in the model.
    fn materialize(&mut self, element: DiagramElement, retried: bool) -> Result<(), BridgeError> {
        if self.model.contains(&element.id) {
            return Ok(());
        }
        if element.kind == ElementKind::Shape {
            self.quietly(|model| model.create_shape(element))?;
            self.stats.remote_applied += 1;
            return Ok(());
        }

        let missing: Vec<ElementId> = [&element.source, &element.target]
            .into_iter()
            .flatten()
            .filter(|ep| !self.model.contains(ep))
            .cloned()
            .collect();
        if missing.is_empty() {
            if let Some(task) = self.retries.remove(&element.id) {
                self.scheduler.cancel(task);
            }
            self.quietly(|model| model.create_connection(element))?;
            self.stats.remote_applied += 1;
            return Ok(());
        }

        if !retried {
            if !self.retries.contains_key(&element.id) {
                log::debug!("connection {} waits for endpoints {:?}", element.id, missing);
                let task = self.scheduler.schedule_in(
                    self.config.endpoint_retry_delay,
                    BridgeTask::RetryConnection { id: element.id.clone() },
                );
                self.retries.insert(element.id, task);
            }
            return Ok(());
        }

        log::warn!("dropping connection {}: endpoints {:?} never arrived", element.id, missing);
        self.stats.dropped_connections += 1;
        self.events.push_back(BridgeEvent::ConnectionDropped { id: element.id, missing });
        Ok(())
    }

    fn apply_remote_fields(
        &mut self,
        local: &DiagramElement,
        remote: &DiagramElement,
        groups: &BTreeSet<FieldGroup>,
    ) -> Result<(), BridgeError> {
        let id = local.id.clone();
        let mut applied = false;
        let held = self.conflicts.held_groups(&id);
        if groups.iter().any(|g| held.contains(g)) {
            log::trace!("holding {:?} on {} for a pending decision", held, id);
        }

        for group in groups.iter().filter(|g| !held.contains(*g)) {
            match group {
                FieldGroup::Geometry => {
                    if let Some(bounds) = remote.bounds {
                        if geometry_changed(local.bounds, bounds) {
                            self.quietly(|model| model.resize_shape(&id, bounds))?;
                            applied = true;
                        }
                    }
                }
                FieldGroup::Payload if local.payload != remote.payload => {
                    let payload = remote.payload.clone();
                    self.quietly(|model| model.update_properties(&id, payload))?;
                    applied = true;
                }
                FieldGroup::Waypoints if local.waypoints != remote.waypoints => {
                    let waypoints = remote.waypoints.clone();
                    self.quietly(|model| model.update_waypoints(&id, waypoints))?;
                    applied = true;
                }
                FieldGroup::Endpoints
                    if local.source != remote.source || local.target != remote.target =>
                {
                    if let (Some(source), Some(target)) = (remote.source.clone(), remote.target.clone()) {
                        self.quietly(|model| model.reconnect(&id, source, target))?;
                        applied = true;
                    }
                }
                FieldGroup::Parent if local.parent != remote.parent => {
                    let parent = remote.parent.clone();
                    self.quietly(|model| model.reparent(&id, parent))?;
                    applied = true;
                }
                _ => {}
            }
        }
        if applied {
            self.stats.remote_applied += 1;
        }
        Ok(())
    }

    /// Advance the clock and run every due task.
    pub fn tick(&mut self, now: Instant) {
        for (_, task) in self.scheduler.advance(now) {
            let result = match task {
                BridgeTask::FlushGeometry => {
                    self.flush_task = None;
                    self.flush()
                }
                BridgeTask::RetryConnection { id } => {
                    self.retries.remove(&id);
                    match self.document.get(&id) {
                        Some(element) => {
                            self.with_remote_guard(|bridge| bridge.materialize(element, true))
                        }
                        None => Ok(()),
                    }
                }
                BridgeTask::DeferredCreate { id, position } => {
                    self.deferred_creates.remove(&id);
                    self.guarded(|bridge| bridge.write_created(&id, position))
                }
                BridgeTask::FullResync => {
                    self.resync_task = None;
                    self.resync_from_model().map(|_| ())
                }
            };
            if let Err(e) = result {
                self.report_error(&e);
            }
        }

        let window = self.config.local_edit_window;
        let now = self.scheduler.now();
        self.local_edits
            .retain(|_, edit| now.saturating_duration_since(edit.at) < window);
        self.process_document_changes();
    }

    /// Rewrite the document from the local model.
    pub fn resync_from_model(&mut self) -> Result<usize, BridgeError> {
        let elements = self.model.elements();
        let keep: BTreeSet<&str> = elements.iter().map(|e| e.id.as_str()).collect();
        let wrote = self.document.transact(DocOrigin::Resync, |txn| {
            let mut wrote = 0;
            // Shapes first so connections never precede their endpoints.
            for element in elements.iter().filter(|e| !e.is_connection()) {
                wrote += txn.set(element)?;
            }
            for element in elements.iter().filter(|e| e.is_connection()) {
                wrote += txn.set(element)?;
            }
            for id in txn.ids() {
                if !keep.contains(id.as_str()) && txn.delete(&id) {
                    wrote += 1;
                }
            }
            Ok(wrote)
        })?;
        self.stats.resyncs += 1;
        log::info!("resynced {} elements into the document ({wrote} writes)", elements.len());
        self.events.push_back(BridgeEvent::ResyncCompleted { elements: elements.len() });
        self.process_document_changes();
        Ok(elements.len())
    }

    /// Repair ids present on only one side. Returns the number repaired,
    /// or zero when the sweep is still cooling down.
    pub fn check_consistency(&mut self) -> Result<usize, BridgeError> {
        let document = self.document.elements();
        let now = self.scheduler.now();
        let Some(repairs) =
            self.conflicts
                .check_consistency(now, &document, &self.model, self.rules.as_ref())
        else {
            return Ok(0);
        };
        let count = repairs.len();
        let result = self.with_remote_guard(|bridge| {
            for (conflict, resolution) in &repairs {
                bridge.apply_resolution(&conflict.element_id, conflict.local.as_ref(), resolution)?;
            }
            Ok(())
        });
        self.process_document_changes();
        result.map(|_| count)
    }

    /// Apply a user decision to an escalated conflict.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: Uuid,
        action: SuggestedAction,
        params: ManualParams,
    ) -> Result<(), BridgeError> {
        let (conflict, resolution) = self.conflicts.resolve_manually(conflict_id, action, params)?;
        let result = self.with_remote_guard(|bridge| {
            bridge.apply_resolution(&conflict.element_id, conflict.local.as_ref(), &resolution)
        });
        self.events.push_back(BridgeEvent::ConflictResolved {
            conflict_id,
            element_id: conflict.element_id,
        });
        self.process_document_changes();
        result
    }

    /// Surface an error at most once per cooldown window and schedule a
    /// full resync from the model.
    fn report_error(&mut self, error: &BridgeError) {
        self.stats.errors += 1;
        log::warn!("sync bridge error: {error}");
        if self.error_cooldown.try_acquire(self.scheduler.now()) {
            self.events.push_back(BridgeEvent::Error { message: error.to_string() });
        }
        if self.resync_task.is_none() {
            let task = self.scheduler.schedule_in(self.config.resync_delay, BridgeTask::FullResync);
            self.resync_task = Some(task);
        }
    }

    fn guarded<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        self.ctx.enter()?;
        let result = f(self);
        self.ctx.exit();
        result
    }

    fn with_remote_guard<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        self.ctx.enter()?;
        let previous = std::mem::replace(&mut self.ctx.applying_remote, true);
        let result = f(self);
        self.ctx.applying_remote = previous;
        self.ctx.exit();
        result
    }

    /// Mutate the model without syncing the mutation back out.
    fn quietly<R>(&mut self, f: impl FnOnce(&mut M) -> R) -> R {
        let previous = std::mem::replace(&mut self.ctx.applying_remote, true);
        let result = f(&mut self.model);
        for command in self.model.take_command_events() {
            if let Err(e) = self.on_local_command(command) {
                log::debug!("command emitted while applying remote state failed: {e}");
            }
        }
        self.ctx.applying_remote = previous;
        result
    }
}

/// Rounded geometry differs by at least one unit on some axis.
fn geometry_changed(current: Option<Bounds>, incoming: Bounds) -> bool {
    let Some(current) = current else { return true };
    let differs = |a: f64, b: f64| (a.round() - b.round()).abs() >= 1.0;
    differs(current.x, incoming.x)
        || differs(current.y, incoming.y)
        || differs(current.width, incoming.width)
        || differs(current.height, incoming.height)
}

/// Field names to hand to detection; a fresh entry touches every group.
fn groups_as_fields(groups: &BTreeSet<FieldGroup>, kind: &EntryChangeKind) -> BTreeSet<String> {
    if let EntryChangeKind::Updated { fields } = kind {
        if !fields.is_empty() {
            return fields.clone();
        }
    }
    groups
        .iter()
        .flat_map(|g| match g {
            FieldGroup::Geometry => vec!["x", "y", "width", "height"],
            FieldGroup::Payload => vec!["name"],
            FieldGroup::Endpoints => vec!["source", "target"],
            FieldGroup::Waypoints => vec!["waypoints"],
            FieldGroup::Parent => vec!["parent"],
        })
        .map(str::to_string)
        .collect()
}
