//! Conflict detection and resolution.
//!
//! A conflict is raised when a remote change lands on an element that also
//! carries a recent, not yet settled local edit to the same field group,
//! or when a remote deletion hits an element the local model still holds.
//!
//! ```text
//! detected ──► auto-resolving ──► resolved
//!     │
//!     └──────► awaiting-user ──(resolve_manually)──► resolved
//! ```
//!
//! Each [`ConflictKind`] maps to one [`ResolutionStrategy`]; the default
//! table lives in [`strategy`] and can be overridden per kind.

pub mod strategy;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::EntryChangeKind;
use crate::model::{DiagramModel, RuleChecker};
use crate::schedule::Cooldown;
use crate::{DiagramElement, ElementId, FieldGroup};

pub use strategy::{default_strategies, ResolutionStrategy, StrategyContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictKind {
    Position,
    Property,
    Connection,
    Deletion,
    Structural,
    /// Synthetic: id present on only one side after a consistency sweep
    Consistency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictState {
    Detected,
    AutoResolving,
    AwaitingUser,
    Resolved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub id: Uuid,
    pub kind: ConflictKind,
    pub element_id: ElementId,
    pub local: Option<DiagramElement>,
    pub remote: Option<DiagramElement>,
    /// Field groups both sides touched
    pub groups: BTreeSet<FieldGroup>,
    /// Payload field names that differ, when payload is among `groups`
    pub fields: BTreeSet<String>,
    pub severity: Severity,
    pub state: ConflictState,
    /// Milliseconds since the Unix epoch
    pub detected_at: u64,
}

/// What the bridge must do to settle a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Apply the merged document value to the local model
    AcceptRemote,
    /// Write the local value back into the document
    KeepLocal,
    /// Write a caller-provided value to both sides
    Merge { element: DiagramElement },
    /// Remove the element from the local model
    AcceptDeletion,
    /// Create the document-only element in the model
    SyncToModel,
    /// Write the model-only element into the document
    SyncToDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestedAction {
    KeepLocal,
    AcceptRemote,
    MergeManual,
    AcceptDeletion,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub action: SuggestedAction,
    pub label: String,
}

/// Extra input for a manual decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManualParams {
    /// Required for [`SuggestedAction::MergeManual`]
    pub merged: Option<DiagramElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    Resolved(Resolution),
    Escalated { conflict_id: Uuid, suggestions: Vec<Suggestion> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    Automatic,
    User,
}

#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub conflict: Conflict,
    pub resolution: Resolution,
    pub resolved_by: ResolvedBy,
    pub resolved_at: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictStats {
    pub detected: u64,
    pub auto_resolved: u64,
    pub manually_resolved: u64,
    pub escalated: u64,
}

#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Payload fields whose concurrent edits always need a human
    pub critical_fields: BTreeSet<String>,
    /// Maximum resolved conflicts kept for audit
    pub history_capacity: usize,
    /// Minimum spacing between consistency sweeps
    pub consistency_interval: Duration,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            critical_fields: BTreeSet::new(),
            history_capacity: 100,
            consistency_interval: Duration::from_secs(30),
        }
    }
}

impl ConflictConfig {
    pub fn for_testing() -> Self {
        Self {
            critical_fields: ["name".to_string()].into_iter().collect(),
            history_capacity: 8,
            consistency_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictError {
    UnknownConflict(Uuid),
    /// The chosen action does not fit the conflict kind
    ActionNotApplicable { action: SuggestedAction, kind: ConflictKind },
    MissingMergeValue,
    /// A strategy could not produce a resolution
    Unresolvable(String),
}

impl std::fmt::Display for ConflictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictError::UnknownConflict(id) => write!(f, "Unknown conflict: {id}"),
            ConflictError::ActionNotApplicable { action, kind } => {
                write!(f, "{action:?} cannot resolve a {kind:?} conflict")
            }
            ConflictError::MissingMergeValue => write!(f, "Manual merge requires a merged value"),
            ConflictError::Unresolvable(reason) => write!(f, "Unresolvable conflict: {reason}"),
        }
    }
}

impl std::error::Error for ConflictError {}

/// Everything detection needs to know about one remote entry change.
pub struct DetectionInput<'a> {
    pub element_id: &'a str,
    pub change: &'a EntryChangeKind,
    pub local: Option<&'a DiagramElement>,
    pub remote: Option<&'a DiagramElement>,
    /// Field groups with unsettled local edits on this element
    pub local_edits: &'a BTreeSet<FieldGroup>,
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct ConflictEngine {
    config: ConflictConfig,
    strategies: HashMap<ConflictKind, Box<dyn ResolutionStrategy>>,
    awaiting: BTreeMap<Uuid, Conflict>,
    history: VecDeque<ConflictRecord>,
    stats: ConflictStats,
    sweep: Cooldown,
}

impl ConflictEngine {
    pub fn new(config: ConflictConfig) -> Self {
        let sweep = Cooldown::new(config.consistency_interval);
        Self {
            config,
            strategies: default_strategies(),
            awaiting: BTreeMap::new(),
            history: VecDeque::new(),
            stats: ConflictStats::default(),
            sweep,
        }
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    /// Replace the strategy used for one conflict kind.
    pub fn register_strategy(&mut self, kind: ConflictKind, strategy: Box<dyn ResolutionStrategy>) {
        self.strategies.insert(kind, strategy);
    }

    /// Classify a remote change. `None` means it can be applied directly.
    pub fn detect(&mut self, input: DetectionInput<'_>) -> Option<Conflict> {
        let (kind, groups, fields) = match (input.change, input.local, input.remote) {
            (EntryChangeKind::Removed, Some(_), _) => {
                (ConflictKind::Deletion, BTreeSet::new(), BTreeSet::new())
            }
            (EntryChangeKind::Removed, None, _) => return None,
            (change, Some(local), Some(remote)) => {
                let touched = change.groups();
                let groups: BTreeSet<FieldGroup> = local
                    .differing_groups(remote)
                    .into_iter()
                    .filter(|g| touched.contains(g) && input.local_edits.contains(g))
                    .collect();
                if groups.is_empty() {
                    return None;
                }
                let kind = classify(&groups);
                // Payload can ride along with a more structural group.
                let fields = if groups.contains(&FieldGroup::Payload) {
                    local.payload.differing_fields(&remote.payload)
                } else {
                    BTreeSet::new()
                };
                (kind, groups, fields)
            }
            _ => return None,
        };

        let critical = fields.iter().any(|f| self.config.critical_fields.contains(f));
        let severity = if critical { Severity::Critical } else { base_severity(kind) };

        self.stats.detected += 1;
        let conflict = Conflict {
            id: Uuid::new_v4(),
            kind,
            element_id: input.element_id.to_string(),
            local: input.local.cloned(),
            remote: input.remote.cloned(),
            groups,
            fields,
            severity,
            state: ConflictState::Detected,
            detected_at: unix_millis(),
        };
        log::debug!(
            "conflict {} detected: {:?} on {} ({:?})",
            conflict.id,
            conflict.kind,
            conflict.element_id,
            conflict.severity
        );
        Some(conflict)
    }

    /// Run the strategy for a detected conflict.
    ///
    /// Strategy errors escalate instead of propagating.
    pub fn process(&mut self, mut conflict: Conflict, ctx: &StrategyContext<'_>) -> ConflictOutcome {
        if self.touches_critical(&conflict) {
            return self.escalate(conflict);
        }
        let attempt = match self.strategies.get(&conflict.kind) {
            Some(strategy) if strategy.can_auto_resolve(&conflict, ctx) => {
                conflict.state = ConflictState::AutoResolving;
                Some(strategy.resolve(&conflict, ctx))
            }
            Some(_) => None,
            None => Some(Err(ConflictError::Unresolvable(format!(
                "no strategy for {:?}",
                conflict.kind
            )))),
        };

        match attempt {
            Some(Ok(resolution)) => {
                self.stats.auto_resolved += 1;
                self.record(conflict, resolution.clone(), ResolvedBy::Automatic);
                ConflictOutcome::Resolved(resolution)
            }
            Some(Err(e)) => {
                log::warn!("strategy for conflict {} failed: {}", conflict.id, e);
                self.escalate(conflict)
            }
            None => self.escalate(conflict),
        }
    }

    fn touches_critical(&self, conflict: &Conflict) -> bool {
        conflict.fields.iter().any(|f| self.config.critical_fields.contains(f))
    }

    fn escalate(&mut self, mut conflict: Conflict) -> ConflictOutcome {
        conflict.state = ConflictState::AwaitingUser;
        let suggestions = match self.strategies.get(&conflict.kind) {
            Some(strategy) => strategy.suggestions(&conflict),
            None => strategy::default_suggestions(&conflict),
        };
        let conflict_id = conflict.id;
        log::info!(
            "conflict {} on {} needs attention ({:?})",
            conflict_id,
            conflict.element_id,
            conflict.kind
        );
        self.stats.escalated += 1;
        self.awaiting.insert(conflict_id, conflict);
        ConflictOutcome::Escalated { conflict_id, suggestions }
    }

    /// Settle an escalated conflict with a user decision.
    pub fn resolve_manually(
        &mut self,
        id: Uuid,
        action: SuggestedAction,
        params: ManualParams,
    ) -> Result<(Conflict, Resolution), ConflictError> {
        let conflict = self.awaiting.get(&id).ok_or(ConflictError::UnknownConflict(id))?;

        let resolution = match action {
            SuggestedAction::KeepLocal => Resolution::KeepLocal,
            SuggestedAction::AcceptRemote => Resolution::AcceptRemote,
            SuggestedAction::MergeManual => {
                let mut element = params.merged.ok_or(ConflictError::MissingMergeValue)?;
                element.id = conflict.element_id.clone();
                Resolution::Merge { element }
            }
            SuggestedAction::AcceptDeletion if conflict.kind == ConflictKind::Deletion => {
                Resolution::AcceptDeletion
            }
            SuggestedAction::AcceptDeletion => {
                return Err(ConflictError::ActionNotApplicable { action, kind: conflict.kind })
            }
        };

        let Some(conflict) = self.awaiting.remove(&id) else {
            return Err(ConflictError::UnknownConflict(id));
        };
        self.stats.manually_resolved += 1;
        self.record(conflict.clone(), resolution.clone(), ResolvedBy::User);
        Ok((conflict, resolution))
    }

    /// Diff the id sets of the document and the model.
    ///
    /// Returns `None` when called again inside the sweep interval.
    pub fn check_consistency(
        &mut self,
        now: Instant,
        document: &[DiagramElement],
        model: &dyn DiagramModel,
        rules: &dyn RuleChecker,
    ) -> Option<Vec<(Conflict, Resolution)>> {
        if !self.sweep.try_acquire(now) {
            return None;
        }

        let doc_ids: BTreeMap<&str, &DiagramElement> =
            document.iter().map(|e| (e.id.as_str(), e)).collect();
        let local = model.elements();
        let model_ids: BTreeMap<&str, &DiagramElement> =
            local.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut one_sided: Vec<(ElementId, Option<DiagramElement>, Option<DiagramElement>)> =
            Vec::new();
        for (id, element) in &doc_ids {
            if !model_ids.contains_key(id) {
                one_sided.push((id.to_string(), None, Some((*element).clone())));
            }
        }
        for (id, element) in &model_ids {
            if !doc_ids.contains_key(id) {
                one_sided.push((id.to_string(), Some((*element).clone()), None));
            }
        }

        let removed = BTreeSet::new();
        let ctx = StrategyContext {
            model,
            rules,
            locally_modified: false,
            removed_in_batch: &removed,
            critical_fields: &self.config.critical_fields,
        };

        let mut resolved = Vec::new();
        let mut records = Vec::new();
        for (element_id, local, remote) in one_sided {
            let conflict = Conflict {
                id: Uuid::new_v4(),
                kind: ConflictKind::Consistency,
                element_id,
                local,
                remote,
                groups: BTreeSet::new(),
                fields: BTreeSet::new(),
                severity: base_severity(ConflictKind::Consistency),
                state: ConflictState::AutoResolving,
                detected_at: unix_millis(),
            };
            let outcome = self
                .strategies
                .get(&ConflictKind::Consistency)
                .map(|s| s.resolve(&conflict, &ctx));
            match outcome {
                Some(Ok(resolution)) => {
                    records.push((conflict.clone(), resolution.clone()));
                    resolved.push((conflict, resolution));
                }
                Some(Err(e)) => log::warn!("consistency repair skipped: {e}"),
                None => log::warn!("no consistency strategy registered"),
            }
        }

        if !resolved.is_empty() {
            log::info!("consistency sweep found {} one-sided elements", resolved.len());
        }
        for (conflict, resolution) in records {
            self.stats.detected += 1;
            self.stats.auto_resolved += 1;
            self.record(conflict, resolution, ResolvedBy::Automatic);
        }
        Some(resolved)
    }

    fn record(&mut self, mut conflict: Conflict, resolution: Resolution, resolved_by: ResolvedBy) {
        conflict.state = ConflictState::Resolved;
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(ConflictRecord {
            conflict,
            resolution,
            resolved_by,
            resolved_at: unix_millis(),
        });
    }

    pub fn awaiting(&self) -> impl Iterator<Item = &Conflict> {
        self.awaiting.values()
    }

    /// Field groups of an element that wait on a user decision.
    ///
    /// Remote values for these groups must not reach the model until the
    /// conflicts holding them are resolved.
    pub fn held_groups(&self, element_id: &str) -> BTreeSet<FieldGroup> {
        self.awaiting
            .values()
            .filter(|c| c.element_id == element_id)
            .flat_map(|c| c.groups.iter().copied())
            .collect()
    }

    pub fn awaiting_count(&self) -> usize {
        self.awaiting.len()
    }

    pub fn history(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.history.iter()
    }

    pub fn stats(&self) -> ConflictStats {
        self.stats
    }
}

impl Default for ConflictEngine {
    fn default() -> Self {
        Self::new(ConflictConfig::default())
    }
}

/// Most structural group wins when several collide at once.
fn classify(groups: &BTreeSet<FieldGroup>) -> ConflictKind {
    if groups.contains(&FieldGroup::Endpoints) {
        ConflictKind::Connection
    } else if groups.contains(&FieldGroup::Parent) {
        ConflictKind::Structural
    } else if groups.contains(&FieldGroup::Payload) {
        ConflictKind::Property
    } else {
        ConflictKind::Position
    }
}

fn base_severity(kind: ConflictKind) -> Severity {
    match kind {
        ConflictKind::Position | ConflictKind::Consistency => Severity::Low,
        ConflictKind::Property => Severity::Medium,
        ConflictKind::Connection | ConflictKind::Structural | ConflictKind::Deletion => {
            Severity::High
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InMemoryDiagram, PermissiveRules};
    use crate::Bounds;

    fn shape(id: &str, x: f64) -> DiagramElement {
        DiagramElement::shape(id, Some(Bounds::new(x, 0.0, 100.0, 80.0))).with_name("Task")
    }

    fn groups(list: &[FieldGroup]) -> BTreeSet<FieldGroup> {
        list.iter().copied().collect()
    }

    fn updated(fields: &[&str]) -> EntryChangeKind {
        EntryChangeKind::Updated { fields: fields.iter().map(|f| f.to_string()).collect() }
    }

    fn detect_kind(
        engine: &mut ConflictEngine,
        local: &DiagramElement,
        remote: &DiagramElement,
        change: &EntryChangeKind,
        edits: &[FieldGroup],
    ) -> Option<ConflictKind> {
        let edits = groups(edits);
        engine
            .detect(DetectionInput {
                element_id: &local.id,
                change,
                local: Some(local),
                remote: Some(remote),
                local_edits: &edits,
            })
            .map(|c| c.kind)
    }

    #[test]
    fn test_classification() {
        let mut engine = ConflictEngine::default();
        let local = shape("A", 0.0);

        let remote = shape("A", 40.0);
        assert_eq!(
            detect_kind(&mut engine, &local, &remote, &updated(&["x"]), &[FieldGroup::Geometry]),
            Some(ConflictKind::Position)
        );

        let remote = local.clone().with_parent("Lane");
        assert_eq!(
            detect_kind(&mut engine, &local, &remote, &updated(&["parent"]), &[FieldGroup::Parent]),
            Some(ConflictKind::Structural)
        );

        let local_c = DiagramElement::connection("C", "A", "B", vec![]);
        let remote_c = DiagramElement::connection("C", "A", "D", vec![]);
        assert_eq!(
            detect_kind(
                &mut engine,
                &local_c,
                &remote_c,
                &updated(&["target"]),
                &[FieldGroup::Endpoints]
            ),
            Some(ConflictKind::Connection)
        );

        let remote = local.clone().with_name("Approve");
        assert_eq!(
            detect_kind(&mut engine, &local, &remote, &updated(&["name"]), &[FieldGroup::Payload]),
            Some(ConflictKind::Property)
        );
    }

    #[test]
    fn test_no_conflict_without_local_edit() {
        let mut engine = ConflictEngine::default();
        let local = shape("A", 0.0);
        let remote = shape("A", 40.0);
        assert_eq!(detect_kind(&mut engine, &local, &remote, &updated(&["x"]), &[]), None);
        assert_eq!(engine.stats().detected, 0);
    }

    #[test]
    fn test_deletion_of_known_id() {
        let mut engine = ConflictEngine::default();
        let local = shape("A", 0.0);
        let none = BTreeSet::new();
        let conflict = engine
            .detect(DetectionInput {
                element_id: "A",
                change: &EntryChangeKind::Removed,
                local: Some(&local),
                remote: None,
                local_edits: &none,
            })
            .unwrap();
        assert_eq!(conflict.kind, ConflictKind::Deletion);
        assert_eq!(conflict.severity, Severity::High);
    }

    #[test]
    fn test_critical_field_escalates() {
        let mut engine = ConflictEngine::new(ConflictConfig::for_testing());
        let model = InMemoryDiagram::new();
        let local = shape("A", 0.0);
        let remote = local.clone().with_name("Approve");

        let conflict = {
            let edits = groups(&[FieldGroup::Payload]);
            let change = updated(&["name"]);
            engine
                .detect(DetectionInput {
                    element_id: "A",
                    change: &change,
                    local: Some(&local),
                    remote: Some(&remote),
                    local_edits: &edits,
                })
                .unwrap()
        };
        assert_eq!(conflict.severity, Severity::Critical);

        let removed = BTreeSet::new();
        let critical = engine.config().critical_fields.clone();
        let ctx = StrategyContext {
            model: &model,
            rules: &PermissiveRules,
            locally_modified: true,
            removed_in_batch: &removed,
            critical_fields: &critical,
        };
        let outcome = engine.process(conflict, &ctx);
        let ConflictOutcome::Escalated { conflict_id, suggestions } = outcome else {
            panic!("critical field must escalate");
        };
        assert!(suggestions.iter().any(|s| s.action == SuggestedAction::MergeManual));
        assert_eq!(engine.awaiting_count(), 1);

        let err = engine
            .resolve_manually(conflict_id, SuggestedAction::AcceptDeletion, ManualParams::default())
            .unwrap_err();
        assert!(matches!(err, ConflictError::ActionNotApplicable { .. }));

        let (_, resolution) = engine
            .resolve_manually(conflict_id, SuggestedAction::KeepLocal, ManualParams::default())
            .unwrap();
        assert_eq!(resolution, Resolution::KeepLocal);
        assert_eq!(engine.awaiting_count(), 0);
        assert_eq!(engine.stats().manually_resolved, 1);
        assert_eq!(engine.history().count(), 1);
    }

    #[test]
    fn test_critical_field_escalates_alongside_reparent() {
        let mut engine = ConflictEngine::new(ConflictConfig::for_testing());
        let mut model = InMemoryDiagram::new();
        model.create_shape(shape("Lane", 0.0)).unwrap();
        let local = shape("A", 0.0).with_name("Approve");
        let remote = shape("A", 0.0).with_name("Reject").with_parent("Lane");

        let edits = groups(&[FieldGroup::Payload, FieldGroup::Parent]);
        let change = updated(&["name", "parent"]);
        let conflict = engine
            .detect(DetectionInput {
                element_id: "A",
                change: &change,
                local: Some(&local),
                remote: Some(&remote),
                local_edits: &edits,
            })
            .unwrap();
        assert_eq!(conflict.kind, ConflictKind::Structural);
        assert!(conflict.fields.contains("name"));
        assert_eq!(conflict.severity, Severity::Critical);

        let removed = BTreeSet::new();
        let critical = engine.config().critical_fields.clone();
        let ctx = StrategyContext {
            model: &model,
            rules: &PermissiveRules,
            locally_modified: true,
            removed_in_batch: &removed,
            critical_fields: &critical,
        };
        assert!(matches!(engine.process(conflict, &ctx), ConflictOutcome::Escalated { .. }));
        assert_eq!(engine.stats().auto_resolved, 0);
        assert_eq!(
            engine.held_groups("A"),
            groups(&[FieldGroup::Payload, FieldGroup::Parent])
        );
        assert!(engine.held_groups("Lane").is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut engine = ConflictEngine::new(ConflictConfig::for_testing());
        let model = InMemoryDiagram::new();
        let removed = BTreeSet::new();
        let critical = BTreeSet::new();
        let ctx = StrategyContext {
            model: &model,
            rules: &PermissiveRules,
            locally_modified: true,
            removed_in_batch: &removed,
            critical_fields: &critical,
        };
        let local = shape("A", 0.0);
        for i in 0..20 {
            let remote = shape("A", 10.0 + i as f64);
            let edits = groups(&[FieldGroup::Geometry]);
            let change = updated(&["x"]);
            let conflict = engine
                .detect(DetectionInput {
                    element_id: "A",
                    change: &change,
                    local: Some(&local),
                    remote: Some(&remote),
                    local_edits: &edits,
                })
                .unwrap();
            assert_eq!(engine.process(conflict, &ctx), ConflictOutcome::Resolved(Resolution::AcceptRemote));
        }
        assert_eq!(engine.history().count(), 8);
        assert_eq!(engine.stats().auto_resolved, 20);
    }

    #[test]
    fn test_consistency_sweep_is_rate_limited() {
        let mut engine = ConflictEngine::new(ConflictConfig::for_testing());
        let mut model = InMemoryDiagram::new();
        model.create_shape(shape("OnlyLocal", 0.0)).unwrap();
        let document = vec![shape("OnlyRemote", 0.0)];

        let now = Instant::now();
        let result = engine
            .check_consistency(now, &document, &model, &PermissiveRules)
            .unwrap();
        let by_id: BTreeMap<_, _> =
            result.iter().map(|(c, r)| (c.element_id.as_str(), r.clone())).collect();
        assert_eq!(by_id["OnlyRemote"], Resolution::SyncToModel);
        assert_eq!(by_id["OnlyLocal"], Resolution::SyncToDocument);

        assert!(engine.check_consistency(now, &document, &model, &PermissiveRules).is_none());
    }
}
