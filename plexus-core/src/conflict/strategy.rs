//! Built-in resolution strategies, one per conflict kind.

use std::collections::{BTreeSet, HashMap};

use super::{Conflict, ConflictError, ConflictKind, Resolution, SuggestedAction, Suggestion};
use crate::model::{would_cycle, DiagramModel, RuleChecker};
use crate::ElementId;

/// Read-only view of local state a strategy may consult.
pub struct StrategyContext<'a> {
    pub model: &'a dyn DiagramModel,
    pub rules: &'a dyn RuleChecker,
    /// The element has unsettled local edits
    pub locally_modified: bool,
    /// Ids removed by the same remote batch
    pub removed_in_batch: &'a BTreeSet<ElementId>,
    pub critical_fields: &'a BTreeSet<String>,
}

pub trait ResolutionStrategy {
    fn can_auto_resolve(&self, conflict: &Conflict, ctx: &StrategyContext<'_>) -> bool;

    fn resolve(
        &self,
        conflict: &Conflict,
        ctx: &StrategyContext<'_>,
    ) -> Result<Resolution, ConflictError>;

    fn suggestions(&self, conflict: &Conflict) -> Vec<Suggestion> {
        default_suggestions(conflict)
    }
}

pub fn default_suggestions(conflict: &Conflict) -> Vec<Suggestion> {
    let suggestion = |action, label: &str| Suggestion { action, label: label.to_string() };
    match conflict.kind {
        ConflictKind::Deletion => vec![
            suggestion(SuggestedAction::KeepLocal, "Restore the element"),
            suggestion(SuggestedAction::AcceptDeletion, "Accept the deletion"),
        ],
        _ => vec![
            suggestion(SuggestedAction::KeepLocal, "Keep my version"),
            suggestion(SuggestedAction::AcceptRemote, "Take their version"),
            suggestion(SuggestedAction::MergeManual, "Merge by hand"),
        ],
    }
}

pub fn default_strategies() -> HashMap<ConflictKind, Box<dyn ResolutionStrategy>> {
    let mut table: HashMap<ConflictKind, Box<dyn ResolutionStrategy>> = HashMap::new();
    table.insert(ConflictKind::Position, Box::new(PositionStrategy));
    table.insert(ConflictKind::Property, Box::new(PropertyStrategy));
    table.insert(ConflictKind::Connection, Box::new(ConnectionStrategy));
    table.insert(ConflictKind::Deletion, Box::new(DeletionStrategy));
    table.insert(ConflictKind::Structural, Box::new(StructuralStrategy));
    table.insert(ConflictKind::Consistency, Box::new(ConsistencyStrategy));
    table
}

/// The merged document value already is the answer.
pub struct PositionStrategy;

impl ResolutionStrategy for PositionStrategy {
    fn can_auto_resolve(&self, _conflict: &Conflict, _ctx: &StrategyContext<'_>) -> bool {
        true
    }

    fn resolve(&self, _: &Conflict, _: &StrategyContext<'_>) -> Result<Resolution, ConflictError> {
        Ok(Resolution::AcceptRemote)
    }
}

/// Last writer wins unless a critical field differs.
pub struct PropertyStrategy;

impl ResolutionStrategy for PropertyStrategy {
    fn can_auto_resolve(&self, conflict: &Conflict, ctx: &StrategyContext<'_>) -> bool {
        !conflict.fields.iter().any(|f| ctx.critical_fields.contains(f))
    }

    fn resolve(&self, _: &Conflict, _: &StrategyContext<'_>) -> Result<Resolution, ConflictError> {
        Ok(Resolution::AcceptRemote)
    }
}

/// Remote endpoints must exist locally and pass the connect rule.
pub struct ConnectionStrategy;

impl ResolutionStrategy for ConnectionStrategy {
    fn can_auto_resolve(&self, conflict: &Conflict, ctx: &StrategyContext<'_>) -> bool {
        let Some(remote) = &conflict.remote else { return false };
        let (Some(source), Some(target)) = (&remote.source, &remote.target) else {
            return false;
        };
        match (ctx.model.element(source), ctx.model.element(target)) {
            (Some(s), Some(t)) => ctx.rules.can_connect(&s, &t),
            _ => false,
        }
    }

    fn resolve(&self, _: &Conflict, _: &StrategyContext<'_>) -> Result<Resolution, ConflictError> {
        Ok(Resolution::AcceptRemote)
    }
}

/// Deletions apply unless the element was edited locally or still has
/// dependents that the same batch does not remove.
pub struct DeletionStrategy;

impl ResolutionStrategy for DeletionStrategy {
    fn can_auto_resolve(&self, conflict: &Conflict, ctx: &StrategyContext<'_>) -> bool {
        if ctx.locally_modified {
            return false;
        }
        !ctx.model.elements().iter().any(|e| {
            e.id != conflict.element_id
                && e.references(&conflict.element_id)
                && !ctx.removed_in_batch.contains(&e.id)
        })
    }

    fn resolve(&self, _: &Conflict, _: &StrategyContext<'_>) -> Result<Resolution, ConflictError> {
        Ok(Resolution::AcceptDeletion)
    }
}

/// Reparenting applies when it closes no cycle and the rule allows it.
pub struct StructuralStrategy;

impl ResolutionStrategy for StructuralStrategy {
    fn can_auto_resolve(&self, conflict: &Conflict, ctx: &StrategyContext<'_>) -> bool {
        let Some(remote) = &conflict.remote else { return false };
        let Some(parent_id) = &remote.parent else { return true };
        let Some(parent) = ctx.model.element(parent_id) else { return false };
        let child = conflict.local.as_ref().unwrap_or(remote);
        !would_cycle(ctx.model, &conflict.element_id, parent_id)
            && ctx.rules.can_reparent(child, &parent)
    }

    fn resolve(&self, _: &Conflict, _: &StrategyContext<'_>) -> Result<Resolution, ConflictError> {
        Ok(Resolution::AcceptRemote)
    }
}

/// Copy the element to whichever side lacks it.
pub struct ConsistencyStrategy;

impl ResolutionStrategy for ConsistencyStrategy {
    fn can_auto_resolve(&self, _conflict: &Conflict, _ctx: &StrategyContext<'_>) -> bool {
        true
    }

    fn resolve(
        &self,
        conflict: &Conflict,
        _ctx: &StrategyContext<'_>,
    ) -> Result<Resolution, ConflictError> {
        match (&conflict.local, &conflict.remote) {
            (None, Some(_)) => Ok(Resolution::SyncToModel),
            (Some(_), None) => Ok(Resolution::SyncToDocument),
            _ => Err(ConflictError::Unresolvable(format!(
                "{} is not one-sided",
                conflict.element_id
            ))),
        }
    }
}
