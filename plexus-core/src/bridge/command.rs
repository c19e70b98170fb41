use serde::{Deserialize, Serialize};

use crate::{ElementId, Point};

/// Structural command notifications emitted by the editor after it has
/// applied the change to its own model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalCommand {
    /// Shape created; `position` is the placement the editor asked for.
    Create { id: ElementId, position: Option<Point> },
    Connect { id: ElementId },
    Delete { ids: Vec<ElementId> },
    Move { ids: Vec<ElementId> },
    Resize { id: ElementId },
    UpdateWaypoints { id: ElementId },
    UpdateProperties { id: ElementId },
    Reconnect { id: ElementId },
    /// Connection removed
    Disconnect { id: ElementId },
    Reparent { id: ElementId },
    /// A composite append is starting; the create and connect that follow
    /// belong to it.
    AppendBegin { shape_id: ElementId, connection_id: ElementId },
    Append {
        source_id: ElementId,
        shape_id: ElementId,
        connection_id: ElementId,
        position: Option<Point>,
    },
}

impl LocalCommand {
    pub fn name(&self) -> &'static str {
        match self {
            LocalCommand::Create { .. } => "shape.create",
            LocalCommand::Connect { .. } => "connection.create",
            LocalCommand::Delete { .. } => "elements.delete",
            LocalCommand::Move { .. } => "elements.move",
            LocalCommand::Resize { .. } => "shape.resize",
            LocalCommand::UpdateWaypoints { .. } => "connection.updateWaypoints",
            LocalCommand::UpdateProperties { .. } => "element.updateProperties",
            LocalCommand::Reconnect { .. } => "connection.reconnect",
            LocalCommand::Disconnect { .. } => "connection.delete",
            LocalCommand::Reparent { .. } => "element.reparent",
            LocalCommand::AppendBegin { .. } => "shape.append.begin",
            LocalCommand::Append { .. } => "shape.append",
        }
    }
}
