//! External diagram model contract.
//!
//! The editor owns the rich model; the bridge only reads it through
//! queries and mutates it through the narrow mutator set below.
//! [`InMemoryDiagram`] is a complete implementation used by headless
//! clients and tests.

use std::collections::BTreeMap;

use crate::bridge::LocalCommand;
use crate::{Bounds, DiagramElement, ElementId, ElementKind, Payload, Point};

#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// No element with this id
    NotFound(ElementId),
    /// An element with this id already exists
    Duplicate(ElementId),
    /// Connection endpoint does not exist in the model
    MissingEndpoint { connection: ElementId, endpoint: ElementId },
    /// Element has the wrong kind for the operation
    WrongKind { id: ElementId, expected: ElementKind },
    /// Model refused the mutation
    Rejected(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::NotFound(id) => write!(f, "Element not found: {id}"),
            ModelError::Duplicate(id) => write!(f, "Element already exists: {id}"),
            ModelError::MissingEndpoint { connection, endpoint } => {
                write!(f, "Connection {connection} references missing endpoint {endpoint}")
            }
            ModelError::WrongKind { id, expected } => {
                write!(f, "Element {id} is not a {}", expected.as_str())
            }
            ModelError::Rejected(reason) => write!(f, "Mutation rejected: {reason}"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Queries and mutators the sync layer needs from the editor's model.
pub trait DiagramModel {
    fn element(&self, id: &str) -> Option<DiagramElement>;

    fn elements(&self) -> Vec<DiagramElement>;

    fn contains(&self, id: &str) -> bool {
        self.element(id).is_some()
    }

    fn create_shape(&mut self, element: DiagramElement) -> Result<(), ModelError>;

    fn create_connection(&mut self, element: DiagramElement) -> Result<(), ModelError>;

    fn remove_elements(&mut self, ids: &[ElementId]) -> Result<(), ModelError>;

    fn resize_shape(&mut self, id: &str, bounds: Bounds) -> Result<(), ModelError>;

    fn update_properties(&mut self, id: &str, payload: Payload) -> Result<(), ModelError>;

    fn update_waypoints(&mut self, id: &str, waypoints: Vec<Point>) -> Result<(), ModelError>;

    fn reparent(&mut self, id: &str, parent: Option<ElementId>) -> Result<(), ModelError>;

    fn reconnect(
        &mut self,
        id: &str,
        source: ElementId,
        target: ElementId,
    ) -> Result<(), ModelError>;

    /// Structural command notifications produced since the last call.
    fn take_command_events(&mut self) -> Vec<LocalCommand> {
        Vec::new()
    }
}

/// Legality checks shared by direct edits and conflict resolution.
pub trait RuleChecker {
    fn can_connect(&self, source: &DiagramElement, target: &DiagramElement) -> bool;

    fn can_reparent(&self, child: &DiagramElement, parent: &DiagramElement) -> bool;
}

/// Allows every connection and every reparent.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveRules;

impl RuleChecker for PermissiveRules {
    fn can_connect(&self, _source: &DiagramElement, _target: &DiagramElement) -> bool {
        true
    }

    fn can_reparent(&self, _child: &DiagramElement, _parent: &DiagramElement) -> bool {
        true
    }
}

/// Whether making `parent` the parent of `child` would close a cycle.
pub fn would_cycle(model: &dyn DiagramModel, child: &str, parent: &str) -> bool {
    let mut cursor = Some(parent.to_string());
    let mut hops = 0usize;
    while let Some(id) = cursor {
        if id == child {
            return true;
        }
        hops += 1;
        if hops > 10_000 {
            // A pre-existing cycle in the model itself.
            return true;
        }
        cursor = model.element(&id).and_then(|e| e.parent);
    }
    false
}

/// Ordered in-memory diagram.
///
/// Built with [`with_command_events`](Self::with_command_events) it also
/// behaves like an editor: every mutation queues the matching
/// [`LocalCommand`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryDiagram {
    elements: BTreeMap<ElementId, DiagramElement>,
    emit_commands: bool,
    events: Vec<LocalCommand>,
}

impl InMemoryDiagram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command_events() -> Self {
        Self { emit_commands: true, ..Self::default() }
    }

    fn emit(&mut self, command: LocalCommand) {
        if self.emit_commands {
            self.events.push(command);
        }
    }

    /// Create a shape at `position` and connect `source` to it in one
    /// composite command.
    pub fn append(
        &mut self,
        source_id: &str,
        shape: DiagramElement,
        connection_id: &str,
        position: Option<Point>,
    ) -> Result<(), ModelError> {
        if !self.elements.contains_key(source_id) {
            return Err(ModelError::NotFound(source_id.to_string()));
        }
        let shape_id = shape.id.clone();
        self.emit(LocalCommand::AppendBegin {
            shape_id: shape_id.clone(),
            connection_id: connection_id.to_string(),
        });
        self.create_shape(shape)?;
        self.create_connection(DiagramElement::connection(
            connection_id,
            source_id,
            shape_id.as_str(),
            Vec::new(),
        ))?;
        self.emit(LocalCommand::Append {
            source_id: source_id.to_string(),
            shape_id,
            connection_id: connection_id.to_string(),
            position,
        });
        Ok(())
    }

    /// Move shapes by an offset, as one command.
    pub fn move_elements(&mut self, ids: &[ElementId], dx: f64, dy: f64) -> Result<(), ModelError> {
        for id in ids {
            let element = self.get_mut(id)?;
            if let Some(b) = element.bounds.as_mut() {
                b.x += dx;
                b.y += dy;
            }
        }
        self.emit(LocalCommand::Move { ids: ids.to_vec() });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut DiagramElement, ModelError> {
        self.elements
            .get_mut(id)
            .ok_or_else(|| ModelError::NotFound(id.to_string()))
    }
}

impl DiagramModel for InMemoryDiagram {
    fn element(&self, id: &str) -> Option<DiagramElement> {
        self.elements.get(id).cloned()
    }

    fn elements(&self) -> Vec<DiagramElement> {
        self.elements.values().cloned().collect()
    }

    fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    fn create_shape(&mut self, element: DiagramElement) -> Result<(), ModelError> {
        if element.kind != ElementKind::Shape {
            return Err(ModelError::WrongKind { id: element.id, expected: ElementKind::Shape });
        }
        if self.elements.contains_key(&element.id) {
            return Err(ModelError::Duplicate(element.id));
        }
        let id = element.id.clone();
        self.elements.insert(id.clone(), element);
        self.emit(LocalCommand::Create { id, position: None });
        Ok(())
    }

    fn create_connection(&mut self, element: DiagramElement) -> Result<(), ModelError> {
        if element.kind != ElementKind::Connection {
            return Err(ModelError::WrongKind {
                id: element.id,
                expected: ElementKind::Connection,
            });
        }
        if self.elements.contains_key(&element.id) {
            return Err(ModelError::Duplicate(element.id));
        }
        for endpoint in [&element.source, &element.target] {
            match endpoint {
                Some(ep) if self.elements.contains_key(ep) => {}
                Some(ep) => {
                    return Err(ModelError::MissingEndpoint {
                        connection: element.id.clone(),
                        endpoint: ep.clone(),
                    })
                }
                None => {
                    return Err(ModelError::Rejected(format!(
                        "connection {} needs both endpoints",
                        element.id
                    )))
                }
            }
        }
        let id = element.id.clone();
        self.elements.insert(id.clone(), element);
        self.emit(LocalCommand::Connect { id });
        Ok(())
    }

    /// Removes the given elements along with connections attached to them.
    fn remove_elements(&mut self, ids: &[ElementId]) -> Result<(), ModelError> {
        let attached: Vec<ElementId> = self
            .elements
            .values()
            .filter(|e| {
                e.is_connection()
                    && ids.iter().any(|id| {
                        e.source.as_deref() == Some(id.as_str())
                            || e.target.as_deref() == Some(id.as_str())
                    })
            })
            .map(|e| e.id.clone())
            .collect();

        let mut removed = Vec::new();
        for id in ids.iter().chain(attached.iter()) {
            if self.elements.remove(id).is_some() {
                removed.push(id.clone());
            }
        }
        if !removed.is_empty() {
            self.emit(LocalCommand::Delete { ids: removed });
        }
        Ok(())
    }

    fn resize_shape(&mut self, id: &str, bounds: Bounds) -> Result<(), ModelError> {
        self.get_mut(id)?.bounds = Some(bounds);
        self.emit(LocalCommand::Resize { id: id.to_string() });
        Ok(())
    }

    fn update_properties(&mut self, id: &str, payload: Payload) -> Result<(), ModelError> {
        self.get_mut(id)?.payload = payload;
        self.emit(LocalCommand::UpdateProperties { id: id.to_string() });
        Ok(())
    }

    fn update_waypoints(&mut self, id: &str, waypoints: Vec<Point>) -> Result<(), ModelError> {
        self.get_mut(id)?.waypoints = waypoints;
        self.emit(LocalCommand::UpdateWaypoints { id: id.to_string() });
        Ok(())
    }

    fn reparent(&mut self, id: &str, parent: Option<ElementId>) -> Result<(), ModelError> {
        if let Some(p) = &parent {
            if !self.elements.contains_key(p) {
                return Err(ModelError::NotFound(p.clone()));
            }
        }
        self.get_mut(id)?.parent = parent;
        self.emit(LocalCommand::Reparent { id: id.to_string() });
        Ok(())
    }

    fn reconnect(
        &mut self,
        id: &str,
        source: ElementId,
        target: ElementId,
    ) -> Result<(), ModelError> {
        for endpoint in [&source, &target] {
            if !self.elements.contains_key(endpoint) {
                return Err(ModelError::MissingEndpoint {
                    connection: id.to_string(),
                    endpoint: endpoint.clone(),
                });
            }
        }
        let element = self.get_mut(id)?;
        if !element.is_connection() {
            return Err(ModelError::WrongKind {
                id: id.to_string(),
                expected: ElementKind::Connection,
            });
        }
        element.source = Some(source);
        element.target = Some(target);
        self.emit(LocalCommand::Reconnect { id: id.to_string() });
        Ok(())
    }

    fn take_command_events(&mut self) -> Vec<LocalCommand> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(id: &str) -> DiagramElement {
        DiagramElement::shape(id, Some(Bounds::new(0.0, 0.0, 100.0, 80.0)))
    }

    #[test]
    fn test_create_and_query() {
        let mut model = InMemoryDiagram::new();
        model.create_shape(shape("A")).unwrap();
        assert!(model.contains("A"));
        assert_eq!(model.len(), 1);
        assert_eq!(model.create_shape(shape("A")), Err(ModelError::Duplicate("A".into())));
    }

    #[test]
    fn test_connection_requires_endpoints() {
        let mut model = InMemoryDiagram::new();
        model.create_shape(shape("A")).unwrap();
        let err = model
            .create_connection(DiagramElement::connection("C", "A", "B", vec![]))
            .unwrap_err();
        assert!(matches!(err, ModelError::MissingEndpoint { ref endpoint, .. } if endpoint == "B"));

        model.create_shape(shape("B")).unwrap();
        model
            .create_connection(DiagramElement::connection("C", "A", "B", vec![]))
            .unwrap();
        assert!(model.contains("C"));
    }

    #[test]
    fn test_remove_cascades_attached_connections() {
        let mut model = InMemoryDiagram::new();
        model.create_shape(shape("A")).unwrap();
        model.create_shape(shape("B")).unwrap();
        model
            .create_connection(DiagramElement::connection("C", "A", "B", vec![]))
            .unwrap();

        model.remove_elements(&["A".to_string()]).unwrap();
        assert!(!model.contains("A"));
        assert!(!model.contains("C"));
        assert!(model.contains("B"));
    }

    #[test]
    fn test_would_cycle() {
        let mut model = InMemoryDiagram::new();
        model.create_shape(shape("Pool")).unwrap();
        model.create_shape(shape("Lane").with_parent("Pool")).unwrap();
        model.create_shape(shape("Task").with_parent("Lane")).unwrap();

        assert!(would_cycle(&model, "Pool", "Task"));
        assert!(!would_cycle(&model, "Task", "Pool"));
    }

    #[test]
    fn test_command_events() {
        let mut model = InMemoryDiagram::with_command_events();
        model.create_shape(shape("A")).unwrap();
        model
            .append("A", DiagramElement::shape("B", None), "Flow", None)
            .unwrap();
        let names: Vec<_> = model.take_command_events().iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec!["shape.create", "shape.append.begin", "shape.create", "connection.create", "shape.append"]
        );
        assert!(model.take_command_events().is_empty());

        let mut silent = InMemoryDiagram::new();
        silent.create_shape(shape("A")).unwrap();
        assert!(silent.take_command_events().is_empty());
    }

    #[test]
    fn test_model_error_display() {
        let err = ModelError::NotFound("X".into());
        assert!(err.to_string().contains("not found"));
    }
}
