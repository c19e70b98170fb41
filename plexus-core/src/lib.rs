//! # plexus-core: diagram model and client-side synchronization
//!
//! Everything a single editing client needs to keep its diagram model and
//! the replicated shared document in lockstep:
//!
//! ```text
//!  local commands                              remote updates
//!        │                                           │
//!        ▼                                           ▼
//! ┌──────────────┐   tagged txns    ┌──────────────────────┐
//! │ DiagramModel │ ◄──────────────► │  SharedDocument (yrs) │
//! └──────┬───────┘                  └──────────┬───────────┘
//!        │            ┌────────────┐           │
//!        └──────────► │ SyncBridge │ ◄─────────┘
//!                     └─────┬──────┘
//!                           ▼
//!                   ┌────────────────┐
//!                   │ ConflictEngine │
//!                   └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: external diagram model contract and an in-memory model
//! - [`document`]: shared document adapter over a yrs `Doc`
//! - [`bridge`]: sync bridge: local commands ⇄ document transactions
//! - [`conflict`]: conflict classification and resolution strategies
//! - [`schedule`]: cancellable deferred tasks and cooldown windows

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod bridge;
pub mod conflict;
pub mod document;
pub mod model;
pub mod schedule;

pub use bridge::{BridgeConfig, BridgeEvent, BridgeStats, LocalCommand, SyncBridge};
pub use conflict::{
    Conflict, ConflictConfig, ConflictEngine, ConflictKind, Resolution, Severity,
    SuggestedAction,
};
pub use document::{DocOrigin, DocumentChange, EntryChange, EntryChangeKind, SharedDocument};
pub use model::{DiagramModel, InMemoryDiagram, ModelError, PermissiveRules, RuleChecker};

/// Element identifiers are opaque strings chosen by the editor.
pub type ElementId = String;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Geometry that an editor emits before the shape has been placed.
    pub fn is_placeholder(&self) -> bool {
        !(self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite())
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn moved_to(&self, origin: Point) -> Self {
        Self { x: origin.x, y: origin.y, ..*self }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    Shape,
    Connection,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Shape => "shape",
            ElementKind::Connection => "connection",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "shape" => Some(ElementKind::Shape),
            "connection" => Some(ElementKind::Connection),
            _ => None,
        }
    }
}

/// Value stored in the payload extension bag.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Number(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

/// Typed element payload: a fixed `name` plus one string→scalar bag.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Payload {
    pub name: String,
    pub extensions: BTreeMap<String, Scalar>,
}

impl Payload {
    /// Field names whose values differ between two payloads.
    ///
    /// The fixed name field is reported as `"name"`; extension entries
    /// by their key.
    pub fn differing_fields(&self, other: &Payload) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        if self.name != other.name {
            fields.insert("name".to_string());
        }
        for key in self.extensions.keys().chain(other.extensions.keys()) {
            if self.extensions.get(key) != other.extensions.get(key) {
                fields.insert(key.clone());
            }
        }
        fields
    }
}

/// Coarse field groups an edit can touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldGroup {
    Geometry,
    Payload,
    Endpoints,
    Waypoints,
    Parent,
}

impl FieldGroup {
    pub const ALL: [FieldGroup; 5] = [
        FieldGroup::Geometry,
        FieldGroup::Payload,
        FieldGroup::Endpoints,
        FieldGroup::Waypoints,
        FieldGroup::Parent,
    ];
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DiagramElement {
    pub id: ElementId,
    pub kind: ElementKind,
    pub bounds: Option<Bounds>,
    pub parent: Option<ElementId>,
    pub payload: Payload,
    pub source: Option<ElementId>,
    pub target: Option<ElementId>,
    pub waypoints: Vec<Point>,
}

impl DiagramElement {
    pub fn shape(id: impl Into<ElementId>, bounds: Option<Bounds>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::Shape,
            bounds,
            parent: None,
            payload: Payload::default(),
            source: None,
            target: None,
            waypoints: Vec::new(),
        }
    }

    pub fn connection(
        id: impl Into<ElementId>,
        source: impl Into<ElementId>,
        target: impl Into<ElementId>,
        waypoints: Vec<Point>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::Connection,
            bounds: None,
            parent: None,
            payload: Payload::default(),
            source: Some(source.into()),
            target: Some(target.into()),
            waypoints,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.payload.name = name.into();
        self
    }

    pub fn with_parent(mut self, parent: impl Into<ElementId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.payload.extensions.insert(key.into(), value.into());
        self
    }

    pub fn is_connection(&self) -> bool {
        self.kind == ElementKind::Connection
    }

    /// Whether this element points at `id` as endpoint or parent.
    pub fn references(&self, id: &str) -> bool {
        self.source.as_deref() == Some(id)
            || self.target.as_deref() == Some(id)
            || self.parent.as_deref() == Some(id)
    }

    /// Field groups whose values differ between `self` and `other`.
    pub fn differing_groups(&self, other: &DiagramElement) -> BTreeSet<FieldGroup> {
        let mut groups = BTreeSet::new();
        if self.bounds != other.bounds {
            groups.insert(FieldGroup::Geometry);
        }
        if self.payload != other.payload {
            groups.insert(FieldGroup::Payload);
        }
        if self.source != other.source || self.target != other.target {
            groups.insert(FieldGroup::Endpoints);
        }
        if self.waypoints != other.waypoints {
            groups.insert(FieldGroup::Waypoints);
        }
        if self.parent != other.parent {
            groups.insert(FieldGroup::Parent);
        }
        groups
    }
}
