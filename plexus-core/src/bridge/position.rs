//! Placement for shapes created without usable geometry.
//!
//! Tiers are tried in a fixed order:
//! 1. last captured drop point (consumed on use)
//! 2. explicit position carried by the command
//! 3. next to the designated default target
//! 4. last known pointer position
//! 5. fixed fallback

use crate::model::DiagramModel;
use crate::{ElementId, Point};

/// Horizontal gap between the default target and a shape placed beside it.
pub const DEFAULT_TARGET_GAP: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSource {
    DropPoint,
    Explicit,
    DefaultTarget,
    Pointer,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct PositionResolver {
    drop_point: Option<Point>,
    default_target: Option<ElementId>,
    pointer: Option<Point>,
    fallback: Point,
}

impl PositionResolver {
    pub fn new(fallback: Point) -> Self {
        Self { drop_point: None, default_target: None, pointer: None, fallback }
    }

    pub fn capture_drop_point(&mut self, point: Point) {
        self.drop_point = Some(point);
    }

    pub fn set_default_target(&mut self, target: Option<ElementId>) {
        self.default_target = target;
    }

    pub fn note_pointer(&mut self, point: Point) {
        self.pointer = Some(point);
    }

    pub fn resolve(
        &mut self,
        explicit: Option<Point>,
        model: &dyn DiagramModel,
    ) -> (Point, PositionSource) {
        if let Some(point) = self.drop_point.take() {
            return (point, PositionSource::DropPoint);
        }
        if let Some(point) = explicit.filter(|p| p.x.is_finite() && p.y.is_finite()) {
            return (point, PositionSource::Explicit);
        }
        let beside_target = self
            .default_target
            .as_deref()
            .and_then(|id| model.element(id))
            .and_then(|target| target.bounds)
            .filter(|b| !b.is_placeholder())
            .map(|b| Point::new(b.x + b.width + DEFAULT_TARGET_GAP, b.y));
        if let Some(point) = beside_target {
            return (point, PositionSource::DefaultTarget);
        }
        if let Some(point) = self.pointer {
            return (point, PositionSource::Pointer);
        }
        (self.fallback, PositionSource::Fallback)
    }
}
