//! Library-neutral drag-and-drop primitives for the pipeline board.
//!
//! A pointer drag produces [`DragEvent`]s. Each carries the drop target
//! under the pointer, found with [`closest_center`] among the registered
//! droppables: stage columns (empty ones included) and deal cards.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crm::models::Stage;

/// Something a deal can be dropped on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DropTarget {
    Column(Stage),
    Card(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn distance_sq(&self, other: Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// A registered drop target and its on-screen rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Droppable {
    pub target: DropTarget,
    pub rect: Rect,
}

impl Droppable {
    pub fn new(target: DropTarget, rect: Rect) -> Self {
        Self { target, rect }
    }
}

/// The droppable whose centre is nearest to `pointer`. On equal distance
/// the earlier registration wins. Non-finite distances never match.
pub fn closest_center(pointer: Point, droppables: &[Droppable]) -> Option<DropTarget> {
    let mut best: Option<(f64, DropTarget)> = None;
    for droppable in droppables {
        let distance = pointer.distance_sq(droppable.rect.center());
        if !distance.is_finite() {
            continue;
        }
        match best {
            Some((current, _)) if distance >= current => {}
            _ => best = Some((distance, droppable.target)),
        }
    }
    best.map(|(_, target)| target)
}

/// Events a drag primitive reports to the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragEvent {
    Start(Uuid),
    Over(Option<DropTarget>),
    End(Option<DropTarget>),
    Cancel,
}
