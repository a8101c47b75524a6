//! Overlay objects and the instructions that mutate a list of them.

use serde::{Deserialize, Serialize};

/// Coordinate system a point is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordSystem {
    /// Data coordinates of the underlying plot.
    World,
    /// Device pixels.
    Pixel,
    /// Fraction of the drawing area, 0.0 to 1.0.
    Normalized,
}

/// One typed point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub system: CoordSystem,
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(system: CoordSystem, x: f64, y: f64) -> Self {
        Self { system, x, y }
    }

    pub fn world(x: f64, y: f64) -> Self {
        Self::new(CoordSystem::World, x, y)
    }

    pub fn pixel(x: f64, y: f64) -> Self {
        Self::new(CoordSystem::Pixel, x, y)
    }

    fn translate(&mut self, system: CoordSystem, dx: f64, dy: f64) {
        if self.system == system {
            self.x += dx;
            self.y += dy;
        }
    }
}

/// Globally unique object identity: the originating list plus its local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub list_id: u32,
    pub object_id: u32,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.list_id, self.object_id)
    }
}

/// Geometry of a drawable object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Line { from: Coord, to: Coord },
    /// Connected polyline.
    Lines { points: Vec<Coord> },
    Text { at: Coord, text: String, font: String },
    Ellipse { center: Coord, radii: Coord },
    /// Several ellipses sharing one pair of radii.
    Ellipses { centers: Vec<Coord>, radii: Coord },
    FilledPolygon { points: Vec<Coord> },
    /// Arrow from `from` to `to`.
    Vector { from: Coord, to: Coord },
    Vectors { arrows: Vec<(Coord, Coord)> },
    /// Disconnected line segments.
    Segments { segments: Vec<(Coord, Coord)> },
}

impl Shape {
    pub fn coords_mut(&mut self) -> Vec<&mut Coord> {
        match self {
            Shape::Line { from, to } | Shape::Vector { from, to } => vec![from, to],
            Shape::Lines { points } | Shape::FilledPolygon { points } => points.iter_mut().collect(),
            Shape::Text { at, .. } => vec![at],
            Shape::Ellipse { center, .. } => vec![center],
            Shape::Ellipses { centers, .. } => centers.iter_mut().collect(),
            Shape::Vectors { arrows: pairs } | Shape::Segments { segments: pairs } => pairs
                .iter_mut()
                .flat_map(|(a, b)| [a, b])
                .collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Shape::Line { .. } => "Line",
            Shape::Lines { .. } => "Lines",
            Shape::Text { .. } => "Text",
            Shape::Ellipse { .. } => "Ellipse",
            Shape::Ellipses { .. } => "Ellipses",
            Shape::FilledPolygon { .. } => "FilledPolygon",
            Shape::Vector { .. } => "Vector",
            Shape::Vectors { .. } => "Vectors",
            Shape::Segments { .. } => "Segments",
        }
    }
}

/// A replicated annotation object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayObject {
    pub key: ObjectKey,
    pub colour: String,
    pub shape: Shape,
}

impl OverlayObject {
    /// Shift every point expressed in `system`; radii are left alone.
    pub fn translate(&mut self, system: CoordSystem, dx: f64, dy: f64) {
        for coord in self.shape.coords_mut() {
            coord.translate(system, dx, dy);
        }
    }
}

/// A named numeric restriction, e.g. `("frequency", 1420.0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restriction {
    pub name: String,
    pub value: f64,
}

/// Describes what a list's coordinates mean, so objects are only drawn on
/// render targets showing the same thing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlaySpec {
    pub x_label: String,
    pub y_label: String,
    pub restrictions: Vec<Restriction>,
}

impl OverlaySpec {
    pub fn new(x_label: impl Into<String>, y_label: impl Into<String>) -> Self {
        Self {
            x_label: x_label.into(),
            y_label: y_label.into(),
            restrictions: Vec::new(),
        }
    }

    pub fn restrict(mut self, name: impl Into<String>, value: f64) -> Self {
        self.restrictions.push(Restriction {
            name: name.into(),
            value,
        });
        self
    }

    /// Axis labels agree and every restriction of `self` is present in
    /// `list` with the same value.
    pub fn matches(&self, list: &OverlaySpec) -> bool {
        self.x_label == list.x_label
            && self.y_label == list.y_label
            && self.restrictions.iter().all(|r| {
                list.restrictions
                    .iter()
                    .any(|l| l.name == r.name && (l.value - r.value).abs() < 1e-9)
            })
    }
}

/// A local mutation requested by the application.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Draw { colour: String, shape: Shape },
    /// Drop the most recent `count` objects; 0 drops all.
    RemoveObjects { count: u32 },
    RemoveObject { key: ObjectKey },
    MoveObject {
        key: ObjectKey,
        system: CoordSystem,
        dx: f64,
        dy: f64,
    },
}

/// Everything that travels between list instances.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Draw(OverlayObject),
    RemoveObjects { count: u32 },
    RemoveObject { key: ObjectKey },
    MoveObject {
        key: ObjectKey,
        system: CoordSystem,
        dx: f64,
        dy: f64,
    },
    RequestToken,
    GrantToken,
    /// Master to a newly attached slave: its list id and the master's spec.
    AssignListId { list_id: u32, spec: OverlaySpec },
}

impl Instruction {
    pub fn is_token(&self) -> bool {
        matches!(self, Instruction::RequestToken | Instruction::GrantToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_only_matching_system() {
        let mut obj = OverlayObject {
            key: ObjectKey {
                list_id: 1,
                object_id: 1,
            },
            colour: "red".into(),
            shape: Shape::Line {
                from: Coord::world(0.0, 0.0),
                to: Coord::pixel(10.0, 10.0),
            },
        };
        obj.translate(CoordSystem::World, 2.0, 3.0);
        assert_eq!(
            obj.shape,
            Shape::Line {
                from: Coord::world(2.0, 3.0),
                to: Coord::pixel(10.0, 10.0),
            }
        );
    }

    #[test]
    fn test_translate_pairs() {
        let mut shape = Shape::Segments {
            segments: vec![(Coord::world(0.0, 0.0), Coord::world(1.0, 1.0))],
        };
        for c in shape.coords_mut() {
            c.translate(CoordSystem::World, 1.0, 0.0);
        }
        assert_eq!(
            shape,
            Shape::Segments {
                segments: vec![(Coord::world(1.0, 0.0), Coord::world(2.0, 1.0))],
            }
        );
    }

    #[test]
    fn test_spec_matching() {
        let list = OverlaySpec::new("RA", "Dec").restrict("frequency", 1420.0);
        assert!(OverlaySpec::new("RA", "Dec").matches(&list));
        assert!(OverlaySpec::new("RA", "Dec")
            .restrict("frequency", 1420.0)
            .matches(&list));
        assert!(!OverlaySpec::new("RA", "Dec")
            .restrict("frequency", 1421.0)
            .matches(&list));
        assert!(!OverlaySpec::new("RA", "Velocity").matches(&list));
        assert!(!OverlaySpec::new("RA", "Dec").restrict("stokes", 1.0).matches(&list));
    }
}
