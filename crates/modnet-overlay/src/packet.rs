//! The overlay wire record.
//!
//! Every instruction travels as one flat JSON record per frame. Fields that an
//! instruction does not use keep their defaults and are omitted on the wire.

use crate::error::{OverlayError, OverlayResult};
use crate::object::{Coord, CoordSystem, Instruction, ObjectKey, OverlayObject, OverlaySpec, Restriction, Shape};
use serde::{Deserialize, Serialize};

/// Object-type codes carried in [`InstructionPacket::kind`].
pub mod kind {
    pub const LINE: u32 = 1;
    pub const LINES: u32 = 2;
    pub const TEXT: u32 = 3;
    pub const ELLIPSE: u32 = 4;
    pub const ELLIPSES: u32 = 5;
    pub const FILLED_POLYGON: u32 = 6;
    pub const VECTOR: u32 = 7;
    pub const VECTORS: u32 = 8;
    pub const SEGMENTS: u32 = 9;
    pub const REMOVE_OBJECTS: u32 = 20;
    pub const REMOVE_OBJECT: u32 = 21;
    pub const MOVE_OBJECT: u32 = 22;
    pub const REQUEST_TOKEN: u32 = 30;
    pub const GRANT_TOKEN: u32 = 31;
    pub const ASSIGN_LIST_ID: u32 = 32;
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// One tagged point on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacketCoord {
    pub system: CoordSystem,
    pub x: f64,
    pub y: f64,
}

impl From<Coord> for PacketCoord {
    fn from(c: Coord) -> Self {
        Self {
            system: c.system,
            x: c.x,
            y: c.y,
        }
    }
}

impl From<PacketCoord> for Coord {
    fn from(c: PacketCoord) -> Self {
        Coord::new(c.system, c.x, c.y)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstructionPacket {
    pub kind: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub coords: Vec<PacketCoord>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub colour: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub x_label: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub y_label: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub restrictions: Vec<(String, f64)>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub font: String,
    /// Count for `RemoveObjects`, list id for `AssignListId`.
    #[serde(skip_serializing_if = "is_zero")]
    pub value: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub list_id: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub object_id: u32,
}

impl InstructionPacket {
    fn with_kind(kind: u32) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    fn with_key(mut self, key: ObjectKey) -> Self {
        self.list_id = key.list_id;
        self.object_id = key.object_id;
        self
    }

    fn key(&self) -> ObjectKey {
        ObjectKey {
            list_id: self.list_id,
            object_id: self.object_id,
        }
    }

    fn points(&self) -> Vec<Coord> {
        self.coords.iter().copied().map(Coord::from).collect()
    }

    fn coord(&self, index: usize) -> OverlayResult<Coord> {
        self.coords
            .get(index)
            .copied()
            .map(Coord::from)
            .ok_or_else(|| malformed(format!("kind {} needs at least {} coordinates", self.kind, index + 1)))
    }

    fn pairs(&self) -> OverlayResult<Vec<(Coord, Coord)>> {
        if self.coords.len() % 2 != 0 {
            return Err(malformed(format!(
                "kind {} needs an even number of coordinates, got {}",
                self.kind,
                self.coords.len()
            )));
        }
        Ok(self
            .coords
            .chunks_exact(2)
            .map(|p| (p[0].into(), p[1].into()))
            .collect())
    }
}

fn malformed(reason: String) -> OverlayError {
    OverlayError::MalformedPacket(reason)
}

fn flatten(pairs: &[(Coord, Coord)]) -> Vec<PacketCoord> {
    pairs.iter().flat_map(|(a, b)| [(*a).into(), (*b).into()]).collect()
}

fn shape_packet(shape: &Shape) -> InstructionPacket {
    let coords = |cs: &[Coord]| cs.iter().copied().map(PacketCoord::from).collect::<Vec<_>>();
    match shape {
        Shape::Line { from, to } => InstructionPacket {
            coords: coords(&[*from, *to]),
            ..InstructionPacket::with_kind(kind::LINE)
        },
        Shape::Lines { points } => InstructionPacket {
            coords: coords(points),
            ..InstructionPacket::with_kind(kind::LINES)
        },
        Shape::Text { at, text, font } => InstructionPacket {
            coords: coords(&[*at]),
            text: text.clone(),
            font: font.clone(),
            ..InstructionPacket::with_kind(kind::TEXT)
        },
        Shape::Ellipse { center, radii } => InstructionPacket {
            coords: coords(&[*center, *radii]),
            ..InstructionPacket::with_kind(kind::ELLIPSE)
        },
        // Radii ride as the last coordinate.
        Shape::Ellipses { centers, radii } => {
            let mut all = coords(centers);
            all.push((*radii).into());
            InstructionPacket {
                coords: all,
                ..InstructionPacket::with_kind(kind::ELLIPSES)
            }
        }
        Shape::FilledPolygon { points } => InstructionPacket {
            coords: coords(points),
            ..InstructionPacket::with_kind(kind::FILLED_POLYGON)
        },
        Shape::Vector { from, to } => InstructionPacket {
            coords: coords(&[*from, *to]),
            ..InstructionPacket::with_kind(kind::VECTOR)
        },
        Shape::Vectors { arrows } => InstructionPacket {
            coords: flatten(arrows),
            ..InstructionPacket::with_kind(kind::VECTORS)
        },
        Shape::Segments { segments } => InstructionPacket {
            coords: flatten(segments),
            ..InstructionPacket::with_kind(kind::SEGMENTS)
        },
    }
}

impl From<&Instruction> for InstructionPacket {
    fn from(instruction: &Instruction) -> Self {
        match instruction {
            Instruction::Draw(obj) => InstructionPacket {
                colour: obj.colour.clone(),
                ..shape_packet(&obj.shape)
            }
            .with_key(obj.key),
            Instruction::RemoveObjects { count } => InstructionPacket {
                value: *count,
                ..InstructionPacket::with_kind(kind::REMOVE_OBJECTS)
            },
            Instruction::RemoveObject { key } => {
                InstructionPacket::with_kind(kind::REMOVE_OBJECT).with_key(*key)
            }
            // The displacement travels as a single coordinate.
            Instruction::MoveObject { key, system, dx, dy } => InstructionPacket {
                coords: vec![PacketCoord {
                    system: *system,
                    x: *dx,
                    y: *dy,
                }],
                ..InstructionPacket::with_kind(kind::MOVE_OBJECT)
            }
            .with_key(*key),
            Instruction::RequestToken => InstructionPacket::with_kind(kind::REQUEST_TOKEN),
            Instruction::GrantToken => InstructionPacket::with_kind(kind::GRANT_TOKEN),
            Instruction::AssignListId { list_id, spec } => InstructionPacket {
                value: *list_id,
                x_label: spec.x_label.clone(),
                y_label: spec.y_label.clone(),
                restrictions: spec
                    .restrictions
                    .iter()
                    .map(|r| (r.name.clone(), r.value))
                    .collect(),
                ..InstructionPacket::with_kind(kind::ASSIGN_LIST_ID)
            },
        }
    }
}

impl TryFrom<InstructionPacket> for Instruction {
    type Error = OverlayError;

    fn try_from(p: InstructionPacket) -> OverlayResult<Self> {
        let shape = match p.kind {
            kind::LINE => Shape::Line {
                from: p.coord(0)?,
                to: p.coord(1)?,
            },
            kind::LINES => Shape::Lines { points: p.points() },
            kind::TEXT => Shape::Text {
                at: p.coord(0)?,
                text: p.text.clone(),
                font: p.font.clone(),
            },
            kind::ELLIPSE => Shape::Ellipse {
                center: p.coord(0)?,
                radii: p.coord(1)?,
            },
            kind::ELLIPSES => {
                let mut centers = p.points();
                let radii = centers
                    .pop()
                    .ok_or_else(|| malformed("Ellipses without radii".to_string()))?;
                Shape::Ellipses { centers, radii }
            }
            kind::FILLED_POLYGON => Shape::FilledPolygon { points: p.points() },
            kind::VECTOR => Shape::Vector {
                from: p.coord(0)?,
                to: p.coord(1)?,
            },
            kind::VECTORS => Shape::Vectors { arrows: p.pairs()? },
            kind::SEGMENTS => Shape::Segments { segments: p.pairs()? },

            kind::REMOVE_OBJECTS => return Ok(Instruction::RemoveObjects { count: p.value }),
            kind::REMOVE_OBJECT => return Ok(Instruction::RemoveObject { key: p.key() }),
            kind::MOVE_OBJECT => {
                let delta = p.coord(0)?;
                return Ok(Instruction::MoveObject {
                    key: p.key(),
                    system: delta.system,
                    dx: delta.x,
                    dy: delta.y,
                });
            }
            kind::REQUEST_TOKEN => return Ok(Instruction::RequestToken),
            kind::GRANT_TOKEN => return Ok(Instruction::GrantToken),
            kind::ASSIGN_LIST_ID => {
                return Ok(Instruction::AssignListId {
                    list_id: p.value,
                    spec: OverlaySpec {
                        x_label: p.x_label,
                        y_label: p.y_label,
                        restrictions: p
                            .restrictions
                            .into_iter()
                            .map(|(name, value)| Restriction { name, value })
                            .collect(),
                    },
                })
            }
            other => return Err(malformed(format!("unknown kind {other}"))),
        };
        Ok(Instruction::Draw(OverlayObject {
            key: p.key(),
            colour: p.colour,
            shape,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ObjectKey {
        ObjectKey {
            list_id: 2,
            object_id: 7,
        }
    }

    #[test]
    fn test_line_packet_fields() {
        let instruction = Instruction::Draw(OverlayObject {
            key: key(),
            colour: "red".into(),
            shape: Shape::Line {
                from: Coord::world(0.0, 0.0),
                to: Coord::world(1.0, 1.0),
            },
        });
        let packet = InstructionPacket::from(&instruction);
        assert_eq!(packet.kind, kind::LINE);
        assert_eq!(packet.coords.len(), 2);
        assert_eq!(packet.colour, "red");
        assert_eq!((packet.list_id, packet.object_id), (2, 7));

        let json = serde_json::to_string(&packet).unwrap();
        assert!(!json.contains("font"));
        let back: InstructionPacket = serde_json::from_str(&json).unwrap();
        assert_eq!(Instruction::try_from(back).unwrap(), instruction);
    }

    #[test]
    fn test_move_carries_delta_as_coord() {
        let packet = InstructionPacket::from(&Instruction::MoveObject {
            key: key(),
            system: CoordSystem::Pixel,
            dx: 3.5,
            dy: -1.0,
        });
        assert_eq!(packet.kind, kind::MOVE_OBJECT);
        assert_eq!(
            packet.coords,
            vec![PacketCoord {
                system: CoordSystem::Pixel,
                x: 3.5,
                y: -1.0
            }]
        );
    }

    #[test]
    fn test_assign_list_id_carries_spec() {
        let spec = OverlaySpec::new("RA", "Dec").restrict("frequency", 1420.0);
        let packet = InstructionPacket::from(&Instruction::AssignListId {
            list_id: 4,
            spec: spec.clone(),
        });
        assert_eq!(packet.value, 4);
        assert_eq!(packet.restrictions, vec![("frequency".to_string(), 1420.0)]);
        assert_eq!(
            Instruction::try_from(packet).unwrap(),
            Instruction::AssignListId { list_id: 4, spec }
        );
    }

    #[test]
    fn test_ellipses_keep_radii_last() {
        let shape = Shape::Ellipses {
            centers: vec![Coord::world(1.0, 1.0), Coord::world(2.0, 2.0)],
            radii: Coord::pixel(5.0, 3.0),
        };
        let packet = shape_packet(&shape);
        assert_eq!(packet.coords.last().unwrap().system, CoordSystem::Pixel);
        let Instruction::Draw(obj) = Instruction::try_from(packet).unwrap() else {
            panic!("Expected draw");
        };
        assert_eq!(obj.shape, shape);
    }

    #[test]
    fn test_malformed_packets_rejected() {
        let short_line = InstructionPacket {
            coords: vec![Coord::world(0.0, 0.0).into()],
            ..InstructionPacket::with_kind(kind::LINE)
        };
        assert!(matches!(
            Instruction::try_from(short_line),
            Err(OverlayError::MalformedPacket(_))
        ));

        let odd_segments = InstructionPacket {
            coords: vec![Coord::world(0.0, 0.0).into(); 3],
            ..InstructionPacket::with_kind(kind::SEGMENTS)
        };
        assert!(Instruction::try_from(odd_segments).is_err());
        assert!(Instruction::try_from(InstructionPacket::with_kind(99)).is_err());
        assert!(Instruction::try_from(InstructionPacket::with_kind(kind::ELLIPSES)).is_err());
    }

    #[test]
    fn test_token_packets_are_bare() {
        let json = serde_json::to_string(&InstructionPacket::from(&Instruction::GrantToken)).unwrap();
        assert_eq!(json, r#"{"kind":31}"#);
        let packet: InstructionPacket = serde_json::from_str(r#"{"kind":30}"#).unwrap();
        assert_eq!(Instruction::try_from(packet).unwrap(), Instruction::RequestToken);
    }
}
