//! `modnet overlay`: a module holding one replicated overlay list.
//!
//! Under an orchestrator, stdio lines are drawing commands:
//!
//! ```text
//! line X1 Y1 X2 Y2 [COLOUR]
//! ellipse X Y RX RY [COLOUR]
//! text X Y WORDS...
//! move LIST OBJECT DX DY
//! remove LIST OBJECT
//! clear
//! quit
//! ```

use anyhow::Context as _;
use modnet_fleet::control::resolve;
use modnet_fleet::{ControlTarget, ModuleLink};
use modnet_overlay::{
    Coord, CoordSystem, ObjectKey, Overlay, OverlayObject, OverlaySpec, Renderer, Shape, OVERLAY_PROTOCOL,
    OVERLAY_VERSION,
};
use modnet_types::ModnetConfig;
use modnet_wire::{ConnectionManager, Context, WireError};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_COLOUR: &str = "green";

pub struct OverlayArgs {
    pub master: bool,
    pub connect: Option<String>,
    pub listen: Option<String>,
    pub name: Option<String>,
    pub x_label: String,
    pub y_label: String,
}

/// One parsed drawing command.
#[derive(Debug, Clone, PartialEq)]
pub enum DemoCommand {
    Draw { colour: String, shape: Shape },
    Move { key: ObjectKey, dx: f64, dy: f64 },
    Remove(ObjectKey),
    Clear,
    Quit,
}

fn numbers<const N: usize>(words: &[&str]) -> Result<[f64; N], String> {
    if words.len() < N {
        return Err(format!("expected {N} numbers"));
    }
    let mut out = [0.0; N];
    for (slot, word) in out.iter_mut().zip(words) {
        *slot = word.parse().map_err(|_| format!("not a number: {word}"))?;
    }
    Ok(out)
}

fn key(words: &[&str]) -> Result<ObjectKey, String> {
    match words {
        [list, object, ..] => Ok(ObjectKey {
            list_id: list.parse().map_err(|_| format!("bad list id: {list}"))?,
            object_id: object.parse().map_err(|_| format!("bad object id: {object}"))?,
        }),
        _ => Err("expected LIST OBJECT".to_string()),
    }
}

fn colour(words: &[&str], at: usize) -> String {
    words.get(at).unwrap_or(&DEFAULT_COLOUR).to_string()
}

pub fn parse_command(line: &str) -> Result<DemoCommand, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((verb, rest)) = words.split_first() else {
        return Err("empty command".to_string());
    };
    match *verb {
        "line" => {
            let [x1, y1, x2, y2] = numbers(rest)?;
            Ok(DemoCommand::Draw {
                colour: colour(rest, 4),
                shape: Shape::Line {
                    from: Coord::world(x1, y1),
                    to: Coord::world(x2, y2),
                },
            })
        }
        "ellipse" => {
            let [x, y, rx, ry] = numbers(rest)?;
            Ok(DemoCommand::Draw {
                colour: colour(rest, 4),
                shape: Shape::Ellipse {
                    center: Coord::world(x, y),
                    radii: Coord::world(rx, ry),
                },
            })
        }
        "text" => {
            let [x, y] = numbers(rest)?;
            if rest.len() < 3 {
                return Err("text needs words".to_string());
            }
            Ok(DemoCommand::Draw {
                colour: DEFAULT_COLOUR.to_string(),
                shape: Shape::Text {
                    at: Coord::world(x, y),
                    text: rest[2..].join(" "),
                    font: "fixed".to_string(),
                },
            })
        }
        "move" => {
            let key = key(rest)?;
            let [dx, dy] = numbers(&rest[2..])?;
            Ok(DemoCommand::Move { key, dx, dy })
        }
        "remove" => Ok(DemoCommand::Remove(key(rest)?)),
        "clear" => Ok(DemoCommand::Clear),
        "quit" => Ok(DemoCommand::Quit),
        other => Err(format!("unknown command {other}")),
    }
}

fn apply(overlay: &Overlay, cx: &mut Context<'_>, command: DemoCommand) {
    match command {
        DemoCommand::Draw { colour, shape } => {
            let key = overlay.draw(cx, &colour, shape);
            info!(%key, "Queued object");
        }
        DemoCommand::Move { key, dx, dy } => overlay.move_object(cx, key, CoordSystem::World, dx, dy),
        DemoCommand::Remove(key) => overlay.remove_object(cx, key),
        DemoCommand::Clear => overlay.clear(cx),
        DemoCommand::Quit => cx.request_shutdown(),
    }
}

/// Logs what a plot window would paint.
struct LogRenderer;

impl Renderer for LogRenderer {
    fn draw(&mut self, object: &OverlayObject) {
        info!(key = %object.key, shape = object.shape.name(), colour = %object.colour, "draw");
    }

    fn redraw(&mut self, objects: &[OverlayObject]) {
        info!(objects = objects.len(), "redraw");
    }
}

fn socket_addr(value: &str) -> anyhow::Result<SocketAddr> {
    let (host, port) = value.rsplit_once(':').context("expected host:port")?;
    let port: u16 = port.parse().context("port is not a number")?;
    Ok(resolve(host.trim_matches(['[', ']']), port)?)
}

pub async fn cmd_overlay(mut config: ModnetConfig, args: OverlayArgs) -> anyhow::Result<i32> {
    if let Some(name) = args.name {
        config.module_name = name;
    }
    if let Some(listen) = args.listen {
        config.wire.listen_addr = listen;
    }
    config.validate()?;

    let spec = OverlaySpec::new(args.x_label, args.y_label);
    let mut manager = ConnectionManager::from_config(&config)?;
    let overlay = if args.master {
        let overlay = Overlay::master(spec.clone());
        manager.register_server_protocol(OVERLAY_PROTOCOL, OVERLAY_VERSION, 0, overlay.handler());
        overlay
    } else {
        let overlay = Overlay::slave();
        manager.register_client_protocol(OVERLAY_PROTOCOL, OVERLAY_VERSION, 1, overlay.handler());
        overlay
    };
    overlay.attach_renderer(spec, LogRenderer);

    let link = ControlTarget::from_env()?.map(|target| ModuleLink::install(&mut manager, target));
    let local = manager.serve(config.wire.listen_addr.parse()?).await?;
    info!(%local, role = overlay.role().name(), "Overlay module listening");
    if let Some(link) = &link {
        link.connect(&mut manager).await?;
    }
    if let Some(master) = args.connect {
        manager.connect(socket_addr(&master)?, OVERLAY_PROTOCOL).await?;
    }

    loop {
        match manager.poll(Duration::from_millis(100)).await {
            Ok(_) => {}
            Err(WireError::SupervisorLost(reason)) => {
                info!(reason = %reason, "Orchestrator went away, exiting");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(link) = &link {
            while let Some(line) = link.next_line() {
                match parse_command(&line) {
                    Ok(command) => apply(&overlay, &mut manager.context(), command),
                    Err(e) => warn!(line = %line, error = %e, "Ignoring command"),
                }
            }
        }
        if manager.shutdown_requested() {
            break;
        }
    }
    info!(objects = overlay.objects().len(), "Overlay module stopped");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_with_default_colour() {
        assert_eq!(
            parse_command("line 0 0 10 5").unwrap(),
            DemoCommand::Draw {
                colour: "green".into(),
                shape: Shape::Line {
                    from: Coord::world(0.0, 0.0),
                    to: Coord::world(10.0, 5.0),
                },
            }
        );
    }

    #[test]
    fn test_parse_text_and_keys() {
        match parse_command("text 1 2 hello there").unwrap() {
            DemoCommand::Draw {
                shape: Shape::Text { text, .. },
                ..
            } => assert_eq!(text, "hello there"),
            other => panic!("Expected text, got {other:?}"),
        }
        assert_eq!(
            parse_command("move 2 7 1.5 -1").unwrap(),
            DemoCommand::Move {
                key: ObjectKey {
                    list_id: 2,
                    object_id: 7
                },
                dx: 1.5,
                dy: -1.0,
            }
        );
        assert_eq!(
            parse_command("remove 1 3").unwrap(),
            DemoCommand::Remove(ObjectKey {
                list_id: 1,
                object_id: 3
            })
        );
    }

    #[test]
    fn test_parse_rejects_bad_commands() {
        for bad in ["", "circle 1 2", "line 1 2 3", "line a b c d", "move 1", "text 1 2"] {
            assert!(parse_command(bad).is_err(), "{bad}");
        }
    }
}
