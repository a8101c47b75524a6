//! Render targets attached to an overlay list.

use crate::list::RenderEvent;
use crate::object::{OverlayObject, OverlaySpec};

/// Something that can display overlay objects, such as a plot window.
pub trait Renderer {
    /// Draw one newly added object.
    fn draw(&mut self, object: &OverlayObject);

    /// Repaint from scratch after objects were removed or moved.
    fn redraw(&mut self, objects: &[OverlayObject]);
}

struct Target {
    spec: OverlaySpec,
    renderer: Box<dyn Renderer>,
}

/// Renderers keyed by the spec of what they display.
#[derive(Default)]
pub struct RenderTargets {
    targets: Vec<Target>,
}

impl RenderTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, spec: OverlaySpec, renderer: impl Renderer + 'static) {
        self.targets.push(Target {
            spec,
            renderer: Box::new(renderer),
        });
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Replay list changes on every target whose spec matches the list's.
    pub fn render(&mut self, list_spec: &OverlaySpec, objects: &[OverlayObject], events: Vec<RenderEvent>) {
        if events.is_empty() {
            return;
        }
        // A redraw already shows every object, so earlier draws are moot.
        let redraw = events.iter().any(|e| matches!(e, RenderEvent::Redraw));
        for target in self.targets.iter_mut().filter(|t| t.spec.matches(list_spec)) {
            if redraw {
                target.renderer.redraw(objects);
                continue;
            }
            for event in &events {
                if let RenderEvent::Draw(obj) = event {
                    target.renderer.draw(obj);
                }
            }
        }
    }
}
