//! Window input tracking for the viewer.
//!
//! [`Input`] turns raw winit events into per-frame queries: which bound keys
//! went down this frame, and where a left-button drag started, moved and
//! ended in normalized window coordinates (`(0, 0)` top-left, `(1, 1)`
//! bottom-right).

use std::collections::HashSet;

use glam::Vec2;
use winit::event::{ElementState, MouseButton, WindowEvent};
use winit::keyboard::{KeyCode as WinitKeyCode, PhysicalKey};

/// Keys the viewer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// Toggle Interactive / Rain.
    Space,
    M,
    /// Reset fluid.
    R,
    /// Toggle fluid, particles, capture and flow drawing.
    F,
    P,
    C,
    V,
    /// Toggle horizontal and vertical flip.
    H,
    J,
    /// Save config.
    S,
    Escape,
}

impl Key {
    fn from_winit(key: WinitKeyCode) -> Option<Self> {
        Some(match key {
            WinitKeyCode::Space => Key::Space,
            WinitKeyCode::KeyM => Key::M,
            WinitKeyCode::KeyR => Key::R,
            WinitKeyCode::KeyF => Key::F,
            WinitKeyCode::KeyP => Key::P,
            WinitKeyCode::KeyC => Key::C,
            WinitKeyCode::KeyV => Key::V,
            WinitKeyCode::KeyH => Key::H,
            WinitKeyCode::KeyJ => Key::J,
            WinitKeyCode::KeyS => Key::S,
            WinitKeyCode::Escape => Key::Escape,
            _ => return None,
        })
    }
}

/// Progress of a left-button drag this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Drag {
    Started(Vec2),
    Moved(Vec2),
    Ended(Vec2),
}

/// Key and pointer state for one frame.
#[derive(Debug, Default)]
pub struct Input {
    keys_held: HashSet<Key>,
    keys_pressed: HashSet<Key>,
    dragging: bool,
    drags: Vec<Drag>,
    cursor: Vec2,
    window_size: (u32, u32),
}

impl Input {
    pub fn new() -> Self {
        Self {
            window_size: (1, 1),
            ..Default::default()
        }
    }

    /// Check if a key was pressed this frame (just went down).
    pub fn key_pressed(&self, key: Key) -> bool {
        self.keys_pressed.contains(&key)
    }

    pub fn key_held(&self, key: Key) -> bool {
        self.keys_held.contains(&key)
    }

    /// Cursor position in normalized window coordinates.
    pub fn cursor(&self) -> Vec2 {
        self.cursor
    }

    /// Drag events since the last [`begin_frame`](Self::begin_frame), in order.
    pub fn drags(&self) -> &[Drag] {
        &self.drags
    }

    /// Clear per-frame state. Call after the frame's input has been consumed.
    pub fn begin_frame(&mut self) {
        self.keys_pressed.clear();
        self.drags.clear();
    }

    pub fn set_window_size(&mut self, width: u32, height: u32) {
        self.window_size = (width.max(1), height.max(1));
    }

    /// Process a winit window event.
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(code) = event.physical_key else {
                    return;
                };
                let Some(key) = Key::from_winit(code) else {
                    return;
                };
                match event.state {
                    ElementState::Pressed => {
                        // Ignore key repeat
                        if self.keys_held.insert(key) {
                            self.keys_pressed.insert(key);
                        }
                    }
                    ElementState::Released => {
                        self.keys_held.remove(&key);
                    }
                }
            }

            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => match state {
                ElementState::Pressed => {
                    self.dragging = true;
                    self.drags.push(Drag::Started(self.cursor));
                }
                ElementState::Released => {
                    if self.dragging {
                        self.dragging = false;
                        self.drags.push(Drag::Ended(self.cursor));
                    }
                }
            },

            WindowEvent::CursorMoved { position, .. } => {
                let (w, h) = self.window_size;
                self.cursor = Vec2::new(position.x as f32 / w as f32, position.y as f32 / h as f32);
                if self.dragging {
                    self.drags.push(Drag::Moved(self.cursor));
                }
            }

            _ => {}
        }
    }
}
