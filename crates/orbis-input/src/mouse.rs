//! Frame-coherent mouse state for camera dragging, zooming and picking.

use glam::Vec2;
use winit::event::{ElementState, MouseButton, MouseScrollDelta};

/// Per-button press/release tracking for a single frame.
#[derive(Debug, Clone, Copy, Default)]
struct ButtonFrame {
    pressed: bool,
    just_pressed: bool,
    just_released: bool,
}

fn button_index(button: MouseButton) -> Option<usize> {
    match button {
        MouseButton::Left => Some(0),
        MouseButton::Right => Some(1),
        MouseButton::Middle => Some(2),
        _ => None,
    }
}

/// Mouse position, per-frame motion, buttons and wheel.
///
/// Forward winit events through the `on_*` methods, read the state, and call
/// [`clear_transients`](Self::clear_transients) at the end of each frame.
#[derive(Debug, Clone, Default)]
pub struct MouseState {
    position: Vec2,
    delta: Vec2,
    buttons: [ButtonFrame; 3],
    scroll: f32,
    cursor_in_window: bool,
}

impl MouseState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_cursor_moved(&mut self, x: f64, y: f64) {
        let new_pos = Vec2::new(x as f32, y as f32);
        if self.cursor_in_window {
            self.delta += new_pos - self.position;
        }
        self.position = new_pos;
        self.cursor_in_window = true;
    }

    pub fn on_button(&mut self, button: MouseButton, state: ElementState) {
        let Some(idx) = button_index(button) else {
            return;
        };
        match state {
            ElementState::Pressed => {
                self.buttons[idx].pressed = true;
                self.buttons[idx].just_pressed = true;
            }
            ElementState::Released => {
                self.buttons[idx].pressed = false;
                self.buttons[idx].just_released = true;
            }
        }
    }

    pub fn on_scroll(&mut self, delta: MouseScrollDelta) {
        match delta {
            MouseScrollDelta::LineDelta(_x, y) => self.scroll += y,
            // ~40 pixels per line
            MouseScrollDelta::PixelDelta(pos) => self.scroll += (pos.y / 40.0) as f32,
        }
    }

    pub fn on_cursor_left(&mut self) {
        self.cursor_in_window = false;
    }

    /// Cursor position in physical pixels, origin top-left.
    #[must_use]
    pub fn position(&self) -> Vec2 {
        self.position
    }

    /// Motion accumulated since the last [`clear_transients`](Self::clear_transients).
    #[must_use]
    pub fn delta(&self) -> Vec2 {
        self.delta
    }

    /// Wheel lines accumulated this frame; positive scrolls away from the user.
    #[must_use]
    pub fn scroll(&self) -> f32 {
        self.scroll
    }

    #[must_use]
    pub fn cursor_in_window(&self) -> bool {
        self.cursor_in_window
    }

    #[must_use]
    pub fn is_pressed(&self, button: MouseButton) -> bool {
        button_index(button).is_some_and(|i| self.buttons[i].pressed)
    }

    #[must_use]
    pub fn just_pressed(&self, button: MouseButton) -> bool {
        button_index(button).is_some_and(|i| self.buttons[i].just_pressed)
    }

    #[must_use]
    pub fn just_released(&self, button: MouseButton) -> bool {
        button_index(button).is_some_and(|i| self.buttons[i].just_released)
    }

    /// Reset per-frame delta, scroll and button edges.
    pub fn clear_transients(&mut self) {
        self.delta = Vec2::ZERO;
        self.scroll = 0.0;
        for b in &mut self.buttons {
            b.just_pressed = false;
            b.just_released = false;
        }
    }
}
