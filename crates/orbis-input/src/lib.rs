//! Input handling: a priority-ordered keyboard dispatcher and mouse state.

pub mod keyboard;
pub mod mouse;

pub use keyboard::{DEFAULT_PRIORITY, KeyEventKind, KeyboardDispatcher, ListenerId, RawKeyEvent};
pub use mouse::MouseState;
