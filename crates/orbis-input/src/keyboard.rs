//! Priority-ordered keyboard event dispatch.
//!
//! [`KeyboardDispatcher`] is an owned object: the application creates one,
//! forwards winit key events into it, and calls
//! [`handle_events`](KeyboardDispatcher::handle_events) once per frame.
//! Callbacks receive a mutable context of the dispatcher's type parameter,
//! so they can drive application state without shared ownership.
//!
//! Listeners are grouped by `(kind, key)`. Within a group they run in
//! descending priority; equal priorities keep registration order.

use std::collections::HashMap;

use winit::event::{ElementState, KeyEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

/// Priority assigned when a listener does not ask for one.
pub const DEFAULT_PRIORITY: i32 = 1600;

/// When a listener fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyEventKind {
    /// Every frame while the key is held. With no key, on any key-down.
    KeyPress,
    /// When the key is released.
    KeyFree,
    /// Once, when the key goes down.
    CharKeyPress,
}

/// Identity of the object that registered a listener. A listener may be
/// registered once per `(kind, key)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Minimal description of a key event, independent of winit's event struct.
#[derive(Debug, Clone, Copy)]
pub struct RawKeyEvent {
    pub key: KeyCode,
    pub state: ElementState,
    pub repeat: bool,
}

type Callback<C> = Box<dyn FnMut(&mut C, KeyCode)>;

struct Registration<C> {
    priority: i32,
    listener: ListenerId,
    callback: Callback<C>,
}

/// Owned keyboard handler dispatching to prioritized callbacks.
pub struct KeyboardDispatcher<C> {
    listeners: HashMap<(KeyEventKind, Option<KeyCode>), Vec<Registration<C>>>,
    /// Held keys in press order.
    pressed: Vec<KeyCode>,
    active: bool,
}

impl<C> Default for KeyboardDispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> KeyboardDispatcher<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            pressed: Vec::new(),
            active: true,
        }
    }

    /// Register `callback` with [`DEFAULT_PRIORITY`].
    pub fn add_event<F>(
        &mut self,
        kind: KeyEventKind,
        key: Option<KeyCode>,
        listener: ListenerId,
        callback: F,
    ) -> bool
    where
        F: FnMut(&mut C, KeyCode) + 'static,
    {
        self.add_event_with_priority(kind, key, listener, DEFAULT_PRIORITY, callback)
    }

    /// Register `callback` for `(kind, key)`. Returns `false` and drops the
    /// callback if `listener` is already registered there.
    pub fn add_event_with_priority<F>(
        &mut self,
        kind: KeyEventKind,
        key: Option<KeyCode>,
        listener: ListenerId,
        priority: i32,
        callback: F,
    ) -> bool
    where
        F: FnMut(&mut C, KeyCode) + 'static,
    {
        let group = self.listeners.entry((kind, key)).or_default();
        if group.iter().any(|r| r.listener == listener) {
            tracing::debug!(?kind, ?key, ?listener, "Duplicate key listener ignored");
            return false;
        }
        // Insert after every registration of equal or higher priority.
        let at = group.partition_point(|r| r.priority >= priority);
        group.insert(
            at,
            Registration {
                priority,
                listener,
                callback: Box::new(callback),
            },
        );
        true
    }

    /// Unregister `listener` from `(kind, key)`. Returns whether it was found.
    pub fn remove_event(
        &mut self,
        kind: KeyEventKind,
        key: Option<KeyCode>,
        listener: ListenerId,
    ) -> bool {
        let Some(group) = self.listeners.get_mut(&(kind, key)) else {
            return false;
        };
        let before = group.len();
        group.retain(|r| r.listener != listener);
        let removed = group.len() != before;
        if group.is_empty() {
            self.listeners.remove(&(kind, key));
        }
        removed
    }

    /// Number of listeners registered for `(kind, key)`.
    pub fn listener_count(&self, kind: KeyEventKind, key: Option<KeyCode>) -> usize {
        self.listeners.get(&(kind, key)).map_or(0, Vec::len)
    }

    /// While inactive, key events are ignored and held keys do not fire.
    pub fn set_activity(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Forget every held key without firing release listeners, e.g. when the
    /// window loses focus.
    pub fn release_keys(&mut self) {
        self.pressed.clear();
    }

    #[must_use]
    pub fn is_key_pressed(&self, key: KeyCode) -> bool {
        self.pressed.contains(&key)
    }

    /// Forward a winit key event. Non-physical keys are ignored.
    pub fn process_event(&mut self, ctx: &mut C, event: &KeyEvent) {
        if let PhysicalKey::Code(key) = event.physical_key {
            self.process_raw(
                ctx,
                RawKeyEvent {
                    key,
                    state: event.state,
                    repeat: event.repeat,
                },
            );
        }
    }

    /// Forward a key event. Repeats are ignored; held keys are handled by
    /// [`handle_events`](Self::handle_events).
    pub fn process_raw(&mut self, ctx: &mut C, event: RawKeyEvent) {
        if !self.active || event.repeat {
            return;
        }
        match event.state {
            ElementState::Pressed => self.handle_key_down(ctx, event.key),
            ElementState::Released => self.handle_key_up(ctx, event.key),
        }
    }

    fn handle_key_down(&mut self, ctx: &mut C, key: KeyCode) {
        if !self.pressed.contains(&key) {
            self.pressed.push(key);
        }
        self.fire(ctx, KeyEventKind::KeyPress, None, key);
        self.fire(ctx, KeyEventKind::CharKeyPress, Some(key), key);
    }

    fn handle_key_up(&mut self, ctx: &mut C, key: KeyCode) {
        if let Some(pos) = self.pressed.iter().position(|k| *k == key) {
            self.pressed.remove(pos);
            self.fire(ctx, KeyEventKind::KeyFree, Some(key), key);
        }
    }

    /// Fire `KeyPress` listeners for every held key, in press order. Call
    /// once per frame.
    pub fn handle_events(&mut self, ctx: &mut C) {
        if !self.active {
            return;
        }
        let held = self.pressed.clone();
        for key in held {
            self.fire(ctx, KeyEventKind::KeyPress, Some(key), key);
        }
    }

    fn fire(&mut self, ctx: &mut C, kind: KeyEventKind, slot: Option<KeyCode>, key: KeyCode) {
        if let Some(group) = self.listeners.get_mut(&(kind, slot)) {
            for registration in group.iter_mut() {
                (registration.callback)(ctx, key);
            }
        }
    }
}
