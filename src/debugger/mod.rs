//! Debugger hooks
//!
//! A listener can ask for a break at the next safe point (function entry or
//! loop back-edge) in whatever tier is running. Compiled frames report their
//! locals through the frame state of the safe point, so a break inside an
//! OSR'd loop inspects the loop without leaving compiled code.
//!
//! # Example
//! ```text
//! %ScheduleBreak()        // request
//! ... next back-edge ...  // listener.on_break(&event) -> DebugAction::Continue
//! ```

use crate::bytecode::FunctionId;
use crate::jit::Tier;
use crate::runtime::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::debug;

/// Break events kept for inspection
const MAX_HISTORY_SIZE: usize = 64;

/// What the debugger saw at a break
#[derive(Debug, Clone)]
pub struct BreakEvent {
    pub function: FunctionId,
    pub name: String,
    /// Bytecode offset of the safe point
    pub pc: u32,
    /// Tier of the frame that hit the break
    pub tier: Tier,
    /// Whether the frame runs OSR code
    pub osr: bool,
    /// Register values, reconstructed for compiled frames
    pub locals: Vec<Value>,
}

/// How execution continues after a break
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugAction {
    Continue,
    /// Leave compiled code at the break point
    Deoptimize,
}

/// Receives break events
pub trait DebugListener {
    fn on_break(&mut self, event: &BreakEvent) -> DebugAction;
}

impl<F> DebugListener for F
where
    F: FnMut(&BreakEvent) -> DebugAction,
{
    fn on_break(&mut self, event: &BreakEvent) -> DebugAction {
        self(event)
    }
}

/// Listener that keeps every event and always answers with the same action
#[derive(Debug, Clone)]
pub struct RecordingListener {
    events: Rc<RefCell<Vec<BreakEvent>>>,
    action: DebugAction,
}

impl RecordingListener {
    pub fn new(action: DebugAction) -> Self {
        Self {
            events: Rc::new(RefCell::new(Vec::new())),
            action,
        }
    }

    /// Shared view of the recorded events
    pub fn events(&self) -> Rc<RefCell<Vec<BreakEvent>>> {
        Rc::clone(&self.events)
    }
}

impl DebugListener for RecordingListener {
    fn on_break(&mut self, event: &BreakEvent) -> DebugAction {
        self.events.borrow_mut().push(event.clone());
        self.action
    }
}

/// Break scheduling and delivery
#[derive(Default)]
pub struct Debugger {
    listener: Option<Box<dyn DebugListener>>,
    pending: bool,
    history: VecDeque<BreakEvent>,
    breaks_delivered: u64,
}

impl Debugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listener(&mut self, listener: Box<dyn DebugListener>) {
        self.listener = Some(listener);
    }

    pub fn clear_listener(&mut self) {
        self.listener = None;
        self.pending = false;
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Request a break at the next safe point
    pub fn schedule(&mut self) {
        self.pending = self.listener.is_some();
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Consume a scheduled break
    pub fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    /// Hand an event to the listener
    pub fn deliver(&mut self, event: BreakEvent) -> DebugAction {
        let Some(listener) = self.listener.as_mut() else {
            return DebugAction::Continue;
        };
        let action = listener.on_break(&event);
        debug!(function = %event.name, pc = event.pc, tier = ?event.tier, osr = event.osr, ?action, "debug break");
        self.breaks_delivered += 1;
        if self.history.len() == MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(event);
        action
    }

    pub fn breaks_delivered(&self) -> u64 {
        self.breaks_delivered
    }

    pub fn history(&self) -> impl Iterator<Item = &BreakEvent> {
        self.history.iter()
    }
}

impl std::fmt::Debug for Debugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debugger")
            .field("listener", &self.listener.is_some())
            .field("pending", &self.pending)
            .field("breaks_delivered", &self.breaks_delivered)
            .finish()
    }
}
