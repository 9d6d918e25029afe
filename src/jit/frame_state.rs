//! Frame state recording
//!
//! Every point where compiled code may leave for the interpreter carries a
//! `FrameStateEntry`: for each logical frame (outermost first, one per
//! inlined call level) the bytecode offset and one `LiveValue` per
//! interpreter register, in register order. Reconstruction is a pure copy
//! with boxing of raw integers and floats; nothing is ever re-executed.

use crate::bytecode::{Constant, FunctionId};
use crate::runtime::Value;
use serde::Serialize;
use std::fmt;

/// Machine representation of a value in a compiled frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Representation {
    /// A boxed `Value`
    Tagged,
    /// Untagged 32-bit integer
    RawInt,
    /// Untagged double
    RawFloat,
}

/// One slot of a compiled frame
#[derive(Debug, Clone)]
pub enum Slot {
    Tagged(Value),
    Int(i32),
    Float(f64),
}

impl Slot {
    pub fn representation(&self) -> Representation {
        match self {
            Slot::Tagged(_) => Representation::Tagged,
            Slot::Int(_) => Representation::RawInt,
            Slot::Float(_) => Representation::RawFloat,
        }
    }

    /// Box into a tagged value. Raw integers become `Smi` with the same
    /// value and raw floats keep every bit of their payload.
    pub fn to_value(&self) -> Value {
        match self {
            Slot::Tagged(v) => v.clone(),
            Slot::Int(i) => Value::Smi(*i),
            Slot::Float(f) => Value::number(*f),
        }
    }
}

impl Default for Slot {
    fn default() -> Self {
        Slot::Tagged(Value::Undefined)
    }
}

/// Where a live value can be found when the frame state is used
#[derive(Debug, Clone, PartialEq)]
pub enum ValueLocation {
    /// A slot of the compiled frame
    Slot(u32),
    /// A value known at compile time
    Constant(Constant),
}

/// A live value: its representation and location
#[derive(Debug, Clone, PartialEq)]
pub struct LiveValue {
    pub representation: Representation,
    pub location: ValueLocation,
}

impl LiveValue {
    pub fn slot(slot: u32, representation: Representation) -> Self {
        Self {
            representation,
            location: ValueLocation::Slot(slot),
        }
    }

    pub fn undefined() -> Self {
        Self {
            representation: Representation::Tagged,
            location: ValueLocation::Constant(Constant::Undefined),
        }
    }
}

/// One interpreter frame's worth of state
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalFrame {
    pub function: FunctionId,
    pub bytecode_offset: u32,
    /// One entry per interpreter register
    pub values: Vec<LiveValue>,
}

/// Index of an entry in a unit's frame-state table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameStateId(pub u32);

impl fmt::Display for FrameStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fs{}", self.0)
    }
}

/// Description of all live state at one potential deopt point
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStateEntry {
    pub id: FrameStateId,
    /// Outermost frame first; more than one when calls were inlined
    pub frames: Vec<LogicalFrame>,
}

impl FrameStateEntry {
    pub fn innermost(&self) -> Option<&LogicalFrame> {
        self.frames.last()
    }

    /// Number of logical frames this entry expands to
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Builds the frame-state table while a unit is compiled
#[derive(Debug, Default)]
pub struct FrameStateRecorder {
    entries: Vec<FrameStateEntry>,
}

impl FrameStateRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the state at a point and return its id
    pub fn record(&mut self, frames: Vec<LogicalFrame>) -> FrameStateId {
        if let Some(last) = self.entries.last() {
            if last.frames == frames {
                return last.id;
            }
        }
        let id = FrameStateId(self.entries.len() as u32);
        self.entries.push(FrameStateEntry { id, frames });
        id
    }

    pub fn finish(self) -> FrameStateTable {
        FrameStateTable {
            entries: self.entries,
        }
    }
}

/// Immutable frame-state table owned by a compiled unit
#[derive(Debug, Clone, Default)]
pub struct FrameStateTable {
    entries: Vec<FrameStateEntry>,
}

impl FrameStateTable {
    pub fn get(&self, id: FrameStateId) -> Option<&FrameStateEntry> {
        self.entries.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameStateEntry> {
        self.entries.iter()
    }
}

/// A reconstructed interpreter frame
#[derive(Debug, Clone)]
pub struct MaterializedFrame {
    pub function: FunctionId,
    pub bytecode_offset: u32,
    pub registers: Vec<Value>,
}

/// Read one live value out of a compiled frame
pub fn read_live_value(value: &LiveValue, slots: &[Slot]) -> Value {
    match &value.location {
        ValueLocation::Constant(k) => k.to_value(),
        ValueLocation::Slot(index) => {
            let slot = slots.get(*index as usize).cloned().unwrap_or_default();
            debug_assert_eq!(
                slot.representation(),
                value.representation,
                "slot {} representation disagrees with frame state",
                index
            );
            slot.to_value()
        }
    }
}

/// Rebuild every logical frame an entry describes, outermost first
pub fn materialize(entry: &FrameStateEntry, slots: &[Slot]) -> Vec<MaterializedFrame> {
    entry
        .frames
        .iter()
        .map(|frame| MaterializedFrame {
            function: frame.function,
            bytecode_offset: frame.bytecode_offset,
            registers: frame
                .values
                .iter()
                .map(|value| read_live_value(value, slots))
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function: u32, offset: u32, values: Vec<LiveValue>) -> LogicalFrame {
        LogicalFrame {
            function: FunctionId(function),
            bytecode_offset: offset,
            values,
        }
    }

    #[test]
    fn test_boxing_preserves_values() {
        assert!(Slot::Int(-5).to_value().bit_identical(&Value::Smi(-5)));
        assert!(Slot::Float(0.1).to_value().bit_identical(&Value::Number(0.1)));
        assert!(Slot::Float(-0.0).to_value().bit_identical(&Value::Number(-0.0)));
        assert!(Slot::Float(3.0).to_value().bit_identical(&Value::Smi(3)));
    }

    #[test]
    fn test_recorder_deduplicates_consecutive_states() {
        let mut recorder = FrameStateRecorder::new();
        let a = recorder.record(vec![frame(0, 1, vec![LiveValue::undefined()])]);
        let b = recorder.record(vec![frame(0, 1, vec![LiveValue::undefined()])]);
        let c = recorder.record(vec![frame(0, 2, vec![LiveValue::undefined()])]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(recorder.finish().len(), 2);
    }

    #[test]
    fn test_materialize_inlined_frames() {
        let mut recorder = FrameStateRecorder::new();
        let id = recorder.record(vec![
            frame(
                0,
                4,
                vec![
                    LiveValue::slot(0, Representation::RawInt),
                    LiveValue {
                        representation: Representation::Tagged,
                        location: ValueLocation::Constant(Constant::Str("k".into())),
                    },
                ],
            ),
            frame(1, 2, vec![LiveValue::slot(2, Representation::RawFloat)]),
        ]);
        let table = recorder.finish();
        let entry = table.get(id).unwrap();
        let slots = vec![Slot::Int(7), Slot::default(), Slot::Float(1.5)];

        let frames = materialize(entry, &slots);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].function, FunctionId(0));
        assert_eq!(frames[0].bytecode_offset, 4);
        assert_eq!(frames[0].registers, vec![Value::Smi(7), Value::string("k")]);
        assert_eq!(frames[1].registers, vec![Value::Number(1.5)]);
        assert_eq!(entry.innermost().unwrap().function, FunctionId(1));
    }

    #[test]
    fn test_materialize_is_deterministic() {
        let mut recorder = FrameStateRecorder::new();
        let id = recorder.record(vec![frame(
            0,
            0,
            vec![LiveValue::slot(0, Representation::RawFloat)],
        )]);
        let table = recorder.finish();
        let slots = vec![Slot::Float(f64::NAN)];
        let first = materialize(table.get(id).unwrap(), &slots);
        let second = materialize(table.get(id).unwrap(), &slots);
        assert!(first[0].registers[0].bit_identical(&second[0].registers[0]));
    }
}
