//! Shaped objects and arrays
//!
//! Objects share hidden classes ("shapes"): an ordered list of property
//! names. Adding a property moves the object along a cached transition to a
//! child shape, so objects built the same way end up with the same shape id
//! and speculative code can load fields by fixed offset.

use super::value::Value;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

pub type ObjectRef = Rc<RefCell<JsObject>>;
pub type ArrayRef = Rc<RefCell<JsArray>>;

/// Hidden class identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeId(pub u32);

impl ShapeId {
    /// The shape of `{}`
    pub const EMPTY: ShapeId = ShapeId(0);
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Shape {
    keys: Vec<Arc<str>>,
    transitions: HashMap<Arc<str>, ShapeId>,
}

/// Registry of all shapes and their transitions
#[derive(Debug, Clone)]
pub struct ShapeTable {
    shapes: Vec<Shape>,
}

impl ShapeTable {
    pub fn new() -> Self {
        Self {
            shapes: vec![Shape {
                keys: Vec::new(),
                transitions: HashMap::default(),
            }],
        }
    }

    /// Shape reached from `from` by appending `key`
    pub fn transition(&mut self, from: ShapeId, key: &Arc<str>) -> ShapeId {
        if let Some(next) = self.shapes[from.0 as usize].transitions.get(key) {
            return *next;
        }
        let mut keys = self.shapes[from.0 as usize].keys.clone();
        keys.push(key.clone());
        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(Shape {
            keys,
            transitions: HashMap::default(),
        });
        self.shapes[from.0 as usize].transitions.insert(key.clone(), id);
        id
    }

    /// Shape for an object literal with the given keys in order
    pub fn shape_for_keys(&mut self, keys: &[Arc<str>]) -> ShapeId {
        keys.iter()
            .fold(ShapeId::EMPTY, |shape, key| self.transition(shape, key))
    }

    /// Slot offset of `key` in objects of `shape`
    pub fn lookup(&self, shape: ShapeId, key: &str) -> Option<usize> {
        self.shapes
            .get(shape.0 as usize)?
            .keys
            .iter()
            .position(|k| &**k == key)
    }

    pub fn keys(&self, shape: ShapeId) -> &[Arc<str>] {
        self.shapes
            .get(shape.0 as usize)
            .map(|s| s.keys.as_slice())
            .unwrap_or(&[])
    }

    pub fn shape_count(&self) -> usize {
        self.shapes.len()
    }
}

impl Default for ShapeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// An object: a shape plus one slot per property
#[derive(Debug, Clone)]
pub struct JsObject {
    shape: ShapeId,
    slots: Vec<Value>,
}

impl JsObject {
    pub fn new(shape: ShapeId, slots: Vec<Value>) -> Self {
        Self { shape, slots }
    }

    pub fn empty() -> Self {
        Self::new(ShapeId::EMPTY, Vec::new())
    }

    pub fn shape(&self) -> ShapeId {
        self.shape
    }

    pub fn slot(&self, offset: usize) -> Value {
        self.slots.get(offset).cloned().unwrap_or(Value::Undefined)
    }

    pub fn set_slot(&mut self, offset: usize, value: Value) {
        if offset < self.slots.len() {
            self.slots[offset] = value;
        }
    }

    /// Read a property through the shape table
    pub fn get(&self, shapes: &ShapeTable, key: &str) -> Value {
        shapes
            .lookup(self.shape, key)
            .map(|offset| self.slot(offset))
            .unwrap_or(Value::Undefined)
    }

    /// Write a property, transitioning the shape if the key is new
    pub fn set(&mut self, shapes: &mut ShapeTable, key: &Arc<str>, value: Value) {
        match shapes.lookup(self.shape, key) {
            Some(offset) => self.slots[offset] = value,
            None => {
                self.shape = shapes.transition(self.shape, key);
                self.slots.push(value);
            }
        }
    }

    pub fn into_ref(self) -> ObjectRef {
        Rc::new(RefCell::new(self))
    }
}

/// Element representation of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    PackedSmi,
    PackedDouble,
    Packed,
    Holey,
}

/// An array whose elements may contain holes
#[derive(Debug, Clone, Default)]
pub struct JsArray {
    elements: Vec<Option<Value>>,
    holes: usize,
}

impl JsArray {
    pub fn new(elements: Vec<Option<Value>>) -> Self {
        let holes = elements.iter().filter(|e| e.is_none()).count();
        Self { elements, holes }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self::new(values.into_iter().map(Some).collect())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element at `index`; `None` for holes and out-of-bounds reads
    pub fn get(&self, index: usize) -> Option<Value> {
        self.elements.get(index).cloned().flatten()
    }

    pub fn is_hole(&self, index: usize) -> bool {
        matches!(self.elements.get(index), Some(None))
    }

    pub fn set(&mut self, index: usize, value: Value) {
        if index >= self.elements.len() {
            self.holes += index - self.elements.len();
            self.elements.resize(index, None);
            self.elements.push(Some(value));
            return;
        }
        if self.elements[index].is_none() {
            self.holes -= 1;
        }
        self.elements[index] = Some(value);
    }

    pub fn element_kind(&self) -> ElementKind {
        if self.holes > 0 {
            return ElementKind::Holey;
        }
        let values = self.elements.iter().flatten();
        if values.clone().all(|v| matches!(v, Value::Smi(_))) {
            ElementKind::PackedSmi
        } else if values.clone().all(|v| v.is_number()) {
            ElementKind::PackedDouble
        } else {
            ElementKind::Packed
        }
    }

    pub fn into_ref(self) -> ArrayRef {
        Rc::new(RefCell::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn test_transitions_are_shared() {
        let mut shapes = ShapeTable::new();
        let a = shapes.shape_for_keys(&[key("x"), key("y")]);
        let b = shapes.shape_for_keys(&[key("x"), key("y")]);
        let c = shapes.shape_for_keys(&[key("y"), key("x")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(shapes.lookup(a, "y"), Some(1));
        assert_eq!(shapes.lookup(c, "y"), Some(0));
    }

    #[test]
    fn test_object_set_transitions_shape() {
        let mut shapes = ShapeTable::new();
        let mut obj = JsObject::empty();
        obj.set(&mut shapes, &key("x"), Value::Smi(42));
        let first = obj.shape();
        obj.set(&mut shapes, &key("x"), Value::Smi(43));
        assert_eq!(obj.shape(), first);
        obj.set(&mut shapes, &key("z"), Value::Smi(1));
        assert_ne!(obj.shape(), first);
        assert_eq!(obj.get(&shapes, "x"), Value::Smi(43));
        assert_eq!(obj.get(&shapes, "missing"), Value::Undefined);
    }

    #[test]
    fn test_array_element_kinds() {
        let smis = JsArray::from_values(vec![Value::Smi(1), Value::Smi(2)]);
        assert_eq!(smis.element_kind(), ElementKind::PackedSmi);
        let doubles = JsArray::from_values(vec![Value::Smi(1), Value::Number(2.5)]);
        assert_eq!(doubles.element_kind(), ElementKind::PackedDouble);
        let mixed = JsArray::from_values(vec![Value::Smi(1), Value::string("a")]);
        assert_eq!(mixed.element_kind(), ElementKind::Packed);
        let holey = JsArray::new(vec![Some(Value::Smi(1)), None]);
        assert_eq!(holey.element_kind(), ElementKind::Holey);
        assert!(holey.is_hole(1));
    }

    #[test]
    fn test_array_set_past_end_creates_holes() {
        let mut arr = JsArray::from_values(vec![Value::Smi(1)]);
        arr.set(3, Value::Smi(4));
        assert_eq!(arr.len(), 4);
        assert_eq!(arr.element_kind(), ElementKind::Holey);
        arr.set(1, Value::Smi(2));
        arr.set(2, Value::Smi(3));
        assert_eq!(arr.element_kind(), ElementKind::PackedSmi);
    }
}
