//! Type and shape feedback
//!
//! Every feedback-collecting instruction owns one `FeedbackEntry`, keyed by
//! (function, bytecode offset). Entries only ever widen: type sets grow by
//! union, inline-cache state moves Uninitialized → Monomorphic → Polymorphic
//! → Megamorphic and never back. The compiler works from an owned
//! `FeedbackSnapshot` so it can run on a worker thread.

use crate::bytecode::FunctionId;
use crate::runtime::ops::element_index;
use crate::runtime::{ElementKind, ShapeId, ShapeTable, Value};
use bitflags::bitflags;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use tracing::trace;

bitflags! {
    /// Observed value categories
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeSet: u16 {
        const SMALL_INT = 1 << 0;
        const FLOAT = 1 << 1;
        const STRING = 1 << 2;
        const BOOLEAN = 1 << 3;
        const UNDEFINED = 1 << 4;
        const NULL = 1 << 5;
        const OBJECT = 1 << 6;
        const ARRAY = 1 << 7;
        const FUNCTION = 1 << 8;

        const NUMBER = Self::SMALL_INT.bits() | Self::FLOAT.bits();
    }
}

impl TypeSet {
    /// Category of a single value
    pub fn of(value: &Value) -> TypeSet {
        match value {
            Value::Smi(_) => TypeSet::SMALL_INT,
            Value::Number(_) => TypeSet::FLOAT,
            Value::Str(_) => TypeSet::STRING,
            Value::Bool(_) => TypeSet::BOOLEAN,
            Value::Undefined => TypeSet::UNDEFINED,
            Value::Null => TypeSet::NULL,
            Value::Object(_) => TypeSet::OBJECT,
            Value::Array(_) => TypeSet::ARRAY,
            Value::Function(_) => TypeSet::FUNCTION,
        }
    }

    /// Only small integers were seen
    pub fn is_small_int(self) -> bool {
        self == TypeSet::SMALL_INT
    }

    /// Only numbers were seen
    pub fn is_number(self) -> bool {
        !self.is_empty() && TypeSet::NUMBER.contains(self)
    }
}

impl Serialize for TypeSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:?}", self))
    }
}

bitflags! {
    /// Observed element accesses
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ElementKinds: u8 {
        const PACKED_SMI = 1 << 0;
        const PACKED_DOUBLE = 1 << 1;
        const PACKED = 1 << 2;
        const HOLEY = 1 << 3;
        const OUT_OF_BOUNDS = 1 << 4;
        const NON_ARRAY = 1 << 5;
    }
}

impl From<ElementKind> for ElementKinds {
    fn from(kind: ElementKind) -> Self {
        match kind {
            ElementKind::PackedSmi => ElementKinds::PACKED_SMI,
            ElementKind::PackedDouble => ElementKinds::PACKED_DOUBLE,
            ElementKind::Packed => ElementKinds::PACKED,
            ElementKind::Holey => ElementKinds::HOLEY,
        }
    }
}

/// Operand and result types of an arithmetic, unary or comparison site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArithmeticFeedback {
    pub lhs: TypeSet,
    /// Empty for unary operators
    pub rhs: TypeSet,
    pub result: TypeSet,
    pub samples: u64,
}

impl ArithmeticFeedback {
    /// All operands were small integers
    pub fn operands_small_int(&self) -> bool {
        self.lhs.is_small_int() && (self.rhs.is_empty() || self.rhs.is_small_int())
    }

    /// All operands and results were small integers
    pub fn is_small_int(&self) -> bool {
        self.operands_small_int() && self.result.is_small_int()
    }

    /// All operands were numbers
    pub fn is_number(&self) -> bool {
        self.lhs.is_number() && (self.rhs.is_empty() || self.rhs.is_number())
    }
}

/// State of a property inline cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheState {
    Uninitialized,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

/// One observed receiver shape and where the property lived in it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeEntry {
    pub shape: ShapeId,
    /// `None` when the property was absent
    pub offset: Option<usize>,
}

/// Shape feedback for a named property site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyFeedback {
    state: CacheState,
    entries: Vec<ShapeEntry>,
    pub samples: u64,
}

impl Default for PropertyFeedback {
    fn default() -> Self {
        Self {
            state: CacheState::Uninitialized,
            entries: Vec::new(),
            samples: 0,
        }
    }
}

impl PropertyFeedback {
    /// Record a receiver; `None` means it was not a shaped object
    pub fn record(&mut self, receiver: Option<ShapeEntry>, max_polymorphism: usize) -> bool {
        self.samples += 1;
        if self.state == CacheState::Megamorphic {
            return false;
        }
        let Some(entry) = receiver else {
            self.go_megamorphic();
            return true;
        };
        if self.entries.iter().any(|e| e.shape == entry.shape) {
            return false;
        }
        if self.entries.len() >= max_polymorphism {
            self.go_megamorphic();
            return true;
        }
        self.entries.push(entry);
        self.state = match self.entries.len() {
            1 => CacheState::Monomorphic,
            _ => CacheState::Polymorphic,
        };
        true
    }

    fn go_megamorphic(&mut self) {
        self.state = CacheState::Megamorphic;
        self.entries.clear();
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn entries(&self) -> &[ShapeEntry] {
        &self.entries
    }
}

/// Element access feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElementFeedback {
    pub kinds: ElementKinds,
    pub index: TypeSet,
    pub samples: u64,
}

/// Observed call target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Uninitialized,
    Monomorphic(FunctionId),
    Megamorphic,
}

/// Call site feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFeedback {
    pub target: CallTarget,
    pub samples: u64,
}

impl Default for CallFeedback {
    fn default() -> Self {
        Self {
            target: CallTarget::Uninitialized,
            samples: 0,
        }
    }
}

impl CallFeedback {
    pub fn record(&mut self, callee: Option<FunctionId>) -> bool {
        self.samples += 1;
        let next = match (self.target, callee) {
            (CallTarget::Uninitialized, Some(f)) => CallTarget::Monomorphic(f),
            (CallTarget::Monomorphic(seen), Some(f)) if seen == f => return false,
            (CallTarget::Megamorphic, _) => return false,
            _ => CallTarget::Megamorphic,
        };
        self.target = next;
        true
    }
}

/// Conditional branch direction counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BranchFeedback {
    pub taken: u64,
    pub not_taken: u64,
}

/// Feedback for one bytecode site
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackEntry {
    Arithmetic(ArithmeticFeedback),
    Property(PropertyFeedback),
    Element(ElementFeedback),
    Call(CallFeedback),
    Branch(BranchFeedback),
}

/// Feedback for all sites of one function
#[derive(Debug, Clone, Default)]
pub struct FunctionFeedback {
    entries: HashMap<u32, FeedbackEntry>,
    code_version: u64,
    invocations: u64,
    /// Bumped whenever any entry widens
    epoch: u64,
}

impl FunctionFeedback {
    pub fn entry(&self, pc: u32) -> Option<&FeedbackEntry> {
        self.entries.get(&pc)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Number of sites with feedback
    pub fn sites(&self) -> usize {
        self.entries.len()
    }
}

/// An owned, immutable copy of a function's feedback
#[derive(Debug, Clone)]
pub struct FeedbackSnapshot {
    pub function: FunctionId,
    pub code_version: u64,
    pub invocations: u64,
    pub epoch: u64,
    entries: HashMap<u32, FeedbackEntry>,
}

impl FeedbackSnapshot {
    /// Snapshot of a function that never collected feedback
    pub fn empty(function: FunctionId, code_version: u64) -> Self {
        Self {
            function,
            code_version,
            invocations: 0,
            epoch: 0,
            entries: HashMap::default(),
        }
    }

    pub fn entry(&self, pc: u32) -> Option<&FeedbackEntry> {
        self.entries.get(&pc)
    }

    pub fn arithmetic(&self, pc: u32) -> Option<&ArithmeticFeedback> {
        match self.entries.get(&pc) {
            Some(FeedbackEntry::Arithmetic(fb)) => Some(fb),
            _ => None,
        }
    }

    pub fn property(&self, pc: u32) -> Option<&PropertyFeedback> {
        match self.entries.get(&pc) {
            Some(FeedbackEntry::Property(fb)) => Some(fb),
            _ => None,
        }
    }

    pub fn element(&self, pc: u32) -> Option<&ElementFeedback> {
        match self.entries.get(&pc) {
            Some(FeedbackEntry::Element(fb)) => Some(fb),
            _ => None,
        }
    }

    pub fn call(&self, pc: u32) -> Option<&CallFeedback> {
        match self.entries.get(&pc) {
            Some(FeedbackEntry::Call(fb)) => Some(fb),
            _ => None,
        }
    }

    pub fn branch(&self, pc: u32) -> Option<&BranchFeedback> {
        match self.entries.get(&pc) {
            Some(FeedbackEntry::Branch(fb)) => Some(fb),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Process-wide feedback registry
#[derive(Debug)]
pub struct FeedbackStore {
    functions: HashMap<FunctionId, FunctionFeedback>,
    max_polymorphism: usize,
}

impl FeedbackStore {
    pub fn new(max_polymorphism: usize) -> Self {
        Self {
            functions: HashMap::default(),
            max_polymorphism,
        }
    }

    /// Note an invocation in a feedback-collecting tier. A changed code
    /// version discards the old entries, which described different code.
    pub fn begin_invocation(&mut self, function: FunctionId, code_version: u64) {
        let fb = self.functions.entry(function).or_default();
        if fb.code_version != code_version {
            if fb.invocations > 0 {
                trace!(%function, "code changed, discarding feedback");
            }
            fb.entries.clear();
            fb.code_version = code_version;
            fb.epoch += 1;
        }
        fb.invocations += 1;
    }

    pub fn function(&self, function: FunctionId) -> Option<&FunctionFeedback> {
        self.functions.get(&function)
    }

    pub fn entry(&self, function: FunctionId, pc: u32) -> Option<&FeedbackEntry> {
        self.functions.get(&function)?.entries.get(&pc)
    }

    fn slot(
        &mut self,
        function: FunctionId,
        pc: u32,
        init: fn() -> FeedbackEntry,
    ) -> (&mut FeedbackEntry, &mut u64) {
        let fb = self.functions.entry(function).or_default();
        (fb.entries.entry(pc).or_insert_with(init), &mut fb.epoch)
    }

    pub fn record_arithmetic(&mut self, function: FunctionId, pc: u32, lhs: &Value, rhs: Option<&Value>, result: &Value) {
        let (entry, epoch) = self.slot(function, pc, || FeedbackEntry::Arithmetic(ArithmeticFeedback::default()));
        let FeedbackEntry::Arithmetic(fb) = entry else {
            return;
        };
        let before = *fb;
        fb.samples += 1;
        fb.lhs |= TypeSet::of(lhs);
        if let Some(rhs) = rhs {
            fb.rhs |= TypeSet::of(rhs);
        }
        fb.result |= TypeSet::of(result);
        if (fb.lhs, fb.rhs, fb.result) != (before.lhs, before.rhs, before.result) {
            *epoch += 1;
            trace!(%function, pc, lhs = ?fb.lhs, rhs = ?fb.rhs, result = ?fb.result, "arithmetic feedback widened");
        }
    }

    pub fn record_property(&mut self, function: FunctionId, pc: u32, receiver: Option<ShapeEntry>) {
        let max = self.max_polymorphism;
        let (entry, epoch) = self.slot(function, pc, || FeedbackEntry::Property(PropertyFeedback::default()));
        let FeedbackEntry::Property(fb) = entry else {
            return;
        };
        if fb.record(receiver, max) {
            *epoch += 1;
            trace!(%function, pc, state = ?fb.state(), "property feedback widened");
        }
    }

    pub fn record_element(&mut self, function: FunctionId, pc: u32, kinds: ElementKinds, index: &Value) {
        let (entry, epoch) = self.slot(function, pc, || FeedbackEntry::Element(ElementFeedback::default()));
        let FeedbackEntry::Element(fb) = entry else {
            return;
        };
        let before = (fb.kinds, fb.index);
        fb.samples += 1;
        fb.kinds |= kinds;
        fb.index |= TypeSet::of(index);
        if (fb.kinds, fb.index) != before {
            *epoch += 1;
            trace!(%function, pc, kinds = ?fb.kinds, "element feedback widened");
        }
    }

    pub fn record_call(&mut self, function: FunctionId, pc: u32, callee: Option<FunctionId>) {
        let (entry, epoch) = self.slot(function, pc, || FeedbackEntry::Call(CallFeedback::default()));
        let FeedbackEntry::Call(fb) = entry else {
            return;
        };
        if fb.record(callee) {
            *epoch += 1;
            trace!(%function, pc, target = ?fb.target, "call feedback widened");
        }
    }

    pub fn record_branch(&mut self, function: FunctionId, pc: u32, taken: bool) {
        let (entry, epoch) = self.slot(function, pc, || FeedbackEntry::Branch(BranchFeedback::default()));
        let FeedbackEntry::Branch(fb) = entry else {
            return;
        };
        let first_time = if taken { fb.taken == 0 } else { fb.not_taken == 0 };
        if taken {
            fb.taken += 1;
        } else {
            fb.not_taken += 1;
        }
        if first_time {
            *epoch += 1;
        }
    }

    /// Record the receiver of a named property access
    pub fn observe_named(&mut self, function: FunctionId, pc: u32, shapes: &ShapeTable, object: &Value, key: &str) {
        let receiver = match object {
            Value::Object(obj) => {
                let shape = obj.borrow().shape();
                Some(ShapeEntry {
                    shape,
                    offset: shapes.lookup(shape, key),
                })
            }
            _ => None,
        };
        self.record_property(function, pc, receiver);
    }

    /// Record an element load
    pub fn observe_element(&mut self, function: FunctionId, pc: u32, array: &Value, index: &Value) {
        let kinds = match array {
            Value::Array(arr) => {
                let arr = arr.borrow();
                let mut kinds = ElementKinds::from(arr.element_kind());
                if !element_index(index).is_some_and(|i| i < arr.len()) {
                    kinds |= ElementKinds::OUT_OF_BOUNDS;
                }
                kinds
            }
            _ => ElementKinds::NON_ARRAY,
        };
        self.record_element(function, pc, kinds, index);
    }

    /// Record the callee of a call
    pub fn observe_call(&mut self, function: FunctionId, pc: u32, callee: &Value) {
        let target = match callee {
            Value::Function(id) => Some(*id),
            _ => None,
        };
        self.record_call(function, pc, target);
    }

    /// Owned copy of a function's feedback for the compiler
    pub fn snapshot(&self, function: FunctionId, code_version: u64) -> FeedbackSnapshot {
        match self.functions.get(&function) {
            Some(fb) => FeedbackSnapshot {
                function,
                code_version: fb.code_version,
                invocations: fb.invocations,
                epoch: fb.epoch,
                entries: fb.entries.clone(),
            },
            None => FeedbackSnapshot::empty(function, code_version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const F: FunctionId = FunctionId(0);

    #[test]
    fn test_type_set_classification() {
        assert_eq!(TypeSet::of(&Value::Smi(1)), TypeSet::SMALL_INT);
        assert_eq!(TypeSet::of(&Value::Number(0.5)), TypeSet::FLOAT);
        assert!((TypeSet::SMALL_INT | TypeSet::FLOAT).is_number());
        assert!(!(TypeSet::SMALL_INT | TypeSet::STRING).is_number());
        assert!(!TypeSet::empty().is_number());
    }

    #[test]
    fn test_arithmetic_feedback_widens_monotonically() {
        let mut store = FeedbackStore::new(4);
        store.begin_invocation(F, 1);
        store.record_arithmetic(F, 3, &Value::Smi(1), Some(&Value::Smi(2)), &Value::Smi(3));
        assert!(store.snapshot(F, 1).arithmetic(3).unwrap().is_small_int());

        store.record_arithmetic(F, 3, &Value::Number(0.5), Some(&Value::Smi(2)), &Value::Number(2.5));
        let fb = *store.snapshot(F, 1).arithmetic(3).unwrap();
        assert!(!fb.is_small_int());
        assert!(fb.is_number());

        // Small integers again never narrow the entry back
        store.record_arithmetic(F, 3, &Value::Smi(1), Some(&Value::Smi(2)), &Value::Smi(3));
        assert_eq!(*store.snapshot(F, 1).arithmetic(3).unwrap(), ArithmeticFeedback { samples: 3, ..fb });
    }

    #[test]
    fn test_property_cache_transitions() {
        let mut fb = PropertyFeedback::default();
        let entry = |n| Some(ShapeEntry { shape: ShapeId(n), offset: Some(0) });
        assert_eq!(fb.state(), CacheState::Uninitialized);
        fb.record(entry(1), 2);
        assert_eq!(fb.state(), CacheState::Monomorphic);
        fb.record(entry(1), 2);
        assert_eq!(fb.entries().len(), 1);
        fb.record(entry(2), 2);
        assert_eq!(fb.state(), CacheState::Polymorphic);
        fb.record(entry(3), 2);
        assert_eq!(fb.state(), CacheState::Megamorphic);
        assert!(fb.entries().is_empty());
        fb.record(entry(1), 2);
        assert_eq!(fb.state(), CacheState::Megamorphic);
    }

    #[test]
    fn test_non_object_receiver_goes_megamorphic() {
        let mut fb = PropertyFeedback::default();
        fb.record(None, 4);
        assert_eq!(fb.state(), CacheState::Megamorphic);
    }

    #[test]
    fn test_call_feedback() {
        let mut fb = CallFeedback::default();
        fb.record(Some(FunctionId(2)));
        assert_eq!(fb.target, CallTarget::Monomorphic(FunctionId(2)));
        assert!(!fb.record(Some(FunctionId(2))));
        fb.record(Some(FunctionId(3)));
        assert_eq!(fb.target, CallTarget::Megamorphic);
    }

    #[test]
    fn test_branch_feedback_and_epoch() {
        let mut store = FeedbackStore::new(4);
        store.begin_invocation(F, 1);
        let start = store.function(F).unwrap().epoch();
        store.record_branch(F, 5, true);
        store.record_branch(F, 5, true);
        assert_eq!(store.function(F).unwrap().epoch(), start + 1);
        let snapshot = store.snapshot(F, 1);
        assert_eq!(*snapshot.branch(5).unwrap(), BranchFeedback { taken: 2, not_taken: 0 });
    }

    #[test]
    fn test_new_code_version_discards_entries() {
        let mut store = FeedbackStore::new(4);
        store.begin_invocation(F, 1);
        store.record_call(F, 0, Some(FunctionId(1)));
        store.begin_invocation(F, 2);
        let snapshot = store.snapshot(F, 2);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.code_version, 2);
        assert_eq!(snapshot.invocations, 2);
    }

    #[test]
    fn test_observe_helpers() {
        let mut shapes = ShapeTable::new();
        let key: std::sync::Arc<str> = "x".into();
        let shape = shapes.shape_for_keys(&[key]);
        let object = Value::Object(crate::runtime::JsObject::new(shape, vec![Value::Smi(1)]).into_ref());
        let mut store = FeedbackStore::new(4);
        store.observe_named(F, 0, &shapes, &object, "x");
        let snapshot = store.snapshot(F, 0);
        assert_eq!(snapshot.property(0).unwrap().entries(), &[ShapeEntry { shape, offset: Some(0) }]);

        let array = crate::runtime::ops::new_array(vec![Some(Value::Smi(1)), None]);
        store.observe_element(F, 1, &array, &Value::Smi(5));
        let kinds = store.snapshot(F, 0).element(1).unwrap().kinds;
        assert_eq!(kinds, ElementKinds::HOLEY | ElementKinds::OUT_OF_BOUNDS);

        store.observe_call(F, 2, &Value::Smi(3));
        assert_eq!(store.snapshot(F, 0).call(2).unwrap().target, CallTarget::Megamorphic);
    }

    #[test]
    fn test_snapshot_of_unknown_function_is_empty() {
        let store = FeedbackStore::new(4);
        let snapshot = store.snapshot(FunctionId(9), 42);
        assert_eq!(snapshot.invocations, 0);
        assert_eq!(snapshot.code_version, 42);
    }
}
