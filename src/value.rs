//! The dynamic value model observed by the engine.
//!
//! A [`Value`] is either a scalar, a handle to an identity-bearing heap
//! target (object, array, map), a [`Ref`](crate::Ref) cell, or a
//! [`Proxy`](crate::Proxy) view over a target. Targets carry a
//! [`TargetMeta`] record holding their unique id and the per-key
//! dependency table that `track`/`trigger` maintain. Embedding the
//! dependency table in the target means a target's subscriptions are
//! reclaimed with the target itself; no global registry outlives it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use foldhash::fast::FixedState;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::dep::{Key, SharedDep};
use crate::proxy::Proxy;
use crate::reference::Ref;

/// Process-wide monotonically increasing target id counter.
static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a trackable target (object, array, map, or cell).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct TargetId(u64);

impl TargetId {
    fn next() -> Self {
        Self(NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// What shape of target a [`TargetMeta`] belongs to. Trigger's synthetic-key
/// rules branch on this.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum TargetKind {
    Object,
    Array,
    Map,
    /// Single-slot cells: refs and computeds.
    Cell,
}

/// Reactive bookkeeping shared by every target: identity, shape, the
/// opt-out flag set by [`mark_raw`](crate::mark_raw), and the lazily
/// populated key-dep table.
pub(crate) struct TargetMeta {
    pub(crate) id: TargetId,
    pub(crate) kind: TargetKind,
    raw_opt_out: AtomicBool,
    pub(crate) deps: RwLock<IndexMap<Key, SharedDep, FixedState>>,
}

impl TargetMeta {
    pub(crate) fn new(kind: TargetKind) -> Self {
        Self {
            id: TargetId::next(),
            kind,
            raw_opt_out: AtomicBool::new(false),
            deps: RwLock::new(IndexMap::with_hasher(FixedState::default())),
        }
    }

    pub(crate) fn is_raw_opt_out(&self) -> bool {
        self.raw_opt_out.load(Ordering::Relaxed)
    }

    pub(crate) fn set_raw_opt_out(&self) {
        self.raw_opt_out.store(true, Ordering::Relaxed);
    }
}

/// Raw object target: insertion-ordered string-keyed slots.
pub(crate) struct RawObject {
    pub(crate) meta: TargetMeta,
    pub(crate) slots: RwLock<IndexMap<Arc<str>, Value, FixedState>>,
}

/// Raw array target.
pub(crate) struct RawArray {
    pub(crate) meta: TargetMeta,
    pub(crate) elems: RwLock<Vec<Value>>,
}

/// Raw map target: entries keyed by [`MapKey`].
pub(crate) struct RawMap {
    pub(crate) meta: TargetMeta,
    pub(crate) entries: RwLock<IndexMap<MapKey, Value, FixedState>>,
}

/// Shared handle to a raw object target. Identity is the target id.
#[derive(Clone)]
pub struct ObjRef(pub(crate) Arc<RawObject>);

/// Shared handle to a raw array target.
#[derive(Clone)]
pub struct ArrRef(pub(crate) Arc<RawArray>);

/// Shared handle to a raw map target.
#[derive(Clone)]
pub struct MapRef(pub(crate) Arc<RawMap>);

impl ObjRef {
    pub(crate) fn meta(&self) -> &TargetMeta {
        &self.0.meta
    }

    /// This target's unique id.
    pub fn id(&self) -> TargetId {
        self.0.meta.id
    }
}

impl ArrRef {
    pub(crate) fn meta(&self) -> &TargetMeta {
        &self.0.meta
    }

    /// This target's unique id.
    pub fn id(&self) -> TargetId {
        self.0.meta.id
    }
}

impl MapRef {
    pub(crate) fn meta(&self) -> &TargetMeta {
        &self.0.meta
    }

    /// This target's unique id.
    pub fn id(&self) -> TargetId {
        self.0.meta.id
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for ObjRef {}

impl PartialEq for ArrRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for ArrRef {}

impl PartialEq for MapRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for MapRef {}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjRef(#{})", self.0.meta.id.get())
    }
}

impl std::fmt::Debug for ArrRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArrRef(#{})", self.0.meta.id.get())
    }
}

impl std::fmt::Debug for MapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MapRef(#{})", self.0.meta.id.get())
    }
}

/// Hashable key type for map targets.
///
/// Float keys are intentionally unrepresentable: identity-keyed host maps
/// admit NaN keys, an `IndexMap` cannot, and nothing in the trigger
/// contract depends on them.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum MapKey {
    /// Boolean key.
    Bool(bool),
    /// Integer key.
    Int(i64),
    /// String key.
    Str(Arc<str>),
}

impl From<bool> for MapKey {
    fn from(v: bool) -> Self {
        MapKey::Bool(v)
    }
}

impl From<i64> for MapKey {
    fn from(v: i64) -> Self {
        MapKey::Int(v)
    }
}

impl From<&str> for MapKey {
    fn from(v: &str) -> Self {
        MapKey::Str(Arc::from(v))
    }
}

/// A dynamic value: scalar, target handle, ref cell, or proxy view.
#[derive(Clone, Debug)]
pub enum Value {
    /// Absent / null.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// Immutable shared string.
    Str(Arc<str>),
    /// Raw array target.
    Arr(ArrRef),
    /// Raw object target.
    Obj(ObjRef),
    /// Raw map target.
    Map(MapRef),
    /// Reactive single-slot cell.
    Ref(Ref),
    /// Tracked view over a target.
    Proxy(Proxy),
}

impl Value {
    /// New empty raw object.
    pub fn object() -> Value {
        Value::Obj(ObjRef(Arc::new(RawObject {
            meta: TargetMeta::new(TargetKind::Object),
            slots: RwLock::new(IndexMap::with_hasher(FixedState::default())),
        })))
    }

    /// New raw object populated from `(key, value)` pairs.
    pub fn object_from<K, V, I>(entries: I) -> Value
    where
        K: Into<Arc<str>>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let obj = Value::object();
        if let Value::Obj(ref o) = obj {
            let mut slots = o.0.slots.write();
            for (k, v) in entries {
                slots.insert(k.into(), v.into());
            }
        }
        obj
    }

    /// New empty raw array.
    pub fn array() -> Value {
        Value::Arr(ArrRef(Arc::new(RawArray {
            meta: TargetMeta::new(TargetKind::Array),
            elems: RwLock::new(Vec::new()),
        })))
    }

    /// New raw array populated from values.
    pub fn array_from<V, I>(elems: I) -> Value
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        let arr = Value::array();
        if let Value::Arr(ref a) = arr {
            a.0.elems.write().extend(elems.into_iter().map(Into::into));
        }
        arr
    }

    /// New empty raw map.
    pub fn map() -> Value {
        Value::Map(MapRef(Arc::new(RawMap {
            meta: TargetMeta::new(TargetKind::Map),
            entries: RwLock::new(IndexMap::with_hasher(FixedState::default())),
        })))
    }

    /// True for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Float payload; integers coerce.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Boolean payload, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String payload, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Loose truthiness: `Null`, `false`, `0`, `0.0`, NaN and `""` are
    /// falsy; every target, ref, and proxy is truthy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// The target meta behind this value, if it has one (raw targets and
    /// proxies; refs carry their own meta internally).
    pub(crate) fn target_meta(&self) -> Option<&TargetMeta> {
        match self {
            Value::Obj(o) => Some(&o.0.meta),
            Value::Arr(a) => Some(&a.0.meta),
            Value::Map(m) => Some(&m.0.meta),
            Value::Proxy(p) => Some(p.target_meta()),
            _ => None,
        }
    }
}

/// Identity-with-NaN equality: `NaN == NaN`, zero sign ignored the way
/// integer/float scalars compare by value, targets and refs by identity,
/// strings by contents. Change detection everywhere in the engine goes
/// through this.
pub fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => (x.is_nan() && y.is_nan()) || x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Arr(x), Value::Arr(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => x == y,
        (Value::Map(x), Value::Map(y)) => x == y,
        (Value::Ref(x), Value::Ref(y)) => x.same_cell(y),
        (Value::Proxy(x), Value::Proxy(y)) => x == y,
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        same_value(self, other)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Arc::from(v.as_str()))
    }
}

impl From<Ref> for Value {
    fn from(v: Ref) -> Self {
        Value::Ref(v)
    }
}

impl From<Proxy> for Value {
    fn from(v: Proxy) -> Self {
        Value::Proxy(v)
    }
}
