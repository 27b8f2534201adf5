//! Single-slot reactive cells.
//!
//! A [`Ref`] is a target with one synthetic key, [`Key::ValueSlot`]. Reads
//! track it, writes compare raw values with NaN-aware identity and only
//! trigger on real change. Deep cells convert object values through
//! [`reactive`] at write time; shallow cells store values as given.
//!
//! Besides the plain cell there are custom refs (factory-provided get/set
//! over explicit track/trigger hooks), property refs (`to_ref`, observed by
//! the underlying object's proxy rather than the cell itself), and
//! computeds (their own module).

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::computed::ComputedCore;
use crate::dep::{track, trigger, Key, TrackOp, TriggerOp};
use crate::proxy::{dev_warn, is_reactive, reactive, to_raw, Proxy};
use crate::value::{same_value, TargetKind, TargetMeta, Value};

pub(crate) struct RefInner {
    pub(crate) meta: TargetMeta,
    pub(crate) kind: RefKind,
}

pub(crate) enum RefKind {
    Cell {
        /// Raw form kept for change comparison.
        raw: RwLock<Value>,
        /// Stored form handed to readers (reactive conversion for deep
        /// cells).
        value: RwLock<Value>,
        shallow: bool,
    },
    Custom {
        get: Mutex<Box<dyn FnMut() -> Value + Send>>,
        set: Mutex<Box<dyn FnMut(Value) + Send>>,
    },
    Property {
        source: Proxy,
        key: Key,
    },
    Computed(ComputedCore),
}

/// A reactive cell holding one value.
#[derive(Clone)]
pub struct Ref(pub(crate) Arc<RefInner>);

/// Convert a written value the way deep cells store it: targets and
/// proxies become reactive, scalars pass through.
fn convert(v: Value) -> Value {
    match v {
        v @ (Value::Obj(_) | Value::Arr(_) | Value::Map(_) | Value::Proxy(_)) => reactive(v),
        other => other,
    }
}

impl Ref {
    /// Wrap a value in a deep cell. Refs pass through unchanged.
    pub fn new(value: impl Into<Value>) -> Ref {
        let value = value.into();
        if let Value::Ref(r) = value {
            return r;
        }
        Self::cell(value, false)
    }

    fn cell(value: Value, shallow: bool) -> Ref {
        let raw = to_raw(&value);
        let stored = if shallow { value } else { convert(raw.clone()) };
        Ref(Arc::new(RefInner {
            meta: TargetMeta::new(TargetKind::Cell),
            kind: RefKind::Cell {
                raw: RwLock::new(raw),
                value: RwLock::new(stored),
                shallow,
            },
        }))
    }

    pub(crate) fn from_inner(inner: Arc<RefInner>) -> Ref {
        Ref(inner)
    }

    /// Read the cell, subscribing the running effect.
    pub fn get(&self) -> Value {
        match &self.0.kind {
            RefKind::Cell { value, .. } => {
                track(&self.0.meta, TrackOp::Get, Key::ValueSlot);
                value.read().clone()
            }
            RefKind::Custom { get, .. } => {
                let mut get = get.lock();
                (*get)()
            }
            RefKind::Property { source, key } => source.get(key.clone()),
            RefKind::Computed(core) => core.get(&self.0.meta),
        }
    }

    /// Write the cell. Equal raw values (NaN-aware) are a no-op.
    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        match &self.0.kind {
            RefKind::Cell {
                raw,
                value: stored,
                shallow,
            } => {
                let incoming_raw = to_raw(&value);
                {
                    let current = raw.read();
                    if same_value(&incoming_raw, &current) {
                        return;
                    }
                }
                let old = std::mem::replace(&mut *raw.write(), incoming_raw.clone());
                *stored.write() = if *shallow {
                    value
                } else {
                    convert(incoming_raw.clone())
                };
                trigger(
                    &self.0.meta,
                    TriggerOp::Set,
                    Some(Key::ValueSlot),
                    Some(&incoming_raw),
                    Some(&old),
                    None,
                );
            }
            RefKind::Custom { set, .. } => {
                let mut set = set.lock();
                (*set)(value);
            }
            RefKind::Property { source, key } => {
                source.set(key.clone(), value);
            }
            RefKind::Computed(core) => core.set(value),
        }
    }

    /// Whether two handles point at the same cell.
    pub fn same_cell(&self, other: &Ref) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn meta_id(&self) -> u64 {
        self.0.meta.id.get()
    }
}

impl std::fmt::Debug for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.0.kind {
            RefKind::Cell { shallow: false, .. } => "Ref",
            RefKind::Cell { shallow: true, .. } => "ShallowRef",
            RefKind::Custom { .. } => "CustomRef",
            RefKind::Property { .. } => "PropertyRef",
            RefKind::Computed(_) => "ComputedRef",
        };
        write!(f, "{}(#{})", kind, self.0.meta.id.get())
    }
}

/// Wrap a value in a shallow cell: only `.value` itself is tracked, object
/// values are not converted.
pub fn shallow_ref(value: impl Into<Value>) -> Ref {
    let value = value.into();
    if let Value::Ref(r) = value {
        return r;
    }
    Ref::cell(value, true)
}

/// Whether this value is a ref cell.
pub fn is_ref(v: &Value) -> bool {
    matches!(v, Value::Ref(_))
}

/// `r.value` for refs, the value itself otherwise.
pub fn unref(v: &Value) -> Value {
    match v {
        Value::Ref(r) => r.get(),
        other => other.clone(),
    }
}

/// Force-notify a ref's subscribers without changing its value. Useful
/// after in-place mutation of a shallow ref's payload.
pub fn trigger_ref(r: &Ref) {
    let current = match &r.0.kind {
        RefKind::Cell { raw, .. } => Some(raw.read().clone()),
        _ => None,
    };
    trigger(
        &r.0.meta,
        TriggerOp::Set,
        Some(Key::ValueSlot),
        current.as_ref(),
        None,
        None,
    );
}

/// Track/trigger hooks handed to a [`custom_ref`] factory, bound to the
/// cell under construction.
pub struct RefHooks {
    /// Subscribe the running effect to the cell.
    pub track: Arc<dyn Fn() + Send + Sync>,
    /// Notify the cell's subscribers.
    pub trigger: Arc<dyn Fn() + Send + Sync>,
}

/// Getter/setter pair returned by a [`custom_ref`] factory.
pub type CustomRefFns = (
    Box<dyn FnMut() -> Value + Send>,
    Box<dyn FnMut(Value) + Send>,
);

/// Build a ref with explicit dependency control: the factory receives
/// track/trigger closures bound to the new cell and returns the get/set
/// pair the cell delegates to.
pub fn custom_ref<F>(factory: F) -> Ref
where
    F: FnOnce(RefHooks) -> CustomRefFns,
{
    let inner = Arc::new_cyclic(|weak: &Weak<RefInner>| {
        let track_weak = weak.clone();
        let trigger_weak = weak.clone();
        let hooks = RefHooks {
            track: Arc::new(move || {
                if let Some(inner) = track_weak.upgrade() {
                    track(&inner.meta, TrackOp::Get, Key::ValueSlot);
                }
            }),
            trigger: Arc::new(move || {
                if let Some(inner) = trigger_weak.upgrade() {
                    trigger(
                        &inner.meta,
                        TriggerOp::Set,
                        Some(Key::ValueSlot),
                        None,
                        None,
                        None,
                    );
                }
            }),
        };
        let (get, set) = factory(hooks);
        RefInner {
            meta: TargetMeta::new(TargetKind::Cell),
            kind: RefKind::Custom {
                get: Mutex::new(get),
                set: Mutex::new(set),
            },
        }
    });
    Ref(inner)
}

/// A ref that reads and writes `source[key]`. Observation happens on the
/// underlying target's proxy, not on the synthetic cell.
pub fn to_ref(source: &Proxy, key: impl Into<Key>) -> Ref {
    Ref(Arc::new(RefInner {
        meta: TargetMeta::new(TargetKind::Cell),
        kind: RefKind::Property {
            source: source.clone(),
            key: key.into(),
        },
    }))
}

/// Convert a reactive object or array into a plain raw container of
/// property refs, one per key. Reading or writing those refs goes through
/// the source proxy.
pub fn to_refs(source: &Value) -> Value {
    let Value::Proxy(p) = source else {
        dev_warn("to_refs expects a reactive source");
        return source.clone();
    };
    if !is_reactive(source) {
        dev_warn("to_refs expects a reactive source");
    }
    match to_raw(source) {
        Value::Arr(a) => {
            let len = a.0.elems.read().len();
            Value::array_from((0..len).map(|i| Value::Ref(to_ref(p, i))))
        }
        _ => {
            let keys = {
                // Raw key enumeration: building the ref bundle must not
                // subscribe the caller.
                crate::effect::untracked(|| p.keys())
            };
            Value::object_from(keys.into_iter().filter_map(|k| match k {
                Key::Prop(name) => {
                    let r = to_ref(p, Key::Prop(name.clone()));
                    Some((name, Value::Ref(r)))
                }
                _ => None,
            }))
        }
    }
}

/// A view that reads refs as their inner value and writes through a ref
/// slot when the incoming value is not itself a ref. Reactive values pass
/// through unchanged; scalars are returned as-is.
pub fn proxy_refs(v: Value) -> Value {
    match v {
        Value::Obj(o) => Value::Proxy(Proxy::new_ref_unwrap(o)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::effect;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn ref_round_trips_scalars() {
        let r = Ref::new(5i64);
        assert_eq!(r.get(), Value::Int(5));
        assert_eq!(unref(&Value::Ref(r)), Value::Int(5));
    }

    #[test]
    fn ref_of_ref_is_identity() {
        let r = Ref::new(1i64);
        let r2 = Ref::new(Value::Ref(r.clone()));
        assert!(r.same_cell(&r2));
    }

    #[test]
    fn writes_notify_only_on_change() {
        let r = Ref::new(1i64);
        let runs = Arc::new(AtomicI64::new(0));
        let runs2 = runs.clone();
        let r2 = r.clone();
        let _e = effect(move || {
            r2.get();
            runs2.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        r.set(1i64);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        r.set(2i64);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        r.set(f64::NAN);
        r.set(f64::NAN);
        assert_eq!(runs.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn deep_ref_converts_object_values() {
        let r = Ref::new(Value::object());
        assert!(crate::proxy::is_reactive(&r.get()));
    }

    #[test]
    fn shallow_ref_stores_object_values_raw() {
        let r = shallow_ref(Value::object());
        assert!(!crate::proxy::is_proxy(&r.get()));
    }

    #[test]
    fn trigger_ref_fires_without_change() {
        let r = shallow_ref(1i64);
        let runs = Arc::new(AtomicI64::new(0));
        let runs2 = runs.clone();
        let r2 = r.clone();
        let _e = effect(move || {
            r2.get();
            runs2.fetch_add(1, Ordering::Relaxed);
        });
        trigger_ref(&r);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn custom_ref_controls_its_own_tracking() {
        let stored = Arc::new(AtomicI64::new(0));
        let stored_get = stored.clone();
        let stored_set = stored.clone();
        let r = custom_ref(move |hooks| {
            let on_get = hooks.track.clone();
            let on_set = hooks.trigger.clone();
            (
                Box::new(move || {
                    on_get();
                    Value::Int(stored_get.load(Ordering::Relaxed))
                }),
                Box::new(move |v: Value| {
                    stored_set.store(v.as_int().unwrap_or(0), Ordering::Relaxed);
                    on_set();
                }),
            )
        });
        let seen = Arc::new(AtomicI64::new(-1));
        let seen2 = seen.clone();
        let r2 = r.clone();
        let _e = effect(move || {
            seen2.store(r2.get().as_int().unwrap_or(-1), Ordering::Relaxed);
        });
        assert_eq!(seen.load(Ordering::Relaxed), 0);
        r.set(9i64);
        assert_eq!(seen.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn to_ref_reads_and_writes_through_the_source() {
        let Value::Proxy(p) = reactive(Value::object_from(vec![("n", Value::Int(1))])) else {
            unreachable!()
        };
        let r = to_ref(&p, "n");
        assert_eq!(r.get(), Value::Int(1));
        r.set(5i64);
        assert_eq!(p.get("n"), Value::Int(5));

        // Observation happens on the object's key, so proxy writes reach
        // effects reading through the ref.
        let seen = Arc::new(AtomicI64::new(0));
        let seen2 = seen.clone();
        let r2 = r.clone();
        let _e = effect(move || {
            seen2.store(r2.get().as_int().unwrap_or(-1), Ordering::Relaxed);
        });
        p.set("n", 7i64);
        assert_eq!(seen.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn to_refs_mirrors_the_source_keys() {
        let source = reactive(Value::object_from(vec![
            ("a", Value::Int(1)),
            ("b", Value::Int(2)),
        ]));
        let bundle = to_refs(&source);
        let Value::Obj(obj) = &bundle else {
            panic!("expected raw object of refs");
        };
        let slots = obj.0.slots.read();
        let Some(Value::Ref(ra)) = slots.get("a") else {
            panic!("missing ref for a");
        };
        let Some(Value::Ref(rb)) = slots.get("b") else {
            panic!("missing ref for b");
        };
        assert_eq!(ra.get(), Value::Int(1));
        assert_eq!(rb.get(), Value::Int(2));
    }

    #[test]
    fn proxy_refs_unwraps_on_read_and_writes_through() {
        let r = Ref::new(10i64);
        let raw = Value::object_from(vec![("count", Value::Ref(r.clone()))]);
        let Value::Proxy(view) = proxy_refs(raw) else {
            panic!("expected unwrapping view");
        };
        assert_eq!(view.get("count"), Value::Int(10));
        view.set("count", 11i64);
        assert_eq!(r.get(), Value::Int(11));
        // A ref incoming replaces the slot instead of writing through.
        let other = Ref::new(99i64);
        view.set("count", Value::Ref(other.clone()));
        assert_eq!(view.get("count"), Value::Int(99));
        assert_eq!(r.get(), Value::Int(11));
    }

    #[test]
    fn proxy_refs_passes_reactive_sources_through() {
        let p = reactive(Value::object());
        assert_eq!(proxy_refs(p.clone()), p);
    }

    #[test]
    fn object_slots_holding_refs_unwrap_on_proxy_reads() {
        let r = Ref::new(3i64);
        let Value::Proxy(p) =
            reactive(Value::object_from(vec![("n", Value::Ref(r.clone()))]))
        else {
            unreachable!()
        };
        assert_eq!(p.get("n"), Value::Int(3));
        // Writing a plain value assigns through the ref.
        p.set("n", 4i64);
        assert_eq!(r.get(), Value::Int(4));
    }

    #[test]
    fn array_integer_reads_preserve_refs() {
        let r = Ref::new(3i64);
        let Value::Proxy(a) = reactive(Value::array_from(vec![Value::Ref(r)])) else {
            unreachable!()
        };
        assert!(is_ref(&a.get(0usize)));
    }
}
