//! Tracked views over raw targets: the read/write interception layer.
//!
//! A [`Proxy`] pairs a target with a handler variant. Reads route through
//! [`track`](crate::dep::track) and return nested targets lazily wrapped in
//! a proxy of the same variant, which is what makes deep reactivity pay
//! only for the paths actually read. Writes diff against the old value with
//! NaN-aware identity equality and [`trigger`](crate::dep::trigger) only on
//! real change.
//!
//! Proxy equality is target identity plus variant, so `reactive(x)` is
//! idempotent without a canonical-instance cache.

use tracing::warn;

use crate::dep::{track, trigger, Key, PauseGuard, TrackOp, TriggerOp};
use crate::value::{same_value, ArrRef, MapRef, ObjRef, TargetMeta, Value};

/// Handler variant of a proxy.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ProxyKind {
    /// Deep tracked, mutable.
    Reactive,
    /// Deep readonly: reads do not track, writes warn and do nothing.
    Readonly,
    /// Only top-level reads tracked; nested values returned raw.
    ShallowReactive,
    /// Top-level readonly; nested values returned raw.
    ShallowReadonly,
    /// Backing view for `proxy_refs`: unwraps refs on read, writes through
    /// ref slots. Does not track.
    RefUnwrap,
}

impl ProxyKind {
    pub(crate) fn is_readonly(self) -> bool {
        matches!(self, ProxyKind::Readonly | ProxyKind::ShallowReadonly)
    }

    pub(crate) fn is_shallow(self) -> bool {
        matches!(self, ProxyKind::ShallowReactive | ProxyKind::ShallowReadonly)
    }
}

/// The raw target behind a proxy.
#[derive(Clone, PartialEq, Eq)]
pub(crate) enum ProxyTarget {
    Obj(ObjRef),
    Arr(ArrRef),
    Map(MapRef),
}

impl ProxyTarget {
    fn meta(&self) -> &TargetMeta {
        match self {
            ProxyTarget::Obj(o) => o.meta(),
            ProxyTarget::Arr(a) => a.meta(),
            ProxyTarget::Map(m) => m.meta(),
        }
    }

    fn as_value(&self) -> Value {
        match self {
            ProxyTarget::Obj(o) => Value::Obj(o.clone()),
            ProxyTarget::Arr(a) => Value::Arr(a.clone()),
            ProxyTarget::Map(m) => Value::Map(m.clone()),
        }
    }
}

/// Tracked view over an object, array, or map target.
#[derive(Clone)]
pub struct Proxy {
    pub(crate) target: ProxyTarget,
    pub(crate) kind: ProxyKind,
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.target == other.target
    }
}
impl Eq for Proxy {}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Proxy({:?}, #{})",
            self.kind,
            self.target.meta().id.get()
        )
    }
}

pub(crate) fn dev_warn(msg: &str) {
    if cfg!(debug_assertions) {
        warn!("{msg}");
    }
}

impl Proxy {
    pub(crate) fn new(target: ProxyTarget, kind: ProxyKind) -> Proxy {
        Proxy { target, kind }
    }

    /// Backing view for `proxy_refs`.
    pub(crate) fn new_ref_unwrap(target: ObjRef) -> Proxy {
        Proxy {
            target: ProxyTarget::Obj(target),
            kind: ProxyKind::RefUnwrap,
        }
    }

    pub(crate) fn target_meta(&self) -> &TargetMeta {
        self.target.meta()
    }

    /// The underlying raw target as a value.
    pub fn raw_value(&self) -> Value {
        self.target.as_value()
    }

    /// True for the mutable (deep or shallow) variants.
    pub fn is_reactive(&self) -> bool {
        matches!(self.kind, ProxyKind::Reactive | ProxyKind::ShallowReactive)
    }

    /// True for the readonly (deep or shallow) variants.
    pub fn is_readonly(&self) -> bool {
        self.kind.is_readonly()
    }

    /// Wrap a nested read result in a proxy of the same variant. Scalars,
    /// refs, and already-wrapped proxies pass through.
    pub(crate) fn wrap_nested(&self, v: Value) -> Value {
        match v {
            Value::Obj(o) => Value::Proxy(Proxy::new(ProxyTarget::Obj(o), self.kind)),
            Value::Arr(a) => Value::Proxy(Proxy::new(ProxyTarget::Arr(a), self.kind)),
            Value::Map(m) => Value::Proxy(Proxy::new(ProxyTarget::Map(m), self.kind)),
            other => other,
        }
    }

    fn canonical_for_object(key: Key) -> Key {
        match key {
            Key::Index(i) => Key::Prop(i.to_string().into()),
            Key::Length => Key::prop("length"),
            other => other,
        }
    }

    /// Read a property.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        let key = key.into();
        match &self.target {
            ProxyTarget::Obj(o) => self.get_object(o, key),
            ProxyTarget::Arr(a) => self.get_array(a, key),
            ProxyTarget::Map(_) => {
                dev_warn("map targets are read through entry_get, not get");
                Value::Null
            }
        }
    }

    fn get_object(&self, o: &ObjRef, key: Key) -> Value {
        let key = Self::canonical_for_object(key);
        let res = match &key {
            Key::Prop(name) => o.0.slots.read().get(name).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
        if self.kind == ProxyKind::RefUnwrap {
            return match res {
                Value::Ref(r) => r.get(),
                other => other,
            };
        }
        if !self.kind.is_readonly() {
            track(o.meta(), TrackOp::Get, key);
        }
        if self.kind.is_shallow() {
            return res;
        }
        if let Value::Ref(r) = &res {
            return r.get();
        }
        self.wrap_nested(res)
    }

    fn get_array(&self, a: &ArrRef, key: Key) -> Value {
        let key = key.canonical_for_array();
        match key {
            Key::Length => {
                let len = a.0.elems.read().len();
                if !self.kind.is_readonly() {
                    track(a.meta(), TrackOp::Get, Key::Length);
                }
                Value::Int(len as i64)
            }
            Key::Index(i) => {
                let res = a.0.elems.read().get(i).cloned().unwrap_or(Value::Null);
                if !self.kind.is_readonly() {
                    track(a.meta(), TrackOp::Get, Key::Index(i));
                }
                if self.kind.is_shallow() {
                    return res;
                }
                // Integer-indexed reads preserve refs; only object results
                // get the deep wrap.
                self.wrap_nested(res)
            }
            other => {
                if !self.kind.is_readonly() {
                    track(a.meta(), TrackOp::Get, other);
                }
                Value::Null
            }
        }
    }

    /// Write a property. Returns whether the underlying write happened
    /// (readonly variants report success without mutating).
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> bool {
        let key = key.into();
        let value = value.into();
        match &self.target {
            ProxyTarget::Obj(o) => self.set_object(o, key, value),
            ProxyTarget::Arr(a) => self.set_array(a, key, value),
            ProxyTarget::Map(_) => {
                dev_warn("map targets are written through entry_set, not set");
                false
            }
        }
    }

    fn set_object(&self, o: &ObjRef, key: Key, value: Value) -> bool {
        let key = Self::canonical_for_object(key);
        let Key::Prop(name) = key.clone() else {
            return false;
        };
        if self.kind == ProxyKind::RefUnwrap {
            let existing = o.0.slots.read().get(&name).cloned();
            if let Some(Value::Ref(r)) = existing {
                if !matches!(value, Value::Ref(_)) {
                    r.set(value);
                    return true;
                }
            }
            o.0.slots.write().insert(name, value);
            return true;
        }
        if self.kind.is_readonly() {
            dev_warn("set on a readonly proxy has no effect");
            return true;
        }

        let old = o.0.slots.read().get(&name).cloned();
        let mut incoming = value;
        if !self.kind.is_shallow() {
            incoming = to_raw(&incoming);
            if let Some(Value::Ref(r)) = &old {
                if !matches!(incoming, Value::Ref(_)) {
                    // Writing a plain value over a ref slot assigns through
                    // the ref.
                    r.set(incoming);
                    return true;
                }
            }
        }

        let had_key = old.is_some();
        o.0.slots.write().insert(name, incoming.clone());
        if !had_key {
            trigger(o.meta(), TriggerOp::Add, Some(key), Some(&incoming), None, None);
        } else {
            let old = old.expect("had_key");
            if !same_value(&incoming, &old) {
                trigger(
                    o.meta(),
                    TriggerOp::Set,
                    Some(key),
                    Some(&incoming),
                    Some(&old),
                    None,
                );
            }
        }
        true
    }

    fn set_array(&self, a: &ArrRef, key: Key, value: Value) -> bool {
        if self.kind.is_readonly() {
            dev_warn("set on a readonly proxy has no effect");
            return true;
        }
        match key.canonical_for_array() {
            Key::Length => match value.as_int() {
                Some(n) if n >= 0 => {
                    self.set_len(n as usize);
                    true
                }
                _ => false,
            },
            Key::Index(i) => {
                let mut incoming = value;
                if !self.kind.is_shallow() {
                    incoming = to_raw(&incoming);
                }
                let (had_key, old) = {
                    let elems = a.0.elems.read();
                    (i < elems.len(), elems.get(i).cloned())
                };
                {
                    let mut elems = a.0.elems.write();
                    if i >= elems.len() {
                        elems.resize(i + 1, Value::Null);
                    }
                    elems[i] = incoming.clone();
                }
                if !had_key {
                    trigger(
                        a.meta(),
                        TriggerOp::Add,
                        Some(Key::Index(i)),
                        Some(&incoming),
                        None,
                        None,
                    );
                } else {
                    let old = old.expect("had_key");
                    if !same_value(&incoming, &old) {
                        trigger(
                            a.meta(),
                            TriggerOp::Set,
                            Some(Key::Index(i)),
                            Some(&incoming),
                            Some(&old),
                            None,
                        );
                    }
                }
                true
            }
            _ => {
                dev_warn("arrays only accept index and length writes");
                false
            }
        }
    }

    /// Remove a property. Triggers only when something was actually
    /// removed.
    pub fn delete(&self, key: impl Into<Key>) -> bool {
        let key = key.into();
        if self.kind.is_readonly() {
            dev_warn("delete on a readonly proxy has no effect");
            return true;
        }
        match &self.target {
            ProxyTarget::Obj(o) => {
                let key = Self::canonical_for_object(key);
                let Key::Prop(name) = key.clone() else {
                    return false;
                };
                let old = o.0.slots.write().shift_remove(&name);
                match old {
                    Some(old) => {
                        trigger(o.meta(), TriggerOp::Delete, Some(key), None, Some(&old), None);
                        true
                    }
                    None => true,
                }
            }
            ProxyTarget::Arr(a) => {
                // Deleting an element leaves a hole; length is unchanged.
                let Some(i) = key.as_array_index() else {
                    return false;
                };
                let old = {
                    let mut elems = a.0.elems.write();
                    match elems.get_mut(i) {
                        Some(slot) if !slot.is_null() => {
                            Some(std::mem::replace(slot, Value::Null))
                        }
                        _ => None,
                    }
                };
                match old {
                    Some(old) => {
                        trigger(
                            a.meta(),
                            TriggerOp::Delete,
                            Some(Key::Index(i)),
                            None,
                            Some(&old),
                            None,
                        );
                        true
                    }
                    None => true,
                }
            }
            ProxyTarget::Map(_) => {
                dev_warn("map targets are mutated through entry_delete, not delete");
                false
            }
        }
    }

    /// Membership test. Tracks `Has` on all variants (enumeration-style
    /// reads track even on readonly views, matching own-key enumeration).
    pub fn has(&self, key: impl Into<Key>) -> bool {
        let key = key.into();
        match &self.target {
            ProxyTarget::Obj(o) => {
                let key = Self::canonical_for_object(key);
                let present = match &key {
                    Key::Prop(name) => o.0.slots.read().contains_key(name),
                    _ => false,
                };
                if self.kind != ProxyKind::RefUnwrap {
                    track(o.meta(), TrackOp::Has, key);
                }
                present
            }
            ProxyTarget::Arr(a) => {
                let key = key.canonical_for_array();
                let present = match &key {
                    Key::Index(i) => a
                        .0
                        .elems
                        .read()
                        .get(*i)
                        .is_some_and(|v| !v.is_null()),
                    Key::Length => true,
                    _ => false,
                };
                track(a.meta(), TrackOp::Has, key);
                present
            }
            ProxyTarget::Map(_) => {
                dev_warn("map targets are probed through entry_has, not has");
                false
            }
        }
    }

    /// Enumerate own keys. Subscribes the running effect to structural
    /// changes: `Iterate` for objects, `Length` for arrays.
    pub fn keys(&self) -> Vec<Key> {
        match &self.target {
            ProxyTarget::Obj(o) => {
                if self.kind != ProxyKind::RefUnwrap {
                    track(o.meta(), TrackOp::Iterate, Key::Iterate);
                }
                o.0.slots.read().keys().cloned().map(Key::Prop).collect()
            }
            ProxyTarget::Arr(a) => {
                track(a.meta(), TrackOp::Iterate, Key::Length);
                (0..a.0.elems.read().len()).map(Key::Index).collect()
            }
            ProxyTarget::Map(_) => {
                dev_warn("map targets enumerate through map_keys, not keys");
                Vec::new()
            }
        }
    }

    /// Element/entry count. Arrays track `Length`, objects and maps track
    /// `Iterate`.
    pub fn len(&self) -> usize {
        match &self.target {
            ProxyTarget::Obj(o) => {
                if self.kind != ProxyKind::RefUnwrap {
                    track(o.meta(), TrackOp::Iterate, Key::Iterate);
                }
                o.0.slots.read().len()
            }
            ProxyTarget::Arr(a) => {
                if !self.kind.is_readonly() {
                    track(a.meta(), TrackOp::Get, Key::Length);
                }
                a.0.elems.read().len()
            }
            ProxyTarget::Map(m) => {
                track(m.meta(), TrackOp::Iterate, Key::Iterate);
                m.0.entries.read().len()
            }
        }
    }

    /// True when the target holds no elements/entries. Tracks like
    /// [`Proxy::len`].
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- instrumented array methods ---

    fn array_target(&self, method: &str) -> Option<&ArrRef> {
        match &self.target {
            ProxyTarget::Arr(a) => Some(a),
            _ => {
                dev_warn(method);
                None
            }
        }
    }

    /// Identity search over every element. Tracks each index so membership
    /// stays live, and retries with the raw form of the needle when the
    /// tracked form is not found.
    pub fn index_of(&self, needle: &Value) -> Option<usize> {
        let a = self.array_target("index_of expects an array target")?;
        let snapshot: Vec<Value> = a.0.elems.read().clone();
        for i in 0..snapshot.len() {
            track(a.meta(), TrackOp::Get, Key::Index(i));
        }
        let found = snapshot.iter().position(|v| same_value(v, needle));
        if found.is_some() {
            return found;
        }
        cov_mark::hit!(raw_retry_lookup);
        let raw = to_raw(needle);
        snapshot.iter().position(|v| same_value(v, &raw))
    }

    /// Like [`Proxy::index_of`], searching from the back.
    pub fn last_index_of(&self, needle: &Value) -> Option<usize> {
        let a = self.array_target("last_index_of expects an array target")?;
        let snapshot: Vec<Value> = a.0.elems.read().clone();
        for i in 0..snapshot.len() {
            track(a.meta(), TrackOp::Get, Key::Index(i));
        }
        let found = snapshot.iter().rposition(|v| same_value(v, needle));
        if found.is_some() {
            return found;
        }
        let raw = to_raw(needle);
        snapshot.iter().rposition(|v| same_value(v, &raw))
    }

    /// Membership via [`Proxy::index_of`].
    pub fn includes(&self, needle: &Value) -> bool {
        self.index_of(needle).is_some()
    }

    /// Append an element; returns the new length. The implicit length read
    /// is untracked so an effect pushing to an array it reads does not
    /// subscribe to its own mutation.
    pub fn push(&self, value: impl Into<Value>) -> usize {
        let Some(a) = self.array_target("push expects an array target") else {
            return 0;
        };
        let _guard = PauseGuard::new();
        let len = a.0.elems.read().len();
        self.set(Key::Index(len), value.into());
        len + 1
    }

    /// Remove and return the last element (`Null` when empty).
    pub fn pop(&self) -> Value {
        let Some(a) = self.array_target("pop expects an array target") else {
            return Value::Null;
        };
        if self.kind.is_readonly() {
            dev_warn("pop on a readonly proxy has no effect");
            return Value::Null;
        }
        let _guard = PauseGuard::new();
        let (removed, old_len) = {
            let mut elems = a.0.elems.write();
            let old_len = elems.len();
            (elems.pop(), old_len)
        };
        let Some(removed) = removed else {
            return Value::Null;
        };
        let new_len = old_len - 1;
        trigger(
            a.meta(),
            TriggerOp::Delete,
            Some(Key::Index(new_len)),
            None,
            Some(&removed),
            None,
        );
        trigger(
            a.meta(),
            TriggerOp::Set,
            Some(Key::Length),
            Some(&Value::Int(new_len as i64)),
            Some(&Value::Int(old_len as i64)),
            None,
        );
        removed
    }

    /// Remove and return the first element (`Null` when empty).
    pub fn shift(&self) -> Value {
        match self.splice(0, 1, Vec::new()).into_iter().next() {
            Some(v) => v,
            None => Value::Null,
        }
    }

    /// Prepend an element; returns the new length.
    pub fn unshift(&self, value: impl Into<Value>) -> usize {
        let len = {
            let Some(a) = self.array_target("unshift expects an array target") else {
                return 0;
            };
            a.0.elems.read().len()
        };
        self.splice(0, 0, vec![value.into()]);
        len + 1
    }

    /// Remove `delete_count` elements at `start`, inserting `items` in
    /// their place; returns the removed elements. Triggers per changed
    /// index plus the length change, which is what drives truncation
    /// semantics downstream.
    pub fn splice(&self, start: usize, delete_count: usize, items: Vec<Value>) -> Vec<Value> {
        let Some(a) = self.array_target("splice expects an array target") else {
            return Vec::new();
        };
        if self.kind.is_readonly() {
            dev_warn("splice on a readonly proxy has no effect");
            return Vec::new();
        }
        let _guard = PauseGuard::new();
        let before: Vec<Value> = a.0.elems.read().clone();
        let start = start.min(before.len());
        let delete_count = delete_count.min(before.len() - start);
        let items: Vec<Value> = if self.kind.is_shallow() {
            items
        } else {
            items.iter().map(to_raw).collect()
        };

        let removed: Vec<Value> = {
            let mut elems = a.0.elems.write();
            elems.splice(start..start + delete_count, items).collect()
        };
        let after: Vec<Value> = a.0.elems.read().clone();

        let (old_len, new_len) = (before.len(), after.len());
        let common = old_len.min(new_len);
        for i in start..common {
            if !same_value(&after[i], &before[i]) {
                trigger(
                    a.meta(),
                    TriggerOp::Set,
                    Some(Key::Index(i)),
                    Some(&after[i]),
                    Some(&before[i]),
                    None,
                );
            }
        }
        for (i, item) in after.iter().enumerate().take(new_len).skip(old_len) {
            trigger(a.meta(), TriggerOp::Add, Some(Key::Index(i)), Some(item), None, None);
        }
        for (i, item) in before.iter().enumerate().take(old_len).skip(new_len) {
            trigger(
                a.meta(),
                TriggerOp::Delete,
                Some(Key::Index(i)),
                None,
                Some(item),
                None,
            );
        }
        if old_len != new_len {
            trigger(
                a.meta(),
                TriggerOp::Set,
                Some(Key::Length),
                Some(&Value::Int(new_len as i64)),
                Some(&Value::Int(old_len as i64)),
                None,
            );
        }
        removed
    }

    /// Resize the array (`arr.length = n`). Truncation invalidates the
    /// removed indices through the length trigger.
    pub fn set_len(&self, n: usize) {
        let Some(a) = self.array_target("set_len expects an array target") else {
            return;
        };
        if self.kind.is_readonly() {
            dev_warn("set_len on a readonly proxy has no effect");
            return;
        }
        let _guard = PauseGuard::new();
        let old_len = {
            let mut elems = a.0.elems.write();
            let old_len = elems.len();
            if old_len == n {
                return;
            }
            elems.resize(n, Value::Null);
            old_len
        };
        trigger(
            a.meta(),
            TriggerOp::Set,
            Some(Key::Length),
            Some(&Value::Int(n as i64)),
            Some(&Value::Int(old_len as i64)),
            None,
        );
    }
}

fn wrappable_target(v: &Value) -> Option<ProxyTarget> {
    match v {
        Value::Obj(o) => Some(ProxyTarget::Obj(o.clone())),
        Value::Arr(a) => Some(ProxyTarget::Arr(a.clone())),
        Value::Map(m) => Some(ProxyTarget::Map(m.clone())),
        _ => None,
    }
}

fn wrap(v: Value, kind: ProxyKind) -> Value {
    if let Value::Proxy(ref p) = v {
        // Refuse to double-wrap. A readonly request over a mutable proxy
        // re-wraps the same raw target with the readonly handler.
        if kind.is_readonly() && p.is_reactive() {
            return Value::Proxy(Proxy::new(p.target.clone(), kind));
        }
        return v;
    }
    match wrappable_target(&v) {
        Some(target) => {
            if target.meta().is_raw_opt_out() {
                return v;
            }
            Value::Proxy(Proxy::new(target, kind))
        }
        None => {
            dev_warn("value cannot be made reactive: not an object, array, or map");
            v
        }
    }
}

/// Deep mutable proxy over an object, array, or map. Idempotent: proxies
/// pass through unchanged, `mark_raw` targets are returned as-is, and
/// scalars are returned with a debug warning.
pub fn reactive(v: Value) -> Value {
    wrap(v, ProxyKind::Reactive)
}

/// Deep readonly proxy. Reads do not track; writes warn and do nothing.
pub fn readonly(v: Value) -> Value {
    wrap(v, ProxyKind::Readonly)
}

/// Mutable proxy tracking only top-level access.
pub fn shallow_reactive(v: Value) -> Value {
    wrap(v, ProxyKind::ShallowReactive)
}

/// Readonly proxy guarding only top-level access.
pub fn shallow_readonly(v: Value) -> Value {
    wrap(v, ProxyKind::ShallowReadonly)
}

/// Whether this value is a mutable tracked view.
pub fn is_reactive(v: &Value) -> bool {
    matches!(v, Value::Proxy(p) if p.is_reactive())
}

/// Whether this value is a readonly view.
pub fn is_readonly(v: &Value) -> bool {
    matches!(v, Value::Proxy(p) if p.is_readonly())
}

/// Whether this value is any tracked view.
pub fn is_proxy(v: &Value) -> bool {
    is_reactive(v) || is_readonly(v)
}

/// Strip the proxy wrapper, returning the underlying raw target. Non-proxy
/// values pass through.
pub fn to_raw(v: &Value) -> Value {
    match v {
        Value::Proxy(p) => p.raw_value(),
        other => other.clone(),
    }
}

/// Tag a target so `reactive`/`readonly` return it unwrapped.
pub fn mark_raw(v: Value) -> Value {
    if let Some(meta) = v.target_meta() {
        meta.set_raw_opt_out();
    }
    v
}
