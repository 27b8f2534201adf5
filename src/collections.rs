//! Map target instrumentation.
//!
//! Maps share the trigger contract of the base handlers but key their deps
//! through [`Key::MapEntry`]: entry reads track the entry key, `size` and
//! value iteration track [`Key::Iterate`], key iteration tracks
//! [`Key::MapKeyIterate`], and mutation triggers let the registry fan
//! `Add`/`Delete` out to both iteration deps (plus `Set` to the value
//! iteration dep). `clear` is the one producer of [`TriggerOp::Clear`].

use crate::dep::{track, trigger, Key, TrackOp, TriggerOp};
use crate::proxy::{dev_warn, Proxy, ProxyTarget};
use crate::value::{same_value, MapKey, MapRef, Value};

impl Proxy {
    fn map_target(&self, method: &str) -> Option<&MapRef> {
        match &self.target {
            ProxyTarget::Map(m) => Some(m),
            _ => {
                dev_warn(method);
                None
            }
        }
    }

    /// Read a map entry. Tracks the entry key; deep variants wrap target
    /// values in a proxy of the same variant.
    pub fn entry_get(&self, key: impl Into<MapKey>) -> Value {
        let Some(m) = self.map_target("entry_get expects a map target") else {
            return Value::Null;
        };
        let key = key.into();
        let res = m.0.entries.read().get(&key).cloned().unwrap_or(Value::Null);
        if !self.kind.is_readonly() {
            track(m.meta(), TrackOp::Get, Key::MapEntry(key));
        }
        if self.kind.is_shallow() {
            return res;
        }
        if let Value::Ref(r) = &res {
            return r.get();
        }
        self.wrap_nested(res)
    }

    /// Write a map entry.
    pub fn entry_set(&self, key: impl Into<MapKey>, value: impl Into<Value>) -> bool {
        let Some(m) = self.map_target("entry_set expects a map target") else {
            return false;
        };
        if self.kind.is_readonly() {
            dev_warn("entry_set on a readonly proxy has no effect");
            return true;
        }
        let key = key.into();
        let mut incoming = value.into();
        if !self.kind.is_shallow() {
            incoming = crate::proxy::to_raw(&incoming);
        }
        let old = m.0.entries.read().get(&key).cloned();
        let had_key = old.is_some();
        m.0.entries.write().insert(key.clone(), incoming.clone());
        if !had_key {
            trigger(
                m.meta(),
                TriggerOp::Add,
                Some(Key::MapEntry(key)),
                Some(&incoming),
                None,
                None,
            );
        } else {
            let old = old.expect("had_key");
            if !same_value(&incoming, &old) {
                trigger(
                    m.meta(),
                    TriggerOp::Set,
                    Some(Key::MapEntry(key)),
                    Some(&incoming),
                    Some(&old),
                    None,
                );
            }
        }
        true
    }

    /// Membership test on a map entry.
    pub fn entry_has(&self, key: impl Into<MapKey>) -> bool {
        let Some(m) = self.map_target("entry_has expects a map target") else {
            return false;
        };
        let key = key.into();
        let present = m.0.entries.read().contains_key(&key);
        if !self.kind.is_readonly() {
            track(m.meta(), TrackOp::Has, Key::MapEntry(key));
        }
        present
    }

    /// Remove a map entry. Triggers only when the key was present.
    pub fn entry_delete(&self, key: impl Into<MapKey>) -> bool {
        let Some(m) = self.map_target("entry_delete expects a map target") else {
            return false;
        };
        if self.kind.is_readonly() {
            dev_warn("entry_delete on a readonly proxy has no effect");
            return true;
        }
        let key = key.into();
        let old = m.0.entries.write().shift_remove(&key);
        match old {
            Some(old) => {
                trigger(
                    m.meta(),
                    TriggerOp::Delete,
                    Some(Key::MapEntry(key)),
                    None,
                    Some(&old),
                    None,
                );
                true
            }
            None => false,
        }
    }

    /// Remove every entry. Fires a single `Clear` trigger carrying the old
    /// contents, which invalidates every dep recorded on the map.
    pub fn clear(&self) {
        let Some(m) = self.map_target("clear expects a map target") else {
            return;
        };
        if self.kind.is_readonly() {
            dev_warn("clear on a readonly proxy has no effect");
            return;
        }
        let old_entries: Vec<(MapKey, Value)> = {
            let mut entries = m.0.entries.write();
            entries.drain(..).collect()
        };
        if old_entries.is_empty() {
            return;
        }
        let old_target = Value::map();
        if let Value::Map(ref old_map) = old_target {
            old_map.0.entries.write().extend(old_entries);
        }
        trigger(m.meta(), TriggerOp::Clear, None, None, None, Some(&old_target));
    }

    /// Enumerate entry keys. Subscribes to key-set changes only: value
    /// rewrites of existing keys do not re-run key iterators.
    pub fn map_keys(&self) -> Vec<MapKey> {
        let Some(m) = self.map_target("map_keys expects a map target") else {
            return Vec::new();
        };
        if !self.kind.is_readonly() {
            track(m.meta(), TrackOp::Iterate, Key::MapKeyIterate);
        }
        m.0.entries.read().keys().cloned().collect()
    }

    /// Enumerate entry values. Subscribes to all entry changes.
    pub fn map_values(&self) -> Vec<Value> {
        let Some(m) = self.map_target("map_values expects a map target") else {
            return Vec::new();
        };
        if !self.kind.is_readonly() {
            track(m.meta(), TrackOp::Iterate, Key::Iterate);
        }
        let snapshot: Vec<Value> = m.0.entries.read().values().cloned().collect();
        snapshot.into_iter().map(|v| self.wrap_nested(v)).collect()
    }

    /// Enumerate `(key, value)` pairs. Subscribes to all entry changes.
    pub fn map_entries(&self) -> Vec<(MapKey, Value)> {
        let Some(m) = self.map_target("map_entries expects a map target") else {
            return Vec::new();
        };
        if !self.kind.is_readonly() {
            track(m.meta(), TrackOp::Iterate, Key::Iterate);
        }
        let snapshot: Vec<(MapKey, Value)> = m
            .0
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        snapshot
            .into_iter()
            .map(|(k, v)| (k, self.wrap_nested(v)))
            .collect()
    }
}
