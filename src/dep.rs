//! Dependency registry: keys, dep sets, and the track/trigger pair.
//!
//! Reads call [`track`] to subscribe the running effect to a
//! `(target, key)` pair; writes call [`trigger`] to collect and re-run the
//! subscribers. Dep sets are insertion-ordered and trigger always iterates
//! a copy, because running an effect rewrites its own subscriptions.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use foldhash::fast::FixedState;
use indexmap::IndexSet;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::effect::{self, EffectId};
use crate::value::{MapKey, TargetId, TargetKind, TargetMeta, Value};

/// A property identifier inside a target, plus the reserved synthetic keys.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Key {
    /// Named property of an object (or a non-index property of an array).
    Prop(Arc<str>),
    /// Array element index.
    Index(usize),
    /// Entry key of a map target.
    MapEntry(MapKey),
    /// The array length pseudo-property.
    Length,
    /// The single slot of a ref or computed cell.
    ValueSlot,
    /// Enumeration of a target's own keys.
    Iterate,
    /// Enumeration of a map target's keys.
    MapKeyIterate,
}

/// Sentinel key representing "enumeration of this target's own keys".
/// Collection instrumentation triggers it on `Add`/`Delete` (and `Set` for
/// maps).
pub const ITERATE_KEY: Key = Key::Iterate;

/// Sentinel key representing "enumeration of a map target's keys",
/// triggered on `Add`/`Delete` only.
pub const MAP_KEY_ITERATE_KEY: Key = Key::MapKeyIterate;

impl Key {
    /// Named property key.
    pub fn prop(name: &str) -> Key {
        Key::Prop(Arc::from(name))
    }

    /// Integer-key detection: the index this key denotes, if its string
    /// form parses losslessly to a non-negative integer.
    pub(crate) fn as_array_index(&self) -> Option<usize> {
        match self {
            Key::Index(i) => Some(*i),
            Key::Prop(s) => {
                let s: &str = s;
                if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                if s.len() > 1 && s.starts_with('0') {
                    return None;
                }
                s.parse().ok()
            }
            _ => None,
        }
    }

    /// Canonical form of this key when addressed against an array target:
    /// integer-valued property names become indices, `"length"` becomes
    /// [`Key::Length`].
    pub(crate) fn canonical_for_array(self) -> Key {
        if let Some(i) = self.as_array_index() {
            return Key::Index(i);
        }
        if let Key::Prop(ref s) = self {
            if &**s == "length" {
                return Key::Length;
            }
        }
        self
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::prop(s)
    }
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Key::Index(i)
    }
}

/// Read-side operations, carried on debug events.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TrackOp {
    /// Property read.
    Get,
    /// Membership test.
    Has,
    /// Own-key enumeration.
    Iterate,
}

/// Write-side operations. Selection of which deps re-run branches on this.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TriggerOp {
    /// Existing key changed value.
    Set,
    /// New key appeared.
    Add,
    /// Key removed.
    Delete,
    /// Whole collection cleared.
    Clear,
}

/// Set of effects subscribed to one `(target, key)` pair.
///
/// Insertion-ordered; an effect appears at most once. Shared between the
/// target's key-dep table and every subscribed effect's `deps` list so
/// cleanup is O(deps).
pub struct Dep {
    pub(crate) effects: RwLock<IndexSet<EffectId, FixedState>>,
}

/// Shared handle to a [`Dep`].
pub type SharedDep = Arc<Dep>;

impl Dep {
    fn new() -> Self {
        Self {
            effects: RwLock::new(IndexSet::with_hasher(FixedState::default())),
        }
    }

    /// Remove an effect, preserving the insertion order of the rest.
    pub(crate) fn remove(&self, id: EffectId) {
        self.effects.write().shift_remove(&id);
    }
}

// Tracking-state stack. `pause`/`enable` push the previous flag; `reset`
// pops it back. Underflow restores the default (tracking on).
thread_local! {
    static SHOULD_TRACK: Cell<bool> = const { Cell::new(true) };
    static TRACK_STACK: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
}

/// Whether reads currently subscribe the running effect.
pub fn is_tracking() -> bool {
    SHOULD_TRACK.with(Cell::get)
}

/// Suspend dependency collection until the matching [`reset_tracking`].
pub fn pause_tracking() {
    TRACK_STACK.with(|s| s.borrow_mut().push(SHOULD_TRACK.with(Cell::get)));
    SHOULD_TRACK.with(|t| t.set(false));
}

/// Force dependency collection on until the matching [`reset_tracking`].
pub fn enable_tracking() {
    TRACK_STACK.with(|s| s.borrow_mut().push(SHOULD_TRACK.with(Cell::get)));
    SHOULD_TRACK.with(|t| t.set(true));
}

/// Restore the tracking state saved by the nearest `pause`/`enable`.
pub fn reset_tracking() {
    let prev = TRACK_STACK.with(|s| s.borrow_mut().pop());
    SHOULD_TRACK.with(|t| t.set(prev.unwrap_or(true)));
}

/// RAII pairing of `pause_tracking`/`reset_tracking` for scoped sections.
pub(crate) struct PauseGuard;

impl PauseGuard {
    pub(crate) fn new() -> Self {
        pause_tracking();
        PauseGuard
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        reset_tracking();
    }
}

/// Debug event payload delivered to `on_track`/`on_trigger` hooks.
#[derive(Clone, Debug)]
pub struct DebugEvent {
    /// Uid of the effect being subscribed or re-run.
    pub effect: u64,
    /// Identity of the target involved.
    pub target: TargetId,
    /// The operation that produced the event.
    pub op: DebugOp,
    /// The key involved.
    pub key: Key,
    /// Incoming value, on writes that carry one.
    pub new_value: Option<Value>,
    /// Previous value, on writes that carry one.
    pub old_value: Option<Value>,
    /// Previous contents, on collection clears.
    pub old_target: Option<Value>,
}

/// Which side of the registry produced a [`DebugEvent`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DebugOp {
    /// Read-side subscription.
    Track(TrackOp),
    /// Write-side notification.
    Trigger(TriggerOp),
}

/// Hook invoked with debug events; only called in debug builds.
pub type DebugHook = Arc<dyn Fn(&DebugEvent) + Send + Sync>;

/// Subscribe the currently running effect to `(meta, key)`.
///
/// No-op when tracking is paused or no effect is running. Maintains both
/// sides of the edge: the dep's effect set and the effect's dep list.
pub(crate) fn track(meta: &TargetMeta, op: TrackOp, key: Key) {
    if !is_tracking() {
        return;
    }
    let Some(id) = effect::active_effect() else {
        return;
    };
    let dep = {
        let mut deps = meta.deps.write();
        deps.entry(key.clone())
            .or_insert_with(|| Arc::new(Dep::new()))
            .clone()
    };
    let newly_added = dep.effects.write().insert(id);
    if newly_added {
        effect::record_tracked_dep(id, dep);
        if cfg!(debug_assertions) {
            if let Some(hook) = effect::on_track_hook(id) {
                hook(&DebugEvent {
                    effect: effect::effect_uid(id),
                    target: meta.id,
                    op: DebugOp::Track(op),
                    key,
                    new_value: None,
                    old_value: None,
                    old_target: None,
                });
            }
        }
    }
}

/// Collect and run (or schedule) every effect subscribed to `(meta, key)`.
///
/// The run set is a fresh copy: effects re-track themselves while running,
/// and iterating the live sets would never terminate. The currently running
/// effect is excluded unless it opted into `allow_recurse`.
pub(crate) fn trigger(
    meta: &TargetMeta,
    op: TriggerOp,
    key: Option<Key>,
    new_value: Option<&Value>,
    old_value: Option<&Value>,
    old_target: Option<&Value>,
) {
    let mut scheduled: IndexSet<EffectId, FixedState> = IndexSet::with_hasher(FixedState::default());
    {
        let deps = meta.deps.read();
        if deps.is_empty() {
            return;
        }
        let current = effect::active_effect();
        let mut add = |dep: &SharedDep| {
            for id in dep.effects.read().iter() {
                if Some(*id) != current {
                    scheduled.insert(*id);
                } else if effect::allows_recurse(*id) {
                    cov_mark::hit!(self_trigger_allowed_by_recurse);
                    scheduled.insert(*id);
                }
            }
        };

        if op == TriggerOp::Clear {
            // Clearing a collection invalidates everything observed on it.
            for dep in deps.values() {
                add(dep);
            }
        } else if meta.kind == TargetKind::Array && key == Some(Key::Length) {
            // Truncation invalidates the removed indices along with length.
            cov_mark::hit!(length_trigger_sweeps_tail);
            let new_len = new_value.and_then(Value::as_int).unwrap_or(0).max(0) as usize;
            for (k, dep) in deps.iter() {
                match k {
                    Key::Length => add(dep),
                    Key::Index(i) if *i >= new_len => add(dep),
                    _ => {}
                }
            }
        } else {
            if let Some(ref k) = key {
                if let Some(dep) = deps.get(k) {
                    add(dep);
                }
            }
            let is_array = meta.kind == TargetKind::Array;
            let is_map = meta.kind == TargetKind::Map;
            match op {
                TriggerOp::Add => {
                    if !is_array {
                        add_synthetic(&deps, Key::Iterate, &mut add);
                        if is_map {
                            add_synthetic(&deps, Key::MapKeyIterate, &mut add);
                        }
                    } else if matches!(key, Some(Key::Index(_))) {
                        // Appending grows the array: length subscribers care.
                        add_synthetic(&deps, Key::Length, &mut add);
                    }
                }
                TriggerOp::Delete => {
                    if !is_array {
                        add_synthetic(&deps, Key::Iterate, &mut add);
                        if is_map {
                            add_synthetic(&deps, Key::MapKeyIterate, &mut add);
                        }
                    }
                }
                TriggerOp::Set => {
                    if is_map {
                        add_synthetic(&deps, Key::Iterate, &mut add);
                    }
                }
                TriggerOp::Clear => unreachable!("handled above"),
            }
        }
    }

    let run_list: SmallVec<[EffectId; 8]> = scheduled.into_iter().collect();
    for id in run_list {
        if cfg!(debug_assertions) {
            if let Some(hook) = effect::on_trigger_hook(id) {
                hook(&DebugEvent {
                    effect: effect::effect_uid(id),
                    target: meta.id,
                    op: DebugOp::Trigger(op),
                    key: key.clone().unwrap_or(Key::Iterate),
                    new_value: new_value.cloned(),
                    old_value: old_value.cloned(),
                    old_target: old_target.cloned(),
                });
            }
        }
        match effect::scheduler_of(id) {
            Some(scheduler) => scheduler(id),
            None => {
                effect::run_effect(id);
            }
        }
    }
}

fn add_synthetic<F>(
    deps: &indexmap::IndexMap<Key, SharedDep, FixedState>,
    key: Key,
    add: &mut F,
) where
    F: FnMut(&SharedDep),
{
    if let Some(dep) = deps.get(&key) {
        add(dep);
    }
}
