//! The effect runtime: reactive computations, their arena, and the
//! execution stacks.
//!
//! Effect metadata lives in a global slab arena behind a `RwLock`;
//! [`EffectId`] is a slot index. The function itself is taken out of the
//! arena while it runs and restored by a drop guard, so user code never
//! executes under an arena lock and a panicking callback cannot lose it.
//!
//! Effects created while another effect is running belong to that parent:
//! the parent destroys them when it re-runs or is dropped, and dropping the
//! child's own handle is a no-op. Parent/child edges live in lock-free maps
//! beside the arena.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use papaya::HashMap as PapayaHashMap;
use parking_lot::{Mutex, RwLock};
use slab::Slab;

use crate::dep::{enable_tracking, reset_tracking, DebugHook, PauseGuard, SharedDep};
use crate::value::Value;

/// The wrapped computation: a nullary function producing the run result.
type RawFn = Box<dyn FnMut() -> Value + Send>;

/// Scheduler invoked with the effect id on trigger instead of running the
/// effect synchronously.
pub type Scheduler = Arc<dyn Fn(EffectId) + Send + Sync>;

/// Hook run once when an effect is stopped.
pub type StopHook = Box<dyn FnOnce() + Send>;

/// Identifier of an effect in the arena.
///
/// Stale ids (the effect was deallocated) are harmless: every accessor
/// returns `None`/defaults for them.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EffectId(u32);

impl EffectId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Construction options for [`Effect::with_options`].
#[derive(Default)]
pub struct EffectOptions {
    /// Skip the eager first run; the caller invokes the runner itself.
    pub lazy: bool,
    /// Allow this effect's own writes to re-schedule it. Only safe together
    /// with a scheduler that breaks the synchronous cycle.
    pub allow_recurse: bool,
    /// Receives the effect id on trigger instead of a synchronous run.
    pub scheduler: Option<Scheduler>,
    /// Debug hook fired when the effect subscribes to a dep (debug builds).
    pub on_track: Option<DebugHook>,
    /// Debug hook fired when a write schedules the effect (debug builds).
    pub on_trigger: Option<DebugHook>,
    /// Fired once by [`Effect::stop`].
    pub on_stop: Option<StopHook>,
}

struct EffectRecord {
    uid: u64,
    active: AtomicBool,
    func: Mutex<Option<RawFn>>,
    /// Every dep that currently contains this effect; drained on cleanup.
    deps: Mutex<Vec<SharedDep>>,
    allow_recurse: bool,
    scheduler: Option<Scheduler>,
    on_track: Option<DebugHook>,
    on_trigger: Option<DebugHook>,
    on_stop: Mutex<Option<StopHook>>,
}

static EFFECTS: RwLock<Slab<EffectRecord>> = RwLock::new(Slab::new());

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

// Parent/child edges are kept out of the records for cache locality and so
// destruction can walk them without the arena lock.
static EFFECT_PARENT: LazyLock<PapayaHashMap<EffectId, EffectId>> =
    LazyLock::new(PapayaHashMap::new);
static EFFECT_CHILDREN: LazyLock<PapayaHashMap<EffectId, RwLock<Vec<EffectId>>>> =
    LazyLock::new(PapayaHashMap::new);

thread_local! {
    static EFFECT_STACK: RefCell<Vec<EffectId>> = const { RefCell::new(Vec::new()) };
}

/// The effect currently executing on this thread, if any: the top of the
/// effect stack. This is the sole producer of the context
/// [`track`](crate::dep::track) reads.
pub(crate) fn active_effect() -> Option<EffectId> {
    EFFECT_STACK.with(|s| s.borrow().last().copied())
}

fn with_record<R>(id: EffectId, f: impl FnOnce(&EffectRecord) -> R) -> Option<R> {
    let arena = EFFECTS.read();
    arena.get(id.index()).map(f)
}

pub(crate) fn record_tracked_dep(id: EffectId, dep: SharedDep) {
    with_record(id, |r| r.deps.lock().push(dep));
}

pub(crate) fn allows_recurse(id: EffectId) -> bool {
    with_record(id, |r| r.allow_recurse).unwrap_or(false)
}

pub(crate) fn scheduler_of(id: EffectId) -> Option<Scheduler> {
    with_record(id, |r| r.scheduler.clone()).flatten()
}

pub(crate) fn on_track_hook(id: EffectId) -> Option<DebugHook> {
    with_record(id, |r| r.on_track.clone()).flatten()
}

pub(crate) fn on_trigger_hook(id: EffectId) -> Option<DebugHook> {
    with_record(id, |r| r.on_trigger.clone()).flatten()
}

pub(crate) fn effect_uid(id: EffectId) -> u64 {
    with_record(id, |r| r.uid).unwrap_or(0)
}

pub(crate) fn is_effect_active(id: EffectId) -> bool {
    with_record(id, |r| r.active.load(Ordering::Acquire)).unwrap_or(false)
}

/// Remove this effect from every dep that contains it and forget them.
///
/// Runs at the start of every invocation so a branch that is no longer
/// reached no longer re-triggers the effect, and as the first half of
/// [`stop_effect`].
fn cleanup_effect(id: EffectId) {
    let deps = with_record(id, |r| std::mem::take(&mut *r.deps.lock())).unwrap_or_default();
    for dep in deps {
        dep.remove(id);
    }
}

/// Recursively destroy the child effects spawned during this effect's last
/// run. Stale children must not outlive the run that created them.
pub(crate) fn destroy_children(id: EffectId) {
    let children: Vec<EffectId> = {
        let guard = EFFECT_CHILDREN.pin();
        match guard.get(&id) {
            Some(lock) => {
                let drained = std::mem::take(&mut *lock.write());
                guard.remove(&id);
                drained
            }
            None => return,
        }
    };
    for child in children {
        destroy_children(child);
        stop_effect(child);
        remove_record(child);
    }
}

/// Stop an effect: cleanup, fire `on_stop`, mark inactive. Idempotent.
pub(crate) fn stop_effect(id: EffectId) {
    let was_active = with_record(id, |r| r.active.swap(false, Ordering::AcqRel)).unwrap_or(false);
    if !was_active {
        return;
    }
    cleanup_effect(id);
    let hook = with_record(id, |r| r.on_stop.lock().take()).flatten();
    if let Some(hook) = hook {
        hook();
    }
}

fn remove_record(id: EffectId) {
    {
        let guard = EFFECT_PARENT.pin();
        guard.remove(&id);
    }
    {
        let guard = EFFECT_CHILDREN.pin();
        guard.remove(&id);
    }
    let mut arena = EFFECTS.write();
    if arena.contains(id.index()) {
        arena.remove(id.index());
    }
}

fn parent_of(id: EffectId) -> Option<EffectId> {
    let guard = EFFECT_PARENT.pin();
    guard.get(&id).copied()
}

/// Run the stored function with the arena lock released.
///
/// The function is taken out of the record and restored by the drop guard,
/// even when it panics, so a failing run leaves the effect runnable.
fn call_raw(id: EffectId) -> Value {
    struct FnGuard {
        id: EffectId,
        func: Option<RawFn>,
    }

    impl Drop for FnGuard {
        fn drop(&mut self) {
            if let Some(f) = self.func.take() {
                let arena = EFFECTS.read();
                if let Some(record) = arena.get(self.id.index()) {
                    *record.func.lock() = Some(f);
                }
            }
        }
    }

    let func = {
        let arena = EFFECTS.read();
        arena.get(id.index()).and_then(|r| r.func.lock().take())
    };
    match func {
        None => Value::Null,
        Some(f) => {
            let mut guard = FnGuard { id, func: Some(f) };
            (guard.func.as_mut().expect("just stored"))()
        }
    }
}

/// Invoke an effect.
///
/// Inactive effects run their raw function untracked (or do nothing when a
/// scheduler is configured). A re-entrant invocation of an effect already
/// on this thread's stack returns silently. Otherwise: clean up stale
/// subscriptions, destroy last-run children, push the tracking and effect
/// stacks, run, and pop both in a drop guard.
pub(crate) fn run_effect(id: EffectId) -> Value {
    if !is_effect_active(id) {
        if with_record(id, |r| r.scheduler.is_some()).unwrap_or(true) {
            return Value::Null;
        }
        return call_raw(id);
    }
    let already_running = EFFECT_STACK.with(|s| s.borrow().contains(&id));
    if already_running {
        return Value::Null;
    }

    cleanup_effect(id);
    destroy_children(id);

    struct RunGuard;
    impl Drop for RunGuard {
        fn drop(&mut self) {
            EFFECT_STACK.with(|s| {
                s.borrow_mut().pop();
            });
            reset_tracking();
        }
    }

    enable_tracking();
    EFFECT_STACK.with(|s| s.borrow_mut().push(id));
    let _guard = RunGuard;
    call_raw(id)
}

/// Owning handle to a reactive computation.
///
/// Re-runs whenever a tracked read's target changes. A handle created at
/// top level owns its slot: dropping it stops the effect and frees the
/// record. A handle created inside another running effect is owned by that
/// parent instead, and dropping it does nothing.
pub struct Effect {
    id: EffectId,
}

impl Effect {
    /// Create and immediately run an effect over a plain procedure.
    pub fn new<F>(f: F) -> Effect
    where
        F: FnMut() + Send + 'static,
    {
        let mut f = f;
        Self::with_options(
            move || {
                f();
                Value::Null
            },
            EffectOptions::default(),
        )
    }

    /// Create an effect over a value-producing function with explicit
    /// options. Runs once immediately unless `lazy` is set.
    pub fn with_options<F>(f: F, options: EffectOptions) -> Effect
    where
        F: FnMut() -> Value + Send + 'static,
    {
        let record = EffectRecord {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            func: Mutex::new(Some(Box::new(f))),
            deps: Mutex::new(Vec::new()),
            allow_recurse: options.allow_recurse,
            scheduler: options.scheduler,
            on_track: options.on_track,
            on_trigger: options.on_trigger,
            on_stop: Mutex::new(options.on_stop),
        };
        let lazy = options.lazy;

        let id = {
            let mut arena = EFFECTS.write();
            let entry = arena.vacant_entry();
            let id = EffectId(entry.key() as u32);
            entry.insert(record);
            id
        };

        if let Some(parent) = active_effect() {
            {
                let guard = EFFECT_PARENT.pin();
                guard.insert(id, parent);
            }
            let guard = EFFECT_CHILDREN.pin();
            guard
                .get_or_insert_with(parent, || RwLock::new(Vec::new()))
                .write()
                .push(id);
        }

        let effect = Effect { id };
        if !lazy {
            run_effect(id);
        }
        effect
    }

    /// Invoke the effect now. See the module docs for re-entrancy and
    /// inactive-effect semantics.
    pub fn run(&self) -> Value {
        run_effect(self.id)
    }

    /// Stop the effect: unsubscribe from every dep, fire `on_stop`, mark
    /// inactive. Idempotent.
    pub fn stop(&self) {
        stop_effect(self.id);
    }

    /// Whether the effect has not been stopped.
    pub fn is_active(&self) -> bool {
        is_effect_active(self.id)
    }

    /// A monotonically increasing id unique to this effect.
    pub fn uid(&self) -> u64 {
        effect_uid(self.id)
    }

    pub(crate) fn id(&self) -> EffectId {
        self.id
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        // Child effects belong to the parent that created them; the parent
        // destroys them when it re-runs or drops.
        if parent_of(self.id).is_some() {
            return;
        }
        destroy_children(self.id);
        stop_effect(self.id);
        remove_record(self.id);
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Effect(#{})", self.uid())
    }
}

/// Create and immediately run an effect. Shorthand for [`Effect::new`].
pub fn effect<F>(f: F) -> Effect
where
    F: FnMut() + Send + 'static,
{
    Effect::new(f)
}

/// Stop a runner. Shorthand for [`Effect::stop`].
pub fn stop(runner: &Effect) {
    runner.stop();
}

/// Run `f` with dependency tracking paused: reads inside do not subscribe
/// the surrounding effect.
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = PauseGuard::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn effect_runs_eagerly_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let _e = Effect::new(move || {
            runs2.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn lazy_effect_waits_for_first_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let e = Effect::with_options(
            move || {
                runs2.fetch_add(1, Ordering::Relaxed);
                Value::Null
            },
            EffectOptions {
                lazy: true,
                ..Default::default()
            },
        );
        assert_eq!(runs.load(Ordering::Relaxed), 0);
        e.run();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn run_returns_the_function_result() {
        let e = Effect::with_options(
            || Value::Int(7),
            EffectOptions {
                lazy: true,
                ..Default::default()
            },
        );
        assert_eq!(e.run(), Value::Int(7));
    }

    #[test]
    fn stopped_effect_without_scheduler_falls_through_to_raw() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let e = Effect::with_options(
            move || {
                runs2.fetch_add(1, Ordering::Relaxed);
                Value::Int(3)
            },
            EffectOptions::default(),
        );
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        e.stop();
        assert_eq!(e.run(), Value::Int(3));
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn stopped_effect_with_scheduler_returns_nothing() {
        let e = Effect::with_options(
            || Value::Int(3),
            EffectOptions {
                scheduler: Some(Arc::new(|_| {})),
                lazy: true,
                ..Default::default()
            },
        );
        e.stop();
        assert_eq!(e.run(), Value::Null);
    }

    #[test]
    fn stop_is_idempotent_and_fires_on_stop_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let stops2 = stops.clone();
        let e = Effect::with_options(
            || Value::Null,
            EffectOptions {
                lazy: true,
                on_stop: Some(Box::new(move || {
                    stops2.fetch_add(1, Ordering::Relaxed);
                })),
                ..Default::default()
            },
        );
        e.stop();
        e.stop();
        assert_eq!(stops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn uids_are_monotonic() {
        let a = Effect::with_options(
            || Value::Null,
            EffectOptions {
                lazy: true,
                ..Default::default()
            },
        );
        let b = Effect::with_options(
            || Value::Null,
            EffectOptions {
                lazy: true,
                ..Default::default()
            },
        );
        assert!(b.uid() > a.uid());
    }

    #[test]
    fn untracked_restores_tracking_state() {
        assert!(crate::dep::is_tracking());
        let out = untracked(|| {
            assert!(!crate::dep::is_tracking());
            11
        });
        assert_eq!(out, 11);
        assert!(crate::dep::is_tracking());
    }

    #[test]
    fn function_survives_a_panicking_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let e = Effect::with_options(
            move || {
                let n = runs2.fetch_add(1, Ordering::Relaxed);
                if n == 0 {
                    panic!("first run fails");
                }
                Value::Null
            },
            EffectOptions {
                lazy: true,
                ..Default::default()
            },
        );
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| e.run()));
        assert!(result.is_err());
        // The raw function was restored by the guard; the next run works.
        e.run();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }
}
