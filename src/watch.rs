//! Watchers: effect + scheduler + callback pipelines over a source.
//!
//! [`watch`] observes a source (ref, reactive value, getter, or a list of
//! those) and invokes a callback with `(new, old)` when it changes;
//! [`watch_effect`] just re-runs a function whose reads are its sources.
//! Both funnel into one builder: a lazy effect over the synthesized getter,
//! a job that diffs and fires the callback, and a scheduler that routes the
//! job per the flush mode (synchronously, or through the pre/post queues).

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use foldhash::fast::FixedState;

use crate::dep::DebugHook;
use crate::effect::{Effect, EffectId, EffectOptions, Scheduler};
use crate::errors::{call_with_error_handling, CallbackKind};
use crate::proxy::{dev_warn, Proxy, ProxyTarget};
use crate::reference::Ref;
use crate::scheduler::{queue_post_flush, queue_pre_flush, Job};
use crate::value::{same_value, Value};

/// What a watcher observes.
pub enum WatchSource {
    /// A ref cell; the watched value is `ref.get()`.
    Ref(Ref),
    /// A reactive value, traversed deeply on every run.
    Reactive(Proxy),
    /// An arbitrary getter.
    Getter(Box<dyn FnMut() -> Value + Send>),
    /// Several sources watched together; the callback sees an array of
    /// their values, compared element-wise.
    Multi(Vec<WatchSource>),
}

impl WatchSource {
    /// Watch the result of a getter function.
    pub fn getter<F>(f: F) -> WatchSource
    where
        F: FnMut() -> Value + Send + 'static,
    {
        WatchSource::Getter(Box::new(f))
    }
}

impl From<Ref> for WatchSource {
    fn from(r: Ref) -> Self {
        WatchSource::Ref(r)
    }
}

impl From<Proxy> for WatchSource {
    fn from(p: Proxy) -> Self {
        WatchSource::Reactive(p)
    }
}

impl From<Vec<WatchSource>> for WatchSource {
    fn from(sources: Vec<WatchSource>) -> Self {
        WatchSource::Multi(sources)
    }
}

/// When a watcher's job runs relative to the write that triggered it.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum FlushMode {
    /// Enqueue on the pre-flush queue (the default).
    #[default]
    Pre,
    /// Enqueue on the post-flush queue, behind every pre job.
    Post,
    /// Run inside the trigger, synchronously.
    Sync,
}

/// Options for [`watch`] / [`watch_effect`].
#[derive(Default)]
pub struct WatchOptions {
    /// Fire the callback once on creation, with `old == None`.
    pub immediate: bool,
    /// Traverse the watched value so any nested change fires.
    pub deep: bool,
    /// Scheduling of the watcher job.
    pub flush: FlushMode,
    /// Debug hook for dependency subscription (debug builds).
    pub on_track: Option<DebugHook>,
    /// Debug hook for invalidation (debug builds).
    pub on_trigger: Option<DebugHook>,
}

/// Registrar handed to watch callbacks; a registered hook runs before the
/// next callback invocation and when the watcher stops. Use it to abort
/// in-flight work that the new change supersedes.
#[derive(Default)]
pub struct Cleanup {
    hook: Option<Box<dyn FnOnce() + Send>>,
}

impl Cleanup {
    /// Register the invalidation hook for this run.
    pub fn register<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hook = Some(Box::new(f));
    }
}

type CleanupSlot = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;
type BoxedWatchCb = Box<dyn FnMut(Value, Option<Value>, &mut Cleanup) + Send>;

/// Stop handle for a watcher. Stopping (or dropping the handle at top
/// level) unsubscribes the underlying effect and runs any pending
/// invalidation hook.
pub struct WatchHandle {
    effect: Effect,
}

impl WatchHandle {
    /// Stop the watcher. Idempotent.
    pub fn stop(&self) {
        self.effect.stop();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WatchHandle({:?})", self.effect)
    }
}

/// Watch a source and invoke `cb(new, old, cleanup)` when it changes.
///
/// `old` is `None` on the first invocation. Reactive sources imply `deep`.
/// With `immediate`, the callback fires once right away; otherwise the
/// first run only seeds the old value.
pub fn watch<S, C>(source: S, cb: C, options: WatchOptions) -> WatchHandle
where
    S: Into<WatchSource>,
    C: FnMut(Value, Option<Value>, &mut Cleanup) + Send + 'static,
{
    let source = source.into();
    let mut deep = options.deep;
    // Ref sources and reactive multi elements always fire: their watched
    // value compares identical to itself across runs.
    let is_ref_source = matches!(source, WatchSource::Ref(_));
    let has_reactive_element = matches!(
        &source,
        WatchSource::Multi(list) if list.iter().any(|s| matches!(s, WatchSource::Reactive(_)))
    );
    let mut is_multi = false;

    let base: Box<dyn FnMut() -> Value + Send> = match source {
        WatchSource::Ref(r) => Box::new(move || r.get()),
        WatchSource::Reactive(p) => {
            deep = true;
            Box::new(move || Value::Proxy(p.clone()))
        }
        WatchSource::Getter(mut g) => Box::new(move || {
            call_with_error_handling(CallbackKind::WatchGetter, || g()).unwrap_or(Value::Null)
        }),
        WatchSource::Multi(mut sources) => {
            is_multi = true;
            Box::new(move || {
                let values: Vec<Value> = sources
                    .iter_mut()
                    .map(|s| match s {
                        WatchSource::Ref(r) => r.get(),
                        WatchSource::Reactive(p) => {
                            let v = Value::Proxy(p.clone());
                            traverse(&v);
                            v
                        }
                        WatchSource::Getter(g) => {
                            call_with_error_handling(CallbackKind::WatchGetter, || g())
                                .unwrap_or(Value::Null)
                        }
                        WatchSource::Multi(_) => {
                            dev_warn("nested multi watch sources are not supported");
                            Value::Null
                        }
                    })
                    .collect();
                Value::array_from(values)
            })
        }
    };

    let getter: Box<dyn FnMut() -> Value + Send> = if deep {
        let mut base = base;
        Box::new(move || {
            let v = base();
            traverse(&v);
            v
        })
    } else {
        base
    };

    let force_trigger = deep || is_ref_source || has_reactive_element;
    let cleanup_slot: CleanupSlot = Arc::new(Mutex::new(None));
    build_watcher(
        getter,
        Some(Box::new(cb)),
        force_trigger,
        is_multi,
        options,
        cleanup_slot,
    )
}

/// Run `f` immediately and again whenever anything it read changes. The
/// registrar argument carries the invalidation hook, run before each
/// re-run and on stop.
pub fn watch_effect<F>(f: F, options: WatchOptions) -> WatchHandle
where
    F: FnMut(&mut Cleanup) + Send + 'static,
{
    if options.immediate || options.deep {
        dev_warn("watch_effect ignores the immediate and deep options");
    }
    let cleanup_slot: CleanupSlot = Arc::new(Mutex::new(None));
    let slot = cleanup_slot.clone();
    let mut f = f;
    let getter: Box<dyn FnMut() -> Value + Send> = Box::new(move || {
        if let Some(hook) = slot.lock().take() {
            call_with_error_handling(CallbackKind::WatchCleanup, hook);
        }
        let mut registrar = Cleanup::default();
        call_with_error_handling(CallbackKind::WatchCallback, || f(&mut registrar));
        *slot.lock() = registrar.hook;
        Value::Null
    });
    build_watcher(getter, None, false, false, options, cleanup_slot)
}

fn build_watcher(
    getter: Box<dyn FnMut() -> Value + Send>,
    cb: Option<BoxedWatchCb>,
    force_trigger: bool,
    is_multi: bool,
    options: WatchOptions,
    cleanup_slot: CleanupSlot,
) -> WatchHandle {
    let effect_cell: Arc<OnceLock<EffectId>> = Arc::new(OnceLock::new());
    let old_value: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let cb = cb.map(|c| Arc::new(Mutex::new(c)));
    let has_cb = cb.is_some();

    let job: Job = {
        let effect_cell = effect_cell.clone();
        let old_value = old_value.clone();
        let cleanup_slot = cleanup_slot.clone();
        Arc::new(move || {
            let Some(id) = effect_cell.get().copied() else {
                return;
            };
            if !crate::effect::is_effect_active(id) {
                return;
            }
            match &cb {
                Some(cb) => {
                    let new_value = crate::effect::run_effect(id);
                    let should_fire = force_trigger
                        || match &*old_value.lock() {
                            None => true,
                            Some(old) => watch_changed(&new_value, old, is_multi),
                        };
                    if !should_fire {
                        cov_mark::hit!(watch_job_skipped_unchanged);
                        return;
                    }
                    if let Some(hook) = cleanup_slot.lock().take() {
                        call_with_error_handling(CallbackKind::WatchCleanup, hook);
                    }
                    let previous = old_value.lock().replace(new_value.clone());
                    let mut registrar = Cleanup::default();
                    call_with_error_handling(CallbackKind::WatchCallback, || {
                        let mut cb = cb.lock();
                        (*cb)(new_value.clone(), previous, &mut registrar);
                    });
                    *cleanup_slot.lock() = registrar.hook;
                }
                None => {
                    crate::effect::run_effect(id);
                }
            }
        })
    };

    let flush = options.flush;
    let scheduler: Scheduler = match flush {
        FlushMode::Sync => {
            let job = job.clone();
            Arc::new(move |_id| job())
        }
        FlushMode::Pre => {
            let job = job.clone();
            Arc::new(move |id| {
                queue_pre_flush(crate::effect::effect_uid(id), job.clone());
            })
        }
        FlushMode::Post => {
            let job = job.clone();
            Arc::new(move |id| {
                queue_post_flush(crate::effect::effect_uid(id), job.clone());
            })
        }
    };

    let on_stop = {
        let cleanup_slot = cleanup_slot.clone();
        Box::new(move || {
            if let Some(hook) = cleanup_slot.lock().take() {
                call_with_error_handling(CallbackKind::WatchCleanup, hook);
            }
        })
    };

    let effect = Effect::with_options(
        getter,
        EffectOptions {
            lazy: true,
            scheduler: Some(scheduler),
            on_track: options.on_track,
            on_trigger: options.on_trigger,
            on_stop: Some(on_stop),
            ..Default::default()
        },
    );
    let _ = effect_cell.set(effect.id());

    if has_cb {
        if options.immediate {
            job();
        } else {
            *old_value.lock() = Some(effect.run());
        }
    } else if flush == FlushMode::Post {
        let id = effect.id();
        queue_post_flush(
            effect.uid(),
            Arc::new(move || {
                crate::effect::run_effect(id);
            }),
        );
    } else {
        effect.run();
    }

    WatchHandle { effect }
}

fn watch_changed(new: &Value, old: &Value, is_multi: bool) -> bool {
    if is_multi {
        if let (Value::Arr(n), Value::Arr(o)) = (new, old) {
            let n = n.0.elems.read();
            let o = o.0.elems.read();
            if n.len() != o.len() {
                return true;
            }
            return n.iter().zip(o.iter()).any(|(a, b)| !same_value(a, b));
        }
    }
    !same_value(new, old)
}

/// Read every nested value reachable from `v`, subscribing the running
/// effect to all of it. Cycles terminate through the identity `seen` set.
pub(crate) fn traverse(v: &Value) {
    let mut seen: HashSet<u64, FixedState> = HashSet::with_hasher(FixedState::default());
    traverse_inner(v, &mut seen);
}

fn traverse_inner(v: &Value, seen: &mut HashSet<u64, FixedState>) {
    match v {
        Value::Ref(r) => {
            if seen.insert(r.meta_id()) {
                traverse_inner(&r.get(), seen);
            }
        }
        Value::Proxy(p) => {
            if !seen.insert(p.target_meta().id.get()) {
                return;
            }
            match &p.target {
                ProxyTarget::Obj(_) => {
                    for key in p.keys() {
                        traverse_inner(&p.get(key), seen);
                    }
                }
                ProxyTarget::Arr(_) => {
                    let len = p.len();
                    for i in 0..len {
                        traverse_inner(&p.get(i), seen);
                    }
                }
                ProxyTarget::Map(_) => {
                    for key in p.map_keys() {
                        traverse_inner(&p.entry_get(key), seen);
                    }
                }
            }
        }
        // Raw targets recurse without tracking; nested refs still count.
        Value::Obj(o) => {
            if seen.insert(o.id().get()) {
                let slots: Vec<Value> = o.0.slots.read().values().cloned().collect();
                for slot in slots {
                    traverse_inner(&slot, seen);
                }
            }
        }
        Value::Arr(a) => {
            if seen.insert(a.id().get()) {
                let elems: Vec<Value> = a.0.elems.read().clone();
                for elem in elems {
                    traverse_inner(&elem, seen);
                }
            }
        }
        Value::Map(m) => {
            if seen.insert(m.id().get()) {
                let entries: Vec<Value> = m.0.entries.read().values().cloned().collect();
                for entry in entries {
                    traverse_inner(&entry, seen);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::reactive;
    use crate::reference::Ref;
    use crate::scheduler::{flush_jobs, FLUSH_TEST_LOCK};
    use std::sync::atomic::{AtomicI64, Ordering};

    fn sync_options() -> WatchOptions {
        WatchOptions {
            flush: FlushMode::Sync,
            ..Default::default()
        }
    }

    fn reactive_obj(n: i64) -> Proxy {
        let Value::Proxy(p) = reactive(Value::object_from(vec![("n", Value::Int(n))])) else {
            unreachable!()
        };
        p
    }

    #[test]
    fn ref_watcher_sees_new_and_old() {
        let r = Ref::new(1i64);
        let pairs = Arc::new(Mutex::new(Vec::new()));
        let pairs2 = pairs.clone();
        let _w = watch(
            r.clone(),
            move |new, old, _cleanup| {
                pairs2.lock().push((new, old));
            },
            sync_options(),
        );
        assert!(pairs.lock().is_empty());
        r.set(2i64);
        r.set(3i64);
        let got = pairs.lock();
        assert_eq!(
            &*got,
            &[
                (Value::Int(2), Some(Value::Int(1))),
                (Value::Int(3), Some(Value::Int(2)))
            ]
        );
    }

    #[test]
    fn immediate_fires_with_no_old_value() {
        let r = Ref::new(5i64);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        let _w = watch(
            r,
            move |new, old, _cleanup| {
                calls2.lock().push((new, old));
            },
            WatchOptions {
                immediate: true,
                flush: FlushMode::Sync,
                ..Default::default()
            },
        );
        assert_eq!(&*calls.lock(), &[(Value::Int(5), None)]);
    }

    #[test]
    fn getter_watcher_skips_unchanged_results() {
        cov_mark::check!(watch_job_skipped_unchanged);
        let o = reactive_obj(0);
        let o2 = o.clone();
        let calls = Arc::new(AtomicI64::new(0));
        let calls2 = calls.clone();
        let _w = watch(
            WatchSource::getter(move || Value::Int(o2.get("n").as_int().unwrap() / 2)),
            move |_new, _old, _cleanup| {
                calls2.fetch_add(1, Ordering::Relaxed);
            },
            sync_options(),
        );
        // 0 -> 1 changes the source but not the halved result.
        o.set("n", 1i64);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        o.set("n", 4i64);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn deep_watcher_sees_nested_writes() {
        let inner = Value::object_from(vec![("x", Value::Int(1))]);
        let Value::Proxy(p) = reactive(Value::object_from(vec![("inner", inner)])) else {
            unreachable!()
        };
        let calls = Arc::new(AtomicI64::new(0));
        let calls2 = calls.clone();
        let _w = watch(
            p.clone(),
            move |_new, _old, _cleanup| {
                calls2.fetch_add(1, Ordering::Relaxed);
            },
            sync_options(),
        );
        let Value::Proxy(inner) = p.get("inner") else {
            unreachable!()
        };
        inner.set("x", 2i64);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn multi_source_compares_element_wise() {
        let a = Ref::new(1i64);
        let b = Ref::new(10i64);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _w = watch(
            vec![WatchSource::from(a.clone()), WatchSource::from(b.clone())],
            move |new, _old, _cleanup| {
                let Value::Arr(arr) = new else { panic!("expected array of values") };
                seen2.lock().push(arr.0.elems.read().clone());
            },
            sync_options(),
        );
        a.set(2i64);
        assert_eq!(&*seen.lock(), &[vec![Value::Int(2), Value::Int(10)]]);
        b.set(20i64);
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn pre_flush_watchers_batch_until_flushed() {
        let _serial = FLUSH_TEST_LOCK.lock();
        let r = Ref::new(1i64);
        let calls = Arc::new(AtomicI64::new(0));
        let calls2 = calls.clone();
        let _w = watch(
            r.clone(),
            move |_new, _old, _cleanup| {
                calls2.fetch_add(1, Ordering::Relaxed);
            },
            WatchOptions::default(),
        );
        r.set(2i64);
        r.set(3i64);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        flush_jobs();
        // Two writes dedup into one queued job.
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn watch_effect_tracks_its_reads() {
        let o = reactive_obj(1);
        let o2 = o.clone();
        let seen = Arc::new(AtomicI64::new(0));
        let seen2 = seen.clone();
        let _w = watch_effect(
            move |_cleanup| {
                seen2.store(o2.get("n").as_int().unwrap(), Ordering::Relaxed);
            },
            sync_options(),
        );
        assert_eq!(seen.load(Ordering::Relaxed), 1);
        o.set("n", 7i64);
        assert_eq!(seen.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn cleanup_runs_before_next_callback_and_on_stop() {
        let r = Ref::new(1i64);
        let cleanups = Arc::new(AtomicI64::new(0));
        let cleanups2 = cleanups.clone();
        let w = watch(
            r.clone(),
            move |_new, _old, cleanup| {
                let counter = cleanups2.clone();
                cleanup.register(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            },
            sync_options(),
        );
        r.set(2i64);
        assert_eq!(cleanups.load(Ordering::Relaxed), 0);
        r.set(3i64);
        assert_eq!(cleanups.load(Ordering::Relaxed), 1);
        w.stop();
        assert_eq!(cleanups.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn stopped_watcher_ignores_further_writes() {
        let r = Ref::new(1i64);
        let calls = Arc::new(AtomicI64::new(0));
        let calls2 = calls.clone();
        let w = watch(
            r.clone(),
            move |_new, _old, _cleanup| {
                calls2.fetch_add(1, Ordering::Relaxed);
            },
            sync_options(),
        );
        r.set(2i64);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        w.stop();
        r.set(3i64);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn traverse_terminates_on_cycles() {
        let Value::Proxy(p) = reactive(Value::object()) else {
            unreachable!()
        };
        // A self-referential object must not hang the traversal.
        p.set("me", p.raw_value());
        let calls = Arc::new(AtomicI64::new(0));
        let calls2 = calls.clone();
        let _w = watch(
            p.clone(),
            move |_new, _old, _cleanup| {
                calls2.fetch_add(1, Ordering::Relaxed);
            },
            sync_options(),
        );
        p.set("other", 1i64);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
