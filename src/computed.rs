//! Lazy, dirty-flag-driven memoized values.
//!
//! A computed is a two-layer composition: a lazy effect subscribes to
//! whatever the getter reads and invalidates the cache through its
//! scheduler, while the cell's own `(self, ValueSlot)` dep propagates the
//! invalidation to whoever reads the computed. That split is what makes
//! chains of computeds memoize: each layer re-runs at most once per
//! upstream change, and only when actually read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::dep::{track, trigger, Key, TrackOp, TriggerOp};
use crate::effect::{Effect, EffectOptions, Scheduler};
use crate::proxy::dev_warn;
use crate::reference::{Ref, RefInner, RefKind};
use crate::value::{TargetKind, TargetMeta, Value};

type SetterFn = Box<dyn FnMut(Value) + Send>;

/// State behind a computed ref: the lazy getter effect, the dirty flag,
/// and the cached value. The cache is valid iff the flag is clear.
pub(crate) struct ComputedCore {
    effect: Effect,
    dirty: AtomicBool,
    value: RwLock<Value>,
    setter: Option<Mutex<SetterFn>>,
}

impl ComputedCore {
    pub(crate) fn get(&self, meta: &TargetMeta) -> Value {
        if self.dirty.load(Ordering::Acquire) {
            let fresh = self.effect.run();
            *self.value.write() = fresh;
            self.dirty.store(false, Ordering::Release);
        }
        track(meta, TrackOp::Get, Key::ValueSlot);
        self.value.read().clone()
    }

    pub(crate) fn set(&self, value: Value) {
        match &self.setter {
            Some(setter) => {
                let mut setter = setter.lock();
                (*setter)(value);
            }
            None => dev_warn("write on a readonly computed has no effect"),
        }
    }
}

fn build<F>(getter: F, setter: Option<SetterFn>) -> Ref
where
    F: FnMut() -> Value + Send + 'static,
{
    let inner = Arc::new_cyclic(|weak: &Weak<RefInner>| {
        let weak = weak.clone();
        let scheduler: Scheduler = Arc::new(move |_id| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let RefKind::Computed(core) = &inner.kind else {
                return;
            };
            // First invalidation only: the cache is already stale after
            // that, and re-notifying would re-run readers for nothing.
            if !core.dirty.swap(true, Ordering::AcqRel) {
                trigger(
                    &inner.meta,
                    TriggerOp::Set,
                    Some(Key::ValueSlot),
                    None,
                    None,
                    None,
                );
            }
        });
        let effect = Effect::with_options(
            getter,
            EffectOptions {
                lazy: true,
                scheduler: Some(scheduler),
                ..Default::default()
            },
        );
        RefInner {
            meta: TargetMeta::new(TargetKind::Cell),
            kind: RefKind::Computed(ComputedCore {
                effect,
                dirty: AtomicBool::new(true),
                value: RwLock::new(Value::Null),
                setter: setter.map(Mutex::new),
            }),
        }
    });
    Ref::from_inner(inner)
}

/// Create a readonly computed ref over a getter. The getter runs lazily,
/// on first read and after invalidation.
pub fn computed<F>(getter: F) -> Ref
where
    F: FnMut() -> Value + Send + 'static,
{
    build(getter, None)
}

/// Create a writable computed ref: reads memoize the getter, writes call
/// the setter.
pub fn computed_with_setter<F, S>(getter: F, setter: S) -> Ref
where
    F: FnMut() -> Value + Send + 'static,
    S: FnMut(Value) + Send + 'static,
{
    build(getter, Some(Box::new(setter)))
}
