#![deny(missing_docs)]

//! Fine-grained reactive runtime for dynamic values.
//!
//! trellis tracks which computations read which `(target, key)` pairs and
//! re-runs exactly those computations when the data changes. Data lives in
//! a dynamic [`Value`] model: objects, arrays, and maps are identity-bearing
//! targets, and a [`reactive`] view intercepts reads and writes on them.
//!
//! # Quick start
//!
//! ```ignore
//! use trellis::{effect, reactive, Value};
//!
//! let state = reactive(Value::object_from([("count", 0i64)]));
//! let Value::Proxy(state) = state else { unreachable!() };
//!
//! // Runs now, and again on every write to `count`.
//! let render = effect({
//!     let state = state.clone();
//!     move || println!("count = {:?}", state.get("count"))
//! });
//!
//! state.set("count", 1i64); // re-runs the effect
//! state.set("count", 1i64); // equal value: no re-run
//! # drop(render);
//! ```
//!
//! # Pieces
//!
//! - [`reactive`] / [`readonly`] / [`shallow_reactive`] / [`shallow_readonly`]
//!   wrap a target in a tracked [`Proxy`] view. [`to_raw`] unwraps,
//!   [`mark_raw`] opts a target out.
//! - [`Ref`] is a single-slot cell; [`computed`] a lazy memoized one;
//!   [`watch`] / [`watch_effect`] build callback pipelines with `pre`,
//!   `post`, or `sync` flush timing over the scheduler queues
//!   ([`flush_jobs`]).
//! - [`effect`] is the raw building block the rest composes:
//!   run-and-subscribe, cleanup-before-rerun, [`stop`] to cancel.
//! - [`pause_tracking`] / [`enable_tracking`] / [`reset_tracking`] scope
//!   dependency collection; [`untracked`] is the closure form.
//!
//! Effects, the tracking stack, and the flush queues are process-wide, the
//! way a single reactive graph wants to be shared; the current-effect
//! context is per thread.

mod collections;
mod computed;
mod dep;
mod effect;
mod errors;
mod proxy;
mod reference;
mod scheduler;
mod value;
mod watch;

pub use computed::{computed, computed_with_setter};
pub use dep::{
    enable_tracking, is_tracking, pause_tracking, reset_tracking, DebugEvent, DebugHook, DebugOp,
    Key, TrackOp, TriggerOp, ITERATE_KEY, MAP_KEY_ITERATE_KEY,
};
pub use effect::{effect, stop, untracked, Effect, EffectId, EffectOptions, Scheduler, StopHook};
pub use errors::{
    call_with_error_handling, set_error_handler, CallbackError, CallbackKind, ErrorHandler,
};
pub use proxy::{
    is_proxy, is_reactive, is_readonly, mark_raw, reactive, readonly, shallow_reactive,
    shallow_readonly, to_raw, Proxy,
};
pub use reference::{
    custom_ref, is_ref, proxy_refs, shallow_ref, to_ref, to_refs, trigger_ref, unref,
    CustomRefFns, Ref, RefHooks,
};
pub use scheduler::{
    flush_jobs, is_flush_scheduled, queue_post_flush, queue_pre_flush, schedule_flush,
    spawn_flush_loop, FlushLoop, Job, DEFAULT_DEBOUNCE, DEFAULT_MAX_DEBOUNCE,
};
pub use value::{same_value, ArrRef, MapKey, MapRef, ObjRef, TargetId, Value};
pub use watch::{watch, watch_effect, Cleanup, FlushMode, WatchHandle, WatchOptions, WatchSource};
