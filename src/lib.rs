#![deny(missing_docs)]

//! Fine-grained reactive state tracking over plain nested data.
//!
//! Data lives in raw targets (records and sequences). Reading and writing
//! through a tracked handle lets the runtime discover which computations
//! depend on which keys, re-run only the computations a write affects, and
//! re-validate cached derived values without necessarily recomputing them.
//!
//! # Quick Start
//!
//! ```ignore
//! use reactivity::{Effect, EffectScope, Target, View, reactive};
//!
//! let state = reactive(Target::record([("num", 0)]));
//!
//! let scope = EffectScope::new();
//! let (a, b) = scope
//!     .run(|| {
//!         let a = View::new({
//!             let state = state.clone();
//!             move || state.get("num").as_f64().unwrap_or(0.0)
//!         });
//!         let b = View::new({
//!             let a = a.clone();
//!             move || a.value() * 2.0
//!         });
//!         (a, b)
//!     })
//!     .unwrap();
//!
//! state.set("num", 7)?;
//! assert_eq!((a.value(), b.value()), (7.0, 14.0));
//!
//! scope.stop();
//! state.set("num", 6)?;
//! assert_eq!((a.value(), b.value()), (7.0, 14.0)); // no longer tracked
//! ```
//!
//! # Core Types
//!
//! - [`Target`] - Identity of a raw record or sequence.
//! - [`Reactive`] - Tracked handle over a target, in one of four [`Variant`]s.
//! - [`Effect`] - Computation that re-runs synchronously when what it read changes.
//! - [`View<T>`] - Lazily computed, cached value with non-recomputing validation.
//! - [`EffectScope`] - Owner of computations and child scopes, stopped together.
//! - [`MutationPass`] - Copy-on-write staging area for isolated batched writes.
//!
//! # Handles
//!
//! ```ignore
//! let list = reactive(Target::sequence([1, 2, 3]));
//! list.get(0usize);          // tracked read
//! list.set(0usize, 10)?;     // triggers readers of index 0
//! list.push(4)?;             // length-altering, tracked paused, one trigger
//! readonly(target).set("a", 1); // Err(ReactiveError::ReadOnly { .. })
//! ```
//!
//! # Tracking control
//!
//! ```ignore
//! untracked(|| state.get("a"));  // read without a dependency
//! pause_tracking();              // ...until reset_tracking()
//! on_scope_dispose(|| { ... });  // cleanup when the running scope stops
//! ```

// Internal modules
pub(crate) mod arena;
mod draft;
mod effect;
mod error;
mod hash;
mod reactive;
mod registry;
mod scope;
mod value;
mod view;

// Core types
pub use arena::target_arena::Target;
pub use draft::MutationPass;
pub use effect::Effect;
pub use error::ReactiveError;
pub use reactive::{Item, Reactive};
pub use registry::Variant;
pub use scope::EffectScope;
pub use value::{Key, Value};
pub use view::{View, ViewInvalidator};

// Key functions
pub use effect::{enable_tracking, pause_tracking, reset_tracking, untracked};
pub use registry::{reactive, readonly, shallow_reactive, shallow_readonly};
pub use scope::{current_scope, on_scope_dispose};
pub use value::{has_changed, to_raw};
