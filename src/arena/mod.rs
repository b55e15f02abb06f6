// Arena-based storage for the engine's global state
//
// This module provides four stores:
// - Target arena: raw records and sequences, addressed by Target
// - Dep arena: per-target, per-key subscriber sets (plus track/trigger)
// - Effect arena: EffectMetadata for effects, views and mutation passes
// - Scope arena: the scope ownership tree
//
// All of them are global statics behind locks or lock-free maps. Ids are
// lightweight Copy handles; stale ids resolve to nothing.

pub mod dep_arena;
pub mod effect_arena;
pub mod scope_arena;
pub mod target_arena;

pub(crate) use dep_arena::{Observed, TriggerOp, is_subscribed, track, trigger, trigger_keys};

pub(crate) use effect_arena::{
    CurrentEffectGuard, EffectId, EffectMetadata, PassGuard, ReactiveState, TrackingPause,
    active_effect, effect_arena_insert, effect_arena_remove, notify_subscribers,
    pop_should_track, producers_on_stack, push_should_track,
};

pub(crate) use scope_arena::{
    ActiveScopeGuard, ScopeId, active_scope, record_effect_scope, scope_arena_insert,
};

pub(crate) use target_arena::{Node, Target};
