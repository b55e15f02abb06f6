// Dep arena - the subscriber half of the access record store
//
// TARGET_DEPS maps a raw target to its per-key subscriber sets:
//
//   Target -> Key -> {EffectId, ...}   (registration order preserved)
//
// The other half of an access record, the operation kind and the value the
// computation observed, lives with the observing computation (see
// EffectMetadata::accesses). Keeping observations per computation means each
// view validates against what *it* saw, even when two computations read the
// same key at different times.
//
// track() fills both halves; trigger() reads this one and hands the matched
// subscribers to the effect arena for dispatch.

use papaya::HashMap as PapayaHashMap;
use parking_lot::RwLock;
use std::sync::LazyLock;

use super::effect_arena::{active_effect, notify_subscribers};
use super::{EffectId, Target};
use crate::hash::{FastIndexMap, FastIndexSet};
use crate::value::{Key, Value};

type KeyDeps = FastIndexMap<Key, FastIndexSet<EffectId>>;

static TARGET_DEPS: LazyLock<PapayaHashMap<Target, RwLock<KeyDeps>>> =
    LazyLock::new(PapayaHashMap::new);

/// How a key was read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TrackOp {
    Get,
    Has,
    Iterate,
}

/// How a key was written.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TriggerOp {
    /// A key that did not exist was created.
    Add,
    /// An existing key changed value.
    Set,
    /// An existing key was removed.
    Delete,
    /// A sequence mutator reshaped the target; every subscriber is notified.
    Modified,
}

/// What a computation saw when it read a key, kept for validation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Observed {
    /// GET: the value read (sequence enumeration records its length here).
    Value(Value),
    /// HAS: whether the key was present.
    Present(bool),
    /// ITERATE over a record: the key list.
    Keys(Vec<Key>),
}

impl Observed {
    pub fn op(&self) -> TrackOp {
        match self {
            Observed::Value(_) => TrackOp::Get,
            Observed::Present(_) => TrackOp::Has,
            Observed::Keys(_) => TrackOp::Iterate,
        }
    }
}

/// Record a read of `key` on `target` against the running computation.
///
/// No-op when nothing is running, tracking is paused, or the key is one that
/// is never tracked.
pub(crate) fn track(target: Target, key: Key, observed: Observed) {
    if key.is_non_trackable() {
        return;
    }
    let Some(effect_id) = active_effect() else {
        return;
    };
    tracing::trace!(?effect_id, ?target, %key, op = ?observed.op(), "track");
    add_subscriber(target, key.clone(), effect_id);
    effect_id.record_access(target, key, observed);
}

/// Notify the subscribers of a write to `key` on `target`.
pub(crate) fn trigger(
    target: Target,
    op: TriggerOp,
    key: Key,
    new_value: Option<&Value>,
    old_value: Option<&Value>,
) {
    trigger_keys(target, op, std::slice::from_ref(&key), new_value, old_value);
}

/// Notify the subscribers of a write touching several keys at once (a
/// length change drops a whole tail of indices in one step).
pub(crate) fn trigger_keys(
    target: Target,
    op: TriggerOp,
    keys: &[Key],
    new_value: Option<&Value>,
    old_value: Option<&Value>,
) {
    let subscribers = match op {
        TriggerOp::Modified => all_subscribers(target),
        TriggerOp::Set => subscribers_of(target, keys),
        TriggerOp::Add | TriggerOp::Delete => {
            let mut keys = keys.to_vec();
            if let Some(sentinel) = target.with(|node| node.enumeration_key()) {
                keys.push(sentinel);
            }
            subscribers_of(target, &keys)
        }
    };

    tracing::trace!(
        ?target,
        ?op,
        ?keys,
        ?new_value,
        ?old_value,
        subscribers = subscribers.len(),
        "trigger"
    );

    if !subscribers.is_empty() {
        notify_subscribers(subscribers);
    }
}

/// Subscribe an effect to `(target, key)`.
pub(crate) fn add_subscriber(target: Target, key: Key, effect_id: EffectId) {
    let guard = TARGET_DEPS.pin();
    guard
        .get_or_insert_with(target, || RwLock::new(KeyDeps::default()))
        .write()
        .entry(key)
        .or_default()
        .insert(effect_id);
}

/// Unsubscribe an effect from `(target, key)`, dropping empty sets.
pub(crate) fn remove_subscriber(target: Target, key: &Key, effect_id: EffectId) {
    let guard = TARGET_DEPS.pin();
    if let Some(deps) = guard.get(&target) {
        let mut deps = deps.write();
        if let Some(set) = deps.get_mut(key) {
            set.shift_remove(&effect_id);
            if set.is_empty() {
                deps.shift_remove(key);
            }
        }
    }
}

/// Whether `effect_id` is currently subscribed to `(target, key)`.
pub(crate) fn is_subscribed(target: Target, key: &Key, effect_id: EffectId) -> bool {
    let guard = TARGET_DEPS.pin();
    guard
        .get(&target)
        .is_some_and(|deps| deps.read().get(key).is_some_and(|set| set.contains(&effect_id)))
}

/// Union of the subscribers of `keys`, in registration order per key.
fn subscribers_of(target: Target, keys: &[Key]) -> FastIndexSet<EffectId> {
    let guard = TARGET_DEPS.pin();
    let mut out = FastIndexSet::default();
    if let Some(deps) = guard.get(&target) {
        let deps = deps.read();
        for key in keys {
            if let Some(set) = deps.get(key) {
                out.extend(set.iter().copied());
            }
        }
    }
    out
}

/// Every subscriber recorded against `target`, whatever the key.
fn all_subscribers(target: Target) -> FastIndexSet<EffectId> {
    let guard = TARGET_DEPS.pin();
    let mut out = FastIndexSet::default();
    if let Some(deps) = guard.get(&target) {
        for set in deps.read().values() {
            out.extend(set.iter().copied());
        }
    }
    out
}

/// Forget every subscriber set of a target (used on disposal).
pub(crate) fn purge_target(target: Target) {
    let guard = TARGET_DEPS.pin();
    guard.remove(&target);
}
