use crate::arena::{
    CurrentEffectGuard, EffectId, EffectMetadata, ReactiveState, Target, TrackingPause,
    active_scope, effect_arena_insert, effect_arena_remove, is_subscribed, pop_should_track,
    push_should_track, record_effect_scope,
};
use crate::value::Key;

/// Run one computation: drop what its last run read, run the body with the
/// computation on top of the tracking stack, and rebuild its dependencies
/// from what the body reads this time.
///
/// A stopped computation still runs its body when asked, but untracked.
pub(crate) fn run_computation(effect_id: EffectId) {
    if effect_id.state() == ReactiveState::Stopped {
        let _pause = TrackingPause::new();
        effect_id.run_callback();
        return;
    }

    effect_id.clear_dependencies();

    // The guard restores the tracking stack even if the body panics.
    let guard = CurrentEffectGuard::new(effect_id);
    effect_id.run_callback();
    drop(guard);

    effect_id.finish_run();
}

/// Run a closure without tracking dependencies
///
/// Reads inside `f` are not recorded against the running computation.
///
/// # Example
/// ```ignore
/// let effect = Effect::new(move || {
///     // Tracked: the effect re-runs when `a` changes
///     let a = state.get("a");
///
///     // Not tracked: writes to `b` never re-run the effect
///     let b = untracked(|| state.get("b"));
/// });
/// ```
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _pause = TrackingPause::new();
    f()
}

/// Stop recording reads until the matching [`reset_tracking`].
pub fn pause_tracking() {
    push_should_track(false);
}

/// Record reads again until the matching [`reset_tracking`], even inside a
/// paused region.
pub fn enable_tracking() {
    push_should_track(true);
}

/// Undo the most recent [`pause_tracking`] or [`enable_tracking`].
pub fn reset_tracking() {
    pop_should_track();
}

/// Side-effectful computation that re-runs when what it read changes
///
/// An effect records every key it reads through a [`Reactive`](crate::Reactive)
/// handle. A write to any of those keys runs the body again, synchronously,
/// before the write returns. Each run starts from an empty dependency set, so
/// keys the previous run read but this one did not stop triggering it.
///
/// An effect created while an [`EffectScope`](crate::EffectScope) is running
/// belongs to that scope and is stopped with it. Dropping the handle of a
/// scope-owned effect leaves it running until the scope stops; dropping any
/// other effect stops it.
///
/// # Example
/// ```ignore
/// let state = reactive(Target::record([("volts", 12), ("amps", 2)]));
///
/// let effect = Effect::new({
///     let state = state.clone();
///     move || {
///         let p = state.get("volts").as_f64().unwrap_or(0.0)
///             * state.get("amps").as_f64().unwrap_or(0.0);
///         println!("Power: {p}");
///     }
/// });
///
/// state.set("amps", 3)?; // prints "Power: 36"
/// effect.stop();
/// state.set("amps", 4)?; // nothing
/// ```
pub struct Effect {
    /// Arena ID for this effect's metadata (callback, dependencies, hooks).
    /// This is the sole identifier for this effect.
    id: EffectId,
}

impl Effect {
    /// Create a new effect (runs immediately)
    ///
    /// The callback is stored directly in the arena, making Effect a thin wrapper.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let effect = Self::lazy(f);
        effect.run();
        effect
    }

    /// Create an effect that does not run until [`run`](Self::run) is called.
    pub fn lazy<F>(f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let id = effect_arena_insert(EffectMetadata::new_effect(Box::new(f)));
        if let Some(scope) = active_scope() {
            record_effect_scope(id, scope);
        }
        Self { id }
    }

    /// Run the body now, rebuilding dependencies.
    pub fn run(&self) {
        run_computation(self.id);
    }

    /// Stop reacting: unsubscribe from everything, run teardown hooks and
    /// leave the owning scope. Idempotent.
    pub fn stop(&self) {
        self.id.stop();
    }

    /// Register a hook that runs once when the effect stops (or is dropped).
    /// Ignored if the effect is already stopped.
    pub fn on_stop<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.id.push_on_stop(Box::new(hook));
    }

    /// Whether the effect still reacts to writes.
    pub fn is_active(&self) -> bool {
        self.id.state() != ReactiveState::Stopped
    }

    /// Number of keys and nested views the last run read.
    pub fn dependency_count(&self) -> usize {
        self.id.dependency_count()
    }

    /// Whether the last run subscribed this effect to `key` on `target`.
    pub fn is_subscribed(&self, target: Target, key: impl Into<Key>) -> bool {
        let key = key.into();
        let Some(key) = target.with(move |node| node.normalize(key)) else {
            return false;
        };
        is_subscribed(target, &key, self.id)
    }

    /// Get the EffectId for this effect (internal use only)
    pub(crate) fn id(&self) -> EffectId {
        self.id
    }

    /// Create an Effect wrapper from an existing EffectId (internal use only)
    ///
    /// This does NOT run the effect or register it in a scope. Use this when
    /// the metadata was set up externally (views, mutation passes) and the
    /// Effect is only there to handle cleanup via Drop.
    pub(crate) fn from_raw(id: EffectId) -> Self {
        Self { id }
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        // A scope-owned computation outlives its handle; the scope frees it.
        if self.id.release_to_scope() {
            return;
        }
        self.id.stop();
        // The removed metadata (and the body it owns) is dropped here,
        // after the arena lock is released.
        drop(effect_arena_remove(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::reactive;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn effect_reruns_on_write() {
        let target = Target::record([("a", 1)]);
        let state = reactive(target);
        let runs = Arc::new(AtomicUsize::new(0));

        let effect = Effect::new({
            let state = state.clone();
            let runs = runs.clone();
            move || {
                state.get("a");
                runs.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert!(effect.is_subscribed(target, "a"));

        state.set("a", 2).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        // Same value: no trigger
        state.set("a", 2).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        effect.stop();
        assert!(!effect.is_subscribed(target, "a"));
        state.set("a", 3).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        target.dispose();
    }

    #[test]
    fn lazy_effect_waits_for_run() {
        let target = Target::record([("a", 1)]);
        let state = reactive(target);
        let runs = Arc::new(AtomicUsize::new(0));

        let effect = Effect::lazy({
            let state = state.clone();
            let runs = runs.clone();
            move || {
                state.get("a");
                runs.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert_eq!(runs.load(Ordering::Relaxed), 0);

        // Pending effects are not triggered
        state.set("a", 2).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 0);

        effect.run();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(effect.dependency_count(), 1);

        target.dispose();
    }

    #[test]
    fn writing_what_it_reads_does_not_recurse() {
        cov_mark::check!(trigger_skips_running_computation);
        let target = Target::record([("count", 0)]);
        let state = reactive(target);
        let runs = Arc::new(AtomicUsize::new(0));

        let _effect = Effect::new({
            let state = state.clone();
            let runs = runs.clone();
            move || {
                let n = state.get("count").as_f64().unwrap_or(0.0);
                state.set("count", n + 1.0).unwrap();
                runs.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(target.peek("count"), 1.0.into());

        target.dispose();
    }

    #[test]
    fn stop_hooks_run_once() {
        let hooks = Arc::new(AtomicUsize::new(0));
        let effect = Effect::new(|| {});
        effect.on_stop({
            let hooks = hooks.clone();
            move || {
                hooks.fetch_add(1, Ordering::Relaxed);
            }
        });

        effect.stop();
        effect.stop();
        assert_eq!(hooks.load(Ordering::Relaxed), 1);
        assert!(!effect.is_active());

        // Registered after stop: ignored
        effect.on_stop({
            let hooks = hooks.clone();
            move || {
                hooks.fetch_add(1, Ordering::Relaxed);
            }
        });
        drop(effect);
        assert_eq!(hooks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stopped_effect_runs_untracked() {
        let target = Target::record([("a", 1)]);
        let state = reactive(target);
        let runs = Arc::new(AtomicUsize::new(0));

        let effect = Effect::new({
            let state = state.clone();
            let runs = runs.clone();
            move || {
                state.get("a");
                runs.fetch_add(1, Ordering::Relaxed);
            }
        });
        effect.stop();
        effect.run();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        assert_eq!(effect.dependency_count(), 0);

        state.set("a", 2).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        target.dispose();
    }

    #[test]
    fn untracked_and_paused_reads_are_ignored() {
        let target = Target::record([("a", 1), ("b", 2), ("c", 3)]);
        let state = reactive(target);

        let effect = Effect::new({
            let state = state.clone();
            move || {
                state.get("a");
                untracked(|| state.get("b"));
                pause_tracking();
                state.get("c");
                enable_tracking();
                state.get("a");
                reset_tracking();
                reset_tracking();
            }
        });

        assert!(effect.is_subscribed(target, "a"));
        assert!(!effect.is_subscribed(target, "b"));
        assert!(!effect.is_subscribed(target, "c"));
        assert_eq!(effect.dependency_count(), 1);

        target.dispose();
    }
}
