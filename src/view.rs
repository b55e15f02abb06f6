use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::arena::{
    EffectMetadata, Observed, ReactiveState, Target, TrackingPause, active_effect, active_scope,
    effect_arena_insert, notify_subscribers, record_effect_scope,
};
use crate::draft::resolve_existing;
use crate::effect::{Effect, run_computation};
use crate::hash::FastIndexSet;
use crate::value::has_changed;

/// A nested view read, as seen by the computation that made it.
pub(crate) trait NestedRead: Send + Sync {
    /// Whether the view's current value differs from the one that was read.
    /// May bring the view up to date, never records dependencies.
    fn changed(&self) -> bool;
}

struct ViewRead<T> {
    view: Arc<ViewInner<T>>,
    seen: T,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> NestedRead for ViewRead<T> {
    fn changed(&self) -> bool {
        value_changed(&self.view.current(), &self.seen)
    }
}

trait Invalidate: Send + Sync {
    fn invalidate(&self);
}

/// Marks a [`View`] stale from outside the reactive graph.
///
/// Handed to the subscribe function of [`View::with_invalidator`]. Once the
/// view is dropped, invalidating does nothing.
#[derive(Clone)]
pub struct ViewInvalidator {
    view: Weak<dyn Invalidate>,
}

impl ViewInvalidator {
    /// Force the next read of the view to run its getter, and re-validate
    /// whatever read the view.
    pub fn invalidate(&self) {
        if let Some(view) = self.view.upgrade() {
            view.invalidate();
        }
    }
}

/// Inequality that treats two values unequal to themselves (NaN) as the same.
#[allow(clippy::eq_op)]
fn value_changed<T: PartialEq>(now: &T, seen: &T) -> bool {
    now != seen && !(now != now && seen != seen)
}

/// Memoized derived value with lazy, validation-first updates
///
/// A View is a computation that caches what its getter returns. It never runs
/// on construction. A write to something the getter read only marks the view
/// dirty; the next [`value`](Self::value) first checks whether everything the
/// last run observed still holds, and re-runs the getter only if it does not.
///
/// # How it works
/// Each run records, per raw target and key, what the getter observed (the
/// value, key presence, or key list), plus the value of every other view it
/// read. Validation walks those records breadth-first:
/// 1. Nested views are brought up to date and compared to what was seen
/// 2. Raw records are compared against the current (draft-aware) state
/// 3. Any mismatch re-runs the getter; none keeps the cached value
///
/// So writing a key back to the value it had, or changing something whose
/// effect on a nested view nets out, costs a comparison walk, never a re-run.
///
/// # Example
/// ```ignore
/// let state = reactive(Target::record([("num", 0)]));
///
/// let doubled = View::new({
///     let state = state.clone();
///     move || state.get("num").as_f64().unwrap_or(0.0) * 2.0
/// });
///
/// assert_eq!(doubled.value(), 0.0); // getter runs now
/// state.set("num", 7)?;             // marks dirty, nothing runs
/// assert_eq!(doubled.value(), 14.0);
/// ```
pub struct View<T> {
    inner: Arc<ViewInner<T>>,
}

struct ViewInner<T> {
    /// Computation that runs the getter and owns the dependency records.
    /// Owned here so Effect::Drop handles cleanup automatically.
    effect: Effect,

    /// Last computed value
    cache: Arc<RwLock<Option<T>>>,

    cacheable: bool,

    /// Invalidated from outside: the next read skips validation.
    forced: AtomicBool,
}

impl<T> Clone for View<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> View<T> {
    /// Create a view. The getter does not run until the first read.
    pub fn new<F>(getter: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::new_internal(getter, true)
    }

    /// Create a view that re-runs its getter on every read.
    ///
    /// It still tracks what the getter reads, so computations that read it
    /// are re-validated when those dependencies change.
    pub fn uncached<F>(getter: F) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        Self::new_internal(getter, false)
    }

    /// Create a view that can also be invalidated by an outside source.
    ///
    /// `subscribe` receives a [`ViewInvalidator`] and returns the matching
    /// unsubscribe function, which runs when the view stops.
    ///
    /// # Example
    /// ```ignore
    /// let view = View::with_invalidator(
    ///     move || clock.now(),
    ///     |invalidator| ticker.on_tick(move || invalidator.invalidate()),
    /// );
    /// ```
    pub fn with_invalidator<F, S, U>(getter: F, subscribe: S) -> Self
    where
        F: FnMut() -> T + Send + 'static,
        S: FnOnce(ViewInvalidator) -> U,
        U: FnOnce() + Send + 'static,
    {
        let view = Self::new_internal(getter, true);
        let weak: Weak<dyn Invalidate> = Arc::downgrade(&view.inner) as Weak<dyn Invalidate>;
        let unsubscribe = subscribe(ViewInvalidator { view: weak });
        view.inner.effect.on_stop(unsubscribe);
        view
    }

    fn new_internal<F>(mut getter: F, cacheable: bool) -> Self
    where
        F: FnMut() -> T + Send + 'static,
    {
        let cache: Arc<RwLock<Option<T>>> = Arc::new(RwLock::new(None));
        let cache_for_effect = cache.clone();

        let callback: Box<dyn FnMut() + Send> = Box::new(move || {
            let value = getter();
            let previous = cache_for_effect.write().replace(value);
            drop(previous);
        });

        let id = effect_arena_insert(EffectMetadata::new_view(callback));
        if let Some(scope) = active_scope() {
            record_effect_scope(id, scope);
        }

        View {
            inner: Arc::new(ViewInner {
                effect: Effect::from_raw(id),
                cache,
                cacheable,
                forced: AtomicBool::new(false),
            }),
        }
    }

    /// Current value, recomputing only if validation finds a change.
    ///
    /// A computation running the read records this view as a dependency.
    pub fn value(&self) -> T {
        let value = self.inner.current();
        self.track_read(&value);
        value
    }

    fn track_read(&self, value: &T) {
        let view_id = self.inner.effect.id();
        let Some(reader) = active_effect() else {
            return;
        };
        if reader == view_id {
            return;
        }
        let read: Arc<dyn NestedRead> = Arc::new(ViewRead {
            view: self.inner.clone(),
            seen: value.clone(),
        });
        reader.record_view(view_id, read);
    }

    /// Stop tracking. The cached value stays readable.
    pub fn stop(&self) {
        self.inner.effect.stop();
    }

    /// Whether the next read has to validate or compute.
    pub fn is_dirty(&self) -> bool {
        matches!(
            self.inner.effect.id().state(),
            ReactiveState::Pending | ReactiveState::Check | ReactiveState::Dirty
        )
    }

    /// Whether the view still tracks its dependencies.
    pub fn is_active(&self) -> bool {
        self.inner.effect.is_active()
    }

    /// Number of keys and nested views the last run read.
    pub fn dependency_count(&self) -> usize {
        self.inner.effect.dependency_count()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ViewInner<T> {
    /// Bring the cache up to date and return it.
    fn current(&self) -> T {
        let id = self.effect.id();
        match id.state() {
            _ if !self.cacheable => self.recompute(),
            ReactiveState::Pending => self.recompute(),
            ReactiveState::Dirty | ReactiveState::Check => {
                if !self.forced.load(Ordering::Acquire) && self.validate() {
                    cov_mark::hit!(view_validated_without_recompute);
                    tracing::trace!(view = ?id, "view validated without recompute");
                    id.set_state(ReactiveState::Clean);
                } else {
                    self.recompute();
                }
            }
            ReactiveState::Clean => {}
            ReactiveState::Stopped => {
                if self.cache.read().is_none() {
                    self.recompute();
                }
            }
        }
        self.cache
            .read()
            .clone()
            .expect("view value is computed before it is read")
    }

    fn recompute(&self) {
        tracing::trace!(view = ?self.effect.id(), "recompute view");
        self.forced.store(false, Ordering::Release);
        run_computation(self.effect.id());
    }

    /// Check, without running the getter, whether what the last run observed
    /// still holds.
    fn validate(&self) -> bool {
        let id = self.effect.id();
        let _pause = TrackingPause::new();

        if id.nested_views_changed() {
            return false;
        }

        let accesses = id.accesses_snapshot();
        let mut queue: VecDeque<Target> = accesses.keys().copied().collect();
        let mut visited: FastIndexSet<Target> = FastIndexSet::default();

        while let Some(target) = queue.pop_front() {
            if !visited.insert(target) {
                continue;
            }
            let Some(records) = accesses.get(&target) else {
                continue;
            };

            let outcome = resolve_existing(target).with(|node| {
                let mut children = Vec::new();
                for (key, observed) in records {
                    let unchanged = match observed {
                        Observed::Present(present) => node.contains(key) == *present,
                        Observed::Keys(keys) => node.keys() == *keys,
                        Observed::Value(seen) => {
                            let now = node.get(key);
                            let unchanged = !has_changed(&now, seen);
                            if unchanged {
                                children.extend(now.as_target());
                            }
                            unchanged
                        }
                    };
                    if !unchanged {
                        return None;
                    }
                }
                Some(children)
            });

            match outcome {
                Some(Some(children)) => queue.extend(children),
                // A mismatch, or the target is gone.
                Some(None) | None => return false,
            }
        }
        true
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Invalidate for ViewInner<T> {
    fn invalidate(&self) {
        let id = self.effect.id();
        tracing::trace!(view = ?id, "view invalidated");
        self.forced.store(true, Ordering::Release);
        let mut subscribers = FastIndexSet::default();
        subscribers.insert(id);
        notify_subscribers(subscribers);
    }
}
