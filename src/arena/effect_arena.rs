// Effect arena - storage for computation metadata
//
// One EffectMetadata per computation, whether it is a plain effect, the
// computation behind a View, or the producer computation of a mutation pass.
// It holds:
// - callback: the body, stored in the arena so Effect stays a thin id
// - accesses: what the last run read (target -> key -> observation)
// - views: nested views the last run read, with the value it saw
// - readers: computations whose last run read *this* view
// - on_stop hooks, the owning scope, and (producers only) the copy map
//
// STATES:
// - Pending: never ran
// - Clean: last run is trustworthy
// - Check: an upstream view went dirty; nested views must be re-validated
// - Dirty: a raw access record was written; the full validation walk decides
// - Stopped: torn down, no further tracking
//
// The tracking context (stack of running computations and the tracking-pause
// flag) is thread-local. Arena locks are never held while user code runs.

use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use super::dep_arena::{Observed, remove_subscriber};
use super::scope_arena::{ScopeId, remove_scope_effect};
use super::Target;
use crate::draft::CopyMap;
use crate::effect::run_computation;
use crate::hash::{FastIndexMap, FastIndexSet};
use crate::value::Key;
use crate::view::NestedRead;

/// Everything one run of a computation read, per target and key.
pub(crate) type AccessMap = FastIndexMap<Target, FastIndexMap<Key, Observed>>;

type Callback = Box<dyn FnMut() + Send>;
type Hook = Box<dyn FnOnce() + Send>;

/// Computation lifecycle states, stored in an `AtomicU8`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactiveState {
    /// Never ran.
    Pending = 0,
    /// Cached result is trustworthy.
    Clean = 1,
    /// An upstream view went dirty; nested view reads need re-validation.
    Check = 2,
    /// A raw dependency was written; validation decides whether to re-run.
    Dirty = 3,
    /// Torn down.
    Stopped = 4,
}

impl ReactiveState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReactiveState::Pending,
            1 => ReactiveState::Clean,
            2 => ReactiveState::Check,
            3 => ReactiveState::Dirty,
            _ => ReactiveState::Stopped,
        }
    }
}

/// Global effect arena - stores all computation metadata
static EFFECT_ARENA: RwLock<Slab<EffectMetadata>> = RwLock::new(Slab::new());

thread_local! {
    // Running computations, innermost last.
    static EFFECT_STACK: RefCell<Vec<EffectId>> = const { RefCell::new(Vec::new()) };
    // Whether reads are currently recorded.
    static SHOULD_TRACK: Cell<bool> = const { Cell::new(true) };
    // Saved SHOULD_TRACK values for pause_tracking()/enable_tracking()/reset_tracking().
    static TRACK_STACK: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
    // Number of mutation passes currently running on this thread.
    static ACTIVE_PASSES: Cell<usize> = const { Cell::new(0) };
}

/// The innermost running computation, tracked or not.
pub fn current_effect() -> Option<EffectId> {
    EFFECT_STACK.with(|stack| stack.borrow().last().copied())
}

/// The computation reads should be attributed to right now.
///
/// None while tracking is paused, while a producer is innermost (producers
/// stage writes, they never subscribe), or once the innermost computation
/// has been stopped mid-run.
pub fn active_effect() -> Option<EffectId> {
    if !SHOULD_TRACK.with(Cell::get) {
        return None;
    }
    let effect_id = current_effect()?;
    let trackable = effect_id
        .with(|m| !m.is_producer() && m.get_state() != ReactiveState::Stopped)
        .unwrap_or(false);
    trackable.then_some(effect_id)
}

/// Producers on the running stack, outermost first.
pub fn producers_on_stack() -> Vec<EffectId> {
    if ACTIVE_PASSES.with(Cell::get) == 0 {
        return Vec::new();
    }
    let stack = EFFECT_STACK.with(|stack| stack.borrow().clone());
    stack
        .into_iter()
        .filter(|id| id.with(EffectMetadata::is_producer).unwrap_or(false))
        .collect()
}

/// Replace the tracking flag, returning the previous one.
pub fn set_should_track(value: bool) -> bool {
    SHOULD_TRACK.with(|c| c.replace(value))
}

/// Save the tracking flag on the pause stack and replace it.
pub fn push_should_track(value: bool) {
    let previous = set_should_track(value);
    TRACK_STACK.with(|stack| stack.borrow_mut().push(previous));
}

/// Restore the tracking flag saved by the matching `push_should_track`.
/// An unmatched call re-enables tracking.
pub fn pop_should_track() {
    let previous = TRACK_STACK.with(|stack| stack.borrow_mut().pop());
    set_should_track(previous.unwrap_or(true));
}

/// RAII guard that pushes a computation onto the running stack.
///
/// While alive, the computation is marked running (the re-entrancy guard
/// used by trigger dispatch) and tracking is enabled. Everything is
/// restored on drop, including when the body panics.
pub struct CurrentEffectGuard {
    effect_id: EffectId,
    was_running: bool,
    should_track: bool,
}

impl CurrentEffectGuard {
    /// Push `effect_id` as the innermost running computation.
    pub fn new(effect_id: EffectId) -> Self {
        EFFECT_STACK.with(|stack| stack.borrow_mut().push(effect_id));
        let should_track = set_should_track(true);
        let was_running = effect_id
            .with(|m| m.running.swap(true, Ordering::AcqRel))
            .unwrap_or(false);
        Self {
            effect_id,
            was_running,
            should_track,
        }
    }
}

impl Drop for CurrentEffectGuard {
    fn drop(&mut self) {
        EFFECT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.effect_id));
        });
        set_should_track(self.should_track);
        self.effect_id
            .with(|m| m.running.store(self.was_running, Ordering::Release));
    }
}

/// RAII guard that suspends tracking until dropped.
pub struct TrackingPause {
    previous: bool,
}

impl TrackingPause {
    /// Stop recording reads.
    pub fn new() -> Self {
        Self {
            previous: set_should_track(false),
        }
    }
}

impl Drop for TrackingPause {
    fn drop(&mut self) {
        set_should_track(self.previous);
    }
}

/// RAII guard counting a running mutation pass, so draft resolution can skip
/// the stack walk when no pass is active.
pub struct PassGuard;

impl PassGuard {
    /// Count one more running pass.
    pub fn new() -> Self {
        ACTIVE_PASSES.with(|c| c.set(c.get() + 1));
        PassGuard
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        ACTIVE_PASSES.with(|c| c.set(c.get().saturating_sub(1)));
    }
}

/// Unique identifier for a computation in the arena.
///
/// A zero-cost wrapper around a slab index. When an Effect or View is
/// dropped it removes itself from the arena, making this id stale; stale
/// access returns None or a neutral default.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EffectId(u32);

impl EffectId {
    fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the metadata with a closure (read-only).
    ///
    /// Returns None if the computation has been removed (stale access).
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&EffectMetadata) -> R,
    {
        let arena = EFFECT_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// Current state; stale ids read as Stopped.
    pub fn state(self) -> ReactiveState {
        self.with(EffectMetadata::get_state)
            .unwrap_or(ReactiveState::Stopped)
    }

    pub fn set_state(self, state: ReactiveState) {
        self.with(|m| m.set_state(state));
    }

    pub fn is_view(self) -> bool {
        self.with(EffectMetadata::is_view).unwrap_or(false)
    }

    pub fn is_running(self) -> bool {
        self.with(|m| m.running.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Mark Dirty from Clean or Check. Returns true if the computation was
    /// Clean, i.e. its readers have not been told yet.
    pub fn mark_dirty(self) -> bool {
        self.with(|m| {
            let mut current = m.state.load(Ordering::Acquire);
            loop {
                let state = ReactiveState::from_u8(current);
                if !matches!(state, ReactiveState::Clean | ReactiveState::Check) {
                    return false;
                }
                match m.state.compare_exchange_weak(
                    current,
                    ReactiveState::Dirty as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return state == ReactiveState::Clean,
                    Err(actual) => current = actual,
                }
            }
        })
        .unwrap_or(false)
    }

    /// Move Clean -> Check and propagate to this computation's readers.
    ///
    /// Views pass the mark on to whoever read them; plain effects are
    /// collected into `deferred` so the dispatcher can settle them once every
    /// view is marked.
    pub fn mark_check_recursive(self, deferred: &mut Vec<EffectId>) {
        let marked = self
            .with(|m| {
                m.state
                    .compare_exchange(
                        ReactiveState::Clean as u8,
                        ReactiveState::Check as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            })
            .unwrap_or(false);
        if !marked {
            return;
        }
        cov_mark::hit!(reader_marked_check);
        if self.is_view() {
            for reader in self.readers() {
                reader.mark_check_recursive(deferred);
            }
        } else {
            deferred.push(self);
        }
    }

    /// Leave the post-run state: Clean, unless the body stopped its own
    /// computation.
    pub fn finish_run(self) {
        self.with(|m| {
            let _ = m
                .state
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                    (s != ReactiveState::Stopped as u8).then_some(ReactiveState::Clean as u8)
                });
        });
    }

    /// Settle Check -> Clean after a successful validation.
    pub fn clear_check(self) {
        self.with(|m| {
            let _ = m.state.compare_exchange(
                ReactiveState::Check as u8,
                ReactiveState::Clean as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        });
    }

    // =========================================================================
    // Access records and nested view reads
    // =========================================================================

    /// Remember what the running body observed for `(target, key)`. A later
    /// read of the same key in the same run overwrites the observation.
    pub(crate) fn record_access(self, target: Target, key: Key, observed: Observed) {
        let replaced = self.with(|m| {
            m.accesses
                .write()
                .entry(target)
                .or_default()
                .insert(key, observed)
        });
        drop(replaced);
    }

    /// Copy of the access map for a validation walk.
    pub(crate) fn accesses_snapshot(self) -> AccessMap {
        self.with(|m| m.accesses.read().clone()).unwrap_or_default()
    }

    /// Number of access records plus nested view reads.
    pub fn dependency_count(self) -> usize {
        self.with(|m| {
            let records: usize = m.accesses.read().values().map(|keys| keys.len()).sum();
            records + m.views.read().len()
        })
        .unwrap_or(0)
    }

    /// Record that the running body read `view` and saw what `read` holds.
    pub(crate) fn record_view(self, view: EffectId, read: Arc<dyn NestedRead>) {
        let replaced = self.with(|m| m.views.write().insert(view, read));
        drop(replaced);
        view.add_reader(self);
    }

    /// True if any nested view read no longer matches what was seen.
    pub fn nested_views_changed(self) -> bool {
        let reads: Vec<Arc<dyn NestedRead>> = self
            .with(|m| m.views.read().values().cloned().collect())
            .unwrap_or_default();
        let _pause = TrackingPause::new();
        reads.iter().any(|read| read.changed())
    }

    pub fn has_nested_views(self) -> bool {
        self.with(|m| !m.views.read().is_empty()).unwrap_or(false)
    }

    pub fn add_reader(self, reader: EffectId) {
        self.with(|m| m.readers.write().insert(reader));
    }

    pub fn remove_reader(self, reader: EffectId) {
        self.with(|m| m.readers.write().shift_remove(&reader));
    }

    pub fn readers(self) -> Vec<EffectId> {
        self.with(|m| m.readers.read().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every dependency backreference: unsubscribe from each access
    /// record and deregister from each nested view.
    ///
    /// The taken maps are dropped after the arena lock is released; a recorded
    /// view read may own the last handle of a view, and dropping it re-enters the arena.
    pub fn clear_dependencies(self) {
        let Some((accesses, views)) = self.with(|m| {
            (
                std::mem::take(&mut *m.accesses.write()),
                std::mem::take(&mut *m.views.write()),
            )
        }) else {
            return;
        };
        for (target, records) in &accesses {
            for key in records.keys() {
                remove_subscriber(*target, key, self);
            }
        }
        for view in views.keys() {
            view.remove_reader(self);
        }
    }

    // =========================================================================
    // Callback, hooks, scope
    // =========================================================================

    /// Run the body stored in the arena.
    ///
    /// The callback is taken out for the duration of the call so the arena
    /// lock is free for anything the body does, then put back by a guard that
    /// also fires if the body panics. A body re-entering its own computation
    /// finds the slot empty and does nothing.
    pub fn run_callback(self) {
        struct CallbackGuard {
            effect_id: EffectId,
            callback: Option<Callback>,
        }

        impl Drop for CallbackGuard {
            fn drop(&mut self) {
                let mut slot = self.callback.take();
                self.effect_id.with(|meta| {
                    let mut callback = meta.callback.lock();
                    if callback.is_none() {
                        *callback = slot.take();
                    }
                });
                // Computation removed mid-run: drop the body outside the lock.
                drop(slot);
            }
        }

        let callback = self.with(|m| m.callback.lock().take()).flatten();
        if let Some(cb) = callback {
            let mut guard = CallbackGuard {
                effect_id: self,
                callback: Some(cb),
            };
            if let Some(cb) = guard.callback.as_mut() {
                cb();
            }
        }
    }

    /// Register a teardown hook. Returns false (dropping nothing under the
    /// lock) when the computation is already stopped.
    pub fn push_on_stop(self, hook: Hook) -> bool {
        let mut slot = Some(hook);
        let accepted = self
            .with(|m| {
                if m.get_state() == ReactiveState::Stopped {
                    return false;
                }
                m.on_stop.lock().extend(slot.take());
                true
            })
            .unwrap_or(false);
        drop(slot);
        accepted
    }

    pub(crate) fn set_scope(self, scope: ScopeId) {
        self.with(|m| *m.scope.lock() = Some(scope));
    }

    pub(crate) fn scope(self) -> Option<ScopeId> {
        self.with(|m| *m.scope.lock()).flatten()
    }

    /// Leave a live computation to the scope that owns it once its handle is
    /// dropped. False if no live scope owns it.
    pub(crate) fn release_to_scope(self) -> bool {
        let owned = self.state() != ReactiveState::Stopped
            && self.scope().is_some_and(ScopeId::exists);
        if owned {
            self.with(|m| m.released.store(true, Ordering::Release));
        }
        owned
    }

    pub(crate) fn is_released(self) -> bool {
        self.with(|m| m.released.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Tear the computation down: clear dependencies, run teardown hooks,
    /// leave the owning scope. Idempotent.
    pub fn stop(self) {
        let previous = self.with(|m| m.replace_state(ReactiveState::Stopped));
        if matches!(previous, None | Some(ReactiveState::Stopped)) {
            return;
        }
        tracing::trace!(effect_id = ?self, "stop computation");
        self.clear_dependencies();
        let hooks = self
            .with(|m| std::mem::take(&mut *m.on_stop.lock()))
            .unwrap_or_default();
        for hook in hooks {
            hook();
        }
        if let Some(scope) = self.with(|m| m.scope.lock().take()).flatten() {
            remove_scope_effect(scope, self);
        }
    }

    // =========================================================================
    // Draft copies (producers only)
    // =========================================================================

    /// Run `f` against this producer's copy map. None for non-producers.
    pub(crate) fn with_copies<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&mut CopyMap) -> R,
    {
        self.with(|m| m.copies.as_ref().map(|copies| f(&mut copies.lock())))
            .flatten()
    }
}

/// Metadata for one computation.
pub struct EffectMetadata {
    state: AtomicU8,
    flags: u8,
    /// Set while the body is on the running stack (re-entrancy guard).
    running: AtomicBool,
    callback: Mutex<Option<Callback>>,
    accesses: RwLock<AccessMap>,
    views: RwLock<FastIndexMap<EffectId, Arc<dyn NestedRead>>>,
    readers: RwLock<FastIndexSet<EffectId>>,
    on_stop: Mutex<Vec<Hook>>,
    scope: Mutex<Option<ScopeId>>,
    /// The public handle is gone; the owning scope frees the slot on stop.
    released: AtomicBool,
    copies: Option<Mutex<CopyMap>>,
}

// Flag bit positions
const FLAG_VIEW: u8 = 1 << 0;
const FLAG_PRODUCER: u8 = 1 << 1;

impl EffectMetadata {
    fn with_parts(flags: u8, callback: Option<Callback>, copies: Option<CopyMap>) -> Self {
        Self {
            state: AtomicU8::new(ReactiveState::Pending as u8),
            flags,
            running: AtomicBool::new(false),
            callback: Mutex::new(callback),
            accesses: RwLock::new(AccessMap::default()),
            views: RwLock::new(FastIndexMap::default()),
            readers: RwLock::new(FastIndexSet::default()),
            on_stop: Mutex::new(Vec::new()),
            scope: Mutex::new(None),
            released: AtomicBool::new(false),
            copies: copies.map(Mutex::new),
        }
    }

    /// Bare metadata without a body.
    pub fn new() -> Self {
        Self::with_parts(0, None, None)
    }

    /// A plain effect: triggers run its body synchronously.
    pub fn new_effect(callback: Callback) -> Self {
        Self::with_parts(0, Some(callback), None)
    }

    /// The computation behind a view: triggers only mark it dirty.
    pub fn new_view(callback: Callback) -> Self {
        Self::with_parts(FLAG_VIEW, Some(callback), None)
    }

    /// The producer of a mutation pass: owns a copy map, never subscribes.
    pub fn new_producer() -> Self {
        let metadata = Self::with_parts(FLAG_PRODUCER, None, Some(CopyMap::default()));
        metadata.set_state(ReactiveState::Clean);
        metadata
    }

    pub fn get_state(&self) -> ReactiveState {
        ReactiveState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ReactiveState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn replace_state(&self, state: ReactiveState) -> ReactiveState {
        ReactiveState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    pub fn is_view(&self) -> bool {
        (self.flags & FLAG_VIEW) != 0
    }

    pub fn is_producer(&self) -> bool {
        (self.flags & FLAG_PRODUCER) != 0
    }
}

impl Default for EffectMetadata {
    fn default() -> Self {
        Self::new()
    }
}

// Arena manipulation functions

/// Insert computation metadata into the arena and return its id
pub fn effect_arena_insert(metadata: EffectMetadata) -> EffectId {
    let mut arena = EFFECT_ARENA.write();
    let key = arena.insert(metadata);
    EffectId(key as u32)
}

/// Remove a computation from the arena, returning its metadata so that the
/// stored body is dropped after the lock is released.
pub fn effect_arena_remove(id: EffectId) -> Option<EffectMetadata> {
    let mut arena = EFFECT_ARENA.write();
    arena.try_remove(id.index())
}

/// Dispatch a trigger to the matched subscribers.
///
/// 1. Views are marked Dirty; whoever read them is marked Check.
/// 2. Plain subscribers run synchronously, in registration order.
/// 3. Plain effects reached only through a view re-validate their nested
///    view reads and run only if one changed.
///
/// A computation that is mid-run is skipped, which is what stops a body that
/// writes what it reads from recursing into itself.
pub fn notify_subscribers(subscribers: FastIndexSet<EffectId>) {
    let mut deferred = Vec::new();
    let mut plain = Vec::new();

    for effect_id in subscribers {
        if effect_id.is_running() {
            cov_mark::hit!(trigger_skips_running_computation);
            continue;
        }
        if effect_id.is_view() {
            if effect_id.mark_dirty() {
                for reader in effect_id.readers() {
                    reader.mark_check_recursive(&mut deferred);
                }
            }
        } else if !matches!(
            effect_id.state(),
            ReactiveState::Stopped | ReactiveState::Pending
        ) {
            plain.push(effect_id);
        }
    }

    for effect_id in plain {
        if !effect_id.is_running() && effect_id.state() != ReactiveState::Stopped {
            run_computation(effect_id);
        }
    }

    for effect_id in deferred {
        if effect_id.state() != ReactiveState::Check || effect_id.is_running() {
            continue;
        }
        if effect_id.nested_views_changed() {
            run_computation(effect_id);
        } else {
            cov_mark::hit!(checked_effect_settled_without_run);
            effect_id.clear_check();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_access_returns_defaults() {
        let id = effect_arena_insert(EffectMetadata::new());
        effect_arena_remove(id);

        assert!(id.with(|_| ()).is_none());
        assert_eq!(id.state(), ReactiveState::Stopped);
        assert_eq!(id.dependency_count(), 0);
        assert!(!id.is_running());
    }

    #[test]
    fn callback_restored_after_panic() {
        use std::sync::atomic::AtomicUsize;

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let id = effect_arena_insert(EffectMetadata::new_effect(Box::new(move || {
            if runs_clone.fetch_add(1, Ordering::Relaxed) == 0 {
                panic!("first run fails");
            }
        })));

        let result = std::panic::catch_unwind(|| id.run_callback());
        assert!(result.is_err());

        id.run_callback();
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        effect_arena_remove(id);
    }

    #[test]
    fn guard_restores_stack_on_panic() {
        let outer = effect_arena_insert(EffectMetadata::new());
        let inner = effect_arena_insert(EffectMetadata::new());

        let _outer_guard = CurrentEffectGuard::new(outer);
        let result = std::panic::catch_unwind(|| {
            let _guard = CurrentEffectGuard::new(inner);
            assert_eq!(current_effect(), Some(inner));
            assert!(inner.is_running());
            panic!("body failed");
        });

        assert!(result.is_err());
        assert_eq!(current_effect(), Some(outer));
        assert!(!inner.is_running());
        drop(_outer_guard);
        assert_eq!(current_effect(), None);

        effect_arena_remove(outer);
        effect_arena_remove(inner);
    }

    #[test]
    fn producers_never_receive_reads() {
        let producer = effect_arena_insert(EffectMetadata::new_producer());
        {
            let _pass = PassGuard::new();
            let _guard = CurrentEffectGuard::new(producer);
            assert_eq!(current_effect(), Some(producer));
            assert_eq!(active_effect(), None);
            assert_eq!(producers_on_stack(), vec![producer]);
        }
        assert!(producers_on_stack().is_empty());
        effect_arena_remove(producer);
    }

    #[test]
    fn tracking_pause_nests() {
        let effect = effect_arena_insert(EffectMetadata::new());
        effect.set_state(ReactiveState::Clean);
        let _guard = CurrentEffectGuard::new(effect);
        assert_eq!(active_effect(), Some(effect));
        {
            let _pause = TrackingPause::new();
            assert_eq!(active_effect(), None);
            push_should_track(true);
            assert_eq!(active_effect(), Some(effect));
            pop_should_track();
            assert_eq!(active_effect(), None);
        }
        assert_eq!(active_effect(), Some(effect));
        drop(_guard);
        effect_arena_remove(effect);
    }

    #[test]
    fn mark_dirty_reports_first_transition_only() {
        let id = effect_arena_insert(EffectMetadata::new_view(Box::new(|| {})));
        assert!(!id.mark_dirty(), "pending views are not marked");
        id.set_state(ReactiveState::Clean);
        assert!(id.mark_dirty());
        assert!(!id.mark_dirty());
        assert_eq!(id.state(), ReactiveState::Dirty);
        effect_arena_remove(id);
    }
}
