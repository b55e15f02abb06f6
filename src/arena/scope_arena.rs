// Scope arena - storage for the ownership tree
//
// A scope owns computations, cleanup hooks and child scopes. Nodes live in a
// slab behind a Mutex and are addressed by ScopeId (index + generation).
// Stopping a scope removes its node, so a stale ScopeId simply stops
// resolving and no tombstone is left in the parent.
//
// The active scope is thread-local: entering a scope for a run is an RAII
// guard that restores the previous one on drop.

use parking_lot::Mutex;
use slab::Slab;
use std::cell::Cell;

use super::EffectId;
use crate::hash::FastIndexSet;

type Hook = Box<dyn FnOnce() + Send>;

static SCOPE_ARENA: Mutex<Slab<ScopeNode>> = Mutex::new(Slab::new());

static NEXT_GENERATION: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);

thread_local! {
    static ACTIVE_SCOPE: Cell<Option<ScopeId>> = const { Cell::new(None) };
}

pub(crate) struct ScopeNode {
    generation: u32,
    parent: Option<ScopeId>,
    children: FastIndexSet<ScopeId>,
    effects: FastIndexSet<EffectId>,
    cleanups: Vec<Hook>,
}

/// What a stopped scope still has to tear down.
pub(crate) struct TakenScope {
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    pub effects: Vec<EffectId>,
    pub cleanups: Vec<Hook>,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct ScopeId {
    index: u32,
    generation: u32,
}

impl ScopeId {
    fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&mut ScopeNode) -> R,
    {
        let mut arena = SCOPE_ARENA.lock();
        arena
            .get_mut(self.index as usize)
            .filter(|node| node.generation == self.generation)
            .map(f)
    }

    pub fn exists(self) -> bool {
        self.with(|_| ()).is_some()
    }

    pub fn parent(self) -> Option<ScopeId> {
        self.with(|node| node.parent).flatten()
    }

    pub fn effect_count(self) -> usize {
        self.with(|node| node.effects.len()).unwrap_or(0)
    }

    pub fn child_count(self) -> usize {
        self.with(|node| node.children.len()).unwrap_or(0)
    }

    pub fn has_child(self, child: ScopeId) -> bool {
        self.with(|node| node.children.contains(&child))
            .unwrap_or(false)
    }

    /// Queue a cleanup hook. The hook is handed back if the scope is gone.
    pub fn push_cleanup(self, hook: Hook) -> Result<(), Hook> {
        let mut slot = Some(hook);
        self.with(|node| node.cleanups.extend(slot.take()));
        match slot {
            Some(hook) => Err(hook),
            None => Ok(()),
        }
    }

    /// Remove the node and hand back what it owned. The parent still lists
    /// the scope until [`detach_child`](Self::detach_child). None if the
    /// scope was already stopped.
    pub fn take(self) -> Option<TakenScope> {
        let mut arena = SCOPE_ARENA.lock();
        let live = arena
            .get(self.index as usize)
            .is_some_and(|node| node.generation == self.generation);
        if !live {
            return None;
        }
        let node = arena.remove(self.index as usize);
        Some(TakenScope {
            parent: node.parent,
            children: node.children.into_iter().collect(),
            effects: node.effects.into_iter().collect(),
            cleanups: node.cleanups,
        })
    }

    /// Drop `child` from this scope's children.
    pub fn detach_child(self, child: ScopeId) {
        self.with(|node| node.children.shift_remove(&child));
    }
}

/// Allocate a scope, attached to `parent` when given and still live.
pub(crate) fn scope_arena_insert(parent: Option<ScopeId>) -> ScopeId {
    let generation = NEXT_GENERATION.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let mut arena = SCOPE_ARENA.lock();
    let parent = parent.filter(|p| {
        arena
            .get(p.index as usize)
            .is_some_and(|node| node.generation == p.generation)
    });
    let index = arena.insert(ScopeNode {
        generation,
        parent,
        children: FastIndexSet::default(),
        effects: FastIndexSet::default(),
        cleanups: Vec::new(),
    });
    let id = ScopeId {
        index: index as u32,
        generation,
    };
    if let Some(parent) = parent {
        if let Some(node) = arena.get_mut(parent.index as usize) {
            node.children.insert(id);
        }
    }
    id
}

/// The scope new computations and child scopes attach to.
pub(crate) fn active_scope() -> Option<ScopeId> {
    ACTIVE_SCOPE.with(Cell::get).filter(|scope| scope.exists())
}

/// Make `scope` the active scope until dropped.
pub(crate) struct ActiveScopeGuard {
    previous: Option<ScopeId>,
}

impl ActiveScopeGuard {
    pub fn new(scope: ScopeId) -> Self {
        Self {
            previous: ACTIVE_SCOPE.with(|c| c.replace(Some(scope))),
        }
    }
}

impl Drop for ActiveScopeGuard {
    fn drop(&mut self) {
        ACTIVE_SCOPE.with(|c| c.set(self.previous));
    }
}

/// Hand `effect_id` to `scope`.
pub(crate) fn record_effect_scope(effect_id: EffectId, scope: ScopeId) {
    if scope.with(|node| node.effects.insert(effect_id)).is_some() {
        effect_id.set_scope(scope);
    }
}

/// Forget a computation that was stopped on its own.
pub(crate) fn remove_scope_effect(scope: ScopeId, effect_id: EffectId) {
    scope.with(|node| node.effects.shift_remove(&effect_id));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taken_child_stays_listed_until_detached() {
        let parent = scope_arena_insert(None);
        let child = scope_arena_insert(Some(parent));
        assert!(parent.has_child(child));
        assert_eq!(child.parent(), Some(parent));

        let taken = child.take().unwrap();
        assert_eq!(taken.parent, Some(parent));
        assert!(parent.has_child(child));

        parent.detach_child(child);
        assert!(!parent.has_child(child));
        assert_eq!(parent.child_count(), 0);
        assert!(child.take().is_none());

        parent.take();
    }

    #[test]
    fn stale_parent_is_not_adopted() {
        let parent = scope_arena_insert(None);
        parent.take();
        let orphan = scope_arena_insert(Some(parent));
        assert_eq!(orphan.parent(), None);
        orphan.take();
    }

    #[test]
    fn cleanup_on_stopped_scope_is_handed_back() {
        let scope = scope_arena_insert(None);
        scope.take();
        assert!(scope.push_cleanup(Box::new(|| {})).is_err());
    }

    #[test]
    fn guard_restores_previous_active_scope() {
        let outer = scope_arena_insert(None);
        let inner = scope_arena_insert(None);
        {
            let _outer = ActiveScopeGuard::new(outer);
            {
                let _inner = ActiveScopeGuard::new(inner);
                assert_eq!(active_scope(), Some(inner));
            }
            assert_eq!(active_scope(), Some(outer));
        }
        assert_eq!(active_scope(), None);
        outer.take();
        inner.take();
    }
}
