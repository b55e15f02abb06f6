use crate::arena::{
    ActiveScopeGuard, ScopeId, active_scope, effect_arena_remove, scope_arena_insert,
};

/// Owner of computations and child scopes, torn down together
///
/// Every [`Effect`](crate::Effect) and [`View`](crate::View) created while a
/// scope is running belongs to it, and so does every scope created inside it
/// (unless created [`detached`](Self::detached)). Stopping a scope stops the
/// whole subtree. A scope-owned computation keeps running after its handle
/// is dropped, until the scope stops.
///
/// # Example
/// ```ignore
/// let scope = EffectScope::new();
/// scope.run(|| {
///     Effect::new(move || render(&state));
///     on_scope_dispose(|| println!("unmounted"));
/// });
///
/// scope.stop(); // effect stopped, "unmounted" printed
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EffectScope {
    id: ScopeId,
}

impl EffectScope {
    /// Create a scope, attached as a child of the active scope if there is one.
    pub fn new() -> Self {
        Self {
            id: scope_arena_insert(active_scope()),
        }
    }

    /// Create a root scope that is never stopped by an enclosing scope.
    pub fn detached() -> Self {
        Self {
            id: scope_arena_insert(None),
        }
    }

    /// Run `f` with this scope active. Returns `None` without running `f` if
    /// the scope is stopped.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if !self.id.exists() {
            cov_mark::hit!(inactive_scope_run);
            tracing::warn!(scope = ?self.id, "cannot run an inactive effect scope");
            return None;
        }
        let _active = ActiveScopeGuard::new(self.id);
        Some(f())
    }

    /// Stop child scopes, then owned computations, then run dispose hooks,
    /// then leave the parent. Idempotent.
    pub fn stop(&self) {
        let Some(taken) = self.id.take() else {
            return;
        };
        tracing::trace!(
            scope = ?self.id,
            children = taken.children.len(),
            effects = taken.effects.len(),
            "stop scope"
        );
        for child in taken.children {
            EffectScope { id: child }.stop();
        }
        for effect_id in taken.effects {
            effect_id.stop();
            if effect_id.is_released() {
                drop(effect_arena_remove(effect_id));
            }
        }
        for cleanup in taken.cleanups {
            cleanup();
        }
        if let Some(parent) = taken.parent {
            parent.detach_child(self.id);
        }
    }

    /// Whether the scope can still run and own computations.
    pub fn is_active(&self) -> bool {
        self.id.exists()
    }

    /// Number of live computations owned directly by this scope.
    pub fn effect_count(&self) -> usize {
        self.id.effect_count()
    }

    /// Number of live child scopes.
    pub fn child_count(&self) -> usize {
        self.id.child_count()
    }

    /// Whether `child` is currently one of this scope's children.
    pub fn contains_child(&self, child: &EffectScope) -> bool {
        self.id.has_child(child.id)
    }

    /// The scope this one is attached to, while both are active.
    pub fn parent(&self) -> Option<EffectScope> {
        self.id
            .parent()
            .filter(|parent| parent.exists())
            .map(|id| EffectScope { id })
    }
}

impl Default for EffectScope {
    fn default() -> Self {
        Self::new()
    }
}

/// The scope currently running, if any.
pub fn current_scope() -> Option<EffectScope> {
    active_scope().map(|id| EffectScope { id })
}

/// Register a hook to run when the current scope stops.
///
/// Outside a running scope the hook is dropped with a warning; it is never
/// queued for later.
pub fn on_scope_dispose<F>(hook: F)
where
    F: FnOnce() + Send + 'static,
{
    let Some(scope) = active_scope() else {
        cov_mark::hit!(scope_dispose_without_active_scope);
        tracing::warn!(
            "on_scope_dispose() is called when there is no active effect scope to be associated with"
        );
        return;
    };
    if scope.push_cleanup(Box::new(hook)).is_err() {
        tracing::warn!(?scope, "dispose hook registered on a stopped scope was dropped");
    }
}
