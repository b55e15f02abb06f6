use crate::arena::{
    CurrentEffectGuard, EffectId, EffectMetadata, PassGuard, Target, TriggerOp,
    effect_arena_insert, producers_on_stack, trigger,
};
use crate::effect::Effect;
use crate::hash::FastIndexMap;
use crate::reactive::replay;
use crate::value::Key;

/// Bidirectional map between raw targets and their draft copies, owned by a
/// producer computation for the duration of one pass.
#[derive(Default)]
pub(crate) struct CopyMap {
    copies: FastIndexMap<Target, Target>,
    bases: FastIndexMap<Target, Target>,
}

impl CopyMap {
    /// The copy standing in for `target`, if it is a raw target that was
    /// touched or already a copy of this pass.
    fn lookup(&self, target: Target) -> Option<Target> {
        if self.bases.contains_key(&target) {
            return Some(target);
        }
        self.copies.get(&target).copied()
    }

    fn insert(&mut self, raw: Target, copy: Target) {
        self.copies.insert(raw, copy);
        self.bases.insert(copy, raw);
    }

    fn drain(&mut self) -> Vec<(Target, Target)> {
        self.bases.clear();
        self.copies.drain(..).collect()
    }
}

/// Resolve `target` through every mutation pass on the running stack,
/// outermost first, creating a shallow copy on first touch.
///
/// A nested pass starts from the enclosing pass's copy, so an inner read sees
/// the same in-flight draft as the mutation around it.
pub(crate) fn resolve(target: Target) -> Target {
    producers_on_stack()
        .into_iter()
        .fold(target, |current, producer| copy_for(producer, current))
}

fn copy_for(producer: EffectId, target: Target) -> Target {
    if let Some(copy) = producer.with_copies(|map| map.lookup(target)).flatten() {
        return copy;
    }
    let Some(copy) = target.shallow_copy() else {
        return target;
    };
    tracing::trace!(pass = ?producer, raw = ?target, ?copy, "draft copy");
    producer.with_copies(|map| map.insert(target, copy));
    copy
}

/// Lookup-only resolution used by view validation: never creates copies.
pub(crate) fn resolve_existing(target: Target) -> Target {
    producers_on_stack().into_iter().fold(target, |current, producer| {
        producer
            .with_copies(|map| map.lookup(current))
            .flatten()
            .unwrap_or(current)
    })
}

/// Retire copies: notify anything that read them, then free them.
fn retire(copies: Vec<(Target, Target)>) {
    for (_, copy) in copies {
        trigger(copy, TriggerOp::Modified, Key::Iterate, None, None);
        copy.dispose();
    }
}

/// An isolated mutation pass.
///
/// While [`run`](Self::run) executes, every handle operation is redirected
/// from the raw target to a private shallow copy made on first touch.
/// Observers of the raw targets see nothing until [`commit`](Self::commit)
/// replays the copies; [`discard`](Self::discard) (or dropping the pass)
/// throws them away.
///
/// # Usage
/// ```ignore
/// let pass = MutationPass::new();
/// pass.run(|| {
///     state.set("count", 1)?;
///     state.set("label", "one")
/// })?;
/// assert_eq!(target.peek("count"), Value::from(0)); // not yet visible
/// pass.commit();
/// assert_eq!(target.peek("count"), Value::from(1));
/// ```
pub struct MutationPass {
    producer: Effect,
}

impl MutationPass {
    /// Open a pass with an empty copy map.
    pub fn new() -> Self {
        let id = effect_arena_insert(EffectMetadata::new_producer());
        MutationPass {
            producer: Effect::from_raw(id),
        }
    }

    /// Run `f` inside the pass. Can be called repeatedly; copies persist
    /// between calls until commit or discard.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _pass = PassGuard::new();
        let _guard = CurrentEffectGuard::new(self.producer.id());
        f()
    }

    /// The copy made for `raw` in this pass, if it was touched.
    pub fn copy_of(&self, raw: Target) -> Option<Target> {
        self.producer
            .id()
            .with_copies(|map| map.copies.get(&raw).copied())
            .flatten()
    }

    /// The raw target a copy of this pass stands in for.
    pub fn base_of(&self, copy: Target) -> Option<Target> {
        self.producer
            .id()
            .with_copies(|map| map.bases.get(&copy).copied())
            .flatten()
    }

    /// Number of targets touched so far.
    pub fn copy_count(&self) -> usize {
        self.producer
            .id()
            .with_copies(|map| map.copies.len())
            .unwrap_or(0)
    }

    /// Publish the staged contents onto the raw targets, then free the copies.
    ///
    /// Each raw target receives ordinary tracked writes, so its observers are
    /// notified exactly as if the writes had been made directly.
    pub fn commit(self) {
        let copies = self.take_copies();
        tracing::trace!(copies = copies.len(), "commit mutation pass");
        for (raw, copy) in &copies {
            replay(*raw, *copy);
        }
        retire(copies);
    }

    /// Throw the staged contents away.
    pub fn discard(self) {
        drop(self);
    }

    fn take_copies(&self) -> Vec<(Target, Target)> {
        self.producer
            .id()
            .with_copies(CopyMap::drain)
            .unwrap_or_default()
    }
}

impl Default for MutationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MutationPass {
    fn drop(&mut self) {
        retire(self.take_copies());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::reactive;
    use crate::value::Value;

    #[test]
    fn copies_are_made_once_per_target() {
        let target = Target::record([("a", 1)]);
        let state = reactive(target);
        let pass = MutationPass::new();

        pass.run(|| {
            state.set("a", 2).unwrap();
            state.set("a", 3).unwrap();
            assert_eq!(state.get("a").as_f64(), Some(3.0));
        });

        assert_eq!(pass.copy_count(), 1);
        let copy = pass.copy_of(target).unwrap();
        assert_eq!(pass.base_of(copy), Some(target));
        assert_eq!(copy.peek("a"), Value::from(3));
        assert_eq!(target.peek("a"), Value::from(1));

        pass.discard();
        assert!(!copy.exists());
        assert_eq!(target.peek("a"), Value::from(1));
        target.dispose();
    }

    #[test]
    fn commit_replays_onto_raw() {
        let target = Target::record([("a", 1), ("gone", 0)]);
        let list = Target::sequence([1, 2, 3]);
        let state = reactive(target);
        let items = reactive(list);

        let pass = MutationPass::new();
        pass.run(|| {
            state.set("a", 5).unwrap();
            state.set("new", true).unwrap();
            state.delete("gone").unwrap();
            items.pop().unwrap();
            items.unshift(0).unwrap();
        });
        assert_eq!(list.raw_len(), 3);
        assert_eq!(target.peek("new"), Value::Null);

        pass.commit();

        assert_eq!(target.peek("a"), Value::from(5));
        assert_eq!(target.peek("new"), Value::from(true));
        assert_eq!(target.raw_len(), 2);
        assert_eq!(list.peek(0usize), Value::from(0));
        assert_eq!(list.peek(2usize), Value::from(2));
        assert_eq!(list.raw_len(), 3);

        target.dispose();
        list.dispose();
    }

    #[test]
    fn nested_pass_starts_from_enclosing_draft() {
        let target = Target::record([("a", 1)]);
        let state = reactive(target);
        let outer = MutationPass::new();
        let inner = MutationPass::new();

        outer.run(|| {
            state.set("a", 2).unwrap();
            inner.run(|| {
                assert_eq!(state.get("a").as_f64(), Some(2.0));
                state.set("a", 3).unwrap();
            });
            assert_eq!(state.get("a").as_f64(), Some(2.0));
        });

        let outer_copy = outer.copy_of(target).unwrap();
        assert_eq!(inner.base_of(inner.copy_of(outer_copy).unwrap()), Some(outer_copy));

        inner.discard();
        outer.discard();
        target.dispose();
    }
}
