use std::fmt;
use std::sync::Arc;

use crate::arena::{
    Node, Observed, Target, TrackingPause, TriggerOp, track, trigger, trigger_keys,
};
use crate::draft;
use crate::error::ReactiveError;
use crate::registry::{self, Variant, WrapperInner};
use crate::value::{Key, Value, has_changed, to_raw};

/// Tracked handle over a raw [`Target`].
///
/// Reads through a handle are recorded against the running computation;
/// writes notify every computation whose last run read the written key.
/// Handles are cheap to clone and all clones share one identity: wrapping
/// the same target under the same variant always hands back the same
/// wrapper while any handle to it is alive.
///
/// # Usage
/// ```ignore
/// let state = reactive(Target::record([("count", 0)]));
///
/// let effect = Effect::new({
///     let state = state.clone();
///     move || println!("count = {:?}", state.get("count"))
/// });
///
/// state.set("count", 1)?; // effect re-runs
/// ```
#[derive(Clone)]
pub struct Reactive {
    inner: Arc<WrapperInner>,
}

/// Result of reading a key through a handle.
#[derive(Clone, Debug)]
pub enum Item {
    /// A scalar, or a raw reference returned by a shallow handle.
    Plain(Value),
    /// A nested composite, wrapped with the parent handle's variant (or a
    /// wrapper that was stored as-is).
    Nested(Reactive),
}

impl Item {
    /// Numeric content, if this is a plain number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Item::Plain(value) => value.as_f64(),
            Item::Nested(_) => None,
        }
    }

    /// Boolean content, if this is a plain boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Item::Plain(value) => value.as_bool(),
            Item::Nested(_) => None,
        }
    }

    /// String content, if this is a plain string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Item::Plain(value) => value.as_str(),
            Item::Nested(_) => None,
        }
    }

    /// The nested handle, if this is one.
    pub fn as_reactive(&self) -> Option<&Reactive> {
        match self {
            Item::Nested(handle) => Some(handle),
            Item::Plain(_) => None,
        }
    }

    /// True for a plain `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Item::Plain(Value::Null))
    }

    /// Convert back into a storable value.
    pub fn into_value(self) -> Value {
        match self {
            Item::Plain(value) => value,
            Item::Nested(handle) => Value::Wrapped(handle),
        }
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Item::Plain(a), Item::Plain(b)) => a == b,
            (Item::Nested(a), Item::Nested(b)) => Reactive::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Item> for Value {
    fn from(item: Item) -> Self {
        item.into_value()
    }
}

impl fmt::Debug for Reactive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactive")
            .field("target", &self.inner.target)
            .field("variant", &self.inner.variant)
            .finish()
    }
}

impl Reactive {
    pub(crate) fn from_inner(inner: Arc<WrapperInner>) -> Self {
        Self { inner }
    }

    /// Whether two handles are the same wrapper.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// The raw target behind this handle.
    pub fn target(&self) -> Target {
        self.inner.target
    }

    /// Which of the four wrapper variants this is.
    pub fn variant(&self) -> Variant {
        self.inner.variant
    }

    /// True for the writable variants.
    pub fn is_reactive(&self) -> bool {
        !self.variant().is_readonly()
    }

    /// True for the read-only variants.
    pub fn is_readonly(&self) -> bool {
        self.variant().is_readonly()
    }

    /// True for the shallow variants.
    pub fn is_shallow(&self) -> bool {
        self.variant().is_shallow()
    }

    /// Target the operation should act on: the raw one, or the draft copy of
    /// the innermost running mutation pass.
    fn resolved(&self) -> Target {
        draft::resolve(self.target())
    }

    fn to_item(&self, value: Value) -> Item {
        match value {
            Value::Ref(target) => match self.variant().nested() {
                Some(variant) => Item::Nested(registry::wrap(target, variant)),
                None => Item::Plain(Value::Ref(target)),
            },
            // A deep read-only handle never hands out a writable wrapper.
            Value::Wrapped(handle)
                if self.variant() == Variant::ReadOnly && !handle.is_readonly() =>
            {
                Item::Nested(registry::wrap(handle.target(), Variant::ReadOnly))
            }
            Value::Wrapped(handle) => Item::Nested(handle),
            other => Item::Plain(other),
        }
    }

    /// Stored form of a value written through this handle.
    fn store_form(&self, value: Value) -> Value {
        if self.is_shallow() || value.is_sealed_wrapper() {
            value
        } else {
            to_raw(&value)
        }
    }

    fn reject_write(&self, op: &str, key: Key) -> ReactiveError {
        if cfg!(debug_assertions) {
            tracing::warn!(
                target_id = ?self.target(),
                "{op} operation on key \"{key}\" failed: target is readonly"
            );
        }
        cov_mark::hit!(readonly_write_rejected);
        ReactiveError::ReadOnly { key }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read `key`, recording the read against the running computation.
    ///
    /// Missing keys read as `Null`. Nested composites come back wrapped with
    /// this handle's variant; shallow handles return them raw.
    pub fn get(&self, key: impl Into<Key>) -> Item {
        let target = self.resolved();
        let key = key.into();
        let Some((key, value)) = target.with(move |node| {
            let key = node.normalize(key);
            let value = node.get(&key);
            (key, value)
        }) else {
            return Item::Plain(Value::Null);
        };
        track(target, key, Observed::Value(value.clone()));
        self.to_item(value)
    }

    /// Whether `key` is present, recording a presence read.
    pub fn has(&self, key: impl Into<Key>) -> bool {
        let target = self.resolved();
        let key = key.into();
        let Some((key, present)) = target.with(move |node| {
            let key = node.normalize(key);
            let present = node.contains(&key);
            (key, present)
        }) else {
            return false;
        };
        track(target, key, Observed::Present(present));
        present
    }

    /// The target's keys (record fields in insertion order, or the present
    /// sequence indices), recording an enumeration read.
    pub fn keys(&self) -> Vec<Key> {
        let target = self.resolved();
        let Some((keys, sequence_len)) =
            target.with(|node| (node.keys(), node.is_sequence().then(|| node.len())))
        else {
            return Vec::new();
        };
        if let Some(len) = sequence_len {
            track(target, Key::Length, Observed::Value(Value::from(len)));
        } else {
            track(target, Key::Iterate, Observed::Keys(keys.clone()));
        }
        keys
    }

    /// Number of elements (sequences) or fields (records).
    pub fn len(&self) -> usize {
        if self.resolved().is_sequence() {
            self.get(Key::Length).as_f64().map_or(0, |n| n as usize)
        } else {
            self.keys().len()
        }
    }

    /// Whether [`len`](Self::len) is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a sequence holds `needle`.
    pub fn contains(&self, needle: impl Into<Value>) -> bool {
        self.search(&needle.into(), false).is_some()
    }

    /// First position of `needle` in a sequence.
    pub fn index_of(&self, needle: impl Into<Value>) -> Option<usize> {
        self.search(&needle.into(), false)
    }

    /// Last position of `needle` in a sequence.
    pub fn last_index_of(&self, needle: impl Into<Value>) -> Option<usize> {
        self.search(&needle.into(), true)
    }

    /// Identity lookup over a sequence. Every index is tracked, then the
    /// needle is compared as given and, failing that, unwrapped to its raw
    /// reference (stored elements are raw, callers usually hold handles).
    fn search(&self, needle: &Value, from_end: bool) -> Option<usize> {
        let target = self.resolved();
        let items = target
            .with(|node| match node {
                Node::Sequence(items) => items.clone(),
                Node::Record(_) => Vec::new(),
            })
            .unwrap_or_default();

        track(target, Key::Length, Observed::Value(Value::from(items.len())));
        for (i, item) in items.iter().enumerate() {
            track(target, Key::Index(i), Observed::Value(item.clone().unwrap_or_default()));
        }

        // Holes never match.
        let find = |needle: &Value| {
            let matches = |item: &Option<Value>| item.as_ref() == Some(needle);
            if from_end {
                items.iter().rposition(matches)
            } else {
                items.iter().position(matches)
            }
        };
        find(needle).or_else(|| {
            let raw = to_raw(needle);
            if raw == *needle {
                return None;
            }
            cov_mark::hit!(lookup_retried_unwrapped);
            find(&raw)
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write `key`, notifying computations that read it.
    ///
    /// Writable handles store composites raw unless the value is itself a
    /// read-only or shallow wrapper; shallow handles store values as given.
    /// Fails on read-only handles and when the key currently holds a stored
    /// read-only wrapper.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<(), ReactiveError> {
        let key = key.into();
        if self.is_readonly() {
            return Err(self.reject_write("Set", key));
        }
        let value = value.into();
        let target = self.resolved();

        let current = target.with(|node| node.get(&node.normalize(key.clone())));
        if let Some(Value::Wrapped(stored)) = &current {
            if stored.is_readonly() && has_changed(&value, &Value::Wrapped(stored.clone())) {
                return Err(self.reject_write("Set", key));
            }
        }
        drop(current);

        write_key(target, key, self.store_form(value));
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    ///
    /// A deleted sequence slot becomes a hole; the length is unchanged.
    pub fn delete(&self, key: impl Into<Key>) -> Result<bool, ReactiveError> {
        let key = key.into();
        if self.is_readonly() {
            return Err(self.reject_write("Delete", key));
        }
        Ok(delete_key(self.resolved(), key))
    }

    /// Reparenting is never allowed: it would break wrapper identity.
    pub fn set_prototype_of(&self, _proto: Option<Target>) -> Result<(), ReactiveError> {
        Err(ReactiveError::PrototypeLocked)
    }

    // =========================================================================
    // Sequence mutators
    // =========================================================================

    /// Run a length-altering mutation on the resolved sequence with tracking
    /// paused, then issue one MODIFIED trigger named after the operation.
    fn mutate_sequence<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Vec<Option<Value>>) -> R,
    ) -> Result<Option<R>, ReactiveError> {
        if self.is_readonly() {
            return Err(self.reject_write(op, Key::from(op)));
        }
        let pause = TrackingPause::new();
        let target = self.resolved();
        let result = target
            .with_mut(|node| match node {
                Node::Sequence(items) => Some(f(items)),
                Node::Record(_) => None,
            })
            .flatten();
        drop(pause);

        if result.is_some() {
            trigger(target, TriggerOp::Modified, Key::from(op), None, None);
        }
        Ok(result)
    }

    /// Append to a sequence, returning the new length.
    pub fn push(&self, value: impl Into<Value>) -> Result<usize, ReactiveError> {
        let value = self.store_form(value.into());
        let len = self.mutate_sequence("push", |items| {
            items.push(Some(value));
            items.len()
        })?;
        Ok(len.unwrap_or(0))
    }

    /// Remove and return the last element.
    pub fn pop(&self) -> Result<Option<Item>, ReactiveError> {
        let popped = self
            .mutate_sequence("pop", |items| items.pop().map(Option::unwrap_or_default))?
            .flatten();
        Ok(popped.map(|value| self.to_item(value)))
    }

    /// Remove and return the first element.
    pub fn shift(&self) -> Result<Option<Item>, ReactiveError> {
        let shifted = self
            .mutate_sequence("shift", |items| {
                (!items.is_empty()).then(|| items.remove(0).unwrap_or_default())
            })?
            .flatten();
        Ok(shifted.map(|value| self.to_item(value)))
    }

    /// Prepend to a sequence, returning the new length.
    pub fn unshift(&self, value: impl Into<Value>) -> Result<usize, ReactiveError> {
        let value = self.store_form(value.into());
        let len = self.mutate_sequence("unshift", |items| {
            items.insert(0, Some(value));
            items.len()
        })?;
        Ok(len.unwrap_or(0))
    }

    /// Remove `delete_count` elements at `start` and insert `items` in their
    /// place, returning the removed elements. Out-of-range bounds are clamped.
    pub fn splice<I>(
        &self,
        start: usize,
        delete_count: usize,
        items: I,
    ) -> Result<Vec<Item>, ReactiveError>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let inserted: Vec<Value> = items
            .into_iter()
            .map(|value| self.store_form(value.into()))
            .collect();
        let removed = self
            .mutate_sequence("splice", |current| {
                let start = start.min(current.len());
                let end = start.saturating_add(delete_count).min(current.len());
                current
                    .splice(start..end, inserted.into_iter().map(Some))
                    .map(Option::unwrap_or_default)
                    .collect::<Vec<_>>()
            })?
            .unwrap_or_default();
        Ok(removed.into_iter().map(|value| self.to_item(value)).collect())
    }
}

/// Assign an already stored-form value and trigger ADD or SET.
///
/// Shared by handle writes and draft commits. Writing `Length` on a sequence
/// resizes it.
pub(crate) fn write_key(target: Target, key: Key, value: Value) {
    let Some((key, old, had_key, is_sequence)) = target.with(move |node| {
        let key = node.normalize(key);
        let had_key = node.contains(&key);
        let old = node.get(&key);
        (key, old, had_key, node.is_sequence())
    }) else {
        return;
    };

    if is_sequence && key == Key::Length {
        if let Some(len) = value.as_f64().filter(|n| *n >= 0.0 && n.fract() == 0.0) {
            set_length(target, len as usize);
        }
        return;
    }

    let displaced = target.with_mut(|node| node.assign(&key, value.clone()));
    if !matches!(displaced, Some(Ok(_))) {
        return;
    }
    drop(displaced);

    // An unwrapped write is compared against the unwrapped old value.
    let compared = if value.is_sealed_wrapper() {
        old.clone()
    } else {
        to_raw(&old)
    };
    if !had_key {
        trigger(target, TriggerOp::Add, key, Some(&value), None);
    } else if has_changed(&value, &compared) {
        trigger(target, TriggerOp::Set, key, Some(&value), Some(&old));
    }
}

/// Truncate or pad a sequence. Observers of the length and of every dropped
/// index are notified in one trigger.
pub(crate) fn set_length(target: Target, len: usize) {
    let Some((old_len, dropped)) = target.with_mut(|node| (node.len(), node.set_len(len))) else {
        return;
    };
    drop(dropped);
    if old_len == len {
        return;
    }
    let mut keys = vec![Key::Length];
    keys.extend((len..old_len).map(Key::Index));
    trigger_keys(
        target,
        TriggerOp::Set,
        &keys,
        Some(&Value::from(len)),
        Some(&Value::from(old_len)),
    );
}

/// Remove a key and trigger DELETE if it was present.
pub(crate) fn delete_key(target: Target, key: Key) -> bool {
    let Some((key, had_key, old)) = target.with_mut(move |node| {
        let key = node.normalize(key);
        let had_key = node.contains(&key);
        let old = node.remove(&key);
        (key, had_key, old)
    }) else {
        return false;
    };
    if had_key {
        trigger(target, TriggerOp::Delete, key, None, old.as_ref());
    }
    had_key
}

/// Make `raw` hold exactly what `copy` holds, through the ordinary write
/// paths so raw observers see ADD/SET/DELETE triggers.
pub(crate) fn replay(raw: Target, copy: Target) {
    let Some(node) = copy.with(Node::clone) else {
        return;
    };
    match node {
        Node::Record(fields) => {
            let stale: Vec<Key> = raw
                .with(|node| node.keys())
                .unwrap_or_default()
                .into_iter()
                .filter(|key| !matches!(key, Key::Field(name) if fields.contains_key(name)))
                .collect();
            for key in stale {
                delete_key(raw, key);
            }
            for (name, value) in fields {
                write_key(raw, Key::Field(name), value);
            }
        }
        Node::Sequence(items) => {
            let len = items.len();
            for (i, item) in items.into_iter().enumerate() {
                match item {
                    Some(value) => write_key(raw, Key::Index(i), value),
                    None => {
                        delete_key(raw, Key::Index(i));
                    }
                }
            }
            if raw.raw_len() != len {
                set_length(raw, len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Effect;
    use crate::registry::{reactive, readonly, shallow_reactive, shallow_readonly};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn nested_reads_follow_variant() {
        let child = Target::record([("x", 1)]);
        let parent = Target::record([("child", child)]);

        let deep = reactive(parent).get("child");
        assert!(Reactive::ptr_eq(deep.as_reactive().unwrap(), &reactive(child)));

        let ro = readonly(parent).get("child");
        assert!(ro.as_reactive().unwrap().is_readonly());

        let shallow = shallow_reactive(parent).get("child");
        assert_eq!(shallow, Item::Plain(Value::Ref(child)));

        parent.dispose();
        child.dispose();
    }

    #[test]
    fn set_unwraps_mutable_handles() {
        let child = Target::record([("x", 1)]);
        let parent = Target::record::<_, &str, Value>([]);
        let state = reactive(parent);

        state.set("child", reactive(child)).unwrap();
        assert_eq!(parent.peek("child"), Value::Ref(child));

        let sealed = readonly(child);
        state.set("sealed", &sealed).unwrap();
        assert!(matches!(parent.peek("sealed"), Value::Wrapped(_)));

        parent.dispose();
        child.dispose();
    }

    #[test]
    fn stored_readonly_wrapper_blocks_overwrite() {
        cov_mark::check!(readonly_write_rejected);
        let child = Target::record([("x", 1)]);
        let parent = Target::record([("sealed", readonly(child))]);
        let state = reactive(parent);

        assert!(matches!(
            state.set("sealed", 5),
            Err(ReactiveError::ReadOnly { .. })
        ));

        parent.dispose();
        child.dispose();
    }

    #[test]
    fn shallow_readonly_rejects_writes() {
        let target = Target::record([("a", 1)]);
        let state = shallow_readonly(target);
        assert_eq!(
            state.set("a", 2),
            Err(ReactiveError::ReadOnly { key: Key::from("a") })
        );
        assert!(state.delete("a").is_err());
        assert!(state.push(1).is_err());
        assert_eq!(target.peek("a"), Value::from(1));
        target.dispose();
    }

    #[test]
    fn sequence_length_and_index_keys() {
        let target = Target::sequence([1, 2, 3]);
        let list = reactive(target);

        assert_eq!(list.len(), 3);
        assert_eq!(list.get("1").as_f64(), Some(2.0));
        list.set(Key::Length, 1).unwrap();
        assert_eq!(target.raw_len(), 1);
        list.set(3usize, 9).unwrap();
        assert_eq!(target.raw_len(), 4);
        assert!(list.get(2usize).is_null());

        target.dispose();
    }

    #[test]
    fn index_of_retries_with_raw_needle() {
        cov_mark::check!(lookup_retried_unwrapped);
        let element = Target::record([("id", 1)]);
        let target = Target::sequence([Value::from(0), Value::Ref(element)]);
        let list = reactive(target);

        let handle = list.get(1usize);
        let handle = handle.as_reactive().unwrap();
        assert_eq!(list.index_of(handle), Some(1));
        assert!(list.contains(handle));
        assert_eq!(list.last_index_of(0), Some(0));
        assert_eq!(list.index_of(42), None);

        target.dispose();
        element.dispose();
    }

    #[test]
    fn splice_clamps_and_returns_removed() {
        let target = Target::sequence([1, 2, 3, 4]);
        let list = reactive(target);

        let removed = list.splice(1, 2, [Value::from(9)]).unwrap();
        assert_eq!(removed, vec![Item::Plain(2.into()), Item::Plain(3.into())]);
        assert_eq!(target.raw_len(), 3);
        assert_eq!(target.peek(1usize), Value::from(9));

        let removed = list.splice(10, 5, Vec::<Value>::new()).unwrap();
        assert!(removed.is_empty());

        assert_eq!(list.unshift(0).unwrap(), 4);
        assert_eq!(list.shift().unwrap(), Some(Item::Plain(0.into())));
        assert_eq!(list.pop().unwrap(), Some(Item::Plain(4.into())));

        target.dispose();
    }

    #[test]
    fn deleted_sequence_slot_is_a_hole() {
        let target = Target::sequence([1, 2, 3]);
        let list = reactive(target);

        assert!(list.delete(1usize).unwrap());
        assert!(!list.has(1usize));
        assert!(!list.delete(1usize).unwrap());
        assert!(list.get(1usize).is_null());
        assert_eq!(list.len(), 3);
        assert_eq!(list.keys(), vec![Key::Index(0), Key::Index(2)]);
        assert_eq!(list.index_of(Value::Null), None);

        // Filling the hole is an addition.
        list.set(1usize, 7).unwrap();
        assert!(list.has(1usize));
        assert_eq!(list.pop().unwrap(), Some(Item::Plain(3.into())));

        // Padding leaves holes too.
        list.set(Key::Length, 4).unwrap();
        assert!(!list.has(3usize));

        target.dispose();
    }

    #[test]
    fn rewriting_a_stored_wrapper_by_handle_is_not_a_change() {
        let child = Target::record([("x", 1)]);
        let parent = Target::record([("c", Value::Null)]);
        let state = reactive(parent);
        state.set("c", shallow_reactive(child)).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let _effect = Effect::new({
            let state = state.clone();
            let runs = runs.clone();
            move || {
                state.get("c");
                runs.fetch_add(1, Ordering::Relaxed);
            }
        });

        // Same target through a mutable handle: stored raw, nothing to notify.
        state.set("c", reactive(child)).unwrap();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
        assert_eq!(parent.peek("c"), Value::Ref(child));

        parent.dispose();
        child.dispose();
    }

    #[test]
    fn prototype_is_locked() {
        let target = Target::record([("a", 1)]);
        assert_eq!(
            reactive(target).set_prototype_of(None),
            Err(ReactiveError::PrototypeLocked)
        );
        target.dispose();
    }

    #[test]
    fn record_delete_and_has() {
        let target = Target::record([("a", 1), ("b", 2)]);
        let state = reactive(target);

        assert!(state.has("a"));
        assert!(state.delete("a").unwrap());
        assert!(!state.delete("a").unwrap());
        assert!(!state.has("a"));
        assert_eq!(state.keys(), vec![Key::from("b")]);

        target.dispose();
    }
}
