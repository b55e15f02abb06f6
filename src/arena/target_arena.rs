// Target arena - storage for raw composite values
//
// Every record or sequence that can be wrapped lives here as a Node and is
// addressed by a Target (slab index + generation). Nodes hold plain Values;
// nested composites are Value::Ref links to other slots, so a shallow copy
// is just a clone of one Node.
//
// Slots are reused by the slab, so every Target carries the generation it
// was allocated under. A stale Target (disposed, or a retired draft copy)
// never aliases a newer node: lookups compare generations and report None.

use parking_lot::RwLock;
use slab::Slab;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::hash::FastIndexMap;
use crate::value::{Key, Value};

static TARGET_ARENA: RwLock<Slab<Slot>> = RwLock::new(Slab::new());

static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

struct Slot {
    generation: u32,
    node: Node,
}

/// Raw composite contents.
#[derive(Clone, Debug)]
pub(crate) enum Node {
    Record(FastIndexMap<String, Value>),
    /// `None` marks a hole: a deleted or padded slot that is not present.
    Sequence(Vec<Option<Value>>),
}

impl Node {
    pub fn is_sequence(&self) -> bool {
        matches!(self, Node::Sequence(_))
    }

    /// Bring a caller-supplied key into this node's key space.
    pub fn normalize(&self, key: Key) -> Key {
        match self {
            Node::Record(_) => key.for_record(),
            Node::Sequence(_) => key.for_sequence(),
        }
    }

    /// The enumeration sentinel that ADD/DELETE triggers also notify.
    pub fn enumeration_key(&self) -> Key {
        match self {
            Node::Record(_) => Key::Iterate,
            Node::Sequence(_) => Key::Length,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Record(fields) => fields.len(),
            Node::Sequence(items) => items.len(),
        }
    }

    /// Read a normalized key. Missing keys and sentinels without a value read
    /// as `Null`.
    pub fn get(&self, key: &Key) -> Value {
        match (self, key) {
            (Node::Record(fields), Key::Field(name)) => {
                fields.get(name).cloned().unwrap_or_default()
            }
            (Node::Sequence(items), Key::Index(i)) => {
                items.get(*i).cloned().flatten().unwrap_or_default()
            }
            (Node::Sequence(items), Key::Length) => Value::from(items.len()),
            _ => Value::Null,
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        match (self, key) {
            (Node::Record(fields), Key::Field(name)) => fields.contains_key(name),
            (Node::Sequence(items), Key::Index(i)) => items.get(*i).is_some_and(Option::is_some),
            (Node::Sequence(_), Key::Length) => true,
            _ => false,
        }
    }

    pub fn keys(&self) -> Vec<Key> {
        match self {
            Node::Record(fields) => fields.keys().cloned().map(Key::Field).collect(),
            Node::Sequence(items) => items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.is_some())
                .map(|(i, _)| Key::Index(i))
                .collect(),
        }
    }

    /// Store `value` under a normalized key, returning whatever was replaced.
    ///
    /// Writing past the end of a sequence pads the gap with holes. Keys the
    /// node cannot hold (named fields on a sequence, sentinels) are ignored
    /// and handed back.
    pub fn assign(&mut self, key: &Key, value: Value) -> Result<Option<Value>, Value> {
        match (self, key) {
            (Node::Record(fields), Key::Field(name)) => Ok(fields.insert(name.clone(), value)),
            (Node::Sequence(items), Key::Index(i)) => {
                if *i >= items.len() {
                    items.resize(*i + 1, None);
                }
                Ok(items[*i].replace(value))
            }
            _ => Err(value),
        }
    }

    /// Remove a normalized key. Sequence slots become holes so later indices
    /// keep their positions.
    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        match (self, key) {
            (Node::Record(fields), Key::Field(name)) => fields.shift_remove(name),
            (Node::Sequence(items), Key::Index(i)) => items.get_mut(*i).and_then(Option::take),
            _ => None,
        }
    }

    /// Resize a sequence, returning the values in the dropped tail. Growing
    /// pads with holes.
    pub fn set_len(&mut self, len: usize) -> Vec<Value> {
        match self {
            Node::Sequence(items) if len < items.len() => {
                items.split_off(len).into_iter().flatten().collect()
            }
            Node::Sequence(items) => {
                items.resize(len, None);
                Vec::new()
            }
            Node::Record(_) => Vec::new(),
        }
    }
}

/// Identity of a raw composite value.
///
/// `Target` is a lightweight `Copy` handle; the contents live in a global
/// arena. Build one with [`Target::record`] or [`Target::sequence`] and wrap
/// it with [`reactive`](crate::reactive()) to read and write it with
/// dependency tracking.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Target {
    index: u32,
    generation: u32,
}

impl Target {
    /// Allocate a record from `(field, value)` pairs, keeping their order.
    pub fn record<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let fields = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        target_arena_insert(Node::Record(fields))
    }

    /// Allocate a sequence.
    pub fn sequence<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        target_arena_insert(Node::Sequence(
            items.into_iter().map(|item| Some(item.into())).collect(),
        ))
    }

    /// Whether the target is still allocated.
    pub fn exists(self) -> bool {
        self.with(|_| ()).is_some()
    }

    /// Whether the target is an indexed sequence.
    pub fn is_sequence(self) -> bool {
        self.with(Node::is_sequence).unwrap_or(false)
    }

    /// Read a key straight from the raw storage: no tracking, no draft
    /// redirection, no wrapping.
    pub fn peek(self, key: impl Into<Key>) -> Value {
        let key = key.into();
        self.with(|node| node.get(&node.normalize(key)))
            .unwrap_or_default()
    }

    /// Number of fields or elements in the raw storage.
    pub fn raw_len(self) -> usize {
        self.with(Node::len).unwrap_or(0)
    }

    /// Free the target, its wrappers' registry entries and its access records.
    ///
    /// Nothing is collected automatically: a target stays allocated until it
    /// is disposed. Handles that still point at a disposed target read
    /// `Null` and ignore writes.
    pub fn dispose(self) {
        let removed = target_arena_remove(self);
        crate::arena::dep_arena::purge_target(self);
        crate::registry::purge(self);
        drop(removed);
    }

    /// Access the node with a closure (read-only).
    ///
    /// Returns None if the target has been disposed (stale access).
    pub(crate) fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&Node) -> R,
    {
        let arena = TARGET_ARENA.read();
        arena
            .get(self.index as usize)
            .filter(|slot| slot.generation == self.generation)
            .map(|slot| f(&slot.node))
    }

    /// Access the node with a closure (mutable).
    ///
    /// Anything the closure displaces must be returned rather than dropped
    /// inside it: dropping a stored wrapper touches the wrapper registry.
    pub(crate) fn with_mut<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Node) -> R,
    {
        let mut arena = TARGET_ARENA.write();
        arena
            .get_mut(self.index as usize)
            .filter(|slot| slot.generation == self.generation)
            .map(|slot| f(&mut slot.node))
    }

    /// Allocate a shallow duplicate of this target.
    pub(crate) fn shallow_copy(self) -> Option<Target> {
        let node = self.with(Node::clone)?;
        Some(target_arena_insert(node))
    }
}

/// Insert a node into the arena and return its identity.
pub(crate) fn target_arena_insert(node: Node) -> Target {
    let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
    let mut arena = TARGET_ARENA.write();
    let index = arena.insert(Slot { generation, node });
    Target {
        index: index as u32,
        generation,
    }
}

/// Remove a node from the arena, handing it back so it is dropped after the
/// lock is released.
pub(crate) fn target_arena_remove(target: Target) -> Option<Node> {
    let mut arena = TARGET_ARENA.write();
    let live = arena
        .get(target.index as usize)
        .is_some_and(|slot| slot.generation == target.generation);
    live.then(|| arena.remove(target.index as usize).node)
}
