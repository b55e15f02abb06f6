// Wrapper registry
//
// Maps (raw target, variant) to the live wrapper for that pair:
//
//   (Target, Variant) -> Weak<WrapperInner>
//
// Handles hold the strong side. The registry only ever holds a Weak, so an
// association never keeps a wrapper alive; the last handle to go removes its
// own entry. Target::dispose() purges every variant at once.

use papaya::{Compute, HashMap as PapayaHashMap, Operation};
use std::sync::{Arc, LazyLock, Weak};

use crate::arena::Target;
use crate::reactive::Reactive;

static REGISTRY: LazyLock<PapayaHashMap<(Target, Variant), Weak<WrapperInner>>> =
    LazyLock::new(PapayaHashMap::new);

/// The four interception variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Tracked, writable, nested composites wrapped on read.
    Mutable,
    /// Tracked, writes rejected, nested composites wrapped read-only.
    ReadOnly,
    /// Tracked, writable, nested composites returned raw.
    ShallowMutable,
    /// Tracked, writes rejected, nested composites returned raw.
    ShallowReadOnly,
}

impl Variant {
    /// Whether writes through this variant are rejected.
    pub fn is_readonly(self) -> bool {
        matches!(self, Variant::ReadOnly | Variant::ShallowReadOnly)
    }

    /// Whether nested composites are returned without wrapping.
    pub fn is_shallow(self) -> bool {
        matches!(self, Variant::ShallowMutable | Variant::ShallowReadOnly)
    }

    /// The variant nested composites are wrapped with, if any.
    pub(crate) fn nested(self) -> Option<Variant> {
        match self {
            Variant::Mutable => Some(Variant::Mutable),
            Variant::ReadOnly => Some(Variant::ReadOnly),
            Variant::ShallowMutable | Variant::ShallowReadOnly => None,
        }
    }
}

const ALL_VARIANTS: [Variant; 4] = [
    Variant::Mutable,
    Variant::ReadOnly,
    Variant::ShallowMutable,
    Variant::ShallowReadOnly,
];

/// Shared state behind every clone of one wrapper handle.
#[derive(Debug)]
pub(crate) struct WrapperInner {
    pub target: Target,
    pub variant: Variant,
}

impl Drop for WrapperInner {
    fn drop(&mut self) {
        let guard = REGISTRY.pin();
        // Only forget the entry if nobody re-wrapped the target in the meantime.
        let _ = guard.compute((self.target, self.variant), |entry| match entry {
            Some((_, weak)) if weak.strong_count() == 0 => Operation::Remove,
            _ => Operation::Abort(()),
        });
    }
}

/// Return the live wrapper for `(target, variant)`, creating it on first use.
pub(crate) fn wrap(target: Target, variant: Variant) -> Reactive {
    let fresh = Arc::new(WrapperInner { target, variant });
    let guard = REGISTRY.pin();
    let result = guard.compute((target, variant), |entry| {
        match entry.and_then(|(_, weak)| weak.upgrade()) {
            Some(existing) => Operation::Abort(existing),
            None => Operation::Insert(Arc::downgrade(&fresh)),
        }
    });
    let inner = match result {
        Compute::Aborted(existing) => existing,
        _ => {
            tracing::trace!(?target, ?variant, "wrap");
            fresh
        }
    };
    Reactive::from_inner(inner)
}

/// Whether a wrapper for `(target, variant)` is currently alive.
#[cfg(test)]
pub(crate) fn is_registered(target: Target, variant: Variant) -> bool {
    let guard = REGISTRY.pin();
    guard
        .get(&(target, variant))
        .is_some_and(|weak| weak.strong_count() > 0)
}

/// Forget every wrapper association of `target`.
pub(crate) fn purge(target: Target) {
    let guard = REGISTRY.pin();
    for variant in ALL_VARIANTS {
        guard.remove(&(target, variant));
    }
}

/// Wrap `target` in the mutable, deeply tracked variant.
pub fn reactive(target: Target) -> Reactive {
    wrap(target, Variant::Mutable)
}

/// Wrap `target` in the read-only, deeply tracked variant.
pub fn readonly(target: Target) -> Reactive {
    wrap(target, Variant::ReadOnly)
}

/// Wrap `target` in the mutable variant that leaves nested composites raw.
pub fn shallow_reactive(target: Target) -> Reactive {
    wrap(target, Variant::ShallowMutable)
}

/// Wrap `target` in the read-only variant that leaves nested composites raw.
pub fn shallow_readonly(target: Target) -> Reactive {
    wrap(target, Variant::ShallowReadOnly)
}
