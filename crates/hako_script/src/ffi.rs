//! Identifiers that cross the engine boundary
//!
//! Only plain integers travel between host bookkeeping and the guest engine:
//! raw value references, context/runtime ids, callback ids and class ids.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Raw reference to a guest value held by host code.
///
/// `RawRef::NONE` is the "no value / no error" sentinel. The four guest
/// singletons have fixed references and never own a heap slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawRef(pub(crate) u32);

impl RawRef {
    pub const NONE: RawRef = RawRef(0);
    pub const UNDEFINED: RawRef = RawRef(1);
    pub const NULL: RawRef = RawRef(2);
    pub const FALSE: RawRef = RawRef(3);
    pub const TRUE: RawRef = RawRef(4);

    /// First reference handed out for heap slots.
    pub(crate) const FIRST_SLOT: u32 = 16;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    pub fn is_singleton(self) -> bool {
        (Self::UNDEFINED.0..=Self::TRUE.0).contains(&self.0)
    }

    pub(crate) fn boolean(value: bool) -> Self {
        if value {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }
}

macro_rules! boundary_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn bits(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

boundary_id!(
    /// Process-unique runtime id.
    RuntimeId
);
boundary_id!(
    /// Process-unique context id. Callback dispatch is keyed by this value,
    /// so it is never reused, not even across runtimes.
    ContextId
);
boundary_id!(
    /// Host callback id, unique within a runtime.
    FunctionId
);
boundary_id!(
    /// Class id, unique within a runtime.
    ClassId
);

static NEXT_RUNTIME: AtomicU32 = AtomicU32::new(1);
static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

impl RuntimeId {
    pub(crate) fn next() -> Self {
        RuntimeId(NEXT_RUNTIME.fetch_add(1, Ordering::Relaxed))
    }
}

impl ContextId {
    pub(crate) fn next() -> Self {
        ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Host-assigned integer correlating a guest instance with host-side state.
pub type OpaqueId = i32;

/// Key of a host callback in the registry.
///
/// Format: [32-bit context id | 32-bit function id]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CallbackKey {
    pub context: ContextId,
    pub function: FunctionId,
}

impl CallbackKey {
    /// Serialize to a 64-bit integer
    pub fn to_bits(&self) -> u64 {
        ((self.context.0 as u64) << 32) | (self.function.0 as u64)
    }

    /// Deserialize from a 64-bit integer
    pub fn from_bits(bits: u64) -> Self {
        Self {
            context: ContextId((bits >> 32) as u32),
            function: FunctionId(bits as u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_key_packs_into_u64() {
        let key = CallbackKey {
            context: ContextId(7),
            function: FunctionId(42),
        };
        assert_eq!(key.to_bits(), (7u64 << 32) | 42);
        assert_eq!(CallbackKey::from_bits(key.to_bits()), key);
    }

    #[test]
    fn singletons_are_recognised() {
        assert!(RawRef::UNDEFINED.is_singleton());
        assert!(RawRef::TRUE.is_singleton());
        assert!(!RawRef::NONE.is_singleton());
        assert!(!RawRef(RawRef::FIRST_SLOT).is_singleton());
        assert_eq!(RawRef::boolean(false), RawRef::FALSE);
    }

    #[test]
    fn context_ids_are_never_reused() {
        let a = ContextId::next();
        let b = ContextId::next();
        assert!(b.bits() > a.bits());
    }
}
