//! Ordered list of convolution implementations tried in turn at creation time.
//!
//! An implementation that answers `Unsupported` is skipped and the next one is asked; the
//! first success wins. Kernel crates register their primitives once, typically from a
//! `register()` function called during start-up.

use std::sync::{OnceLock, RwLock};

use crate::attr::PrimitiveAttr;
use crate::cpu::CpuEngine;
use crate::desc::ConvDesc;
use crate::error::{ConvError, ConvResult};

use super::pd::FwdHint;
use super::Primitive;

/// Factory producing a type-erased primitive for a descriptor.
pub type PrimitiveConstructor = Box<
    dyn Fn(&CpuEngine, &ConvDesc, &PrimitiveAttr, Option<&FwdHint>) -> ConvResult<Box<dyn Primitive>>
        + Send
        + Sync,
>;

/// Named constructors in dispatch order.
pub struct ImplRegistry {
    impls: RwLock<Vec<(String, PrimitiveConstructor)>>,
}

impl ImplRegistry {
    /// Empty registry; nothing is supported until something registers.
    pub fn new() -> Self {
        Self {
            impls: RwLock::new(Vec::new()),
        }
    }

    /// Appends an implementation, or replaces the constructor of one already registered under
    /// `name` without changing its position.
    pub fn register(&self, name: impl Into<String>, constructor: PrimitiveConstructor) {
        let name = name.into();
        let mut impls = self.impls.write().expect("impl registry poisoned");
        match impls.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = constructor,
            None => impls.push((name, constructor)),
        }
    }

    /// Registers a concrete primitive type.
    /// Registers `P` in the [`global_registry`].
pub fn register_primitive<P: Primitive + 'static>(&self, name: impl Into<String>) {
        self.register(
            name,
            Box::new(
                |engine: &CpuEngine,
                 desc: &ConvDesc,
                 attr: &PrimitiveAttr,
                 hint: Option<&FwdHint>| {
                    P::create(engine, desc, attr, hint).map(|p| Box::new(p) as Box<dyn Primitive>)
                },
            ),
        );
    }

    /// First implementation that accepts the descriptor. Errors other than `Unsupported`
    /// stop the search.
    pub fn create(
        &self,
        engine: &CpuEngine,
        desc: &ConvDesc,
        attr: &PrimitiveAttr,
        hint: Option<&FwdHint>,
    ) -> ConvResult<Box<dyn Primitive>> {
        let impls = self.impls.read().expect("impl registry poisoned");
        for (_, constructor) in impls.iter() {
            match constructor(engine, desc, attr, hint) {
                Err(ConvError::Unsupported) => continue,
                other => return other,
            }
        }
        Err(ConvError::Unsupported)
    }

    /// Registered names in dispatch order.
    pub fn names(&self) -> Vec<String> {
        self.impls
            .read()
            .expect("impl registry poisoned")
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.impls
            .read()
            .expect("impl registry poisoned")
            .iter()
            .any(|(existing, _)| existing == name)
    }
}

impl Default for ImplRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: OnceLock<ImplRegistry> = OnceLock::new();

/// Process-wide registry, created on first use.
pub fn global_registry() -> &'static ImplRegistry {
    GLOBAL_REGISTRY.get_or_init(ImplRegistry::new)
}

pub fn register_primitive<P: Primitive + 'static>(name: impl Into<String>) {
    global_registry().register_primitive::<P>(name);
}

/// Creates a primitive from the first registered implementation that supports `desc`.
pub fn create_primitive(
    engine: &CpuEngine,
    desc: &ConvDesc,
    attr: &PrimitiveAttr,
    hint: Option<&FwdHint>,
) -> ConvResult<Box<dyn Primitive>> {
    global_registry().create(engine, desc, attr, hint)
}

/// Names in the global registry, in the order creation tries them.
pub fn list_impls() -> Vec<String> {
    global_registry().names()
}
