//! Module resolution and loading
//!
//! Loaders are tried in registration order. The first one that does not
//! answer [`ModuleSource::NotFound`] wins; if every loader declines, the
//! importing guest code sees a `ReferenceError`.

use crate::eval::Bytecode;
use crate::ffi::{ContextId, RuntimeId};
use crate::scope;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::{Ctx, Module};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// One import the guest asked for.
#[derive(Debug, Clone)]
pub struct ModuleRequest<'a> {
    pub runtime: RuntimeId,
    /// Context performing the import, when it is known.
    pub context: Option<ContextId>,
    /// Normalized module name.
    pub name: &'a str,
    /// Import attributes. The engine does not surface them yet, so this is
    /// always empty.
    pub attributes: &'a HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    Source(String),
    Bytecode(Bytecode),
    NotFound,
}

pub trait ModuleLoader {
    fn load(&self, request: &ModuleRequest<'_>) -> ModuleSource;
}

impl<F> ModuleLoader for F
where
    F: Fn(&ModuleRequest<'_>) -> ModuleSource,
{
    fn load(&self, request: &ModuleRequest<'_>) -> ModuleSource {
        self(request)
    }
}

/// Serves modules from an in-memory table.
#[derive(Debug, Clone, Default)]
pub struct StaticModuleLoader {
    modules: HashMap<String, String>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(name, source);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.modules.insert(name.into(), source.into());
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load(&self, request: &ModuleRequest<'_>) -> ModuleSource {
        match self.modules.get(request.name) {
            Some(source) => ModuleSource::Source(source.clone()),
            None => ModuleSource::NotFound,
        }
    }
}

/// Resolve `name` against the importing module `base`. Only `./` and `../`
/// specifiers are relative; everything else is returned unchanged.
pub fn normalize_module_name(base: &str, name: &str) -> String {
    if !name.starts_with("./") && !name.starts_with("../") {
        return name.to_string();
    }

    let mut parts: Vec<&str> = base.split('/').collect();
    parts.pop();
    for segment in name.split('/') {
        match segment {
            "." | "" => {}
            ".." => {
                if matches!(parts.last(), None | Some(&"..")) {
                    parts.push("..");
                } else {
                    parts.pop();
                }
            }
            other => parts.push(other),
        }
    }
    parts.retain(|part| !part.is_empty());
    parts.join("/")
}

/// Loader list installed on the engine. Clones share the list.
#[derive(Clone)]
pub(crate) struct LoaderChain {
    runtime: RuntimeId,
    loaders: Rc<RefCell<Vec<Box<dyn ModuleLoader>>>>,
}

impl LoaderChain {
    pub fn new(runtime: RuntimeId) -> Self {
        Self {
            runtime,
            loaders: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn push(&self, loader: Box<dyn ModuleLoader>) {
        self.loaders.borrow_mut().push(loader);
    }

    fn find(&self, name: &str) -> ModuleSource {
        let attributes = HashMap::new();
        let request = ModuleRequest {
            runtime: self.runtime,
            context: scope::current(self.runtime),
            name,
            attributes: &attributes,
        };
        let Ok(loaders) = self.loaders.try_borrow() else {
            tracing::warn!(module = name, "module requested while loaders are being changed");
            return ModuleSource::NotFound;
        };
        loaders
            .iter()
            .map(|loader| loader.load(&request))
            .find(|source| *source != ModuleSource::NotFound)
            .unwrap_or(ModuleSource::NotFound)
    }
}

impl Resolver for LoaderChain {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        Ok(normalize_module_name(base, name))
    }
}

impl Loader for LoaderChain {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        match self.find(name) {
            ModuleSource::Source(source) => {
                tracing::debug!(runtime = %self.runtime, module = name, "module loaded from source");
                Module::declare(ctx.clone(), name, source)
            }
            ModuleSource::Bytecode(bytecode) if bytecode.is_module() => {
                tracing::debug!(runtime = %self.runtime, module = name, "module loaded from bytecode");
                // SAFETY: `Bytecode` is only built by `compile` or by the unsafe
                // `Bytecode::from_bytes`, whose caller vouches for the bytes.
                unsafe { Module::load(ctx.clone(), bytecode.as_bytes()) }
            }
            ModuleSource::Bytecode(_) => Err(not_found(ctx, name, "bytecode is not a module")),
            ModuleSource::NotFound => Err(not_found(ctx, name, "no loader provides it")),
        }
    }
}

fn not_found(ctx: &Ctx<'_>, name: &str, reason: &str) -> rquickjs::Error {
    tracing::debug!(module = name, reason, "module not found");
    let message = format!("could not load module '{name}': {reason}");
    let error = ctx
        .globals()
        .get::<_, rquickjs::function::Constructor>("ReferenceError")
        .and_then(|constructor| constructor.construct::<_, rquickjs::Value>((message,)));
    match error {
        Ok(error) => ctx.throw(error),
        Err(error) => error,
    }
}
