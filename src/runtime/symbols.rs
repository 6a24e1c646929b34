//! Module/attribute symbol table

use crate::identity::{FunctionId, TOP_LEVEL_MODULE};
use crossbeam::sync::ShardedLock;
use fnv::FnvHashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::PoisonError;
use thiserror::Error;

/// Process-unique id of a function's code, the interception key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(u64);

impl CodeId {
    /// Raw numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

static NEXT_CODE_ID: AtomicU64 = AtomicU64::new(1);

/// Errors raised while resolving a function name to code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("empty function name")]
    EmptyName,

    #[error("no module named '{module}'")]
    ModuleNotFound { module: String },

    #[error("module '{module}' has no attribute '{attribute}'")]
    AttributeNotFound { module: String, attribute: String },

    #[error("unknown code id {0}")]
    UnknownCode(u64),
}

/// A resolved function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    /// Canonical identity (`module.function`, bare for top-level)
    pub id: FunctionId,
    /// Code the frames of this function report
    pub code: CodeId,
}

#[derive(Debug, Default)]
struct Tables {
    /// module path → attribute name → code
    modules: HashMap<String, HashMap<String, CodeId>>,
    /// code → canonical identity
    by_code: FnvHashMap<CodeId, FunctionId>,
}

/// Table of modules and their functions
#[derive(Debug, Default)]
pub struct SymbolTable {
    tables: ShardedLock<Tables>,
}

impl SymbolTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function, returning its code id
    ///
    /// Defining the same `module.name` twice returns the original id. An
    /// empty module means top-level code.
    pub fn define(&self, module: &str, name: &str) -> CodeId {
        let module = if module.is_empty() {
            TOP_LEVEL_MODULE
        } else {
            module
        };

        let mut tables = self
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(code) = tables.modules.get(module).and_then(|attrs| attrs.get(name)) {
            return *code;
        }

        let code = CodeId(NEXT_CODE_ID.fetch_add(1, Ordering::Relaxed));
        tables
            .modules
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), code);
        tables
            .by_code
            .insert(code, FunctionId::from_parts(module, name));

        tracing::trace!(module, name, code = code.0, "defined function");
        code
    }

    /// Resolve `module.function` (or a bare top-level name) to its code
    ///
    /// The module path is everything before the last dot.
    pub fn resolve(&self, function: &FunctionId) -> Result<Symbol, ResolveError> {
        if function.function().is_empty() {
            return Err(ResolveError::EmptyName);
        }
        let module = match function.module() {
            Some("") | None => TOP_LEVEL_MODULE,
            Some(module) => module,
        };
        let attribute = function.function();

        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let attrs = tables
            .modules
            .get(module)
            .ok_or_else(|| ResolveError::ModuleNotFound {
                module: module.to_string(),
            })?;
        let code = attrs
            .get(attribute)
            .ok_or_else(|| ResolveError::AttributeNotFound {
                module: module.to_string(),
                attribute: attribute.to_string(),
            })?;

        Ok(Symbol {
            id: FunctionId::from_parts(module, attribute),
            code: *code,
        })
    }

    /// Canonical identity of a code id
    pub fn identity_of(&self, code: CodeId) -> Result<FunctionId, ResolveError> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_code
            .get(&code)
            .cloned()
            .ok_or(ResolveError::UnknownCode(code.0))
    }

    /// Number of defined functions
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_code
            .len()
    }

    /// True if nothing has been defined
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
