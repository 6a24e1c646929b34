//! Function identities
//!
//! A traced function is named `<module_path>.<function_name>`, or just
//! `<function_name>` when the module is top-level or cannot be resolved.
//! Equality is exact string equality.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Stable, cheaply clonable key for a traceable function
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(Arc<str>);

impl FunctionId {
    /// Create an identity from its canonical string form
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Build an identity from a module path and a function name
    ///
    /// An empty module (or `__main__`) yields the bare function name.
    pub fn from_parts(module: &str, function: &str) -> Self {
        if module.is_empty() || module == TOP_LEVEL_MODULE {
            Self::new(function)
        } else {
            Self::new(format!("{}.{}", module, function))
        }
    }

    /// The full canonical name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Module path, if the name is qualified
    ///
    /// The split happens at the last dot, so `a.b.c` has module `a.b`.
    pub fn module(&self) -> Option<&str> {
        self.0.rsplit_once('.').map(|(module, _)| module)
    }

    /// Unqualified function name
    pub fn function(&self) -> &str {
        self.0
            .rsplit_once('.')
            .map(|(_, function)| function)
            .unwrap_or(&self.0)
    }
}

/// Module name the host uses for top-level code
pub const TOP_LEVEL_MODULE: &str = "__main__";

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for FunctionId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl Borrow<str> for FunctionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for FunctionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
