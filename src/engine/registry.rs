//! Static registry for user-defined conversation functions.
//!
//! Scripts reference plugin callbacks by `(module, function)`. Embedders
//! register the callbacks at construction; there is no runtime module
//! loading. A callback receives a snapshot of the information extracted so
//! far plus the live session handle, and returns either an utterance
//! (`function` items) or an option key (`function_choice` items).

use crate::error::{CallError, Result};
use crate::telephony::TelephonySession;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Snapshot of the extracted information at call time.
pub type InformationSnapshot = BTreeMap<String, Option<String>>;

/// A registered conversation callback.
pub type PluginFunction =
    Arc<dyn Fn(&InformationSnapshot, Option<&TelephonySession>) -> Result<String> + Send + Sync>;

/// Callback table keyed by `(module, function)`.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<(String, String), PluginFunction>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback under `(module, function)`, replacing any
    /// previous registration for that key.
    pub fn register<F>(&mut self, module: &str, function: &str, callback: F)
    where
        F: Fn(&InformationSnapshot, Option<&TelephonySession>) -> Result<String>
            + Send
            + Sync
            + 'static,
    {
        self.functions
            .insert((module.to_owned(), function.to_owned()), Arc::new(callback));
    }

    /// Look a callback up.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Config` for unknown keys.
    pub fn resolve(&self, module: &str, function: &str) -> Result<PluginFunction> {
        self.functions
            .get(&(module.to_owned(), function.to_owned()))
            .cloned()
            .ok_or_else(|| {
                CallError::Config(format!(
                    "no registered conversation function '{module}.{function}'"
                ))
            })
    }
}
