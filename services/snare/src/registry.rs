//! Handler registry.
//!
//! The registry is mutable only while the sensor initializes
//! ([`HandlerRegistryBuilder`]); [`HandlerRegistryBuilder::freeze`] turns it
//! into a read-only [`HandlerRegistry`] that is cheap to clone and safe to
//! share across connection tasks.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::handler::Handler;

/// Errors from registry mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler is already registered under this name.
    #[error("handler '{0}' is already registered")]
    Duplicate(String),
}

/// Mutable registry used during initialization.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a fresh name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Register a handler, replacing and returning any previous entry.
    pub fn replace(&mut self, name: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.handlers.insert(name.into(), handler)
    }

    pub fn remove(&mut self, name: &str) -> Option<Handler> {
        self.handlers.remove(name)
    }

    /// Move the handler registered under `from` to `to`.
    ///
    /// Returns false (and changes nothing) when `from` is not registered.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        let Some(handler) = self.handlers.remove(from) else {
            return false;
        };
        if self.handlers.insert(to.to_string(), handler).is_some() {
            debug!(from = %from, to = %to, "Rename replaced an existing handler");
        }
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Finish initialization.
    pub fn freeze(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Read-only handler registry.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub fn lookup(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
