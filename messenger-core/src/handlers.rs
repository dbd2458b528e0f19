//! Client-side message handlers
//!
//! A [`HandlerSet`] maps subscription patterns to callbacks. Dispatch runs
//! every handler whose pattern matches the message type, in registration
//! order. A handler that fails or panics is logged and skipped; it never
//! stops the remaining handlers or the caller.

use std::panic::{self, AssertUnwindSafe};

use log::warn;

use crate::protocol::Message;
use crate::topics::SubscriptionPattern;

/// Error type returned by message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked for each matching message
pub type Handler = Box<dyn FnMut(&Message) -> Result<(), HandlerError> + Send>;

struct Entry {
    pattern: SubscriptionPattern,
    handler: Handler,
}

/// Ordered collection of (pattern, handler) pairs
#[derive(Default)]
pub struct HandlerSet {
    entries: Vec<Entry>,
}

impl core::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &entry.pattern))
            .finish()
    }
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`.
    ///
    /// Several handlers may share a pattern; all of them run.
    pub fn add<F>(&mut self, pattern: SubscriptionPattern, handler: F)
    where
        F: FnMut(&Message) -> Result<(), HandlerError> + Send + 'static,
    {
        self.entries.push(Entry {
            pattern,
            handler: Box::new(handler),
        });
    }

    /// Drop every handler registered for `pattern`. Returns how many were removed.
    pub fn remove_pattern(&mut self, pattern: &SubscriptionPattern) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.pattern != *pattern);
        before - self.entries.len()
    }

    pub fn contains_pattern(&self, pattern: &SubscriptionPattern) -> bool {
        self.entries.iter().any(|entry| entry.pattern == *pattern)
    }

    /// Run every handler whose pattern matches `message`.
    ///
    /// Returns the number of handlers that completed successfully.
    pub fn dispatch(&mut self, message: &Message) -> usize {
        let mut completed = 0;
        for entry in &mut self.entries {
            if !entry.pattern.matches(message.msg_type()) {
                continue;
            }
            let handler = &mut entry.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => completed += 1,
                Ok(Err(e)) => warn!(
                    "Handler for {} failed on {}: {}",
                    entry.pattern,
                    message.msg_type(),
                    e
                ),
                Err(_) => warn!(
                    "Handler for {} panicked on {}",
                    entry.pattern,
                    message.msg_type()
                ),
            }
        }
        completed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
