use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Opaque identifier of a native message endpoint.
///
/// Generated ids are valid script identifiers (`_` followed by an underscored
/// UUID) so hosts may expose them as property names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn generate() -> Self {
        let raw = Uuid::new_v4().to_string().replace('-', "_");
        Self(format!("_{raw}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// When an injected script runs relative to document parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InjectionTime {
    /// Before any document script runs.
    DocumentStart,
    /// Once the document has finished parsing, before subresources complete.
    DocumentEnd,
}

impl Default for InjectionTime {
    fn default() -> Self {
        Self::DocumentEnd
    }
}

/// Script source inserted into every document the surface loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserScript {
    pub source: String,
    pub injection_time: InjectionTime,
    pub main_frame_only: bool,
}

impl UserScript {
    /// Runs at document end in every frame.
    pub fn at_document_end(source: String) -> Self {
        Self {
            source,
            injection_time: InjectionTime::DocumentEnd,
            main_frame_only: false,
        }
    }
}

/// Receiver for structured messages posted by script to a channel.
pub trait ScriptMessageHandler {
    fn did_receive(&self, body: JsonValue);
}

/// The surface-side registry binding channel ids to native handlers, plus the
/// list of user scripts injected into each document.
pub trait MessageRegistry {
    fn add_handler(&self, channel: &ChannelId, handler: Rc<dyn ScriptMessageHandler>);
    fn add_user_script(&self, script: UserScript);
    /// Drops every handler and user script registered so far.
    fn remove_all(&self);
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no handler registered for channel {0}")]
    UnknownChannel(ChannelId),
}

/// In-memory [`MessageRegistry`] that routes deliveries by channel id.
#[derive(Default)]
pub struct ChannelRegistry {
    handlers: RefCell<HashMap<ChannelId, Rc<dyn ScriptMessageHandler>>>,
    scripts: RefCell<Vec<UserScript>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `body` to the handler registered under `channel`.
    ///
    /// The handler map is not borrowed while the handler runs, so handlers
    /// may register further channels.
    pub fn deliver(&self, channel: &ChannelId, body: JsonValue) -> Result<(), RegistryError> {
        let handler = self
            .handlers
            .borrow()
            .get(channel)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownChannel(channel.clone()))?;
        debug!(channel = %channel, "delivering script message");
        handler.did_receive(body);
        Ok(())
    }

    pub fn user_scripts(&self) -> Vec<UserScript> {
        self.scripts.borrow().clone()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<_> = self.handlers.borrow().keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn len(&self) -> usize {
        self.handlers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }
}

impl MessageRegistry for ChannelRegistry {
    fn add_handler(&self, channel: &ChannelId, handler: Rc<dyn ScriptMessageHandler>) {
        self.handlers.borrow_mut().insert(channel.clone(), handler);
    }

    fn add_user_script(&self, script: UserScript) {
        self.scripts.borrow_mut().push(script);
    }

    fn remove_all(&self) {
        self.handlers.borrow_mut().clear();
        self.scripts.borrow_mut().clear();
    }
}
