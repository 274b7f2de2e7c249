use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;

use super::script::{js_string, DOM_CONTENT_LOADED_EVENT};
use super::FireContext;

/// Values received from script, keyed by parameter name.
pub type Params = JsonMap<String, JsonValue>;

/// Name of the predefined event that reloads every other surface.
pub const RELOAD_ALL_EVENT: &str = "needReloadAllWebviews";

type Handler = dyn Fn(&Params, &FireContext);

/// One script-originated event and what the native side does with it.
pub struct EventDescriptor {
    name: String,
    /// Parameter key to the script expression that reads it, e.g.
    /// `"url" => "params.url"` or `"title" => "params.title || null"`.
    parameters: BTreeMap<String, String>,
    handler: Box<Handler>,
}

impl EventDescriptor {
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(&Params, &FireContext) + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
            handler: Box::new(handler),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, expression: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), expression.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn fire(&self, params: &Params, context: &FireContext) {
        (self.handler)(params, context);
    }

    /// Reloads every other live surface through the host's broadcast registry.
    pub fn reload_all_surfaces() -> Self {
        Self::new(RELOAD_ALL_EVENT, |_, context| {
            let host = context.host();
            let origin = host.surface_id();
            debug!(surface = %origin, "script requested reload of all surfaces");
            host.reload_registry().request_reload_all(Some(origin));
        })
    }

    pub(crate) fn dom_content_loaded() -> Self {
        Self::new(DOM_CONTENT_LOADED_EVENT, |_, context| {
            context.host().dom_content_loaded();
        })
    }
}

impl fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Native-to-script event, delivered by evaluating its script in the surface.
pub trait OutcomeEvent {
    fn script(&self) -> String;
}

/// Dispatches a `CustomEvent` with a JSON `detail` on `window`.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub name: String,
    pub detail: JsonValue,
}

impl DispatchEvent {
    pub fn new(name: impl Into<String>, detail: JsonValue) -> Self {
        Self {
            name: name.into(),
            detail,
        }
    }
}

impl OutcomeEvent for DispatchEvent {
    fn script(&self) -> String {
        format!(
            "window.dispatchEvent(new CustomEvent({}, {{ detail: {} }}));",
            js_string(&self.name),
            self.detail
        )
    }
}
