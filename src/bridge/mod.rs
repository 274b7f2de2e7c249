//! Script-to-native event bridge.
//!
//! A bridge holds a fixed list of [`EventDescriptor`]s. Initializing it
//! against a surface's [`MessageRegistry`] creates one [`ChannelObserver`] per
//! descriptor under a freshly generated channel id and injects the matching
//! listener stub, so a script-side `dispatchEvent` ends up in the
//! descriptor's handler:
//!
//! ```text
//! window.dispatchEvent(e) ─► stub ─► postMessage(body) ─► registry[channel]
//!                                                           │
//!                      descriptor.fire(params, ctx) ◄─ ChannelObserver
//! ```

pub mod event;
pub mod registry;
pub mod script;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::Value as JsonValue;
use tracing::{debug, error};

use crate::reload::BroadcastReloadRegistry;
use crate::surface::SurfaceId;

use self::event::{EventDescriptor, OutcomeEvent, Params};
use self::registry::{ChannelId, MessageRegistry, ScriptMessageHandler, UserScript};
use self::script::{ListenerScriptProvider, ScriptProvider};

pub trait OutcomeEventRunner {
    fn run(&self, event: &dyn OutcomeEvent);
}

/// What an event handler may do with the controller that owns the bridge.
pub trait BridgeHost: OutcomeEventRunner {
    fn surface_id(&self) -> SurfaceId;
    fn reload_registry(&self) -> Rc<BroadcastReloadRegistry>;
    fn dom_content_loaded(&self);
}

/// Passed to every handler invocation.
pub struct FireContext {
    host: Rc<dyn BridgeHost>,
}

impl FireContext {
    pub fn new(host: Rc<dyn BridgeHost>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Rc<dyn BridgeHost> {
        &self.host
    }

    /// Sends an event back into the surface.
    pub fn run(&self, event: &dyn OutcomeEvent) {
        self.host.run(event);
    }
}

pub type EventFired = Rc<dyn Fn()>;

pub struct BridgeInitInfo<'a> {
    pub host: Weak<dyn BridgeHost>,
    pub registry: &'a dyn MessageRegistry,
    /// Called once per delivery, whichever event fired.
    pub on_event_fired: Option<EventFired>,
}

/// Native endpoint for one descriptor on one surface.
pub struct ChannelObserver {
    channel: ChannelId,
    event: Rc<EventDescriptor>,
    host: Weak<dyn BridgeHost>,
    on_fired: Option<EventFired>,
}

impl ChannelObserver {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn event_name(&self) -> &str {
        self.event.name()
    }
}

impl ScriptMessageHandler for ChannelObserver {
    /// # Panics
    ///
    /// When the owning controller is gone. Registries must be torn down
    /// together with their controller, so this is a lifecycle bug.
    fn did_receive(&self, body: JsonValue) {
        let params = match body {
            JsonValue::Object(map) => map,
            _ => Params::new(),
        };
        let Some(host) = self.host.upgrade() else {
            error!(
                channel = %self.channel,
                event = self.event.name(),
                "message delivered for a controller that no longer exists"
            );
            panic!(
                "channel {} ({}) outlived its controller",
                self.channel,
                self.event.name()
            );
        };

        if let Some(on_fired) = &self.on_fired {
            on_fired();
        }
        debug!(event = self.event.name(), channel = %self.channel, "firing income event");
        self.event.fire(&params, &FireContext::new(host));
    }
}

pub struct EventBridge {
    events: Vec<Rc<EventDescriptor>>,
    script_provider: Box<dyn ScriptProvider>,
    observers: RefCell<Vec<Rc<ChannelObserver>>>,
}

impl EventBridge {
    pub fn new(events: Vec<EventDescriptor>, script_provider: impl ScriptProvider + 'static) -> Self {
        Self {
            events: events.into_iter().map(Rc::new).collect(),
            script_provider: Box::new(script_provider),
            observers: RefCell::new(Vec::new()),
        }
    }

    /// Bridge using [`ListenerScriptProvider`] with WebKit-style handler paths.
    pub fn with_events(events: Vec<EventDescriptor>) -> Self {
        Self::new(events, ListenerScriptProvider::default())
    }

    /// Registers a fresh observer and listener stub for every event.
    ///
    /// Replaces observers from any earlier call. Clearing the registry's
    /// previous registrations is up to the caller.
    pub fn initialize(&self, info: BridgeInitInfo<'_>) {
        let observers = self
            .events
            .iter()
            .map(|event| {
                let observer = Rc::new(ChannelObserver {
                    channel: ChannelId::generate(),
                    event: Rc::clone(event),
                    host: info.host.clone(),
                    on_fired: info.on_event_fired.clone(),
                });
                info.registry.add_handler(&observer.channel, observer.clone());

                let source = self.script_provider.script(
                    event.name(),
                    event.parameters(),
                    &observer.channel,
                );
                info.registry.add_user_script(UserScript::at_document_end(source));

                debug!(event = event.name(), channel = %observer.channel, "registered income event");
                observer
            })
            .collect();

        *self.observers.borrow_mut() = observers;
    }

    /// Drops all observers without delivering anything further.
    pub fn reset(&self) {
        self.observers.borrow_mut().clear();
    }

    /// `(event name, channel)` pairs from the latest initialization.
    pub fn channels(&self) -> Vec<(String, ChannelId)> {
        self.observers
            .borrow()
            .iter()
            .map(|observer| (observer.event_name().to_string(), observer.channel.clone()))
            .collect()
    }

    pub fn channel_for(&self, event_name: &str) -> Option<ChannelId> {
        self.observers
            .borrow()
            .iter()
            .find(|observer| observer.event_name() == event_name)
            .map(|observer| observer.channel.clone())
    }

    pub fn events(&self) -> impl Iterator<Item = &EventDescriptor> {
        self.events.iter().map(|event| event.as_ref())
    }
}
