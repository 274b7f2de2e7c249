//! Page lifecycle: which overlay is visible and when navigation happens.
//!
//! ```text
//!             recreate()
//!   any ───────────────────────► Initial
//!   Initial/NoInternet/Error ─── HasInternet ──► Loading ── finished ──► Content
//!   not Content ─────────────── NoInternet ───► NoInternet
//!   not NoInternet ──────────── failed ───────► Error
//!   reload (online) ──────────────────────────► Loading
//!   reload (offline) ── deferred until the next HasInternet
//! ```
//!
//! [`PageController`] is single-threaded: it must live on the control thread
//! inside a [`tokio::task::LocalSet`], which also runs its reachability
//! subscription and deferred navigation dispatch. Inputs that arrive while
//! a transition's effects run, or while [`PageController::recreate`] is
//! suspended, are queued and applied in arrival order afterwards.

pub mod machine;
pub mod overlays;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bridge::event::{EventDescriptor, OutcomeEvent};
use crate::bridge::registry::{InjectionTime, UserScript};
use crate::bridge::script::dom_ready_dispatch_script;
use crate::bridge::{BridgeHost, BridgeInitInfo, EventBridge, EventFired, OutcomeEventRunner};
use crate::config::BridgeConfiguration;
use crate::reachability::{ReachabilityService, ReachabilityStatus};
use crate::reload::{BroadcastReloadRegistry, ReloadSubscriber, Subscription};
use crate::surface::{
    is_custom_scheme, ExternalOpener, NavigationDelegate, NavigationFailure, NavigationPolicy,
    NavigationRequest, SurfaceError, SurfaceFactory, SurfaceId, WebSurface,
};

use self::machine::{Input, LifecycleState, Machine};
use self::overlays::{Overlays, Spinner};

/// Optional observer of page-level events, held weakly.
pub trait PageDelegate {
    fn view_will_appear(&self, _animated: bool) {}
    fn view_will_disappear(&self, _animated: bool) {}
    fn did_finish_loading_link(&self) {}
    fn dom_content_loaded(&self) {}
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("surface recreation already in progress")]
    RecreateInProgress,
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

type StateObserver = Rc<dyn Fn(StateChange)>;

pub struct PageController {
    id: SurfaceId,
    link_url: Url,
    animation_duration: Duration,
    factory: Rc<dyn SurfaceFactory>,
    reachability: Option<Rc<dyn ReachabilityService>>,
    spinner: Option<Box<dyn Spinner>>,
    overlays: Overlays,
    dom_bridge: EventBridge,
    event_bridge: Option<EventBridge>,
    external_opener: Option<Rc<dyn ExternalOpener>>,
    delegate: Option<Weak<dyn PageDelegate>>,
    registry: Rc<BroadcastReloadRegistry>,

    machine: Cell<Machine>,
    state_tx: watch::Sender<LifecycleState>,
    observers: RefCell<Vec<StateObserver>>,
    surface: RefCell<Option<Rc<dyn WebSurface>>>,
    reachability_task: RefCell<Option<JoinHandle<()>>>,
    navigation_task: RefCell<Option<JoinHandle<()>>>,
    reload_subscription: RefCell<Option<Subscription>>,
    last_reachability: Cell<Option<ReachabilityStatus>>,
    pending: RefCell<VecDeque<Input>>,
    busy: Cell<bool>,
    recreating: Cell<bool>,
}

impl PageController {
    pub fn new(config: BridgeConfiguration) -> Rc<Self> {
        let overlays = Overlays::from_provider(config.views_provider.as_deref());
        overlays.apply(LifecycleState::Initial);
        if let Some(spinner) = &config.spinner {
            spinner.hide();
        }
        let (state_tx, _rx) = watch::channel(LifecycleState::Initial);

        Rc::new(Self {
            id: SurfaceId::next(),
            link_url: config.link_url,
            animation_duration: config.design.animation_duration,
            factory: config.surface_factory,
            reachability: config.reachability,
            spinner: config.spinner,
            overlays,
            dom_bridge: EventBridge::with_events(vec![EventDescriptor::dom_content_loaded()]),
            event_bridge: config.event_bridge,
            external_opener: config.external_opener,
            delegate: config.delegate,
            registry: config
                .reload_registry
                .unwrap_or_else(BroadcastReloadRegistry::shared),
            machine: Cell::new(Machine::default()),
            state_tx,
            observers: RefCell::new(Vec::new()),
            surface: RefCell::new(None),
            reachability_task: RefCell::new(None),
            navigation_task: RefCell::new(None),
            reload_subscription: RefCell::new(None),
            last_reachability: Cell::new(None),
            pending: RefCell::new(VecDeque::new()),
            busy: Cell::new(false),
            recreating: Cell::new(false),
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.machine.get().state
    }

    pub fn reload_deferred(&self) -> bool {
        self.machine.get().reload_deferred
    }

    pub fn surface(&self) -> Option<Rc<dyn WebSurface>> {
        self.surface.borrow().clone()
    }

    pub fn event_bridge(&self) -> Option<&EventBridge> {
        self.event_bridge.as_ref()
    }

    /// Called after every accepted transition, never for a no-op input.
    pub fn observe_state(&self, observer: impl Fn(StateChange) + 'static) {
        self.observers.borrow_mut().push(Rc::new(observer));
    }

    pub fn state_changes(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Replaces the surface and re-wires bridges, broadcast subscription and
    /// reachability against it.
    ///
    /// The page starts loading once reachability (or the lack of a
    /// reachability service) allows it.
    pub async fn recreate(self: &Rc<Self>) -> Result<(), BridgeError> {
        if self.recreating.get() {
            return Err(BridgeError::RecreateInProgress);
        }
        let guard = RecreateGuard::enter(self);

        self.teardown_surface();
        self.last_reachability.set(None);
        self.apply(Input::Recreated);

        let outcome = match self.factory.create().await {
            Ok(surface) => {
                self.install(surface);
                Ok(())
            }
            Err(err) => {
                error!(surface = %self.id, error = %err, "failed to create surface");
                self.pending.borrow_mut().push_back(Input::NavigationFailed);
                Err(BridgeError::from(err))
            }
        };

        drop(guard);
        self.process();
        outcome
    }

    /// Loads the page again, or remembers to once connectivity returns.
    pub fn reload_web_view(&self) {
        let reachability = self.current_reachability();
        debug!(surface = %self.id, reachability = ?reachability, "reload requested");
        self.dispatch(Input::ReloadRequested(reachability));
    }

    pub fn view_will_appear(&self, animated: bool) {
        if let Some(delegate) = self.delegate() {
            delegate.view_will_appear(animated);
        }
    }

    pub fn view_will_disappear(&self, animated: bool) {
        if let Some(delegate) = self.delegate() {
            delegate.view_will_disappear(animated);
        }
    }

    /// Drops the surface, its channel observers and every subscription.
    /// Navigation in flight is abandoned without a callback.
    pub fn teardown(&self) {
        self.teardown_surface();
    }

    fn install(self: &Rc<Self>, surface: Rc<dyn WebSurface>) {
        let navigation: Weak<dyn NavigationDelegate> = Rc::<Self>::downgrade(self);
        surface.set_navigation_delegate(navigation);

        {
            let registry = surface.content_controller();
            registry.remove_all();

            let host: Weak<dyn BridgeHost> = Rc::<Self>::downgrade(self);
            let on_event_fired = self.layout_signal();
            self.dom_bridge.initialize(BridgeInitInfo {
                host: host.clone(),
                registry,
                on_event_fired: Some(on_event_fired.clone()),
            });
            if let Some(bridge) = &self.event_bridge {
                bridge.initialize(BridgeInitInfo {
                    host,
                    registry,
                    on_event_fired: Some(on_event_fired),
                });
            }
            registry.add_user_script(UserScript {
                source: dom_ready_dispatch_script(),
                injection_time: InjectionTime::DocumentEnd,
                main_frame_only: true,
            });
        }
        *self.surface.borrow_mut() = Some(surface);

        let subscriber: Weak<dyn ReloadSubscriber> = Rc::<Self>::downgrade(self);
        let subscription = self.registry.subscribe(self.id, subscriber);
        *self.reload_subscription.borrow_mut() = Some(subscription);

        self.subscribe_reachability();
        info!(surface = %self.id, url = %self.link_url, "surface created");
    }

    fn subscribe_reachability(self: &Rc<Self>) {
        let Some(service) = &self.reachability else {
            self.on_reachability(ReachabilityStatus::HasInternet);
            return;
        };

        let mut rx = service.subscribe();
        let initial = *rx.borrow_and_update();
        self.on_reachability(initial);

        let weak = Rc::downgrade(self);
        let task = tokio::task::spawn_local(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.on_reachability(status);
            }
        });
        *self.reachability_task.borrow_mut() = Some(task);
    }

    fn on_reachability(&self, status: ReachabilityStatus) {
        if self.last_reachability.replace(Some(status)) == Some(status) {
            return;
        }
        debug!(surface = %self.id, status = ?status, "reachability changed");
        self.dispatch(Input::Reachability(status));
    }

    fn current_reachability(&self) -> ReachabilityStatus {
        self.reachability
            .as_ref()
            .map_or(ReachabilityStatus::HasInternet, |service| service.current())
    }

    fn layout_signal(self: &Rc<Self>) -> EventFired {
        let weak = Rc::downgrade(self);
        Rc::new(move || {
            let Some(controller) = weak.upgrade() else {
                return;
            };
            if let Some(surface) = controller.surface() {
                surface.animate_layout(controller.animation_duration);
            }
        })
    }

    fn dispatch(&self, input: Input) {
        self.pending.borrow_mut().push_back(input);
        self.process();
    }

    fn process(&self) {
        if self.busy.replace(true) {
            return;
        }
        // Unwinding out of an observer must not leave the queue blocked;
        // anything still pending is drained by the next dispatch.
        let _draining = Draining(&self.busy);
        self.drain();
    }

    fn drain(&self) {
        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some(input) = next else {
                break;
            };
            self.apply(input);
        }
    }

    fn apply(&self, input: Input) {
        let current = self.machine.get();
        let mut next = current.step(input);
        if next.state == LifecycleState::Loading
            && current.state != LifecycleState::Loading
            && self.surface.borrow().is_none()
        {
            warn!(surface = %self.id, state = ?current.state, "no surface to load into");
            next.state = current.state;
        }
        self.machine.set(next);

        if next.reload_deferred && !current.reload_deferred {
            info!(surface = %self.id, "reload deferred until connectivity returns");
        }
        if next.state == current.state {
            return;
        }
        self.enter(current.state, next.state);
    }

    fn enter(&self, from: LifecycleState, to: LifecycleState) {
        info!(surface = %self.id, from = ?from, to = ?to, "lifecycle transition");
        self.overlays.apply(to);
        if let Some(spinner) = &self.spinner {
            if to == LifecycleState::Loading {
                spinner.show();
            } else {
                spinner.hide();
            }
        }

        match to {
            LifecycleState::Loading => self.schedule_navigation(),
            LifecycleState::Content => {
                if let Some(delegate) = self.delegate() {
                    delegate.did_finish_loading_link();
                }
            }
            _ => {}
        }

        self.state_tx.send_replace(to);
        let observers = self.observers.borrow().clone();
        for observer in observers {
            observer(StateChange { from, to });
        }
    }

    /// Issues the load on the next turn of the control loop.
    fn schedule_navigation(&self) {
        let Some(surface) = self.surface() else {
            warn!(surface = %self.id, "no surface to navigate");
            return;
        };
        let request = NavigationRequest::for_url(&self.link_url);
        info!(surface = %self.id, url = %request.url(), "navigating");

        let task = tokio::task::spawn_local(async move {
            surface.load(request);
        });
        let previous = self.navigation_task.borrow_mut().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn teardown_surface(&self) {
        let reachability_task = self.reachability_task.borrow_mut().take();
        if let Some(task) = reachability_task {
            task.abort();
        }
        let navigation_task = self.navigation_task.borrow_mut().take();
        if let Some(task) = navigation_task {
            task.abort();
        }
        drop(self.reload_subscription.borrow_mut().take());

        self.dom_bridge.reset();
        if let Some(bridge) = &self.event_bridge {
            bridge.reset();
        }

        let surface = self.surface.borrow_mut().take();
        if let Some(surface) = surface {
            surface.content_controller().remove_all();
            surface.teardown();
            debug!(surface = %self.id, "surface torn down");
        }
    }

    fn delegate(&self) -> Option<Rc<dyn PageDelegate>> {
        self.delegate.as_ref().and_then(Weak::upgrade)
    }
}

impl Drop for PageController {
    fn drop(&mut self) {
        self.teardown_surface();
    }
}

/// Clears the busy flag when draining ends, including by unwinding.
struct Draining<'a>(&'a Cell<bool>);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Holds inputs back while `recreate` is suspended.
struct RecreateGuard<'a> {
    controller: &'a PageController,
}

impl<'a> RecreateGuard<'a> {
    fn enter(controller: &'a PageController) -> Self {
        controller.recreating.set(true);
        controller.busy.set(true);
        Self { controller }
    }
}

impl Drop for RecreateGuard<'_> {
    fn drop(&mut self) {
        self.controller.recreating.set(false);
        self.controller.busy.set(false);
    }
}

impl NavigationDelegate for PageController {
    fn decide_policy(&self, url: &Url) -> NavigationPolicy {
        if !is_custom_scheme(url) {
            return NavigationPolicy::Allow;
        }
        match &self.external_opener {
            Some(opener) if opener.can_open(url) => {
                info!(surface = %self.id, url = %url, "opening link externally");
                opener.open(url);
                NavigationPolicy::Cancel
            }
            _ => NavigationPolicy::Allow,
        }
    }

    fn did_finish(&self) {
        debug!(surface = %self.id, "navigation finished");
        self.dispatch(Input::NavigationFinished);
    }

    fn did_fail(&self, failure: NavigationFailure) {
        warn!(surface = %self.id, error = %failure, "navigation failed");
        self.dispatch(Input::NavigationFailed);
    }
}

impl OutcomeEventRunner for PageController {
    fn run(&self, event: &dyn OutcomeEvent) {
        match self.surface() {
            Some(surface) => surface.evaluate_script(&event.script()),
            None => warn!(surface = %self.id, "dropping outcome event: no surface"),
        }
    }
}

impl BridgeHost for PageController {
    fn surface_id(&self) -> SurfaceId {
        self.id
    }

    fn reload_registry(&self) -> Rc<BroadcastReloadRegistry> {
        Rc::clone(&self.registry)
    }

    fn dom_content_loaded(&self) {
        debug!(surface = %self.id, "DOM content loaded");
        if let Some(delegate) = self.delegate() {
            delegate.dom_content_loaded();
        }
    }
}

impl ReloadSubscriber for PageController {
    fn page_should_be_reloaded(&self) {
        self.reload_web_view();
    }
}
