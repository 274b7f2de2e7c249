//! A windowless [`WebSurface`] that runs injected scripts in QuickJS.
//!
//! Documents are fetched (from disk or over HTTP) but not rendered; each
//! committed navigation gets a fresh [`ScriptEngine`] with the surface's user
//! scripts injected at document start and end. Messages scripts post to
//! `webkit.messageHandlers` are delivered to the [`ChannelRegistry`] once the
//! engine returns.

pub mod engine;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::bridge::event::{DispatchEvent, OutcomeEvent};
use crate::bridge::registry::{ChannelId, ChannelRegistry, InjectionTime, MessageRegistry};
use crate::surface::{
    NavigationDelegate, NavigationFailure, NavigationPolicy, NavigationRequest, SurfaceError,
    SurfaceFactory, WebSurface,
};

use self::engine::{Outbox, ScriptEngine};

/// The document a headless surface currently shows.
struct Document {
    url: Url,
    source: String,
    engine: ScriptEngine,
}

pub struct HeadlessSurface {
    this: Weak<HeadlessSurface>,
    registry: ChannelRegistry,
    delegate: RefCell<Option<Weak<dyn NavigationDelegate>>>,
    document: RefCell<Option<Document>>,
    outbox: Outbox,
    load_task: RefCell<Option<JoinHandle<()>>>,
    generation: Cell<u64>,
    requests: RefCell<Vec<NavigationRequest>>,
    layout_passes: Cell<usize>,
    torn_down: Cell<bool>,
}

impl HeadlessSurface {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            registry: ChannelRegistry::new(),
            delegate: RefCell::new(None),
            document: RefCell::new(None),
            outbox: Rc::new(RefCell::new(VecDeque::new())),
            load_task: RefCell::new(None),
            generation: Cell::new(0),
            requests: RefCell::new(Vec::new()),
            layout_passes: Cell::new(0),
            torn_down: Cell::new(false),
        })
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// URL of the committed document, if any.
    pub fn current_url(&self) -> Option<Url> {
        self.document.borrow().as_ref().map(|doc| doc.url.clone())
    }

    pub fn document_source(&self) -> Option<String> {
        self.document.borrow().as_ref().map(|doc| doc.source.clone())
    }

    /// Every load issued against this surface, cancelled ones included.
    pub fn requests(&self) -> Vec<NavigationRequest> {
        self.requests.borrow().clone()
    }

    pub fn layout_passes(&self) -> usize {
        self.layout_passes.get()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.get()
    }

    /// Dispatches a `CustomEvent` on the page's `window`, as page script
    /// would.
    pub fn dispatch_event(&self, name: &str, detail: JsonValue) {
        self.evaluate_script(&DispatchEvent::new(name, detail).script());
    }

    /// Evaluates `source` in the current document and returns the result.
    pub fn eval_with<V>(&self, source: &str) -> anyhow::Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let result = {
            let document = self.document.borrow();
            let Some(document) = document.as_ref() else {
                anyhow::bail!("no document loaded");
            };
            document.engine.eval_with(source, "evaluate.js")
        };
        self.flush_messages();
        result
    }

    fn delegate(&self) -> Option<Rc<dyn NavigationDelegate>> {
        self.delegate.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn commit(&self, url: Url, source: String) -> Result<(), NavigationFailure> {
        let engine = ScriptEngine::new(Rc::clone(&self.outbox))
            .map_err(|err| NavigationFailure::Committed(err.to_string()))?;
        self.outbox.borrow_mut().clear();

        let scripts = self.registry.user_scripts();
        let run = |phase: InjectionTime| {
            for (index, script) in scripts
                .iter()
                .filter(|script| script.injection_time == phase)
                .enumerate()
            {
                let filename = format!("user-script-{phase:?}-{index}.js");
                if let Err(err) = engine.eval(&script.source, &filename) {
                    warn!(url = %url, script = %filename, error = %err, "user script failed");
                }
            }
        };

        run(InjectionTime::DocumentStart);
        set_ready_state(&engine, "interactive");
        run(InjectionTime::DocumentEnd);
        if let Err(err) = engine.eval(
            "document.dispatchEvent(new Event('DOMContentLoaded'));\
             document.readyState = 'complete';\
             window.dispatchEvent(new Event('load'));",
            "document-events.js",
        ) {
            warn!(url = %url, error = %err, "document events failed");
        }

        info!(url = %url, bytes = source.len(), "document committed");
        *self.document.borrow_mut() = Some(Document { url, source, engine });
        Ok(())
    }

    /// Delivers queued script messages. No engine borrow is held while
    /// handlers run, so they may evaluate scripts on this surface.
    fn flush_messages(&self) {
        loop {
            if self.torn_down.get() {
                self.outbox.borrow_mut().clear();
                return;
            }
            let next = self.outbox.borrow_mut().pop_front();
            let Some(message) = next else {
                return;
            };
            let body = serde_json::from_str(&message.body).unwrap_or_else(|err| {
                warn!(channel = %message.channel, error = %err, "unparseable message body");
                JsonValue::Null
            });
            let channel = ChannelId::from(message.channel.as_str());
            if let Err(err) = self.registry.deliver(&channel, body) {
                warn!(error = %err, "dropping script message");
            }
        }
    }

    fn finish_load(&self, generation: u64, url: Url, fetched: Result<String, NavigationFailure>) {
        if self.torn_down.get() || self.generation.get() != generation {
            debug!(url = %url, "discarding superseded navigation");
            return;
        }
        let outcome = fetched.and_then(|source| self.commit(url, source));
        self.flush_messages();
        if self.torn_down.get() {
            return;
        }

        let Some(delegate) = self.delegate() else {
            return;
        };
        match outcome {
            Ok(()) => delegate.did_finish(),
            Err(failure) => delegate.did_fail(failure),
        }
    }
}

impl WebSurface for HeadlessSurface {
    fn content_controller(&self) -> &dyn MessageRegistry {
        &self.registry
    }

    fn set_navigation_delegate(&self, delegate: Weak<dyn NavigationDelegate>) {
        *self.delegate.borrow_mut() = Some(delegate);
    }

    fn load(&self, request: NavigationRequest) {
        if self.torn_down.get() {
            warn!(url = %request.url(), "load on a torn down surface");
            return;
        }
        self.requests.borrow_mut().push(request.clone());

        if let Some(delegate) = self.delegate() {
            if delegate.decide_policy(request.url()) == NavigationPolicy::Cancel {
                debug!(url = %request.url(), "navigation cancelled by policy");
                return;
            }
        }

        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        let this = self.this.clone();
        let task = tokio::task::spawn_local(async move {
            let fetched = fetch_document(&request).await;
            if let Some(surface) = this.upgrade() {
                surface.finish_load(generation, request.url().clone(), fetched);
            }
        });
        if let Some(previous) = self.load_task.borrow_mut().replace(task) {
            previous.abort();
        }
    }

    fn evaluate_script(&self, source: &str) {
        let result = {
            let document = self.document.borrow();
            let Some(document) = document.as_ref() else {
                warn!("no document to evaluate script in");
                return;
            };
            document.engine.eval(source, "evaluate.js")
        };
        if let Err(err) = result {
            warn!(error = %err, "script evaluation failed");
        }
        self.flush_messages();
    }

    fn animate_layout(&self, duration: Duration) {
        self.layout_passes.set(self.layout_passes.get() + 1);
        debug!(duration_ms = duration.as_millis() as u64, "layout pass");
    }

    fn teardown(&self) {
        self.torn_down.set(true);
        if let Some(task) = self.load_task.borrow_mut().take() {
            task.abort();
        }
        self.outbox.borrow_mut().clear();
        self.document.borrow_mut().take();
        self.delegate.borrow_mut().take();
        self.registry.remove_all();
    }
}

fn set_ready_state(engine: &ScriptEngine, state: &str) {
    let script = format!("document.readyState = '{state}';");
    if let Err(err) = engine.eval(&script, "ready-state.js") {
        warn!(error = %err, "failed to update readyState");
    }
}

async fn fetch_document(request: &NavigationRequest) -> Result<String, NavigationFailure> {
    match request {
        NavigationRequest::File { url, read_access } => {
            let path = url
                .to_file_path()
                .map_err(|_| NavigationFailure::Provisional(format!("invalid file URL {url}")))?;
            if !path.starts_with(read_access) {
                return Err(NavigationFailure::Provisional(format!(
                    "{} is outside {}",
                    path.display(),
                    read_access.display()
                )));
            }
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| NavigationFailure::Provisional(format!("{}: {err}", path.display())))
        }
        NavigationRequest::Network { url } => {
            let response = reqwest::get(url.as_str())
                .await
                .and_then(|response| response.error_for_status())
                .map_err(|err| NavigationFailure::Provisional(err.to_string()))?;
            response
                .text()
                .await
                .map_err(|err| NavigationFailure::Committed(err.to_string()))
        }
    }
}

/// Creates [`HeadlessSurface`]s and remembers them for inspection.
#[derive(Default)]
pub struct HeadlessSurfaceFactory {
    created: RefCell<Vec<Weak<HeadlessSurface>>>,
}

impl HeadlessSurfaceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently created surface, while it is still alive.
    pub fn last(&self) -> Option<Rc<HeadlessSurface>> {
        self.created.borrow().last().and_then(Weak::upgrade)
    }

    pub fn created_count(&self) -> usize {
        self.created.borrow().len()
    }
}

impl SurfaceFactory for HeadlessSurfaceFactory {
    fn create(&self) -> LocalBoxFuture<'_, Result<Rc<dyn WebSurface>, SurfaceError>> {
        async move {
            let surface = HeadlessSurface::new();
            self.created.borrow_mut().push(Rc::downgrade(&surface));
            Ok(surface as Rc<dyn WebSurface>)
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::registry::{ScriptMessageHandler, UserScript};
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::task::LocalSet;

    #[derive(Default)]
    struct Recorder {
        bodies: RefCell<Vec<JsonValue>>,
    }

    impl ScriptMessageHandler for Recorder {
        fn did_receive(&self, body: JsonValue) {
            self.bodies.borrow_mut().push(body);
        }
    }

    #[derive(Default)]
    struct Outcomes {
        finished: Cell<usize>,
        failures: RefCell<Vec<NavigationFailure>>,
    }

    impl NavigationDelegate for Outcomes {
        fn decide_policy(&self, _url: &Url) -> NavigationPolicy {
            NavigationPolicy::Allow
        }

        fn did_finish(&self) {
            self.finished.set(self.finished.get() + 1);
        }

        fn did_fail(&self, failure: NavigationFailure) {
            self.failures.borrow_mut().push(failure);
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn html_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "<html><body>hi</body></html>").unwrap();
        file
    }

    #[tokio::test]
    async fn runs_user_scripts_and_delivers_messages() {
        LocalSet::new()
            .run_until(async {
                let file = html_file();
                let surface = HeadlessSurface::new();
                let outcomes = Rc::new(Outcomes::default());
                let delegate: Weak<dyn NavigationDelegate> = Rc::<Outcomes>::downgrade(&outcomes);
                surface.set_navigation_delegate(delegate);

                let recorder = Rc::new(Recorder::default());
                surface
                    .registry()
                    .add_handler(&ChannelId::from("_ready"), recorder.clone());
                surface.registry().add_user_script(UserScript::at_document_end(
                    "window.webkit.messageHandlers._ready.postMessage({ state: document.readyState });"
                        .to_string(),
                ));

                let url = Url::from_file_path(file.path()).unwrap();
                surface.load(NavigationRequest::for_url(&url));
                settle().await;

                assert_eq!(outcomes.finished.get(), 1);
                assert_eq!(
                    recorder.bodies.borrow().as_slice(),
                    &[serde_json::json!({ "state": "interactive" })]
                );
                assert_eq!(surface.current_url(), Some(url));
                assert!(surface.document_source().unwrap().contains("hi"));
            })
            .await;
    }

    #[tokio::test]
    async fn missing_file_fails_provisionally() {
        LocalSet::new()
            .run_until(async {
                let surface = HeadlessSurface::new();
                let outcomes = Rc::new(Outcomes::default());
                let delegate: Weak<dyn NavigationDelegate> = Rc::<Outcomes>::downgrade(&outcomes);
                surface.set_navigation_delegate(delegate);

                let url = Url::parse("file:///nonexistent/webbridge/index.html").unwrap();
                surface.load(NavigationRequest::for_url(&url));
                settle().await;

                assert_eq!(outcomes.finished.get(), 0);
                assert!(matches!(
                    outcomes.failures.borrow().as_slice(),
                    [NavigationFailure::Provisional(_)]
                ));
            })
            .await;
    }

    #[tokio::test]
    async fn teardown_suppresses_callbacks() {
        LocalSet::new()
            .run_until(async {
                let file = html_file();
                let surface = HeadlessSurface::new();
                let outcomes = Rc::new(Outcomes::default());
                let delegate: Weak<dyn NavigationDelegate> = Rc::<Outcomes>::downgrade(&outcomes);
                surface.set_navigation_delegate(delegate);

                let url = Url::from_file_path(file.path()).unwrap();
                surface.load(NavigationRequest::for_url(&url));
                surface.teardown();
                settle().await;

                assert!(surface.is_torn_down());
                assert_eq!(outcomes.finished.get(), 0);
                assert!(outcomes.failures.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn dispatch_event_reaches_page_listeners() {
        LocalSet::new()
            .run_until(async {
                let file = html_file();
                let surface = HeadlessSurface::new();
                surface.registry().add_user_script(UserScript::at_document_end(
                    "var received = null; window.addEventListener('ping', function (e) { received = e.detail.n; });"
                        .to_string(),
                ));
                let url = Url::from_file_path(file.path()).unwrap();
                surface.load(NavigationRequest::for_url(&url));
                settle().await;

                surface.dispatch_event("ping", serde_json::json!({ "n": 7 }));
                let received: i32 = surface.eval_with("received").unwrap();
                assert_eq!(received, 7);
            })
            .await;
    }
}
