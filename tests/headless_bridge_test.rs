use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde_json::json;
use tempfile::NamedTempFile;
use tokio::task::LocalSet;
use url::Url;

use webbridge::{
    BridgeConfiguration, BroadcastReloadRegistry, DispatchEvent, EventBridge, EventDescriptor,
    HeadlessSurfaceFactory, LifecycleState, PageController, PageDelegate, Params,
    RELOAD_ALL_EVENT,
};

const PAGE: &str = r#"<!DOCTYPE html>
<html>
  <head><title>bridge</title></head>
  <body><a href="https://example.com">link</a></body>
</html>
"#;

fn page_file() -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".html")
        .tempfile()
        .expect("temp file");
    file.write_all(PAGE.as_bytes()).expect("write page");
    file
}

#[derive(Default)]
struct Delegate {
    dom_ready: Cell<usize>,
    finished: Cell<usize>,
}

impl PageDelegate for Delegate {
    fn dom_content_loaded(&self) {
        self.dom_ready.set(self.dom_ready.get() + 1);
    }

    fn did_finish_loading_link(&self) {
        self.finished.set(self.finished.get() + 1);
    }
}

async fn wait_for_content(controller: &PageController) {
    let mut changes = controller.state_changes();
    let state = tokio::time::timeout(
        Duration::from_secs(10),
        changes.wait_for(|state| matches!(state, LifecycleState::Content | LifecycleState::Error)),
    )
    .await
    .expect("page settled in time")
    .map(|state| *state)
    .expect("state channel open");
    assert_eq!(state, LifecycleState::Content);
}

#[tokio::test]
async fn test_page_events_round_trip() {
    LocalSet::new()
        .run_until(async {
            let file = page_file();
            let link = Url::from_file_path(file.path()).expect("file url");

            let received: Rc<RefCell<Vec<Params>>> = Rc::default();
            let sink = received.clone();
            let bridge = EventBridge::with_events(vec![EventDescriptor::new(
                "openLink",
                move |params, context| {
                    sink.borrow_mut().push(params.clone());
                    context.run(&DispatchEvent::new("linkHandled", json!({ "handled": true })));
                },
            )
            .with_parameter("url", "params.url")]);

            let delegate = Rc::new(Delegate::default());
            let page_delegate: Weak<dyn PageDelegate> = Rc::<Delegate>::downgrade(&delegate);
            let factory = Rc::new(HeadlessSurfaceFactory::new());
            let controller = PageController::new(
                BridgeConfiguration::new(link.clone(), factory.clone())
                    .with_event_bridge(bridge)
                    .with_delegate(page_delegate)
                    .with_reload_registry(Rc::new(BroadcastReloadRegistry::new())),
            );

            controller.recreate().await.expect("recreate");
            wait_for_content(&controller).await;
            assert_eq!(delegate.dom_ready.get(), 1);
            assert_eq!(delegate.finished.get(), 1);

            let surface = factory.last().expect("surface");
            assert_eq!(surface.current_url(), Some(link));
            surface
                .eval_with::<()>(
                    "var handled = false; window.addEventListener('linkHandled', function (e) { handled = e.detail.handled; });",
                )
                .expect("install listener");

            surface.dispatch_event("openLink", json!({ "url": "https://example.com" }));

            let received = received.borrow();
            assert_eq!(received.len(), 1);
            assert_eq!(
                serde_json::Value::Object(received[0].clone()),
                json!({ "url": "https://example.com" })
            );
            let handled: bool = surface.eval_with("handled").expect("read flag");
            assert!(handled);
            assert_eq!(surface.layout_passes(), 2);
        })
        .await;
}

#[tokio::test]
async fn test_reload_all_event_reloads_other_pages() {
    LocalSet::new()
        .run_until(async {
            let file = page_file();
            let link = Url::from_file_path(file.path()).expect("file url");
            let registry = Rc::new(BroadcastReloadRegistry::new());

            let factory_a = Rc::new(HeadlessSurfaceFactory::new());
            let a = PageController::new(
                BridgeConfiguration::new(link.clone(), factory_a.clone())
                    .with_event_bridge(EventBridge::with_events(vec![
                        EventDescriptor::reload_all_surfaces(),
                    ]))
                    .with_reload_registry(registry.clone()),
            );
            let factory_b = Rc::new(HeadlessSurfaceFactory::new());
            let b = PageController::new(
                BridgeConfiguration::new(link, factory_b.clone())
                    .with_reload_registry(registry.clone()),
            );

            let a_loads = Rc::new(Cell::new(0));
            let b_loads = Rc::new(Cell::new(0));
            for (controller, loads) in [(&a, &a_loads), (&b, &b_loads)] {
                let loads = loads.clone();
                controller.observe_state(move |change| {
                    if change.to == LifecycleState::Loading {
                        loads.set(loads.get() + 1);
                    }
                });
            }

            a.recreate().await.expect("recreate a");
            b.recreate().await.expect("recreate b");
            wait_for_content(&a).await;
            wait_for_content(&b).await;

            let surface_a = factory_a.last().expect("surface a");
            surface_a.dispatch_event(RELOAD_ALL_EVENT, json!({}));

            assert_eq!(b.state(), LifecycleState::Loading);
            wait_for_content(&b).await;

            assert_eq!(a_loads.get(), 1);
            assert_eq!(b_loads.get(), 2);
            assert_eq!(a.state(), LifecycleState::Content);
            assert_eq!(factory_b.last().expect("surface b").requests().len(), 2);
        })
        .await;
}

#[tokio::test]
async fn test_missing_document_is_an_error() {
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().expect("temp dir");
            let link = Url::from_file_path(dir.path().join("missing.html")).expect("file url");
            let factory = Rc::new(HeadlessSurfaceFactory::new());
            let controller = PageController::new(
                BridgeConfiguration::new(link, factory.clone())
                    .with_reload_registry(Rc::new(BroadcastReloadRegistry::new())),
            );

            controller.recreate().await.expect("recreate");
            let mut changes = controller.state_changes();
            let state = tokio::time::timeout(
                Duration::from_secs(10),
                changes.wait_for(|state| *state == LifecycleState::Error),
            )
            .await
            .expect("error in time")
            .map(|state| *state)
            .expect("state channel open");
            assert_eq!(state, LifecycleState::Error);

            controller.teardown();
            let surface = factory.last();
            assert!(surface.map_or(true, |surface| surface.is_torn_down()));
        })
        .await;
}
