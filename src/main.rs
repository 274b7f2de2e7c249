use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use serde_json::json;
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webbridge::reachability::ProbeReachability;
use webbridge::{
    BridgeConfiguration, BroadcastReloadRegistry, EventBridge, EventDescriptor,
    HeadlessSurfaceFactory, LifecycleState, PageController, ReachabilityService, SurfaceSettings,
    RELOAD_ALL_EVENT,
};

const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    let raw_link = std::env::args().nth(1);

    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let config_path = std::env::var("WEBBRIDGE_CONFIG").ok().map(PathBuf::from);
    let mut settings = SurfaceSettings::load(config_path).unwrap_or_else(|err| {
        eprintln!("Failed to load settings: {err}. Using defaults.");
        SurfaceSettings::default()
    });
    if let Some(raw) = raw_link {
        settings = settings.with_link(&raw).unwrap_or_else(|err| {
            eprintln!("Invalid link {raw:?}: {err}");
            std::process::exit(2);
        });
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        });

    let local = LocalSet::new();
    if let Err(err) = local.block_on(&rt, run(settings)) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

/// Loads the link in two surfaces, then has the first ask every other
/// surface to reload.
async fn run(settings: SurfaceSettings) -> anyhow::Result<()> {
    let reachability: Option<Rc<dyn ReachabilityService>> = settings
        .probe
        .clone()
        .map(|probe| Rc::new(ProbeReachability::spawn(probe)) as Rc<dyn ReachabilityService>);
    let registry = BroadcastReloadRegistry::shared();

    let configure = |factory: Rc<HeadlessSurfaceFactory>, events: Vec<EventDescriptor>| {
        let mut config = BridgeConfiguration::new(settings.link_url.clone(), factory)
            .with_design(settings.design())
            .with_reload_registry(Rc::clone(&registry))
            .with_event_bridge(EventBridge::with_events(events));
        if let Some(reachability) = &reachability {
            config = config.with_reachability(Rc::clone(reachability));
        }
        PageController::new(config)
    };

    let primary_factory = Rc::new(HeadlessSurfaceFactory::new());
    let primary = configure(
        Rc::clone(&primary_factory),
        vec![
            EventDescriptor::reload_all_surfaces(),
            EventDescriptor::new("openLink", |params, _| {
                info!(params = %serde_json::Value::Object(params.clone()), "openLink fired");
            })
            .with_parameter("url", "params.url"),
        ],
    );
    let secondary = configure(Rc::new(HeadlessSurfaceFactory::new()), Vec::new());

    primary.recreate().await?;
    secondary.recreate().await?;
    wait_for_content(&primary).await?;
    wait_for_content(&secondary).await?;

    let surface = primary_factory
        .last()
        .context("primary surface was not created")?;
    surface.dispatch_event(RELOAD_ALL_EVENT, json!({}));
    info!(
        primary = ?primary.state(),
        secondary = ?secondary.state(),
        "reload broadcast sent"
    );
    wait_for_content(&secondary).await?;

    info!(live = registry.live_count(), "all surfaces loaded");
    primary.teardown();
    secondary.teardown();
    Ok(())
}

async fn wait_for_content(controller: &PageController) -> anyhow::Result<()> {
    let mut changes = controller.state_changes();
    let settled = tokio::time::timeout(
        LOAD_TIMEOUT,
        changes.wait_for(|state| matches!(state, LifecycleState::Content | LifecycleState::Error)),
    )
    .await
    .with_context(|| format!("{} did not finish loading", controller.id()))?
    .map(|state| *state)
    .context("state channel closed")?;

    if settled == LifecycleState::Error {
        bail!("{} failed to load", controller.id());
    }
    info!(surface = %controller.id(), "content loaded");
    Ok(())
}
