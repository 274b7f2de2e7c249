use std::fs;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::bridge::EventBridge;
use crate::lifecycle::overlays::{Spinner, ViewsProvider};
use crate::lifecycle::PageDelegate;
use crate::reachability::{ProbeSettings, ReachabilityService};
use crate::reload::BroadcastReloadRegistry;
use crate::surface::{ExternalOpener, SurfaceFactory};

const DEFAULT_LINK_URL: &str = "https://example.com/";
const DEFAULT_ANIMATION_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesignConfiguration {
    /// Duration of the re-layout animation run after each inbound event.
    pub animation_duration: Duration,
}

impl Default for DesignConfiguration {
    fn default() -> Self {
        Self {
            animation_duration: Duration::from_millis(DEFAULT_ANIMATION_MS),
        }
    }
}

/// Everything a [`PageController`](crate::lifecycle::PageController) is
/// built from. Fixed at construction.
pub struct BridgeConfiguration {
    pub link_url: Url,
    pub design: DesignConfiguration,
    pub surface_factory: Rc<dyn SurfaceFactory>,
    /// Without a service the page loads as soon as the surface exists.
    pub reachability: Option<Rc<dyn ReachabilityService>>,
    pub views_provider: Option<Box<dyn ViewsProvider>>,
    pub spinner: Option<Box<dyn Spinner>>,
    /// Caller events, wired next to the internal DOM-ready bridge.
    pub event_bridge: Option<EventBridge>,
    pub external_opener: Option<Rc<dyn ExternalOpener>>,
    pub delegate: Option<Weak<dyn PageDelegate>>,
    /// Defaults to [`BroadcastReloadRegistry::shared`].
    pub reload_registry: Option<Rc<BroadcastReloadRegistry>>,
}

impl BridgeConfiguration {
    pub fn new(link_url: Url, surface_factory: Rc<dyn SurfaceFactory>) -> Self {
        Self {
            link_url,
            design: DesignConfiguration::default(),
            surface_factory,
            reachability: None,
            views_provider: None,
            spinner: None,
            event_bridge: None,
            external_opener: None,
            delegate: None,
            reload_registry: None,
        }
    }

    pub fn with_design(mut self, design: DesignConfiguration) -> Self {
        self.design = design;
        self
    }

    pub fn with_reachability(mut self, reachability: Rc<dyn ReachabilityService>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    pub fn with_views_provider(mut self, provider: impl ViewsProvider + 'static) -> Self {
        self.views_provider = Some(Box::new(provider));
        self
    }

    pub fn with_spinner(mut self, spinner: impl Spinner + 'static) -> Self {
        self.spinner = Some(Box::new(spinner));
        self
    }

    pub fn with_event_bridge(mut self, bridge: EventBridge) -> Self {
        self.event_bridge = Some(bridge);
        self
    }

    pub fn with_external_opener(mut self, opener: Rc<dyn ExternalOpener>) -> Self {
        self.external_opener = Some(opener);
        self
    }

    pub fn with_delegate(mut self, delegate: Weak<dyn PageDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_reload_registry(mut self, registry: Rc<BroadcastReloadRegistry>) -> Self {
        self.reload_registry = Some(registry);
        self
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse link URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// File-backed settings for the demo host.
///
/// ```yaml
/// link_url: https://example.com/app
/// animation_duration_ms: 300
/// probe:
///   address: example.com:443
///   interval_ms: 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SurfaceSettings {
    #[serde(default = "default_link_url")]
    pub link_url: Url,
    #[serde(default = "default_animation_ms")]
    pub animation_duration_ms: u64,
    #[serde(default)]
    pub probe: Option<ProbeSettings>,
}

fn default_link_url() -> Url {
    Url::parse(DEFAULT_LINK_URL).expect("default link URL is valid")
}

fn default_animation_ms() -> u64 {
    DEFAULT_ANIMATION_MS
}

impl Default for SurfaceSettings {
    fn default() -> Self {
        Self {
            link_url: default_link_url(),
            animation_duration_ms: DEFAULT_ANIMATION_MS,
            probe: None,
        }
    }
}

impl SurfaceSettings {
    /// Reads `config_path` when given and present, defaults otherwise.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, SettingsError> {
        match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                Ok(serde_yaml::from_str(&contents)?)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn with_link(mut self, raw: &str) -> Result<Self, SettingsError> {
        self.link_url = Url::parse(raw.trim())?;
        Ok(self)
    }

    pub fn design(&self) -> DesignConfiguration {
        DesignConfiguration {
            animation_duration: Duration::from_millis(self.animation_duration_ms),
        }
    }
}
