use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use thiserror::Error;
use url::Url;

use crate::bridge::registry::MessageRegistry;

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one hosted page, stable for the lifetime of its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

impl SurfaceId {
    pub fn next() -> Self {
        Self(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// A load issued against a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationRequest {
    Network {
        url: Url,
    },
    /// Local document; the surface may read anything under `read_access`.
    File {
        url: Url,
        read_access: PathBuf,
    },
}

impl NavigationRequest {
    pub fn for_url(url: &Url) -> Self {
        if url.scheme() == "file" {
            if let Ok(path) = url.to_file_path() {
                let read_access = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| path.clone());
                return Self::File {
                    url: url.clone(),
                    read_access,
                };
            }
        }
        Self::Network { url: url.clone() }
    }

    pub fn url(&self) -> &Url {
        match self {
            Self::Network { url } | Self::File { url, .. } => url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationPolicy {
    Allow,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationFailure {
    /// Failed before any content started arriving.
    #[error("provisional navigation failed: {0}")]
    Provisional(String),
    #[error("navigation failed: {0}")]
    Committed(String),
}

/// Callbacks a surface issues for the navigations it performs.
pub trait NavigationDelegate {
    fn decide_policy(&self, url: &Url) -> NavigationPolicy;
    fn did_finish(&self);
    fn did_fail(&self, failure: NavigationFailure);
}

/// The embedded web-rendering view.
///
/// Surfaces are created with back/forward gestures disabled and report every
/// navigation outcome to their delegate on the control thread. After
/// [`WebSurface::teardown`] no further delegate callbacks or channel
/// deliveries may happen.
pub trait WebSurface {
    fn content_controller(&self) -> &dyn MessageRegistry;
    fn set_navigation_delegate(&self, delegate: Weak<dyn NavigationDelegate>);
    fn load(&self, request: NavigationRequest);
    fn evaluate_script(&self, source: &str);
    /// Re-layout the hosting view, animated over `duration`.
    fn animate_layout(&self, _duration: Duration) {}
    fn teardown(&self);
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("failed to create surface: {0}")]
    Create(String),
    #[error("script engine error: {0}")]
    Engine(#[from] anyhow::Error),
}

pub trait SurfaceFactory {
    fn create(&self) -> LocalBoxFuture<'_, Result<Rc<dyn WebSurface>, SurfaceError>>;
}

/// Hands link targets to other applications.
pub trait ExternalOpener {
    fn can_open(&self, url: &Url) -> bool;
    fn open(&self, url: &Url);
}

/// Anything that is not plain `http`/`https`.
pub fn is_custom_scheme(url: &Url) -> bool {
    !matches!(url.scheme(), "http" | "https")
}
