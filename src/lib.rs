//! Hosts web pages in embedded surfaces and bridges them to native code.
//!
//! * [`bridge`] turns named page events into native handler calls.
//! * [`reload`] fans "reload everything" requests out to live surfaces.
//! * [`lifecycle`] drives each surface between loading, offline, error and
//!   content states.
//!
//! [`headless`] provides a QuickJS-backed surface for running all of the
//! above without a windowing system.

pub mod bridge;
pub mod config;
pub mod headless;
pub mod lifecycle;
pub mod reachability;
pub mod reload;
pub mod surface;

// Re-export commonly used types
pub use bridge::event::{DispatchEvent, EventDescriptor, OutcomeEvent, Params, RELOAD_ALL_EVENT};
pub use bridge::{EventBridge, FireContext};
pub use config::{BridgeConfiguration, DesignConfiguration, SurfaceSettings};
pub use headless::{HeadlessSurface, HeadlessSurfaceFactory};
pub use lifecycle::machine::LifecycleState;
pub use lifecycle::{BridgeError, PageController, PageDelegate, StateChange};
pub use reachability::{ManualReachability, ReachabilityService, ReachabilityStatus};
pub use reload::BroadcastReloadRegistry;
