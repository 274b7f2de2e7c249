use serde::{Deserialize, Serialize};

use crate::reachability::ReachabilityStatus;

/// What the page currently shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    #[default]
    Initial,
    Loading,
    NoInternet,
    Error,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Recreated,
    Reachability(ReachabilityStatus),
    NavigationFinished,
    NavigationFailed,
    /// Explicit or broadcast reload; carries reachability at request time.
    ReloadRequested(ReachabilityStatus),
}

/// Lifecycle state plus the deferred-reload flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Machine {
    pub state: LifecycleState,
    /// A reload arrived while offline and runs on the next `HasInternet`.
    pub reload_deferred: bool,
}

impl Machine {
    pub fn step(self, input: Input) -> Machine {
        use LifecycleState::*;

        match input {
            Input::Recreated => Machine::default(),
            Input::Reachability(ReachabilityStatus::HasInternet) => {
                if self.state != Content || self.reload_deferred {
                    Machine {
                        state: Loading,
                        reload_deferred: false,
                    }
                } else {
                    self
                }
            }
            Input::Reachability(ReachabilityStatus::NoInternet) => {
                if self.state != Content {
                    Machine {
                        state: LifecycleState::NoInternet,
                        ..self
                    }
                } else {
                    self
                }
            }
            Input::NavigationFinished if self.state == Loading => Machine {
                state: Content,
                ..self
            },
            Input::NavigationFinished => self,
            Input::NavigationFailed if self.state == LifecycleState::NoInternet => self,
            Input::NavigationFailed => Machine {
                state: Error,
                ..self
            },
            Input::ReloadRequested(ReachabilityStatus::NoInternet) => Machine {
                reload_deferred: true,
                ..self
            },
            Input::ReloadRequested(ReachabilityStatus::HasInternet) => Machine {
                state: Loading,
                reload_deferred: false,
            },
        }
    }
}
