use super::machine::LifecycleState;

/// A full-screen view laid over the surface.
pub trait Overlay {
    fn set_visible(&self, visible: bool);
}

/// Optional factories for the auxiliary overlays. A missing overlay is never
/// shown.
pub trait ViewsProvider {
    fn create_loading_view(&self) -> Option<Box<dyn Overlay>> {
        None
    }

    fn create_offline_view(&self) -> Option<Box<dyn Overlay>> {
        None
    }

    fn create_error_view(&self) -> Option<Box<dyn Overlay>> {
        None
    }
}

pub trait Spinner {
    fn show(&self);
    fn hide(&self);
}

#[derive(Default)]
pub(crate) struct Overlays {
    loading: Option<Box<dyn Overlay>>,
    offline: Option<Box<dyn Overlay>>,
    error: Option<Box<dyn Overlay>>,
}

impl Overlays {
    pub(crate) fn from_provider(provider: Option<&dyn ViewsProvider>) -> Self {
        let Some(provider) = provider else {
            return Self::default();
        };
        Self {
            loading: provider.create_loading_view(),
            offline: provider.create_offline_view(),
            error: provider.create_error_view(),
        }
    }

    /// Shows the overlay mapped to `state` and hides the rest.
    pub(crate) fn apply(&self, state: LifecycleState) {
        let slots = [
            (&self.loading, LifecycleState::Loading),
            (&self.offline, LifecycleState::NoInternet),
            (&self.error, LifecycleState::Error),
        ];
        for (overlay, shown_in) in slots {
            if let Some(overlay) = overlay {
                overlay.set_visible(state == shown_in);
            }
        }
    }
}
