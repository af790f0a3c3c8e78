//! Presenter Module - Anruf-Ansicht (Sprache und Video)
//!
//! Rendert den Zustand einer Session und leitet Benutzeraktionen weiter.
//! Enthält selbst keine Anruf-Logik.

mod call_presenter;
mod view;

pub use call_presenter::CallPresenter;
pub use view::{format_duration, status_label, CallView, PresenterVariant, WAITING_FOR_PARTICIPANT};
