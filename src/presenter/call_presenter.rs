//! Presenter für eine laufende Session
//!
//! Folgt dem Snapshot der Session und rendert daraus das View-Modell.
//! Der Sekunden-Ticker für die Gesprächsdauer läuft nur, solange die
//! Session verbunden ist.

use super::view::{CallView, PresenterVariant};
use crate::call_engine::{CallError, CallHandle, CallSnapshot, CallStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

type Ticker = Arc<Mutex<Option<JoinHandle<()>>>>;

pub struct CallPresenter {
    handle: CallHandle,
    variant: PresenterVariant,
    view: watch::Receiver<CallView>,
    render_task: JoinHandle<()>,
    ticker: Ticker,
}

impl CallPresenter {
    /// Hängt eine Ansicht an die Session
    pub fn attach(handle: CallHandle, variant: PresenterVariant) -> Self {
        let snapshots = handle.subscribe();
        let (view_tx, view) = watch::channel(CallView::render(&snapshots.borrow(), variant));
        let ticker: Ticker = Arc::new(Mutex::new(None));

        let render_task = tokio::spawn(Self::follow(
            snapshots,
            variant,
            Arc::new(view_tx),
            Arc::clone(&ticker),
        ));

        Self {
            handle,
            variant,
            view,
            render_task,
            ticker,
        }
    }

    pub fn variant(&self) -> PresenterVariant {
        self.variant
    }

    pub fn view(&self) -> CallView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallView> {
        self.view.clone()
    }

    pub fn ticker_active(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    // ========================================================================
    // INTENTS
    // ========================================================================

    pub fn toggle_mute(&self) -> Result<(), CallError> {
        self.handle.toggle_mute()
    }

    pub fn toggle_video(&self) -> Result<(), CallError> {
        self.require_video_controls()?;
        self.handle.toggle_video()
    }

    pub fn toggle_screen_share(&self) -> Result<(), CallError> {
        self.require_video_controls()?;
        if self.handle.snapshot().screen_sharing {
            self.handle.stop_screen_share()
        } else {
            self.handle.start_screen_share()
        }
    }

    pub fn end_call(&self) -> Result<(), CallError> {
        self.handle.end_call()
    }

    /// Schließt die Ansicht; die Session wird sofort abgebaut
    pub fn close(self) {
        drop(self);
    }

    fn require_video_controls(&self) -> Result<(), CallError> {
        if self.variant.has_video_controls() {
            Ok(())
        } else {
            Err(CallError::InvalidState(
                "video controls are not available in a voice call".to_string(),
            ))
        }
    }

    // ========================================================================
    // RENDERING
    // ========================================================================

    async fn follow(
        mut snapshots: watch::Receiver<CallSnapshot>,
        variant: PresenterVariant,
        view_tx: Arc<watch::Sender<CallView>>,
        ticker: Ticker,
    ) {
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            view_tx.send_replace(CallView::render(&snapshot, variant));
            Self::update_ticker(&snapshot, &snapshots, variant, &view_tx, &ticker);

            if snapshot.status.is_terminal() {
                break;
            }
            if snapshots.changed().await.is_err() {
                // Session beendet, letzten Stand anzeigen
                let snapshot = snapshots.borrow().clone();
                view_tx.send_replace(CallView::render(&snapshot, variant));
                break;
            }
        }

        if let Some(task) = ticker.lock().take() {
            task.abort();
        }
    }

    fn update_ticker(
        snapshot: &CallSnapshot,
        snapshots: &watch::Receiver<CallSnapshot>,
        variant: PresenterVariant,
        view_tx: &Arc<watch::Sender<CallView>>,
        ticker: &Ticker,
    ) {
        let mut ticker = ticker.lock();

        if snapshot.status != CallStatus::Connected {
            if let Some(task) = ticker.take() {
                tracing::debug!("Stopping call duration ticker");
                task.abort();
            }
            return;
        }

        if ticker.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }

        let snapshots = snapshots.clone();
        let view_tx = Arc::clone(view_tx);
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let snapshot = snapshots.borrow().clone();
                if snapshot.status != CallStatus::Connected {
                    break;
                }
                view_tx.send_replace(CallView::render(&snapshot, variant));
            }
        }));
    }
}

impl Drop for CallPresenter {
    fn drop(&mut self) {
        self.render_task.abort();
        if let Some(task) = self.ticker.lock().take() {
            task.abort();
        }
        if !self.handle.is_finished() {
            let _ = self.handle.close();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
