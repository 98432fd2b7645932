//! Quiet-period coalescing of watch events into change hints.
//!
//! File system activity tends to arrive in bursts: an editor save may produce
//! several events, a `git checkout` thousands. The [`HintDebouncer`] folds
//! every event of a burst into one [`ChangeHint`] and emits it once no new
//! event has arrived for the configured interval.
//!
//! # Architecture
//!
//! A background task owns the pending hint and a single deadline:
//!
//! 1. Each incoming event is merged into the pending hint
//! 2. The deadline is pushed back to `now + interval`
//! 3. When the deadline passes, the merged hint is emitted and cleared
//!
//! When the input side is dropped, anything pending is flushed before the
//! task exits.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use sandwatch::utils::debounce::{HintDebouncer, HintEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (output_tx, mut output_rx) = mpsc::channel(16);
//!     let debouncer = HintDebouncer::new(Duration::from_millis(100), output_tx);
//!
//!     let input = debouncer.sender();
//!     input.send(HintEvent::Path("src/lib.rs".into())).await.unwrap();
//!     input.send(HintEvent::Path("src/main.rs".into())).await.unwrap();
//!
//!     // One hint carrying both paths.
//!     let hint = output_rx.recv().await.unwrap();
//!     assert_eq!(hint.paths.len(), 2);
//! }
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::types::ChangeHint;

/// Capacity of the input channel.
const INPUT_CHANNEL_CAPACITY: usize = 1000;

/// One classified watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintEvent {
    /// A file-level change at a sandbox-relative path.
    Path(String),
    /// A directory-level change requiring a full rescan.
    FullScan,
    /// A change that should trigger a run without narrowing the scan.
    Trigger,
}

/// Coalesces [`HintEvent`]s into one [`ChangeHint`] per quiet period.
#[derive(Debug)]
pub struct HintDebouncer {
    input_tx: mpsc::Sender<HintEvent>,
    #[allow(dead_code)]
    task_handle: tokio::task::JoinHandle<()>,
}

impl HintDebouncer {
    /// Creates a debouncer emitting merged hints on `output_tx`.
    ///
    /// # Arguments
    ///
    /// * `interval` - Quiet period after the last event before emitting
    /// * `output_tx` - Channel receiving merged hints
    #[must_use]
    pub fn new(interval: Duration, output_tx: mpsc::Sender<ChangeHint>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);

        let task_handle = tokio::spawn(async move {
            run_debounce_loop(interval, input_rx, output_tx).await;
        });

        Self {
            input_tx,
            task_handle,
        }
    }

    #[cfg(test)]
    async fn send(&self, event: HintEvent) -> Result<(), mpsc::error::SendError<HintEvent>> {
        self.input_tx.send(event).await
    }

    /// Returns a sender feeding this debouncer, e.g. for a watcher.
    ///
    /// The pending hint is only flushed on close once every sender is gone.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<HintEvent> {
        self.input_tx.clone()
    }
}

/// Pending state between emissions.
struct Pending {
    hint: ChangeHint,
    /// Set once any event arrived, even one that adds no path.
    triggered: bool,
}

impl Pending {
    fn new() -> Self {
        Self {
            hint: ChangeHint::default(),
            triggered: false,
        }
    }

    fn absorb(&mut self, event: HintEvent) {
        self.triggered = true;
        match event {
            HintEvent::Path(path) => self.hint.add_path(path),
            HintEvent::FullScan => self.hint.mark_full(),
            HintEvent::Trigger => {}
        }
    }

    fn take(&mut self) -> Option<ChangeHint> {
        if !self.triggered {
            return None;
        }
        self.triggered = false;
        Some(self.hint.take())
    }
}

async fn run_debounce_loop(
    interval: Duration,
    mut input_rx: mpsc::Receiver<HintEvent>,
    output_tx: mpsc::Sender<ChangeHint>,
) {
    let mut pending = Pending::new();
    let mut deadline: Option<Instant> = None;

    debug!(interval_ms = interval.as_millis(), "Starting debounce loop");

    loop {
        tokio::select! {
            event = input_rx.recv() => {
                match event {
                    Some(event) => {
                        trace!(event = ?event, "Received event, resetting deadline");
                        pending.absorb(event);
                        deadline = Some(Instant::now() + interval);
                    }
                    None => {
                        debug!("Input channel closed, flushing pending hint");
                        emit(&mut pending, &output_tx).await;
                        break;
                    }
                }
            }

            () = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                deadline = None;
                emit(&mut pending, &output_tx).await;
            }
        }
    }

    debug!("Debounce loop terminated");
}

async fn emit(pending: &mut Pending, output_tx: &mpsc::Sender<ChangeHint>) {
    let Some(hint) = pending.take() else {
        return;
    };
    trace!(paths = hint.paths.len(), full_scan = hint.full_scan, "Emitting hint");
    if let Err(e) = output_tx.send(hint).await {
        warn!(error = %e, "Failed to emit debounced hint");
    }
}
