//! Coalescing of noisy change signals
//!
//! Events from every watcher, the poller and SIGHUP all land on one input.
//! The gate only lets a signal through after `quiet` has passed with no
//! further input, so a burst of container churn costs a single update.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Sending half of the gate's input
pub type SignalSender = mpsc::UnboundedSender<()>;

/// Debounce `input`, returning a channel that fires once per quiet burst.
///
/// Every signal restarts the `quiet` timer. When it expires one signal is
/// emitted. The output holds at most one pending signal, so a slow consumer
/// never blocks the gate: extra triggers fold into the pending one.
///
/// Closing the input flushes a pending burst (after its quiet period) and
/// then closes the output. The gate also stops once the output is dropped.
pub fn debounce(quiet: Duration, mut input: mpsc::UnboundedReceiver<()>) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        loop {
            // Idle: wait for the start of a burst
            tokio::select! {
                signal = input.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
                _ = tx.closed() => break,
            }

            let timer = tokio::time::sleep(quiet);
            tokio::pin!(timer);
            let mut input_closed = false;

            loop {
                tokio::select! {
                    signal = input.recv(), if !input_closed => match signal {
                        Some(()) => {
                            trace!("Debounce timer reset");
                            timer.as_mut().reset(Instant::now() + quiet);
                        }
                        None => input_closed = true,
                    },
                    _ = &mut timer => break,
                }
            }

            match tx.try_send(()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(())) => {
                    trace!("Trigger already pending, coalescing");
                }
                Err(mpsc::error::TrySendError::Closed(())) => break,
            }

            if input_closed {
                break;
            }
        }
    });

    rx
}
