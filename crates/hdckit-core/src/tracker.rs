//! Background device tracking.
//!
//! [`TargetTracker`] polls `list targets` once a second, diffs each
//! snapshot against the previous one, and emits connect keys on bounded
//! channels: additions first, then removals, with tick order preserved.
//! Poll errors go to a capacity-1 error channel with a non-blocking send,
//! so a slow consumer can never stall the poll loop.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};

use crate::client::Client;
use crate::connection::ConnectionError;

/// Poll interval for the target list.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the added/removed channels.
const EVENT_CAPACITY: usize = 8;

/// Tracks device arrivals and departures in a background task.
///
/// Obtained from [`Client::track_targets`]. The channels stay open for the
/// life of the tracker; stop it with [`stop`](Self::stop) (or
/// [`cancel`](Self::cancel)) when done.
pub struct TargetTracker {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
    /// Connect keys of newly attached devices.
    pub added: mpsc::Receiver<String>,
    /// Connect keys of detached devices.
    pub removed: mpsc::Receiver<String>,
    /// Poll failures. Capacity 1; errors are dropped when the slot is full.
    pub errors: mpsc::Receiver<ConnectionError>,
}

impl TargetTracker {
    pub(crate) fn spawn(client: Client) -> Self {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let (added_tx, added) = mpsc::channel(EVENT_CAPACITY);
        let (removed_tx, removed) = mpsc::channel(EVENT_CAPACITY);
        let (errors_tx, errors) = mpsc::channel(1);

        let join_handle = tokio::spawn(
            run_loop(client, token, added_tx, removed_tx, errors_tx)
                .instrument(debug_span!("target_tracker")),
        );

        Self {
            cancel_token,
            join_handle,
            added,
            removed,
            errors,
        }
    }

    /// Stop polling and wait for the background task to finish.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        let _ = self.join_handle.await;
    }

    /// Stop polling without waiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Whether the poll task is still running.
    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }
}

async fn run_loop(
    client: Client,
    cancel: CancellationToken,
    added: mpsc::Sender<String>,
    removed: mpsc::Sender<String>,
    errors: mpsc::Sender<ConnectionError>,
) {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip it so the
    // loop matches its advertised one-second cadence.
    interval.tick().await;

    let mut last: Vec<String> = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let current = match client.list_targets().await {
            Ok(list) => list,
            Err(err) => {
                // Non-blocking: a full error slot drops the report rather
                // than stalling the poll loop.
                let _ = errors.try_send(err);
                continue;
            }
        };

        let (add, remove) = diff(&last, &current);
        if !add.is_empty() || !remove.is_empty() {
            debug!(added = add.len(), removed = remove.len(), "target set changed");
        }
        for key in add {
            tokio::select! {
                _ = cancel.cancelled() => return,
                r = added.send(key) => if r.is_err() { return },
            }
        }
        for key in remove {
            tokio::select! {
                _ = cancel.cancelled() => return,
                r = removed.send(key) => if r.is_err() { return },
            }
        }
        last = current;
    }
}

/// Set difference in both directions, preserving input order:
/// `(new \ old, old \ new)`.
fn diff(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let added = new
        .iter()
        .filter(|k| !old.contains(k))
        .cloned()
        .collect();
    let removed = old
        .iter()
        .filter(|k| !new.contains(k))
        .cloned()
        .collect();
    (added, removed)
}
