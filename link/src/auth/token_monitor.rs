use super::credentials::{usable_token, CredentialStore};
use crate::connection::WeakEngine;
use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle, time::MissedTickBehavior};

/// Lower bound on the poll period; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a [`CredentialStore`] and drives the connection from the
/// connectable token:
///
/// - absent → present: wait the settle delay, re-check, then `connect()`
/// - present → a different token (rotation, refresh of an expired or
///   rejected credential): same as above; `connect()` is a no-op while
///   the connection is already up
/// - present → absent: `disconnect()`
///
/// Locally expired JWTs count as absent. The monitor starts out assuming
/// no token, so a token already present when it starts triggers a connect
/// on the first poll. It stops when [`stop`](Self::stop) is called, when
/// it is dropped, or once the client it drives is gone.
pub struct AuthTokenMonitor {
    _stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl AuthTokenMonitor {
    pub(crate) fn spawn(
        store: Arc<dyn CredentialStore>,
        engine: WeakEngine,
        poll_interval: Duration,
        settle_delay: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(watch_token(store, engine, poll_interval, settle_delay, stop_rx));
        Self {
            _stop_tx: stop_tx,
            task,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        log::debug!("[triage-link] Stopping token monitor");
    }
}

async fn watch_token(
    store: Arc<dyn CredentialStore>,
    engine: WeakEngine,
    poll_interval: Duration,
    settle_delay: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(poll_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut current: Option<String> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {},
        }

        let seen = usable_token(store.as_ref()).ok();
        if seen == current {
            continue;
        }

        if seen.is_some() {
            // Sign-in flows often write the token in several steps.
            if !settle_delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(settle_delay) => {},
                }
            }
            let Ok(settled) = usable_token(store.as_ref()) else {
                log::debug!("[triage-link] Token vanished during settle delay");
                continue;
            };
            if current.is_some() {
                log::info!("[triage-link] Credential rotated, connecting");
            } else {
                log::info!("[triage-link] Credential available, connecting");
            }
            current = Some(settled);
            if !engine.connect() {
                break;
            }
        } else {
            log::info!("[triage-link] Credential removed, disconnecting");
            current = None;
            if !engine.disconnect() {
                break;
            }
        }
    }

    log::debug!("[triage-link] Token monitor exited");
}
