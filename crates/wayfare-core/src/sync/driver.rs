//! Background trigger loop.
//!
//! Reconnects, the periodic pull timer and backoff retries all end up in
//! `SyncController::request`, so they coalesce like any other caller.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::controller::{SyncController, SyncTrigger};
use super::error::{SyncError, SyncResult};
use super::transport::SyncTransport;

/// Drive `controller` until `shutdown` resolves.
///
/// `online` is the receiver of a `ConnectivityMonitor`; an offline→online
/// edge requests a cycle immediately. `timer` requests a cycle every period
/// (the first tick fires right away). Returns `AuthExpired` when the
/// credential runs out, since nothing can sync until the host re-authenticates.
pub async fn run_sync_loop<T, S>(
    controller: &SyncController<T>,
    mut online: Option<watch::Receiver<bool>>,
    timer: Option<Duration>,
    shutdown: S,
) -> SyncResult<()>
where
    T: SyncTransport,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut ticker = timer.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let retry_in = controller.retry_in();
        let trigger = tokio::select! {
            () = &mut shutdown => {
                tracing::info!("Sync loop stopped");
                return Ok(());
            }
            () = reconnected(&mut online) => SyncTrigger::Reconnected,
            () = tick(&mut ticker) => SyncTrigger::Timer,
            () = retry_after(retry_in) => SyncTrigger::Retry,
        };

        match controller.request(trigger).await {
            Ok(outcome) => tracing::debug!("{:?} trigger finished: {:?}", trigger, outcome),
            Err(SyncError::AuthExpired) => {
                tracing::warn!("Sync loop stopped: authentication expired");
                return Err(SyncError::AuthExpired);
            }
            // Already logged and scheduled for retry by the controller
            Err(_) => {}
        }
    }
}

/// Resolves on the next offline→online transition; never without a monitor
async fn reconnected(online: &mut Option<watch::Receiver<bool>>) {
    loop {
        let Some(receiver) = online.as_mut() else {
            return std::future::pending().await;
        };
        if receiver.changed().await.is_err() {
            // Monitor dropped; no more events will come
            *online = None;
            continue;
        }
        if *receiver.borrow_and_update() {
            return;
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn retry_after(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
