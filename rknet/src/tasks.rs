//! Background maintenance run by a network host.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::NetworkManager;

/// Starts the reclaim and DNS refresh loops that apply to the manager's
/// topology and configuration. Every loop stops once `token` is cancelled.
pub fn spawn_periodic_tasks(
    manager: Arc<NetworkManager>,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let config = manager.context().config.clone();
    let mut handles = Vec::new();

    if manager.topology().timeout_fixed_ips() {
        let period = Duration::from_secs(config.fixed_ip_reclaim_interval);
        handles.push(tokio::spawn(reclaim_loop(manager.clone(), period, token.clone())));
    }
    if config.dns_update_periodic_interval > 0 {
        let period = Duration::from_secs(config.dns_update_periodic_interval as u64);
        handles.push(tokio::spawn(dns_loop(manager, period, token)));
    }
    handles
}

/// Waits for every task. Returns how many of them panicked or were aborted.
pub async fn join_periodic_tasks(handles: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for handle in handles {
        if let Err(e) = handle.await {
            error!("periodic task failed: {e}");
            failed += 1;
        }
    }
    failed
}

async fn reclaim_loop(manager: Arc<NetworkManager>, period: Duration, token: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match manager.disassociate_stale_fixed_ips().await {
                    Ok(0) => debug!("no stale fixed ips"),
                    Ok(n) => info!("disassociated {n} stale fixed ip(s)"),
                    Err(e) => error!("stale fixed ip reclaim failed: {e}"),
                }
            }
            _ = token.cancelled() => {
                info!("fixed ip reclaim stopped");
                return;
            }
        }
    }
}

async fn dns_loop(manager: Arc<NetworkManager>, period: Duration, token: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately and init_host already refreshed.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = manager.refresh_dns().await {
                    error!("periodic dns update failed: {e}");
                }
            }
            _ = token.cancelled() => {
                info!("periodic dns update stopped");
                return;
            }
        }
    }
}
