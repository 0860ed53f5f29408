// ── Reconciliation ticker ──
//
// Refreshes tunnel interfaces on a fixed period and queues a
// reconciliation pass after each refresh. The pass itself runs on the
// orchestrator worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::PeerOrchestrator;
use crate::tunnels::TunnelDirectory;

pub struct ReconciliationService {
    tunnels: Arc<TunnelDirectory>,
    orchestrator: PeerOrchestrator,
    interval: Duration,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationService {
    /// A zero `interval` disables the ticker.
    pub fn new(tunnels: Arc<TunnelDirectory>, orchestrator: PeerOrchestrator, interval: Duration) -> Self {
        Self {
            tunnels,
            orchestrator,
            interval,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn start(&self) {
        if self.interval.is_zero() {
            debug!("reconciliation ticker disabled");
            return;
        }
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        *handle = Some(tokio::spawn(reconcile_task(
            Arc::clone(&self.tunnels),
            self.orchestrator.clone(),
            self.interval,
            self.cancel.clone(),
        )));
        info!(interval_secs = self.interval.as_secs(), "reconciliation ticker started");
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn reconcile_task(
    tunnels: Arc<TunnelDirectory>,
    orchestrator: PeerOrchestrator,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = tunnels.refresh().await {
                    warn!(error = %e, "tunnel refresh failed");
                }
                if let Err(e) = orchestrator.reconcile().await {
                    warn!(error = %e, "cannot queue reconciliation, stopping ticker");
                    break;
                }
            }
        }
    }
}
