/*
 * runtime.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Fermoposta, a self-hosted mail platform.
 *
 * Fermoposta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fermoposta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fermoposta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Session runtime shared by both servers: accept loop, bounded admission,
//! one task per connection, total-timeout enforcement, and cooperative
//! shutdown with a grace period. Sessions share nothing writable; the only
//! cross-session state here is the admission gate and its counters.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::SessionLimits;

/// Observable admission counters.
#[derive(Default)]
pub struct ServerCounters {
    active: AtomicUsize,
    served: AtomicU64,
    rejected: AtomicU64,
}

impl ServerCounters {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }
}

/// Decrements the active count when a session task finishes, however it
/// finishes.
struct SessionGuard {
    counters: Arc<ServerCounters>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Running listener. Dropping the handle does not stop the server; call
/// `stop()` for an orderly shutdown.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    counters: Arc<ServerCounters>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn counters(&self) -> &Arc<ServerCounters> {
        &self.counters
    }

    /// Stop accepting, let active sessions drain within the grace period,
    /// then force-close the stragglers.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.accept_task.await;
    }
}

/// Start serving on `listener`. Each accepted connection runs `handler` in
/// its own task; when the gate is full the connection is refused with
/// `busy_reply` before any handshake. `handler` receives a shutdown watch
/// it should poll at response boundaries.
pub fn serve<H, Fut>(
    listener: TcpListener,
    limits: SessionLimits,
    busy_reply: &'static [u8],
    handler: H,
) -> std::io::Result<ServerHandle>
where
    H: Fn(TcpStream, SocketAddr, watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let counters = Arc::new(ServerCounters::default());
    let accept_counters = Arc::clone(&counters);
    let handler = Arc::new(handler);

    let accept_task = tokio::spawn(async move {
        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut shutdown = shutdown_rx.clone();
        info!(%local_addr, "listener started");
        loop {
            // Reap whatever finished since the last turn.
            while sessions.try_join_next().is_some() {}
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if accept_counters.active() >= limits.max_connections {
                        accept_counters.rejected.fetch_add(1, Ordering::SeqCst);
                        debug!(%peer, "connection refused, gate full");
                        let mut stream = stream;
                        let _ = tokio::time::timeout(
                            Duration::from_secs(5),
                            async {
                                let _ = stream.write_all(busy_reply).await;
                                let _ = stream.shutdown().await;
                            },
                        )
                        .await;
                        continue;
                    }
                    accept_counters.active.fetch_add(1, Ordering::SeqCst);
                    accept_counters.served.fetch_add(1, Ordering::SeqCst);
                    let guard = SessionGuard {
                        counters: Arc::clone(&accept_counters),
                    };
                    let handler = Arc::clone(&handler);
                    let session_shutdown = shutdown_rx.clone();
                    let total_timeout = limits.total_timeout();
                    sessions.spawn(async move {
                        let _guard = guard;
                        if tokio::time::timeout(
                            total_timeout,
                            handler(stream, peer, session_shutdown),
                        )
                        .await
                        .is_err()
                        {
                            debug!(%peer, "session hit total timeout");
                        }
                    });
                }
            }
        }
        // Stopped accepting; drain active sessions within the grace period.
        drop(listener);
        let drained = tokio::time::timeout(limits.grace_period(), async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("grace period expired, aborting remaining sessions");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
        info!(%local_addr, "listener stopped");
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        accept_task,
        counters,
    })
}
