//! Bounded SMTP connection pool
//!
//! One pool per configured server. The semaphore bounds the total number
//! of open connections; idle connections carry their permit into the idle
//! list and are reused until `idle_timeout` passes. Waiting longer than
//! `wait_timeout` for a slot surfaces as a send error to the caller.

use super::client::SmtpConnection;
use super::SmtpError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

struct IdleConnection {
    conn: SmtpConnection,
    permit: OwnedSemaphorePermit,
    since: Instant,
}

/// A leased connection. Return it with [`ConnectionPool::release`] after a
/// clean send; dropping it discards the connection and frees the slot.
pub(crate) struct Lease {
    pub conn: SmtpConnection,
    permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Split the lease so the slot can be kept while the session is
    /// replaced.
    pub fn into_parts(self) -> (SmtpConnection, OwnedSemaphorePermit) {
        (self.conn, self.permit)
    }
}

/// Bounded pool of SMTP sessions to one server
pub(crate) struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    idle_timeout: Duration,
    wait_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(max_conns: usize, idle_timeout: Duration, wait_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_conns.max(1))),
            idle: Mutex::new(Vec::new()),
            idle_timeout,
            wait_timeout,
        }
    }

    /// Take an idle connection if a fresh one exists, otherwise claim a
    /// slot for the caller to open a new session in. `Ok(Err(permit))`
    /// means "slot granted, no session to reuse".
    pub async fn acquire(&self) -> Result<Result<Lease, OwnedSemaphorePermit>, SmtpError> {
        {
            let mut idle = self.idle.lock().await;
            while let Some(entry) = idle.pop() {
                if entry.since.elapsed() < self.idle_timeout {
                    return Ok(Ok(Lease {
                        conn: entry.conn,
                        permit: entry.permit,
                    }));
                }
                // Stale session: close it and let the permit drop.
                debug!("Discarding idle SMTP connection past idle timeout");
                entry.conn.quit().await;
            }
        }

        let permit = tokio::time::timeout(
            self.wait_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| SmtpError::PoolTimeout)?
        .map_err(|_| SmtpError::PoolClosed)?;

        Ok(Err(permit))
    }

    /// Wrap a freshly opened session in a lease
    pub fn lease(conn: SmtpConnection, permit: OwnedSemaphorePermit) -> Lease {
        Lease { conn, permit }
    }

    /// Return a healthy session to the idle list
    pub async fn release(&self, lease: Lease) {
        let mut idle = self.idle.lock().await;
        idle.push(IdleConnection {
            conn: lease.conn,
            permit: lease.permit,
            since: Instant::now(),
        });
    }

    /// Quit every idle session; in-use leases close when dropped
    pub async fn close(&self) {
        let mut idle = self.idle.lock().await;
        for entry in idle.drain(..) {
            entry.conn.quit().await;
        }
        self.semaphore.close();
    }
}
