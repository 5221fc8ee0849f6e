//! Abandoned-connection reaper.
//!
//! One pool-wide timer service, started at pool construction and shut down
//! at pool teardown. Every logical checkout arms exactly one ticket; a
//! normal checkin cancels it. A ticket that fires forces the connection
//! closed through [`PooledConnection::reap`], whose stale-ticket check
//! makes the loser of a cancel/fire race a no-op.
//!
//! The service is bounded: a single driver task multiplexes every pending
//! ticket over a timer wheel, and the task dies with the pool rather than
//! blocking process shutdown.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::delay_queue::{DelayQueue, Key};

use crate::conn::PooledConnection;

enum Command {
    Arm {
        ticket: u64,
        timeout: Duration,
        conn: Weak<PooledConnection>,
        opened_by: Arc<Backtrace>,
    },
    Cancel {
        ticket: u64,
    },
}

struct Armed {
    ticket: u64,
    conn: Weak<PooledConnection>,
    opened_by: Arc<Backtrace>,
}

/// Handle to the reaper service, shared by every pooled connection.
pub(crate) struct Reaper {
    tx: mpsc::UnboundedSender<Command>,
    next_ticket: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    /// Start the driver task. Requires a tokio runtime context.
    pub(crate) fn start() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(rx));
        Arc::new(Self {
            tx,
            next_ticket: AtomicU64::new(1),
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Schedule a forced teardown of `conn` after `timeout` unless the
    /// ticket is canceled first. Returns the ticket id.
    pub(crate) fn arm(
        &self,
        conn: Weak<PooledConnection>,
        timeout: Duration,
        opened_by: Arc<Backtrace>,
    ) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        // A send failure means the pool is already shutting down; the
        // teardown the ticket would have forced happens in pool close.
        let _ = self.tx.send(Command::Arm {
            ticket,
            timeout,
            conn,
            opened_by,
        });
        ticket
    }

    /// Cancel a pending ticket. Canceling a ticket that already fired is
    /// harmless.
    pub(crate) fn cancel(&self, ticket: u64) {
        let _ = self.tx.send(Command::Cancel { ticket });
    }

    /// Stop the driver task. Pending tickets are discarded.
    pub(crate) fn shutdown(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

async fn drive(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut queue: DelayQueue<Armed> = DelayQueue::new();
    let mut keys: HashMap<u64, Key> = HashMap::new();

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Arm { ticket, timeout, conn, opened_by }) => {
                    let key = queue.insert(
                        Armed { ticket, conn, opened_by },
                        timeout,
                    );
                    keys.insert(ticket, key);
                }
                Some(Command::Cancel { ticket }) => {
                    if let Some(key) = keys.remove(&ticket) {
                        queue.remove(&key);
                    }
                }
                None => break,
            },
            Some(expired) = poll_fn(|cx| queue.poll_expired(cx)), if !keys.is_empty() => {
                let armed = expired.into_inner();
                keys.remove(&armed.ticket);
                if let Some(conn) = armed.conn.upgrade() {
                    conn.reap(armed.ticket, &armed.opened_by).await;
                }
            }
        }
    }
}
