//! Table triggers — coalescing wakeup signals for store watchers.
//!
//! A trigger is a signal, not a queue: it tells a component that
//! *something* in its tables changed, and the component re-reads the
//! full state. Alerts that arrive while one is already pending are
//! coalesced, so a burst of writes costs one wakeup.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::store::Conn;
use crate::types::TableType;

/// A subscription to one or more tables. Dropping it unsubscribes; the
/// next alert attempt observes the closed channel and removes the
/// sender.
pub struct Trigger {
    rx: mpsc::Receiver<()>,
}

impl Trigger {
    /// Wait for the next alert. Returns `None` once the store side is
    /// gone, which only happens at shutdown.
    pub async fn wait(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Non-blocking check for a pending alert.
    pub fn try_wait(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

impl Conn {
    /// Subscribe to modifications of the given tables. One channel
    /// serves all of them; a transaction touching several subscribed
    /// tables still wakes the subscriber once.
    pub fn trigger(&self, tables: &[TableType]) -> Trigger {
        let (tx, rx) = mpsc::channel(1);
        for &t in tables {
            self.shared.tables[t.index()].lock().triggers.push(tx.clone());
        }
        Trigger { rx }
    }

    /// Like [`Conn::trigger`], but also fires on a wall-clock period so
    /// watchers make progress even when nothing writes.
    pub fn trigger_tick(&self, period: Duration, tables: &[TableType]) -> Trigger {
        let (tx, rx) = mpsc::channel(1);
        for &t in tables {
            self.shared.tables[t.index()].lock().triggers.push(tx.clone());
        }

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                match tx.try_send(()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                    Err(mpsc::error::TrySendError::Closed(())) => break,
                }
            }
        });

        Trigger { rx }
    }
}
