//! Change notification for tables.
//!
//! Every table carries a version counter that transactions bump on commit.
//! A trigger forwards version changes (and an optional periodic floor) into
//! a bounded channel of capacity one, so any burst of writes between two
//! reads coalesces into a single fire.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::store::Shared;
use crate::types::Table;

/// A wake-up channel tied to a set of tables.
///
/// Fires once on creation so the owner runs an initial pass, then whenever a
/// watched table is written, and (for `trigger_tick`) at least once per
/// floor interval. Reading `None` from `c` means the trigger was stopped or
/// the store went away.
pub struct Trigger {
    /// The fire channel. Intermediate fires coalesce when the consumer is
    /// slow.
    pub c: mpsc::Receiver<()>,
    stop: watch::Sender<bool>,
}

impl Trigger {
    /// Stop the trigger; the forwarding task exits and `c` drains to `None`.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

pub(crate) fn spawn_trigger(
    shared: &std::sync::Arc<Shared>,
    floor: Option<Duration>,
    tables: &[Table],
) -> Trigger {
    let (tx, rx) = mpsc::channel(1);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut watches: Vec<watch::Receiver<u64>> =
        tables.iter().map(|t| shared.subscribe(*t)).collect();
    for w in &mut watches {
        w.borrow_and_update();
    }

    tokio::spawn(async move {
        let _ = tx.try_send(());
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                alive = any_changed(&mut watches) => {
                    if !alive {
                        return;
                    }
                }
                _ = sleep_floor(floor) => {}
            }
            if tx.try_send(()).is_err() && tx.is_closed() {
                return;
            }
        }
    });

    Trigger { c: rx, stop: stop_tx }
}

/// Resolves when any watched table's version changes. Returns false when the
/// store has been dropped.
async fn any_changed(watches: &mut [watch::Receiver<u64>]) -> bool {
    if watches.is_empty() {
        futures::future::pending::<()>().await;
        unreachable!();
    }
    let futures = watches.iter_mut().map(|w| Box::pin(w.changed()));
    let (result, _, _) = futures::future::select_all(futures).await;
    result.is_ok()
}

async fn sleep_floor(floor: Option<Duration>) {
    match floor {
        Some(d) => tokio::time::sleep(d).await,
        None => futures::future::pending().await,
    }
}

/// Debounced consumption of a trigger, with pass timing hooks supplied by
/// the caller. Consecutive fires are separated by at least `min_interval`.
pub struct Ticker {
    trigger: Trigger,
    min_interval: Duration,
    last_fire: Option<Instant>,
}

impl Ticker {
    pub fn new(trigger: Trigger, min_interval: Duration) -> Ticker {
        Ticker {
            trigger,
            min_interval,
            last_fire: None,
        }
    }

    /// Wait for the next fire. Returns false once the trigger is stopped.
    pub async fn tick(&mut self) -> bool {
        if self.trigger.c.recv().await.is_none() {
            return false;
        }
        if let Some(last) = self.last_fire {
            let since = last.elapsed();
            if since < self.min_interval {
                tokio::time::sleep(self.min_interval - since).await;
            }
        }
        self.last_fire = Some(Instant::now());
        true
    }

    /// Stop the underlying trigger.
    pub fn stop(&self) {
        self.trigger.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::Conn;
    use crate::types::Machine;

    async fn write_machine(conn: &Conn) {
        conn.txn(&[Table::Machine])
            .run(|view| {
                view.insert::<Machine>();
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn fires_once_on_creation() {
        let conn = Conn::new();
        let mut t = conn.trigger(&[Table::Machine]);
        assert!(t.c.recv().await.is_some());
    }

    #[tokio::test]
    async fn fires_on_table_write() {
        let conn = Conn::new();
        let mut t = conn.trigger(&[Table::Machine]);
        t.c.recv().await;

        write_machine(&conn).await;
        let fired = tokio::time::timeout(Duration::from_secs(2), t.c.recv()).await;
        assert!(fired.unwrap().is_some());
    }

    #[tokio::test]
    async fn unwatched_tables_do_not_fire() {
        let conn = Conn::new();
        let mut t = conn.trigger(&[Table::Container]);
        t.c.recv().await;

        write_machine(&conn).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(t.c.try_recv().is_err());
    }

    #[tokio::test]
    async fn burst_of_writes_coalesces_to_one_fire() {
        let conn = Conn::new();
        let mut t = conn.trigger(&[Table::Machine]);
        t.c.recv().await;

        for _ in 0..10 {
            write_machine(&conn).await;
        }
        // Let the forwarding task observe everything before reading.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(t.c.recv().await.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(t.c.try_recv().is_err());
    }

    #[tokio::test]
    async fn periodic_floor_fires_without_writes() {
        let conn = Conn::new();
        let mut t = conn.trigger_tick(1, &[Table::Machine]);
        t.c.recv().await;

        let fired = tokio::time::timeout(Duration::from_secs(3), t.c.recv()).await;
        assert!(fired.unwrap().is_some());
    }

    #[tokio::test]
    async fn stop_drains_to_none() {
        let conn = Conn::new();
        let mut t = conn.trigger(&[Table::Machine]);
        t.stop();
        // Drain the initial fire if it won the race, then observe the close.
        let deadline = tokio::time::timeout(Duration::from_secs(2), async {
            while t.c.recv().await.is_some() {}
        })
        .await;
        assert!(deadline.is_ok());
    }

    #[tokio::test]
    async fn ticker_enforces_min_interval() {
        let conn = Conn::new();
        let trigger = conn.trigger(&[Table::Machine]);
        let mut ticker = Ticker::new(trigger, Duration::from_millis(200));

        let start = Instant::now();
        assert!(ticker.tick().await);
        write_machine(&conn).await;
        assert!(ticker.tick().await);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
