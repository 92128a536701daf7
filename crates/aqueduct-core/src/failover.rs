//! Rate-limited execution of session migrations.
//!
//! One dead node can take dozens of sessions with it; re-joining them all
//! at once would hammer the surviving nodes. The scheduler runs the first
//! migration of an idle queue immediately, then at most `limit` per `rate`
//! window, oldest first, never reordered. The cap is global across all
//! sessions regardless of which node failed.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;

type Migration = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct FailoverScheduler {
    tx: mpsc::UnboundedSender<Migration>,
}

impl FailoverScheduler {
    pub fn new(limit: usize, rate: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(rx, limit.max(1), rate));
        Self { tx }
    }

    /// Enqueue a migration. Runs immediately when the queue is idle,
    /// otherwise waits its turn behind earlier entries.
    pub fn queue<F>(&self, migration: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tx.send(Box::pin(migration));
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<Migration>, limit: usize, rate: Duration) {
    while let Some(first) = rx.recv().await {
        first.await;
        loop {
            tokio::time::sleep(rate).await;
            let mut executed = 0;
            while executed < limit {
                match rx.try_recv() {
                    Ok(migration) => {
                        migration.await;
                        executed += 1;
                    }
                    Err(_) => break,
                }
            }
            if executed == 0 {
                break;
            }
        }
    }
}
