use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{Collection, Document, Filter, Store};

/// Capacity of the change-notification channel each store owns.
pub(crate) const CHANGE_FEED_CAPACITY: usize = 64;

/// Cancelable live feed of full snapshots for one collection.
///
/// Each item replaces the previous one. Dropping the subscription or calling
/// [`Subscription::detach`] stops deliveries.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<Document>>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop listening. No delivery happens after this returns.
    pub fn detach(mut self) {
        self.rx.close();
        self.task.abort();
    }

    /// Next full snapshot, or `None` once the feed has ended.
    pub async fn next_snapshot(&mut self) -> Option<Vec<Document>> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Vec<Document>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start the background listener behind [`Store::subscribe`].
///
/// `changes` must be obtained before this call so no write between the
/// initial query and the first wait is missed. Needs a running tokio runtime.
pub(crate) fn spawn_feed<S>(
    store: S,
    collection: Collection,
    filter: Filter,
    mut changes: broadcast::Receiver<Collection>,
) -> Subscription
where
    S: Store + Clone + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(async move {
        debug!(%collection, "subscription started");
        loop {
            match store.query(collection, &filter).await {
                Ok(docs) => {
                    if tx.send(docs).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(%collection, error = %err, "snapshot query failed"),
            }

            loop {
                match changes.recv().await {
                    Ok(changed) if changed == collection => break,
                    Ok(_) => continue,
                    // Missed notifications only mean the next snapshot is fresher.
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(%collection, "store closed, subscription ended");
                        return;
                    }
                }
            }
        }
        debug!(%collection, "subscription detached");
    });
    Subscription { rx, task }
}
