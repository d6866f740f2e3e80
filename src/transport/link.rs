//! Consumer-side links
//!
//! One link per remote endpoint. A link owns a forwarding task that reads
//! messages from the endpoint and passes on those whose name frame is in the
//! link's subscription set, so several channels or events sharing one
//! endpoint share one connection.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::Inbound;
use crate::error::Result;
use crate::wire::message::frame_name;

/// Stream of messages read from one endpoint
#[async_trait]
pub(crate) trait FrameSource: Send + 'static {
    /// Next message, or None once the endpoint is gone
    async fn next_frames(&mut self) -> Option<Vec<Bytes>>;
}

type NameSet = Arc<RwLock<HashSet<String>>>;

struct Link {
    names: NameSet,
    task: JoinHandle<()>,
}

/// Links of one consumer transport, keyed by endpoint
pub(crate) struct LinkTable {
    links: Mutex<HashMap<String, Link>>,
    inbound: Inbound,
}

impl LinkTable {
    pub(crate) fn new(inbound: Inbound) -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            inbound,
        }
    }

    /// Add `name` to the link for `endpoint`, opening it when missing or dead
    pub(crate) async fn attach<F, Fut, S>(&self, endpoint: &str, name: &str, open: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
        S: FrameSource,
    {
        let mut links = self.links.lock().await;

        if let Some(link) = links.get(endpoint) {
            if !link.task.is_finished() {
                write_names(&link.names).insert(name.to_string());
                return Ok(());
            }
        }

        let source = open().await?;

        let names = match links.remove(endpoint) {
            Some(dead) => {
                tracing::debug!(endpoint = %endpoint, "Reopening closed link");
                dead.names
            }
            None => Arc::new(RwLock::new(HashSet::new())),
        };
        write_names(&names).insert(name.to_string());

        let task = tokio::spawn(forward(
            endpoint.to_string(),
            source,
            Arc::clone(&names),
            self.inbound.clone(),
        ));
        links.insert(endpoint.to_string(), Link { names, task });

        tracing::debug!(endpoint = %endpoint, name = %name, "Link opened");
        Ok(())
    }

    /// Remove `name`; the link closes when its set empties
    pub(crate) async fn detach(&self, endpoint: &str, name: &str) {
        let mut links = self.links.lock().await;
        let empty = match links.get(endpoint) {
            Some(link) => {
                let mut names = write_names(&link.names);
                names.remove(name);
                names.is_empty()
            }
            None => return,
        };
        if empty {
            if let Some(link) = links.remove(endpoint) {
                link.task.abort();
                tracing::debug!(endpoint = %endpoint, "Link closed");
            }
        }
    }

    pub(crate) async fn close_all(&self) {
        let mut links = self.links.lock().await;
        for (_, link) in links.drain() {
            link.task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.links.lock().await.len()
    }
}

fn write_names(names: &NameSet) -> std::sync::RwLockWriteGuard<'_, HashSet<String>> {
    names.write().unwrap_or_else(|e| e.into_inner())
}

async fn forward<S: FrameSource>(endpoint: String, mut source: S, names: NameSet, inbound: Inbound) {
    while let Some(frames) = source.next_frames().await {
        let wanted = match frame_name(&frames) {
            Some(name) => names
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(name),
            None => false,
        };
        if !wanted {
            continue;
        }
        if inbound.send(frames).await.is_err() {
            break;
        }
    }
    tracing::debug!(endpoint = %endpoint, "Link ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct ChannelSource(mpsc::UnboundedReceiver<Vec<Bytes>>);

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn next_frames(&mut self) -> Option<Vec<Bytes>> {
            self.0.recv().await
        }
    }

    fn msg(name: &'static str) -> Vec<Bytes> {
        vec![Bytes::from_static(name.as_bytes())]
    }

    #[tokio::test]
    async fn test_forwards_only_attached_names() {
        let (inbound, mut rx) = mpsc::channel(16);
        let table = LinkTable::new(inbound);
        let (tx, source_rx) = mpsc::unbounded_channel();

        table
            .attach("ep", "a", move || async move { Ok(ChannelSource(source_rx)) })
            .await
            .unwrap();

        tx.send(msg("b")).unwrap();
        tx.send(msg("a")).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(frame_name(&got), Some("a"));
    }

    #[tokio::test]
    async fn test_shared_endpoint_opened_once() {
        let (inbound, mut rx) = mpsc::channel(16);
        let table = LinkTable::new(inbound);
        let (tx, source_rx) = mpsc::unbounded_channel();

        table
            .attach("ep", "a", move || async move { Ok(ChannelSource(source_rx)) })
            .await
            .unwrap();
        table
            .attach("ep", "b", || async {
                Err::<ChannelSource, _>(crate::error::Error::CommunicationFailed(
                    "must not reopen".into(),
                ))
            })
            .await
            .unwrap();
        assert_eq!(table.len().await, 1);

        tx.send(msg("b")).unwrap();
        assert_eq!(frame_name(&rx.recv().await.unwrap()), Some("b"));

        table.detach("ep", "a").await;
        assert_eq!(table.len().await, 1);
        table.detach("ep", "b").await;
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn test_dead_link_reopened() {
        let (inbound, mut rx) = mpsc::channel(16);
        let table = LinkTable::new(inbound);

        let (tx, source_rx) = mpsc::unbounded_channel();
        table
            .attach("ep", "a", move || async move { Ok(ChannelSource(source_rx)) })
            .await
            .unwrap();
        drop(tx);
        // let the forwarding task observe the closed source
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (tx2, source_rx2) = mpsc::unbounded_channel();
        table
            .attach("ep", "b", move || async move { Ok(ChannelSource(source_rx2)) })
            .await
            .unwrap();

        // names of the dead link carry over
        tx2.send(msg("a")).unwrap();
        assert_eq!(frame_name(&rx.recv().await.unwrap()), Some("a"));
    }
}
