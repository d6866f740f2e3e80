//! Deferred unsubscribe worker
//!
//! A subscription removed from inside its own dispatch cannot tear its links
//! down inline. The teardown is queued here and run by one cleanup task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::registry::Teardown;
use crate::transport::ConsumerTransport;

/// Handle to the cleanup task
pub(crate) struct DeferredUnsubscriber {
    tx: mpsc::UnboundedSender<Teardown>,
}

impl DeferredUnsubscriber {
    pub fn spawn(transport: Arc<dyn ConsumerTransport>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Teardown>();
        let task = tokio::spawn(async move {
            while let Some(teardown) = rx.recv().await {
                run_teardown(transport.as_ref(), teardown).await;
            }
            tracing::debug!("Deferred unsubscribe worker stopped");
        });
        (Self { tx }, task)
    }

    pub fn schedule(&self, teardown: Teardown) {
        if self.tx.send(teardown).is_err() {
            tracing::warn!("Deferred unsubscribe worker gone, links left open");
        }
    }
}

/// Drop the links named by `teardown`
pub(crate) async fn run_teardown(transport: &dyn ConsumerTransport, teardown: Teardown) {
    for (event, endpoint) in &teardown.events {
        transport.disconnect_event(event, endpoint).await;
        tracing::debug!(event = %event, "Event disconnected");
    }
    if let Some((channel, endpoint)) = &teardown.channel {
        transport.disconnect_channel(channel, endpoint).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::transport::TransportKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConsumerTransport for Recorder {
        fn kind(&self) -> TransportKind {
            TransportKind::Notif
        }

        async fn connect_channel(&self, _channel: &str, _hb: &str) -> Result<()> {
            Ok(())
        }

        async fn disconnect_channel(&self, channel: &str, _hb: &str) {
            self.calls.lock().unwrap().push(format!("channel {}", channel));
        }

        async fn connect_event(&self, _name: &str, _ep: &str) -> Result<()> {
            Ok(())
        }

        async fn disconnect_event(&self, name: &str, _ep: &str) {
            self.calls.lock().unwrap().push(format!("event {}", name));
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_scheduled_teardown_runs() {
        let recorder = Arc::new(Recorder::default());
        let (deferred, task) = DeferredUnsubscriber::spawn(recorder.clone());

        deferred.schedule(Teardown {
            events: vec![("a.change".into(), "ev".into())],
            channel: Some(("ch".into(), "hb".into())),
        });
        drop(deferred);
        task.await.unwrap();

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["event a.change".to_string(), "channel ch".to_string()]
        );
    }
}
