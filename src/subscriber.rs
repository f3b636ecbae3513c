//! Client side of an event stream.
//!
//! [`StreamSubscriber`] holds one connection open and fans decoded events
//! out to any number of receivers. When the connection ends the receivers
//! observe a closed channel; reconnecting is up to the caller.

use futures::StreamExt;
use reqwest::{header, Client};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::models::DomainEvent;
use crate::sse::SseDecoder;

const SUBSCRIBER_CAPACITY: usize = 64;

pub struct StreamSubscriber {
    rx: broadcast::Receiver<DomainEvent>,
    task: JoinHandle<()>,
}

impl StreamSubscriber {
    pub async fn connect(client: &Client, url: &str, token: &str) -> Result<Self, BackendError> {
        let response = client
            .get(url)
            .bearer_auth(token)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: if message.is_empty() {
                    status.to_string()
                } else {
                    message
                },
            });
        }

        let (tx, rx) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let task = tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(error = %err, "event stream read failed");
                        break;
                    }
                };
                for payload in decoder.push(&bytes) {
                    match serde_json::from_str::<DomainEvent>(&payload) {
                        Ok(event) => {
                            // Fails only while nobody is subscribed.
                            tx.send(event).ok();
                        }
                        Err(err) => debug!(error = %err, "skipping undecodable event"),
                    }
                }
            }
        });

        Ok(Self { rx, task })
    }

    /// Next event since the connection opened. `None` once it has ended.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "subscriber lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Another receiver, seeing events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.rx.resubscribe()
    }
}

impl Drop for StreamSubscriber {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_token;
    use crate::models::{EventKind, Role};
    use crate::rest::create_router;
    use crate::rest::tests::{spawn_server, test_state};

    #[tokio::test]
    async fn receives_connected_then_published_events() {
        let state = test_state("http://127.0.0.1:9");
        let hub = state.hub.clone();
        let gateway = spawn_server(create_router(state)).await;
        let token = test_token(Role::Client, 3600);

        let mut subscriber = StreamSubscriber::connect(
            &Client::new(),
            &format!("{gateway}/api/comments/stream"),
            &token,
        )
        .await
        .unwrap();
        let first = subscriber.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Connected);

        hub.publish(
            DomainEvent::new(EventKind::CommentAdded)
                .with_document("doc-4")
                .with_recipient("client-1"),
        );
        let next = subscriber.recv().await.unwrap();
        assert_eq!(next.kind, EventKind::CommentAdded);
        assert_eq!(next.document_id.as_deref(), Some("doc-4"));
    }

    #[tokio::test]
    async fn rejected_connection_surfaces_status() {
        let gateway = spawn_server(create_router(test_state("http://127.0.0.1:9"))).await;
        let token = test_token(Role::Client, -5);

        let err = StreamSubscriber::connect(
            &Client::new(),
            &format!("{gateway}/api/comments/stream"),
            &token,
        )
        .await
        .err()
        .unwrap();
        match err {
            BackendError::Status { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Token expired");
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
