//! Pulls the backend's own event stream and republishes it into the hub.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::BackendClient;
use crate::events::EventHub;
use crate::models::DomainEvent;
use crate::sse::SseDecoder;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Publishes one decoded `data` payload. Heartbeats and anything that is not
/// a domain event are dropped. Returns the number of receivers reached.
pub fn relay_payload(hub: &EventHub, payload: &str) -> usize {
    match serde_json::from_str::<DomainEvent>(payload) {
        Ok(event) if event.kind.is_heartbeat() => 0,
        Ok(event) => hub.publish(event),
        Err(err) => {
            debug!(error = %err, "ignoring unrecognised upstream event");
            0
        }
    }
}

pub fn spawn_upstream_relay(
    backend: BackendClient,
    path: String,
    token: Option<String>,
    hub: Arc<EventHub>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match backend.open_stream(&path, token.as_deref()).await {
                Ok(response) => {
                    info!(url = %backend.url(&path), "upstream event stream connected");
                    let mut decoder = SseDecoder::new();
                    let mut body = response.bytes_stream();
                    while let Some(chunk) = body.next().await {
                        match chunk {
                            Ok(bytes) => {
                                for payload in decoder.push(&bytes) {
                                    relay_payload(&hub, &payload);
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "upstream event stream failed");
                                break;
                            }
                        }
                    }
                    info!("upstream event stream ended");
                }
                Err(err) => warn!(error = %err, "could not open upstream event stream"),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}
