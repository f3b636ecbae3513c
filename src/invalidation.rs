//! Query keys used across the gateway and the mapping from domain events
//! to the keys they make stale.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{QueryCache, QueryKey};
use crate::events::{Channel, EventHub};
use crate::models::{DomainEvent, EventKind};

pub mod keys {
    use crate::cache::QueryKey;

    pub fn applications() -> QueryKey {
        QueryKey::new(["applications"])
    }

    pub fn applications_page(query: &str) -> QueryKey {
        QueryKey::new(["applications", query])
    }

    pub fn application(id: &str) -> QueryKey {
        QueryKey::new(["application", id])
    }

    pub fn documents(application_id: &str) -> QueryKey {
        QueryKey::new(["documents", application_id])
    }

    pub fn comments(document_id: &str) -> QueryKey {
        QueryKey::new(["comments", document_id])
    }

    pub fn all_comments() -> QueryKey {
        QueryKey::new(["comments"])
    }

    pub fn checklist(application_id: &str) -> QueryKey {
        QueryKey::new(["checklist", application_id])
    }

    pub fn notifications() -> QueryKey {
        QueryKey::new(["notifications"])
    }

    pub fn notifications_for(user_id: &str) -> QueryKey {
        QueryKey::new(["notifications", user_id])
    }

    pub fn dashboard() -> QueryKey {
        QueryKey::new(["dashboard"])
    }

    pub fn deadline_stats(kind: &str) -> QueryKey {
        QueryKey::new(["dashboard", "deadline-stats", kind])
    }

    pub fn quality_check() -> QueryKey {
        QueryKey::new(["quality-check"])
    }

    pub fn quality_check_page(query: &str) -> QueryKey {
        QueryKey::new(["quality-check", query])
    }
}

pub fn keys_for_event(event: &DomainEvent) -> Vec<QueryKey> {
    let app = event.application_id.as_deref();
    let doc = event.document_id.as_deref();

    let mut out = Vec::new();
    match event.kind {
        EventKind::Connected | EventKind::Ping => {}
        EventKind::NotificationCreated
        | EventKind::NotificationUpdated
        | EventKind::NotificationDeleted => {
            out.push(match &event.recipient_id {
                Some(user) => keys::notifications_for(user),
                None => keys::notifications(),
            });
        }
        EventKind::CommentAdded => {
            out.push(doc.map_or_else(keys::all_comments, keys::comments));
            out.extend(app.map(keys::documents));
        }
        EventKind::DocumentUploaded
        | EventKind::DocumentStatusChanged
        | EventKind::DocumentDeleted => {
            match app {
                Some(app) => {
                    out.push(keys::documents(app));
                    out.push(keys::application(app));
                }
                None => out.push(QueryKey::new(["documents"])),
            }
            out.push(keys::quality_check());
            out.push(keys::dashboard());
        }
        EventKind::ChecklistRequested => {
            if let Some(app) = app {
                out.push(keys::application(app));
                out.push(keys::checklist(app));
            }
            out.push(keys::applications());
        }
        EventKind::ApplicationUpdated => {
            if let Some(app) = app {
                out.push(keys::application(app));
            }
            out.push(keys::applications());
            out.push(keys::dashboard());
        }
    }
    out
}

/// Feeds every hub channel into cache invalidation.
pub fn spawn_bridge(hub: Arc<EventHub>, cache: QueryCache) -> Vec<JoinHandle<()>> {
    Channel::ALL
        .into_iter()
        .map(|channel| {
            let mut rx = hub.subscribe(channel);
            let cache = cache.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let keys = keys_for_event(&event);
                            let touched = cache.invalidate_all(&keys).await;
                            debug!(channel = channel.name(), kind = ?event.kind, touched, "event invalidated cache");
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            // Missed events could have touched anything.
                            warn!(channel = channel.name(), skipped, "invalidation bridge lagged");
                            cache.invalidate(&QueryKey::new(Vec::<String>::new())).await;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        })
        .collect()
}
