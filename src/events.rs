//! In-process fan-out of domain events and the per-connection event stream.
//!
//! The hub is a relay only: a subscriber sees events published while it is
//! connected, nothing is buffered for reconnects and a receiver that falls
//! behind skips ahead.

use std::{collections::HashMap, time::Duration};

use futures::{stream, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{DomainEvent, EventKind, Role};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    StaffNotifications,
    ClientNotifications,
    Comments,
}

impl Channel {
    pub const ALL: [Channel; 3] = [
        Channel::StaffNotifications,
        Channel::ClientNotifications,
        Channel::Comments,
    ];

    pub fn allowed_roles(self) -> &'static [Role] {
        match self {
            Channel::StaffNotifications => Role::STAFF,
            Channel::ClientNotifications => Role::CLIENT,
            Channel::Comments => Role::ALL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::StaffNotifications => "notifications",
            Channel::ClientNotifications => "client-notifications",
            Channel::Comments => "comments",
        }
    }

    /// Route the channel is served on.
    pub fn path(self) -> &'static str {
        match self {
            Channel::StaffNotifications => "/api/notifications/stream",
            Channel::ClientNotifications => "/api/client/notifications/stream",
            Channel::Comments => "/api/comments/stream",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Channel::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Channels a domain event is delivered on.
    pub fn for_event(kind: EventKind) -> &'static [Channel] {
        match kind {
            EventKind::Connected | EventKind::Ping => &[],
            EventKind::CommentAdded => &[Channel::Comments],
            _ => &[Channel::StaffNotifications, Channel::ClientNotifications],
        }
    }
}

pub struct EventHub {
    senders: HashMap<Channel, broadcast::Sender<DomainEvent>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let senders = Channel::ALL
            .into_iter()
            .map(|channel| (channel, broadcast::channel(capacity).0))
            .collect();
        Self { senders }
    }

    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<DomainEvent> {
        self.senders[&channel].subscribe()
    }

    /// Returns how many live receivers got the event.
    pub fn publish_to(&self, channel: Channel, event: DomainEvent) -> usize {
        self.senders[&channel].send(event).unwrap_or(0)
    }

    pub fn publish(&self, event: DomainEvent) -> usize {
        let channels = Channel::for_event(event.kind);
        debug!(kind = ?event.kind, channels = channels.len(), "publishing event");
        channels
            .iter()
            .map(|channel| self.publish_to(*channel, event.clone()))
            .sum()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// Which pass-through events a connection may see.
#[derive(Debug, Clone)]
pub enum Audience {
    Everyone,
    /// Events addressed to this user id, plus explicit broadcasts.
    Recipient(String),
}

impl Audience {
    pub fn for_caller(role: Role, user_id: &str) -> Self {
        if role.is_staff() {
            Audience::Everyone
        } else {
            Audience::Recipient(user_id.to_string())
        }
    }

    pub fn admits(&self, event: &DomainEvent) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::Recipient(me) => {
                event.broadcast || event.recipient_id.as_deref() == Some(me.as_str())
            }
        }
    }
}

struct ConnectionGuard {
    id: Uuid,
    channel: Channel,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        info!(connection = %self.id, channel = self.channel.name(), "event stream closed");
    }
}

struct StreamState {
    greeted: bool,
    ticker: Interval,
    rx: broadcast::Receiver<DomainEvent>,
    audience: Audience,
    _guard: ConnectionGuard,
}

enum Next {
    Tick,
    Event(DomainEvent),
    Skip,
    Closed,
}

/// One `connected` event, then a `ping` every `period` interleaved with
/// pass-through events, until the stream is dropped or the hub goes away.
pub fn event_stream(
    channel: Channel,
    rx: broadcast::Receiver<DomainEvent>,
    period: Duration,
    audience: Audience,
) -> impl Stream<Item = DomainEvent> + Send + 'static {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let id = Uuid::new_v4();
    info!(connection = %id, channel = channel.name(), "event stream opened");

    let state = StreamState {
        greeted: false,
        ticker,
        rx,
        audience,
        _guard: ConnectionGuard { id, channel },
    };

    stream::unfold(state, |mut state| async move {
        if !state.greeted {
            state.greeted = true;
            return Some((DomainEvent::connected(), state));
        }

        loop {
            let next = tokio::select! {
                _ = state.ticker.tick() => Next::Tick,
                received = state.rx.recv() => match received {
                    Ok(event) if !event.kind.is_heartbeat() && state.audience.admits(&event) => {
                        Next::Event(event)
                    }
                    Ok(_) => Next::Skip,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection = %state._guard.id, skipped, "subscriber lagged, events dropped");
                        Next::Skip
                    }
                    Err(RecvError::Closed) => Next::Closed,
                },
            };

            match next {
                Next::Tick => return Some((DomainEvent::ping(), state)),
                Next::Event(event) => return Some((event, state)),
                Next::Skip => continue,
                Next::Closed => return None,
            }
        }
    })
}
