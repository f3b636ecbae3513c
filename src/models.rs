use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Portal roles as issued by the backend.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Admin,
    TeamLeader,
    MasterAdmin,
    Supervisor,
}

impl Role {
    pub const ALL: &'static [Role] = &[
        Role::Client,
        Role::Admin,
        Role::TeamLeader,
        Role::MasterAdmin,
        Role::Supervisor,
    ];

    pub const STAFF: &'static [Role] = &[
        Role::Admin,
        Role::TeamLeader,
        Role::MasterAdmin,
        Role::Supervisor,
    ];

    pub const CLIENT: &'static [Role] = &[Role::Client];

    pub fn is_staff(self) -> bool {
        self != Role::Client
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Admin => "admin",
            Role::TeamLeader => "team_leader",
            Role::MasterAdmin => "master_admin",
            Role::Supervisor => "supervisor",
        }
    }
}

/// JWT payload carried by every portal token.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TokenClaims {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub role: Role,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// An authenticated caller: decoded claims plus the raw bearer string,
/// which is forwarded to the backend unchanged.
#[derive(Debug, Clone)]
pub struct Session {
    pub claims: TokenClaims,
    pub token: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationKind {
    #[default]
    Main,
    Spouse,
}

impl ApplicationKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "main" => Some(Self::Main),
            "spouse" => Some(Self::Spouse),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Spouse => "spouse",
        }
    }
}

/// Immigration case record. Unknown backend fields survive the round trip.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Application {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub kind: ApplicationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checklist_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checklist_requested_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl DocumentStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Document {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(default)]
    pub status: DocumentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_message: Option<String>,
    #[serde(default)]
    pub comments: Vec<Value>,
    #[serde(default)]
    pub reviews: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Notification {
    pub id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChecklistRequest {
    pub application_id: String,
    pub requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
}

/// Response envelope shared with the backend: `{status, data, message}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    pub fn success(data: Value) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            message: None,
        }
    }

    pub fn success_message(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Ping,
    NotificationCreated,
    NotificationUpdated,
    NotificationDeleted,
    CommentAdded,
    DocumentUploaded,
    DocumentStatusChanged,
    DocumentDeleted,
    ChecklistRequested,
    ApplicationUpdated,
}

impl EventKind {
    pub fn is_heartbeat(self) -> bool {
        matches!(self, EventKind::Connected | EventKind::Ping)
    }
}

/// Payload of one SSE frame: `{type, timestamp, ...}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
    /// Client the event belongs to. Staff see every event; a client only
    /// sees its own and those marked `broadcast`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub broadcast: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl DomainEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            application_id: None,
            document_id: None,
            notification_id: None,
            recipient_id: None,
            broadcast: false,
            payload: Value::Null,
        }
    }

    pub fn connected() -> Self {
        Self::new(EventKind::Connected)
    }

    pub fn ping() -> Self {
        Self::new(EventKind::Ping)
    }

    pub fn with_application(mut self, id: impl Into<String>) -> Self {
        self.application_id = Some(id.into());
        self
    }

    pub fn with_document(mut self, id: impl Into<String>) -> Self {
        self.document_id = Some(id.into());
        self
    }

    pub fn with_notification(mut self, id: impl Into<String>) -> Self {
        self.notification_id = Some(id.into());
        self
    }

    pub fn with_recipient(mut self, id: impl Into<String>) -> Self {
        self.recipient_id = Some(id.into());
        self
    }

    /// Addresses the event to `owner` when known; otherwise staff only.
    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.recipient_id = owner;
        self
    }

    pub fn as_broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}
