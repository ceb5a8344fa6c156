//! Channel protocol messages.
//!
//! Frames are JSON objects `{topic, event, payload, ref, join_ref}`. Row
//! changes arrive as `postgres_changes` events whose payload carries a
//! `data` object with the change type, table and row images.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic used for socket-level heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Channel event names.
pub mod events {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const CLOSE: &str = "phx_close";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    pub const SYSTEM: &str = "system";
    pub const ACCESS_TOKEN: &str = "access_token";
}

/// A single frame on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn heartbeat(msg_ref: u64) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: events::HEARTBEAT.to_string(),
            payload: Value::Object(Default::default()),
            msg_ref: Some(msg_ref.to_string()),
            join_ref: None,
        }
    }

    /// Join a channel listening to one row-change filter.
    pub fn join(
        topic: &str,
        filter: &ChangeFilter,
        access_token: Option<&str>,
        msg_ref: u64,
    ) -> Self {
        let mut payload = serde_json::json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [filter],
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }
        Self {
            topic: topic.to_string(),
            event: events::JOIN.to_string(),
            payload,
            msg_ref: Some(msg_ref.to_string()),
            join_ref: Some(msg_ref.to_string()),
        }
    }

    pub fn leave(topic: &str, msg_ref: u64) -> Self {
        Self {
            topic: topic.to_string(),
            event: events::LEAVE.to_string(),
            payload: Value::Object(Default::default()),
            msg_ref: Some(msg_ref.to_string()),
            join_ref: None,
        }
    }

    /// Push a refreshed access token to a joined channel.
    pub fn access_token(topic: &str, token: &str, msg_ref: u64) -> Self {
        Self {
            topic: topic.to_string(),
            event: events::ACCESS_TOKEN.to_string(),
            payload: serde_json::json!({ "access_token": token }),
            msg_ref: Some(msg_ref.to_string()),
            join_ref: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// `Some(true)` for an ok reply, `Some(false)` for an error reply.
    pub fn reply_ok(&self) -> Option<bool> {
        if self.event != events::REPLY {
            return None;
        }
        self.payload
            .get("status")
            .and_then(Value::as_str)
            .map(|status| status == "ok")
    }

    /// Reason carried by an error reply or a system message.
    pub fn reason(&self) -> Option<String> {
        let response = self.payload.get("response").unwrap_or(&self.payload);
        response
            .get("reason")
            .or_else(|| response.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Decode a `postgres_changes` payload.
    pub fn change_event(&self) -> Option<ChangeEvent> {
        if self.event != events::POSTGRES_CHANGES {
            return None;
        }
        let data = self.payload.get("data")?;
        serde_json::from_value(data.clone()).ok()
    }
}

/// Kind of row change a channel listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

/// Which rows a subscription wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub event: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ChangeFilter {
    /// All change kinds on a `public` table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            event: ChangeKind::All,
            schema: "public".to_string(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn kind(mut self, kind: ChangeKind) -> Self {
        self.event = kind;
        self
    }

    /// Restrict to rows where `column` equals `value`.
    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.filter = Some(format!("{column}=eq.{value}"));
        self
    }

    /// Short, stable label used in channel topics and logs.
    pub fn label(&self) -> String {
        match &self.filter {
            Some(filter) => format!("{}:{}", self.table, filter),
            None => self.table.clone(),
        }
    }
}

/// A row-level change delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(rename = "record", default, deserialize_with = "non_empty_row")]
    pub new_row: Option<Value>,
    #[serde(rename = "old_record", default, deserialize_with = "non_empty_row")]
    pub old_row: Option<Value>,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, row: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            new_row: Some(row),
            old_row: None,
            commit_timestamp: None,
        }
    }

    pub fn update(table: impl Into<String>, old: Option<Value>, new: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            new_row: Some(new),
            old_row: old,
            commit_timestamp: None,
        }
    }

    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            new_row: None,
            old_row: Some(old),
            commit_timestamp: None,
        }
    }

    /// Whether this event passes `filter` (table, kind and an `col=eq.val` row filter).
    pub fn matches(&self, filter: &ChangeFilter) -> bool {
        if self.table != filter.table {
            return false;
        }
        if filter.event != ChangeKind::All && filter.event != self.kind {
            return false;
        }
        let Some(expr) = &filter.filter else {
            return true;
        };
        let Some((column, value)) = expr.split_once("=eq.") else {
            return true;
        };
        let row = self.new_row.as_ref().or(self.old_row.as_ref());
        row.and_then(|row| row.get(column))
            .map(|field| match field {
                Value::String(s) => s == value,
                other => other.to_string() == value,
            })
            .unwrap_or(false)
    }
}

/// The server sends `{}` for a missing row image.
fn non_empty_row<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.filter(|v| match v {
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
        _ => true,
    }))
}
