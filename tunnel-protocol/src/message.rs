//! Wire message taxonomy exchanged between Agent and Gateway.
//!
//! Every variant here is one row of the message-type table: the codec
//! (see [`crate::codec`]) encodes this enum directly, so the variant
//! order is part of the wire format and must not be reshuffled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A snapshot of one port mapping as carried inside `ConfigSync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: Uuid,
    pub external_domain: String,
    pub internal_host: String,
    pub internal_port: u16,
    pub internal_use_tls: bool,
    pub allow_self_signed: bool,
    pub enabled: bool,
    pub description: String,
}

impl PortMapping {
    /// Identity the edge proxy registers this mapping's route under.
    pub fn route_id(&self) -> String {
        format!("octoporty-{}", self.id.simple())
    }
}

/// Severity of a [`Message::GatewayLog`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Outcome of an `UpdateRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStatus {
    Queued,
    AlreadyQueued,
    Rejected,
}

/// One historical log entry as returned by `GetLogsResponse`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntryWire {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A single logical tunnel message. Wire type codes map onto these
/// variants in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// 1: Agent -> Gateway
    Auth { api_key: String, agent_version: String },
    /// 2: Gateway -> Agent
    AuthResult {
        success: bool,
        error: Option<String>,
        gateway_version: String,
        landing_page_hash: Option<String>,
    },
    /// 3: Agent -> Gateway
    ConfigSync {
        mappings: Vec<PortMapping>,
        config_hash: String,
        landing_page_html: Option<String>,
        landing_page_hash: Option<String>,
    },
    /// 4: Gateway -> Agent
    ConfigAck {
        success: bool,
        error: Option<String>,
        config_hash: String,
    },
    /// 5: Agent -> Gateway
    Heartbeat { timestamp_ms: u64 },
    /// 6: Gateway -> Agent
    HeartbeatAck {
        echoed_timestamp_ms: u64,
        server_timestamp_ms: u64,
        gateway_uptime_secs: u64,
    },
    /// 7: Gateway -> Agent
    Request {
        request_id: String,
        mapping_id: Uuid,
        method: String,
        path_and_query: String,
        headers: Vec<(String, Vec<String>)>,
        initial_body: Option<Vec<u8>>,
        has_more_body: bool,
    },
    /// 8: Agent -> Gateway
    Response {
        request_id: String,
        status: u16,
        headers: Vec<(String, Vec<String>)>,
        initial_body: Option<Vec<u8>>,
        has_more_body: bool,
    },
    /// 9: Gateway -> Agent
    RequestBodyChunk {
        request_id: String,
        bytes: Vec<u8>,
        is_final: bool,
    },
    /// 10: Agent -> Gateway
    ResponseBodyChunk {
        request_id: String,
        bytes: Vec<u8>,
        is_final: bool,
    },
    /// 11: either direction
    Disconnect { reason: String },
    /// 12: Agent -> Gateway
    UpdateRequest { target_version: String, requested_by: String },
    /// 13: Gateway -> Agent
    UpdateResponse {
        accepted: bool,
        error: Option<String>,
        current_version: String,
        status: UpdateStatus,
    },
    /// 14: Gateway -> Agent
    GatewayLog {
        timestamp: DateTime<Utc>,
        level: LogLevel,
        message: String,
    },
    /// 15: Agent -> Gateway
    GetLogsRequest {
        request_id: String,
        before_id: u64,
        count: usize,
    },
    /// 16: Gateway -> Agent
    GetLogsResponse {
        request_id: String,
        entries: Vec<LogEntryWire>,
        has_more: bool,
    },
    /// 255: either direction
    Error { code: u32, message: String },
}

impl Message {
    /// Short name used in log lines; avoids `{:?}` dumping full payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "Auth",
            Message::AuthResult { .. } => "AuthResult",
            Message::ConfigSync { .. } => "ConfigSync",
            Message::ConfigAck { .. } => "ConfigAck",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatAck { .. } => "HeartbeatAck",
            Message::Request { .. } => "Request",
            Message::Response { .. } => "Response",
            Message::RequestBodyChunk { .. } => "RequestBodyChunk",
            Message::ResponseBodyChunk { .. } => "ResponseBodyChunk",
            Message::Disconnect { .. } => "Disconnect",
            Message::UpdateRequest { .. } => "UpdateRequest",
            Message::UpdateResponse { .. } => "UpdateResponse",
            Message::GatewayLog { .. } => "GatewayLog",
            Message::GetLogsRequest { .. } => "GetLogsRequest",
            Message::GetLogsResponse { .. } => "GetLogsResponse",
            Message::Error { .. } => "Error",
        }
    }

    /// The request id this message correlates to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Message::Request { request_id, .. }
            | Message::Response { request_id, .. }
            | Message::RequestBodyChunk { request_id, .. }
            | Message::ResponseBodyChunk { request_id, .. }
            | Message::GetLogsRequest { request_id, .. }
            | Message::GetLogsResponse { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}
