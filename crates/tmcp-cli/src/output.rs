//! Output formatting for CLI results
//!
//! Three output formats are supported:
//! - Table: Human-readable tables (default)
//! - JSON: Structured JSON for scripting and automation
//! - Quiet: Minimal output, exit codes only

use std::str::FromStr;

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use tmcp_core::identity::IdentityInfo;
use tmcp_core::types::{Identity, PeerDocument};

use crate::demo::DemoReport;
use crate::ExitCode;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format for scripting
    Json,
    /// Minimal output - exit codes only
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper for consistent schema
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    /// Whether the operation was successful
    pub success: bool,
    /// The response data (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO 8601 timestamp
    pub timestamp: String,
    /// Command that was executed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
            command: None,
        }
    }

    /// Create a successful response with command context
    pub fn success_with_command(data: T, command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::success(data)
        }
    }
}

/// Formats output for different modes
pub struct OutputFormatter {
    format: OutputFormat,
    verbose: bool,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_quiet(&self) -> bool {
        self.format == OutputFormat::Quiet
    }

    /// Format a published identity
    pub fn format_identity(&self, identity: &Identity, command: &str) -> String {
        match self.format {
            OutputFormat::Table => self.identity_table(identity),
            OutputFormat::Json => self.to_json_response(&IdentityOutput::from(identity), command),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format the identity store listing
    pub fn format_identities(&self, identities: &[IdentityInfo]) -> String {
        match self.format {
            OutputFormat::Table => self.identities_table(identities),
            OutputFormat::Json => {
                self.to_json_response(&IdentitiesOutput::from(identities), "identity list")
            }
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a resolved peer document
    pub fn format_peer(&self, peer: &PeerDocument) -> String {
        match self.format {
            OutputFormat::Table => self.peer_table(peer),
            OutputFormat::Json => self.to_json_response(&PeerOutput::from(peer), "resolve"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a demo run
    pub fn format_demo(&self, report: &DemoReport) -> String {
        match self.format {
            OutputFormat::Table => self.demo_table(report),
            OutputFormat::Json => self.to_json_response(report, "demo"),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Format a generic success result
    pub fn format_success<T: Serialize>(&self, data: &T, command: &str) -> String {
        match self.format {
            OutputFormat::Json => self.to_json_response(data, command),
            OutputFormat::Table | OutputFormat::Quiet => String::new(),
        }
    }

    /// Format error with exit code context
    pub fn format_error_with_code(&self, error: &anyhow::Error, code: ExitCode) -> String {
        match self.format {
            OutputFormat::Table => format!("Error: {error:#}"),
            OutputFormat::Json => self.to_json(&ErrorOutput {
                success: false,
                error: format!("{error:#}"),
                exit_code: code as i32,
                exit_code_name: code.name(),
                timestamp: Utc::now().to_rfc3339(),
            }),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// Progress message (only shown in verbose mode)
    pub fn progress(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            eprintln!("... {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if self.format == OutputFormat::Table {
            println!("✓ {message}");
        }
    }

    pub fn warning(&self, message: &str) {
        if self.format == OutputFormat::Table {
            eprintln!("⚠ {message}");
        }
    }

    /// Info message (only in verbose mode)
    pub fn info(&self, message: &str) {
        if self.verbose && self.format == OutputFormat::Table {
            println!("ℹ {message}");
        }
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    fn to_json_response<T: Serialize>(&self, value: &T, command: &str) -> String {
        self.to_json(&JsonResponse::success_with_command(value, command))
    }

    fn identity_table(&self, identity: &Identity) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Alias", &identity.alias]);
        table.add_row(vec!["DID", &identity.did]);
        table.add_row(vec!["Transport", identity.transport_kind.as_str()]);
        table.add_row(vec!["Endpoint", &identity.endpoint]);
        table.add_row(vec!["Document Version", &identity.document_version.to_string()]);
        table.add_row(vec!["Key", &identity.key.to_string()]);
        table.to_string()
    }

    fn identities_table(&self, identities: &[IdentityInfo]) -> String {
        if identities.is_empty() {
            return "No identities found.".to_string();
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["ID", "Alias", "DID", "Transport", "Version", "Status", "Created"]);

        for info in identities {
            table.add_row(vec![
                info.id.to_string(),
                info.alias.clone(),
                info.did.clone().unwrap_or_else(|| "-".to_string()),
                info.transport_kind.to_string(),
                info.document_version.to_string(),
                status(info).to_string(),
                format_time(&info.created_at),
            ]);
        }

        table.to_string()
    }

    fn peer_table(&self, peer: &PeerDocument) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["DID", &peer.did]);
        table.add_row(vec!["Transport", peer.transport_kind.as_str()]);
        table.add_row(vec!["Endpoint", &peer.endpoint_address]);
        table.add_row(vec!["Document Version", &peer.document_version.to_string()]);
        if let Some(keys) = &peer.document.verification {
            table.add_row(vec!["Signing Key", &keys.sign_pub]);
            table.add_row(vec!["KEX Key", &keys.kex_pub]);
        }
        table.add_row(vec!["Fetched At", &format_time(&peer.fetched_at)]);
        table.to_string()
    }

    fn demo_table(&self, report: &DemoReport) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Transport", report.transport_kind.as_str()]);
        table.add_row(vec!["Server Address", &report.server_address]);
        table.add_row(vec!["Server DID", &report.server_did]);
        table.add_row(vec!["Client DID", &report.client_did]);
        table.add_row(vec!["Session ID", &report.session_id]);
        table.add_row(vec![
            "Round Trips",
            &format!("{}/{}", report.round_trips, report.messages),
        ]);
        table.add_row(vec!["Elapsed", &format!("{} ms", report.elapsed_ms)]);
        table.add_row(vec![
            "Envelopes",
            &format!(
                "sealed {} / opened {} / delivered {} / replayed {}",
                report.sealed, report.opened, report.delivered, report.replayed
            ),
        ]);
        table.add_row(vec!["Final State", &report.final_state.to_string()]);
        table.to_string()
    }
}

fn status(info: &IdentityInfo) -> &'static str {
    if info.retired_at.is_some() {
        "retired"
    } else if info.published {
        "active"
    } else {
        "pending"
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

// JSON output structures

#[derive(Serialize)]
struct IdentityOutput {
    alias: String,
    did: String,
    transport_kind: String,
    endpoint: String,
    document_version: u64,
    key: String,
}

impl From<&Identity> for IdentityOutput {
    fn from(i: &Identity) -> Self {
        Self {
            alias: i.alias.clone(),
            did: i.did.clone(),
            transport_kind: i.transport_kind.to_string(),
            endpoint: i.endpoint.clone(),
            document_version: i.document_version,
            key: i.key.to_string(),
        }
    }
}

#[derive(Serialize)]
struct IdentitiesOutput {
    identities: Vec<IdentityJson>,
    count: usize,
}

#[derive(Serialize)]
struct IdentityJson {
    id: String,
    alias: String,
    did: Option<String>,
    transport_kind: String,
    endpoint: String,
    document_version: u64,
    status: &'static str,
    fingerprint: Option<String>,
    created_at: String,
    retired_at: Option<String>,
}

impl From<&[IdentityInfo]> for IdentitiesOutput {
    fn from(identities: &[IdentityInfo]) -> Self {
        Self {
            count: identities.len(),
            identities: identities.iter().map(IdentityJson::from).collect(),
        }
    }
}

impl From<&IdentityInfo> for IdentityJson {
    fn from(i: &IdentityInfo) -> Self {
        Self {
            id: i.id.to_string(),
            alias: i.alias.clone(),
            did: i.did.clone(),
            transport_kind: i.transport_kind.to_string(),
            endpoint: i.endpoint.clone(),
            document_version: i.document_version,
            status: status(i),
            fingerprint: i.fingerprint.clone(),
            created_at: i.created_at.to_rfc3339(),
            retired_at: i.retired_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
struct PeerOutput {
    did: String,
    transport_kind: String,
    endpoint: String,
    document_version: u64,
    fetched_at: String,
    document: serde_json::Value,
}

impl From<&PeerDocument> for PeerOutput {
    fn from(p: &PeerDocument) -> Self {
        Self {
            did: p.did.clone(),
            transport_kind: p.transport_kind.to_string(),
            endpoint: p.endpoint_address.clone(),
            document_version: p.document_version,
            fetched_at: p.fetched_at.to_rfc3339(),
            document: serde_json::to_value(&p.document).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Serialize)]
struct ErrorOutput {
    success: bool,
    error: String,
    exit_code: i32,
    exit_code_name: &'static str,
    timestamp: String,
}

/// Simple success message for JSON output
#[derive(Serialize)]
pub struct SuccessMessage {
    pub message: String,
}

impl SuccessMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
