//! Wire types for the gnsops control plane.
//!
//! Defines the GNS3 topology entities (projects, nodes, links, templates,
//! drawings, snapshots), device-session types shared by the console and SSH
//! managers, the structured error model, and the capped session output buffer.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use buffer::{OutputBuffer, ReadMode};
pub use error::{ErrorClass, ErrorCode, ErrorEnvelope};

/// Version string stamped into every error envelope.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

// ─── Projects ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Opened,
    Closed,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened => write!(f, "opened"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub status: ProjectStatus,
}

impl Project {
    pub fn is_open(&self) -> bool {
        self.status == ProjectStatus::Opened
    }
}

// ─── Nodes ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Started,
    Stopped,
    Suspended,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleType {
    Telnet,
    Vnc,
    Spice,
    #[default]
    None,
}

/// One physical or virtual port on a node, as reported by GNS3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePort {
    pub name: String,
    #[serde(default)]
    pub short_name: Option<String>,
    pub adapter_number: u32,
    pub port_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub name: String,
    pub node_type: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub console: Option<u16>,
    #[serde(default)]
    pub console_type: ConsoleType,
    #[serde(default)]
    pub console_host: Option<String>,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub z: i32,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub ports: Vec<NodePort>,
}

impl Node {
    /// Look up a port by adapter/port number pair.
    pub fn port(&self, adapter_number: u32, port_number: u32) -> Option<&NodePort> {
        self.ports
            .iter()
            .find(|p| p.adapter_number == adapter_number && p.port_number == port_number)
    }

    /// Look up a port by its name or short name (`"GigabitEthernet0/0"`, `"eth0"`).
    pub fn port_by_name(&self, name: &str) -> Option<&NodePort> {
        self.ports
            .iter()
            .find(|p| p.name == name || p.short_name.as_deref() == Some(name))
    }
}

// ─── Links ────────────────────────────────────────────────────────────────────

/// One endpoint of a link. GNS3 calls these "nodes" in the link payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEndpoint {
    pub node_id: String,
    pub adapter_number: u32,
    pub port_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub link_id: String,
    #[serde(rename = "nodes")]
    pub endpoints: Vec<LinkEndpoint>,
}

impl Link {
    /// A link is well-formed iff it has exactly two endpoints. Ill-formed
    /// links are kept visible so operators can clean them up.
    pub fn is_well_formed(&self) -> bool {
        self.endpoints.len() == 2
    }
}

// ─── Templates / Drawings / Snapshots ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    pub name: String,
    pub template_type: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drawing {
    pub drawing_id: String,
    pub svg: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub z: i32,
    #[serde(default)]
    pub rotation: i32,
    #[serde(default)]
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gns3Version {
    pub version: String,
    #[serde(default)]
    pub local: bool,
}

// ─── Device sessions ──────────────────────────────────────────────────────────

/// Connection parameters for an SSH-managed device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Vendor driver key, e.g. `cisco_ios`, `arista_eos`, `linux`.
    pub device_type: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Enable/privileged-mode secret where the platform has one.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    /// Per-connection timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// One remote command invocation recorded in per-session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    /// Seconds between start and finish; 0 while running.
    pub execution_time: f64,
}

impl Job {
    pub fn is_completed(&self) -> bool {
        self.status != JobStatus::Running
    }
}

// ─── Validation helpers ───────────────────────────────────────────────────────

/// Node names index the session maps, so reject names that cannot be
/// round-tripped through a URI path segment.
pub fn validate_node_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 128 && !name.contains(['/', '\0'])
}
