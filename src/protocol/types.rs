use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use super::request::MessageRequiringResponse;

static NEXT_UNIQUE_ID: AtomicU64 = AtomicU64::new(0);

#[must_use]
pub fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn unique_id(prefix: &str) -> String {
    let serial = NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}|{}|{}|{}",
        prefix,
        std::process::id(),
        current_time_ms(),
        serial
    )
}

/// Identity of an agent process. Equality is by unique id, so renaming an
/// agent does not change who it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    name: String,
    number: Option<u32>,
    unique_id: String,
}

impl AgentIdentity {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            number: None,
            unique_id: unique_id("agent"),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[must_use]
    pub const fn number(&self) -> Option<u32> {
        self.number
    }

    pub const fn set_number(&mut self, number: Option<u32>) {
        self.number = number;
    }

    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }
}

impl PartialEq for AgentIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.unique_id == other.unique_id
    }
}

impl Eq for AgentIdentity {}

impl Hash for AgentIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_id.hash(state);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentity {
    name: String,
    number: u32,
    agent_id: String,
    unique_id: String,
}

impl WorkerIdentity {
    #[must_use]
    pub fn new(agent: &AgentIdentity, number: u32) -> Self {
        Self {
            name: format!("{}-{}", agent.name(), number),
            number,
            agent_id: agent.unique_id().to_owned(),
            unique_id: unique_id("worker"),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }

    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    #[must_use]
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }
}

impl PartialEq for WorkerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.unique_id == other.unique_id
    }
}

impl Eq for WorkerIdentity {}

impl Hash for WorkerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_id.hash(state);
    }
}

/// Peer-supplied identity sent straight after the connection type byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Address {
    Agent { identity: AgentIdentity },
    Worker { identity: WorkerIdentity },
    ConsoleClient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHighWaterMark {
    cache_id: String,
    time: i64,
}

impl CacheHighWaterMark {
    #[must_use]
    pub fn new(cache_id: impl Into<String>, time: i64) -> Self {
        Self {
            cache_id: cache_id.into(),
            time,
        }
    }

    /// Mark held by an agent whose cache has never been checkpointed.
    #[must_use]
    pub const fn out_of_date() -> Self {
        Self {
            cache_id: String::new(),
            time: -1,
        }
    }

    #[must_use]
    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    #[must_use]
    pub const fn time(&self) -> i64 {
        self.time
    }

    #[must_use]
    pub fn is_for_same_cache(&self, other: &Self) -> bool {
        self.time >= 0 && other.time >= 0 && self.cache_id == other.cache_id
    }
}

impl Default for CacheHighWaterMark {
    fn default() -> Self {
        Self::out_of_date()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Started,
    Running,
    Finished,
}

/// Identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    peer: SocketAddr,
    serial: u64,
}

impl ConnectionIdentity {
    #[must_use]
    pub const fn new(peer: SocketAddr, serial: u64) -> Self {
        Self { peer, serial }
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.serial)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartWorkers {
    pub properties: BTreeMap<String, String>,
    pub agent_number: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributeFile {
    pub path: String,
    pub contents_b64: String,
}

impl DistributeFile {
    #[must_use]
    pub fn new(path: impl Into<String>, contents: &[u8]) -> Self {
        Self {
            path: path.into(),
            contents_b64: BASE64.encode(contents),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProcessReport {
    pub identity: AgentIdentity,
    pub state: ProcessState,
    pub cache_high_water_mark: CacheHighWaterMark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProcessReport {
    pub identity: WorkerIdentity,
    pub state: ProcessState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialiseWorker {
    pub identity: WorkerIdentity,
    pub console: Option<ConsoleEndpoint>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Tells the receiving side to close this connection.
    CloseCommunication,
    /// Reply synthesized when nothing answered a request.
    NoResponse,
    RequiringResponse(MessageRequiringResponse),
    InitialiseWorker(Box<InitialiseWorker>),
    StartWorkers(StartWorkers),
    ResetWorkers,
    StopWorkers,
    ClearCache,
    DistributeFile(DistributeFile),
    DistributionCacheCheckpoint {
        cache_high_water_mark: CacheHighWaterMark,
    },
    AgentProcessReport(Box<AgentProcessReport>),
    WorkerProcessReport(Box<WorkerProcessReport>),
}

/// Discriminant used to key dispatch tables. Matching is exact: a handler
/// registered for one kind never sees another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    CloseCommunication,
    NoResponse,
    RequiringResponse,
    InitialiseWorker,
    StartWorkers,
    ResetWorkers,
    StopWorkers,
    ClearCache,
    DistributeFile,
    DistributionCacheCheckpoint,
    AgentProcessReport,
    WorkerProcessReport,
}

impl Message {
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::CloseCommunication => MessageKind::CloseCommunication,
            Self::NoResponse => MessageKind::NoResponse,
            Self::RequiringResponse(_) => MessageKind::RequiringResponse,
            Self::InitialiseWorker(_) => MessageKind::InitialiseWorker,
            Self::StartWorkers(_) => MessageKind::StartWorkers,
            Self::ResetWorkers => MessageKind::ResetWorkers,
            Self::StopWorkers => MessageKind::StopWorkers,
            Self::ClearCache => MessageKind::ClearCache,
            Self::DistributeFile(_) => MessageKind::DistributeFile,
            Self::DistributionCacheCheckpoint { .. } => MessageKind::DistributionCacheCheckpoint,
            Self::AgentProcessReport(_) => MessageKind::AgentProcessReport,
            Self::WorkerProcessReport(_) => MessageKind::WorkerProcessReport,
        }
    }
}

impl MessageKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CloseCommunication => "close_communication",
            Self::NoResponse => "no_response",
            Self::RequiringResponse => "requiring_response",
            Self::InitialiseWorker => "initialise_worker",
            Self::StartWorkers => "start_workers",
            Self::ResetWorkers => "reset_workers",
            Self::StopWorkers => "stop_workers",
            Self::ClearCache => "clear_cache",
            Self::DistributeFile => "distribute_file",
            Self::DistributionCacheCheckpoint => "distribution_cache_checkpoint",
            Self::AgentProcessReport => "agent_process_report",
            Self::WorkerProcessReport => "worker_process_report",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
