use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::communication::{MessageDispatchRegistry, Sender};
use crate::error::CommunicationError;
use crate::protocol::{AgentProcessReport, Message, MessageKind, WorkerProcessReport};

#[derive(Default)]
struct Reports {
    agents: BTreeMap<String, AgentProcessReport>,
    workers: BTreeMap<String, WorkerProcessReport>,
}

/// Latest report from every agent and worker, keyed by unique id.
#[derive(Default)]
pub struct ProcessRegistry {
    reports: Mutex<Reports>,
}

impl ProcessRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Reports> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn agents(&self) -> Vec<AgentProcessReport> {
        self.lock().agents.values().cloned().collect()
    }

    #[must_use]
    pub fn workers(&self) -> Vec<WorkerProcessReport> {
        self.lock().workers.values().cloned().collect()
    }

    fn record_agent(&self, report: AgentProcessReport) {
        let previous = self
            .lock()
            .agents
            .insert(report.identity.unique_id().to_owned(), report.clone());
        if previous.is_none_or(|previous| previous.state != report.state) {
            info!(
                "agent {} is {:?}",
                report.identity.name(),
                report.state
            );
        }
    }

    fn record_worker(&self, report: WorkerProcessReport) {
        let previous = self
            .lock()
            .workers
            .insert(report.identity.unique_id().to_owned(), report.clone());
        if previous.is_none_or(|previous| previous.state != report.state) {
            info!(
                "worker {} is {:?}",
                report.identity.name(),
                report.state
            );
        }
    }

    /// Registers handlers for agent and worker process reports.
    pub fn register_message_handlers(self: &Arc<Self>, registry: &dyn MessageDispatchRegistry) {
        for kind in [MessageKind::AgentProcessReport, MessageKind::WorkerProcessReport] {
            registry.set_handler(kind, Arc::new(ReportHandler(Arc::clone(self))));
        }
    }
}

struct ReportHandler(Arc<ProcessRegistry>);

#[async_trait]
impl Sender for ReportHandler {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        match message {
            Message::AgentProcessReport(report) => self.0.record_agent(*report),
            Message::WorkerProcessReport(report) => self.0.record_worker(*report),
            ignored @ (Message::CloseCommunication
            | Message::NoResponse
            | Message::RequiringResponse(_)
            | Message::InitialiseWorker(_)
            | Message::StartWorkers(_)
            | Message::ResetWorkers
            | Message::StopWorkers
            | Message::ClearCache
            | Message::DistributeFile(_)
            | Message::DistributionCacheCheckpoint { .. }) => {
                debug!("Process registry ignoring {}", ignored.kind());
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}
