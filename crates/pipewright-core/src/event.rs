//! Job events published to subscribers (notifications, statistics, logs).

use tokio::sync::broadcast;
use tracing::trace;

use crate::job::Job;
use crate::step::Step;
use crate::JobId;

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StatusChanged(Box<Job>),
    StepsInitialized { job_id: JobId, steps: Vec<Step> },
    StepStatusChanged(Box<Step>),
    /// A queue consumer picked the job up.
    Received(JobId),
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::StatusChanged(job) => job.id,
            JobEvent::StepsInitialized { job_id, .. } => *job_id,
            JobEvent::StepStatusChanged(step) => step.job_id,
            JobEvent::Received(job_id) => *job_id,
        }
    }
}

/// Fire-and-forget event sink.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: JobEvent);
}

/// Event bus over a tokio broadcast channel.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: JobEvent) {
        // no subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("job event dropped without subscribers");
        }
    }
}
