use crate::model::TaskKey;
use crate::store::ControlChannel;
use ingestor_core::Result;
use std::sync::Arc;
use tracing::info;

/// Cooperative stop check for one task. The orchestrator polls it before
/// every page; a request is honoured at the next page boundary.
#[derive(Clone)]
pub struct StopToken {
    control: Arc<dyn ControlChannel>,
    task: TaskKey,
}

impl StopToken {
    pub fn new(control: Arc<dyn ControlChannel>, task: TaskKey) -> Self {
        Self { control, task }
    }

    pub async fn is_stop_requested(&self) -> Result<bool> {
        let requested = self.control.should_stop(&self.task).await?;
        if requested {
            info!(task = %self.task, "Stop requested");
        }
        Ok(requested)
    }
}
