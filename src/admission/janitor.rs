//! Background retention task.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::controller::AdmissionController;
use crate::config::RetentionConfig;

/// Run [`AdmissionController::run_maintenance`] every
/// `cleanup_interval_secs` until the returned handle is aborted.
///
/// The first pass runs immediately.
pub fn spawn_janitor(controller: Arc<AdmissionController>, retention: RetentionConfig) -> JoinHandle<()> {
    let period = Duration::from_secs(retention.cleanup_interval_secs.max(1));
    info!(interval_secs = period.as_secs(), "Starting retention janitor");

    tokio::spawn(async move {
        let mut ticks = IntervalStream::new(tokio::time::interval(period));
        while ticks.next().await.is_some() {
            let report = controller.run_maintenance(&retention);
            debug!(removed = report.total(), "Janitor pass");
        }
    })
}
