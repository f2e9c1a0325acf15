//! Long-running background work kicked off at startup. Background tasks
//! log and continue; they never propagate into the request path.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::application::Application;
use crate::conversation::janitor::FileJanitor;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// Sleep-driven cleanup loop for conversation attachments. Each pass runs
/// the TTL sweep and quota trim on a blocking worker so the filesystem
/// walk never stalls the runtime.
async fn periodic_attachment_cleanup(janitor: FileJanitor) {
    debug!("attachment cleanup loop started");
    loop {
        tokio::time::sleep(CLEANUP_INTERVAL).await;

        let pass = janitor.clone();
        match tokio::task::spawn_blocking(move || pass.run_once()).await {
            Ok(report) => {
                debug!(deleted = report.files_deleted, "scheduled janitor pass done")
            }
            Err(e) => warn!(error = %e, "janitor pass panicked"),
        }
    }
}

/// Owns the handles of every background loop so shutdown can abort them.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn start(app: &Application) -> Self {
        let janitor = FileJanitor::new(
            app.config.conversation_temp_dir(),
            Duration::from_secs(app.config.conversation_file_ttl_hours * 3600),
            app.config.conversation_storage_quota_mb * 1024 * 1024,
        );

        Self {
            handles: vec![tokio::spawn(periodic_attachment_cleanup(janitor))],
        }
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}
