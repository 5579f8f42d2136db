use super::Job;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tracing::{error, info, warn};

/// Runs each registered job on its own interval until shutdown.
pub struct JobScheduler {
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl JobScheduler {
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    /// Schedule a job. The first run happens one full interval after start,
    /// so a crash-looping process doesn't hammer its jobs.
    pub fn schedule(&mut self, job: Arc<dyn Job>, every: Duration) {
        let job_name = job.name().to_string();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + every, every);
            info!(job = %job_name, interval = ?every, "job scheduled");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match job.execute().await {
                            Ok(result) if result.success => {
                                info!(job = %job_name, items = result.items_processed, "{}", result.message);
                            }
                            Ok(result) => {
                                warn!(job = %job_name, "{}", result.message);
                            }
                            Err(e) => {
                                error!(job = %job_name, error = %e, "job execution failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(job = %job_name, "job stopped");
        });
        self.handles.push(handle);
    }

    /// Wait for all job loops to observe shutdown and exit.
    pub async fn stop(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "job handle failed during shutdown");
            }
        }
        info!("job scheduler stopped");
    }
}
