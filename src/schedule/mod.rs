use chrono::Utc;
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BackupRequest;
use crate::errors::{AppError, Result};
use crate::progress::{self, ProgressSink};
use crate::runner::BackupRunner;

/// Builds fresh request parameters at every tick; credentials may rotate
/// between ticks.
pub type RequestFactory = Arc<dyn Fn() -> BackupRequest + Send + Sync>;

struct ScheduleEntry {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Registry of recurring backup timers, keyed by schedule identity.
///
/// At most one live timer per identity: registering an identity again stops
/// and replaces the previous timer. Registrations live for the process only;
/// recovery after restart is the surrounding application's concern.
pub struct Scheduler {
    runner: Arc<BackupRunner>,
    registry: Mutex<HashMap<String, ScheduleEntry>>,
}

impl Scheduler {
    pub fn new(runner: Arc<BackupRunner>) -> Self {
        Self {
            runner,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Validates the cron expression and registers a timer for `identity`.
    /// An invalid expression fails with `InvalidCronSpec` and no side
    /// effects.
    pub async fn register(
        &self,
        identity: &str,
        cron_spec: &str,
        factory: RequestFactory,
    ) -> Result<()> {
        let schedule = parse_cron(cron_spec)?;

        // The old timer must be dead before the replacement exists; at no
        // point may two live timers share one identity.
        let mut registry = self.registry.lock().await;
        if let Some(previous) = registry.remove(identity) {
            info!(identity, "replacing existing schedule");
            previous.token.cancel();
            previous.task.abort();
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(run_schedule_loop(
            identity.to_string(),
            schedule,
            factory,
            self.runner.clone(),
            token.clone(),
        ));
        registry.insert(identity.to_string(), ScheduleEntry { token, task });
        Ok(())
    }

    /// Stops and removes the timer for `identity`; returns whether one
    /// existed.
    pub async fn unregister(&self, identity: &str) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.remove(identity) {
            Some(entry) => {
                entry.token.cancel();
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    /// Identities with a live timer.
    pub async fn active(&self) -> Vec<String> {
        self.registry.lock().await.keys().cloned().collect()
    }

    /// Cancels every registered timer.
    pub async fn shutdown(&self) {
        let mut registry = self.registry.lock().await;
        for (identity, entry) in registry.drain() {
            info!(identity = %identity, "stopping schedule");
            entry.token.cancel();
            entry.task.abort();
        }
    }
}

/// The cron crate expects 6-field (with seconds) or 7-field expressions;
/// standard 5-field specs get a zero seconds field prepended.
fn parse_cron(cron_spec: &str) -> Result<Schedule> {
    let full_spec = if cron_spec.split_whitespace().count() == 5 {
        format!("0 {cron_spec}")
    } else {
        cron_spec.to_string()
    };
    Schedule::from_str(&full_spec).map_err(|e| AppError::InvalidCronSpec {
        expr: cron_spec.to_string(),
        message: e.to_string(),
    })
}

async fn run_schedule_loop(
    identity: String,
    schedule: Schedule,
    factory: RequestFactory,
    runner: Arc<BackupRunner>,
    token: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            warn!(identity = %identity, "cron schedule has no future fire times, stopping");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        // Fresh parameters every tick; the execution is not awaited, so a
        // slow backup never delays the next fire.
        let request = factory();
        info!(identity = %identity, subject = %request.database, "schedule tick, starting backup");
        let (progress, rx) = ProgressSink::channel();
        let _ = progress::drain_to_log(request.database.clone(), rx);

        let runner = runner.clone();
        let cancel = token.child_token();
        let _ = tokio::spawn(async move {
            if let Err(e) = runner.execute(&request, progress, cancel).await {
                warn!(error = %e, "scheduled backup execution error");
            }
        });
    }
}
