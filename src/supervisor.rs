//! Lane supervision.
//!
//! Ingested events are partitioned across N independent lanes so one user's
//! ordering is preserved while throughput scales. Each lane is a task; when
//! one dies the supervisor rebuilds it from scratch after a cool-down,
//! unless the lane has died too often inside the sliding window, in which
//! case the whole process escalates and exits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("lane {lane} restarted {count} times within the window, escalating")]
    Escalated { lane: usize, count: usize },
    #[error("failed to build lane {lane}: {message}")]
    Build { lane: usize, message: String },
}

/// One partition's worth of the pipeline. A worker runs until the token is
/// cancelled; returning early (or panicking) counts as a crash.
#[async_trait]
pub trait LaneWorker: Send {
    async fn run(self: Box<Self>, shutdown: CancellationToken);
}

/// Builds a fresh worker for a lane. Called once at startup and again on
/// every restart, so workers never share crashed state.
#[async_trait]
pub trait LaneFactory: Send + Sync + 'static {
    async fn build(&self, lane: usize) -> Result<Box<dyn LaneWorker>, SupervisorError>;
}

/// Where a lane currently stands in its restart lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneStatus {
    Running,
    CoolingDown,
    Escalated,
}

/// Sliding-window restart counter. Entries older than the window are
/// forgotten; the count that matters is restarts still inside it.
#[derive(Debug)]
struct RestartWindow {
    window: Duration,
    max_restarts: usize,
    restarts: Vec<Instant>,
}

impl RestartWindow {
    fn new(window: Duration, max_restarts: usize) -> Self {
        Self {
            window,
            max_restarts,
            restarts: Vec::new(),
        }
    }

    /// Record a restart at `now`. Returns the number of restarts inside the
    /// window if it exceeds the budget.
    fn record(&mut self, now: Instant) -> Option<usize> {
        self.restarts
            .retain(|at| now.duration_since(*at) <= self.window);
        self.restarts.push(now);
        (self.restarts.len() > self.max_restarts).then_some(self.restarts.len())
    }
}

pub struct Supervisor {
    factory: Arc<dyn LaneFactory>,
    lanes: usize,
    max_restarts: usize,
    window: Duration,
    cooldown: Duration,
}

impl Supervisor {
    pub fn new(
        factory: Arc<dyn LaneFactory>,
        lanes: usize,
        max_restarts: usize,
        window: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            factory,
            lanes,
            max_restarts,
            window,
            cooldown,
        }
    }

    async fn spawn_lane(
        &self,
        set: &mut JoinSet<usize>,
        lane: usize,
        shutdown: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        let worker = self.factory.build(lane).await?;
        let token = shutdown.child_token();
        set.spawn(async move {
            // inner task contains a worker panic so the lane id survives
            if let Err(join_error) = tokio::spawn(worker.run(token)).await {
                tracing::error!(target: "supervisor", lane, error = %join_error, "lane_panicked");
            }
            lane
        });
        Ok(())
    }

    /// Run all lanes until `shutdown` fires or a lane escalates.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        let mut set = JoinSet::new();
        let mut windows: Vec<RestartWindow> = (0..self.lanes)
            .map(|_| RestartWindow::new(self.window, self.max_restarts))
            .collect();

        for lane in 0..self.lanes {
            self.spawn_lane(&mut set, lane, &shutdown).await?;
        }
        tracing::info!(target: "supervisor", lanes = self.lanes, "lanes_started");

        loop {
            let joined = tokio::select! {
                _ = shutdown.cancelled() => {
                    set.shutdown().await;
                    tracing::info!(target: "supervisor", "shutdown_complete");
                    return Ok(());
                }
                joined = set.join_next() => joined,
            };

            let Some(joined) = joined else {
                // every lane gone without a shutdown request
                return Ok(());
            };

            let lane = match joined {
                Ok(lane) => {
                    tracing::warn!(target: "supervisor", lane, "lane_exited");
                    lane
                }
                Err(join_error) => {
                    tracing::error!(target: "supervisor", error = %join_error, "lane_join_failed");
                    continue;
                }
            };

            if let Some(count) = windows[lane].record(Instant::now()) {
                tracing::error!(target: "supervisor", lane, count, status = ?LaneStatus::Escalated, "lane_escalated");
                shutdown.cancel();
                set.shutdown().await;
                return Err(SupervisorError::Escalated { lane, count });
            }

            tracing::info!(
                target: "supervisor",
                lane,
                status = ?LaneStatus::CoolingDown,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "lane_restarting"
            );
            tokio::select! {
                _ = shutdown.cancelled() => {
                    set.shutdown().await;
                    return Ok(());
                }
                _ = tokio::time::sleep(self.cooldown) => {}
            }
            self.spawn_lane(&mut set, lane, &shutdown).await?;
            tracing::info!(target: "supervisor", lane, status = ?LaneStatus::Running, "lane_restarted");
        }
    }
}
