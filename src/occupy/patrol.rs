/// Unattended detect-and-occupy loop
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::OccupyResult;
use super::jobs::JobManager;
use super::plan::OccupancyPlan;
use crate::k8s::{ClusterClient, NodeInventory};

/// Where the patrol loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatrolState {
    Idle,
    Scanning,
    Occupying,
    Stopped,
}

/// What a single tick observed and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub idle_found: usize,
    pub occupied: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub unclassified: Vec<String>,
    pub scan_error: Option<String>,
}

/// Totals over a whole patrol run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatrolReport {
    pub ticks: u64,
    pub occupied_nodes: Vec<String>,
    pub failures: usize,
}

pub struct Patrol<'a, C> {
    inventory: NodeInventory<'a, C>,
    jobs: JobManager<'a, C>,
    interval: Duration,
    state: PatrolState,
    report: PatrolReport,
    synced: bool,
}

impl<'a, C: ClusterClient> Patrol<'a, C> {
    /// `interval` is the pause between the end of one tick and the start of the next
    pub fn new(inventory: NodeInventory<'a, C>, jobs: JobManager<'a, C>, interval: Duration) -> Self {
        Self {
            inventory,
            jobs,
            interval,
            state: PatrolState::Idle,
            report: PatrolReport::default(),
            synced: false,
        }
    }

    fn set_state(&mut self, next: PatrolState) {
        if self.state != next {
            debug!("Patrol {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> PatrolState {
        self.state
    }

    #[cfg(test)]
    pub fn jobs(&self) -> &JobManager<'a, C> {
        &self.jobs
    }

    #[cfg(test)]
    pub fn report(&self) -> &PatrolReport {
        &self.report
    }

    /// Run one scan-and-occupy cycle
    ///
    /// Idleness is re-derived from live cluster state every tick. Only
    /// configuration errors are returned; everything else lands in the report.
    pub async fn tick(&mut self) -> OccupyResult<TickReport> {
        self.report.ticks += 1;
        let mut tick = TickReport {
            tick: self.report.ticks,
            ..TickReport::default()
        };

        self.set_state(PatrolState::Scanning);

        match self.jobs.reconcile().await {
            Ok(_) => self.synced = true,
            Err(e) if self.synced => {
                warn!("Could not reconcile tracked jobs, keeping previous state: {}", e);
            }
            Err(e) => {
                // Without one successful listing the occupied set is unknown
                warn!("Tracked jobs unknown, skipping this round: {}", e);
                tick.scan_error = Some(e.to_string());
                self.set_state(PatrolState::Idle);
                return Ok(tick);
            }
        }

        let candidates = match self
            .inventory
            .list_idle_gpu_nodes(&self.jobs.occupied_nodes())
            .await
        {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("Scan failed: {}", e);
                tick.scan_error = Some(e.to_string());
                self.set_state(PatrolState::Idle);
                return Ok(tick);
            }
        };
        tick.idle_found = candidates.len();

        let plan = OccupancyPlan::build(candidates);
        tick.unclassified = plan.unclassified.iter().map(|n| n.name.clone()).collect();

        self.set_state(PatrolState::Occupying);
        for (node, sku) in plan.targets() {
            match self.jobs.occupy(node, sku).await {
                Ok(job) => {
                    info!("  ✓ Occupied {} with {}", job.node, job.name);
                    tick.occupied.push(job.node);
                }
                Err(e) if e.is_fatal() => {
                    self.set_state(PatrolState::Stopped);
                    return Err(e);
                }
                Err(e) => {
                    warn!("  ✗ {}: {}", node.name, e);
                    tick.failed.push((node.name.clone(), e.to_string()));
                }
            }
        }

        self.report.occupied_nodes.extend(tick.occupied.iter().cloned());
        self.report.failures += tick.failed.len();
        self.set_state(PatrolState::Idle);
        Ok(tick)
    }

    /// Tick until cancelled; cancellation is honored between ticks and while sleeping
    ///
    /// Tracked jobs are recovered first. A failed recovery is retried by the
    /// reconcile at the start of every tick.
    pub async fn run(mut self, cancel: CancellationToken) -> OccupyResult<PatrolReport> {
        info!(
            "Patrol started, checking for idle GPU nodes every {} seconds",
            self.interval.as_secs()
        );

        match self.jobs.recover().await {
            Ok(_) => self.synced = true,
            Err(e) => warn!("Could not recover tracked jobs, retrying each round: {}", e),
        }

        while !cancel.is_cancelled() {
            info!("── Patrol round ({}) ──", Local::now().format("%H:%M:%S"));

            let tick = self.tick().await?;
            if tick.scan_error.is_none() {
                if tick.idle_found == 0 {
                    info!("  Round {}: no idle GPU nodes", tick.tick);
                } else {
                    info!(
                        "  Round {}: occupied {} of {} idle node(s), {} so far",
                        tick.tick,
                        tick.occupied.len(),
                        tick.idle_found,
                        self.report.occupied_nodes.len()
                    );
                }
                if !tick.unclassified.is_empty() {
                    info!("  Left alone (unclassified): {}", tick.unclassified.join(", "));
                }
            }
            info!("  Next patrol in {} seconds", self.interval.as_secs());

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.set_state(PatrolState::Stopped);
        info!(
            "Patrol stopped after {} round(s): {} node(s) occupied, {} failure(s)",
            self.report.ticks,
            self.report.occupied_nodes.len(),
            self.report.failures
        );

        Ok(self.report)
    }
}
