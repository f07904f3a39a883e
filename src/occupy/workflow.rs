/// One-shot submit and delete flows with an operator confirmation gate
use std::io::{BufRead, Write};

use tracing::{info, warn};

use super::error::{OccupyError, OccupyResult};
use super::jobs::{DeleteSelector, DeletionReport, JobManager, OccupancyJob};
use super::plan::OccupancyPlan;
use super::sku::SkuProfile;
use crate::k8s::{ClusterClient, NodeInventory};

/// Operator confirmation, injected so flows can run unattended or in tests
pub trait Confirm {
    /// Plain yes/no question
    fn confirm(&self, prompt: &str) -> bool;

    /// Destructive question requiring the operator to type `expected`
    fn confirm_typed(&self, prompt: &str, expected: &str) -> bool {
        let _ = expected;
        self.confirm(prompt)
    }
}

/// Reads answers from stdin
pub struct StdinConfirm;

impl StdinConfirm {
    fn ask(prompt: &str) -> String {
        print!("{} ", prompt);
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return String::new();
        }
        answer.trim().to_string()
    }
}

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        matches!(
            Self::ask(&format!("{} [y/N]", prompt)).to_ascii_lowercase().as_str(),
            "y" | "yes"
        )
    }

    fn confirm_typed(&self, prompt: &str, expected: &str) -> bool {
        Self::ask(&format!("{} Type '{}' to continue:", prompt, expected)) == expected
    }
}

/// Answers every question with a fixed value (`--yes`)
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm(&self, _prompt: &str) -> bool {
        self.0
    }
}

/// Outcome of a one-shot submit
#[derive(Debug, Default)]
pub struct SubmitSummary {
    pub submitted: Vec<OccupancyJob>,
    pub failed: Vec<(String, OccupyError)>,
    pub unclassified: Vec<String>,
    pub cancelled: bool,
}

/// Outcome of a one-shot delete
#[derive(Debug, Default)]
pub struct DeleteSummary {
    pub reports: Vec<DeletionReport>,
    pub cancelled: bool,
}

/// Scan, preview, confirm, then submit one placeholder job per idle node
pub async fn submit_once<C: ClusterClient>(
    inventory: &NodeInventory<'_, C>,
    jobs: &mut JobManager<'_, C>,
    confirm: &dyn Confirm,
    only_sku: Option<SkuProfile>,
) -> OccupyResult<SubmitSummary> {
    let mut summary = SubmitSummary::default();

    info!("Querying cluster GPU nodes...");
    let candidates = match inventory.list_idle_gpu_nodes(&jobs.occupied_nodes()).await {
        Ok(nodes) => nodes,
        Err(e @ OccupyError::ClusterQuery(_)) => {
            warn!("{}; treating as no idle nodes", e);
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    let mut plan = OccupancyPlan::build(candidates);
    summary.unclassified = plan.unclassified.iter().map(|n| n.name.clone()).collect();
    if let Some(sku) = only_sku {
        plan.retain_sku(sku);
    }

    if plan.is_empty() {
        warn!("No idle GPU nodes available to occupy");
        return Ok(summary);
    }

    info!("Occupancy plan:");
    plan.log_preview();

    if !confirm.confirm(&format!(
        "Submit {} occupancy job(s) for {} GPU(s)?",
        plan.node_count(),
        plan.gpu_count()
    )) {
        warn!("Cancelled, nothing submitted");
        summary.cancelled = true;
        return Ok(summary);
    }

    for (node, sku) in plan.targets() {
        match jobs.occupy(node, sku).await {
            Ok(job) => {
                info!("✓ Submitted {} on {}: {}", job.name, job.node, job.message);
                summary.submitted.push(job);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("✗ {}: {}", node.name, e);
                summary.failed.push((node.name.clone(), e));
            }
        }
    }

    let gpus: u32 = plan
        .targets()
        .filter(|(node, _)| summary.submitted.iter().any(|j| j.node == node.name))
        .map(|(node, _)| node.gpu_free())
        .sum();
    info!(
        "Submitted {} of {} job(s), {} GPU(s) reserved",
        summary.submitted.len(),
        plan.node_count(),
        gpus
    );

    Ok(summary)
}

/// Preview matching jobs, confirm, then delete them and report per job
pub async fn delete_once<C: ClusterClient>(
    jobs: &mut JobManager<'_, C>,
    selector: &DeleteSelector,
    confirm: &dyn Confirm,
) -> OccupyResult<DeleteSummary> {
    let matching = jobs.matching(selector)?;
    if matching.is_empty() {
        warn!("No tracked occupancy jobs match");
        return Ok(DeleteSummary::default());
    }

    info!("About to delete {} occupancy job(s):", matching.len());
    for job in &matching {
        info!("  ✖ {} (node {})", job.name, job.node);
    }

    let count = matching.len();
    if !confirm.confirm_typed(&format!("Delete {} job(s)?", count), "yes") {
        warn!("Cancelled, nothing deleted");
        return Ok(DeleteSummary {
            reports: Vec::new(),
            cancelled: true,
        });
    }

    let reports = jobs.delete(selector).await?;
    log_deletion_reports(&reports);

    Ok(DeleteSummary {
        reports,
        cancelled: false,
    })
}

/// Log each deletion with both of its outcomes
pub fn log_deletion_reports(reports: &[DeletionReport]) {
    for report in reports {
        match (&report.cluster, &report.manifest) {
            (Ok(_), Ok(_)) => info!("✓ Deleted {} (node {})", report.name, report.node),
            (cluster, manifest) => {
                if let Err(e) = cluster {
                    warn!("✗ {}: cluster resource: {}", report.name, e);
                }
                if let Err(e) = manifest {
                    warn!("✗ {}: manifest file: {}", report.name, e);
                }
            }
        }
    }

    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    if failed == 0 {
        info!("All {} deletion(s) completed", reports.len());
    } else {
        warn!(
            "Deletion finished: {} succeeded, {} failed",
            reports.len() - failed,
            failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OccupyConfig;
    use crate::k8s::fake::{gpu_node, gpu_pod, FakeCluster};
    use std::cell::RefCell;

    /// Records prompts and answers from a script
    struct Scripted {
        answer: bool,
        prompts: RefCell<Vec<String>>,
    }

    impl Scripted {
        fn new(answer: bool) -> Self {
            Self {
                answer,
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl Confirm for Scripted {
        fn confirm(&self, prompt: &str) -> bool {
            self.prompts.borrow_mut().push(prompt.to_string());
            self.answer
        }
    }

    fn setup(dir: &tempfile::TempDir) -> (FakeCluster, OccupyConfig) {
        let cluster = FakeCluster::with_nodes(vec![
            gpu_node("gpu-a", "ml.p5.48xlarge", 8),
            gpu_node("gpu-b", "ml.p4d.24xlarge", 8),
            gpu_node("gpu-x", "ml.trn1.32xlarge", 16),
        ]);
        cluster.add_pod(gpu_pod("trainer-0", "gpu-b", 8));
        let mut config = OccupyConfig::example();
        config.yaml_dir = dir.path().to_path_buf();
        (cluster, config)
    }

    #[tokio::test]
    async fn test_only_idle_classified_node_is_occupied() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, config) = setup(&dir);
        let inventory = NodeInventory::new(&cluster, &config);
        let mut jobs = JobManager::new(&cluster, &config).unwrap();
        let confirm = Scripted::new(true);

        let summary = submit_once(&inventory, &mut jobs, &confirm, None).await.unwrap();

        assert_eq!(summary.submitted.len(), 1);
        let job = &summary.submitted[0];
        assert_eq!(job.node, "gpu-a");
        assert_eq!(job.sku, Some(SkuProfile::P5));
        assert_eq!(job.sku.unwrap().gpu_class(), "H100");
        assert_eq!(summary.unclassified, vec!["gpu-x".to_string()]);
        assert!(summary.failed.is_empty());
        assert_eq!(confirm.prompts.borrow().len(), 1);
        assert_eq!(cluster.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_declined_confirmation_submits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, config) = setup(&dir);
        let inventory = NodeInventory::new(&cluster, &config);
        let mut jobs = JobManager::new(&cluster, &config).unwrap();

        let summary = submit_once(&inventory, &mut jobs, &AutoConfirm(false), None)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(summary.submitted.is_empty());
        assert!(cluster.applied.lock().unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sku_filter_limits_submission() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, config) = setup(&dir);
        cluster.add_node(gpu_node("gpu-g", "ml.g5.48xlarge", 8));
        let inventory = NodeInventory::new(&cluster, &config);
        let mut jobs = JobManager::new(&cluster, &config).unwrap();

        let summary = submit_once(&inventory, &mut jobs, &AutoConfirm(true), Some(SkuProfile::G5))
            .await
            .unwrap();

        assert_eq!(summary.submitted.len(), 1);
        assert_eq!(summary.submitted[0].node, "gpu-g");
    }

    #[tokio::test]
    async fn test_one_rejected_node_does_not_block_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, config) = setup(&dir);
        cluster.add_node(gpu_node("gpu-c", "ml.p5.48xlarge", 8));
        let inventory = NodeInventory::new(&cluster, &config);
        let mut jobs = JobManager::new(&cluster, &config).unwrap();
        let rejected = jobs.generator().job_name("gpu-a", SkuProfile::P5);
        cluster.reject_apply.lock().unwrap().insert(rejected);

        let summary = submit_once(&inventory, &mut jobs, &AutoConfirm(true), None)
            .await
            .unwrap();

        assert_eq!(summary.submitted.len(), 1);
        assert_eq!(summary.submitted[0].node, "gpu-c");
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "gpu-a");
    }

    #[tokio::test]
    async fn test_manifest_write_failure_only_skips_that_node() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, config) = setup(&dir);
        cluster.add_node(gpu_node("gpu-c", "ml.p5.48xlarge", 8));
        let inventory = NodeInventory::new(&cluster, &config);
        let mut jobs = JobManager::new(&cluster, &config).unwrap();
        // a directory where gpu-a's manifest belongs makes the write fail
        let blocked = jobs.generator().job_name("gpu-a", SkuProfile::P5);
        std::fs::create_dir(dir.path().join(format!("{}.yaml", blocked))).unwrap();

        let summary = submit_once(&inventory, &mut jobs, &AutoConfirm(true), None)
            .await
            .unwrap();

        assert_eq!(summary.submitted.len(), 1);
        assert_eq!(summary.submitted[0].node, "gpu-c");
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "gpu-a");
        assert!(matches!(summary.failed[0].1, OccupyError::ManifestWrite { .. }));
        assert_eq!(cluster.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cluster_query_failure_means_no_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, config) = setup(&dir);
        *cluster.fail_queries.lock().unwrap() = true;
        let inventory = NodeInventory::new(&cluster, &config);
        let mut jobs = JobManager::new(&cluster, &config).unwrap();

        let summary = submit_once(&inventory, &mut jobs, &AutoConfirm(true), None)
            .await
            .unwrap();
        assert!(summary.submitted.is_empty());
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn test_delete_requires_typed_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, config) = setup(&dir);
        let inventory = NodeInventory::new(&cluster, &config);
        let mut jobs = JobManager::new(&cluster, &config).unwrap();
        submit_once(&inventory, &mut jobs, &AutoConfirm(true), None)
            .await
            .unwrap();

        let declined = delete_once(&mut jobs, &DeleteSelector::All, &AutoConfirm(false))
            .await
            .unwrap();
        assert!(declined.cancelled);
        assert_eq!(jobs.list_tracked().len(), 1);

        let done = delete_once(&mut jobs, &DeleteSelector::All, &AutoConfirm(true))
            .await
            .unwrap();
        assert_eq!(done.reports.len(), 1);
        assert!(done.reports[0].is_ok());
        assert!(jobs.list_tracked().is_empty());
    }

    #[tokio::test]
    async fn test_delete_without_matches_does_not_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, config) = setup(&dir);
        let mut jobs = JobManager::new(&cluster, &config).unwrap();
        let confirm = Scripted::new(true);

        let summary = delete_once(&mut jobs, &DeleteSelector::parse("occupy-.*"), &confirm)
            .await
            .unwrap();

        assert!(summary.reports.is_empty());
        assert!(!summary.cancelled);
        assert!(confirm.prompts.borrow().is_empty());
    }
}
