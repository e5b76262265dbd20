//! Reverse-order teardown of a deployment.
//!
//! Stages run in dependency order (agents first, IAM last). A failing stage
//! is recorded and the next stage still runs. Every delete treats "not
//! found" as done, so a second cleanup deletes nothing.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::adapters::{Adapters, Deletion};
use crate::context::DeploymentContext;
use crate::error::ProvisionError;
use crate::provider::ControlPlane;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CleanupStage {
    Agents,
    KnowledgeBases,
    SearchCollection,
    Functions,
    Bucket,
    Iam,
}

impl CleanupStage {
    pub const ALL: [CleanupStage; 6] = [
        CleanupStage::Agents,
        CleanupStage::KnowledgeBases,
        CleanupStage::SearchCollection,
        CleanupStage::Functions,
        CleanupStage::Bucket,
        CleanupStage::Iam,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStage::Agents => "agents",
            CleanupStage::KnowledgeBases => "knowledge bases",
            CleanupStage::SearchCollection => "search collection",
            CleanupStage::Functions => "functions",
            CleanupStage::Bucket => "bucket",
            CleanupStage::Iam => "iam",
        }
    }
}

impl fmt::Display for CleanupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one stage removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub deleted: Vec<String>,
}

impl StageSummary {
    fn record(&mut self, outcome: Deletion, what: impl Into<String>) {
        if outcome.is_deleted() {
            self.deleted.push(what.into());
        }
    }
}

/// Outcome of every stage of a cleanup run.
#[derive(Debug)]
pub struct CleanupReport {
    pub stages: Vec<(CleanupStage, Result<StageSummary, ProvisionError>)>,
    pub elapsed: Duration,
}

impl CleanupReport {
    pub fn total_deleted(&self) -> usize {
        self.stages
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .map(|s| s.deleted.len())
            .sum()
    }

    pub fn failures(&self) -> Vec<(CleanupStage, &ProvisionError)> {
        self.stages
            .iter()
            .filter_map(|(stage, r)| r.as_ref().err().map(|e| (*stage, e)))
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.stages.iter().all(|(_, r)| r.is_ok())
    }

    /// One line per failed stage, or `None` when every stage succeeded.
    pub fn error_summary(&self) -> Option<String> {
        let failures = self.failures();
        if failures.is_empty() {
            return None;
        }
        Some(
            failures
                .iter()
                .map(|(stage, e)| format!("{}: {}", stage, e))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Ask for confirmation on `writer` and read the answer from `reader`.
/// Only `yes` (any case, surrounding whitespace ignored) proceeds.
pub fn confirm<R: BufRead, W: Write>(mut reader: R, writer: &mut W) -> io::Result<bool> {
    writeln!(writer, "WARNING: this deletes every resource of the deployment:")?;
    for line in [
        "  - supervisor and collaborator agents",
        "  - knowledge bases and data sources",
        "  - vector search collection and its policies",
        "  - collaborator functions",
        "  - the document bucket and all its contents",
        "  - IAM roles and policies",
    ] {
        writeln!(writer, "{}", line)?;
    }
    write!(writer, "Are you sure you want to proceed? (yes/no): ")?;
    writer.flush()?;

    let mut answer = String::new();
    reader.read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

pub struct CleanupCoordinator {
    ctx: Arc<DeploymentContext>,
    adapters: Adapters,
}

impl CleanupCoordinator {
    pub fn new(ctx: Arc<DeploymentContext>, plane: &ControlPlane) -> Self {
        let adapters = Adapters::new(ctx.clone(), plane);
        Self { ctx, adapters }
    }

    /// Run every stage in order and collect their results.
    pub async fn run(&self) -> CleanupReport {
        let started = Instant::now();
        info!(base = %self.ctx.names.base_name, "Starting cleanup");

        let mut stages = Vec::with_capacity(CleanupStage::ALL.len());
        for stage in CleanupStage::ALL {
            info!(stage = %stage, "Cleaning up");
            let result = self.run_stage(stage).await;
            match &result {
                Ok(summary) => {
                    info!(stage = %stage, deleted = summary.deleted.len(), "Stage complete")
                }
                Err(e) => error!(stage = %stage, "Stage failed: {}", e),
            }
            stages.push((stage, result));
        }

        let report = CleanupReport {
            stages,
            elapsed: started.elapsed(),
        };
        info!(
            deleted = report.total_deleted(),
            failed = report.failures().len(),
            elapsed_secs = report.elapsed.as_secs_f64(),
            "Cleanup finished"
        );
        report
    }

    async fn run_stage(&self, stage: CleanupStage) -> Result<StageSummary, ProvisionError> {
        match stage {
            CleanupStage::Agents => self.agents().await,
            CleanupStage::KnowledgeBases => self.knowledge_bases().await,
            CleanupStage::SearchCollection => self.search_collection().await,
            CleanupStage::Functions => self.functions().await,
            CleanupStage::Bucket => self.bucket().await,
            CleanupStage::Iam => self.iam().await,
        }
    }

    /// Every agent named after the base name, supervisor first.
    async fn agents(&self) -> Result<StageSummary, ProvisionError> {
        let names = &self.ctx.names;
        let mut agents = self.adapters.agents.list_by_prefix(&names.base_name).await?;
        agents.sort_by_key(|a| a.name != names.supervisor_agent);

        let mut summary = StageSummary::default();
        for agent in agents {
            let outcome = self.adapters.agents.delete(&agent.id).await?;
            summary.record(outcome, agent.name);
        }
        Ok(summary)
    }

    async fn knowledge_bases(&self) -> Result<StageSummary, ProvisionError> {
        let kbs = &self.adapters.knowledge_bases;
        let mut summary = StageSummary::default();
        for kb in kbs.list_by_prefix(&self.ctx.names.kb_base_name).await? {
            let outcome = kbs.delete(&kb.id).await?;
            summary.record(outcome, kb.name);
        }
        Ok(summary)
    }

    /// The collection, then every security policy that covers it.
    async fn search_collection(&self) -> Result<StageSummary, ProvisionError> {
        let collection = &self.ctx.names.collection;
        let search = &self.adapters.search;
        let mut summary = StageSummary::default();

        let outcome = search.delete_collection(collection).await?;
        summary.record(outcome, collection.clone());
        summary.deleted.extend(search.delete_policies(collection).await?);
        Ok(summary)
    }

    async fn functions(&self) -> Result<StageSummary, ProvisionError> {
        let functions = &self.adapters.functions;
        let prefix = format!("{}-", self.ctx.names.base_name);
        let mut summary = StageSummary::default();
        for function in functions.list_by_prefix(&prefix).await? {
            let outcome = functions.delete(&function.name).await?;
            summary.record(outcome, function.name);
        }
        Ok(summary)
    }

    async fn bucket(&self) -> Result<StageSummary, ProvisionError> {
        let bucket = &self.ctx.names.bucket;
        let mut summary = StageSummary::default();
        let outcome = self.adapters.storage.force_delete(bucket).await?;
        summary.record(outcome, bucket.clone());
        Ok(summary)
    }

    /// Roles first so no policy is still attached when it is deleted.
    async fn iam(&self) -> Result<StageSummary, ProvisionError> {
        let names = &self.ctx.names;
        let iam = &self.adapters.iam;
        let mut summary = StageSummary::default();
        for role in names.roles() {
            let outcome = iam.delete_role(role).await?;
            summary.record(outcome, role);
        }
        for policy in names.policies() {
            let outcome = iam.delete_policy(policy).await?;
            summary.record(outcome, policy);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing;
    use crate::error::ApiError;
    use crate::orchestrator::{DeploymentPlan, Orchestrator};
    use crate::package::PackageSource;
    use crate::provider::{KnowledgeBaseApi, MemoryControlPlane, SearchApi};

    async fn deployed() -> (Arc<MemoryControlPlane>, CleanupCoordinator) {
        let (sim, plane) = testing::plane();
        let ctx = testing::context();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doc.txt"), "content").unwrap();

        Orchestrator::new(ctx.clone(), &plane)
            .deploy(
                &DeploymentPlan::new(PackageSource::Inline(b"runtime".to_vec()))
                    .with_upload(dir.path()),
            )
            .await
            .unwrap();
        (sim, CleanupCoordinator::new(ctx, &plane))
    }

    #[tokio::test]
    async fn cleanup_removes_everything_and_second_run_is_a_no_op() {
        let (sim, cleanup) = deployed().await;

        let first = cleanup.run().await;
        assert!(first.is_success(), "{:?}", first.error_summary());
        assert!(first.total_deleted() > 0);
        assert!(sim.live_agents().is_empty());
        assert!(sim.live_knowledge_bases().is_empty());
        assert!(sim.live_collections().is_empty());
        assert!(sim.live_search_policies().is_empty());
        assert!(sim.live_functions().is_empty());
        assert!(sim.live_buckets().is_empty());
        assert!(sim.live_roles().is_empty());
        assert!(sim.live_policies().is_empty());

        let second = cleanup.run().await;
        assert!(second.is_success());
        assert_eq!(second.total_deleted(), 0);
    }

    #[tokio::test]
    async fn failing_stage_does_not_stop_later_stages() {
        let (sim, cleanup) = deployed().await;
        sim.fail_on(
            "delete_knowledge_base",
            ApiError::service("delete_knowledge_base", "internal error"),
        );

        let report = cleanup.run().await;
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, CleanupStage::KnowledgeBases);
        assert!(report.error_summary().unwrap().starts_with("knowledge bases:"));
        assert!(sim.live_functions().is_empty());
        assert!(sim.live_buckets().is_empty());
        assert_eq!(sim.live_knowledge_bases().len(), 1);
    }

    #[tokio::test]
    async fn deletions_in_flight_are_awaited_not_repeated() {
        let (sim, cleanup) = deployed().await;
        let names = &cleanup.ctx.names;
        let kb = sim.list_knowledge_bases().await.unwrap().remove(0);
        sim.delete_knowledge_base(&kb.id).await.unwrap();
        let collection = sim.get_collection(&names.collection).await.unwrap();
        sim.delete_collection(&collection.id).await.unwrap();
        sim.reset_calls();

        let report = cleanup.run().await;
        assert!(report.is_success(), "{:?}", report.error_summary());
        assert_eq!(sim.calls("delete_knowledge_base"), 0);
        assert_eq!(sim.calls("delete_collection"), 0);
        let deleted: Vec<&String> = report
            .stages
            .iter()
            .flat_map(|(_, r)| r.as_ref().unwrap().deleted.iter())
            .collect();
        assert!(!deleted.contains(&&kb.name));
        assert!(!deleted.contains(&&names.collection));
        assert!(sim.live_knowledge_bases().is_empty());
        assert!(sim.live_collections().is_empty());
        assert!(sim.live_search_policies().is_empty());
    }

    #[tokio::test]
    async fn supervisor_is_deleted_first() {
        let (sim, cleanup) = deployed().await;
        let report = cleanup.run().await;
        let (stage, agents) = &report.stages[0];
        assert_eq!(*stage, CleanupStage::Agents);
        let agents = agents.as_ref().unwrap();
        assert_eq!(agents.deleted[0], cleanup.ctx.names.supervisor_agent);
        assert_eq!(agents.deleted.len(), 4);
        assert!(sim.live_agents().is_empty());
    }

    #[test]
    fn only_yes_confirms() {
        for (input, expected) in [
            ("yes\n", true),
            ("YES\n", true),
            ("  yes  \n", true),
            ("y\n", false),
            ("no\n", false),
            ("", false),
        ] {
            let mut out = Vec::new();
            assert_eq!(confirm(input.as_bytes(), &mut out).unwrap(), expected, "{:?}", input);
            assert!(String::from_utf8(out).unwrap().contains("(yes/no)"));
        }
    }
}
