//! Feature claim engine.
//!
//! The pending → `in_progress` transition with ownership assignment. The
//! conditional update in storage is the only concurrency control: under N
//! racing callers exactly one lands each feature, the rest fall through to
//! the next candidate.

use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::graph::DependencyGraph;
use crate::storage::{Database, FeatureRow};

/// Atomic claiming and status transitions for features.
#[derive(Clone)]
pub struct ClaimEngine {
    db: Database,
    graph: DependencyGraph,
}

impl ClaimEngine {
    /// Create a claim engine backed by the given database.
    pub fn new(db: Database) -> Self {
        let graph = DependencyGraph::new(db.clone());
        Self { db, graph }
    }

    /// Claim the most urgent ready feature of a project for an agent.
    ///
    /// Walks the ready set in priority order attempting the conditional
    /// pending → `in_progress` transition; a lost race moves on to the next
    /// candidate. Returns `Ok(None)` when nothing is available, which is a
    /// normal outcome, not an error.
    pub async fn claim_feature(
        &self,
        project_id: &str,
        agent_id: &str,
    ) -> EngineResult<Option<FeatureRow>> {
        let ready = self.graph.ready_features(project_id).await?;

        for candidate in ready {
            if self.db.try_claim_feature(&candidate.id, agent_id).await? {
                info!(
                    project_id,
                    agent_id,
                    feature_id = %candidate.id,
                    "Feature claimed"
                );
                let claimed = self
                    .db
                    .get_feature(&candidate.id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("feature {}", candidate.id)))?;
                return Ok(Some(claimed));
            }
            // Lost the race to a concurrent caller; try the next candidate.
            debug!(feature_id = %candidate.id, agent_id, "Claim lost, moving on");
        }

        Ok(None)
    }

    /// Mark a feature passing: stamps completion, clears assignment.
    pub async fn mark_feature_passing(&self, feature_id: &str) -> EngineResult<()> {
        if !self.db.set_feature_passing(feature_id).await? {
            return Err(EngineError::NotFound(format!("feature {feature_id}")));
        }
        info!(feature_id, "Feature passing");
        Ok(())
    }

    /// Mark a feature failing: clears assignment. The feature stays failing
    /// until an operator intervenes; nothing is requeued automatically.
    pub async fn mark_feature_failing(&self, feature_id: &str) -> EngineResult<()> {
        if !self.db.set_feature_failing(feature_id).await? {
            return Err(EngineError::NotFound(format!("feature {feature_id}")));
        }
        info!(feature_id, "Feature failing");
        Ok(())
    }

    /// Directly assign a feature to an agent, bypassing ready-set ordering.
    /// For explicit user-driven assignment.
    pub async fn mark_feature_in_progress(
        &self,
        feature_id: &str,
        agent_id: &str,
    ) -> EngineResult<()> {
        if !self.db.set_feature_in_progress(feature_id, agent_id).await? {
            return Err(EngineError::NotFound(format!("feature {feature_id}")));
        }
        info!(feature_id, agent_id, "Feature manually assigned");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::NewFeature;

    fn new_feature(id: &str, priority: i64, deps: &[&str]) -> NewFeature {
        NewFeature {
            id: id.to_string(),
            name: id.to_string(),
            priority,
            dependencies: deps.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    async fn engine_with(features: &[NewFeature]) -> ClaimEngine {
        let db = Database::open_in_memory().await.unwrap();
        db.create_features("proj", features).await.unwrap();
        ClaimEngine::new(db)
    }

    #[tokio::test]
    async fn claims_most_urgent_ready_feature() {
        let engine = engine_with(&[
            new_feature("urgent", 1, &[]),
            new_feature("later", 5, &[]),
        ])
        .await;

        let claimed = engine.claim_feature("proj", "agent-a").await.unwrap();
        assert_eq!(claimed.unwrap().id, "urgent");
    }

    #[tokio::test]
    async fn empty_ready_set_returns_none() {
        let engine = engine_with(&[new_feature("blocked", 1, &["ghost"])]).await;
        let claimed = engine.claim_feature("proj", "agent-a").await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn second_caller_moves_to_next_candidate() {
        let engine = engine_with(&[new_feature("first", 1, &[]), new_feature("second", 2, &[])])
            .await;

        let a = engine.claim_feature("proj", "agent-a").await.unwrap();
        let b = engine.claim_feature("proj", "agent-b").await.unwrap();
        assert_eq!(a.unwrap().id, "first");
        assert_eq!(b.unwrap().id, "second");
    }

    #[tokio::test]
    async fn concurrent_callers_never_double_assign() {
        let engine = engine_with(&[new_feature("only", 1, &[])]).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .claim_feature("proj", &format!("agent-{i}"))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one concurrent caller may win");
    }

    #[tokio::test]
    async fn passing_unblocks_dependents() {
        let engine = engine_with(&[new_feature("f1", 1, &[]), new_feature("f2", 1, &["f1"])])
            .await;

        let ready = engine.graph.ready_features("proj").await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "f1");

        engine.claim_feature("proj", "agent-a").await.unwrap();
        engine.mark_feature_passing("f1").await.unwrap();

        let ready = engine.graph.ready_features("proj").await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "f2");
    }

    #[tokio::test]
    async fn failing_is_not_retried_automatically() {
        let engine = engine_with(&[new_feature("f1", 1, &[])]).await;

        engine.claim_feature("proj", "agent-a").await.unwrap();
        engine.mark_feature_failing("f1").await.unwrap();

        let claimed = engine.claim_feature("proj", "agent-b").await.unwrap();
        assert!(claimed.is_none(), "failing features never re-enter the ready set");

        let feature = engine.db.get_feature("f1").await.unwrap().unwrap();
        assert_eq!(feature.status, "failing");
        assert!(feature.assigned_agent_id.is_none());
    }

    #[tokio::test]
    async fn manual_assignment_bypasses_readiness() {
        let engine = engine_with(&[new_feature("blocked", 1, &["ghost"])]).await;

        engine
            .mark_feature_in_progress("blocked", "agent-a")
            .await
            .unwrap();

        let feature = engine.db.get_feature("blocked").await.unwrap().unwrap();
        assert_eq!(feature.status, "in_progress");
        assert_eq!(feature.assigned_agent_id.as_deref(), Some("agent-a"));
    }

    #[tokio::test]
    async fn unknown_feature_is_not_found() {
        let engine = engine_with(&[]).await;
        let err = engine.mark_feature_passing("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
