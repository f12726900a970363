//! Feature dependency graph engine.
//!
//! Keeps a project's dependency relation acyclic under arbitrary edge
//! insertion order and evaluates readiness. The decision logic is pure over
//! a loaded feature snapshot; [`DependencyGraph`] wraps it with storage
//! round-trips.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::storage::{Database, FeatureRow, FeatureStatus};

/// Dependency graph operations over a project's features.
#[derive(Clone)]
pub struct DependencyGraph {
    db: Database,
}

impl DependencyGraph {
    /// Create a graph engine backed by the given database.
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Add a dependency edge: `feature_id` will require `depends_on` to pass.
    ///
    /// Rejects self-loops immediately. Otherwise loads the project's
    /// adjacency and walks breadth-first from `depends_on` along existing
    /// dependency edges; if `feature_id` is reachable the new edge would
    /// close a cycle and the call fails with a conflict and nothing is
    /// mutated. Adding an edge that already exists is a no-op.
    pub async fn add_dependency(&self, feature_id: &str, depends_on: &str) -> EngineResult<()> {
        if feature_id == depends_on {
            return Err(EngineError::Validation(format!(
                "feature {feature_id} cannot depend on itself"
            )));
        }

        let feature = self.require_feature(feature_id).await?;
        let target = self.require_feature(depends_on).await?;
        if feature.project_id != target.project_id {
            return Err(EngineError::Validation(format!(
                "features {feature_id} and {depends_on} belong to different projects"
            )));
        }

        let mut dependencies = feature.dependency_ids();
        if dependencies.iter().any(|d| d == depends_on) {
            debug!(feature_id, depends_on, "Dependency already present");
            return Ok(());
        }

        let features = self.db.project_features(&feature.project_id).await?;
        if reaches(&features, depends_on, feature_id) {
            return Err(EngineError::Conflict(format!(
                "dependency {feature_id} -> {depends_on} would create a cycle"
            )));
        }

        dependencies.push(depends_on.to_string());
        self.db
            .set_feature_dependencies(feature_id, &dependencies)
            .await?;

        info!(feature_id, depends_on, "Dependency added");
        Ok(())
    }

    /// Remove a dependency edge. Unconditional set removal, no cycle check.
    pub async fn remove_dependency(&self, feature_id: &str, depends_on: &str) -> EngineResult<()> {
        let feature = self.require_feature(feature_id).await?;

        let mut dependencies = feature.dependency_ids();
        let before = dependencies.len();
        dependencies.retain(|d| d != depends_on);
        if dependencies.len() == before {
            return Ok(());
        }

        self.db
            .set_feature_dependencies(feature_id, &dependencies)
            .await?;

        info!(feature_id, depends_on, "Dependency removed");
        Ok(())
    }

    /// All ready features of a project, ascending by priority (ties by
    /// creation time, so claim order is stable).
    pub async fn ready_features(&self, project_id: &str) -> EngineResult<Vec<FeatureRow>> {
        let features = self.db.project_features(project_id).await?;
        Ok(ready_set(features))
    }

    async fn require_feature(&self, id: &str) -> EngineResult<FeatureRow> {
        self.db
            .get_feature(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("feature {id}")))
    }
}

/// Whether `to` is reachable from `from` along existing dependency edges.
fn reaches(features: &[FeatureRow], from: &str, to: &str) -> bool {
    let adjacency: HashMap<&str, Vec<String>> = features
        .iter()
        .map(|f| (f.id.as_str(), f.dependency_ids()))
        .collect();

    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut visited: HashSet<&str> = HashSet::new();
    queue.push_back(from);

    while let Some(current) = queue.pop_front() {
        if current == to {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(deps) = adjacency.get(current) {
            for dep in deps {
                queue.push_back(dep.as_str());
            }
        }
    }

    false
}

/// A feature is ready iff it is pending and every dependency maps to a
/// feature whose status is passing. Missing targets or any other status make
/// it not-ready (fails open toward "blocked").
fn is_ready(feature: &FeatureRow, by_id: &HashMap<&str, &FeatureRow>) -> bool {
    if feature.status != FeatureStatus::Pending.as_str() {
        return false;
    }
    feature.dependency_ids().iter().all(|dep| {
        by_id
            .get(dep.as_str())
            .is_some_and(|f| f.status == FeatureStatus::Passing.as_str())
    })
}

/// Filter a project snapshot down to its ready features, in claim order.
fn ready_set(features: Vec<FeatureRow>) -> Vec<FeatureRow> {
    let by_id: HashMap<&str, &FeatureRow> =
        features.iter().map(|f| (f.id.as_str(), f)).collect();

    let mut ready: Vec<FeatureRow> = features
        .iter()
        .filter(|f| is_ready(f, &by_id))
        .cloned()
        .collect();
    ready.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
    ready
}
