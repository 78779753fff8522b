//! Ontology Annealing
//!
//! Periodic self-organization: high-degree concepts get promoted to anchor
//! their own ontology, and ontologies whose protection score collapses get
//! demoted back into their highest-affinity neighbor. Every candidate goes
//! to the reasoning provider with its numeric scores; confirmed candidates
//! become proposals, approved either by a human (hitl) or automatically
//! (autonomous) within the same cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{AutomationLevel, ConfigRegistry};
use crate::embeddings::cosine_similarity;
use crate::error::{EngineError, Result};
use crate::jobs::launchers::ANNEALING_LAST_EPOCH_KEY;
use crate::jobs::{JobQueue, JobSpec, JobType};
use crate::providers::{DecisionContext, ReasoningProvider, RetryPolicy, with_retries};
use crate::storage::GraphStore;

/// Ontologies under this protection score become demotion candidates
pub const DEMOTION_PROTECTION_THRESHOLD: f64 = 0.15;

/// Concepts at or above this total degree become promotion candidates
pub const PROMOTION_DEGREE_THRESHOLD: i64 = 10;

/// Member concepts sampled for the coherence estimate
const COHERENCE_SAMPLE: usize = 20;

/// Size limit on hot-view refresh after executions
const HOT_VIEW_LIMIT: usize = 100;

// ============================================================================
// TYPES
// ============================================================================

/// Proposal kind
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalKind {
    Promote,
    Demote,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalKind::Promote => "promote",
            ProposalKind::Demote => "demote",
        }
    }
}

impl std::str::FromStr for ProposalKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "promote" => Ok(ProposalKind::Promote),
            "demote" => Ok(ProposalKind::Demote),
            _ => Err(format!("Unknown proposal kind: {}", s)),
        }
    }
}

/// Proposal lifecycle status
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    #[default]
    Pending,
    Approved,
    Executed,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Executed => "executed",
            ProposalStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "approved" => Ok(ProposalStatus::Approved),
            "executed" => Ok(ProposalStatus::Executed),
            "rejected" => Ok(ProposalStatus::Rejected),
            _ => Err(format!("Unknown proposal status: {}", s)),
        }
    }
}

/// A promotion or demotion proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnealingProposal {
    pub proposal_id: String,
    pub kind: ProposalKind,
    /// Concept id for promotions, ontology name for demotions
    pub target_id: String,
    /// Affected or receiving ontology
    pub ontology: Option<String>,
    pub scores: serde_json::Value,
    pub rationale: Option<String>,
    pub status: ProposalStatus,
    pub reviewer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Per-ontology structural metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OntologyMetrics {
    pub ontology: String,
    /// Sources plus evidence instances
    pub mass: i64,
    /// Mean pairwise similarity of sampled member concepts
    pub coherence: f64,
    #[serde(skip)]
    pub centroid: Vec<f32>,
    /// Coherence damped for tiny ontologies; anchored ones keep a floor
    pub protection: f64,
}

/// Centroid affinity between two ontologies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OntologyAffinity {
    pub a: String,
    pub b: String,
    pub affinity: f32,
}

/// Result of one annealing cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnealingReport {
    pub epoch: i64,
    pub metrics: Vec<OntologyMetrics>,
    pub affinities: Vec<OntologyAffinity>,
    pub proposals: Vec<AnnealingProposal>,
    /// Proposals auto-approved under autonomous automation
    pub auto_approved: usize,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Annealing cycle driver and proposal executor
pub struct AnnealingManager {
    store: Arc<GraphStore>,
    reasoning: Arc<dyn ReasoningProvider>,
    config: Arc<ConfigRegistry>,
    retry: RetryPolicy,
}

impl AnnealingManager {
    pub fn new(
        store: Arc<GraphStore>,
        reasoning: Arc<dyn ReasoningProvider>,
        config: Arc<ConfigRegistry>,
    ) -> Self {
        Self {
            store,
            reasoning,
            config,
            retry: RetryPolicy::default(),
        }
    }

    // ========================================================================
    // METRICS
    // ========================================================================

    /// Compute mass, coherence, centroid and protection for one ontology
    pub fn compute_metrics(&self, ontology: &str) -> Result<OntologyMetrics> {
        let record = self
            .store
            .get_ontology(ontology)?
            .ok_or_else(|| EngineError::NotFound(format!("ontology {}", ontology)))?;

        let (source_count, instance_count, member_ids) = {
            let reader = self.store.reader_guard()?;
            let source_count: i64 = reader.query_row(
                "SELECT COUNT(*) FROM sources WHERE ontology = ?1",
                params![ontology],
                |r| r.get(0),
            )?;
            let instance_count: i64 = reader.query_row(
                "SELECT COUNT(*) FROM instances i JOIN sources s ON s.source_id = i.source_id
                 WHERE s.ontology = ?1",
                params![ontology],
                |r| r.get(0),
            )?;
            let mut stmt = reader.prepare(
                "SELECT DISTINCT i.concept_id FROM instances i
                 JOIN sources s ON s.source_id = i.source_id
                 WHERE s.ontology = ?1 ORDER BY i.concept_id LIMIT ?2",
            )?;
            let member_ids: Vec<String> = stmt
                .query_map(params![ontology, COHERENCE_SAMPLE as i64], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            (source_count, instance_count, member_ids)
        };

        let mut embeddings = Vec::new();
        for concept_id in &member_ids {
            if let Some(vector) = self.store.get_concept_embedding(concept_id)? {
                if vector.len() == self.config.dimension() {
                    embeddings.push(vector);
                }
            }
        }

        let coherence = mean_pairwise_similarity(&embeddings);
        let centroid = mean_vector(&embeddings, self.config.dimension());
        let mass = source_count + instance_count;

        let base = coherence * (1.0 - 1.0 / (1.0 + mass as f64 / 10.0));
        let protection = if record.anchor_concept_id.is_some() {
            base.max(0.1)
        } else {
            base
        };

        Ok(OntologyMetrics {
            ontology: ontology.to_string(),
            mass,
            coherence,
            centroid,
            protection,
        })
    }

    // ========================================================================
    // CYCLE
    // ========================================================================

    /// Run one annealing cycle at the given epoch
    ///
    /// Records the epoch at the end so the launcher's delta check cannot
    /// fire a second cycle for the same window.
    pub async fn run_cycle(&self, queue: &JobQueue, epoch: i64) -> Result<AnnealingReport> {
        let ontologies = self.store.list_ontologies()?;
        let mut metrics = Vec::new();
        for ontology in &ontologies {
            metrics.push(self.compute_metrics(&ontology.name)?);
        }

        let mut affinities = Vec::new();
        for i in 0..metrics.len() {
            for j in (i + 1)..metrics.len() {
                if metrics[i].centroid.is_empty() || metrics[j].centroid.is_empty() {
                    continue;
                }
                affinities.push(OntologyAffinity {
                    a: metrics[i].ontology.clone(),
                    b: metrics[j].ontology.clone(),
                    affinity: cosine_similarity(&metrics[i].centroid, &metrics[j].centroid),
                });
            }
        }

        let settings = self.config.settings();
        let mut proposals = Vec::new();
        let mut budget = settings.annealing_max_proposals;

        // Demotions: weak ontologies with somewhere to go
        for metric in &metrics {
            if budget == 0 {
                break;
            }
            if metric.protection >= DEMOTION_PROTECTION_THRESHOLD {
                continue;
            }
            let Some(neighbor) = best_neighbor(&metric.ontology, &affinities) else {
                continue;
            };
            if let Some(proposal) = self
                .propose(
                    ProposalKind::Demote,
                    &metric.ontology,
                    Some(&neighbor),
                    serde_json::json!({
                        "protection": metric.protection,
                        "coherence": metric.coherence,
                        "mass": metric.mass,
                        "neighborAffinity": best_affinity(&metric.ontology, &affinities),
                    }),
                )
                .await?
            {
                proposals.push(proposal);
                budget -= 1;
            }
        }

        // Promotions: high-degree concepts not yet anchoring anything
        let candidates = self.promotion_candidates(budget)?;
        for (concept_id, label, degree) in candidates {
            if budget == 0 {
                break;
            }
            if let Some(proposal) = self
                .propose(
                    ProposalKind::Promote,
                    &concept_id,
                    None,
                    serde_json::json!({
                        "label": label,
                        "degree": degree,
                        "degreeThreshold": PROMOTION_DEGREE_THRESHOLD,
                    }),
                )
                .await?
            {
                proposals.push(proposal);
                budget -= 1;
            }
        }

        // Autonomous mode approves and schedules execution inside the cycle
        let mut auto_approved = 0usize;
        if settings.annealing_automation == AutomationLevel::Autonomous {
            for proposal in &proposals {
                self.approve_proposal(&proposal.proposal_id, "autonomous")?;
                queue.enqueue(JobSpec::system(
                    JobType::AnnealingExecute,
                    serde_json::json!({ "proposalId": proposal.proposal_id }),
                ))?;
                auto_approved += 1;
            }
        }

        self.store
            .meta_set(ANNEALING_LAST_EPOCH_KEY, &epoch.to_string())?;
        tracing::info!(
            epoch,
            proposals = proposals.len(),
            auto_approved,
            "annealing cycle complete"
        );

        Ok(AnnealingReport {
            epoch,
            metrics,
            affinities,
            proposals,
            auto_approved,
        })
    }

    /// Concepts with degree over the threshold that anchor nothing yet
    fn promotion_candidates(&self, limit: usize) -> Result<Vec<(String, String, i64)>> {
        let reader = self.store.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT concept_id, label, degree FROM (
                 SELECT c.concept_id, c.label,
                        (SELECT COUNT(*) FROM edges e
                         WHERE e.src_concept_id = c.concept_id
                            OR e.dst_concept_id = c.concept_id) AS degree
                 FROM concepts c
                 WHERE c.concept_id NOT IN
                       (SELECT anchor_concept_id FROM ontologies
                        WHERE anchor_concept_id IS NOT NULL)
             )
             WHERE degree >= ?1
             ORDER BY degree DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![PROMOTION_DEGREE_THRESHOLD, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Ask the provider about one candidate; None when it rejects
    async fn propose(
        &self,
        kind: ProposalKind,
        target_id: &str,
        ontology: Option<&str>,
        scores: serde_json::Value,
    ) -> Result<Option<AnnealingProposal>> {
        let context = DecisionContext {
            subject: format!("{} {}", kind.as_str(), target_id),
            action_space: vec![kind.as_str().to_string(), "reject".to_string()],
            scores: scores.clone(),
            summary: match kind {
                ProposalKind::Promote => format!(
                    "concept {} is a high-degree hub; promote it to an ontology anchor?",
                    target_id
                ),
                ProposalKind::Demote => format!(
                    "ontology {} fell under the protection threshold; fold it into {}?",
                    target_id,
                    ontology.unwrap_or("its neighbor")
                ),
            },
        };

        let decision = with_retries(&self.retry, "annealing_decision", || {
            let reasoning = Arc::clone(&self.reasoning);
            let context = context.clone();
            async move { reasoning.decide(&context).await }
        })
        .await?;

        if decision.action != kind.as_str() {
            tracing::debug!(target_id, kind = kind.as_str(), "candidate rejected");
            return Ok(None);
        }

        let proposal = AnnealingProposal {
            proposal_id: format!("p_{}", Uuid::new_v4().simple()),
            kind,
            target_id: target_id.to_string(),
            ontology: ontology.map(str::to_string),
            scores,
            rationale: Some(decision.rationale),
            status: ProposalStatus::Pending,
            reviewer: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        self.insert_proposal(&proposal)?;
        Ok(Some(proposal))
    }

    // ========================================================================
    // PROPOSAL PERSISTENCE
    // ========================================================================

    fn insert_proposal(&self, proposal: &AnnealingProposal) -> Result<()> {
        let writer = self.store.writer_guard()?;
        writer.execute(
            "INSERT INTO annealing_proposals
             (proposal_id, kind, target_id, ontology, scores, rationale, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                proposal.proposal_id,
                proposal.kind.as_str(),
                proposal.target_id,
                proposal.ontology,
                serde_json::to_string(&proposal.scores)?,
                proposal.rationale,
                proposal.status.as_str(),
                proposal.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn row_to_proposal(row: &rusqlite::Row) -> rusqlite::Result<AnnealingProposal> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let scores: String = row.get("scores")?;
        let decided: Option<String> = row.get("decided_at")?;
        Ok(AnnealingProposal {
            proposal_id: row.get("proposal_id")?,
            kind: kind.parse().unwrap_or(ProposalKind::Promote),
            target_id: row.get("target_id")?,
            ontology: row.get("ontology")?,
            scores: serde_json::from_str(&scores).unwrap_or(serde_json::Value::Null),
            rationale: row.get("rationale")?,
            status: status.parse().unwrap_or_default(),
            reviewer: row.get("reviewer")?,
            created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>("created_at")?)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            decided_at: decided.and_then(|d| {
                DateTime::parse_from_rfc3339(&d)
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok()
            }),
        })
    }

    /// Get a proposal by id
    pub fn get_proposal(&self, proposal_id: &str) -> Result<Option<AnnealingProposal>> {
        let reader = self.store.reader_guard()?;
        let mut stmt =
            reader.prepare("SELECT * FROM annealing_proposals WHERE proposal_id = ?1")?;
        Ok(stmt
            .query_row(params![proposal_id], Self::row_to_proposal)
            .optional()?)
    }

    /// List proposals by status
    pub fn list_proposals(&self, status: Option<ProposalStatus>) -> Result<Vec<AnnealingProposal>> {
        let reader = self.store.reader_guard()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM annealing_proposals
             WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], Self::row_to_proposal)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn set_proposal_status(
        &self,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
        reviewer: Option<&str>,
    ) -> Result<()> {
        let writer = self.store.writer_guard()?;
        let changed = writer.execute(
            "UPDATE annealing_proposals
             SET status = ?1, reviewer = COALESCE(?2, reviewer), decided_at = ?3
             WHERE proposal_id = ?4 AND status = ?5",
            params![
                to.as_str(),
                reviewer,
                Utc::now().to_rfc3339(),
                proposal_id,
                from.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::Conflict(format!(
                "proposal {} is not {}",
                proposal_id,
                from.as_str()
            )));
        }
        Ok(())
    }

    /// Approve a pending proposal
    pub fn approve_proposal(&self, proposal_id: &str, reviewer: &str) -> Result<()> {
        self.set_proposal_status(
            proposal_id,
            ProposalStatus::Pending,
            ProposalStatus::Approved,
            Some(reviewer),
        )
    }

    /// Reject a pending proposal
    pub fn reject_proposal(&self, proposal_id: &str, reviewer: &str) -> Result<()> {
        self.set_proposal_status(
            proposal_id,
            ProposalStatus::Pending,
            ProposalStatus::Rejected,
            Some(reviewer),
        )
    }

    // ========================================================================
    // EXECUTION
    // ========================================================================

    /// Execute an approved proposal
    ///
    /// Membership moves are a single transaction; hot views refresh after.
    pub fn execute_proposal(&self, proposal_id: &str) -> Result<()> {
        let proposal = self
            .get_proposal(proposal_id)?
            .ok_or_else(|| EngineError::NotFound(format!("proposal {}", proposal_id)))?;
        if proposal.status != ProposalStatus::Approved {
            return Err(EngineError::Conflict(format!(
                "proposal {} is {}, not approved",
                proposal_id,
                proposal.status.as_str()
            )));
        }

        match proposal.kind {
            ProposalKind::Promote => self.execute_promotion(&proposal)?,
            ProposalKind::Demote => self.execute_demotion(&proposal)?,
        }

        self.set_proposal_status(
            proposal_id,
            ProposalStatus::Approved,
            ProposalStatus::Executed,
            None,
        )?;
        self.store.refresh_hot_views(HOT_VIEW_LIMIT)?;
        Ok(())
    }

    /// Promote: the concept anchors a new ontology and pulls its evidence in
    fn execute_promotion(&self, proposal: &AnnealingProposal) -> Result<()> {
        let concept = self
            .store
            .get_concept(&proposal.target_id)?
            .ok_or_else(|| EngineError::NotFound(format!("concept {}", proposal.target_id)))?;
        let ontology_name = ontology_slug(&concept.label);
        self.store.ensure_ontology(&ontology_name)?;

        {
            let writer = self.store.writer_guard()?;
            let tx = writer.unchecked_transaction()?;
            tx.execute(
                "UPDATE sources SET ontology = ?1
                 WHERE source_id IN (SELECT source_id FROM instances WHERE concept_id = ?2)",
                params![ontology_name, proposal.target_id],
            )?;
            tx.execute(
                "UPDATE ontologies SET anchor_concept_id = ?1, updated_at = ?2 WHERE name = ?3",
                params![proposal.target_id, Utc::now().to_rfc3339(), ontology_name],
            )?;
            tx.commit()?;
        }
        tracing::info!(
            concept = proposal.target_id,
            ontology = ontology_name,
            "promoted concept to ontology anchor"
        );
        Ok(())
    }

    /// Demote: fold the weak ontology's sources into its neighbor
    fn execute_demotion(&self, proposal: &AnnealingProposal) -> Result<()> {
        let neighbor = proposal.ontology.as_deref().ok_or_else(|| {
            EngineError::Internal("demotion proposal without a receiving ontology".into())
        })?;
        if self.store.get_ontology(neighbor)?.is_none() {
            return Err(EngineError::NotFound(format!("ontology {}", neighbor)));
        }

        {
            let writer = self.store.writer_guard()?;
            let tx = writer.unchecked_transaction()?;
            tx.execute(
                "UPDATE sources SET ontology = ?1 WHERE ontology = ?2",
                params![neighbor, proposal.target_id],
            )?;
            tx.execute(
                "DELETE FROM ontologies WHERE name = ?1",
                params![proposal.target_id],
            )?;
            tx.commit()?;
        }
        tracing::info!(
            ontology = proposal.target_id,
            into = neighbor,
            "demoted ontology into neighbor"
        );
        Ok(())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Mean pairwise cosine similarity; 1.0 for fewer than two vectors
fn mean_pairwise_similarity(embeddings: &[Vec<f32>]) -> f64 {
    if embeddings.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0f64;
    let mut pairs = 0usize;
    for i in 0..embeddings.len() {
        for j in (i + 1)..embeddings.len() {
            total += cosine_similarity(&embeddings[i], &embeddings[j]) as f64;
            pairs += 1;
        }
    }
    total / pairs as f64
}

/// Mean of a set of vectors; empty when none are usable
fn mean_vector(embeddings: &[Vec<f32>], dimension: usize) -> Vec<f32> {
    if embeddings.is_empty() {
        return Vec::new();
    }
    let mut sum = vec![0.0f32; dimension];
    for embedding in embeddings {
        for (acc, v) in sum.iter_mut().zip(embedding.iter()) {
            *acc += v;
        }
    }
    for value in sum.iter_mut() {
        *value /= embeddings.len() as f32;
    }
    sum
}

/// Highest-affinity neighbor of an ontology
fn best_neighbor(ontology: &str, affinities: &[OntologyAffinity]) -> Option<String> {
    affinities
        .iter()
        .filter_map(|aff| {
            if aff.a == ontology {
                Some((aff.b.clone(), aff.affinity))
            } else if aff.b == ontology {
                Some((aff.a.clone(), aff.affinity))
            } else {
                None
            }
        })
        .max_by(|x, y| x.1.partial_cmp(&y.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(name, _)| name)
}

fn best_affinity(ontology: &str, affinities: &[OntologyAffinity]) -> f32 {
    affinities
        .iter()
        .filter(|aff| aff.a == ontology || aff.b == ontology)
        .map(|aff| aff.affinity)
        .fold(0.0, f32::max)
}

/// Ontology name derived from a concept label
fn ontology_slug(label: &str) -> String {
    let slug: String = label
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = slug.trim_matches('-').to_string();
    if trimmed.is_empty() { "anchored".to_string() } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiProviderConfig, EmbeddingConfig, EngineSettings, Precision};
    use crate::embeddings::normalize_in_place;
    use crate::graph::Source;
    use crate::providers::ProviderCapability;
    use crate::providers::mock::ScriptedReasoningProvider;
    use crate::vocab::install_builtin_vocab;

    const DIM: usize = 8;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<GraphStore>,
        queue: JobQueue,
        reasoning: Arc<ScriptedReasoningProvider>,
        manager: AnnealingManager,
    }

    fn setup(automation: AutomationLevel) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = EngineSettings::default();
        settings.annealing_automation = automation;
        let config = Arc::new(ConfigRegistry::new(
            EmbeddingConfig {
                provider: "static-test".into(),
                model_name: "m".into(),
                dimension: DIM,
                precision: Precision::Float32,
            },
            AiProviderConfig {
                provider: "scripted-test".into(),
                model_name: "s".into(),
                capabilities: vec![ProviderCapability::Decide],
            },
            settings,
        ));
        let store = Arc::new(
            GraphStore::open(Some(dir.path().join("test.db")), &config.embedding()).unwrap(),
        );
        install_builtin_vocab(&store).unwrap();
        let reasoning = Arc::new(ScriptedReasoningProvider::new());
        let queue = JobQueue::new(Arc::clone(&store));
        let manager = AnnealingManager::new(
            Arc::clone(&store),
            Arc::clone(&reasoning) as Arc<dyn ReasoningProvider>,
            config,
        );
        Fixture {
            _dir: dir,
            store,
            queue,
            reasoning,
            manager,
        }
    }

    fn add_concept(store: &GraphStore, label: &str, mut v: Vec<f32>) -> String {
        normalize_in_place(&mut v);
        store
            .upsert_concept(label, &[], &v, None, 0.9999)
            .unwrap()
            .concept_id
    }

    fn add_source(store: &GraphStore, ontology: &str, source_id: &str) {
        store.ensure_ontology(ontology).unwrap();
        store
            .insert_source(&Source {
                source_id: source_id.into(),
                ontology: ontology.into(),
                document: "doc.md".into(),
                paragraph: 0,
                full_text: format!("text of {}", source_id),
                content_hash: Some(format!("hash-{}", source_id)),
                created_at: Utc::now(),
            })
            .unwrap();
    }

    fn basis(axis: usize) -> Vec<f32> {
        let mut v = vec![0.05f32; DIM];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_metrics_reflect_mass_and_coherence() {
        let f = setup(AutomationLevel::Hitl);

        // Tight cluster: two nearly-identical members, three sources
        for i in 0..3 {
            add_source(&f.store, "tight", &format!("s_t{}", i));
        }
        let a = add_concept(&f.store, "A", basis(0));
        let b = add_concept(&f.store, "B", {
            let mut v = basis(0);
            v[1] = 0.1;
            v
        });
        f.store.add_instance(&a, "s_t0", "quote a", 0).unwrap();
        f.store.add_instance(&b, "s_t1", "quote b", 0).unwrap();

        let tight = f.manager.compute_metrics("tight").unwrap();
        assert_eq!(tight.mass, 5);
        assert!(tight.coherence > 0.9);
        assert!(tight.protection > 0.0);
        assert_eq!(tight.centroid.len(), DIM);

        // Empty ontology: no members, mass zero, damped to nothing
        f.store.ensure_ontology("empty").unwrap();
        let empty = f.manager.compute_metrics("empty").unwrap();
        assert_eq!(empty.mass, 0);
        assert_eq!(empty.protection, 0.0);
        assert!(empty.centroid.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_proposes_demotion_for_weak_ontology() {
        let f = setup(AutomationLevel::Hitl);

        // A healthy neighbor with members
        for i in 0..5 {
            add_source(&f.store, "healthy", &format!("s_h{}", i));
        }
        let a = add_concept(&f.store, "Hub", basis(0));
        f.store.add_instance(&a, "s_h0", "quote", 0).unwrap();

        // A weak ontology: one member with scattered similarity
        add_source(&f.store, "weak", "s_w0");
        let w1 = add_concept(&f.store, "W1", basis(1));
        let w2 = add_concept(&f.store, "W2", {
            let mut v = basis(2);
            v[1] = -0.8;
            v
        });
        f.store.add_instance(&w1, "s_w0", "quote w1", 0).unwrap();
        f.store.add_instance(&w2, "s_w0", "quote w2", 0).unwrap();

        let weak = f.manager.compute_metrics("weak").unwrap();
        assert!(weak.protection < DEMOTION_PROTECTION_THRESHOLD);

        f.reasoning.push_decision("demote", "low coherence, tiny mass");
        let report = f.manager.run_cycle(&f.queue, 5).await.unwrap();

        let demotions: Vec<_> = report
            .proposals
            .iter()
            .filter(|p| p.kind == ProposalKind::Demote)
            .collect();
        assert_eq!(demotions.len(), 1);
        assert_eq!(demotions[0].target_id, "weak");
        assert_eq!(demotions[0].status, ProposalStatus::Pending);
        assert_eq!(report.auto_approved, 0);

        // Provider saw numeric context
        let calls = f.reasoning.decide_calls.lock().unwrap();
        assert!(calls[0].scores.get("protection").is_some());

        // Epoch recorded so the launcher gate closes
        assert_eq!(f.store.meta_i64(ANNEALING_LAST_EPOCH_KEY).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_promotion_candidates_need_degree_threshold() {
        let f = setup(AutomationLevel::Hitl);
        add_source(&f.store, "default", "s_0");

        // A hub with degree >= 10
        let hub = add_concept(&f.store, "Central Hub", basis(0));
        for i in 0..10 {
            let other = add_concept(&f.store, &format!("Spoke {}", i), {
                let mut v = basis(1 + (i % 6));
                v[7] = 0.1 * i as f32;
                v
            });
            f.store
                .add_edge(&other, "RELATES_TO", &hub, 0.9, None)
                .unwrap();
        }

        f.reasoning.push_decision("promote", "clear hub structure");
        let report = f.manager.run_cycle(&f.queue, 1).await.unwrap();

        let promotions: Vec<_> = report
            .proposals
            .iter()
            .filter(|p| p.kind == ProposalKind::Promote)
            .collect();
        assert_eq!(promotions.len(), 1);
        assert_eq!(promotions[0].target_id, hub);
    }

    #[tokio::test]
    async fn test_provider_rejection_creates_no_proposal() {
        let f = setup(AutomationLevel::Hitl);
        add_source(&f.store, "default", "s_0");
        let hub = add_concept(&f.store, "Hub", basis(0));
        for i in 0..10 {
            let other = add_concept(&f.store, &format!("S{}", i), basis(1 + (i % 6)));
            f.store
                .add_edge(&other, "RELATES_TO", &hub, 0.9, None)
                .unwrap();
        }

        // Scripted default decision is neither promote nor demote
        let report = f.manager.run_cycle(&f.queue, 1).await.unwrap();
        assert!(report.proposals.is_empty());
        assert!(f.manager.list_proposals(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_autonomous_mode_approves_and_enqueues_execution() {
        let f = setup(AutomationLevel::Autonomous);
        add_source(&f.store, "default", "s_0");
        let hub = add_concept(&f.store, "Hub", basis(0));
        for i in 0..10 {
            let other = add_concept(&f.store, &format!("S{}", i), basis(1 + (i % 6)));
            f.store
                .add_edge(&other, "RELATES_TO", &hub, 0.9, None)
                .unwrap();
        }

        f.reasoning.push_decision("promote", "hub");
        let report = f.manager.run_cycle(&f.queue, 1).await.unwrap();
        assert_eq!(report.auto_approved, 1);

        let stored = f.manager.list_proposals(Some(ProposalStatus::Approved)).unwrap();
        assert_eq!(stored.len(), 1);

        let jobs = f
            .queue
            .list_jobs(Some(crate::jobs::JobStatus::Approved), 10)
            .unwrap();
        assert!(jobs.iter().any(|j| j.job_type == JobType::AnnealingExecute));
    }

    #[tokio::test]
    async fn test_execute_promotion_moves_evidence_sources() {
        let f = setup(AutomationLevel::Hitl);
        add_source(&f.store, "default", "s_0");
        add_source(&f.store, "default", "s_1");
        let hub = add_concept(&f.store, "Graph Theory", basis(0));
        f.store.add_instance(&hub, "s_0", "quote", 0).unwrap();
        for i in 0..10 {
            let other = add_concept(&f.store, &format!("S{}", i), basis(1 + (i % 6)));
            f.store
                .add_edge(&other, "RELATES_TO", &hub, 0.9, None)
                .unwrap();
        }

        f.reasoning.push_decision("promote", "hub");
        let report = f.manager.run_cycle(&f.queue, 1).await.unwrap();
        let proposal_id = report.proposals[0].proposal_id.clone();

        // Execution requires approval first
        assert!(matches!(
            f.manager.execute_proposal(&proposal_id),
            Err(EngineError::Conflict(_))
        ));
        f.manager.approve_proposal(&proposal_id, "reviewer").unwrap();
        f.manager.execute_proposal(&proposal_id).unwrap();

        let ontology = f.store.get_ontology("graph-theory").unwrap().unwrap();
        assert_eq!(ontology.anchor_concept_id.as_deref(), Some(hub.as_str()));
        // The evidencing source moved; the unrelated one stayed
        assert_eq!(f.store.get_source("s_0").unwrap().unwrap().ontology, "graph-theory");
        assert_eq!(f.store.get_source("s_1").unwrap().unwrap().ontology, "default");

        let executed = f.manager.get_proposal(&proposal_id).unwrap().unwrap();
        assert_eq!(executed.status, ProposalStatus::Executed);

        // Executing twice is a conflict, not a double move
        assert!(matches!(
            f.manager.execute_proposal(&proposal_id),
            Err(EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_demotion_folds_sources_into_neighbor() {
        let f = setup(AutomationLevel::Hitl);
        add_source(&f.store, "strong", "s_s0");
        add_source(&f.store, "weak", "s_w0");
        let a = add_concept(&f.store, "A", basis(0));
        let b = add_concept(&f.store, "B", basis(0));
        f.store.add_instance(&a, "s_s0", "quote", 0).unwrap();
        f.store.add_instance(&b, "s_w0", "quote", 0).unwrap();

        let proposal = AnnealingProposal {
            proposal_id: "p_test".into(),
            kind: ProposalKind::Demote,
            target_id: "weak".into(),
            ontology: Some("strong".into()),
            scores: serde_json::json!({}),
            rationale: None,
            status: ProposalStatus::Pending,
            reviewer: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        f.manager.insert_proposal(&proposal).unwrap();
        f.manager.approve_proposal("p_test", "reviewer").unwrap();
        f.manager.execute_proposal("p_test").unwrap();

        assert!(f.store.get_ontology("weak").unwrap().is_none());
        assert_eq!(f.store.get_source("s_w0").unwrap().unwrap().ontology, "strong");
    }

    #[test]
    fn test_ontology_slug() {
        assert_eq!(ontology_slug("Graph Theory"), "graph-theory");
        assert_eq!(ontology_slug("C++ / Rust!"), "c-----rust");
        assert_eq!(ontology_slug("***"), "anchored");
    }
}
