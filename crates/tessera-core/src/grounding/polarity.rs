//! Polarity Query
//!
//! User-defined axis analysis between two *concepts* (not vocabulary
//! types): projects candidate concepts onto the axis spanned by a positive
//! and a negative pole and reports positions, orthogonal distances,
//! directions and correlation with grounding.
//!
//! Runs directly against in-memory embeddings; no job queue involved.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embeddings::{cosine_similarity, difference, dot_product, norm};
use crate::error::{EngineError, Result};
use crate::grounding::GroundingEngine;
use crate::search::traversal;
use crate::storage::GraphStore;

/// Axis magnitude at or above which the axis is strong
pub const STRONG_AXIS_MAGNITUDE: f32 = 0.7;

/// Position beyond which a candidate leaves the neutral band
pub const DIRECTION_THRESHOLD: f32 = 0.3;

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Options for a polarity analysis
#[derive(Debug, Clone, Copy)]
pub struct PolarityOptions {
    /// Collect candidates by neighborhood traversal when none are given
    pub auto_discover: bool,
    pub max_candidates: usize,
    /// Traversal depth for auto-discovery
    pub max_hops: usize,
}

impl Default for PolarityOptions {
    fn default() -> Self {
        Self {
            auto_discover: true,
            max_candidates: 20,
            max_hops: 2,
        }
    }
}

/// Which side of the axis a candidate falls on
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Positive,
    Negative,
    Neutral,
}

/// Qualitative strength of the pole separation
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisQuality {
    Strong,
    Weak,
}

/// One candidate projected onto the axis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateProjection {
    pub concept_id: String,
    pub label: String,
    /// Parametric position scaled to [-1, 1]
    pub position: f32,
    /// Orthogonal distance from the axis line
    pub axis_distance: f32,
    pub direction: Direction,
    pub similarity_to_positive: f32,
    pub similarity_to_negative: f32,
    /// Default-axis grounding of the candidate
    pub grounding: f32,
}

/// Direction distribution over the candidate set
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionCounts {
    pub positive: usize,
    pub negative: usize,
    pub neutral: usize,
}

/// Aggregate statistics of an analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolarityStats {
    pub position_min: f32,
    pub position_max: f32,
    pub position_mean: f32,
    pub mean_axis_distance: f32,
    pub directions: DirectionCounts,
    /// Pearson correlation between position and grounding (n >= 3)
    pub pearson_r: Option<f64>,
    /// Two-tailed p-value for the correlation
    pub p_value: Option<f64>,
}

/// Full analysis result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolarityAnalysis {
    pub positive_pole: String,
    pub negative_pole: String,
    /// Euclidean distance between the pole embeddings
    pub magnitude: f32,
    pub axis_quality: AxisQuality,
    pub candidates: Vec<CandidateProjection>,
    pub stats: Option<PolarityStats>,
}

// ============================================================================
// POLARITY QUERY
// ============================================================================

/// Concept-pole polarity analysis
pub struct PolarityQuery {
    store: Arc<GraphStore>,
    grounding: Arc<GroundingEngine>,
}

impl PolarityQuery {
    pub fn new(store: Arc<GraphStore>, grounding: Arc<GroundingEngine>) -> Self {
        Self { store, grounding }
    }

    /// Analyze candidates along the axis between two pole concepts
    pub fn analyze(
        &self,
        positive_pole: &str,
        negative_pole: &str,
        candidates: Option<Vec<String>>,
        options: PolarityOptions,
    ) -> Result<PolarityAnalysis> {
        let pos = self.require_embedding(positive_pole)?;
        let neg = self.require_embedding(negative_pole)?;

        let delta = difference(&pos, &neg);
        let magnitude = norm(&delta);
        let axis_quality = if magnitude >= STRONG_AXIS_MAGNITUDE {
            AxisQuality::Strong
        } else {
            AxisQuality::Weak
        };

        // Coincident poles span no axis; report the degenerate geometry
        // rather than dividing by ~zero
        if magnitude < 1e-6 {
            return Ok(PolarityAnalysis {
                positive_pole: positive_pole.to_string(),
                negative_pole: negative_pole.to_string(),
                magnitude,
                axis_quality: AxisQuality::Weak,
                candidates: Vec::new(),
                stats: None,
            });
        }

        let axis: Vec<f32> = delta.iter().map(|d| d / magnitude).collect();

        let candidate_ids = match candidates {
            Some(ids) if !ids.is_empty() => ids,
            _ if options.auto_discover => {
                self.discover_candidates(positive_pole, negative_pole, &options)?
            }
            _ => Vec::new(),
        };

        let mut projections = Vec::new();
        for concept_id in candidate_ids.iter().take(options.max_candidates) {
            let Some(concept) = self.store.get_concept(concept_id)? else {
                continue;
            };
            let Some(vector) = self.store.get_concept_embedding(concept_id)? else {
                continue;
            };
            if vector.len() != axis.len() {
                continue;
            }

            let relative = difference(&vector, &neg);
            let along = dot_product(&relative, &axis);
            let position = ((along / magnitude) * 2.0 - 1.0).clamp(-1.0, 1.0);
            let orthogonal: Vec<f32> = relative
                .iter()
                .zip(axis.iter())
                .map(|(r, a)| r - along * a)
                .collect();

            let direction = if position > DIRECTION_THRESHOLD {
                Direction::Positive
            } else if position < -DIRECTION_THRESHOLD {
                Direction::Negative
            } else {
                Direction::Neutral
            };

            projections.push(CandidateProjection {
                concept_id: concept_id.clone(),
                label: concept.label,
                position,
                axis_distance: norm(&orthogonal),
                direction,
                similarity_to_positive: cosine_similarity(&vector, &pos),
                similarity_to_negative: cosine_similarity(&vector, &neg),
                grounding: self.grounding.grounding(concept_id)?,
            });
        }

        let stats = compute_stats(&projections);
        Ok(PolarityAnalysis {
            positive_pole: positive_pole.to_string(),
            negative_pole: negative_pole.to_string(),
            magnitude,
            axis_quality,
            candidates: projections,
            stats,
        })
    }

    fn require_embedding(&self, concept_id: &str) -> Result<Vec<f32>> {
        if self.store.get_concept(concept_id)?.is_none() {
            return Err(EngineError::NotFound(format!("concept {}", concept_id)));
        }
        self.store
            .get_concept_embedding(concept_id)?
            .ok_or_else(|| EngineError::Stale(format!("concept {} has no embedding", concept_id)))
    }

    /// Candidates by neighborhood traversal from both poles
    fn discover_candidates(
        &self,
        positive_pole: &str,
        negative_pole: &str,
        options: &PolarityOptions,
    ) -> Result<Vec<String>> {
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(positive_pole.to_string());
        seen.insert(negative_pole.to_string());

        let mut candidates = Vec::new();
        for pole in [positive_pole, negative_pole] {
            let hood = traversal::neighborhood(&self.store, pole, options.max_hops, None)?;
            for concept_id in hood.concept_ids() {
                if seen.insert(concept_id.clone()) {
                    candidates.push(concept_id);
                    if candidates.len() >= options.max_candidates {
                        return Ok(candidates);
                    }
                }
            }
        }
        Ok(candidates)
    }
}

fn compute_stats(projections: &[CandidateProjection]) -> Option<PolarityStats> {
    if projections.is_empty() {
        return None;
    }

    let positions: Vec<f32> = projections.iter().map(|p| p.position).collect();
    let groundings: Vec<f64> = projections.iter().map(|p| p.grounding as f64).collect();

    let mut directions = DirectionCounts::default();
    for projection in projections {
        match projection.direction {
            Direction::Positive => directions.positive += 1,
            Direction::Negative => directions.negative += 1,
            Direction::Neutral => directions.neutral += 1,
        }
    }

    let n = positions.len() as f32;
    let position_mean = positions.iter().sum::<f32>() / n;
    let mean_axis_distance = projections.iter().map(|p| p.axis_distance).sum::<f32>() / n;

    let xs: Vec<f64> = positions.iter().map(|p| *p as f64).collect();
    let pearson_r = pearson(&xs, &groundings);
    let p_value = pearson_r.map(|r| t_test_p_value(r, positions.len()));

    Some(PolarityStats {
        position_min: positions.iter().cloned().fold(f32::INFINITY, f32::min),
        position_max: positions.iter().cloned().fold(f32::NEG_INFINITY, f32::max),
        position_mean,
        mean_axis_distance,
        directions,
        pearson_r,
        p_value,
    })
}

// ============================================================================
// CORRELATION MATH
// ============================================================================

/// Pearson correlation; None below 3 samples or with a degenerate variance
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 3 {
        return None;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys.iter()) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

/// Two-tailed p-value for a Pearson r via Student's t
pub fn t_test_p_value(r: f64, n: usize) -> f64 {
    if n < 3 {
        return 1.0;
    }
    let df = (n - 2) as f64;
    let denom = 1.0 - r * r;
    if denom <= f64::EPSILON {
        return 0.0;
    }
    let t = r.abs() * (df / denom).sqrt();
    incomplete_beta(df / 2.0, 0.5, df / (df + t * t)).clamp(0.0, 1.0)
}

fn ln_gamma(x: f64) -> f64 {
    const COF: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    let mut y = x;
    let mut tmp = x + 5.5;
    tmp -= (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    for c in COF {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}

/// Continued-fraction expansion of the incomplete beta function
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 100;
    const EPS: f64 = 3.0e-7;
    const FPMIN: f64 = 1.0e-30;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function I_x(a, b)
fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let bt = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b)
        + a * x.ln()
        + b * (1.0 - x).ln())
    .exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        bt * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - bt * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}
