//! Grounding & Polarity
//!
//! Projection mathematics shared by two consumers: the grounding engine
//! scores concepts along the default vocabulary polarity axis, and the
//! polarity query reuses the same projection for user-chosen concept poles.

pub mod axis;
mod engine;
pub mod polarity;

pub use axis::{aggregate_grounding, build_axis};
pub use engine::GroundingEngine;
pub use polarity::{
    AxisQuality, CandidateProjection, Direction, DirectionCounts, PolarityAnalysis,
    PolarityOptions, PolarityQuery, PolarityStats,
};
