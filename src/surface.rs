//! Trade-off surfacing.
//!
//! Decides which decision points interrupt a human and which resolve
//! automatically. Impact scoring is additive over independent dimensions so
//! each contribution stays auditable in the factor list.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reversibility {
    Easy,
    Moderate,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlastRadius {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cost {
    Negligible,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expertise {
    Low,
    Medium,
    High,
}

/// Trade-off metadata attached to a decision point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tradeoffs {
    #[serde(default)]
    pub reversibility: Option<Reversibility>,
    #[serde(default)]
    pub blast_radius: Option<BlastRadius>,
    #[serde(default)]
    pub cost: Option<Cost>,
    #[serde(default)]
    pub expertise_required: Option<Expertise>,
    #[serde(default)]
    pub consequences: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactClass {
    Trivial,
    Significant,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeoffImpact {
    pub score: u32,
    pub classification: ImpactClass,
    pub factors: Vec<String>,
}

pub const CRITICAL_THRESHOLD: u32 = 50;
pub const SIGNIFICANT_THRESHOLD: u32 = 25;

/// Score a trade-off descriptor. Dimensions are independent and additive;
/// absent dimensions contribute nothing.
pub fn score_tradeoff_impact(tradeoffs: &Tradeoffs) -> TradeoffImpact {
    let mut score = 0u32;
    let mut factors = Vec::new();

    match tradeoffs.reversibility {
        Some(Reversibility::Hard) => {
            score += 30;
            factors.push("hard_to_reverse".to_string());
        }
        Some(Reversibility::Moderate) => {
            score += 15;
            factors.push("moderate_reversibility".to_string());
        }
        Some(Reversibility::Easy) | None => {}
    }

    match tradeoffs.blast_radius {
        Some(BlastRadius::High) => {
            score += 25;
            factors.push("high_blast_radius".to_string());
        }
        Some(BlastRadius::Medium) => {
            score += 10;
            factors.push("medium_blast_radius".to_string());
        }
        Some(BlastRadius::Low) | Some(BlastRadius::None) | None => {}
    }

    match tradeoffs.cost {
        Some(Cost::High) => {
            score += 20;
            factors.push("high_cost".to_string());
        }
        Some(Cost::Medium) => {
            score += 10;
            factors.push("medium_cost".to_string());
        }
        Some(Cost::Low) => {
            score += 5;
            factors.push("low_cost".to_string());
        }
        Some(Cost::Negligible) | None => {}
    }

    if tradeoffs.expertise_required == Some(Expertise::High) {
        score += 15;
        factors.push("expertise_required".to_string());
    }

    if tradeoffs.consequences.iter().any(|c| c == "data_loss") {
        score += 30;
        factors.push("data_loss_risk".to_string());
        factors.push("irreversible".to_string());
    }

    let classification = if score >= CRITICAL_THRESHOLD {
        ImpactClass::Critical
    } else if score >= SIGNIFICANT_THRESHOLD {
        ImpactClass::Significant
    } else {
        ImpactClass::Trivial
    };

    TradeoffImpact {
        score,
        classification,
        factors,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub recommended: bool,
}

/// A decision point a phase wants resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPoint {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<DecisionOption>,
    #[serde(default)]
    pub tradeoffs: Option<Tradeoffs>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceSeverity {
    Low,
    Medium,
    High,
}

/// The surfacing verdict for one decision point.
#[derive(Debug, Clone, Serialize)]
pub struct SurfaceDecision {
    pub should_surface: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub criterion_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<SurfaceSeverity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_bypass: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_selected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<TradeoffImpact>,
}

/// Decide whether `point` must be surfaced to a human.
///
/// Critical impact always surfaces and can never be bypassed. Significant
/// impact surfaces only when there is a real choice to make. Trivial impact
/// with a recommended option resolves automatically. Everything else falls
/// back to plain option-count evaluation.
pub fn should_surface(point: &DecisionPoint) -> SurfaceDecision {
    if let Some(tradeoffs) = &point.tradeoffs {
        let impact = score_tradeoff_impact(tradeoffs);
        match impact.classification {
            ImpactClass::Critical => {
                return SurfaceDecision {
                    should_surface: true,
                    criterion_id: Some("tradeoff_critical".to_string()),
                    severity: Some(SurfaceSeverity::High),
                    can_bypass: Some(false),
                    reason: None,
                    auto_selected: None,
                    impact: Some(impact),
                };
            }
            ImpactClass::Significant if point.options.len() > 1 => {
                return SurfaceDecision {
                    should_surface: true,
                    criterion_id: Some("tradeoff_significant".to_string()),
                    severity: Some(SurfaceSeverity::Medium),
                    can_bypass: Some(true),
                    reason: None,
                    auto_selected: None,
                    impact: Some(impact),
                };
            }
            ImpactClass::Trivial => {
                if let Some(recommended) = point.options.iter().find(|o| o.recommended) {
                    return SurfaceDecision {
                        should_surface: false,
                        criterion_id: None,
                        severity: None,
                        can_bypass: None,
                        reason: Some("trivial_auto_decide".to_string()),
                        auto_selected: Some(recommended.id.clone()),
                        impact: Some(impact),
                    };
                }
            }
            // Significant with no real choice falls through.
            ImpactClass::Significant => {}
        }
    }

    if point.options.len() > 1 {
        SurfaceDecision {
            should_surface: true,
            criterion_id: Some("multiple_options".to_string()),
            severity: Some(SurfaceSeverity::Low),
            can_bypass: Some(true),
            reason: None,
            auto_selected: None,
            impact: None,
        }
    } else {
        SurfaceDecision {
            should_surface: false,
            criterion_id: None,
            severity: None,
            can_bypass: None,
            reason: Some("single_option".to_string()),
            auto_selected: point.options.first().map(|o| o.id.clone()),
            impact: None,
        }
    }
}
