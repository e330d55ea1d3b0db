use serde::Serialize;

use super::analysis::{Analysis, VariantAnalysis, Winner};
use crate::model::{ExperimentId, VariantId};

/// Statistics of one experiment, as returned by
/// [`Engine::compute_statistics`](crate::Engine::compute_statistics).
///
/// Holds exact values. Use [`ExperimentReport::summary`] for the rounded presentation form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentReport {
    pub experiment_id: ExperimentId,
    pub experiment_name: String,
    pub conversion_event_type: String,
    pub confidence_level: f64,
    pub significance_threshold: f64,
    #[serde(flatten)]
    pub analysis: Analysis,
}

impl ExperimentReport {
    pub fn variant(&self, variant_id: VariantId) -> Option<&VariantAnalysis> {
        self.analysis.variant(variant_id)
    }

    pub fn winner(&self) -> Option<&Winner> {
        self.analysis.winner.as_ref()
    }

    /// Presentation form: rates, intervals and uplifts in percent rounded to 2 decimals, p-values
    /// rounded to 4 decimals.
    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            experiment_id: self.experiment_id,
            experiment_name: self.experiment_name.clone(),
            conversion_event_type: self.conversion_event_type.clone(),
            confidence_level: self.confidence_level,
            significance_threshold: self.significance_threshold,
            variants: self
                .analysis
                .variants
                .iter()
                .map(VariantSummary::from)
                .collect(),
            winner: self.analysis.winner.as_ref().map(|winner| WinnerSummary {
                variant_id: winner.variant_id,
                variant_name: winner.variant_name.clone(),
                relative_uplift: round(winner.relative_uplift, 2),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub experiment_id: ExperimentId,
    pub experiment_name: String,
    pub conversion_event_type: String,
    pub confidence_level: f64,
    pub significance_threshold: f64,
    pub variants: Vec<VariantSummary>,
    pub winner: Option<WinnerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantSummary {
    pub variant_id: VariantId,
    pub variant_name: String,
    pub conversions: u64,
    pub total_users: u64,
    /// Percent.
    pub conversion_rate: f64,
    pub confidence_interval: IntervalSummary,
    pub is_control: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_significant: Option<bool>,
    /// Percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_uplift: Option<f64>,
}

/// Interval bounds in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntervalSummary {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WinnerSummary {
    pub variant_id: VariantId,
    pub variant_name: String,
    pub relative_uplift: f64,
}

impl From<&VariantAnalysis> for VariantSummary {
    fn from(variant: &VariantAnalysis) -> VariantSummary {
        VariantSummary {
            variant_id: variant.variant_id,
            variant_name: variant.variant_name.clone(),
            conversions: variant.conversions,
            total_users: variant.total_users,
            conversion_rate: percent(variant.conversion_rate),
            confidence_interval: IntervalSummary {
                lower: percent(variant.confidence_interval.lower),
                upper: percent(variant.confidence_interval.upper),
            },
            is_control: variant.is_control,
            p_value: variant
                .comparison
                .map(|comparison| round(comparison.p_value, 4)),
            is_significant: variant
                .comparison
                .map(|comparison| comparison.is_significant),
            relative_uplift: variant
                .comparison
                .map(|comparison| round(comparison.relative_uplift, 2)),
        }
    }
}

fn percent(proportion: f64) -> f64 {
    round(proportion * 100.0, 2)
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
