//! Conversion analysis: intervals, significance against control, uplift and winner selection.
//!
//! Values are kept unrounded here. Rounding for display happens in
//! [`ReportSummary`](super::ReportSummary).
use serde::Serialize;

use super::normal::{normal_cdf, two_sided_critical_value};
use crate::{
    model::{VariantId, CONTROL_VARIANT_NAME},
    Error, Result,
};

/// Raw per-variant counts an analysis starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantCounts {
    pub variant_id: VariantId,
    pub variant_name: String,
    /// Distinct users with at least one conversion event.
    pub conversions: u64,
    /// Distinct users with any event.
    pub total_users: u64,
}

impl VariantCounts {
    pub fn new(
        variant_id: impl Into<VariantId>,
        variant_name: impl Into<String>,
        conversions: u64,
        total_users: u64,
    ) -> VariantCounts {
        VariantCounts {
            variant_id: variant_id.into(),
            variant_name: variant_name.into(),
            conversions,
            total_users,
        }
    }

    /// Conversion rate as a proportion in `[0, 1]`. Zero when there are no users.
    pub fn conversion_rate(&self) -> f64 {
        conversion_rate(self.conversions, self.total_users)
    }
}

/// A proportion interval, both bounds within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

/// Result of a two-proportion z-test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZTest {
    pub z_score: f64,
    /// Two-sided p-value.
    pub p_value: f64,
}

impl ZTest {
    /// The result reported when the data carries no evidence either way.
    pub const NO_EVIDENCE: ZTest = ZTest {
        z_score: 0.0,
        p_value: 1.0,
    };
}

/// Comparison of a variant against control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub z_score: f64,
    pub p_value: f64,
    pub is_significant: bool,
    /// Relative change of conversion rate versus control, in percent.
    pub relative_uplift: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantAnalysis {
    pub variant_id: VariantId,
    pub variant_name: String,
    pub conversions: u64,
    pub total_users: u64,
    /// Proportion in `[0, 1]`.
    pub conversion_rate: f64,
    pub confidence_interval: ConfidenceInterval,
    pub is_control: bool,
    /// `None` for the control variant.
    pub comparison: Option<Comparison>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Winner {
    pub variant_id: VariantId,
    pub variant_name: String,
    pub relative_uplift: f64,
}

/// Outcome of [`analyze`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub control: VariantId,
    /// Ordered by variant id.
    pub variants: Vec<VariantAnalysis>,
    pub winner: Option<Winner>,
}

impl Analysis {
    pub fn variant(&self, variant_id: VariantId) -> Option<&VariantAnalysis> {
        self.variants
            .iter()
            .find(|variant| variant.variant_id == variant_id)
    }
}

/// `conversions / total_users`, or `0` when `total_users` is zero.
pub fn conversion_rate(conversions: u64, total_users: u64) -> f64 {
    if total_users == 0 {
        0.0
    } else {
        conversions as f64 / total_users as f64
    }
}

/// Wald interval for a binomial proportion at `confidence_level`, clamped to `[0, 1]`.
///
/// Returns `(0, 0)` when `total` is zero.
pub fn confidence_interval(conversions: u64, total: u64, confidence_level: f64) -> ConfidenceInterval {
    if total == 0 {
        return ConfidenceInterval {
            lower: 0.0,
            upper: 0.0,
        };
    }

    let p = conversion_rate(conversions, total);
    let standard_error = (p * (1.0 - p) / total as f64).sqrt();
    // A degenerate proportion has no spread, whatever the critical value (which is infinite at
    // confidence level 1).
    let margin = if standard_error == 0.0 {
        0.0
    } else {
        two_sided_critical_value(confidence_level) * standard_error
    };

    ConfidenceInterval {
        lower: (p - margin).max(0.0),
        upper: (p + margin).min(1.0),
    }
}

/// Pooled two-proportion z-test of `variant` against `control`.
///
/// Reports [`ZTest::NO_EVIDENCE`] when either sample is empty or the pooled proportion is 0 or 1.
pub fn two_proportion_z_test(
    control_conversions: u64,
    control_total: u64,
    variant_conversions: u64,
    variant_total: u64,
) -> ZTest {
    if control_total == 0 || variant_total == 0 {
        return ZTest::NO_EVIDENCE;
    }

    let pooled = (control_conversions + variant_conversions) as f64
        / (control_total + variant_total) as f64;
    if pooled <= 0.0 || pooled >= 1.0 {
        return ZTest::NO_EVIDENCE;
    }

    let standard_error = (pooled
        * (1.0 - pooled)
        * (1.0 / control_total as f64 + 1.0 / variant_total as f64))
        .sqrt();
    if standard_error == 0.0 {
        return ZTest::NO_EVIDENCE;
    }

    let control_rate = conversion_rate(control_conversions, control_total);
    let variant_rate = conversion_rate(variant_conversions, variant_total);
    let z_score = (variant_rate - control_rate) / standard_error;

    ZTest {
        z_score,
        p_value: 2.0 * (1.0 - normal_cdf(z_score.abs())),
    }
}

/// Relative change of `variant_rate` versus `control_rate`, in percent.
///
/// Defined as `0` when `control_rate` is zero.
pub fn relative_uplift(control_rate: f64, variant_rate: f64) -> f64 {
    if control_rate == 0.0 {
        0.0
    } else {
        (variant_rate - control_rate) / control_rate * 100.0
    }
}

/// Index of the control variant: the one named "control" (any case), otherwise the one with the
/// lowest id. `None` when `variants` is empty.
pub fn select_control(variants: &[VariantCounts]) -> Option<usize> {
    let named = variants
        .iter()
        .enumerate()
        .filter(|(_, variant)| variant.variant_name.eq_ignore_ascii_case(CONTROL_VARIANT_NAME))
        .min_by_key(|(_, variant)| variant.variant_id);
    let lowest = || {
        variants
            .iter()
            .enumerate()
            .min_by_key(|(_, variant)| variant.variant_id)
    };
    named.or_else(lowest).map(|(index, _)| index)
}

/// Compare every variant against control.
///
/// A variant is significant when its p-value is below `significance_threshold`. The winner is the
/// significant variant with the greatest positive uplift. On ties the variant with the lower id
/// wins.
///
/// # Errors
///
/// [`Error::InvalidInput`] if `variants` is empty or a variant has more conversions than users.
pub fn analyze(
    variants: &[VariantCounts],
    confidence_level: f64,
    significance_threshold: f64,
) -> Result<Analysis> {
    if let Some(variant) = variants
        .iter()
        .find(|variant| variant.conversions > variant.total_users)
    {
        return Err(Error::InvalidInput(format!(
            "variant {} has {} conversions but only {} users",
            variant.variant_id, variant.conversions, variant.total_users
        )));
    }

    let mut sorted: Vec<&VariantCounts> = variants.iter().collect();
    sorted.sort_by_key(|variant| variant.variant_id);

    let control_index = select_control(variants)
        .ok_or_else(|| Error::InvalidInput("no variants to analyze".to_owned()))?;
    let control = &variants[control_index];
    let control_rate = control.conversion_rate();

    let analyzed: Vec<VariantAnalysis> = sorted
        .into_iter()
        .map(|variant| {
            let is_control = variant.variant_id == control.variant_id;
            let comparison = (!is_control).then(|| {
                let test = two_proportion_z_test(
                    control.conversions,
                    control.total_users,
                    variant.conversions,
                    variant.total_users,
                );
                Comparison {
                    z_score: test.z_score,
                    p_value: test.p_value,
                    is_significant: test.p_value < significance_threshold,
                    relative_uplift: relative_uplift(control_rate, variant.conversion_rate()),
                }
            });

            VariantAnalysis {
                variant_id: variant.variant_id,
                variant_name: variant.variant_name.clone(),
                conversions: variant.conversions,
                total_users: variant.total_users,
                conversion_rate: variant.conversion_rate(),
                confidence_interval: confidence_interval(
                    variant.conversions,
                    variant.total_users,
                    confidence_level,
                ),
                is_control,
                comparison,
            }
        })
        .collect();

    let winner = select_winner(&analyzed);
    log::trace!(target: "abtest",
                control = control.variant_id,
                variants = analyzed.len(),
                winner = winner.as_ref().map(|winner| winner.variant_id.0);
                "analyzed experiment variants");

    Ok(Analysis {
        control: control.variant_id,
        variants: analyzed,
        winner,
    })
}

fn select_winner(variants: &[VariantAnalysis]) -> Option<Winner> {
    let mut best: Option<(&VariantAnalysis, f64)> = None;
    for variant in variants {
        let Some(comparison) = &variant.comparison else {
            continue;
        };
        if !comparison.is_significant || comparison.relative_uplift <= 0.0 {
            continue;
        }
        if best.map_or(true, |(_, uplift)| comparison.relative_uplift > uplift) {
            best = Some((variant, comparison.relative_uplift));
        }
    }

    best.map(|(variant, relative_uplift)| Winner {
        variant_id: variant.variant_id,
        variant_name: variant.variant_name.clone(),
        relative_uplift,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn interval_for_half_conversion() {
        let interval = confidence_interval(5, 10, 0.95);
        assert_close(interval.lower, 0.190_102_483_8);
        assert_close(interval.upper, 0.809_897_516_2);
    }

    #[test]
    fn interval_is_clamped() {
        let interval = confidence_interval(8, 10, 0.95);
        assert_close(interval.lower, 0.552_081_987_1);
        assert_eq!(interval.upper, 1.0);
    }

    #[test]
    fn interval_narrows_with_lower_confidence() {
        let wide = confidence_interval(5, 10, 0.95);
        let narrow = confidence_interval(5, 10, 0.9);
        assert_close(narrow.lower, 0.239_925_806_1);
        assert!(narrow.lower > wide.lower && narrow.upper < wide.upper);
    }

    #[test]
    fn interval_without_users() {
        assert_eq!(
            confidence_interval(0, 0, 0.95),
            ConfidenceInterval {
                lower: 0.0,
                upper: 0.0
            }
        );
    }

    #[test]
    fn degenerate_intervals_do_not_produce_nan() {
        for confidence_level in [0.0, 0.95, 1.0] {
            for (conversions, total) in [(0, 10), (10, 10), (3, 10)] {
                let interval = confidence_interval(conversions, total, confidence_level);
                assert!(interval.lower.is_finite() && interval.upper.is_finite());
                assert!((0.0..=1.0).contains(&interval.lower));
                assert!((0.0..=1.0).contains(&interval.upper));
            }
        }
        // full confidence spans everything when there is spread
        assert_eq!(
            confidence_interval(3, 10, 1.0),
            ConfidenceInterval {
                lower: 0.0,
                upper: 1.0
            }
        );
        // and nothing when there is none
        assert_eq!(
            confidence_interval(10, 10, 1.0),
            ConfidenceInterval {
                lower: 1.0,
                upper: 1.0
            }
        );
    }

    #[test]
    fn z_test_small_sample() {
        let test = two_proportion_z_test(5, 10, 8, 10);
        assert_close(test.z_score, 1.406_421_692_8);
        assert_close(test.p_value, 0.159_598_942_4);
    }

    #[test]
    fn z_test_large_sample() {
        let test = two_proportion_z_test(100, 1000, 150, 1000);
        assert_close(test.z_score, 3.380_617_019);
        assert_close(test.p_value, 0.000_723_232_7);

        let negative = two_proportion_z_test(100, 1000, 70, 1000);
        assert_close(negative.z_score, -2.405_394_131);
        assert_close(negative.p_value, 0.016_155_032_1);
    }

    #[test]
    fn z_test_without_evidence() {
        assert_eq!(two_proportion_z_test(0, 0, 5, 10), ZTest::NO_EVIDENCE);
        assert_eq!(two_proportion_z_test(5, 10, 0, 0), ZTest::NO_EVIDENCE);
        assert_eq!(two_proportion_z_test(0, 10, 0, 10), ZTest::NO_EVIDENCE);
        assert_eq!(two_proportion_z_test(10, 10, 10, 10), ZTest::NO_EVIDENCE);
    }

    #[test]
    fn uplift() {
        assert_close(relative_uplift(0.5, 0.8), 60.0);
        assert_close(relative_uplift(0.1, 0.07), -30.0);
        assert_eq!(relative_uplift(0.0, 0.3), 0.0);
    }

    #[test]
    fn control_is_named_or_lowest_id() {
        let named = [
            VariantCounts::new(1, "a", 0, 0),
            VariantCounts::new(2, "Control", 0, 0),
        ];
        assert_eq!(select_control(&named), Some(1));

        let unnamed = [
            VariantCounts::new(9, "b", 0, 0),
            VariantCounts::new(4, "a", 0, 0),
        ];
        assert_eq!(select_control(&unnamed), Some(1));
        assert_eq!(select_control(&[]), None);
    }

    #[test]
    fn small_sample_is_not_significant() {
        let analysis = analyze(
            &[
                VariantCounts::new(1, "control", 5, 10),
                VariantCounts::new(2, "treatment", 8, 10),
            ],
            0.95,
            0.05,
        )
        .unwrap();

        assert_eq!(analysis.control, VariantId(1));
        let control = analysis.variant(VariantId(1)).unwrap();
        assert!(control.is_control);
        assert!(control.comparison.is_none());
        assert_close(control.conversion_rate, 0.5);

        let treatment = analysis.variant(VariantId(2)).unwrap();
        let comparison = treatment.comparison.unwrap();
        assert_close(treatment.conversion_rate, 0.8);
        assert_close(comparison.relative_uplift, 60.0);
        assert_close(comparison.p_value, 0.159_598_942_4);
        assert!(!comparison.is_significant);
        assert_eq!(analysis.winner, None);

        // a lenient threshold flips significance
        let lenient = analyze(
            &[
                VariantCounts::new(1, "control", 5, 10),
                VariantCounts::new(2, "treatment", 8, 10),
            ],
            0.95,
            0.2,
        )
        .unwrap();
        assert_eq!(
            lenient.winner.map(|winner| winner.variant_id),
            Some(VariantId(2))
        );
    }

    #[test]
    fn winner_has_greatest_uplift() {
        let analysis = analyze(
            &[
                VariantCounts::new(1, "control", 100, 1000),
                VariantCounts::new(2, "modest", 130, 1000),
                VariantCounts::new(3, "strong", 150, 1000),
                VariantCounts::new(4, "worse", 70, 1000),
            ],
            0.95,
            0.05,
        )
        .unwrap();

        for id in [2, 3, 4] {
            let comparison = analysis.variant(VariantId(id)).unwrap().comparison.unwrap();
            assert!(comparison.is_significant, "variant {id} should be significant");
        }
        let winner = analysis.winner.unwrap();
        assert_eq!(winner.variant_id, VariantId(3));
        assert_eq!(winner.variant_name, "strong");
        assert_close(winner.relative_uplift, 50.0);
    }

    #[test]
    fn winner_ties_go_to_lowest_id() {
        let analysis = analyze(
            &[
                VariantCounts::new(7, "late", 150, 1000),
                VariantCounts::new(1, "control", 100, 1000),
                VariantCounts::new(5, "early", 150, 1000),
            ],
            0.95,
            0.05,
        )
        .unwrap();

        let ids: Vec<_> = analysis.variants.iter().map(|v| v.variant_id).collect();
        assert_eq!(ids, vec![VariantId(1), VariantId(5), VariantId(7)]);
        assert_eq!(
            analysis.winner.map(|winner| winner.variant_id),
            Some(VariantId(5))
        );
    }

    #[test]
    fn significant_loss_is_not_a_winner() {
        let analysis = analyze(
            &[
                VariantCounts::new(1, "control", 100, 1000),
                VariantCounts::new(2, "worse", 70, 1000),
            ],
            0.95,
            0.05,
        )
        .unwrap();
        assert!(analysis.variant(VariantId(2)).unwrap().comparison.unwrap().is_significant);
        assert_eq!(analysis.winner, None);
    }

    #[test]
    fn zero_data() {
        let analysis = analyze(
            &[
                VariantCounts::new(1, "control", 0, 0),
                VariantCounts::new(2, "treatment", 0, 0),
            ],
            0.95,
            0.05,
        )
        .unwrap();

        for variant in &analysis.variants {
            assert_eq!(variant.conversion_rate, 0.0);
            assert_eq!(
                variant.confidence_interval,
                ConfidenceInterval {
                    lower: 0.0,
                    upper: 0.0
                }
            );
        }
        let comparison = analysis.variant(VariantId(2)).unwrap().comparison.unwrap();
        assert_eq!(comparison.p_value, 1.0);
        assert_eq!(comparison.relative_uplift, 0.0);
        assert!(!comparison.is_significant);
        assert_eq!(analysis.winner, None);
    }

    #[test]
    fn invalid_counts() {
        assert!(matches!(
            analyze(&[], 0.95, 0.05),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            analyze(&[VariantCounts::new(1, "control", 11, 10)], 0.95, 0.05),
            Err(Error::InvalidInput(_))
        ));
    }
}
