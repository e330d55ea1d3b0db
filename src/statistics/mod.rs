//! Statistical significance of conversion differences between experiment variants.
//!
//! Everything here is a pure function of its inputs. The [`Engine`](crate::Engine) gathers
//! per-variant counts from the store and hands them to [`analyze`].
mod analysis;
mod normal;
mod report;

pub use analysis::{
    analyze, confidence_interval, conversion_rate, relative_uplift, select_control,
    two_proportion_z_test, Analysis, Comparison, ConfidenceInterval, VariantAnalysis,
    VariantCounts, Winner, ZTest,
};
pub use normal::{normal_cdf, normal_quantile, two_sided_critical_value};
pub use report::{
    ExperimentReport, IntervalSummary, ReportSummary, VariantSummary, WinnerSummary,
};
