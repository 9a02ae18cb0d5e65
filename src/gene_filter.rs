// gene_filter.rs

use crate::config::FlaggedGenePolicy;
use crate::platform::{GeneFitOutcome, VarianceFractionTable};

/// Genes whose platform variance fraction is at most `threshold`, in table order.
///
/// Failed fits never pass. Fits carrying a convergence warning pass unless the
/// policy excludes them.
pub fn select_platform_independent(
    table: &VarianceFractionTable,
    threshold: f64,
    policy: FlaggedGenePolicy,
) -> Vec<String> {
    table
        .iter()
        .filter_map(|(gene, outcome)| match outcome {
            GeneFitOutcome::Fitted { fraction, warning } => {
                let eligible = warning.is_none() || policy == FlaggedGenePolicy::Keep;
                (eligible && *fraction <= threshold).then(|| gene.to_string())
            }
            GeneFitOutcome::Failed { .. } => None,
        })
        .collect()
}
