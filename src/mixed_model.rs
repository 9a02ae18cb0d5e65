// mixed_model.rs
//
// Linear mixed model with categorical fixed effects and one random intercept
// per group, fitted by restricted maximum likelihood:
//
//   y = X beta + Z b + e,   b ~ N(0, tau2 I),   e ~ N(0, sigma2 I)
//
// With gamma = tau2 / sigma2 the per-group covariance is
// sigma2 (I + gamma 11'), whose inverse is I - w_g 11' with
// w_g = gamma / (1 + n_g gamma). Every quantity below is assembled group by
// group from that identity, so no n x n matrix is ever formed.

use crate::config::MixedModelConfig;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{Determinant, Solve};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

const INV_PHI: f64 = 0.618_033_988_749_894_9;

/// Why an otherwise usable fit is numerically suspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceWarning {
    /// The optimiser used its whole iteration budget.
    IterationLimit,
    /// The random-effect variance ratio sits on the edge of its search range.
    Boundary,
    /// The restricted likelihood does not depend on the variance ratio.
    FlatLikelihood,
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceWarning::IterationLimit => write!(f, "iteration limit reached"),
            ConvergenceWarning::Boundary => write!(f, "random effect variance on boundary"),
            ConvergenceWarning::FlatLikelihood => write!(f, "variance ratio not identifiable"),
        }
    }
}

/// A fit that produced nothing usable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitFailure {
    #[error("response contains missing or non-finite values")]
    NonFiniteResponse,
    #[error("response has zero variance")]
    ZeroVariance,
    #[error("{0} observations leave no residual degrees of freedom for {1} fixed effects")]
    TooFewObservations(usize, usize),
    #[error("singular fixed-effect system: {0}")]
    Singular(String),
    #[error("non-finite fitted values")]
    NonFiniteFit,
}

/// Fixed-effect design and grouping shared by every response fitted against
/// the same cohort.
#[derive(Debug, Clone)]
pub struct RandomInterceptDesign {
    levels: Vec<String>,
    group_of: Vec<usize>,
    group_sizes: Vec<usize>,
    x: Array2<f64>,
    // Per group: X_g' X_g and X_g' 1.
    group_xtx: Vec<Array2<f64>>,
    group_xsum: Vec<Array1<f64>>,
    // Every group indicator lies in the column space of X.
    grouping_in_fixed: bool,
}

impl RandomInterceptDesign {
    /// Treatment-coded categorical design (intercept plus one indicator per
    /// non-reference level, levels sorted, first one the reference) with the
    /// same factor as the random-intercept grouping.
    pub fn categorical(factor: &[String]) -> Self {
        Self::build(factor, |levels| levels.len().max(1), |x, i, g| {
            x[[i, 0]] = 1.0;
            if g > 0 {
                x[[i, g]] = 1.0;
            }
        })
    }

    /// One-way random effects design: a global intercept as the only fixed
    /// effect and `factor` as the random-intercept grouping.
    pub fn intercept_only(factor: &[String]) -> Self {
        Self::build(factor, |_| 1, |x, i, _| x[[i, 0]] = 1.0)
    }

    fn build(
        factor: &[String],
        n_fixed: impl Fn(&[String]) -> usize,
        fill_row: impl Fn(&mut Array2<f64>, usize, usize),
    ) -> Self {
        let levels: Vec<String> = factor.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        let group_of: Vec<usize> = factor
            .iter()
            .map(|f| levels.binary_search(f).unwrap_or_default())
            .collect();
        let n = factor.len();
        let p = n_fixed(&levels);

        let mut x = Array2::<f64>::zeros((n, p));
        for (i, &g) in group_of.iter().enumerate() {
            fill_row(&mut x, i, g);
        }

        let mut group_sizes = vec![0usize; levels.len()];
        let mut group_xtx = vec![Array2::<f64>::zeros((p, p)); levels.len()];
        let mut group_xsum = vec![Array1::<f64>::zeros(p); levels.len()];
        for (i, &g) in group_of.iter().enumerate() {
            group_sizes[g] += 1;
            let row = x.row(i);
            for a in 0..p {
                group_xsum[g][a] += row[a];
                for b in 0..p {
                    group_xtx[g][[a, b]] += row[a] * row[b];
                }
            }
        }
        let grouping_in_fixed = spans_groups(&group_xtx, &group_xsum, &group_sizes);

        Self {
            levels,
            group_of,
            group_sizes,
            x,
            group_xtx,
            group_xsum,
            grouping_in_fixed,
        }
    }

    /// True when the fixed effects already reproduce any per-group shift, so
    /// the random-intercept variance ratio is not identified and fitted values
    /// do not depend on it.
    pub fn grouping_in_fixed(&self) -> bool {
        self.grouping_in_fixed
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn group_sizes(&self) -> &[usize] {
        &self.group_sizes
    }

    pub fn n_obs(&self) -> usize {
        self.group_of.len()
    }

    pub fn n_fixed(&self) -> usize {
        self.x.ncols()
    }
}

/// Projects each group indicator onto the fixed-effect columns and checks the
/// residual sum of squares, using only the per-group cross products.
fn spans_groups(group_xtx: &[Array2<f64>], group_xsum: &[Array1<f64>], group_sizes: &[usize]) -> bool {
    let Some(first) = group_xtx.first() else {
        return true;
    };
    let mut xtx = Array2::<f64>::zeros(first.raw_dim());
    for m in group_xtx {
        xtx = xtx + m;
    }
    group_xsum.iter().zip(group_sizes).all(|(xtz, &ng)| match xtx.solve(xtz) {
        // ||z - X b||^2 = z'z - b'X'z at the least-squares solution
        Ok(b) => (ng as f64 - b.dot(xtz)).abs() <= 1e-8 * (ng as f64).max(1.0),
        Err(_) => false,
    })
}

#[derive(Debug, Clone)]
pub struct MixedModelFit {
    pub beta: Array1<f64>,
    /// tau2 / sigma2 at the optimum; 0 when the grouping is also a fixed effect.
    pub variance_ratio: f64,
    pub sigma2: f64,
    pub tau2: f64,
    /// Best linear unbiased predictions of the random intercepts, one per level.
    pub random_effects: Array1<f64>,
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
    pub reml_log_likelihood: f64,
    pub iterations: usize,
    pub warning: Option<ConvergenceWarning>,
}

impl MixedModelFit {
    /// `var(fitted) / (var(fitted) + var(residuals))`, population variances.
    pub fn variance_fraction(&self) -> Option<f64> {
        let vf = self.fitted.var(0.0);
        let vr = self.residuals.var(0.0);
        let total = vf + vr;
        if total > 0.0 && total.is_finite() {
            Some(vf / total)
        } else {
            None
        }
    }
}

/// Profiled REML quantities at one variance ratio.
struct Profile {
    log_likelihood: f64,
    beta: Array1<f64>,
    residuals: Array1<f64>,
    residual_group_sums: Vec<f64>,
    quad_form: f64,
}

struct GeneData<'a> {
    y: ArrayView1<'a, f64>,
    group_xty: Vec<Array1<f64>>,
    group_ysum: Vec<f64>,
}

pub fn fit_random_intercept(
    design: &RandomInterceptDesign,
    y: ArrayView1<'_, f64>,
    config: &MixedModelConfig,
) -> Result<MixedModelFit, FitFailure> {
    let n = design.n_obs();
    let p = design.n_fixed();
    if y.iter().any(|v| !v.is_finite()) {
        return Err(FitFailure::NonFiniteResponse);
    }
    if n <= p {
        return Err(FitFailure::TooFewObservations(n, p));
    }
    if y.var(0.0) <= f64::EPSILON * y.mean().unwrap_or(0.0).abs().max(1.0) {
        return Err(FitFailure::ZeroVariance);
    }

    let n_groups = design.levels.len();
    let mut group_xty = vec![Array1::<f64>::zeros(p); n_groups];
    let mut group_ysum = vec![0.0; n_groups];
    for (i, &g) in design.group_of.iter().enumerate() {
        group_ysum[g] += y[i];
        group_xty[g].scaled_add(y[i], &design.x.row(i));
    }
    let data = GeneData {
        y,
        group_xty,
        group_ysum,
    };

    let (gamma, best, iterations, warning) = if design.grouping_in_fixed {
        // Group shifts are absorbed by the fixed effects and the residual
        // group sums vanish for every ratio; fit at gamma = 0.
        (0.0, profile(design, &data, 0.0)?, 0, None)
    } else {
        search_variance_ratio(design, &data, config)?
    };

    let sigma2 = best.quad_form / (n - p) as f64;
    let random_effects: Array1<f64> = design
        .group_sizes
        .iter()
        .zip(&best.residual_group_sums)
        .map(|(&ng, &rg)| gamma * rg / (1.0 + ng as f64 * gamma))
        .collect();
    let mut fitted = design.x.dot(&best.beta);
    for (i, &g) in design.group_of.iter().enumerate() {
        fitted[i] += random_effects[g];
    }
    let residuals = &data.y - &fitted;
    debug_assert_eq!(residuals.len(), best.residuals.len());

    if fitted.iter().chain(residuals.iter()).any(|v| !v.is_finite()) || !sigma2.is_finite() {
        return Err(FitFailure::NonFiniteFit);
    }

    Ok(MixedModelFit {
        beta: best.beta,
        variance_ratio: gamma,
        sigma2,
        tau2: gamma * sigma2,
        random_effects,
        fitted,
        residuals,
        reml_log_likelihood: best.log_likelihood,
        iterations,
        warning,
    })
}

/// Golden-section search on ln(gamma) plus the gamma = 0 boundary.
fn search_variance_ratio(
    design: &RandomInterceptDesign,
    data: &GeneData<'_>,
    config: &MixedModelConfig,
) -> Result<(f64, Profile, usize, Option<ConvergenceWarning>), FitFailure> {
    let (mut lo, mut hi) = config.log_ratio_bounds;
    let mut c = hi - INV_PHI * (hi - lo);
    let mut d = lo + INV_PHI * (hi - lo);
    let mut fc = profile(design, data, c.exp())?.log_likelihood;
    let mut fd = profile(design, data, d.exp())?.log_likelihood;
    let mut ll_min = fc.min(fd);
    let mut ll_max = fc.max(fd);
    let mut iterations = 0;
    while (hi - lo) > config.tolerance && iterations < config.max_iterations {
        if fc >= fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - INV_PHI * (hi - lo);
            fc = profile(design, data, c.exp())?.log_likelihood;
            ll_min = ll_min.min(fc);
            ll_max = ll_max.max(fc);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + INV_PHI * (hi - lo);
            fd = profile(design, data, d.exp())?.log_likelihood;
            ll_min = ll_min.min(fd);
            ll_max = ll_max.max(fd);
        }
        iterations += 1;
    }
    let converged = (hi - lo) <= config.tolerance;
    let t_best = 0.5 * (lo + hi);
    let interior = profile(design, data, t_best.exp())?;

    // gamma = 0 lies outside the log-scale search; check it explicitly.
    let at_zero = profile(design, data, 0.0)?;
    ll_min = ll_min.min(at_zero.log_likelihood).min(interior.log_likelihood);
    ll_max = ll_max.max(at_zero.log_likelihood).max(interior.log_likelihood);

    let (lo_bound, hi_bound) = config.log_ratio_bounds;
    let on_edge = (t_best - lo_bound) <= config.tolerance || (hi_bound - t_best) <= config.tolerance;
    let (gamma, best) = if at_zero.log_likelihood > interior.log_likelihood {
        (0.0, at_zero)
    } else {
        (t_best.exp(), interior)
    };

    let warning = if (ll_max - ll_min).abs() <= config.flat_likelihood_tolerance {
        Some(ConvergenceWarning::FlatLikelihood)
    } else if !converged {
        Some(ConvergenceWarning::IterationLimit)
    } else if gamma == 0.0 || on_edge {
        Some(ConvergenceWarning::Boundary)
    } else {
        None
    };

    Ok((gamma, best, iterations, warning))
}

fn profile(design: &RandomInterceptDesign, data: &GeneData<'_>, gamma: f64) -> Result<Profile, FitFailure> {
    let n = design.n_obs();
    let p = design.n_fixed();

    let mut xtvx = Array2::<f64>::zeros((p, p));
    let mut xtvy = Array1::<f64>::zeros(p);
    let mut log_det_h = 0.0;
    for g in 0..design.levels.len() {
        let ng = design.group_sizes[g] as f64;
        let w = gamma / (1.0 + ng * gamma);
        let s = &design.group_xsum[g];
        xtvx = xtvx + &design.group_xtx[g];
        xtvy = xtvy + &data.group_xty[g];
        for a in 0..p {
            xtvy[a] -= w * s[a] * data.group_ysum[g];
            for b in 0..p {
                xtvx[[a, b]] -= w * s[a] * s[b];
            }
        }
        log_det_h += (1.0 + ng * gamma).ln();
    }

    let beta = xtvx
        .solve(&xtvy)
        .map_err(|e| FitFailure::Singular(e.to_string()))?;
    let (sign, log_det_xtvx) = xtvx
        .sln_det()
        .map_err(|e| FitFailure::Singular(e.to_string()))?;
    if sign <= 0.0 || !log_det_xtvx.is_finite() {
        return Err(FitFailure::Singular("X' V^-1 X is not positive definite".into()));
    }

    let residuals = &data.y - &design.x.dot(&beta);
    let mut residual_group_sums = vec![0.0; design.levels.len()];
    let mut sum_sq = 0.0;
    for (i, &g) in design.group_of.iter().enumerate() {
        residual_group_sums[g] += residuals[i];
        sum_sq += residuals[i] * residuals[i];
    }
    let quad_form = sum_sq
        - design
            .group_sizes
            .iter()
            .zip(&residual_group_sums)
            .map(|(&ng, &rg)| gamma / (1.0 + ng as f64 * gamma) * rg * rg)
            .sum::<f64>();
    // Group means are reproduced exactly when the grouping is also a fixed
    // effect, so the quadratic form can round to zero.
    let quad_form = quad_form.max(f64::MIN_POSITIVE);

    let log_likelihood = -0.5 * ((n - p) as f64 * quad_form.ln() + log_det_h + log_det_xtvx);
    if !log_likelihood.is_finite() {
        return Err(FitFailure::NonFiniteFit);
    }

    Ok(Profile {
        log_likelihood,
        beta,
        residuals,
        residual_group_sums,
        quad_form,
    })
}
