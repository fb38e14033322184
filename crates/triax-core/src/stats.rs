//! Shared statistics kernel.
//!
//! Descriptive statistics plus the three significance tests the engine needs:
//! Pearson correlation (Student-t), one-way ANOVA (F), and Kruskal-Wallis
//! (chi-square). The distribution CDFs are computed locally via the
//! regularized incomplete beta/gamma functions; values are checked against
//! standard tables in the tests below.
//!
//! Degenerate inputs (constant series, too few samples) return `None` rather
//! than a fabricated statistic; callers decide how to report the skip.

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n-1 denominator). `None` below two samples.
pub fn stddev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Population standard deviation (n denominator). `None` when empty.
pub fn stddev_population(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some((ss / values.len() as f64).sqrt())
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=100.0).contains(&pct) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Pearson correlation coefficient. `None` when either series is constant or
/// shorter than two samples.
pub fn pearson_r(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y.iter()) {
        let dx = a - mx;
        let dy = b - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some((sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0))
}

/// Pearson correlation with a two-sided p-value (Student-t, n-2 df).
/// `None` below three samples or for constant series.
pub fn pearson_test(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    if x.len() < 3 {
        return None;
    }
    let r = pearson_r(x, y)?;
    let df = (x.len() - 2) as f64;
    if (r.abs() - 1.0).abs() < f64::EPSILON {
        return Some((r, 0.0));
    }
    let t_sq = r * r * df / (1.0 - r * r);
    let p = incomplete_beta(df / 2.0, 0.5, df / (df + t_sq));
    Some((r, p.clamp(0.0, 1.0)))
}

/// One-way ANOVA across `groups`. Returns `(F, p)`, or `None` when fewer
/// than two groups have at least two samples or all values are identical.
pub fn one_way_anova(groups: &[&[f64]]) -> Option<(f64, f64)> {
    let k = groups.len();
    if k < 2 || groups.iter().any(|g| g.len() < 2) {
        return None;
    }
    let n_total: usize = groups.iter().map(|g| g.len()).sum();
    let grand_mean = groups.iter().flat_map(|g| g.iter()).sum::<f64>() / n_total as f64;

    let mut ss_between = 0.0;
    let mut ss_within = 0.0;
    for g in groups {
        let gm = g.iter().sum::<f64>() / g.len() as f64;
        ss_between += g.len() as f64 * (gm - grand_mean) * (gm - grand_mean);
        ss_within += g.iter().map(|v| (v - gm) * (v - gm)).sum::<f64>();
    }

    let df_between = (k - 1) as f64;
    let df_within = (n_total - k) as f64;
    if ss_within == 0.0 {
        // All groups internally constant: identical means carry no signal,
        // distinct means separate perfectly.
        return if ss_between == 0.0 {
            None
        } else {
            Some((f64::INFINITY, 0.0))
        };
    }

    let f = (ss_between / df_between) / (ss_within / df_within);
    let p = incomplete_beta(
        df_within / 2.0,
        df_between / 2.0,
        df_within / (df_within + df_between * f),
    );
    Some((f, p.clamp(0.0, 1.0)))
}

/// Kruskal-Wallis rank test across `groups`, with tie correction. Returns
/// `(H, p)` against a chi-square with k-1 df, or `None` for degenerate input.
pub fn kruskal_wallis(groups: &[&[f64]]) -> Option<(f64, f64)> {
    let k = groups.len();
    if k < 2 || groups.iter().any(|g| g.is_empty()) {
        return None;
    }
    let n_total: usize = groups.iter().map(|g| g.len()).sum();
    if n_total < 3 {
        return None;
    }

    // Pool and mid-rank.
    let mut pooled: Vec<(f64, usize)> = Vec::with_capacity(n_total);
    for (gi, g) in groups.iter().enumerate() {
        for &v in g.iter() {
            pooled.push((v, gi));
        }
    }
    pooled.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut rank_sums = vec![0.0f64; k];
    let mut tie_term = 0.0f64;
    let mut i = 0;
    while i < pooled.len() {
        let mut j = i;
        while j < pooled.len() && pooled[j].0 == pooled[i].0 {
            j += 1;
        }
        let tied = (j - i) as f64;
        let mid_rank = (i + j + 1) as f64 / 2.0; // average of ranks i+1..=j
        for item in &pooled[i..j] {
            rank_sums[item.1] += mid_rank;
        }
        tie_term += tied * tied * tied - tied;
        i = j;
    }

    let n = n_total as f64;
    let mut h = 0.0;
    for (gi, g) in groups.iter().enumerate() {
        h += rank_sums[gi] * rank_sums[gi] / g.len() as f64;
    }
    h = 12.0 / (n * (n + 1.0)) * h - 3.0 * (n + 1.0);

    let correction = 1.0 - tie_term / (n * n * n - n);
    if correction <= 0.0 {
        // Every value tied with every other: no ordering information.
        return None;
    }
    h /= correction;

    let df = (k - 1) as f64;
    let p = chi_square_sf(h.max(0.0), df);
    Some((h, p.clamp(0.0, 1.0)))
}

/// Chi-square survival function (upper tail).
pub fn chi_square_sf(x: f64, df: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    1.0 - lower_incomplete_gamma_regularized(df / 2.0, x / 2.0)
}

// ---------------------------------------------------------------------------
// Special functions (Lanczos / Numerical Recipes formulations)
// ---------------------------------------------------------------------------

fn ln_gamma(x: f64) -> f64 {
    // Lanczos approximation, g = 7, 9 coefficients.
    const COEFFS: [f64; 8] = [
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // Reflection formula.
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = 0.999_999_999_999_809_93;
    for (i, c) in COEFFS.iter().enumerate() {
        acc += c / (x + (i + 1) as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

/// Regularized incomplete beta function I_x(a, b).
fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front =
        ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_cont_frac(a, b, x) / a
    } else {
        1.0 - front * beta_cont_frac(b, a, 1.0 - x) / b
    }
}

fn beta_cont_frac(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 3.0e-12;
    const FPMIN: f64 = 1.0e-300;

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

/// Regularized lower incomplete gamma function P(a, x).
fn lower_incomplete_gamma_regularized(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x < a + 1.0 {
        gamma_series(a, x)
    } else {
        1.0 - gamma_cont_frac(a, x)
    }
}

fn gamma_series(a: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 3.0e-12;

    let mut ap = a;
    let mut sum = 1.0 / a;
    let mut del = sum;
    for _ in 0..MAX_ITER {
        ap += 1.0;
        del *= x / ap;
        sum += del;
        if del.abs() < sum.abs() * EPS {
            break;
        }
    }
    sum * (-x + a * x.ln() - ln_gamma(a)).exp()
}

fn gamma_cont_frac(a: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 3.0e-12;
    const FPMIN: f64 = 1.0e-300;

    let mut b = x + 1.0 - a;
    let mut c = 1.0 / FPMIN;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=MAX_ITER {
        let an = -(i as f64) * (i as f64 - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = b + an / c;
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
    h * (-x + a * x.ln() - ln_gamma(a)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn descriptive_basics() {
        let v = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!(close(mean(&v).unwrap(), 5.0, 1e-12));
        assert!(close(stddev_population(&v).unwrap(), 2.0, 1e-12));
        assert!(close(median(&v).unwrap(), 4.5, 1e-12));
        assert!(close(percentile(&v, 0.0).unwrap(), 2.0, 1e-12));
        assert!(close(percentile(&v, 100.0).unwrap(), 9.0, 1e-12));
    }

    #[test]
    fn descriptive_empty() {
        assert!(mean(&[]).is_none());
        assert!(stddev(&[1.0]).is_none());
        assert!(percentile(&[], 50.0).is_none());
    }

    #[test]
    fn percentile_interpolates() {
        let v = [1.0, 2.0, 3.0, 4.0];
        // rank = 0.25 * 3 = 0.75 -> between 1.0 and 2.0
        assert!(close(percentile(&v, 25.0).unwrap(), 1.75, 1e-12));
    }

    #[test]
    fn median_robust_to_outlier() {
        let tight = [5.9, 6.0, 6.0, 6.1, 6.0];
        let mut with_outlier = tight.to_vec();
        with_outlier.push(90_000_000.0);
        let shift = (median(&tight).unwrap() - median(&with_outlier).unwrap()).abs();
        assert!(shift <= 0.1, "median moved by {shift}");
    }

    #[test]
    fn pearson_perfect_and_inverse() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let (r, p) = pearson_test(&x, &y).unwrap();
        assert!(close(r, 1.0, 1e-12));
        assert!(close(p, 0.0, 1e-12));

        let y_inv: Vec<f64> = x.iter().map(|v| -v).collect();
        let (r, _) = pearson_test(&x, &y_inv).unwrap();
        assert!(close(r, -1.0, 1e-12));
    }

    #[test]
    fn pearson_constant_series_is_none() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [5.0, 5.0, 5.0, 5.0];
        assert!(pearson_r(&x, &y).is_none());
        assert!(pearson_test(&x, &y).is_none());
    }

    #[test]
    fn pearson_p_value_matches_table() {
        // t = 2.306 is the 5% two-sided critical value at 8 df.
        let df = 8.0;
        let t = 2.306;
        let p = incomplete_beta(df / 2.0, 0.5, df / (df + t * t));
        assert!(close(p, 0.05, 0.002), "p = {p}");
    }

    #[test]
    fn pearson_test_p_consistent_with_t_transform() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, v)| v + if i % 2 == 0 { 1.5 } else { -1.5 })
            .collect();
        let (r, p) = pearson_test(&x, &y).unwrap();
        assert!(r > 0.5 && r < 1.0);

        let df = (x.len() - 2) as f64;
        let t_sq = r * r * df / (1.0 - r * r);
        let expected = incomplete_beta(df / 2.0, 0.5, df / (df + t_sq));
        assert!(close(p, expected, 1e-12), "p = {p}, expected {expected}");
    }

    #[test]
    fn anova_identical_groups() {
        let g = [1.0, 2.0, 3.0, 4.0];
        let (f, p) = one_way_anova(&[&g, &g, &g]).unwrap();
        assert!(close(f, 0.0, 1e-12));
        assert!(close(p, 1.0, 1e-9));
    }

    #[test]
    fn anova_separated_groups() {
        let a = [1.0, 1.1, 0.9, 1.0, 1.05];
        let b = [5.0, 5.1, 4.9, 5.0, 5.05];
        let c = [9.0, 9.1, 8.9, 9.0, 9.05];
        let (f, p) = one_way_anova(&[&a, &b, &c]).unwrap();
        assert!(f > 100.0);
        assert!(p < 1e-6);
    }

    #[test]
    fn f_critical_value_matches_table() {
        // F(0.05; 2, 12) = 3.885.
        let d1 = 2.0;
        let d2 = 12.0;
        let f = 3.885;
        let p = incomplete_beta(d2 / 2.0, d1 / 2.0, d2 / (d2 + d1 * f));
        assert!(close(p, 0.05, 0.002), "p = {p}");
    }

    #[test]
    fn chi_square_matches_table() {
        // Chi-square(2) upper 5% point is 5.991.
        assert!(close(chi_square_sf(5.991, 2.0), 0.05, 0.002));
        // Chi-square(1) upper 5% point is 3.841.
        assert!(close(chi_square_sf(3.841, 1.0), 0.05, 0.002));
    }

    #[test]
    fn kruskal_identical_groups() {
        let g = [1.0, 2.0, 3.0, 4.0, 5.0];
        let (h, p) = kruskal_wallis(&[&g, &g]).unwrap();
        assert!(h.abs() < 1.0);
        assert!(p > 0.3);
    }

    #[test]
    fn kruskal_separated_groups() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [101.0, 102.0, 103.0, 104.0, 105.0, 106.0];
        let (h, p) = kruskal_wallis(&[&a, &b]).unwrap();
        assert!(h > 7.0, "H = {h}");
        assert!(p < 0.01, "p = {p}");
    }

    #[test]
    fn kruskal_all_tied_is_none() {
        let g = [3.0, 3.0, 3.0];
        assert!(kruskal_wallis(&[&g, &g]).is_none());
    }

    #[test]
    fn ln_gamma_known_values() {
        // Gamma(5) = 24.
        assert!(close(ln_gamma(5.0), 24.0f64.ln(), 1e-9));
        // Gamma(0.5) = sqrt(pi).
        assert!(close(ln_gamma(0.5), std::f64::consts::PI.sqrt().ln(), 1e-9));
    }
}
