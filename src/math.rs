#[inline(always)]
pub fn logsumexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if a > b {
        a + (b - a).exp().ln_1p()
    } else {
        b + (a - b).exp().ln_1p()
    }
}

/// Exponent step of one normalization band.
///
/// A banded value is `mantissa * exp(NORM_FACTOR * band)`. The step must stay
/// well below `ln(f64::MAX)` so that a mantissa can exceed the promotion
/// threshold by a full lookback's worth of potentials without overflowing.
pub const NORM_FACTOR: f64 = 256.0;

/// A mantissa at or above this value must be promoted to the next band.
pub const BAND_LIMIT: f64 = 1.5114276650041035e111; // exp(NORM_FACTOR)

/// Factor converting a mantissa expressed in `from` band into `to` band.
#[inline(always)]
pub fn band_scale(from: i32, to: i32) -> f64 {
    (NORM_FACTOR * f64::from(from - to)).exp()
}

/// Logarithm of a banded value.
#[inline(always)]
pub fn band_ln(mantissa: f64, band: i32) -> f64 {
    mantissa.ln() + NORM_FACTOR * f64::from(band)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logsumexp_small_1() {
        let a = 0.5f64;
        let b = 2f64;
        let expected = (a.exp() + b.exp()).ln();
        let result = logsumexp(a, b);
        assert!((expected - result).abs() < f64::EPSILON);
    }

    #[test]
    fn test_logsumexp_small_2() {
        let a = 12f64;
        let b = 5f64;
        let expected = (a.exp() + b.exp()).ln();
        let result = logsumexp(a, b);
        assert!((expected - result).abs() < f64::EPSILON);
    }

    #[test]
    fn test_logsumexp_large_1() {
        let a = 1234f64;
        let b = 1232f64;
        // log(exp(1234) + exp(1232))
        // = log(exp(1232 + 2) + exp(1232 + 0))
        // = log(exp(1232) * (exp(2) + exp(0)))
        // = 1232 + log(exp(2) + 1)
        let expected = 1232.0 + (2f64.exp() + 1.0).ln();
        let result = logsumexp(a, b);
        assert!((expected - result).abs() < f64::EPSILON);

        // The following naive calculation fails
        let naive = (a.exp() + b.exp()).ln();
        assert!(naive.is_infinite());
    }

    #[test]
    fn test_logsumexp_large_2() {
        let a = 1230f64;
        let b = 1235f64;
        let expected = 1230.0 + (1.0 + 5f64.exp()).ln();
        let result = logsumexp(a, b);
        assert!((expected - result).abs() < f64::EPSILON);

        let naive = (a.exp() + b.exp()).ln();
        assert!(naive.is_infinite());
    }

    #[test]
    fn test_logsumexp_neg_inf_1() {
        let a = f64::NEG_INFINITY;
        let b = 2.0;
        let expected = 2.0;
        let result = logsumexp(a, b);
        assert!((expected - result).abs() < f64::EPSILON);
    }

    #[test]
    fn test_logsumexp_neg_inf_2() {
        let a = f64::NEG_INFINITY;
        let b = f64::NEG_INFINITY;
        let result = logsumexp(a, b);
        assert_eq!(f64::NEG_INFINITY, result);
    }

    #[test]
    fn test_band_limit_matches_norm_factor() {
        assert!((BAND_LIMIT.ln() - NORM_FACTOR).abs() < 1e-9);
    }

    #[test]
    fn test_band_scale_round_trip() {
        let mantissa = 3.25f64;
        // Promoting a value by one band divides the mantissa by exp(NORM_FACTOR).
        let promoted = mantissa * band_scale(0, 1);
        assert!((band_ln(promoted, 1) - mantissa.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_band_ln() {
        let x = band_ln(2.0, 3);
        assert!((x - (2.0f64.ln() + 3.0 * NORM_FACTOR)).abs() < 1e-9);
    }
}
