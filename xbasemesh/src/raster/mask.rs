//! The one nodata predicate.
//!
//! Nodata in the wild is messy: absent, a sentinel like `-32768`, or NaN.
//! Every fill strategy, coverage count, and blend overlay in this crate goes
//! through [`is_nodata`] / [`mask`] so NaN sentinels are compared NaN-aware
//! instead of with `==` (which is never true for NaN and silently turns
//! "30% void" into "fully valid").

/// Whether a single sample is nodata under the given sentinel.
#[inline]
pub fn is_nodata(value: f32, nodata: Option<f64>) -> bool {
    match nodata {
        None => false,
        Some(nd) if nd.is_nan() => value.is_nan(),
        Some(nd) => value == nd as f32,
    }
}

/// Boolean mask over a sample slice; `true` marks nodata cells.
///
/// With `nodata = None` the mask is all-false.
pub fn mask(data: &[f32], nodata: Option<f64>) -> Vec<bool> {
    data.iter().map(|&v| is_nodata(v, nodata)).collect()
}

/// Count of nodata cells without allocating a mask.
pub fn count_nodata(data: &[f32], nodata: Option<f64>) -> u64 {
    match nodata {
        None => 0,
        Some(nd) if nd.is_nan() => data.iter().filter(|v| v.is_nan()).count() as u64,
        Some(nd) => {
            let nd = nd as f32;
            data.iter().filter(|&&v| v == nd).count() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_sentinel_means_all_valid() {
        let data = [1.0, f32::NAN, -32768.0];
        assert_eq!(mask(&data, None), vec![false, false, false]);
        assert_eq!(count_nodata(&data, None), 0);
    }

    #[test]
    fn test_sentinel_equality() {
        let data = [1.0, -32768.0, 5.0, -32768.0];
        assert_eq!(mask(&data, Some(-32768.0)), vec![false, true, false, true]);
        assert_eq!(count_nodata(&data, Some(-32768.0)), 2);
    }

    #[test]
    fn test_nan_sentinel_is_nan_aware() {
        let data = [1.0, f32::NAN, 5.0];
        assert_eq!(mask(&data, Some(f64::NAN)), vec![false, true, false]);
        assert_eq!(count_nodata(&data, Some(f64::NAN)), 1);
    }

    #[test]
    fn test_nan_sample_under_numeric_sentinel_is_valid() {
        // NaN samples only count as nodata when the sentinel itself is NaN.
        assert!(!is_nodata(f32::NAN, Some(-32768.0)));
    }
}
