//! Min/max overview of a sample run, one bucket per `decimation` samples

use crate::error::{ConvertError, Result};
use ndarray::Array2;
use num_traits::PrimInt;

/// Number of whole buckets a run of `samples` yields; the remainder is dropped
pub fn overview_len(samples: usize, decimation: usize) -> usize {
    if decimation == 0 {
        0
    } else {
        samples / decimation
    }
}

/// Build a `2 x (N / decimation)` array: row 0 holds each bucket's minimum, row 1 its maximum.
///
/// Trailing samples that do not fill a whole bucket are ignored. A run shorter than
/// one bucket gives an empty `2 x 0` array.
pub fn build_overview<T: PrimInt>(samples: &[T], decimation: usize) -> Result<Array2<T>> {
    if decimation == 0 {
        return Err(ConvertError::InvalidDimensions(
            "decimation factor must be at least 1".to_string(),
        ));
    }

    let buckets = overview_len(samples.len(), decimation);
    let mut out = Array2::from_elem((2, buckets), T::zero());
    for (i, bucket) in samples.chunks_exact(decimation).enumerate() {
        let (lo, hi) = bucket
            .iter()
            .fold((T::max_value(), T::min_value()), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        out[[0, i]] = lo;
        out[[1, i]] = hi;
    }
    Ok(out)
}
