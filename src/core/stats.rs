//! Small numeric helpers shared by the compositor and the trend fit

use std::cmp::Ordering;
use std::ops::{Add, Div};

/// Median of the values; even counts average the two middle values.
///
/// Reorders `values` in place. NaN compares equal to everything, so callers
/// pass finite values only.
pub(crate) fn median<T>(values: &mut [T]) -> Option<T>
where
    T: Copy + PartialOrd + Add<Output = T> + Div<Output = T> + From<u8>,
{
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / T::from(2u8)
    } else {
        values[mid]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(median::<f32>(&mut []), None);
        assert_eq!(median(&mut [3.0f32, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0f32, 1.0]), Some(2.5));
        assert_eq!(median(&mut [-0.5f64, 0.25, 1.0, 10.0]), Some(0.625));
    }
}
