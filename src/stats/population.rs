use serde::Serialize;

/// Median of `data`; 0 for an empty slice.
///
/// For an even count this is the truncated integer average of the two middle values.
pub fn median(data: &[u64]) -> u64 {
    let mut sorted = data.to_vec();
    median_in_place(&mut sorted)
}

/// Like `median`, but sorts `data` in place instead of copying.
pub(crate) fn median_in_place(data: &mut [u64]) -> u64 {
    let n = data.len();
    if n == 0 {
        return 0;
    }
    data.sort_unstable();
    if n % 2 == 0 {
        ((data[n / 2 - 1] as u128 + data[n / 2] as u128) / 2) as u64
    } else {
        data[n / 2]
    }
}

/// Order-preserving sequence of latency samples.
///
/// Storage doubles its capacity whenever an append finds it full. A population is owned
/// by the campaign loop and written from that thread only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Population {
    samples: Vec<u64>,
}

impl Population {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: u64) {
        if self.samples.len() == self.samples.capacity() {
            let grow = self.samples.capacity().max(1);
            self.samples.reserve_exact(grow);
        }
        self.samples.push(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.samples
    }

    pub fn median(&self) -> u64 {
        median(&self.samples)
    }

    /// Drop samples outside `[max(0, Q1 - 1.5 IQR), Q3 + 1.5 IQR]`, keeping the order of
    /// the rest. Quartiles are taken by position (`n/4`, `3n/4`) in a sorted copy, without
    /// interpolation. Populations with fewer than 4 samples are left untouched.
    ///
    /// Returns the number of removed samples.
    pub fn clean_outliers(&mut self) -> usize {
        let n = self.samples.len();
        if n < 4 {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let q1 = sorted[n / 4];
        let q3 = sorted[(3 * n) / 4];
        // bounds in half-cycles so 1.5 * IQR stays exact for any magnitude
        let iqr = (q3 - q1) as u128;
        let lower2 = (2 * q1 as u128).saturating_sub(3 * iqr);
        let upper2 = 2 * q3 as u128 + 3 * iqr;

        self.samples
            .retain(|&v| (lower2..=upper2).contains(&(2 * v as u128)));
        let lower = ((lower2 + 1) / 2) as u64;
        let upper = (upper2 / 2).min(u64::MAX as u128) as u64;
        let removed = n - self.samples.len();
        if removed > 0 {
            debug!(
                "Removed {} outliers outside [{}, {}] from population",
                removed, lower, upper
            );
        }
        removed
    }
}

impl Extend<u64> for Population {
    fn extend<T: IntoIterator<Item = u64>>(&mut self, iter: T) {
        for v in iter {
            self.push(v);
        }
    }
}

impl FromIterator<u64> for Population {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        let mut p = Population::default();
        p.extend(iter);
        p
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;
    use crate::util::Rng;

    #[test]
    fn test_median() {
        assert_eq!(median(&[1, 2, 3, 4]), 2);
        assert_eq!(median(&[1, 2, 3]), 2);
        assert_eq!(median(&[4, 1, 3, 2]), 2);
        assert_eq!(median(&[]), 0);
        assert_eq!(median(&[u64::MAX, u64::MAX]), u64::MAX);
    }

    #[test]
    fn test_push_doubles_capacity() {
        let mut p = Population::with_capacity(4);
        for v in 0..4 {
            p.push(v);
        }
        assert_eq!(p.capacity(), 4);
        p.push(4);
        assert!(p.capacity() >= 8);
        assert_eq!(p.as_slice(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_clean_outliers_removes_extreme() {
        let mut p: Population = (1..=10).chain([1000]).collect();
        assert_eq!(p.clean_outliers(), 1);
        assert_eq!(p.as_slice(), &(1..=10).collect::<Vec<u64>>()[..]);
    }

    #[test]
    fn test_clean_outliers_small_untouched() {
        let mut p: Population = [1, 1000, 100_000].into_iter().collect();
        assert_eq!(p.clean_outliers(), 0);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn test_clean_outliers_keeps_interquartile() {
        let data: Vec<u64> = vec![
            5, 900, 120, 130, 110, 125, 3, 140, 135, 115, 5000, 128, 119, 0, 131, 122,
        ];
        let mut sorted = data.clone();
        sorted.sort_unstable();
        let (q1, q3) = (sorted[data.len() / 4], sorted[3 * data.len() / 4]);

        let mut p: Population = data.iter().copied().collect();
        p.clean_outliers();
        assert!(p.len() <= data.len());
        for v in data.iter().filter(|&&v| v > q1 && v < q3) {
            assert!(p.as_slice().contains(v), "{} was removed", v);
        }
        // order of the surviving samples is preserved
        let kept: Vec<u64> = data
            .iter()
            .copied()
            .filter(|v| p.as_slice().contains(v))
            .collect();
        assert_eq!(kept, p.as_slice());
    }

    #[test]
    fn test_clean_outliers_keeps_interquartile_at_any_magnitude() {
        let mut rng = Rng::from_seed(0x10);
        for round in 0..500 {
            let base = match round % 4 {
                0 => 0,
                1 => 1_000,
                2 => 1 << 60,
                _ => u64::MAX - (1 << 20),
            };
            let n = 4 + rng.next_u64() as usize % 60;
            let spread = 1 + rng.next_u64() % 1_000;
            let data: Vec<u64> = (0..n).map(|_| base + rng.next_u64() % spread).collect();
            let mut sorted = data.clone();
            sorted.sort_unstable();
            let (q1, q3) = (sorted[n / 4], sorted[3 * n / 4]);

            let mut p: Population = data.iter().copied().collect();
            let removed = p.clean_outliers();
            assert_eq!(removed + p.len(), n);
            for v in data.iter().filter(|&&v| v >= q1 && v <= q3) {
                assert!(p.as_slice().contains(v), "{} removed (q1 {}, q3 {})", v, q1, q3);
            }
        }
    }

    #[test]
    fn test_clean_outliers_large_magnitude() {
        let base = 1u64 << 60;
        let mut p: Population = [base + 129, base + 129, base + 130, base + 131]
            .into_iter()
            .collect();
        assert_eq!(p.clean_outliers(), 0);
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn test_clean_outliers_half_cycle_fence() {
        // q1 = 100, q3 = 103, 1.5 * IQR = 4.5 -> keep [95.5, 107.5]
        let mut p: Population = [100, 100, 101, 103, 103, 103, 95, 96, 107, 108, 101, 102]
            .into_iter()
            .collect();
        assert_eq!(p.clean_outliers(), 2);
        assert!(!p.as_slice().contains(&95) && !p.as_slice().contains(&108));
        assert!(p.as_slice().contains(&96) && p.as_slice().contains(&107));
    }

    #[test]
    fn test_clean_outliers_lower_bound() {
        // q1 = 100, q3 = 104, fence = 6 -> keep [94, 110]
        let mut p: Population = [100, 101, 102, 103, 104, 104, 93, 94, 110, 111, 100, 102]
            .into_iter()
            .collect();
        p.clean_outliers();
        assert!(!p.as_slice().contains(&93));
        assert!(p.as_slice().contains(&94));
        assert!(p.as_slice().contains(&110));
        assert!(!p.as_slice().contains(&111));
    }
}
