/// Running mean and extrema over a group of normalized scores.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreStats {
    pub count: usize,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl ScoreStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    /// Arithmetic mean; `None` for an empty group.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }
}

impl FromIterator<f64> for ScoreStats {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stats = ScoreStats::default();
        for value in iter {
            stats.push(value);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_group_has_no_mean() {
        let stats = ScoreStats::default();
        assert_eq!(stats.count, 0);
        assert!(stats.mean().is_none());
        assert!(stats.min().is_none());
    }

    #[test]
    fn test_mean_and_extrema() {
        let stats: ScoreStats = [0.8, 0.6, 0.7].into_iter().collect();
        assert_eq!(stats.count, 3);
        assert!((stats.mean().unwrap() - 0.7).abs() < 1e-12);
        assert_eq!(stats.min(), Some(0.6));
        assert_eq!(stats.max(), Some(0.8));
    }

    #[test]
    fn test_negative_and_zero_scores_are_real_extrema() {
        let stats: ScoreStats = [0.0, -0.5].into_iter().collect();
        assert_eq!(stats.max(), Some(0.0));
        assert_eq!(stats.min(), Some(-0.5));
    }
}
