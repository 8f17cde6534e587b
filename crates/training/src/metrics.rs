/// Training losses and accuracies accumulated between two logging intervals.
#[derive(Debug, Clone, Default)]
pub struct RollingMetrics {
    losses: Vec<f64>,
    accuracies: Vec<f64>,
}

impl RollingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, loss: f64, accuracy: f64) {
        self.losses.push(loss);
        self.accuracies.push(accuracy);
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn mean_loss(&self) -> f64 {
        mean(&self.losses)
    }

    pub fn mean_accuracy(&self) -> f64 {
        mean(&self.accuracies)
    }

    pub fn reset(&mut self) {
        self.losses.clear();
        self.accuracies.clear();
    }
}

/// Arithmetic mean; NaN for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Mean and standard error (population std over `sqrt(n)`).
pub fn mean_and_stderr(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    (m, variance.sqrt() / n.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_metrics_average_and_reset() {
        let mut metrics = RollingMetrics::new();
        assert!(metrics.mean_loss().is_nan());
        metrics.record(1.0, 0.5);
        metrics.record(3.0, 1.0);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics.mean_loss(), 2.0);
        assert_eq!(metrics.mean_accuracy(), 0.75);
        metrics.reset();
        assert!(metrics.is_empty());
    }

    #[test]
    fn stderr_uses_population_std() {
        let (m, se) = mean_and_stderr(&[1.0, 0.0, 1.0, 0.0]);
        assert_eq!(m, 0.5);
        assert!((se - 0.25).abs() < 1e-12);
        let (m, se) = mean_and_stderr(&[]);
        assert!(m.is_nan() && se.is_nan());
    }
}
