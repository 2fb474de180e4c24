use std::collections::BTreeMap;

/// Running means of named metrics over one loop
#[derive(Debug, Clone, Default)]
pub struct KeepAverage {
    avg_values: BTreeMap<String, f64>,
    iters: BTreeMap<String, usize>,
}

impl KeepAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.avg_values.get(name).copied()
    }

    /// Fold one value into the mean of `name`
    pub fn update_value(&mut self, name: &str, value: f64) {
        let iters = self.iters.entry(name.to_string()).or_insert(0);
        let avg = self.avg_values.entry(name.to_string()).or_insert(0.0);
        *iters += 1;
        *avg += (value - *avg) / *iters as f64;
    }

    /// Update every entry, prefixing names with `avg_`
    pub fn update_values<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        for (name, value) in values {
            self.update_value(&format!("avg_{}", name), value);
        }
    }

    pub fn avg_values(&self) -> &BTreeMap<String, f64> {
        &self.avg_values
    }

    pub fn into_values(self) -> BTreeMap<String, f64> {
        self.avg_values
    }

    pub fn is_empty(&self) -> bool {
        self.avg_values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_mean_equals_batch_mean() {
        let values = [3.5, -1.0, 12.25, 0.0, 7.75, 2.0, 1e-3];
        let expected = values.iter().sum::<f64>() / values.len() as f64;

        let mut forward = KeepAverage::new();
        let mut backward = KeepAverage::new();
        for v in values {
            forward.update_value("loss", v);
        }
        for v in values.iter().rev() {
            backward.update_value("loss", *v);
        }

        assert!((forward.get("loss").unwrap() - expected).abs() < 1e-9);
        assert!((backward.get("loss").unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_first_value_is_counted() {
        let mut avg = KeepAverage::new();
        avg.update_value("x", 10.0);
        assert_eq!(avg.get("x"), Some(10.0));
        avg.update_value("x", 0.0);
        assert_eq!(avg.get("x"), Some(5.0));
    }

    #[test]
    fn test_update_values_prefixes_names() {
        let mut avg = KeepAverage::new();
        avg.update_values([("loss", 1.0), ("align_error", 0.5)]);
        avg.update_values([("loss", 3.0), ("align_error", 0.25)]);
        assert_eq!(avg.get("avg_loss"), Some(2.0));
        assert_eq!(avg.get("avg_align_error"), Some(0.375));
        assert!(avg.get("loss").is_none());
    }
}
