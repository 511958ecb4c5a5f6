use anyhow::{bail, Result};
use tracing::{info, warn};

/// Fraction of records held out for validation, in `[0, 1]`.
/// Zero selects memorization mode where train and validation are the same set.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TestSize(f64);

impl TestSize {
    pub fn new(fraction: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&fraction) {
            bail!("test_size must be within [0, 1], got {fraction}");
        }
        Ok(Self(fraction))
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// Validation records for a corpus of `total` records. Never zero when
    /// the fraction is positive and at least two records exist.
    pub fn num_val(self, total: usize) -> usize {
        let num_val = (total as f64 * self.0).floor() as usize;
        if num_val == 0 && self.0 > 0.0 && total > 1 {
            warn!("dataset is very small, forcing 1 validation sample");
            1
        } else {
            num_val
        }
    }
}

/// Train/validation partition of an ordered record list.
#[derive(Debug, Clone, PartialEq)]
pub enum Split<T> {
    /// Disjoint partitions: validation is the tail of the list.
    Holdout { train: Vec<T>, val: Vec<T> },
    /// Train and validation are both the full list.
    Memorize(Vec<T>),
}

impl<T> Split<T> {
    pub fn new(mut records: Vec<T>, test_size: TestSize) -> Self {
        if test_size.get() == 0.0 {
            info!(
                "split: using full dataset ({} samples) for both train and val (memorization)",
                records.len()
            );
            return Split::Memorize(records);
        }
        let num_val = test_size.num_val(records.len());
        let val = records.split_off(records.len() - num_val);
        if val.is_empty() {
            warn!("split: validation set is empty");
        }
        info!(
            "split: {} training samples, {} validation samples",
            records.len(),
            val.len()
        );
        Split::Holdout {
            train: records,
            val,
        }
    }

    pub fn train(&self) -> &[T] {
        match self {
            Split::Holdout { train, .. } => train,
            Split::Memorize(all) => all,
        }
    }

    pub fn val(&self) -> &[T] {
        match self {
            Split::Holdout { val, .. } => val,
            Split::Memorize(all) => all,
        }
    }
}
