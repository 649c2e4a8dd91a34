//! Loss bookkeeping and metric emission
//!
//! A [`LossBreakdown`] carries the per-term values of a single step. The
//! trainers feed breakdowns into [`LossAccumulator`] windows (one for the
//! progress log, one for the epoch summary, advancing independently) and
//! emit means through a [`MetricSink`].

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::Result;

/// Per-term losses of one optimization step, in a stable display order
#[derive(Debug, Clone, Default)]
pub struct LossBreakdown {
    /// Total loss the optimizer stepped on
    pub total: f64,
    /// Named components summing (weighted) to the total
    pub terms: Vec<(String, f64)>,
}

impl LossBreakdown {
    pub fn new(total: f64) -> Self {
        Self {
            total,
            terms: Vec::new(),
        }
    }

    pub fn with_term(mut self, name: &str, value: f64) -> Self {
        self.terms.push((name.to_string(), value));
        self
    }

    pub fn term(&self, name: &str) -> Option<f64> {
        self.terms
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| *v)
    }
}

/// Destination for scalar time series
pub trait MetricSink {
    fn scalar(&mut self, name: &str, value: f64, step: u64) -> Result<()>;
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    name: &'a str,
    value: f64,
    step: u64,
}

/// Appends metrics as JSON lines, one object per scalar
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricSink for JsonlSink {
    fn scalar(&mut self, name: &str, value: f64, step: u64) -> Result<()> {
        let record = ScalarRecord { name, value, step };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Running sums of loss terms over a window of steps.
///
/// Term order follows first insertion so log lines stay stable. The total
/// is tracked under the name `loss` alongside the components.
#[derive(Debug, Default)]
pub struct LossAccumulator {
    sums: Vec<(String, f64)>,
    count: u64,
}

impl LossAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, breakdown: &LossBreakdown) {
        self.add("loss", breakdown.total);
        for (name, value) in &breakdown.terms {
            self.add(name, *value);
        }
        self.count += 1;
    }

    fn add(&mut self, name: &str, value: f64) {
        match self.sums.iter_mut().find(|(n, _)| n.as_str() == name) {
            Some((_, sum)) => *sum += value,
            None => self.sums.push((name.to_string(), value)),
        }
    }

    /// Mean of every recorded term over the current window
    pub fn means(&self) -> Vec<(String, f64)> {
        if self.count == 0 {
            return Vec::new();
        }
        self.sums
            .iter()
            .map(|(name, sum)| (name.clone(), sum / self.count as f64))
            .collect()
    }

    pub fn reset(&mut self) {
        self.sums.clear();
        self.count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
