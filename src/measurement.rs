//! Measurement points and result sets for sweeps.
//!
//! A [`MeasurementPoint`] is identified by its independent variables
//! (frequency, input power, gate and drain voltage). Two points with the same
//! independent variables are the same point, whatever was measured. This lets
//! a sweep skip points already in a [`ResultSet`] and merge repeated runs.

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementPoint {
    /// Hz
    pub frequency: f64,
    /// dBm
    pub input_power: f64,
    /// V
    pub gate_voltage: Option<f64>,
    /// V
    pub drain_voltage: Option<f64>,
    /// Whether the drain current should be measured at this point.
    #[serde(default)]
    pub measure_current: bool,
    /// A
    pub drain_current: Option<f64>,
    /// dBm
    pub output_power: Option<f64>,
}

impl MeasurementPoint {
    pub fn new(frequency: f64, input_power: f64) -> Self {
        Self {
            frequency,
            input_power,
            gate_voltage: None,
            drain_voltage: None,
            measure_current: false,
            drain_current: None,
            output_power: None,
        }
    }

    pub fn with_gate_voltage(mut self, volts: f64) -> Self {
        self.gate_voltage = Some(volts);
        self
    }

    pub fn with_drain_voltage(mut self, volts: f64) -> Self {
        self.drain_voltage = Some(volts);
        self
    }

    pub fn measuring_current(mut self) -> Self {
        self.measure_current = true;
        self
    }

    fn key(&self) -> (f64, f64, Option<f64>, Option<f64>) {
        (
            self.frequency,
            self.input_power,
            self.gate_voltage,
            self.drain_voltage,
        )
    }

    /// Whether every requested dependent value is present.
    pub fn is_complete(&self) -> bool {
        self.output_power.is_some() && (!self.measure_current || self.drain_current.is_some())
    }

    /// Take the dependent values `other` has.
    fn merge_from(&mut self, other: &MeasurementPoint) {
        if other.drain_current.is_some() {
            self.drain_current = other.drain_current;
        }
        if other.output_power.is_some() {
            self.output_power = other.output_power;
        }
        self.measure_current |= other.measure_current;
    }
}

/// Equality over the independent variables only.
impl PartialEq for MeasurementPoint {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

/// Results of one run, keyed by independent variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub name: String,
    points: Vec<MeasurementPoint>,
}

impl ResultSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[MeasurementPoint] {
        &self.points
    }

    pub fn contains(&self, point: &MeasurementPoint) -> bool {
        self.get(point).is_some()
    }

    pub fn get(&self, point: &MeasurementPoint) -> Option<&MeasurementPoint> {
        self.points.iter().find(|p| *p == point)
    }

    /// Insert `point`, or merge its dependent values into the stored point
    /// with the same key.
    pub fn record(&mut self, point: MeasurementPoint) {
        match self.points.iter_mut().find(|p| **p == point) {
            Some(existing) => existing.merge_from(&point),
            None => self.points.push(point),
        }
    }

    /// Copy stored dependent values into `requested`. Returns how many points
    /// were found.
    pub fn fill(&self, requested: &mut [MeasurementPoint]) -> usize {
        let mut found = 0;
        for point in requested.iter_mut() {
            if let Some(stored) = self.get(point) {
                point.merge_from(stored);
                found += 1;
            }
        }
        found
    }

    /// The requested points that still need measuring.
    pub fn pending(&self, requested: &[MeasurementPoint]) -> Vec<MeasurementPoint> {
        requested
            .iter()
            .filter(|point| !self.get(point).is_some_and(MeasurementPoint::is_complete))
            .cloned()
            .collect()
    }

    /// Write the set to `path` as JSON, creating parent directories.
    pub fn save_json(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        info!(results = %self.name, points = self.points.len(), "Saved to {}", path.display());
        Ok(())
    }

    pub fn load_json(path: &Path) -> AppResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let results: Self = serde_json::from_reader(reader)?;
        debug!(results = %results.name, points = results.points.len(), "Loaded from {}", path.display());
        Ok(results)
    }
}
