//! Measurement statistics

use serde::{Deserialize, Serialize};

use gate_core::{GateError, GateResult};

/// Running statistics over reported cycles
///
/// A cycle counts as successful when its elapsed time is positive; min, max
/// and mean cover successful cycles only.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: u64,
    pub successful: u64,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub avg_ms: f64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one reported cycle
    pub fn record(&mut self, elapsed_ms: u64) {
        self.total += 1;
        if elapsed_ms == 0 {
            return;
        }

        self.successful += 1;
        self.min_ms = Some(self.min_ms.map_or(elapsed_ms, |m| m.min(elapsed_ms)));
        self.max_ms = Some(self.max_ms.map_or(elapsed_ms, |m| m.max(elapsed_ms)));
        let n = self.successful as f64;
        self.avg_ms = (self.avg_ms * (n - 1.0) + elapsed_ms as f64) / n;
    }

    /// Cycles that did not yield a usable time
    pub fn failed(&self) -> u64 {
        self.total - self.successful
    }

    pub fn to_json(&self) -> GateResult<String> {
        serde_json::to_string(self).map_err(|e| GateError::Io(e.to_string()))
    }
}
