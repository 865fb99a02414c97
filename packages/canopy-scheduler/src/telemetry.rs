use std::time::Duration;

/// Exponential smoothing factor for the duration averages.
const SMOOTHING: f64 = 0.2;

/// Drain telemetry: totals and moving-average durations for the serial and
/// parallel processing paths, and the derived efficiency of going parallel.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainTelemetry {
    pub serial_drains: u64,
    pub parallel_drains: u64,
    avg_serial_ms: Option<f64>,
    avg_parallel_ms: Option<f64>,
}

fn fold(avg: &mut Option<f64>, sample_ms: f64) {
    *avg = Some(match *avg {
        Some(prev) => prev * (1.0 - SMOOTHING) + sample_ms * SMOOTHING,
        None => sample_ms,
    });
}

impl DrainTelemetry {
    pub fn record_serial(&mut self, elapsed: Duration) {
        self.serial_drains += 1;
        fold(&mut self.avg_serial_ms, elapsed.as_secs_f64() * 1000.0);
    }

    pub fn record_parallel(&mut self, elapsed: Duration) {
        self.parallel_drains += 1;
        fold(&mut self.avg_parallel_ms, elapsed.as_secs_f64() * 1000.0);
    }

    pub fn avg_serial_ms(&self) -> f64 {
        self.avg_serial_ms.unwrap_or(0.0)
    }

    pub fn avg_parallel_ms(&self) -> f64 {
        self.avg_parallel_ms.unwrap_or(0.0)
    }

    /// `(avg_serial - avg_parallel) / avg_serial`, as a percentage.
    /// Zero until both paths have at least one sample.
    pub fn efficiency_pct(&self) -> f64 {
        match (self.avg_serial_ms, self.avg_parallel_ms) {
            (Some(serial), Some(parallel)) if serial > 0.0 => {
                (serial - parallel) / serial * 100.0
            }
            _ => 0.0,
        }
    }
}
