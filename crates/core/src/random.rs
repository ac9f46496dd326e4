use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

use crate::error::PipelineError;

/// Shared randomness used by sampling decisions.
///
/// Draws come from the OS CSPRNG; a time-seeded fallback is forbidden. When
/// the source fails the caller must fail closed (drop the record and count
/// it) rather than degrade to weaker randomness.
pub trait RandomSource: Send + Sync {
    /// Uniform draw in [0, 1).
    fn next_unit(&self) -> Result<f64, PipelineError>;
}

/// OS CSPRNG-backed source. Thread-safe; `OsRng` holds no state.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn next_unit(&self) -> Result<f64, PipelineError> {
        let mut buf = [0u8; 8];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| PipelineError::Random(e.to_string()))?;
        Ok(unit_from_bytes(buf))
    }
}

/// Deterministic source for tests and replay; not used in production paths.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_unit(&self) -> Result<f64, PipelineError> {
        let mut buf = [0u8; 8];
        self.rng.lock().fill_bytes(&mut buf);
        Ok(unit_from_bytes(buf))
    }
}

/// A source that always fails, for exercising the fail-closed path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingRandom;

impl RandomSource for FailingRandom {
    fn next_unit(&self) -> Result<f64, PipelineError> {
        Err(PipelineError::Random("entropy unavailable".to_string()))
    }
}

/// 53 uniform bits into [0, 1).
fn unit_from_bytes(buf: [u8; 8]) -> f64 {
    let x = u64::from_le_bytes(buf) >> 11;
    x as f64 * (1.0 / (1u64 << 53) as f64)
}
