#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Execution tier for data-parallel kernels.
///
/// - `Scalar`: single-threaded lanes (default, works everywhere)
/// - `Parallel`: lanes spread over threads via rayon (requires `parallel` feature)
/// - `Gpu`: state updates given as WGSL lines run on wgpu (requires `gpu` feature)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionTier {
    #[default]
    Scalar,
    Parallel,
    Gpu,
}

impl ExecutionTier {
    /// Parse a tier name as used by `SPIKEGEN_EXEC_TIER`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scalar" | "cpu" => Some(ExecutionTier::Scalar),
            "parallel" | "rayon" => Some(ExecutionTier::Parallel),
            "gpu" | "wgpu" => Some(ExecutionTier::Gpu),
            _ => None,
        }
    }

    /// Returns the tier that will actually run, accounting for compile-time
    /// feature gates and runtime GPU availability.
    pub fn effective(self) -> ExecutionTier {
        match self {
            ExecutionTier::Scalar => ExecutionTier::Scalar,
            ExecutionTier::Parallel => {
                #[cfg(feature = "parallel")]
                {
                    ExecutionTier::Parallel
                }
                #[cfg(not(feature = "parallel"))]
                {
                    ExecutionTier::Scalar
                }
            }
            ExecutionTier::Gpu => {
                #[cfg(feature = "gpu")]
                {
                    if crate::gpu::gpu_available(crate::gpu::DEFAULT_MAX_ELEMENTS) {
                        ExecutionTier::Gpu
                    } else {
                        ExecutionTier::Parallel.effective()
                    }
                }
                #[cfg(not(feature = "gpu"))]
                {
                    ExecutionTier::Parallel.effective()
                }
            }
        }
    }

    /// Tier used for lanes that cannot run on the GPU.
    pub(crate) fn cpu(self) -> ExecutionTier {
        match self {
            ExecutionTier::Gpu => ExecutionTier::Parallel.effective(),
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimulationConfig {
    /// Simulation step in seconds.
    pub dt: f32,
    /// Run horizon in seconds.
    pub duration: f32,
    /// Seed for every random stream (synapse thinning, `rand()` in lanes).
    pub seed: u64,
    pub tier: ExecutionTier,
    /// Capacity of the synapse builder's staging buffer, in pairs.
    pub staging_capacity: usize,
    /// Free-form text shown to hosts alongside progress.
    pub description: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            dt: 1e-4,
            duration: 1.0,
            seed: 1,
            tier: ExecutionTier::Scalar,
            staging_capacity: Self::DEFAULT_STAGING_CAPACITY,
            description: String::new(),
        }
    }
}

impl SimulationConfig {
    pub const DEFAULT_STAGING_CAPACITY: usize = 1024;

    pub fn new(dt: f32, duration: f32) -> Self {
        Self {
            dt,
            duration,
            ..Default::default()
        }
    }

    /// Validate the configuration, returning an error message if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.dt.is_finite() || self.dt <= 0.0 {
            return Err(ConfigError::Invalid("dt must be finite and > 0"));
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(ConfigError::Invalid("duration must be finite and >= 0"));
        }
        if self.staging_capacity == 0 {
            return Err(ConfigError::Invalid("staging_capacity must be >= 1"));
        }
        Ok(())
    }

    /// Simulated time at the start of `step`, computed as `step * dt`.
    pub fn time_at(&self, step: u64) -> f32 {
        (step as f64 * self.dt as f64) as f32
    }

    /// Number of steps the loop executes: the smallest `k` with
    /// `time_at(k) >= duration`, so the run ends exactly when `t` first
    /// reaches the horizon.
    pub fn total_steps(&self) -> u64 {
        let positive = |x: f32| x.is_finite() && x > 0.0;
        if !positive(self.duration) || !positive(self.dt) {
            return 0;
        }
        let mut k = (self.duration as f64 / self.dt as f64).ceil() as u64;
        while k > 0 && self.time_at(k - 1) >= self.duration {
            k -= 1;
        }
        while self.time_at(k) < self.duration {
            k += 1;
        }
        k
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_tier(mut self, tier: ExecutionTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_staging_capacity(mut self, capacity: usize) -> Self {
        self.staging_capacity = capacity;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Apply `SPIKEGEN_EXEC_TIER` and `SPIKEGEN_SEED` overrides from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("SPIKEGEN_EXEC_TIER") {
            match ExecutionTier::parse(&v) {
                Some(tier) => self.tier = tier,
                None => tracing::warn!("Unknown SPIKEGEN_EXEC_TIER value: {}", v),
            }
        }
        if let Ok(v) = std::env::var("SPIKEGEN_SEED") {
            match v.trim().parse() {
                Ok(seed) => self.seed = seed,
                Err(_) => tracing::warn!("Unparseable SPIKEGEN_SEED value: {}", v),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_count_matches_horizon() {
        assert_eq!(SimulationConfig::new(0.1, 1.0).total_steps(), 10);
        assert_eq!(SimulationConfig::new(0.1, 0.3).total_steps(), 3);
        assert_eq!(SimulationConfig::new(0.1, 0.35).total_steps(), 4);
        assert_eq!(SimulationConfig::new(0.25, 1.0).total_steps(), 4);
        assert_eq!(SimulationConfig::new(0.1, 0.0).total_steps(), 0);
    }

    #[test]
    fn long_runs_reach_the_horizon() {
        for (dt, duration, expected) in [
            (1e-4, 0.50004, 5001),
            (1e-3, 10.0004, 10001),
            (1e-4, 10.00004, 100001),
            (1e-4, 10.0, 100000),
        ] {
            let config = SimulationConfig::new(dt, duration);
            let steps = config.total_steps();
            assert_eq!(steps, expected, "dt={dt} duration={duration}");
            assert!(config.time_at(steps) >= duration);
            assert!(config.time_at(steps - 1) < duration);
        }
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(SimulationConfig::new(0.0, 1.0).validate().is_err());
        assert!(SimulationConfig::new(0.1, -1.0).validate().is_err());
        assert!(SimulationConfig::new(0.1, 1.0)
            .with_staging_capacity(0)
            .validate()
            .is_err());
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn tier_names_parse() {
        assert_eq!(ExecutionTier::parse("Parallel"), Some(ExecutionTier::Parallel));
        assert_eq!(ExecutionTier::parse(" gpu "), Some(ExecutionTier::Gpu));
        assert_eq!(ExecutionTier::parse("simd"), None);
    }

    #[test]
    fn scalar_is_always_effective() {
        assert_eq!(ExecutionTier::Scalar.effective(), ExecutionTier::Scalar);
    }
}
