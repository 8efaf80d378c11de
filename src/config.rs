//! Refinement configuration
//!
//! Tuning knobs for the iterative center-of-mass refinement, loadable from a
//! TOML file. The defaults mirror the reference harness: up to 100 refinement
//! iterations with a 1e-6 per-coordinate convergence tolerance.
//!
//! # Example
//!
//! ```
//! use recenter::RecenterConfig;
//!
//! let config = RecenterConfig::from_toml_str("max_iterations = 50\ntolerance = 1e-8\n").unwrap();
//! assert_eq!(config.max_iterations, 50);
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default bound on refinement iterations
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Default per-coordinate convergence tolerance
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Configuration for the iterative recentering refinement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecenterConfig {
    /// Maximum number of refinement iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Convergence tolerance: the refinement stops once no coordinate of the
    /// centroid estimate moves by this much between consecutive iterations
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_max_iterations() -> usize {
    DEFAULT_MAX_ITERATIONS
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

impl Default for RecenterConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl RecenterConfig {
    /// Parse configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: RecenterConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            anyhow::bail!("max_iterations must be at least 1");
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            anyhow::bail!(
                "tolerance must be a finite positive number, got {}",
                self.tolerance
            );
        }
        Ok(())
    }
}
