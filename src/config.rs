// ⚙️ Compliance Configuration - Regulatory parameters as data
// Targets, energy conversion, comparison rule and borrowing policy are loaded
// from JSON instead of being compiled in.

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// FuelEU reference-period intensity reduced by 2% (gCO2e/MJ)
pub const DEFAULT_TARGET_INTENSITY: f64 = 89.3368;

/// Lower calorific value used to turn tonnes of fuel into MJ
pub const DEFAULT_ENERGY_MJ_PER_TONNE: f64 = 41_000.0;

// ============================================================================
// TARGET SCHEDULE
// ============================================================================

/// A target intensity that applies from `from_year` until the next step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStep {
    pub from_year: i32,
    pub intensity: f64,
}

fn default_schedule() -> Vec<TargetStep> {
    [
        (2025, 89.3368),
        (2030, 85.6904),
        (2035, 77.9418),
        (2040, 62.9004),
        (2045, 34.6408),
        (2050, 18.2320),
    ]
    .into_iter()
    .map(|(from_year, intensity)| TargetStep { from_year, intensity })
    .collect()
}

// ============================================================================
// COMPARISON RULE
// ============================================================================

/// How `compliant` is decided for a route in the baseline comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "camelCase")]
pub enum ComparisonRule {
    /// comparison <= baseline
    Baseline,

    /// comparison <= baseline * (1 + percent / 100)
    Allowance { percent: f64 },

    /// comparison <= regulatory target for the route's year
    RegulatoryTarget,
}

impl Default for ComparisonRule {
    fn default() -> Self {
        ComparisonRule::Baseline
    }
}

// ============================================================================
// BORROWING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BorrowingConfig {
    pub enabled: bool,

    /// Share of `target * energy` that may be borrowed for one year
    pub cap_fraction: f64,

    /// Borrowed credit is deducted from the following year times this factor
    pub repayment_multiplier: f64,
}

impl Default for BorrowingConfig {
    fn default() -> Self {
        BorrowingConfig {
            enabled: false,
            cap_fraction: 0.02,
            repayment_multiplier: 1.1,
        }
    }
}

// ============================================================================
// COMPLIANCE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComplianceConfig {
    /// Used for years before the first schedule step
    pub default_target: f64,

    /// Step schedule, any order
    pub targets: Vec<TargetStep>,

    pub energy_mj_per_tonne: f64,

    pub comparison: ComparisonRule,

    pub borrowing: BorrowingConfig,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        ComplianceConfig {
            default_target: DEFAULT_TARGET_INTENSITY,
            targets: default_schedule(),
            energy_mj_per_tonne: DEFAULT_ENERGY_MJ_PER_TONNE,
            comparison: ComparisonRule::default(),
            borrowing: BorrowingConfig::default(),
        }
    }
}

impl ComplianceConfig {
    /// Load configuration from JSON file; missing keys fall back to defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: ComplianceConfig =
            serde_json::from_str(&content).context("Failed to parse compliance config JSON")?;

        config.validate()?;
        Ok(config)
    }

    /// A flat target for every year (handy for fixtures and what-if runs)
    pub fn with_flat_target(target: f64) -> Self {
        ComplianceConfig {
            default_target: target,
            targets: Vec::new(),
            ..ComplianceConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.energy_mj_per_tonne.is_finite() && self.energy_mj_per_tonne > 0.0) {
            anyhow::bail!("energyMjPerTonne must be positive");
        }
        if !self.default_target.is_finite() {
            anyhow::bail!("defaultTarget must be finite");
        }
        if let Some(step) = self.targets.iter().find(|s| !s.intensity.is_finite()) {
            anyhow::bail!("target for {} must be finite", step.from_year);
        }
        if !(0.0..=1.0).contains(&self.borrowing.cap_fraction) {
            anyhow::bail!("borrowing.capFraction must be within [0, 1]");
        }
        if !(self.borrowing.repayment_multiplier >= 1.0 && self.borrowing.repayment_multiplier.is_finite()) {
            anyhow::bail!("borrowing.repaymentMultiplier must be a finite number of at least 1.0");
        }
        if let ComparisonRule::Allowance { percent } = self.comparison {
            if !(percent.is_finite() && percent >= 0.0) {
                anyhow::bail!("comparison allowance percent must be a non-negative number");
            }
        }
        Ok(())
    }

    /// Regulatory target intensity for a reporting year
    pub fn target_for(&self, year: i32) -> f64 {
        self.targets
            .iter()
            .filter(|step| step.from_year <= year)
            .max_by_key(|step| step.from_year)
            .map(|step| step.intensity)
            .unwrap_or(self.default_target)
    }
}

// ============================================================================
// TESTS
// ============================================================================
