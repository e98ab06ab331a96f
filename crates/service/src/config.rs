use anyhow::{bail, Context, Result};
use reaper_analysis::{CoverageMapper, RiskWeights, ScriptFilter, DEFAULT_BOUNDARY_TOLERANCE};
use reaper_lifecycle::LifecycleConfig;
use reaper_patch::PatchConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DATA_DIR: &str = ".reaper";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Conservative profile threshold
    pub conservative_max: f64,
    #[serde(flatten)]
    pub weights: RiskWeights,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            conservative_max: PatchConfig::default().conservative_max_risk,
            weights: RiskWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageConfig {
    pub boundary_tolerance: usize,
    pub include_url_prefixes: Vec<String>,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            boundary_tolerance: DEFAULT_BOUNDARY_TOLERANCE,
            include_url_prefixes: vec![
                "http".to_string(),
                "https".to_string(),
                "chrome-extension://".to_string(),
                "file://".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyConfig {
    pub replay_timeout_secs: u64,
    pub coverage_drop_threshold_pct: f64,

    /// External replay command: program followed by its fixed arguments
    #[serde(default)]
    pub replay_command: Vec<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            replay_timeout_secs: 600,
            coverage_drop_threshold_pct: 2.0,
            replay_command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub data_dir: PathBuf,
    pub risk: RiskConfig,
    pub coverage: CoverageConfig,
    pub verify: VerifyConfig,
    pub context_lines: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            risk: RiskConfig::default(),
            coverage: CoverageConfig::default(),
            verify: VerifyConfig::default(),
            context_lines: PatchConfig::default().context_lines,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    data_dir: Option<PathBuf>,
    risk: Option<RawRisk>,
    coverage: Option<RawCoverage>,
    verify: Option<RawVerify>,
    patch: Option<RawPatch>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRisk {
    conservative_max: Option<f64>,
    base: Option<f64>,
    size_ceiling_bytes: Option<usize>,
    size_weight: Option<f64>,
    handler_name_weight: Option<f64>,
    public_name_weight: Option<f64>,
    uncertain_neighbor_weight: Option<f64>,
    uncertain_neighbor_cap: Option<f64>,
    uncertain_penalty: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCoverage {
    boundary_tolerance: Option<usize>,
    include_url_prefixes: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVerify {
    replay_timeout_secs: Option<u64>,
    coverage_drop_threshold_pct: Option<f64>,
    replay_command: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPatch {
    context_lines: Option<usize>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|err| anyhow::anyhow!("{key}={raw:?}: {err}"))
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ReaperConfig {
    /// Defaults, then the config file (if any), then `REAPER_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            config.merge(Self::parse_raw(path, &text)?);
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn parse_raw(path: &Path, text: &str) -> Result<RawConfig> {
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(text)
                .with_context(|| format!("Invalid JSON config {}", path.display()))
        } else {
            toml::from_str(text).with_context(|| format!("Invalid TOML config {}", path.display()))
        }
    }

    fn merge(&mut self, raw: RawConfig) {
        set(&mut self.data_dir, raw.data_dir);

        let risk = raw.risk.unwrap_or_default();
        set(&mut self.risk.conservative_max, risk.conservative_max);
        let weights = &mut self.risk.weights;
        set(&mut weights.base, risk.base);
        set(&mut weights.size_ceiling_bytes, risk.size_ceiling_bytes);
        set(&mut weights.size_weight, risk.size_weight);
        set(&mut weights.handler_name_weight, risk.handler_name_weight);
        set(&mut weights.public_name_weight, risk.public_name_weight);
        set(&mut weights.uncertain_neighbor_weight, risk.uncertain_neighbor_weight);
        set(&mut weights.uncertain_neighbor_cap, risk.uncertain_neighbor_cap);
        set(&mut weights.uncertain_penalty, risk.uncertain_penalty);

        let coverage = raw.coverage.unwrap_or_default();
        set(&mut self.coverage.boundary_tolerance, coverage.boundary_tolerance);
        set(
            &mut self.coverage.include_url_prefixes,
            coverage.include_url_prefixes,
        );

        let verify = raw.verify.unwrap_or_default();
        set(&mut self.verify.replay_timeout_secs, verify.replay_timeout_secs);
        set(
            &mut self.verify.coverage_drop_threshold_pct,
            verify.coverage_drop_threshold_pct,
        );
        set(&mut self.verify.replay_command, verify.replay_command);

        set(
            &mut self.context_lines,
            raw.patch.and_then(|p| p.context_lines),
        );
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = var("REAPER_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir.trim());
        }
        set(
            &mut self.risk.conservative_max,
            parse_env("REAPER_CONSERVATIVE_MAX", var("REAPER_CONSERVATIVE_MAX"))?,
        );
        set(
            &mut self.coverage.boundary_tolerance,
            parse_env("REAPER_BOUNDARY_TOLERANCE", var("REAPER_BOUNDARY_TOLERANCE"))?,
        );
        if let Some(prefixes) = var("REAPER_INCLUDE_URL_PREFIXES") {
            self.coverage.include_url_prefixes = split_list(&prefixes, ',');
        }
        set(
            &mut self.verify.replay_timeout_secs,
            parse_env("REAPER_REPLAY_TIMEOUT_SECS", var("REAPER_REPLAY_TIMEOUT_SECS"))?,
        );
        set(
            &mut self.verify.coverage_drop_threshold_pct,
            parse_env(
                "REAPER_COVERAGE_DROP_THRESHOLD_PCT",
                var("REAPER_COVERAGE_DROP_THRESHOLD_PCT"),
            )?,
        );
        if let Some(command) = var("REAPER_REPLAY_COMMAND") {
            self.verify.replay_command = command.split_whitespace().map(str::to_string).collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let weights = &self.risk.weights;
        let unit = [
            ("risk.conservative_max", self.risk.conservative_max),
            ("risk.base", weights.base),
            ("risk.size_weight", weights.size_weight),
            ("risk.handler_name_weight", weights.handler_name_weight),
            ("risk.public_name_weight", weights.public_name_weight),
            ("risk.uncertain_neighbor_weight", weights.uncertain_neighbor_weight),
            ("risk.uncertain_neighbor_cap", weights.uncertain_neighbor_cap),
            ("risk.uncertain_penalty", weights.uncertain_penalty),
        ];
        for (key, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                bail!("{key} must be within [0, 1], got {value}");
            }
        }
        if weights.size_ceiling_bytes == 0 {
            bail!("risk.size_ceiling_bytes must be positive");
        }
        if self.verify.replay_timeout_secs == 0 {
            bail!("verify.replay_timeout_secs must be positive");
        }
        let threshold = self.verify.coverage_drop_threshold_pct;
        if threshold.is_nan() || threshold < 0.0 {
            bail!("verify.coverage_drop_threshold_pct must be non-negative, got {threshold}");
        }
        Ok(())
    }

    pub fn patch_config(&self) -> PatchConfig {
        PatchConfig {
            conservative_max_risk: self.risk.conservative_max,
            context_lines: self.context_lines,
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            boundary_tolerance: self.coverage.boundary_tolerance,
            replay_timeout: Duration::from_secs(self.verify.replay_timeout_secs),
            coverage_drop_threshold_pct: self.verify.coverage_drop_threshold_pct,
        }
    }

    pub fn mapper(&self) -> CoverageMapper {
        CoverageMapper::new(self.coverage.boundary_tolerance)
    }

    pub fn script_filter(&self) -> ScriptFilter {
        ScriptFilter::new(self.coverage.include_url_prefixes.clone())
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }
}
