use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How much removal risk a patch may take on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyProfile {
    /// Low-risk dead functions whose removal keeps brackets unambiguous
    #[default]
    Conservative,
    /// Every dead function, nothing touching an uncertain one
    Balanced,
    /// Balanced plus export-only uncertain functions nobody names dynamically
    Aggressive,
}

impl SafetyProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for SafetyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SafetyProfile {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(format!(
                "unknown safety profile '{other}' (expected conservative, balanced or aggressive)"
            )),
        }
    }
}

/// Tunables for patch generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Conservative profile keeps only candidates strictly below this risk
    pub conservative_max_risk: f64,

    /// Unchanged lines around each hunk
    pub context_lines: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            conservative_max_risk: 0.35,
            context_lines: 3,
        }
    }
}
