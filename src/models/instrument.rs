//! Tradeable instruments and their asset classes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Category of instrument. Each class has its own trading hours and risk rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Equity,
    Fund,
    Crypto,
    Derivative,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Equity => "equity",
            AssetClass::Fund => "fund",
            AssetClass::Crypto => "crypto",
            AssetClass::Derivative => "derivative",
        }
    }

    /// Whether short positions are possible for this class at the broker.
    pub fn supports_short(&self) -> bool {
        matches!(self, AssetClass::Derivative)
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "equity" | "stock" | "stocks" => Ok(AssetClass::Equity),
            "fund" | "etf" | "funds" => Ok(AssetClass::Fund),
            "crypto" => Ok(AssetClass::Crypto),
            "derivative" | "derivatives" => Ok(AssetClass::Derivative),
            other => Err(format!("unknown asset class: {}", other)),
        }
    }
}

/// A tradeable instrument, identified by ISIN rather than a broker product id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub isin: String,

    #[serde(default)]
    pub name: String,

    pub asset_class: AssetClass,
}

impl Instrument {
    pub fn new(isin: impl Into<String>, name: impl Into<String>, asset_class: AssetClass) -> Self {
        Self {
            isin: isin.into(),
            name: name.into(),
            asset_class,
        }
    }

    /// Name for display, falling back to the ISIN.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.isin
        } else {
            &self.name
        }
    }
}
