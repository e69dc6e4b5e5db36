// Core data structures shared across the search pipeline

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Qualitative label for how completely a cell was searched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    /// Not yet searched
    Unknown,
}

impl CoverageQuality {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for CoverageQuality {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for CoverageQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CoverageQuality {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "excellent" => Self::Excellent,
            "good" => Self::Good,
            "fair" => Self::Fair,
            "poor" => Self::Poor,
            _ => Self::Unknown,
        })
    }
}

/// One business listing returned by the search API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Business {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Collects businesses, dropping duplicates by id while keeping first-seen order
#[derive(Debug, Default)]
pub struct BusinessSet {
    seen: HashSet<String>,
    items: Vec<Business>,
}

impl BusinessSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a business, returning false if its id was already present
    pub fn insert(&mut self, business: Business) -> bool {
        if self.seen.insert(business.id.clone()) {
            self.items.push(business);
            true
        } else {
            false
        }
    }

    pub fn extend(&mut self, businesses: impl IntoIterator<Item = Business>) {
        for business in businesses {
            self.insert(business);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<Business> {
        self.items
    }
}
