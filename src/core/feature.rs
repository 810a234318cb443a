//! Feature data model.
//!
//! Features are the named units of product scope parsed from a spec document.
//! They are immutable after parsing and consumed by the decomposer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stable slug identifying a feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(String);

impl FeatureId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the string is already a valid slug (`[a-z0-9]` words joined by `-`).
    pub fn is_valid_slug(s: &str) -> bool {
        !s.is_empty()
            && !s.starts_with('-')
            && !s.ends_with('-')
            && !s.contains("--")
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }
}

impl From<&str> for FeatureId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FeatureId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lowercase, ASCII-alphanumeric words joined by single hyphens.
///
/// Returns an empty string when the input has no alphanumeric characters.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            slug.push(c.to_ascii_lowercase());
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Declared priority of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" | "p0" => Ok(Priority::Critical),
            "high" | "p1" => Ok(Priority::High),
            "medium" | "p2" => Ok(Priority::Medium),
            "low" | "p3" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A feature parsed from the spec document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Ids of features that must be fully built first.
    #[serde(default)]
    pub dependencies: BTreeSet<FeatureId>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl Feature {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: FeatureId::from(id),
            name: name.to_string(),
            description: String::new(),
            priority: None,
            status: None,
            requirements: Vec::new(),
            dependencies: BTreeSet::new(),
            acceptance_criteria: Vec::new(),
        }
    }

    pub fn with_requirement(mut self, requirement: &str) -> Self {
        self.requirements.push(requirement.to_string());
        self
    }

    pub fn with_acceptance(mut self, criterion: &str) -> Self {
        self.acceptance_criteria.push(criterion.to_string());
        self
    }

    pub fn depends_on(mut self, feature: &str) -> Self {
        self.dependencies.insert(FeatureId::from(feature));
        self
    }

    /// All free text of the feature, used for keyword scans.
    pub fn full_text(&self) -> String {
        let mut text = format!("{}\n{}", self.name, self.description);
        for req in &self.requirements {
            text.push('\n');
            text.push_str(req);
        }
        text
    }
}
