//! Keyword-driven feature decomposition.
//!
//! Each feature yields at most one task per domain whose keywords appear in
//! its requirements, chained database → backend → frontend → test → docs.
//! Decomposition is deterministic and never fails: a feature that matches no
//! domain becomes a single backend task.

use serde::{Deserialize, Serialize};

use crate::core::{link_feature_dependencies, Complexity, Domain, Feature, Task};
use crate::error::Result;
use crate::pwlog_debug;

/// Keywords worth +3 to a task's complexity score.
const HIGH_RISK_KEYWORDS: &[&str] = &[
    "security",
    "secure",
    "auth",
    "payment",
    "encrypt",
    "credential",
    "permission",
];

/// Keywords worth +2.
const COORDINATION_KEYWORDS: &[&str] = &[
    "state machine",
    "concurrency",
    "concurrent",
    "parallel",
    "queue",
    "real-time",
    "realtime",
    "transaction",
];

/// Keywords worth +1.
const ROUTINE_KEYWORDS: &[&str] = &[
    "crud", "create", "read", "update", "delete", "list", "display", "view", "show",
];

/// A feature mentioning any of these makes every one of its tasks critical.
const CRITICAL_KEYWORDS: &[&str] = &["auth", "payment", "security"];

/// Domain keyword mapping used to decide which tasks a feature needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainKeywords {
    pub database: Vec<String>,
    pub backend: Vec<String>,
    pub frontend: Vec<String>,
    pub test: Vec<String>,
    pub docs: Vec<String>,
}

impl DomainKeywords {
    pub fn for_domain(&self, domain: Domain) -> &[String] {
        match domain {
            Domain::Database => &self.database,
            Domain::Backend => &self.backend,
            Domain::Frontend => &self.frontend,
            Domain::Test => &self.test,
            Domain::Docs => &self.docs,
            Domain::Infra => &[],
        }
    }
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for DomainKeywords {
    fn default() -> Self {
        Self {
            database: words(&[
                "schema",
                "table",
                "migration",
                "database",
                "sql",
                "column",
                "index",
                "query",
            ]),
            backend: words(&[
                "api",
                "endpoint",
                "server",
                "service",
                "backend",
                "handler",
                "webhook",
                "payment",
                "auth",
                "logic",
                "integration",
            ]),
            frontend: words(&[
                "ui",
                "page",
                "form",
                "button",
                "component",
                "frontend",
                "screen",
                "view",
                "dashboard",
                "display",
            ]),
            test: words(&["test", "coverage", "e2e", "verify"]),
            docs: words(&["doc", "readme", "guide", "changelog"]),
        }
    }
}

/// Case-insensitive match of `keyword` at the start of a word in `text`.
///
/// `text` must already be lowercase. "auth" matches "authentication" but
/// "ui" does not match "build".
fn mentions(text: &str, keyword: &str) -> bool {
    let keyword = keyword.to_lowercase();
    if keyword.is_empty() {
        return false;
    }
    text.match_indices(&keyword).any(|(pos, _)| {
        text[..pos]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric())
    })
}

fn mentions_any<S: AsRef<str>>(text: &str, keywords: &[S]) -> bool {
    keywords.iter().any(|k| mentions(text, k.as_ref()))
}

/// Weighted keyword count over a set of requirement lines.
pub fn complexity_score<S: AsRef<str>>(requirements: &[S]) -> u32 {
    let tiers: [(&[&str], u32); 3] = [
        (HIGH_RISK_KEYWORDS, 3),
        (COORDINATION_KEYWORDS, 2),
        (ROUTINE_KEYWORDS, 1),
    ];
    let mut score = 0;
    for req in requirements {
        let text = req.as_ref().to_lowercase();
        for (keywords, weight) in tiers {
            score += weight * keywords.iter().filter(|k| mentions(&text, k)).count() as u32;
        }
    }
    score
}

/// Expands features into atomic, domain-scoped tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskDecomposer {
    keywords: DomainKeywords,
}

impl TaskDecomposer {
    pub fn new(keywords: DomainKeywords) -> Self {
        Self { keywords }
    }

    pub fn keywords(&self) -> &DomainKeywords {
        &self.keywords
    }

    /// Decompose one feature. Always yields at least one task.
    pub fn decompose(&self, feature: &Feature) -> Vec<Task> {
        let critical = mentions_any(&feature.full_text().to_lowercase(), CRITICAL_KEYWORDS);

        let mut plan: Vec<(Domain, Vec<&String>)> = Domain::DECOMPOSITION_ORDER
            .iter()
            .filter_map(|&domain| {
                let keywords = self.keywords.for_domain(domain);
                let matching: Vec<&String> = feature
                    .requirements
                    .iter()
                    .filter(|req| mentions_any(&req.to_lowercase(), keywords))
                    .collect();
                (!matching.is_empty()).then_some((domain, matching))
            })
            .collect();

        let fallback = plan.is_empty();
        if fallback {
            plan.push((Domain::Backend, feature.requirements.iter().collect()));
        }

        let mut tasks: Vec<Task> = Vec::with_capacity(plan.len());
        for (domain, requirements) in plan {
            let complexity = if critical {
                Complexity::Critical
            } else {
                Complexity::from_score(complexity_score(&requirements))
            };

            let description = if requirements.is_empty() {
                feature.description.clone()
            } else {
                requirements
                    .iter()
                    .map(|r| r.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            };

            let mut task = Task::new(
                &feature.id,
                domain,
                complexity,
                &format!("{} ({})", feature.name, domain),
                &description,
            );
            task.acceptance_criteria = if fallback {
                feature.acceptance_criteria.clone()
            } else {
                let keywords = self.keywords.for_domain(domain);
                feature
                    .acceptance_criteria
                    .iter()
                    .filter(|c| mentions_any(&c.to_lowercase(), keywords))
                    .cloned()
                    .collect()
            };
            if task.acceptance_criteria.is_empty() {
                task.acceptance_criteria.push(format!(
                    "The {} work for '{}' satisfies its requirements",
                    domain, feature.name
                ));
            }
            if let Some(prev) = tasks.last() {
                task.dependencies.insert(prev.id.clone());
            }
            tasks.push(task);
        }

        pwlog_debug!(
            "TaskDecomposer: feature={} tasks={} critical={} fallback={}",
            feature.id,
            tasks.len(),
            critical,
            fallback
        );
        tasks
    }

    /// Decompose every feature and link inter-feature dependencies.
    ///
    /// # Errors
    /// Returns `UnknownDependency` if a feature depends on an unknown feature id.
    pub fn decompose_all(&self, features: &[Feature]) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = features.iter().flat_map(|f| self.decompose(f)).collect();
        link_feature_dependencies(features, &mut tasks)?;
        Ok(tasks)
    }
}
