//! Markdown spec parser.
//!
//! Reads the heading contract (`# Project`, `## Features`, one `### <name>`
//! block per feature) into an ordered list of features. Parsing is two-pass:
//! blocks are collected first, then ids are assigned and textual
//! `Depends on:` references are resolved against the complete feature list.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::{slugify, Feature, FeatureId, Priority};
use crate::error::{Error, Result};
use crate::{pwlog_debug, pwlog_trace};

/// Field line, optionally bulleted: `Priority: High`, `- Depends on: A`.
/// A bold key (`**Priority:** High`, `**Priority**: High`) must close around
/// the colon; asterisks in the value are kept.
static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:[-*+]\s+)?(?:\*\*(id|priority|status|description|depends on|dependencies|requirements|acceptance criteria)\s*(?::\s*\*\*|\*\*\s*:)|(id|priority|status|description|depends on|dependencies|requirements|acceptance criteria)\s*:)\s*(.*)$",
    )
    .unwrap()
});

/// List item: `- x`, `* x`, `+ x`, `1. x`, `1) x`.
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*+]|\d+[.)])\s+(.*)$").unwrap());

/// Leading task-list checkbox: `[ ]`, `[x]`, `[X]`.
static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[[ xX]\]\s*").unwrap());

/// A parsed specification document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpecDocument {
    /// Project name from the `# Project` heading, if any.
    pub project: Option<String>,
    /// Free text between the project heading and the first `##` section.
    pub overview: String,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Description,
    Requirements,
    Acceptance,
}

/// A `###` block before ids are assigned and references resolved.
#[derive(Debug, Default)]
struct RawFeature {
    name: String,
    explicit_id: Option<String>,
    priority: Option<Priority>,
    status: Option<String>,
    description: Vec<String>,
    requirements: Vec<String>,
    acceptance: Vec<String>,
    depends_on: Vec<String>,
}

/// Parser for the markdown spec heading contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecParser;

impl SpecParser {
    pub fn new() -> Self {
        Self
    }

    /// Read and parse a spec document from disk.
    pub fn parse_file(&self, path: &Path) -> Result<SpecDocument> {
        pwlog_debug!("SpecParser::parse_file path={}", path.display());
        let text = std::fs::read_to_string(path)?;
        self.parse(&text)
    }

    /// Parse a spec document.
    ///
    /// # Errors
    /// - `MalformedSpec` if `## Features` is missing, a feature heading is
    ///   empty, or a field value is invalid
    /// - `DuplicateFeatureId` if two explicit ids collide
    /// - `UnknownDependency` if a `Depends on:` reference matches no feature
    pub fn parse(&self, text: &str) -> Result<SpecDocument> {
        let (project, overview, raws) = self.collect(text)?;
        let ids = assign_ids(&raws)?;
        let features = resolve(raws, ids)?;
        pwlog_debug!(
            "SpecParser::parse project={:?} features={}",
            project,
            features.len()
        );
        Ok(SpecDocument {
            project,
            overview,
            features,
        })
    }

    /// First pass: split the document into raw feature blocks.
    fn collect(&self, text: &str) -> Result<(Option<String>, String, Vec<RawFeature>)> {
        let mut project: Option<String> = None;
        let mut overview: Vec<&str> = Vec::new();
        let mut in_overview = false;
        let mut seen_features = false;
        let mut in_features = false;
        let mut raws: Vec<RawFeature> = Vec::new();
        let mut current: Option<RawFeature> = None;
        let mut section = Section::None;

        for (lineno, line) in text.lines().enumerate() {
            let trimmed = line.trim();

            if let Some(heading) = trimmed.strip_prefix("# ") {
                in_overview = true;
                if let Some(done) = current.take() {
                    raws.push(done);
                }
                in_features = false;
                if project.is_none() {
                    project = project_name(heading);
                }
                continue;
            }

            if let Some(heading) = trimmed.strip_prefix("## ") {
                in_overview = false;
                if let Some(done) = current.take() {
                    raws.push(done);
                }
                in_features = heading.trim().eq_ignore_ascii_case("features");
                seen_features |= in_features;
                continue;
            }

            if in_overview {
                overview.push(line);
                continue;
            }

            if !in_features {
                continue;
            }

            if let Some(name) = trimmed.strip_prefix("### ") {
                if let Some(done) = current.take() {
                    raws.push(done);
                }
                let name = name.trim();
                if name.is_empty() {
                    return Err(Error::MalformedSpec {
                        reason: format!("empty feature heading at line {}", lineno + 1),
                    });
                }
                pwlog_trace!("SpecParser: feature block '{}' at line {}", name, lineno + 1);
                current = Some(RawFeature {
                    name: name.to_string(),
                    ..Default::default()
                });
                section = Section::None;
                continue;
            }

            let Some(feature) = current.as_mut() else {
                continue;
            };

            if let Some(sub) = trimmed.strip_prefix("#### ") {
                section = match sub.trim().trim_end_matches(':').to_lowercase().as_str() {
                    "description" => Section::Description,
                    "requirements" => Section::Requirements,
                    "acceptance criteria" => Section::Acceptance,
                    _ => Section::None,
                };
                continue;
            }

            if trimmed.is_empty() {
                continue;
            }

            let in_list = matches!(section, Section::Requirements | Section::Acceptance);
            let is_bullet = BULLET_RE.is_match(trimmed);

            if !(in_list && is_bullet) {
                if let Some(caps) = FIELD_RE.captures(trimmed) {
                    let key = caps
                        .get(1)
                        .or_else(|| caps.get(2))
                        .map_or(String::new(), |m| m.as_str().to_lowercase());
                    let value = caps[3].trim();
                    section = apply_field(feature, &key, value)?;
                    continue;
                }
            }

            match section {
                Section::Requirements | Section::Acceptance => {
                    let list = if section == Section::Requirements {
                        &mut feature.requirements
                    } else {
                        &mut feature.acceptance
                    };
                    if let Some(caps) = BULLET_RE.captures(trimmed) {
                        let mut item = caps[1].trim();
                        if section == Section::Acceptance {
                            item = CHECKBOX_RE.find(item).map_or(item, |m| &item[m.end()..]);
                        }
                        if !item.is_empty() {
                            list.push(item.to_string());
                        }
                    } else if let Some(last) = list.last_mut() {
                        // Wrapped continuation of the previous item.
                        last.push(' ');
                        last.push_str(trimmed);
                    } else {
                        list.push(trimmed.to_string());
                    }
                }
                Section::Description | Section::None => {
                    feature.description.push(trimmed.to_string());
                }
            }
        }

        if let Some(done) = current.take() {
            raws.push(done);
        }

        if !seen_features {
            return Err(Error::MalformedSpec {
                reason: "missing required section '## Features'".to_string(),
            });
        }

        Ok((project, overview.join("\n").trim().to_string(), raws))
    }
}

/// Project name from a level-1 heading: `Project: Shop`, `Project - Shop`, or the heading text.
fn project_name(heading: &str) -> Option<String> {
    let heading = heading.trim();
    let name = match (heading.get(..7), heading.get(7..)) {
        (Some(prefix), Some(rest))
            if prefix.eq_ignore_ascii_case("project")
                && rest
                    .chars()
                    .next()
                    .map_or(true, |c| c == ':' || c == '-' || c.is_whitespace()) =>
        {
            rest.trim_start_matches(|c: char| c == ':' || c == '-' || c.is_whitespace())
                .trim()
        }
        _ => heading,
    };
    (!name.is_empty()).then(|| name.to_string())
}

/// Store a field value and return the section subsequent lines belong to.
fn apply_field(feature: &mut RawFeature, key: &str, value: &str) -> Result<Section> {
    match key {
        "id" => {
            if !value.is_empty() {
                feature.explicit_id = Some(value.to_string());
            }
            Ok(Section::None)
        }
        "priority" => {
            if !value.is_empty() {
                let priority = value.parse::<Priority>().map_err(|e| Error::MalformedSpec {
                    reason: format!("feature '{}': {}", feature.name, e),
                })?;
                feature.priority = Some(priority);
            }
            Ok(Section::None)
        }
        "status" => {
            if !value.is_empty() {
                feature.status = Some(value.to_string());
            }
            Ok(Section::None)
        }
        "description" => {
            if !value.is_empty() {
                feature.description.push(value.to_string());
            }
            Ok(Section::Description)
        }
        "depends on" | "dependencies" => {
            feature.depends_on.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty() && !r.eq_ignore_ascii_case("none"))
                    .map(str::to_string),
            );
            Ok(Section::None)
        }
        "requirements" => {
            if !value.is_empty() {
                feature.requirements.push(value.to_string());
            }
            Ok(Section::Requirements)
        }
        _ => {
            if !value.is_empty() {
                feature.acceptance.push(value.to_string());
            }
            Ok(Section::Acceptance)
        }
    }
}

/// Second pass, part one: explicit ids are validated and reserved, then
/// derived ids take the slug of the name with `-2`, `-3`, ... on collision.
fn assign_ids(raws: &[RawFeature]) -> Result<Vec<FeatureId>> {
    let mut taken: HashSet<String> = HashSet::new();

    for raw in raws {
        if let Some(id) = &raw.explicit_id {
            if !FeatureId::is_valid_slug(id) {
                return Err(Error::MalformedSpec {
                    reason: format!("feature '{}': invalid id '{}'", raw.name, id),
                });
            }
            if !taken.insert(id.clone()) {
                return Err(Error::DuplicateFeatureId { id: id.clone() });
            }
        }
    }

    let mut ids = Vec::with_capacity(raws.len());
    for (index, raw) in raws.iter().enumerate() {
        if let Some(id) = &raw.explicit_id {
            ids.push(FeatureId::from(id.as_str()));
            continue;
        }
        let mut base = slugify(&raw.name);
        if base.is_empty() {
            base = format!("feature-{}", index + 1);
        }
        let mut candidate = base.clone();
        let mut suffix = 2;
        while taken.contains(&candidate) {
            candidate = format!("{}-{}", base, suffix);
            suffix += 1;
        }
        if candidate != base {
            pwlog_debug!("SpecParser: id '{}' taken, '{}' becomes '{}'", base, raw.name, candidate);
        }
        taken.insert(candidate.clone());
        ids.push(FeatureId::from(candidate));
    }
    Ok(ids)
}

/// Second pass, part two: build features and resolve `Depends on:` references
/// by exact id, then by case-insensitive name.
fn resolve(raws: Vec<RawFeature>, ids: Vec<FeatureId>) -> Result<Vec<Feature>> {
    let lookup: Vec<(FeatureId, String)> = ids
        .iter()
        .zip(&raws)
        .map(|(id, raw)| (id.clone(), raw.name.to_lowercase()))
        .collect();

    let mut features = Vec::with_capacity(raws.len());
    for (raw, id) in raws.into_iter().zip(ids) {
        let mut dependencies = std::collections::BTreeSet::new();
        for reference in &raw.depends_on {
            let wanted = reference.to_lowercase();
            let target = lookup
                .iter()
                .find(|(fid, _)| fid.as_str() == reference)
                .or_else(|| lookup.iter().find(|(_, name)| *name == wanted))
                .map(|(fid, _)| fid.clone())
                .ok_or_else(|| Error::UnknownDependency {
                    feature: id.to_string(),
                    reference: reference.clone(),
                })?;
            dependencies.insert(target);
        }

        features.push(Feature {
            id,
            name: raw.name,
            description: raw.description.join(" "),
            priority: raw.priority,
            status: raw.status,
            requirements: raw.requirements,
            dependencies,
            acceptance_criteria: raw.acceptance,
        });
    }
    Ok(features)
}
