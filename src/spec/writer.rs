//! Re-serialization of parsed specs.
//!
//! The writer always emits explicit `Id:` lines and id-based `Depends on:`
//! lines, so a written document parses back to the same features even when
//! names collide or were renamed.

use std::fmt::Write;

use crate::core::Feature;

use super::SpecDocument;

/// Renders a `SpecDocument` back to the markdown heading contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecWriter;

impl SpecWriter {
    pub fn new() -> Self {
        Self
    }

    pub fn render(&self, doc: &SpecDocument) -> String {
        let mut out = String::new();
        match &doc.project {
            Some(name) => {
                let _ = writeln!(out, "# Project: {}", name);
            }
            None => out.push_str("# Project\n"),
        }
        if !doc.overview.is_empty() {
            let _ = writeln!(out, "\n{}", doc.overview);
        }
        out.push_str("\n## Features\n");
        for feature in &doc.features {
            out.push('\n');
            self.render_feature(&mut out, feature);
        }
        out
    }

    fn render_feature(&self, out: &mut String, feature: &Feature) {
        let _ = writeln!(out, "### {}", feature.name);
        let _ = writeln!(out, "Id: {}", feature.id);
        if let Some(priority) = feature.priority {
            let _ = writeln!(out, "Priority: {}", priority);
        }
        if let Some(status) = &feature.status {
            let _ = writeln!(out, "Status: {}", status);
        }
        if !feature.description.is_empty() {
            let _ = writeln!(out, "Description: {}", feature.description);
        }
        if !feature.dependencies.is_empty() {
            let deps: Vec<&str> = feature.dependencies.iter().map(|d| d.as_str()).collect();
            let _ = writeln!(out, "Depends on: {}", deps.join(", "));
        }
        if !feature.requirements.is_empty() {
            out.push_str("Requirements:\n");
            for req in &feature.requirements {
                let _ = writeln!(out, "- {}", req);
            }
        }
        if !feature.acceptance_criteria.is_empty() {
            out.push_str("Acceptance Criteria:\n");
            for criterion in &feature.acceptance_criteria {
                let _ = writeln!(out, "- [ ] {}", criterion);
            }
        }
    }
}
