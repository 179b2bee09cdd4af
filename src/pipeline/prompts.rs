//! System prompts per agent and the user-turn builders for each stage.
//!
//! Built-in prompts are deliberately short; deployments are expected to ship
//! their own through `[prompts] dir`, one `<agent>.md` file per agent.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use tracing::info;

use super::step_runner::Agent;
use crate::pipeline::models::{GeneratedFile, Job};

fn builtin(agent: Agent) -> &'static str {
    match agent {
        Agent::Spec => {
            "You turn a feature brief into a precise technical specification in Markdown. \
             Cover scope, data model, interfaces, edge cases and acceptance criteria."
        }
        Agent::Plan => {
            "You write an implementation plan in Markdown for the given specification. \
             List the files to create or change and the order of work."
        }
        Agent::Tests => {
            "You write a test plan in Markdown for the given specification and implementation plan. \
             Name each test case, its setup and the expected outcome."
        }
        Agent::Implementer => {
            "You implement the feature described by the specification, plan and test plan. \
             Respond only by calling the write_files tool with the complete contents of every file. \
             Paths are relative to the repository root."
        }
        Agent::SecurityReviewer => {
            "You review generated code for security problems: injection, authorization gaps, \
             secret handling and unsafe input processing. Finish with a line that reads exactly \
             `VERDICT: PASS` or `VERDICT: FAIL`."
        }
        Agent::CodeReviewer => {
            "You review generated code for correctness, completeness against the specification \
             and maintainability. Finish with a line that reads exactly `VERDICT: PASS` or `VERDICT: FAIL`."
        }
        Agent::Alignment => {
            "You check whether a pipeline deliverable still matches the original brief. \
             Reply with a short recommendation: what is missing, what drifted, or that it is aligned."
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    overrides: HashMap<Agent, String>,
}

impl PromptLibrary {
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Load `<agent>.md` overrides from `dir`. Missing files keep the
    /// built-in prompt.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let mut overrides = HashMap::new();
        for agent in Agent::ALL {
            let path = dir.join(format!("{}.md", agent.as_str()));
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt {}", path.display()))?;
            if !text.trim().is_empty() {
                overrides.insert(agent, text);
            }
        }
        info!(dir = %dir.display(), overrides = overrides.len(), "loaded prompt overrides");
        Ok(Self { overrides })
    }

    pub fn system(&self, agent: Agent) -> &str {
        self.overrides
            .get(&agent)
            .map(String::as_str)
            .unwrap_or_else(|| builtin(agent))
    }
}

fn section(out: &mut String, heading: &str, body: &str) {
    out.push_str("## ");
    out.push_str(heading);
    out.push_str("\n\n");
    out.push_str(body.trim_end());
    out.push_str("\n\n");
}

pub fn spec_prompt(job: &Job) -> String {
    let mut out = format!("# Feature: {}\n\n", job.title);
    section(&mut out, "Brief", &job.brief);
    out.push_str("Write the specification.");
    out
}

pub fn plan_prompt(job: &Job, spec: &str) -> String {
    let mut out = format!("# Feature: {}\n\n", job.title);
    section(&mut out, "Specification", spec);
    out.push_str("Write the implementation plan.");
    out
}

pub fn tests_prompt(job: &Job, spec: &str, plan: &str) -> String {
    let mut out = format!("# Feature: {}\n\n", job.title);
    section(&mut out, "Specification", spec);
    section(&mut out, "Implementation plan", plan);
    out.push_str("Write the test plan.");
    out
}

pub fn implement_prompt(job: &Job, spec: &str, plan: &str, tests: &str) -> String {
    let mut out = format!("# Feature: {}\n\n", job.title);
    section(&mut out, "Specification", spec);
    section(&mut out, "Implementation plan", plan);
    section(&mut out, "Test plan", tests);
    out.push_str("Implement the feature and its tests by calling write_files.");
    out
}

pub fn review_prompt(job: &Job, spec: &str, plan: &str, files: &[GeneratedFile]) -> String {
    let mut out = format!("# Feature: {}\n\n", job.title);
    section(&mut out, "Specification", spec);
    section(&mut out, "Implementation plan", plan);
    out.push_str("## Generated files\n\n");
    for file in files {
        out.push_str(&format!("### {}\n\n```\n{}\n```\n\n", file.path, file.content.trim_end()));
    }
    out.push_str("Review the generated files.");
    out
}

pub fn alignment_prompt(job: &Job, stage: &str, deliverable: &str) -> String {
    let mut out = format!("# Feature: {}\n\n", job.title);
    section(&mut out, "Original brief", &job.brief);
    section(&mut out, &format!("Current {stage}"), deliverable);
    out.push_str("Does this deliverable still match the brief?");
    out
}
