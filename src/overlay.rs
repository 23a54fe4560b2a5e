use std::path::{Path, PathBuf};

use crate::agent::Capability;

/// The instruction overlay lands at the top of the checkout where the
/// assistant runtime picks it up automatically.
pub const OVERLAY_FILE: &str = "CLAUDE.md";

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("failed to write overlay: {0}")]
    Io(#[from] std::io::Error),
}

/// Inputs for the dynamic half of the overlay.
#[derive(Debug, Clone)]
pub struct OverlayContext<'a> {
    pub agent_name: &'a str,
    pub capability: Capability,
    pub task_id: &'a str,
    pub depth: u32,
    pub can_spawn: bool,
    pub spec_path: Option<&'a str>,
    pub file_scope: &'a [String],
}

/// Static brief per capability. The dynamic section below it carries the
/// per-agent facts.
fn base_section(capability: Capability) -> &'static str {
    match capability {
        Capability::Coordinator => {
            "You coordinate the swarm. Decompose work, spawn leads via `overstory sling`, \
             track progress through mail, and never edit source yourself."
        }
        Capability::Lead => {
            "You lead a task. Write the task spec, spawn builders/scouts/reviewers via \
             `overstory sling`, review their results, and report upward by mail."
        }
        Capability::Builder => {
            "You implement. Work only inside your checkout, commit on your branch, and \
             send a worker_done mail to the orchestrator when your task is complete."
        }
        Capability::Scout => {
            "You investigate. Read anything, write nothing. Report findings by mail."
        }
        Capability::Reviewer => {
            "You review. Read the diff on the named branch, write nothing, and mail \
             your verdict to your parent."
        }
        Capability::Merger => {
            "You integrate. Operate only on merge state in your checkout and report \
             each resolution by mail."
        }
    }
}

/// Render the two-layer overlay: capability brief, then the agent's
/// dynamic facts. Pure so tests can assert on content.
pub fn render(ctx: &OverlayContext) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push(format!("# Agent: {}", ctx.agent_name));
    lines.push(String::new());
    lines.push(base_section(ctx.capability).to_string());
    lines.push(String::new());

    lines.push("## Assignment".into());
    lines.push(String::new());
    lines.push(format!("- Name: {}", ctx.agent_name));
    lines.push(format!("- Capability: {}", ctx.capability.as_str()));
    lines.push(format!("- Task: {}", ctx.task_id));
    lines.push(format!("- Depth: {}", ctx.depth));
    lines.push(format!(
        "- May spawn sub-agents: {}",
        if ctx.can_spawn { "yes" } else { "no" }
    ));
    if let Some(spec) = ctx.spec_path {
        lines.push(format!("- Spec: {spec}"));
    }
    if !ctx.file_scope.is_empty() {
        lines.push(format!("- File scope: {}", ctx.file_scope.join(", ")));
    }
    lines.push(String::new());

    lines.push("## Mail".into());
    lines.push(String::new());
    lines.push("- Check mail each prompt: `overstory mail check --inject --agent <you>`".into());
    lines.push("- Report status and results with `overstory mail send`".into());
    lines.push("- When finished, send type `worker_done` to `orchestrator` and stop.".into());

    lines.join("\n") + "\n"
}

/// Write the overlay into the checkout. Called exactly once at spawn; the
/// lifecycle manager never touches it again.
pub fn materialize(checkout: &Path, ctx: &OverlayContext) -> Result<PathBuf, OverlayError> {
    let path = checkout.join(OVERLAY_FILE);
    std::fs::write(&path, render(ctx))?;
    Ok(path)
}
