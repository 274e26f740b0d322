// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

fn read_non_empty(path: std::path::PathBuf) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Free-form custom rules appended verbatim to the system prompt when the
/// repository carries a `.dodo/rules` file.
pub fn load_rules(repo_root: &Path) -> Option<String> {
    read_non_empty(repo_root.join(".dodo").join("rules"))
}

/// Project-level plan from `.dodo/plan.md`, if present.
pub fn load_project_plan(repo_root: &Path) -> Option<String> {
    read_non_empty(repo_root.join(".dodo").join("plan.md"))
}

/// Build the system prompt for a session.  `rules` come from
/// `.dodo/rules`; the project plan from `.dodo/plan.md` is appended when
/// present so long-running work keeps its bearings across sessions.
pub fn system_prompt(repo_root: &Path, workspace_context: &str, rules: Option<&str>) -> String {
    let mut prompt = format!(
        "You are dodo, a coding agent working inside the repository at {}.\n\
         \n\
         Work in small verifiable steps: search and read before you decide, \
         plan before you edit, validate after you change anything. Use the \
         `plan` tool to lay out 3-6 concrete steps before any edit tool; edit \
         tools stay locked until a plan exists. When the task is complete, \
         call `respond` with a summary, the files you changed, and suggested \
         next steps.\n\
         \n\
         Tool results are ground truth; never invent file contents or paths. \
         If a tool fails, read the error and adjust instead of repeating the \
         same call.",
        repo_root.display()
    );

    if !workspace_context.is_empty() {
        prompt.push_str("\n\nTop-level workspace entries:\n");
        prompt.push_str(workspace_context);
    }
    if let Some(rules) = rules {
        prompt.push_str("\n\nProject rules:\n");
        prompt.push_str(rules);
    }
    if let Some(plan) = load_project_plan(repo_root) {
        prompt.push_str("\n\nProject plan (.dodo/plan.md):\n");
        prompt.push_str(&plan);
    }
    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_mentions_repo_and_workflow() {
        let p = system_prompt(Path::new("/work/repo"), "", None);
        assert!(p.contains("/work/repo"));
        assert!(p.contains("`plan`"));
        assert!(p.contains("`respond`"));
    }

    #[test]
    fn workspace_context_is_appended() {
        let p = system_prompt(Path::new("/r"), "src/\nCargo.toml", None);
        assert!(p.contains("src/"));
        assert!(p.contains("Cargo.toml"));
    }

    #[test]
    fn rules_are_appended_verbatim() {
        let p = system_prompt(Path::new("/r"), "", Some("never touch vendored code"));
        assert!(p.contains("Project rules:"));
        assert!(p.contains("never touch vendored code"));
    }

    #[test]
    fn load_rules_reads_dodo_rules_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".dodo")).unwrap();
        std::fs::write(dir.path().join(".dodo/rules"), "  use tabs  \n").unwrap();
        assert_eq!(load_rules(dir.path()).as_deref(), Some("use tabs"));
    }

    #[test]
    fn load_rules_missing_or_empty_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_rules(dir.path()).is_none());
        std::fs::create_dir_all(dir.path().join(".dodo")).unwrap();
        std::fs::write(dir.path().join(".dodo/rules"), "   \n").unwrap();
        assert!(load_rules(dir.path()).is_none());
    }

    #[test]
    fn project_plan_is_appended_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".dodo")).unwrap();
        std::fs::write(dir.path().join(".dodo/plan.md"), "# Milestone 1\n- ship it\n").unwrap();
        let p = system_prompt(dir.path(), "", None);
        assert!(p.contains("Project plan"));
        assert!(p.contains("Milestone 1"));
    }
}
