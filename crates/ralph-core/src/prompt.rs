//! Prompt template resolution and per-iteration assembly.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::prd::UserStory;

/// Built-in fallback used when no template file resolves.
pub const BUILTIN_TEMPLATE: &str = r#"You are in an autonomous coding loop driving a PRD to completion.

1. Read the PRD and the progress log referenced above.
2. Select the highest-priority incomplete user story.
3. Implement it fully, with tests.
4. Run the project's validation (tests, build, lint).
5. Update the PRD: set passing acceptance criteria and story `passes` flags.
6. Append what you did and what you learned to the progress log. Keep the
   "Codebase Patterns" section up to date.
7. Commit your changes.

When EVERY story in the PRD passes, output exactly: <promise>COMPLETE</promise>
"#;

/// Resolve the prompt template, first hit wins:
/// `-p FILE` > `$RALPH_PROMPT` > `./prompt.md` > user-scoped default > built-in.
pub fn resolve_template(
    cli_path: Option<&Path>,
    cwd: &Path,
    user_default: &Path,
) -> std::io::Result<String> {
    if let Some(path) = cli_path {
        debug!(path = %path.display(), "prompt template from CLI flag");
        return fs::read_to_string(path);
    }
    if let Ok(env_path) = std::env::var("RALPH_PROMPT") {
        let path = PathBuf::from(env_path);
        if path.is_file() {
            debug!(path = %path.display(), "prompt template from RALPH_PROMPT");
            return fs::read_to_string(path);
        }
    }
    let local = cwd.join("prompt.md");
    if local.is_file() {
        debug!(path = %local.display(), "prompt template from ./prompt.md");
        return fs::read_to_string(local);
    }
    if user_default.is_file() {
        debug!(path = %user_default.display(), "prompt template from user default");
        return fs::read_to_string(user_default);
    }
    debug!("prompt template: built-in fallback");
    Ok(BUILTIN_TEMPLATE.to_string())
}

/// Assemble one iteration's prompt.
///
/// Per-iteration header first (paths the agent needs every time), then the
/// template, then any operator-injected prompt, then a concise note about
/// the selected story, then the AGENTS.md memory if the task carries one.
pub fn build_iteration_prompt(
    template: &str,
    task_dir: &Path,
    prd_path: &Path,
    progress_path: &Path,
    injected: Option<&str>,
    story: Option<&UserStory>,
    agents_md: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Task directory: {}\nPRD: {}\nProgress log: {}\n\n",
        task_dir.display(),
        prd_path.display(),
        progress_path.display()
    );
    prompt.push_str(template);

    if let Some(injected) = injected
        && !injected.trim().is_empty()
    {
        prompt.push_str("\n---\nOPERATOR NOTE:\n");
        prompt.push_str(injected.trim());
        prompt.push('\n');
    }

    if let Some(story) = story {
        prompt.push_str(&format!(
            "\n---\nCurrent story: {}: {}\n",
            story.id, story.title
        ));
        if !story.description.is_empty() {
            prompt.push_str(&story.description);
            prompt.push('\n');
        }
    }

    if let Some(memory) = agents_md
        && !memory.trim().is_empty()
    {
        prompt.push_str("\n---\nAGENTS.md (persistent memory, keep it current):\n");
        prompt.push_str(memory);
        if !memory.ends_with('\n') {
            prompt.push('\n');
        }
    }

    prompt
}
