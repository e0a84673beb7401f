//! Progress log maintenance.
//!
//! The progress log is one of the three durable artifacts that carry
//! continuity between iterations (PRD, progress log, git branch). The agent
//! appends to it; the runner initializes it, rotates it when it grows past a
//! threshold, and appends checkpoint / merge markers.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info};

/// Rotation threshold in lines. Rotation triggers strictly above this.
pub const DEFAULT_ROTATION_THRESHOLD: usize = 500;

const PATTERNS_HEADING: &str = "## Codebase Patterns";

/// Handle to a task's `progress.txt`.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
    rotation_threshold: usize,
}

impl ProgressLog {
    pub fn new(task_dir: &Path) -> Self {
        Self {
            path: task_dir.join("progress.txt"),
            rotation_threshold: DEFAULT_ROTATION_THRESHOLD,
        }
    }

    pub fn with_rotation_threshold(mut self, threshold: usize) -> Self {
        self.rotation_threshold = threshold;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the header if the log does not exist yet.
    pub fn init_if_absent(&self, project: &str, prd_type: &str) -> std::io::Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        let header = format!(
            "# Progress: {project}\n\
             # Type: {prd_type}\n\
             # Started: {}\n\
             \n\
             {PATTERNS_HEADING}\n\
             \n",
            Local::now().to_rfc3339()
        );
        fs::write(&self.path, header)?;
        info!(path = %self.path.display(), "progress log initialized");
        Ok(())
    }

    fn line_count(&self) -> usize {
        fs::read_to_string(&self.path)
            .map(|c| c.lines().count())
            .unwrap_or(0)
    }

    /// Rotate when strictly above the threshold: rename to `progress-N.txt`
    /// (smallest unused N) and start a fresh log that carries the
    /// "Codebase Patterns" section forward plus a pointer to the rotated file.
    ///
    /// Returns the rotated file name when rotation happened.
    pub fn rotate_if_needed(&self) -> std::io::Result<Option<PathBuf>> {
        if self.line_count() <= self.rotation_threshold {
            return Ok(None);
        }

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut n = 1;
        let rotated = loop {
            let candidate = dir.join(format!("progress-{n}.txt"));
            if !candidate.exists() {
                break candidate;
            }
            n += 1;
        };

        let old_content = fs::read_to_string(&self.path)?;
        fs::rename(&self.path, &rotated)?;

        let patterns = extract_patterns_section(&old_content);
        let rotated_name = rotated
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut fresh = format!(
            "# Progress (continued)\n\
             # Earlier entries: {rotated_name}\n\
             \n"
        );
        fresh.push_str(&patterns.unwrap_or_else(|| format!("{PATTERNS_HEADING}\n\n")));
        fs::write(&self.path, fresh)?;

        debug!(rotated = %rotated.display(), "progress log rotated");
        Ok(Some(rotated))
    }

    pub fn append(&self, text: &str) -> std::io::Result<()> {
        let mut content = fs::read_to_string(&self.path).unwrap_or_default();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(text);
        fs::write(&self.path, content)
    }

    /// Append the checkpoint block written when a loop pauses.
    #[allow(clippy::too_many_arguments)]
    pub fn append_checkpoint(
        &self,
        iteration: u32,
        max_iterations: u32,
        completed: usize,
        total: usize,
        current_story: &str,
        agent: &str,
        reason: &str,
    ) -> std::io::Result<()> {
        self.append(&format!(
            "\n## Checkpoint ({})\n\
             - Iteration: {iteration}/{max_iterations}\n\
             - Stories: {completed}/{total} complete\n\
             - Current story: {current_story}\n\
             - Agent: {agent}\n\
             - Reason: {reason}\n",
            Local::now().to_rfc3339()
        ))
    }

    /// Annotate that the branch is ready to merge (autoMerge off).
    pub fn append_ready_to_merge(&self, branch: &str, target: &str) -> std::io::Result<()> {
        self.append(&format!(
            "\n## Ready to merge ({})\n\
             - Branch {branch} is ready to merge into {target}\n",
            Local::now().to_rfc3339()
        ))
    }
}

/// Pull the "## Codebase Patterns" section (heading through the next `## `
/// heading or EOF) out of a rotated log.
fn extract_patterns_section(content: &str) -> Option<String> {
    let start = content.find(PATTERNS_HEADING)?;
    let rest = &content[start..];
    let end = rest[PATTERNS_HEADING.len()..]
        .find("\n## ")
        .map(|i| PATTERNS_HEADING.len() + i + 1)
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}
