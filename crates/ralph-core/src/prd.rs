//! PRD (Product Requirements Document) model.
//!
//! The `prd.json` file on disk is authoritative; the loop runner re-reads it
//! at every iteration boundary. The typed [`Prd`] view drives story
//! selection and completion checks, while all writes go through the raw
//! [`PrdDoc`] JSON value so that an unmodified read-write cycle reproduces
//! the file byte for byte and acceptance criteria keep whichever shape
//! (string or object) the source used.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::error::{RalphError, RalphResult};

/// Acceptance criterion; accepts both the v1 string form and the v2 object
/// form (`{description, passes}`). Bare strings read as `passes: false`.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptanceCriterion {
    pub description: String,
    pub passes: bool,
}

impl<'de> Deserialize<'de> for AcceptanceCriterion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, MapAccess, Visitor};

        struct CriterionVisitor;

        impl<'de> Visitor<'de> for CriterionVisitor {
            type Value = AcceptanceCriterion;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a string or an object with description and passes")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(AcceptanceCriterion {
                    description: value.to_string(),
                    passes: false,
                })
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut description: Option<String> = None;
                let mut passes: Option<bool> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "description" => description = Some(map.next_value()?),
                        "passes" => passes = Some(map.next_value()?),
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }

                Ok(AcceptanceCriterion {
                    description: description.unwrap_or_default(),
                    passes: passes.unwrap_or(false),
                })
            }
        }

        deserializer.deserialize_any(CriterionVisitor)
    }
}

/// Spawn rules for stories that may create follow-up stories.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRules {
    pub id_prefix: String,
    #[serde(default)]
    pub target_phase: Option<String>,
}

/// Decision-gate configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionConfig {
    pub slug: String,
    #[serde(default)]
    pub input_file: Option<String>,
    #[serde(default = "default_decision_status")]
    pub status: String,
    #[serde(default)]
    pub options: Vec<Value>,
    #[serde(default)]
    pub agent_recommendation: Option<String>,
    #[serde(default)]
    pub recommendation_reason: Option<String>,
    #[serde(default)]
    pub confidence_level: Option<String>,
    #[serde(default)]
    pub user_selection: Option<String>,
    #[serde(default)]
    pub user_notes: Option<String>,
}

fn default_decision_status() -> String {
    "pending".to_string()
}

impl DecisionConfig {
    pub fn is_applied(&self) -> bool {
        self.status == "applied"
    }
}

/// Ordered phase of an investigation PRD.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expands_to: Option<Value>,
    #[serde(default)]
    pub dynamic: Option<bool>,
    #[serde(default)]
    pub requires_all_previous: Option<bool>,
}

/// A unit of work with acceptance criteria and a boolean `passes`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserStory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Lower executes first.
    pub priority: i64,
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(rename = "type", default)]
    pub story_type: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub can_spawn_stories: Option<bool>,
    #[serde(default)]
    pub spawn_config: Option<SpawnRules>,
    #[serde(default)]
    pub decision_config: Option<DecisionConfig>,
}

impl UserStory {
    pub fn is_decision_gate(&self) -> bool {
        self.story_type.as_deref() == Some("decision-gate")
    }

    /// Whether the story counts as done.
    ///
    /// Under schema >=2.0 the criteria are authoritative: the story is done
    /// iff every criterion passes (the flat `passes` flag stands in only when
    /// there are no criteria). Under v1 the flat flag is authoritative.
    pub fn is_complete(&self, schema_v2: bool) -> bool {
        if schema_v2 && !self.acceptance_criteria.is_empty() {
            self.acceptance_criteria.iter().all(|c| c.passes)
        } else {
            self.passes
        }
    }
}

fn default_schema_version() -> String {
    "1.0".to_string()
}

fn default_prd_type() -> String {
    "feature".to_string()
}

/// The typed PRD view.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub project: String,
    #[serde(default)]
    pub task_dir: String,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(rename = "type", default = "default_prd_type")]
    pub prd_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub merge_target: Option<String>,
    #[serde(default)]
    pub auto_merge: bool,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    pub user_stories: Vec<UserStory>,
}

impl Prd {
    /// Whether the schema's major version is 2 or later.
    pub fn is_schema_v2(&self) -> bool {
        self.schema_version
            .split('.')
            .next()
            .and_then(|major| major.parse::<u32>().ok())
            .map(|major| major >= 2)
            .unwrap_or(false)
    }

    pub fn completed_count(&self) -> usize {
        let v2 = self.is_schema_v2();
        self.user_stories
            .iter()
            .filter(|s| s.is_complete(v2))
            .count()
    }

    /// Project complete: at least one story and every story done.
    pub fn all_complete(&self) -> bool {
        let v2 = self.is_schema_v2();
        !self.user_stories.is_empty() && self.user_stories.iter().all(|s| s.is_complete(v2))
    }

    /// A blocker is satisfied when the blocking story is complete or its
    /// decision has been applied.
    fn blocker_satisfied(&self, blocker_id: &str) -> bool {
        let v2 = self.is_schema_v2();
        self.user_stories
            .iter()
            .find(|s| s.id == blocker_id)
            .map(|b| {
                b.is_complete(v2)
                    || b.decision_config
                        .as_ref()
                        .map(DecisionConfig::is_applied)
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Stories eligible for execution: incomplete, every blocker satisfied,
    /// and not a decision gate still waiting on a human.
    pub fn eligible_stories(&self) -> Vec<&UserStory> {
        let v2 = self.is_schema_v2();
        self.user_stories
            .iter()
            .filter(|s| !s.is_complete(v2))
            .filter(|s| s.blocked_by.iter().all(|b| self.blocker_satisfied(b)))
            .filter(|s| {
                !(s.is_decision_gate()
                    && !s
                        .decision_config
                        .as_ref()
                        .map(DecisionConfig::is_applied)
                        .unwrap_or(false))
            })
            .collect()
    }

    /// Next story to execute: lowest priority, ties broken by id ascending.
    pub fn select_next(&self) -> Option<&UserStory> {
        self.eligible_stories()
            .into_iter()
            .min_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)))
    }

    /// Incomplete decision gates that still need a human edit.
    pub fn pending_decision_gates(&self) -> Vec<&UserStory> {
        let v2 = self.is_schema_v2();
        self.user_stories
            .iter()
            .filter(|s| s.is_decision_gate() && !s.is_complete(v2))
            .filter(|s| {
                !s.decision_config
                    .as_ref()
                    .map(DecisionConfig::is_applied)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Decision file paths for the pending gates, relative to `task_dir`.
    pub fn pending_decision_files(&self, task_dir: &Path) -> Vec<PathBuf> {
        self.pending_decision_gates()
            .iter()
            .filter_map(|s| s.decision_config.as_ref())
            .map(|d| match &d.input_file {
                Some(path) => task_dir.join(path),
                None => task_dir.join("decisions").join(format!("{}.md", d.slug)),
            })
            .collect()
    }

    /// Structural validation run at load: unique ids, resolvable blocker
    /// references, and an acyclic blockedBy/blocks graph.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for story in &self.user_stories {
            if !seen.insert(story.id.as_str()) {
                return Err(format!("duplicate story id: {}", story.id));
            }
        }

        for story in &self.user_stories {
            for blocker in story.blocked_by.iter().chain(story.blocks.iter()) {
                if !seen.contains(blocker.as_str()) {
                    return Err(format!(
                        "story {} references unknown story: {blocker}",
                        story.id
                    ));
                }
            }
        }

        // blockedBy and blocks describe one dependency graph; walk it for cycles.
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for story in &self.user_stories {
            for blocker in &story.blocked_by {
                edges.entry(blocker.as_str()).or_default().push(&story.id);
            }
            for blocked in &story.blocks {
                edges.entry(story.id.as_str()).or_default().push(blocked);
            }
        }

        let mut state: HashMap<&str, u8> = HashMap::new();
        for story in &self.user_stories {
            if let Some(cycle_at) = dfs_cycle(story.id.as_str(), &edges, &mut state) {
                return Err(format!("dependency cycle involving story {cycle_at}"));
            }
        }

        Ok(())
    }
}

fn dfs_cycle<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    state: &mut HashMap<&'a str, u8>,
) -> Option<&'a str> {
    match state.get(node) {
        Some(1) => return Some(node),
        Some(2) => return None,
        _ => {}
    }
    state.insert(node, 1);
    if let Some(next) = edges.get(node) {
        for n in next {
            if let Some(found) = dfs_cycle(n, edges, state) {
                return Some(found);
            }
        }
    }
    state.insert(node, 2);
    None
}

/// The PRD document: raw JSON value plus the derived typed view.
///
/// All mutations (checkpoint fields, agent preference) edit the raw value
/// and save atomically, so untouched keys keep their order and shape.
#[derive(Debug, Clone)]
pub struct PrdDoc {
    path: PathBuf,
    value: Value,
    pub prd: Prd,
}

impl PrdDoc {
    /// Load and validate the PRD at `path`.
    pub fn load(path: &Path) -> RalphResult<Self> {
        if !path.is_file() {
            return Err(RalphError::PrdNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content).map_err(|e| RalphError::PrdInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let prd: Prd =
            serde_json::from_value(value.clone()).map_err(|e| RalphError::PrdInvalid {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        prd.validate().map_err(|reason| RalphError::PrdInvalid {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            value,
            prd,
        })
    }

    /// Re-read from disk, replacing both views.
    pub fn reload(&mut self) -> RalphResult<()> {
        *self = Self::load(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomic write-to-temp-then-rename save of the raw value.
    pub fn save(&self) -> RalphResult<()> {
        let content = serde_json::to_string_pretty(&self.value).map_err(|e| {
            RalphError::PrdInvalid {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, format!("{content}\n"))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Checkpoint fields at the document top level, if present.
    pub fn checkpoint(&self) -> Option<(u32, String)> {
        let obj = self.value.as_object()?;
        if !obj.get("checkpointed")?.as_bool()? {
            return None;
        }
        let last = obj.get("lastIteration")?.as_u64()? as u32;
        let reason = obj
            .get("checkpointReason")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Some((last, reason))
    }

    /// Record a checkpoint: `{checkpointed: true, lastIteration, checkpointReason}`.
    pub fn set_checkpoint(&mut self, last_iteration: u32, reason: &str) -> RalphResult<()> {
        if let Some(obj) = self.value.as_object_mut() {
            obj.insert("checkpointed".into(), Value::Bool(true));
            obj.insert("lastIteration".into(), Value::from(last_iteration));
            obj.insert("checkpointReason".into(), Value::from(reason));
        }
        self.save()
    }

    /// Clear the three checkpoint fields (done when a run resumes).
    pub fn clear_checkpoint(&mut self) -> RalphResult<()> {
        if let Some(obj) = self.value.as_object_mut() {
            obj.remove("checkpointed");
            obj.remove("lastIteration");
            obj.remove("checkpointReason");
        }
        self.save()
    }

    /// Persist the chosen backend as the PRD's preference.
    pub fn set_agent(&mut self, agent: &str) -> RalphResult<()> {
        if let Some(obj) = self.value.as_object_mut() {
            obj.insert("agent".into(), Value::from(agent));
        }
        self.prd.agent = Some(agent.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_prd(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prd.json");
        let mut f = fs::File::create(&path).unwrap();
        write!(f, "{content}").unwrap();
        (dir, path)
    }

    fn story(id: &str, priority: i64, passes: bool) -> String {
        format!(
            r#"{{"id": "{id}", "title": "{id}", "description": "", "acceptanceCriteria": [],
                "priority": {priority}, "passes": {passes}, "notes": ""}}"#
        )
    }

    fn prd_with_stories(stories: &[String]) -> String {
        format!(
            r#"{{"schemaVersion": "2.0", "project": "test", "taskDir": "tasks/test",
                "branchName": "ralph/test", "type": "feature", "description": "d",
                "userStories": [{}]}}"#,
            stories.join(",")
        )
    }

    #[test]
    fn criterion_reads_both_shapes() {
        let bare: AcceptanceCriterion = serde_json::from_str(r#""Typecheck passes""#).unwrap();
        assert_eq!(bare.description, "Typecheck passes");
        assert!(!bare.passes);

        let structured: AcceptanceCriterion =
            serde_json::from_str(r#"{"description": "Typecheck passes", "passes": true}"#).unwrap();
        assert!(structured.passes);
    }

    #[test]
    fn load_missing_file_fails_loudly() {
        let err = PrdDoc::load(Path::new("/nonexistent/prd.json")).unwrap_err();
        assert!(matches!(err, RalphError::PrdNotFound(_)));
    }

    #[test]
    fn load_invalid_json_fails_loudly() {
        let (_dir, path) = write_prd("{ not json }");
        let err = PrdDoc::load(&path).unwrap_err();
        assert!(matches!(err, RalphError::PrdInvalid { .. }));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let content = prd_with_stories(&[story("US-001", 1, false), story("US-001", 2, false)]);
        let (_dir, path) = write_prd(&content);
        let err = PrdDoc::load(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate story id"));
    }

    #[test]
    fn dependency_cycle_rejected() {
        let content = format!(
            r#"{{"schemaVersion": "2.0", "project": "t", "type": "feature", "description": "",
                "userStories": [
                  {{"id": "US-001", "title": "a", "priority": 1, "passes": false,
                    "blockedBy": ["US-002"]}},
                  {{"id": "US-002", "title": "b", "priority": 2, "passes": false,
                    "blockedBy": ["US-001"]}}
                ]}}"#
        );
        let (_dir, path) = write_prd(&content);
        let err = PrdDoc::load(&path).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn unknown_blocker_rejected() {
        let content = format!(
            r#"{{"schemaVersion": "2.0", "project": "t", "type": "feature", "description": "",
                "userStories": [
                  {{"id": "US-001", "title": "a", "priority": 1, "passes": false,
                    "blockedBy": ["US-404"]}}
                ]}}"#
        );
        let (_dir, path) = write_prd(&content);
        assert!(PrdDoc::load(&path).is_err());
    }

    #[test]
    fn selection_prefers_lowest_priority_then_id() {
        let content = prd_with_stories(&[
            story("US-003", 2, false),
            story("US-002", 1, false),
            story("US-001", 1, false),
            story("US-000", 1, true),
        ]);
        let (_dir, path) = write_prd(&content);
        let doc = PrdDoc::load(&path).unwrap();
        assert_eq!(doc.prd.select_next().unwrap().id, "US-001");
    }

    #[test]
    fn blocked_story_is_not_selected() {
        let content = format!(
            r#"{{"schemaVersion": "2.0", "project": "t", "type": "feature", "description": "",
                "userStories": [
                  {{"id": "US-001", "title": "a", "priority": 2, "passes": false}},
                  {{"id": "US-002", "title": "b", "priority": 1, "passes": false,
                    "blockedBy": ["US-001"]}}
                ]}}"#
        );
        let (_dir, path) = write_prd(&content);
        let doc = PrdDoc::load(&path).unwrap();
        // US-002 has lower priority but is blocked by the incomplete US-001.
        assert_eq!(doc.prd.select_next().unwrap().id, "US-001");
    }

    #[test]
    fn pending_decision_gate_blocks_everything() {
        let content = format!(
            r#"{{"schemaVersion": "2.0", "project": "t", "type": "investigation",
                "description": "",
                "userStories": [
                  {{"id": "US-010", "title": "done", "priority": 1, "passes": true}},
                  {{"id": "US-010-DECIDE", "title": "gate", "priority": 2, "passes": false,
                    "type": "decision-gate",
                    "decisionConfig": {{"slug": "storage-engine", "status": "pending"}}}},
                  {{"id": "US-011-A", "title": "next", "priority": 3, "passes": false,
                    "blockedBy": ["US-010-DECIDE"]}}
                ]}}"#
        );
        let (_dir, path) = write_prd(&content);
        let doc = PrdDoc::load(&path).unwrap();

        assert!(doc.prd.select_next().is_none());
        let files = doc.prd.pending_decision_files(Path::new("tasks/t"));
        assert_eq!(files, vec![PathBuf::from("tasks/t/decisions/storage-engine.md")]);
    }

    #[test]
    fn applied_decision_unblocks_downstream() {
        let content = format!(
            r#"{{"schemaVersion": "2.0", "project": "t", "type": "investigation",
                "description": "",
                "userStories": [
                  {{"id": "US-010-DECIDE", "title": "gate", "priority": 1, "passes": false,
                    "type": "decision-gate",
                    "decisionConfig": {{"slug": "s", "status": "applied"}}}},
                  {{"id": "US-011", "title": "next", "priority": 2, "passes": false,
                    "blockedBy": ["US-010-DECIDE"]}}
                ]}}"#
        );
        let (_dir, path) = write_prd(&content);
        let doc = PrdDoc::load(&path).unwrap();
        // The gate itself is now eligible (applied), and so is its dependent.
        let ids: Vec<&str> = doc.prd.eligible_stories().iter().map(|s| s.id.as_str()).collect();
        assert!(ids.contains(&"US-010-DECIDE"));
        assert!(ids.contains(&"US-011"));
    }

    #[test]
    fn v2_criteria_are_authoritative() {
        let content = format!(
            r#"{{"schemaVersion": "2.0", "project": "t", "type": "feature", "description": "",
                "userStories": [
                  {{"id": "US-001", "title": "a", "priority": 1, "passes": false,
                    "acceptanceCriteria": [
                      {{"description": "c1", "passes": true}},
                      {{"description": "c2", "passes": true}}
                    ]}}
                ]}}"#
        );
        let (_dir, path) = write_prd(&content);
        let doc = PrdDoc::load(&path).unwrap();
        assert!(doc.prd.all_complete());
    }

    #[test]
    fn v1_flat_flag_is_authoritative() {
        let content = format!(
            r#"{{"project": "t", "type": "feature", "description": "",
                "userStories": [
                  {{"id": "US-001", "title": "a", "priority": 1, "passes": true,
                    "acceptanceCriteria": ["unchecked criterion"]}}
                ]}}"#
        );
        let (_dir, path) = write_prd(&content);
        let doc = PrdDoc::load(&path).unwrap();
        assert!(!doc.prd.is_schema_v2());
        assert!(doc.prd.all_complete());
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let original = serde_json::to_string_pretty(&serde_json::from_str::<Value>(
            &prd_with_stories(&[story("US-001", 1, false)]),
        )
        .unwrap())
        .unwrap()
            + "\n";
        let (_dir, path) = write_prd(&original);
        let doc = PrdDoc::load(&path).unwrap();
        doc.save().unwrap();
        let reread = fs::read_to_string(&path).unwrap();
        assert_eq!(original, reread);
    }

    #[test]
    fn checkpoint_fields_round_trip() {
        let content = prd_with_stories(&[story("US-001", 1, false)]);
        let (_dir, path) = write_prd(&content);
        let mut doc = PrdDoc::load(&path).unwrap();

        assert!(doc.checkpoint().is_none());
        doc.set_checkpoint(3, "user").unwrap();

        let mut reread = PrdDoc::load(&path).unwrap();
        assert_eq!(reread.checkpoint(), Some((3, "user".to_string())));

        reread.clear_checkpoint().unwrap();
        let cleared = PrdDoc::load(&path).unwrap();
        assert!(cleared.checkpoint().is_none());
        assert!(!fs::read_to_string(&path).unwrap().contains("checkpointed"));
    }

    #[test]
    fn agent_preference_persists() {
        let content = prd_with_stories(&[story("US-001", 1, false)]);
        let (_dir, path) = write_prd(&content);
        let mut doc = PrdDoc::load(&path).unwrap();
        doc.set_agent("opencode").unwrap();

        let reread = PrdDoc::load(&path).unwrap();
        assert_eq!(reread.prd.agent.as_deref(), Some("opencode"));
    }
}
