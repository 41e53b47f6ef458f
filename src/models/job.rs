use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle status of a queued image. Completed and Failed are terminal;
/// a completion signal for a terminal item is dropped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Queue entry metadata. The binary payload lives in the image store under `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMeta {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
}

impl ItemMeta {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: JobStatus::Pending,
        }
    }
}

/// Counters for the current run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStats {
    pub completed: u32,
    pub failed: u32,
}

/// Options supplied with a start request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RunOptions {
    /// Pause after every Nth completed item (0 disables the periodic pause).
    #[garde(range(max = 10_000))]
    #[serde(default)]
    pub pause_every: u32,

    /// Length of the periodic pause in seconds.
    #[garde(range(max = 86_400))]
    #[serde(default)]
    pub pause_duration_secs: u64,

    /// Submit a text prompt before generation; prompt i applies to item i.
    #[garde(skip)]
    #[serde(default)]
    pub use_prompts: bool,

    #[garde(length(max = 10_000))]
    #[serde(default)]
    pub prompts: Vec<String>,
}

impl RunOptions {
    /// Prompt for the item at `index`, when prompts are enabled and non-empty.
    pub fn prompt_for(&self, index: usize) -> Option<&str> {
        if !self.use_prompts {
            return None;
        }
        self.prompts
            .get(index)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lookup_respects_toggle_and_bounds() {
        let options = RunOptions {
            use_prompts: true,
            prompts: vec!["slow zoom".to_string(), String::new()],
            ..Default::default()
        };

        assert_eq!(options.prompt_for(0), Some("slow zoom"));
        assert_eq!(options.prompt_for(1), None, "empty prompt is no prompt");
        assert_eq!(options.prompt_for(5), None, "out of range");

        let disabled = RunOptions {
            use_prompts: false,
            prompts: vec!["ignored".to_string()],
            ..Default::default()
        };
        assert_eq!(disabled.prompt_for(0), None);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(JobStatus::Failed.to_string(), "failed");
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
