//! Repository events that may trigger workflows.

use serde::{Deserialize, Serialize};

use super::models::TriggerEvent;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Opened,
    Synchronize,
    Labeled,
    Unlabeled,
    Assigned,
    Unassigned,
    Milestoned,
    Demilestoned,
    Closed,
    Reopened,
    Edited,
}

impl PullRequestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Synchronize => "synchronize",
            Self::Labeled => "labeled",
            Self::Unlabeled => "unlabeled",
            Self::Assigned => "assigned",
            Self::Unassigned => "unassigned",
            Self::Milestoned => "milestoned",
            Self::Demilestoned => "demilestoned",
            Self::Closed => "closed",
            Self::Reopened => "reopened",
            Self::Edited => "edited",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    Branch,
    Tag,
}

/// An event raised by the forge for one repository.
///
/// Each variant carries only what its matching rules look at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepoEvent {
    Push {
        /// Full ref, e.g. `refs/heads/main` or `refs/tags/v1.0`.
        #[serde(rename = "ref")]
        ref_name: String,
        #[serde(default)]
        before: String,
        after: String,
        #[serde(default)]
        commit_message: String,
        #[serde(default)]
        changed_files: Vec<String>,
    },
    PullRequest {
        action: PullRequestAction,
        number: i64,
        title: String,
        head_sha: String,
        /// Branch name the PR targets, e.g. `main`.
        base_ref: String,
        #[serde(default)]
        head_ref: String,
        #[serde(default)]
        labels: Vec<String>,
        #[serde(default)]
        changed_files: Vec<String>,
        /// Message of the head commit.
        #[serde(default)]
        commit_message: String,
    },
    Create {
        #[serde(rename = "ref")]
        ref_name: String,
        ref_type: RefType,
        sha: String,
    },
    Delete {
        #[serde(rename = "ref")]
        ref_name: String,
        ref_type: RefType,
        sha: String,
    },
}

impl RepoEvent {
    /// Workflow triggers this event can fire.
    pub fn candidate_triggers(&self) -> &'static [TriggerEvent] {
        match self {
            Self::Push { .. } => &[TriggerEvent::Push],
            Self::PullRequest { .. } => {
                &[TriggerEvent::PullRequest, TriggerEvent::PullRequestTarget]
            }
            Self::Create { .. } => &[TriggerEvent::Create],
            Self::Delete { .. } => &[TriggerEvent::Delete],
        }
    }

    /// Trigger recorded on runs whose workflow could not be read.
    pub fn primary_trigger(&self) -> TriggerEvent {
        self.candidate_triggers()[0]
    }

    /// Commit the runs of this event are attached to.
    pub fn commit_sha(&self) -> &str {
        match self {
            Self::Push { after, .. } => after,
            Self::PullRequest { head_sha, .. } => head_sha,
            Self::Create { sha, .. } | Self::Delete { sha, .. } => sha,
        }
    }

    pub fn ref_name(&self) -> String {
        match self {
            Self::Push { ref_name, .. } => ref_name.clone(),
            Self::PullRequest { number, .. } => format!("refs/pull/{}/head", number),
            Self::Create {
                ref_name, ref_type, ..
            }
            | Self::Delete {
                ref_name, ref_type, ..
            } => full_ref(ref_name, *ref_type),
        }
    }

    pub fn title(&self) -> String {
        match self {
            Self::Push { commit_message, .. } => commit_message
                .lines()
                .next()
                .unwrap_or_default()
                .to_string(),
            Self::PullRequest { title, .. } => title.clone(),
            Self::Create { ref_name, .. } => format!("Create {}", ref_name),
            Self::Delete { ref_name, .. } => format!("Delete {}", ref_name),
        }
    }

    pub fn pull_request_action(&self) -> Option<PullRequestAction> {
        match self {
            Self::PullRequest { action, .. } => Some(*action),
            _ => None,
        }
    }

    /// Texts checked for skip-ci markers. Empty for event kinds that
    /// do not honour them.
    pub fn skip_ci_texts(&self) -> Vec<&str> {
        match self {
            Self::Push { commit_message, .. } => vec![commit_message],
            Self::PullRequest {
                title,
                commit_message,
                ..
            } => vec![title, commit_message],
            Self::Create { .. } | Self::Delete { .. } => Vec::new(),
        }
    }
}

fn full_ref(name: &str, ref_type: RefType) -> String {
    if name.starts_with("refs/") {
        return name.to_string();
    }
    match ref_type {
        RefType::Branch => format!("refs/heads/{}", name),
        RefType::Tag => format!("refs/tags/{}", name),
    }
}

/// Split a full ref into its kind and short name.
pub fn split_ref(full: &str) -> (Option<RefType>, &str) {
    if let Some(branch) = full.strip_prefix("refs/heads/") {
        (Some(RefType::Branch), branch)
    } else if let Some(tag) = full.strip_prefix("refs/tags/") {
        (Some(RefType::Tag), tag)
    } else {
        (None, full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_event_deserializes_from_tagged_json() {
        let event: RepoEvent = serde_json::from_value(serde_json::json!({
            "kind": "push",
            "ref": "refs/heads/main",
            "after": "abc123",
            "commit_message": "fix: things\n\nbody"
        }))
        .unwrap();
        assert_eq!(event.commit_sha(), "abc123");
        assert_eq!(event.ref_name(), "refs/heads/main");
        assert_eq!(event.title(), "fix: things");
        assert_eq!(event.candidate_triggers(), &[TriggerEvent::Push]);
    }

    #[test]
    fn test_pull_request_event_fields() {
        let event: RepoEvent = serde_json::from_value(serde_json::json!({
            "kind": "pull_request",
            "action": "synchronize",
            "number": 4,
            "title": "Add feature",
            "head_sha": "def456",
            "base_ref": "main",
            "commit_message": "wip [skip ci]"
        }))
        .unwrap();
        assert_eq!(event.pull_request_action(), Some(PullRequestAction::Synchronize));
        assert_eq!(event.ref_name(), "refs/pull/4/head");
        assert_eq!(event.primary_trigger(), TriggerEvent::PullRequest);
        assert_eq!(event.skip_ci_texts(), vec!["Add feature", "wip [skip ci]"]);
    }

    #[test]
    fn test_create_event_full_ref() {
        let event = RepoEvent::Create {
            ref_name: "v1.0".into(),
            ref_type: RefType::Tag,
            sha: "aaa".into(),
        };
        assert_eq!(event.ref_name(), "refs/tags/v1.0");
        assert!(event.skip_ci_texts().is_empty());
    }

    #[test]
    fn test_split_ref() {
        assert_eq!(split_ref("refs/heads/main"), (Some(RefType::Branch), "main"));
        assert_eq!(split_ref("refs/tags/v1"), (Some(RefType::Tag), "v1"));
        assert_eq!(split_ref("weird"), (None, "weird"));
    }
}
