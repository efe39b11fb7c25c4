//! Event matcher: decides which workflows an event fires.

use glob::{MatchOptions, Pattern};
use tracing::warn;

use super::event::{RefType, RepoEvent, split_ref};
use super::models::TriggerEvent;
use super::workflow::{TriggerDecl, Workflow, WorkflowFile, parse_workflow};

/// `types` assumed for pull request triggers that declare none.
pub const DEFAULT_PULL_REQUEST_TYPES: [&str; 3] = ["opened", "synchronize", "reopened"];

const REF_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Ready(Workflow),
    /// The document could not be read; the run fails without executing.
    Malformed(String),
}

/// A workflow that fires for an event, with the trigger it fired through.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedWorkflow {
    pub workflow_id: String,
    pub trigger: TriggerEvent,
    pub outcome: MatchOutcome,
}

/// True when the event's commit message or PR title carries a skip marker.
pub fn should_skip_ci(event: &RepoEvent, markers: &[String]) -> bool {
    event.skip_ci_texts().into_iter().any(|text| {
        markers
            .iter()
            .any(|m| !m.is_empty() && text.contains(m.as_str()))
    })
}

/// Match `files` against `event`.
///
/// A malformed file never stops the others from being matched.
pub fn match_workflows(event: &RepoEvent, files: &[WorkflowFile]) -> Vec<MatchedWorkflow> {
    let mut matched = Vec::new();
    for file in files {
        let workflow = match parse_workflow(&file.content) {
            Ok(workflow) => workflow,
            Err(e) => {
                warn!(workflow = %file.id, error = %e, "malformed workflow");
                matched.push(MatchedWorkflow {
                    workflow_id: file.id.clone(),
                    trigger: event.primary_trigger(),
                    outcome: MatchOutcome::Malformed(e.to_string()),
                });
                continue;
            }
        };

        for trigger in event.candidate_triggers() {
            if let Some(decl) = workflow.trigger(trigger.as_str())
                && trigger_matches(decl, event)
            {
                matched.push(MatchedWorkflow {
                    workflow_id: file.id.clone(),
                    trigger: *trigger,
                    outcome: MatchOutcome::Ready(workflow.clone()),
                });
            }
        }
    }
    matched
}

/// Evaluate one trigger declaration against an event of a matching kind.
pub fn trigger_matches(decl: &TriggerDecl, event: &RepoEvent) -> bool {
    match event {
        RepoEvent::Push {
            ref_name,
            changed_files,
            ..
        } => {
            let (kind, short) = split_ref(ref_name);
            let has_branch_filter = !decl.branches.is_empty() || !decl.branches_ignore.is_empty();
            let has_tag_filter = !decl.tags.is_empty() || !decl.tags_ignore.is_empty();
            let ref_ok = match kind {
                Some(RefType::Branch) if has_branch_filter => {
                    include_exclude(&decl.branches, &decl.branches_ignore, short)
                }
                Some(RefType::Branch) => !has_tag_filter,
                Some(RefType::Tag) if has_tag_filter => {
                    include_exclude(&decl.tags, &decl.tags_ignore, short)
                }
                Some(RefType::Tag) => !has_branch_filter,
                None => !has_branch_filter && !has_tag_filter,
            };
            ref_ok && paths_match(decl, changed_files)
        }
        RepoEvent::PullRequest {
            action,
            base_ref,
            changed_files,
            ..
        } => {
            let type_ok = if decl.types.is_empty() {
                DEFAULT_PULL_REQUEST_TYPES.contains(&action.as_str())
            } else {
                decl.types.iter().any(|t| t == action.as_str())
            };
            let (_, base) = split_ref(base_ref);
            type_ok
                && include_exclude(&decl.branches, &decl.branches_ignore, base)
                && paths_match(decl, changed_files)
        }
        RepoEvent::Create { .. } | RepoEvent::Delete { .. } => true,
    }
}

fn include_exclude(include: &[String], exclude: &[String], value: &str) -> bool {
    (include.is_empty() || any_glob(include, value, REF_MATCH))
        && !any_glob(exclude, value, REF_MATCH)
}

fn paths_match(decl: &TriggerDecl, files: &[String]) -> bool {
    if !decl.paths.is_empty()
        && !files
            .iter()
            .any(|f| any_glob(&decl.paths, f, REF_MATCH))
    {
        return false;
    }
    if !decl.paths_ignore.is_empty()
        && !files.is_empty()
        && files
            .iter()
            .all(|f| any_glob(&decl.paths_ignore, f, REF_MATCH))
    {
        return false;
    }
    true
}

/// True when `value` matches any of `patterns`; invalid patterns never match.
pub fn any_glob(patterns: &[String], value: &str, options: MatchOptions) -> bool {
    patterns.iter().any(|p| match Pattern::new(p) {
        Ok(pattern) => pattern.matches_with(value, options),
        Err(e) => {
            warn!(pattern = %p, error = %e, "invalid glob pattern");
            false
        }
    })
}
