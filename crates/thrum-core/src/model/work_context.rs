//! Work context entity (spec.md §3.1): a per-session snapshot of Git state,
//! refreshed on every heartbeat (§4.6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub sha: String,
    pub message_first_line: String,
    pub touched_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkContext {
    pub session_id: String,
    pub branch: Option<String>,
    pub worktree_path: String,
    /// Commits on HEAD not yet on the base branch, most recent first.
    pub unmerged_commits: Vec<CommitSummary>,
    pub uncommitted_files: Vec<String>,
    pub changed_files: Vec<String>,
    pub extracted_at: String,
}

impl WorkContext {
    /// Work-context merge rule (spec.md §3.2 invariant 7, §9 open question
    /// 1): keep the entry with the later `extracted_at`. Applied both
    /// across events and, per the open-question resolution in DESIGN.md,
    /// across entries within a single event payload.
    pub fn merge(existing: Option<WorkContext>, incoming: WorkContext) -> WorkContext {
        match existing {
            Some(e) if e.extracted_at >= incoming.extracted_at => e,
            _ => incoming,
        }
    }

    pub fn has_unmerged_commits(&self) -> bool {
        !self.unmerged_commits.is_empty()
    }
}
