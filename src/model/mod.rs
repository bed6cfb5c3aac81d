use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// Review state of a pull request. Merged implies closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

/// Distinguishes a plain discussion comment from a formal review submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentKind {
    Comment,
    Review,
}

/// One comment or review submission on a pull request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommentEntry {
    pub author: String,
    pub author_is_bot: bool,
    pub at: DateTime<Utc>,
    pub kind: CommentKind,
}

/// One commit on a pull request.
///
/// `author_login` is the platform handle when the platform exposes it;
/// `author_name` is the raw commit author name and is always present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitEntry {
    pub author_name: String,
    pub author_login: Option<String>,
    pub authored_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
}

/// Canonical representation of one pull/merge request, platform-independent.
///
/// `reviewers` and `commenters` hold human identities only; automated
/// identities are filtered out during normalization. `comment_count` is the
/// raw comment volume and does include bot comments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrRecord {
    pub number: u64,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub author: String,
    pub author_is_bot: bool,
    pub state: PrState,
    pub comments: Vec<CommentEntry>,
    pub comment_count: u64,
    pub reviewers: BTreeSet<String>,
    pub commenters: BTreeSet<String>,
    pub commits: Vec<CommitEntry>,
    pub lines_changed: u64,
}

impl PrRecord {
    /// Validate cross-field invariants after normalization.
    ///
    /// Checks `created <= merged|closed` when present and sorts comments
    /// and commits by time so downstream metrics can rely on ordering.
    pub fn finalize(mut self) -> Result<Self> {
        for (label, at) in [("merged", self.merged_at), ("closed", self.closed_at)] {
            if let Some(at) = at {
                if at < self.created_at {
                    return Err(Error::Normalize {
                        number: self.number,
                        message: format!(
                            "{label} timestamp {at} precedes creation {}",
                            self.created_at
                        ),
                    });
                }
            }
        }
        if self.state == PrState::Merged && self.merged_at.is_none() {
            return Err(Error::Normalize {
                number: self.number,
                message: "state is merged but merged timestamp is missing".into(),
            });
        }
        self.comments.sort_by_key(|c| c.at);
        self.commits.sort_by_key(|c| c.committed_at);
        Ok(self)
    }
}
