use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{PageCursor, PlatformAdapter, RawPage};
use crate::error::{Error, Result};
use crate::model::{CommentEntry, CommentKind, CommitEntry, PrRecord, PrState};
use crate::normalize::{is_automated, parse_instant};
use crate::transport::Request;
use crate::window::Window;

const PER_PAGE: usize = 100;

/// GitLab adapter: REST API, page-number pagination, notes and commits
/// fetched per MR.
pub struct GitlabAdapter {
    project: String,
    branch: Option<String>,
    api_base: String,
}

impl GitlabAdapter {
    /// `project` is a numeric ID or URL-encoded `group%2Fproject` path.
    pub fn new(project: &str, branch: Option<String>, api_base: Option<&str>) -> Result<Self> {
        if project.is_empty() {
            return Err(Error::Config("GitLab project is required".into()));
        }
        let base = api_base.unwrap_or("https://gitlab.com").trim_end_matches('/');
        Ok(Self {
            project: project.to_string(),
            branch: branch.filter(|b| !b.is_empty()),
            api_base: format!("{base}/api/v4"),
        })
    }

    fn mr_url(&self, iid: u64, tail: &str) -> String {
        format!(
            "{}/projects/{}/merge_requests/{iid}/{tail}",
            self.api_base, self.project
        )
    }
}

impl PlatformAdapter for GitlabAdapter {
    fn label(&self) -> &'static str {
        "gitlab"
    }

    fn initial_cursor(&self) -> PageCursor {
        PageCursor::Offset { page: 1 }
    }

    fn page_request(&self, window: &Window, cursor: &PageCursor) -> Request {
        let page = match cursor {
            PageCursor::Offset { page } => *page,
            PageCursor::Cursor { .. } => 1,
        };
        Request::get(
            "gitlab_mr_page",
            format!("{}/projects/{}/merge_requests", self.api_base, self.project),
        )
        .param("state", "all")
        .param("order_by", "created_at")
        .param("sort", "desc")
        .param("created_after", window.start.to_rfc3339())
        .param("per_page", PER_PAGE.to_string())
        .param("page", page.to_string())
    }

    fn parse_page(&self, payload: &Value, cursor: &PageCursor) -> Result<RawPage> {
        let items = payload
            .as_array()
            .ok_or_else(|| Error::MalformedResponse("expected a JSON array of MRs".into()))?
            .clone();
        let page = match cursor {
            PageCursor::Offset { page } => *page,
            PageCursor::Cursor { .. } => 1,
        };
        // Fewer items than requested means the last page
        let next = if items.len() < PER_PAGE {
            None
        } else {
            Some(PageCursor::Offset { page: page + 1 })
        };
        Ok(RawPage { items, next })
    }

    fn item_number(&self, item: &Value) -> Result<u64> {
        item.get("iid")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::MalformedResponse("MR without iid".into()))
    }

    fn item_created_at(&self, item: &Value) -> Result<DateTime<Utc>> {
        let raw = item
            .get("created_at")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::MalformedResponse("MR without created_at".into()))?;
        parse_instant(raw)
    }

    fn item_in_scope(&self, item: &Value) -> bool {
        match &self.branch {
            Some(branch) => item
                .get("target_branch")
                .and_then(|v| v.as_str())
                .is_some_and(|target| target == branch),
            None => true,
        }
    }

    fn detail_requests(&self, item: &Value) -> Result<Vec<Request>> {
        let iid = self.item_number(item)?;
        Ok(vec![
            Request::get("gitlab_mr_notes", self.mr_url(iid, "notes"))
                .param("per_page", PER_PAGE.to_string()),
            Request::get("gitlab_mr_commits", self.mr_url(iid, "commits"))
                .param("per_page", PER_PAGE.to_string()),
        ])
    }

    fn detail_next(&self, request: &Request, payload: &Value) -> Option<Request> {
        // Notes and commits paginate exactly like the MR list: a full page
        // means there may be more
        let items = payload.as_array()?;
        if items.len() < PER_PAGE {
            return None;
        }
        Some(super::next_page_request(request, "page"))
    }

    fn append_detail_page(&self, acc: &mut Value, page: Value) {
        if let (Some(acc), Value::Array(more)) = (acc.as_array_mut(), page) {
            acc.extend(more);
        }
    }

    fn normalize(&self, item: &Value, details: &[Value]) -> Result<PrRecord> {
        let number = self.item_number(item)?;
        let created_at = self.item_created_at(item)?;

        let author_login = item.pointer("/author/username").and_then(|v| v.as_str());
        let author_is_bot = is_automated(author_login, false);
        let author = author_login.unwrap_or("unknown").to_string();

        let state = match item.get("state").and_then(|v| v.as_str()) {
            Some("merged") => PrState::Merged,
            Some("closed") => PrState::Closed,
            _ => PrState::Open,
        };
        let merged_at = optional_instant(item, "merged_at")?;
        let closed_at = optional_instant(item, "closed_at")?;

        let mut comments = Vec::new();
        let mut commenters = std::collections::BTreeSet::new();
        let mut comment_count: u64 = 0;
        let notes = details
            .first()
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Normalize {
                number,
                message: "notes detail payload is not an array".into(),
            })?;
        for note in notes {
            // System notes are lifecycle noise, not review discussion
            if note.get("system").and_then(|v| v.as_bool()).unwrap_or(false) {
                continue;
            }
            let Some(at) = note.get("created_at").and_then(|v| v.as_str()) else {
                continue;
            };
            comment_count += 1;
            let login = note.pointer("/author/username").and_then(|v| v.as_str());
            let is_bot = is_automated(login, false);
            let login = login.unwrap_or("unknown").to_string();
            if !is_bot {
                commenters.insert(login.clone());
            }
            comments.push(CommentEntry {
                author: login,
                author_is_bot: is_bot,
                at: parse_instant(at)?,
                kind: CommentKind::Comment,
            });
        }

        let mut reviewers = std::collections::BTreeSet::new();
        for reviewer in item
            .get("reviewers")
            .and_then(|v| v.as_array())
            .map(|a| a.as_slice())
            .unwrap_or(&[])
        {
            let login = reviewer.get("username").and_then(|v| v.as_str());
            if !is_automated(login, false) {
                if let Some(login) = login {
                    reviewers.insert(login.to_string());
                }
            }
        }

        let mut commits = Vec::new();
        let commit_items = details
            .get(1)
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Normalize {
                number,
                message: "commits detail payload is not an array".into(),
            })?;
        for commit in commit_items {
            let name = commit
                .get("author_name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let authored = commit.get("authored_date").and_then(|v| v.as_str());
            let committed = commit.get("committed_date").and_then(|v| v.as_str());
            let (Some(authored), Some(committed)) = (authored, committed) else {
                continue;
            };
            commits.push(CommitEntry {
                author_name: name,
                author_login: None,
                authored_at: parse_instant(authored)?,
                committed_at: parse_instant(committed)?,
            });
        }

        PrRecord {
            number,
            created_at,
            merged_at,
            closed_at,
            author,
            author_is_bot,
            state,
            comments,
            comment_count,
            reviewers,
            commenters,
            commits,
            // GitLab's changes_count is a file count, not lines
            lines_changed: 0,
        }
        .finalize()
    }

    fn min_retry_after_secs(&self) -> u64 {
        3
    }

    fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }
}

fn optional_instant(item: &Value, field: &str) -> Result<Option<DateTime<Utc>>> {
    match item.get(field).and_then(|v| v.as_str()) {
        Some(raw) => Ok(Some(parse_instant(raw)?)),
        None => Ok(None),
    }
}
