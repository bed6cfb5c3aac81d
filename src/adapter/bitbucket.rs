use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{PageCursor, PlatformAdapter, RawPage};
use crate::error::{Error, Result};
use crate::model::{CommentEntry, CommentKind, CommitEntry, PrRecord, PrState};
use crate::normalize::{is_automated, parse_instant};
use crate::transport::Request;
use crate::window::Window;

const PAGE_LEN: usize = 50;

/// Bitbucket Cloud adapter: REST API, page-number pagination. Comments,
/// commits, and the participant list (for approvals) are fetched per PR.
pub struct BitbucketAdapter {
    workspace: String,
    repo_slug: String,
    branch: Option<String>,
    api_base: String,
}

impl BitbucketAdapter {
    /// `repo` is `workspace/repo-slug`.
    pub fn new(repo: &str, branch: Option<String>, api_base: Option<&str>) -> Result<Self> {
        let (workspace, slug) = repo.split_once('/').ok_or_else(|| {
            Error::Config(format!("repository must be workspace/repo-slug: {repo:?}"))
        })?;
        if workspace.is_empty() || slug.is_empty() {
            return Err(Error::Config(format!(
                "repository must be workspace/repo-slug: {repo:?}"
            )));
        }
        let base = api_base
            .unwrap_or("https://api.bitbucket.org")
            .trim_end_matches('/');
        Ok(Self {
            workspace: workspace.to_string(),
            repo_slug: slug.to_string(),
            branch: branch.filter(|b| !b.is_empty()),
            api_base: base.to_string(),
        })
    }

    fn pr_url(&self, tail: &str) -> String {
        format!(
            "{}/2.0/repositories/{}/{}/pullrequests{tail}",
            self.api_base, self.workspace, self.repo_slug
        )
    }
}

impl PlatformAdapter for BitbucketAdapter {
    fn label(&self) -> &'static str {
        "bitbucket"
    }

    fn initial_cursor(&self) -> PageCursor {
        PageCursor::Offset { page: 1 }
    }

    fn page_request(&self, window: &Window, cursor: &PageCursor) -> Request {
        let page = match cursor {
            PageCursor::Offset { page } => *page,
            PageCursor::Cursor { .. } => 1,
        };
        Request::get("bitbucket_pr_page", self.pr_url(""))
            .param("state", "OPEN")
            .param("state", "MERGED")
            .param("state", "DECLINED")
            .param("state", "SUPERSEDED")
            .param("sort", "-created_on")
            .param(
                "q",
                format!("created_on >= {}", window.start.to_rfc3339()),
            )
            .param("pagelen", PAGE_LEN.to_string())
            .param("page", page.to_string())
    }

    fn parse_page(&self, payload: &Value, cursor: &PageCursor) -> Result<RawPage> {
        let items = payload
            .get("values")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::MalformedResponse("missing values array".into()))?
            .clone();
        let page = match cursor {
            PageCursor::Offset { page } => *page,
            PageCursor::Cursor { .. } => 1,
        };
        let next = if payload.get("next").and_then(|v| v.as_str()).is_some() {
            Some(PageCursor::Offset { page: page + 1 })
        } else {
            None
        };
        Ok(RawPage { items, next })
    }

    fn item_number(&self, item: &Value) -> Result<u64> {
        item.get("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::MalformedResponse("PR without id".into()))
    }

    fn item_created_at(&self, item: &Value) -> Result<DateTime<Utc>> {
        let raw = item
            .get("created_on")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::MalformedResponse("PR without created_on".into()))?;
        parse_instant(raw)
    }

    fn item_in_scope(&self, item: &Value) -> bool {
        match &self.branch {
            Some(branch) => item
                .pointer("/destination/branch/name")
                .and_then(|v| v.as_str())
                .is_some_and(|dest| dest == branch),
            None => true,
        }
    }

    fn detail_requests(&self, item: &Value) -> Result<Vec<Request>> {
        let id = self.item_number(item)?;
        Ok(vec![
            Request::get(
                "bitbucket_pr_comments",
                self.pr_url(&format!("/{id}/comments")),
            )
            .param("pagelen", "100"),
            Request::get(
                "bitbucket_pr_commits",
                self.pr_url(&format!("/{id}/commits")),
            )
            .param("pagelen", "100"),
            // Full PR for the participant list (approvals)
            Request::get("bitbucket_pr_detail", self.pr_url(&format!("/{id}"))),
        ])
    }

    fn detail_next(&self, request: &Request, payload: &Value) -> Option<Request> {
        // Comment and commit listings carry a `next` link when another
        // page exists; the full-PR detail payload has neither field
        payload.get("values")?;
        payload.get("next").and_then(|v| v.as_str())?;
        Some(super::next_page_request(request, "page"))
    }

    fn append_detail_page(&self, acc: &mut Value, page: Value) {
        let Some(more) = page.get("values").and_then(|v| v.as_array()).cloned() else {
            return;
        };
        if let Some(values) = acc.get_mut("values").and_then(|v| v.as_array_mut()) {
            values.extend(more);
        }
    }

    fn normalize(&self, item: &Value, details: &[Value]) -> Result<PrRecord> {
        let number = self.item_number(item)?;
        let created_at = self.item_created_at(item)?;

        let (author, author_is_bot) = account_identity(item.get("author"));

        let state_raw = item.get("state").and_then(|v| v.as_str()).unwrap_or("OPEN");
        let updated_on = optional_instant(item, "updated_on")?;
        // Bitbucket exposes no merge timestamp; last update of a merged or
        // declined PR is the closest available instant.
        let (state, merged_at, closed_at) = match state_raw {
            "MERGED" => (PrState::Merged, updated_on, updated_on),
            "DECLINED" | "SUPERSEDED" => (PrState::Closed, None, updated_on),
            _ => (PrState::Open, None, None),
        };

        let mut comments = Vec::new();
        let mut commenters = std::collections::BTreeSet::new();
        let mut comment_count: u64 = 0;
        let comment_items = detail_values(details, 0, number, "comments")?;
        for comment in &comment_items {
            if comment.get("deleted").and_then(|v| v.as_bool()).unwrap_or(false) {
                continue;
            }
            let Some(at) = comment.get("created_on").and_then(|v| v.as_str()) else {
                continue;
            };
            comment_count += 1;
            let (login, is_bot) = account_identity(comment.get("user"));
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
        let full_pr = details.get(2).ok_or_else(|| Error::Normalize {
            number,
            message: "missing PR detail payload".into(),
        })?;
        for participant in full_pr
            .get("participants")
            .and_then(|v| v.as_array())
            .map(|a| a.as_slice())
            .unwrap_or(&[])
        {
            let approved = participant
                .get("approved")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !approved {
                continue;
            }
            let (login, is_bot) = account_identity(participant.get("user"));
            if is_bot {
                continue;
            }
            reviewers.insert(login.clone());
            // An approval is a formal review submission
            if let Some(at) = participant.get("participated_on").and_then(|v| v.as_str()) {
                comments.push(CommentEntry {
                    author: login,
                    author_is_bot: false,
                    at: parse_instant(at)?,
                    kind: CommentKind::Review,
                });
            }
        }

        let mut commits = Vec::new();
        let commit_items = detail_values(details, 1, number, "commits")?;
        for commit in &commit_items {
            let Some(date) = commit.get("date").and_then(|v| v.as_str()) else {
                continue;
            };
            let at = parse_instant(date)?;
            let raw_name = commit
                .pointer("/author/raw")
                .and_then(|v| v.as_str())
                .map(strip_email)
                .unwrap_or_default();
            let login = commit
                .pointer("/author/user/nickname")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            commits.push(CommitEntry {
                author_name: raw_name,
                author_login: login,
                authored_at: at,
                committed_at: at,
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
            lines_changed: 0,
        }
        .finalize()
    }

    fn min_retry_after_secs(&self) -> u64 {
        60
    }

    fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }
}

/// Nickname (falling back to display name) plus bot flag for a Bitbucket
/// account object.
fn account_identity(account: Option<&Value>) -> (String, bool) {
    let name = account.and_then(|a| {
        a.get("nickname")
            .or_else(|| a.get("display_name"))
            .and_then(|v| v.as_str())
    });
    let flagged_bot = account
        .and_then(|a| a.get("type"))
        .and_then(|v| v.as_str())
        .is_some_and(|t| t != "user");
    let is_bot = is_automated(name, flagged_bot);
    (name.unwrap_or("unknown").to_string(), is_bot)
}

fn optional_instant(item: &Value, field: &str) -> Result<Option<DateTime<Utc>>> {
    match item.get(field).and_then(|v| v.as_str()) {
        Some(raw) => Ok(Some(parse_instant(raw)?)),
        None => Ok(None),
    }
}

/// "Alice W <alice@example.com>" -> "Alice W"
fn strip_email(raw: &str) -> String {
    match raw.split_once('<') {
        Some((name, _)) => name.trim().to_string(),
        None => raw.trim().to_string(),
    }
}

fn detail_values(
    details: &[Value],
    index: usize,
    number: u64,
    what: &str,
) -> Result<Vec<Value>> {
    details
        .get(index)
        .and_then(|v| v.get("values"))
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| Error::Normalize {
            number,
            message: format!("{what} detail payload missing values array"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> BitbucketAdapter {
        BitbucketAdapter::new("acme/widgets", None, None).unwrap()
    }

    fn pr_item() -> Value {
        json!({
            "id": 12,
            "created_on": "2024-06-02T00:00:00+00:00",
            "updated_on": "2024-06-05T00:00:00+00:00",
            "state": "MERGED",
            "author": {"nickname": "alice", "type": "user"},
            "destination": {"branch": {"name": "main"}}
        })
    }

    fn details() -> Vec<Value> {
        vec![
            json!({"values": [
                {"user": {"nickname": "bob", "type": "user"}, "created_on": "2024-06-02T04:00:00+00:00"},
                {"user": {"nickname": "pipeline-runner", "type": "app"}, "created_on": "2024-06-02T01:00:00+00:00"}
            ]}),
            json!({"values": [
                {"date": "2024-06-02T06:00:00+00:00",
                 "author": {"raw": "Alice W <alice@example.com>", "user": {"nickname": "alice"}}}
            ]}),
            json!({"participants": [
                {"role": "REVIEWER", "approved": true, "user": {"nickname": "carol", "type": "user"},
                 "participated_on": "2024-06-03T00:00:00+00:00"},
                {"role": "REVIEWER", "approved": false, "user": {"nickname": "dave", "type": "user"}}
            ]}),
        ]
    }

    #[test]
    fn test_parse_page_follows_next_link() {
        let a = adapter();
        let payload = json!({"values": [pr_item()], "next": "https://api.bitbucket.org/..."});
        let page = a
            .parse_page(&payload, &PageCursor::Offset { page: 1 })
            .unwrap();
        assert_eq!(page.next, Some(PageCursor::Offset { page: 2 }));

        let last = json!({"values": [pr_item()]});
        let page = a.parse_page(&last, &PageCursor::Offset { page: 1 }).unwrap();
        assert!(page.next.is_none());
    }

    #[test]
    fn test_normalize_merged_uses_updated_on() {
        let a = adapter();
        let record = a.normalize(&pr_item(), &details()).unwrap();
        assert_eq!(record.state, PrState::Merged);
        assert_eq!(
            record.merged_at,
            Some("2024-06-05T00:00:00Z".parse().unwrap())
        );
    }

    #[test]
    fn test_normalize_approvals_become_reviews() {
        let a = adapter();
        let record = a.normalize(&pr_item(), &details()).unwrap();
        assert!(record.reviewers.contains("carol"));
        assert!(!record.reviewers.contains("dave"));
        assert!(record
            .comments
            .iter()
            .any(|c| c.kind == CommentKind::Review && c.author == "carol"));
    }

    #[test]
    fn test_normalize_app_comments_counted_but_not_commenters() {
        let a = adapter();
        let record = a.normalize(&pr_item(), &details()).unwrap();
        // Both comments count toward raw volume
        assert_eq!(record.comment_count, 2);
        // Only the human is a commenter
        assert_eq!(record.commenters.len(), 1);
        assert!(record.commenters.contains("bob"));
    }

    #[test]
    fn test_detail_pagination_follows_next_links() {
        let a = adapter();
        let comments_req = a.detail_requests(&pr_item()).unwrap().remove(0);

        let page1 = json!({
            "values": [{"user": {"nickname": "bob", "type": "user"},
                        "created_on": "2024-06-02T04:00:00+00:00"}],
            "next": "https://api.bitbucket.org/..."
        });
        let next = a.detail_next(&comments_req, &page1).unwrap();
        assert!(next.query.contains(&("page".to_string(), "2".to_string())));

        let page2 = json!({
            "values": [{"user": {"nickname": "carol", "type": "user"},
                        "created_on": "2024-06-02T05:00:00+00:00"}]
        });
        assert!(a.detail_next(&next, &page2).is_none());

        let mut acc = page1;
        a.append_detail_page(&mut acc, page2);
        assert_eq!(acc["values"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_full_pr_detail_does_not_paginate() {
        let a = adapter();
        let detail_req = a.detail_requests(&pr_item()).unwrap().remove(2);
        let full_pr = json!({"participants": []});
        assert!(a.detail_next(&detail_req, &full_pr).is_none());
    }

    #[test]
    fn test_strip_email() {
        assert_eq!(strip_email("Alice W <a@x.com>"), "Alice W");
        assert_eq!(strip_email("alice"), "alice");
    }
}
