use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{PageCursor, PlatformAdapter, RawPage};
use crate::error::{Error, Result};
use crate::model::{CommentEntry, CommentKind, CommitEntry, PrRecord, PrState};
use crate::normalize::{is_automated, parse_instant};
use crate::transport::Request;
use crate::window::Window;

const BATCH_SIZE: u32 = 100;
const API_VERSION: &str = "7.0";

/// Azure DevOps adapter: REST API with `$top`/`$skip` pagination. The list
/// endpoint cannot filter on creation date, so windowing happens entirely
/// through the caller's scope checks. Threads, commits, and the reviewer
/// votes are fetched per PR.
pub struct AzureAdapter {
    organization: String,
    project: String,
    repo: String,
    branch: Option<String>,
    api_base: String,
}

impl AzureAdapter {
    /// `repo` is `organization/project/repository`.
    pub fn new(repo: &str, branch: Option<String>, api_base: Option<&str>) -> Result<Self> {
        let mut parts = repo.splitn(3, '/');
        let (org, project, repository) = match (parts.next(), parts.next(), parts.next()) {
            (Some(o), Some(p), Some(r)) if !o.is_empty() && !p.is_empty() && !r.is_empty() => {
                (o, p, r)
            }
            _ => {
                return Err(Error::Config(format!(
                    "repository must be organization/project/repository: {repo:?}"
                )))
            }
        };
        let base = api_base
            .unwrap_or("https://dev.azure.com")
            .trim_end_matches('/');
        Ok(Self {
            organization: org.to_string(),
            project: project.to_string(),
            repo: repository.to_string(),
            branch: branch.filter(|b| !b.is_empty()),
            api_base: base.to_string(),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}/{}/_apis/{endpoint}",
            self.api_base, self.organization, self.project
        )
    }

    fn pr_url(&self, id: u64, tail: &str) -> String {
        self.api_url(&format!(
            "git/repositories/{}/pullrequests/{id}/{tail}",
            self.repo
        ))
    }
}

impl PlatformAdapter for AzureAdapter {
    fn label(&self) -> &'static str {
        "azure"
    }

    fn initial_cursor(&self) -> PageCursor {
        PageCursor::Offset { page: 1 }
    }

    fn page_request(&self, _window: &Window, cursor: &PageCursor) -> Request {
        let page = match cursor {
            PageCursor::Offset { page } => *page,
            PageCursor::Cursor { .. } => 1,
        };
        let skip = (page.saturating_sub(1)) * BATCH_SIZE;
        let mut req = Request::get(
            "azure_pr_page",
            self.api_url(&format!("git/repositories/{}/pullrequests", self.repo)),
        )
        .param("api-version", API_VERSION)
        .param("searchCriteria.status", "all")
        .param("$top", BATCH_SIZE.to_string())
        .param("$skip", skip.to_string());
        if let Some(branch) = &self.branch {
            req = req.param("searchCriteria.targetRefName", format!("refs/heads/{branch}"));
        }
        req
    }

    fn parse_page(&self, payload: &Value, cursor: &PageCursor) -> Result<RawPage> {
        let items = payload
            .get("value")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::MalformedResponse("missing value array".into()))?
            .clone();
        let page = match cursor {
            PageCursor::Offset { page } => *page,
            PageCursor::Cursor { .. } => 1,
        };
        let next = if items.len() < BATCH_SIZE as usize {
            None
        } else {
            Some(PageCursor::Offset { page: page + 1 })
        };
        Ok(RawPage { items, next })
    }

    fn item_number(&self, item: &Value) -> Result<u64> {
        item.get("pullRequestId")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::MalformedResponse("PR without pullRequestId".into()))
    }

    fn item_created_at(&self, item: &Value) -> Result<DateTime<Utc>> {
        let raw = item
            .get("creationDate")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::MalformedResponse("PR without creationDate".into()))?;
        parse_instant(raw)
    }

    fn item_in_scope(&self, item: &Value) -> bool {
        // targetRefName is already constrained server-side when a branch is
        // set; re-check to guard against API quirks.
        match &self.branch {
            Some(branch) => item
                .get("targetRefName")
                .and_then(|v| v.as_str())
                .is_some_and(|target| target == format!("refs/heads/{branch}")),
            None => true,
        }
    }

    fn detail_requests(&self, item: &Value) -> Result<Vec<Request>> {
        let id = self.item_number(item)?;
        Ok(vec![
            Request::get("azure_pr_threads", self.pr_url(id, "threads"))
                .param("api-version", API_VERSION),
            Request::get("azure_pr_commits", self.pr_url(id, "commits"))
                .param("api-version", API_VERSION),
            Request::get("azure_pr_reviewers", self.pr_url(id, "reviewers"))
                .param("api-version", API_VERSION),
        ])
    }

    fn normalize(&self, item: &Value, details: &[Value]) -> Result<PrRecord> {
        let number = self.item_number(item)?;
        let created_at = self.item_created_at(item)?;

        let (author, author_is_bot) = identity(item.get("createdBy"));

        let status = item
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("active");
        let closed_date = optional_instant(item, "closedDate")?;
        let (state, merged_at, closed_at) = match status {
            "completed" => (PrState::Merged, closed_date, closed_date),
            "abandoned" => (PrState::Closed, None, closed_date),
            _ => (PrState::Open, None, None),
        };

        let mut comments = Vec::new();
        let mut commenters = std::collections::BTreeSet::new();
        let mut comment_count: u64 = 0;
        let threads = detail_values(details, 0, number, "threads")?;
        for thread in &threads {
            if thread
                .get("isDeleted")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                continue;
            }
            for comment in thread
                .get("comments")
                .and_then(|v| v.as_array())
                .map(|a| a.as_slice())
                .unwrap_or(&[])
            {
                // System entries record votes and policy events, not
                // discussion
                let kind = match comment.get("commentType").and_then(|v| v.as_str()) {
                    Some("system") => continue,
                    Some("text") => CommentKind::Comment,
                    _ => CommentKind::Review,
                };
                let Some(at) = comment.get("publishedDate").and_then(|v| v.as_str()) else {
                    continue;
                };
                comment_count += 1;
                let (login, is_bot) = identity(comment.get("author"));
                if !is_bot {
                    commenters.insert(login.clone());
                }
                comments.push(CommentEntry {
                    author: login,
                    author_is_bot: is_bot,
                    at: parse_instant(at)?,
                    kind,
                });
            }
        }

        let mut reviewers = std::collections::BTreeSet::new();
        let reviewer_items = detail_values(details, 2, number, "reviewers")?;
        for reviewer in &reviewer_items {
            let vote = reviewer.get("vote").and_then(|v| v.as_i64()).unwrap_or(0);
            if vote == 0 {
                continue;
            }
            let (login, is_bot) = identity(Some(reviewer));
            if !is_bot {
                reviewers.insert(login);
            }
        }

        let mut commits = Vec::new();
        let commit_items = detail_values(details, 1, number, "commits")?;
        for commit in &commit_items {
            let authored = commit.pointer("/author/date").and_then(|v| v.as_str());
            let committed = commit.pointer("/committer/date").and_then(|v| v.as_str());
            let (Some(authored), Some(committed)) = (authored, committed) else {
                continue;
            };
            let name = commit
                .pointer("/author/name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let login = commit
                .pointer("/author/email")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            commits.push(CommitEntry {
                author_name: name,
                author_login: login,
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

/// uniqueName (usually an email), falling back to displayName, plus bot
/// flag. Azure identities carry no explicit bot marker, so classification
/// rests on the name heuristics alone.
fn identity(value: Option<&Value>) -> (String, bool) {
    let name = value.and_then(|v| {
        v.get("uniqueName")
            .or_else(|| v.get("displayName"))
            .and_then(|n| n.as_str())
    });
    let is_bot = is_automated(name, false);
    (name.unwrap_or("unknown").to_string(), is_bot)
}

fn optional_instant(item: &Value, field: &str) -> Result<Option<DateTime<Utc>>> {
    match item.get(field).and_then(|v| v.as_str()) {
        Some(raw) => Ok(Some(parse_instant(raw)?)),
        None => Ok(None),
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
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| Error::Normalize {
            number,
            message: format!("{what} detail payload missing value array"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> AzureAdapter {
        AzureAdapter::new("contoso/webapp/frontend", None, None).unwrap()
    }

    fn pr_item() -> Value {
        json!({
            "pullRequestId": 42,
            "creationDate": "2024-06-02T00:00:00Z",
            "closedDate": "2024-06-04T00:00:00Z",
            "status": "completed",
            "targetRefName": "refs/heads/main",
            "createdBy": {"displayName": "Alice W", "uniqueName": "alice@contoso.com"}
        })
    }

    fn details() -> Vec<Value> {
        vec![
            json!({"value": [
                {"comments": [
                    {"commentType": "system", "author": {"uniqueName": "azure devops"},
                     "publishedDate": "2024-06-02T00:01:00Z"},
                    {"commentType": "text", "author": {"uniqueName": "bob@contoso.com"},
                     "publishedDate": "2024-06-02T05:00:00Z"}
                ]},
                {"isDeleted": true, "comments": [
                    {"commentType": "text", "author": {"uniqueName": "carol@contoso.com"},
                     "publishedDate": "2024-06-02T06:00:00Z"}
                ]}
            ]}),
            json!({"value": [
                {"author": {"name": "Alice W", "email": "alice@contoso.com",
                            "date": "2024-06-02T07:00:00Z"},
                 "committer": {"name": "Alice W", "email": "alice@contoso.com",
                               "date": "2024-06-02T07:05:00Z"}}
            ]}),
            json!({"value": [
                {"uniqueName": "carol@contoso.com", "vote": 10},
                {"uniqueName": "dave@contoso.com", "vote": 0},
                {"uniqueName": "project build service", "vote": 10}
            ]}),
        ]
    }

    #[test]
    fn test_bad_repo_coordinates_rejected() {
        assert!(AzureAdapter::new("contoso/webapp", None, None).is_err());
        assert!(AzureAdapter::new("", None, None).is_err());
    }

    #[test]
    fn test_page_request_maps_page_to_skip() {
        let a = adapter();
        let w = Window::new(
            "2024-06-01T00:00:00Z".parse().unwrap(),
            "2024-06-15T00:00:00Z".parse().unwrap(),
        )
        .unwrap();
        let req = a.page_request(&w, &PageCursor::Offset { page: 3 });
        assert!(req.query.contains(&("$skip".to_string(), "200".to_string())));
        assert!(req.query.contains(&("$top".to_string(), "100".to_string())));
    }

    #[test]
    fn test_parse_page_stops_on_short_page() {
        let a = adapter();
        let payload = json!({"value": [pr_item()]});
        let page = a
            .parse_page(&payload, &PageCursor::Offset { page: 1 })
            .unwrap();
        assert!(page.next.is_none());

        let full = json!({"value": vec![pr_item(); BATCH_SIZE as usize]});
        let page = a.parse_page(&full, &PageCursor::Offset { page: 1 }).unwrap();
        assert_eq!(page.next, Some(PageCursor::Offset { page: 2 }));
    }

    #[test]
    fn test_branch_scope_uses_ref_name() {
        let a = AzureAdapter::new(
            "contoso/webapp/frontend",
            Some("main".to_string()),
            None,
        )
        .unwrap();
        assert!(a.item_in_scope(&pr_item()));
        let mut other = pr_item();
        other["targetRefName"] = json!("refs/heads/develop");
        assert!(!a.item_in_scope(&other));
    }

    #[test]
    fn test_normalize_completed_maps_to_merged() {
        let a = adapter();
        let record = a.normalize(&pr_item(), &details()).unwrap();
        assert_eq!(record.state, PrState::Merged);
        assert_eq!(
            record.merged_at,
            Some("2024-06-04T00:00:00Z".parse().unwrap())
        );
        assert_eq!(record.author, "alice@contoso.com");
    }

    #[test]
    fn test_normalize_skips_system_and_deleted_threads() {
        let a = adapter();
        let record = a.normalize(&pr_item(), &details()).unwrap();
        assert_eq!(record.comment_count, 1);
        assert_eq!(record.comments[0].author, "bob@contoso.com");
    }

    #[test]
    fn test_normalize_reviewers_require_vote_and_humanity() {
        let a = adapter();
        let record = a.normalize(&pr_item(), &details()).unwrap();
        assert!(record.reviewers.contains("carol@contoso.com"));
        assert!(!record.reviewers.contains("dave@contoso.com"));
        assert!(!record.reviewers.contains("project build service"));
    }

    #[test]
    fn test_normalize_commit_email_serves_as_login() {
        let a = adapter();
        let record = a.normalize(&pr_item(), &details()).unwrap();
        assert_eq!(
            record.commits[0].author_login.as_deref(),
            Some("alice@contoso.com")
        );
    }
}
