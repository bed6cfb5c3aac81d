use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{PageCursor, PlatformAdapter, RawPage};
use crate::error::{Error, Result};
use crate::model::{CommentEntry, CommentKind, CommitEntry, PrRecord, PrState};
use crate::normalize::{is_automated, parse_instant};
use crate::transport::Request;
use crate::window::Window;

const PAGE_SIZE: usize = 50;

/// One GraphQL round trip per page, with reviews, commits, and timeline
/// items embedded so no detail calls are needed.
const PR_PAGE_QUERY: &str = r#"
query($owner: String!, $repo: String!, $after: String) {
  repository(owner: $owner, name: $repo) {
    pullRequests(first: 50, after: $after, orderBy: {field: CREATED_AT, direction: DESC}) {
      pageInfo {
        hasNextPage
        endCursor
      }
      nodes {
        number
        createdAt
        mergedAt
        closedAt
        state
        additions
        deletions
        baseRefName
        author {
          login
          __typename
        }
        comments { totalCount }
        reviews(first: 100) {
          nodes {
            author { login __typename }
            createdAt
          }
        }
        commits(first: 100) {
          nodes {
            commit {
              author { name date user { login } }
              committer { date }
            }
          }
        }
        timelineItems(first: 100, itemTypes: [ISSUE_COMMENT, PULL_REQUEST_REVIEW]) {
          nodes {
            __typename
            ... on IssueComment {
              author { login __typename }
              createdAt
            }
            ... on PullRequestReview {
              author { login __typename }
              createdAt
            }
          }
        }
      }
    }
  }
}
"#;

/// GitHub adapter: GraphQL API, cursor pagination, everything embedded.
pub struct GithubAdapter {
    owner: String,
    repo: String,
    branch: Option<String>,
    graphql_url: String,
}

impl GithubAdapter {
    /// `repo` is `owner/name`. `api_base` defaults to the public API.
    pub fn new(repo: &str, branch: Option<String>, api_base: Option<&str>) -> Result<Self> {
        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("repository must be owner/name: {repo:?}")))?;
        if owner.is_empty() || name.is_empty() {
            return Err(Error::Config(format!("repository must be owner/name: {repo:?}")));
        }
        let base = api_base.unwrap_or("https://api.github.com").trim_end_matches('/');
        Ok(Self {
            owner: owner.to_string(),
            repo: name.to_string(),
            branch: branch.filter(|b| !b.is_empty()),
            graphql_url: format!("{base}/graphql"),
        })
    }
}

impl PlatformAdapter for GithubAdapter {
    fn label(&self) -> &'static str {
        "github"
    }

    fn initial_cursor(&self) -> PageCursor {
        PageCursor::Cursor { after: None }
    }

    fn page_request(&self, _window: &Window, cursor: &PageCursor) -> Request {
        let after = match cursor {
            PageCursor::Cursor { after } => after.clone(),
            PageCursor::Offset { .. } => None,
        };
        Request::post(
            "github_pr_page",
            self.graphql_url.clone(),
            json!({
                "query": PR_PAGE_QUERY,
                "variables": {
                    "owner": self.owner,
                    "repo": self.repo,
                    "after": after,
                },
            }),
        )
    }

    fn parse_page(&self, payload: &Value, _cursor: &PageCursor) -> Result<RawPage> {
        if let Some(errors) = payload.get("errors") {
            return Err(Error::MalformedResponse(format!(
                "GraphQL errors: {errors}"
            )));
        }
        let connection = payload
            .pointer("/data/repository/pullRequests")
            .ok_or_else(|| {
                Error::MalformedResponse("missing data.repository.pullRequests".into())
            })?;
        let items = connection
            .pointer("/nodes")
            .and_then(|n| n.as_array())
            .ok_or_else(|| Error::MalformedResponse("missing pullRequests.nodes".into()))?
            .iter()
            .filter(|n| !n.is_null())
            .cloned()
            .collect();
        let has_next = connection
            .pointer("/pageInfo/hasNextPage")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let end_cursor = connection
            .pointer("/pageInfo/endCursor")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let next = if has_next {
            Some(PageCursor::Cursor { after: end_cursor })
        } else {
            None
        };
        Ok(RawPage { items, next })
    }

    fn item_number(&self, item: &Value) -> Result<u64> {
        item.get("number")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::MalformedResponse("PR node without number".into()))
    }

    fn item_created_at(&self, item: &Value) -> Result<DateTime<Utc>> {
        let raw = item
            .get("createdAt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::MalformedResponse("PR node without createdAt".into()))?;
        parse_instant(raw)
    }

    fn item_in_scope(&self, item: &Value) -> bool {
        match &self.branch {
            Some(branch) => item
                .get("baseRefName")
                .and_then(|v| v.as_str())
                .is_some_and(|base| base == branch),
            None => true,
        }
    }

    fn detail_requests(&self, _item: &Value) -> Result<Vec<Request>> {
        Ok(Vec::new())
    }

    fn normalize(&self, item: &Value, _details: &[Value]) -> Result<PrRecord> {
        let number = self.item_number(item)?;
        let created_at = self.item_created_at(item)?;

        let (author, author_is_bot) = actor_identity(item.get("author"));
        let merged_at = optional_instant(item, "mergedAt")?;
        let closed_at = optional_instant(item, "closedAt")?;
        let state = match item.get("state").and_then(|v| v.as_str()) {
            Some("MERGED") => PrState::Merged,
            Some("CLOSED") => PrState::Closed,
            _ => PrState::Open,
        };

        let mut comments = Vec::new();
        let mut commenters = std::collections::BTreeSet::new();
        let mut review_count: u64 = 0;
        for node in array_at(item, "/timelineItems/nodes") {
            let kind = match node.get("__typename").and_then(|v| v.as_str()) {
                Some("PullRequestReview") => CommentKind::Review,
                Some("IssueComment") => CommentKind::Comment,
                _ => continue,
            };
            let Some(at) = node.get("createdAt").and_then(|v| v.as_str()) else {
                continue;
            };
            if kind == CommentKind::Review {
                review_count += 1;
            }
            let (login, is_bot) = actor_identity(node.get("author"));
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

        let mut reviewers = std::collections::BTreeSet::new();
        for node in array_at(item, "/reviews/nodes") {
            let (login, is_bot) = actor_identity(node.get("author"));
            if !is_bot {
                reviewers.insert(login);
            }
        }

        let mut commits = Vec::new();
        for node in array_at(item, "/commits/nodes") {
            let Some(commit) = node.get("commit") else {
                continue;
            };
            let name = commit
                .pointer("/author/name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let login = commit
                .pointer("/author/user/login")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let authored = commit.pointer("/author/date").and_then(|v| v.as_str());
            let committed = commit.pointer("/committer/date").and_then(|v| v.as_str());
            let (Some(authored), Some(committed)) = (authored, committed) else {
                continue;
            };
            commits.push(CommitEntry {
                author_name: name,
                author_login: login,
                authored_at: parse_instant(authored)?,
                committed_at: parse_instant(committed)?,
            });
        }

        let issue_comment_count = item
            .pointer("/comments/totalCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let additions = item.get("additions").and_then(|v| v.as_u64()).unwrap_or(0);
        let deletions = item.get("deletions").and_then(|v| v.as_u64()).unwrap_or(0);

        PrRecord {
            number,
            created_at,
            merged_at,
            closed_at,
            author,
            author_is_bot,
            state,
            comments,
            comment_count: issue_comment_count + review_count,
            reviewers,
            commenters,
            commits,
            lines_changed: additions + deletions,
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

/// Login plus bot flag for a GraphQL actor. A missing actor classifies as
/// automated.
fn actor_identity(actor: Option<&Value>) -> (String, bool) {
    let login = actor
        .and_then(|a| a.get("login"))
        .and_then(|v| v.as_str());
    let flagged_bot = actor
        .and_then(|a| a.get("__typename"))
        .and_then(|v| v.as_str())
        == Some("Bot");
    let is_bot = is_automated(login, flagged_bot);
    (login.unwrap_or("unknown").to_string(), is_bot)
}

fn optional_instant(item: &Value, field: &str) -> Result<Option<DateTime<Utc>>> {
    match item.get(field).and_then(|v| v.as_str()) {
        Some(raw) => Ok(Some(parse_instant(raw)?)),
        None => Ok(None),
    }
}

fn array_at<'a>(item: &'a Value, pointer: &str) -> impl Iterator<Item = &'a Value> {
    item.pointer(pointer)
        .and_then(|v| v.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[])
        .iter()
        .filter(|v| !v.is_null())
}
