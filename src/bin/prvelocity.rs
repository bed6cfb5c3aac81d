use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, ValueEnum};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};

use prvelocity::{
    AnalysisOptions, AzureAdapter, BitbucketAdapter, ComparativeResult, GithubAdapter,
    GitlabAdapter, HttpTransport, PeriodSummary, PlatformAdapter, Progress, VelocityAnalyzer,
};

#[derive(Parser)]
#[command(name = "prvelocity", about = "Comparative PR velocity metrics CLI")]
struct Cli {
    /// Hosting platform
    #[arg(value_enum)]
    platform: Platform,

    /// Repository coordinates: owner/name (GitHub), project ID or path
    /// (GitLab), workspace/repo-slug (Bitbucket), org/project/repo (Azure)
    repo: String,

    /// API token. Falls back to the PRVELOCITY_TOKEN environment variable
    #[arg(long)]
    token: Option<String>,

    /// Username for basic auth (Bitbucket app passwords)
    #[arg(long)]
    username: Option<String>,

    /// Date the automation went live (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    automation_date: Option<String>,

    /// Length of each comparison window, in weeks
    #[arg(long, default_value = "4")]
    lookback_weeks: u32,

    /// Only count PRs targeting this branch
    #[arg(long)]
    branch: Option<String>,

    /// Override the platform API base URL (self-hosted instances)
    #[arg(long)]
    api_base: Option<String>,

    /// Concurrent detail-fetch limit
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Output the full result as JSON
    #[arg(long)]
    json: bool,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum Platform {
    Github,
    Gitlab,
    Bitbucket,
    Azure,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl Progress for StderrProgress {
    fn on_page(&self, label: &str, page: u32, items: usize) {
        eprintln!("  [{label}] page {page}: {items} PRs");
    }

    fn on_record(&self, label: &str, processed: usize, total: usize) {
        if processed == total {
            eprint!("\r  [{label}] processing PRs: {processed}/{total}   \n");
        } else {
            eprint!("\r  [{label}] processing PRs: {processed}/{total}   ");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let token = match cli.token.clone() {
        Some(token) => token,
        None => std::env::var("PRVELOCITY_TOKEN")
            .map_err(|_| anyhow::anyhow!("no token: pass --token or set PRVELOCITY_TOKEN"))?,
    };

    let automation_at = cli
        .automation_date
        .as_deref()
        .map(parse_automation_date)
        .transpose()?;

    let adapter: Box<dyn PlatformAdapter> = match cli.platform {
        Platform::Github => Box::new(GithubAdapter::new(
            &cli.repo,
            cli.branch.clone(),
            cli.api_base.as_deref(),
        )?),
        Platform::Gitlab => Box::new(GitlabAdapter::new(
            &cli.repo,
            cli.branch.clone(),
            cli.api_base.as_deref(),
        )?),
        Platform::Bitbucket => Box::new(BitbucketAdapter::new(
            &cli.repo,
            cli.branch.clone(),
            cli.api_base.as_deref(),
        )?),
        Platform::Azure => Box::new(AzureAdapter::new(
            &cli.repo,
            cli.branch.clone(),
            cli.api_base.as_deref(),
        )?),
    };

    let transport = build_transport(cli.platform, &token, cli.username.as_deref())?;
    let analyzer = VelocityAnalyzer::new(Arc::new(transport));

    let options = AnalysisOptions {
        automation_at,
        lookback_weeks: cli.lookback_weeks,
        max_in_flight: cli.max_in_flight,
    };

    let result = analyzer
        .compare(adapter.as_ref(), &options, &StderrProgress)
        .await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(())
}

/// Accepts a bare date (midnight UTC) or a full RFC 3339 instant.
fn parse_automation_date(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow::anyhow!("invalid date: {raw}"))?;
        return Ok(midnight.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow::anyhow!("invalid automation date {raw:?}: {e}"))
}

fn build_transport(
    platform: Platform,
    token: &str,
    username: Option<&str>,
) -> anyhow::Result<HttpTransport> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("prvelocity"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let auth_header = |value: String| -> anyhow::Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&value)
            .map_err(|_| anyhow::anyhow!("token contains invalid header characters"))?;
        value.set_sensitive(true);
        Ok(value)
    };

    match platform {
        Platform::Github => {
            headers.insert(AUTHORIZATION, auth_header(format!("Bearer {token}"))?);
            Ok(HttpTransport::new(headers))
        }
        Platform::Gitlab => {
            headers.insert("PRIVATE-TOKEN", auth_header(token.to_string())?);
            Ok(HttpTransport::new(headers))
        }
        Platform::Bitbucket => {
            let username = username
                .ok_or_else(|| anyhow::anyhow!("Bitbucket app passwords need --username"))?;
            Ok(HttpTransport::new(headers).with_basic_auth(username, token))
        }
        // Azure DevOps PATs go in the basic-auth password slot
        Platform::Azure => Ok(HttpTransport::new(headers).with_basic_auth("", token)),
    }
}

fn print_result(result: &ComparativeResult) {
    println!(
        "Automation date: {}",
        result.automation_at.format("%Y-%m-%d")
    );
    if let Some(branch) = &result.branch {
        println!("Branch filter:   {branch}");
    }
    print_summary("BEFORE", &result.before);
    print_summary("AFTER", &result.after);
}

fn print_summary(label: &str, summary: &PeriodSummary) {
    println!();
    println!(
        "== {label} ({} to {}) ==",
        summary.window_start.format("%Y-%m-%d"),
        summary.window_end.format("%Y-%m-%d")
    );
    if !summary.completed {
        println!("  (incomplete: pagination aborted, figures are partial)");
    }
    println!("  PRs opened:            {}", summary.total_prs);
    println!("  PRs merged:            {}", summary.merged_prs);
    println!("  PRs/week:              {:.2}", summary.prs_per_week);
    println!("  Merged/week:           {:.2}", summary.merged_per_week);
    println!(
        "  Avg comments/PR:       {}",
        fmt_avg(summary.avg_comments_per_pr)
    );
    println!(
        "  Avg time to merge:     {}",
        fmt_hours(summary.avg_time_to_merge_hours)
    );
    println!(
        "  Avg time to 1st cmnt:  {}",
        fmt_hours(summary.avg_time_to_first_comment_hours)
    );
    println!(
        "  Avg cmnt -> follow-up: {}",
        fmt_hours(summary.avg_first_comment_to_followup_hours)
    );
    println!("  Unique contributors:   {}", summary.unique_contributors);
    if summary.failed_records > 0 {
        println!("  Failed records:        {}", summary.failed_records);
    }
}

fn fmt_avg(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.2}"),
        None => "n/a".to_string(),
    }
}

fn fmt_hours(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.1}h"),
        None => "n/a".to_string(),
    }
}
