//! Crawl Worker
//!
//! One process per shard assignment. Claims crawl jobs, enforces
//! per-domain politeness, and reports liveness on its own timer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use coordinator_core::executor::{ExecutionReport, JobExecutor, ResultCounts};
use coordinator_core::models::{CrawlJob, WorkerRegistration};
use coordinator_core::rate_guard::RateGuard;
use coordinator_core::refresh::RefreshPolicy;
use coordinator_core::reporter::{HeartbeatReporter, WorkerStats};
use coordinator_core::service::ServiceHost;
use coordinator_core::store::PostgresStore;
use coordinator_core::worker::{CrawlWorker, CrawlWorkerConfig};
use coordinator_core::Config;
use politeness::{DelayPolicy, HttpRobotsReader, QuarantineSchedule};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "crawl_worker", about = "Shard-partitioned crawl worker")]
struct Args {
    /// Unique worker name, e.g. crawl-mn-1
    #[arg(long)]
    name: String,

    /// Partition keys this worker owns, e.g. --shard MN,WI
    #[arg(long, required = true, value_delimiter = ',')]
    shard: Vec<String>,

    /// Jobs claimed per cycle
    #[arg(long, default_value_t = 5)]
    batch_size: i64,

    /// Override ORPHAN_TIMEOUT_SECS for this process
    #[arg(long)]
    orphan_timeout_secs: Option<u64>,
}

/// Fetches the job's search page and classifies the response. Result
/// extraction is handled by the downstream pipeline reading the fetch
/// store; this executor only decides completed / blocked / failed.
struct FetchClassifyExecutor {
    client: reqwest::Client,
}

impl FetchClassifyExecutor {
    fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn search_url(job: &CrawlJob) -> String {
        format!(
            "https://{}/search?q={}+{}",
            job.target_domain,
            urlencode(&job.category),
            urlencode(&job.city)
        )
    }
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl JobExecutor for FetchClassifyExecutor {
    async fn execute(&self, job: &CrawlJob, cancel: &CancellationToken) -> ExecutionReport {
        let url = Self::search_url(job);
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return ExecutionReport::Failed {
                    error: "cancelled before fetch completed".to_string(),
                };
            }
            result = self.client.get(&url).send() => match result {
                Ok(response) => response,
                Err(e) => {
                    return ExecutionReport::Failed {
                        error: format!("fetch failed: {}", e),
                    };
                }
            },
        };

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 403 || status.as_u16() == 503 {
            let retry_after = retry_after(&response);
            return ExecutionReport::Blocked {
                signal: format!("http {}", status.as_u16()),
                retry_after,
            };
        }
        if !status.is_success() {
            return ExecutionReport::Failed {
                error: format!("http {} from {}", status.as_u16(), url),
            };
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return ExecutionReport::Failed {
                    error: format!("body read failed: {}", e),
                };
            }
        };
        let lowered = body.to_lowercase();
        if lowered.contains("captcha") || lowered.contains("unusual traffic") {
            return ExecutionReport::Blocked {
                signal: "captcha interstitial".to_string(),
                retry_after: None,
            };
        }

        tracing::debug!(job_id = job.id, url = %url, bytes = body.len(), "page fetched");
        ExecutionReport::Completed(ResultCounts::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,coordinator_core=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    tracing::info!(worker = %args.name, shard = ?args.shard, "Starting crawl worker");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store = PostgresStore::shared(pool);

    let http = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(20))
        .build()
        .context("Failed to build HTTP client")?;
    let robots = Arc::new(HttpRobotsReader::new(http.clone(), config.user_agent.clone()));

    let policy = DelayPolicy {
        min_delay: config.min_request_delay,
        max_delay: config.max_request_delay,
        max_backoff: config.max_backoff,
        ..DelayPolicy::default()
    };
    let rate = Arc::new(RateGuard::new(
        store.clone(),
        robots,
        policy,
        QuarantineSchedule::default(),
    ));

    let stats = WorkerStats::new();

    let mut worker_config = CrawlWorkerConfig::new(args.name.clone(), args.shard);
    worker_config.batch_size = args.batch_size;
    worker_config.orphan_timeout = args
        .orphan_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(config.orphan_timeout);
    worker_config.job_heartbeat_interval = config.heartbeat_interval;

    let worker = CrawlWorker::new(
        store.clone(),
        rate,
        Arc::new(FetchClassifyExecutor::new(http)),
        stats.clone(),
        RefreshPolicy::default(),
        worker_config,
    );

    let reporter = HeartbeatReporter::new(
        store,
        stats,
        WorkerRegistration::for_process(&args.name, "crawl"),
    )
    .with_interval(config.heartbeat_interval);

    ServiceHost::new()
        .with_service(reporter)
        .with_service(worker)
        .run_until_shutdown()
        .await
}
