use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mcp_scan_rs::config::ScanConfig;
use mcp_scan_rs::filters::FilterCatalog;
use mcp_scan_rs::pipeline::{Pipeline, RunOutput};
use mcp_scan_rs::probe::{HttpProbe, ProbeSettings};
use mcp_scan_rs::search::{SearchClient, ShodanClient};
use mcp_scan_rs::types::{ScanResult, VerifiedServer};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status for a run stopped with Ctrl-C.
const EXIT_CANCELLED: i32 = 130;

/// mcp-scan-rs: discover and verify publicly reachable MCP servers.
#[derive(Debug, Parser)]
#[command(
    name = "mcp-scan-rs",
    version,
    about = "Discover MCP servers via Shodan and verify them with a protocol handshake.",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover, checkpoint, verify and report.
    Scan {
        #[command(flatten)]
        select: Selection,
        /// Stop after discovery and the checkpoint.
        #[arg(long = "discover-only", default_value_t = false)]
        discover_only: bool,
        #[command(flatten)]
        common: Common,
    },
    /// Discovery only (same as `scan --discover-only`).
    Discover {
        #[command(flatten)]
        select: Selection,
        #[command(flatten)]
        common: Common,
    },
    /// Verify servers from a checkpoint written by an earlier run.
    Verify {
        /// Path to a discovered_servers.json checkpoint.
        checkpoint: PathBuf,
        #[command(flatten)]
        common: Common,
    },
    /// Show the filter catalog.
    ListFilters {
        /// Catalog file (JSON object of category -> queries). Built-in catalog if omitted.
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct Selection {
    /// Only run filters from this category.
    #[arg(long, short = 'c')]
    category: Option<String>,

    /// Ad-hoc search query (repeatable). Overrides --category.
    #[arg(long = "filter", short = 'f')]
    filters: Vec<String>,

    /// Catalog file to use instead of the built-in one.
    #[arg(long = "filters-file")]
    filters_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct Common {
    /// Shodan API key.
    #[arg(long = "api-key", short = 'k', env = "MCP_SCANNER_SHODAN_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Maximum matches taken from each filter.
    #[arg(long = "max-results", short = 'm', default_value_t = 100)]
    max_results: usize,

    /// Concurrent search-backend calls.
    #[arg(long = "search-concurrency", default_value_t = 5)]
    search_concurrency: usize,

    /// Concurrent verification probes.
    #[arg(long, default_value_t = 50)]
    concurrency: usize,

    /// Per-attempt verification timeout in seconds.
    #[arg(long, short = 't', default_value_t = 3.0)]
    timeout: f64,

    /// Directory that receives the run folders.
    #[arg(long, short = 'o', default_value = "scan_results")]
    output: PathBuf,

    /// Accept invalid TLS certificates while probing.
    #[arg(long = "no-ssl-verify", default_value_t = false)]
    no_ssl_verify: bool,
}

impl Common {
    fn to_config(&self) -> Result<ScanConfig> {
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            bail!("--timeout must be a positive number of seconds");
        }
        let config = ScanConfig {
            api_key: self.api_key.clone().unwrap_or_default(),
            max_results_per_filter: self.max_results,
            max_concurrent_searches: self.search_concurrency,
            max_concurrent_verifications: self.concurrency,
            verification_timeout: Duration::from_secs_f64(self.timeout),
            verify_tls: !self.no_ssl_verify,
            output_dir: self.output.clone(),
            ..ScanConfig::default()
        };
        config.validate().context("invalid options")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            on_signal.cancel();
        }
    });

    let output = match cli.command {
        Command::ListFilters { file } => {
            let catalog = FilterCatalog::load(file.as_deref()).context("loading filter catalog")?;
            print_catalog(&catalog);
            return Ok(());
        }
        Command::Scan {
            select,
            discover_only,
            common,
        } => run_scan(&select, &common, !discover_only, cancel).await?,
        Command::Discover { select, common } => run_scan(&select, &common, false, cancel).await?,
        Command::Verify { checkpoint, common } => {
            let pipeline = Pipeline::from_config(common.to_config()?)?;
            pipeline
                .verify(&checkpoint, cancel)
                .await
                .with_context(|| format!("verifying {}", checkpoint.display()))?
        }
    };

    print_run(&output);
    if output.cancelled() {
        std::process::exit(EXIT_CANCELLED);
    }
    Ok(())
}

async fn run_scan(
    select: &Selection,
    common: &Common,
    verify: bool,
    cancel: CancellationToken,
) -> Result<RunOutput> {
    let config = common.to_config()?;
    if config.api_key.trim().is_empty() {
        bail!("a Shodan API key is required (--api-key or MCP_SCANNER_SHODAN_API_KEY)");
    }
    let catalog =
        FilterCatalog::load(select.filters_file.as_deref()).context("loading filter catalog")?;
    let filters = catalog
        .select(select.category.as_deref(), &select.filters)
        .context("selecting filters")?;

    let client = ShodanClient::new(config.api_key.clone(), &config.user_agent)?;
    let account = client
        .account_info()
        .await
        .context("checking Shodan credentials")?;
    info!(query_credits = account.query_credits, plan = ?account.plan, "Shodan account");
    if account.query_credits < 1 {
        bail!("Shodan account has no query credits left");
    }

    let probe = Arc::new(HttpProbe::new(ProbeSettings::from_config(&config))?);
    let search: Arc<dyn SearchClient> = Arc::new(client);
    let pipeline = Pipeline::new(config, Some(search), probe);

    println!("Running {} filter(s)...", filters.len());
    let output = if verify {
        pipeline.scan(&filters, cancel).await
    } else {
        pipeline.discover(&filters, cancel).await
    };
    output.context("scan failed")
}

fn print_catalog(catalog: &FilterCatalog) {
    let name_w = catalog
        .categories()
        .iter()
        .map(|c| c.name.len())
        .max()
        .unwrap_or(0)
        .max("category".len());
    println!("{:<name_w$}  {:>5}  example", "category", "count", name_w = name_w);
    println!("{:-<name_w$}  {:-<5}  {:-<7}", "", "", "", name_w = name_w);
    for c in catalog.categories() {
        let example = c.filters.first().map(|f| f.query.as_str()).unwrap_or("");
        println!(
            "{:<name_w$}  {:>5}  {}",
            c.name,
            c.filters.len(),
            example,
            name_w = name_w
        );
    }
    println!("\nTotal filters: {}", catalog.len());
}

fn print_run(output: &RunOutput) {
    print_summary(&output.result);
    if !output.result.verified.is_empty() {
        print_verified_table(&output.result.verified);
    }
    if let Some(cp) = &output.checkpoint {
        println!("\nCheckpoint: {}", cp.display());
    }
    println!("Results   : {}", output.dir.display());
}

fn print_summary(result: &ScanResult) {
    println!("\nScan {} ({})", result.scan_id, result.status);
    println!("  filters used    : {}", result.filters_used.len());
    println!("  filters failed  : {}", result.filter_failures.len());
    println!("  discovered      : {}", result.discovered.len());
    println!("  probed          : {}", result.host_reports.len());
    println!("  verified        : {}", result.verified.len());
    for f in &result.filter_failures {
        println!("    ! [{}] {}: {}", f.category, f.query, f.reason);
    }
}

fn print_verified_table(servers: &[VerifiedServer]) {
    let mut url_w = "url".len();
    let mut name_w = "server".len();
    for s in servers {
        url_w = url_w.max(s.url.len().min(60));
        name_w = name_w.max(s.server_info.name.as_deref().unwrap_or("").len().min(30));
    }
    let tr_w = "transport".len();
    let tools_w = "tools".len();
    let ms_w = "latency_ms".len();

    println!();
    println!(
        "{:<url_w$}  {:<tr_w$}  {:<name_w$}  {:>tools_w$}  {:>ms_w$}",
        "url",
        "transport",
        "server",
        "tools",
        "latency_ms",
        url_w = url_w,
        tr_w = tr_w,
        name_w = name_w,
        tools_w = tools_w,
        ms_w = ms_w
    );
    println!(
        "{:-<url_w$}  {:-<tr_w$}  {:-<name_w$}  {:-<tools_w$}  {:-<ms_w$}",
        "",
        "",
        "",
        "",
        "",
        url_w = url_w,
        tr_w = tr_w,
        name_w = name_w,
        tools_w = tools_w,
        ms_w = ms_w
    );
    for s in servers {
        let url: String = s.url.chars().take(60).collect();
        let name: String = s
            .server_info
            .name
            .as_deref()
            .unwrap_or("")
            .chars()
            .take(30)
            .collect();
        println!(
            "{:<url_w$}  {:<tr_w$}  {:<name_w$}  {:>tools_w$}  {:>ms_w$}",
            url,
            s.confirmed_transport.as_str(),
            name,
            s.tools.len(),
            s.response_time_ms,
            url_w = url_w,
            tr_w = tr_w,
            name_w = name_w,
            tools_w = tools_w,
            ms_w = ms_w
        );
    }
}
