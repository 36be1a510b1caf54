use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

use provider_guard::config::{load_or_default, loader::TOKEN_ENV};
use provider_guard::observer::{
    ClientScanPointer, FilePointerStore, MemoryPointerStore, PointerStore, PushFeed, RealtimeFeed,
    RestSignals, ScanTracker, TrackerView,
};

#[derive(Parser)]
#[command(name = "guard-cli")]
#[command(about = "Operator CLI for the provider guard", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Internal token for control actions; falls back to $WORKER_TOKEN
    #[arg(short, long)]
    token: Option<String>,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    /// Config file supplying observer settings for `watch`
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask whether a provider may be called
    Check { provider: String },
    /// Record a successful provider call
    Success {
        provider: String,
        #[arg(long)]
        latency_ms: Option<u64>,
    },
    /// Record a failed provider call
    Failure {
        provider: String,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Force a provider's circuit closed
    Reset { provider: String },
    /// Show a provider's health and circuit rows
    Health { provider: String },
    /// Service status and circuit counts
    Status,
    /// List every known provider
    Providers,
    /// Journal timeline of a provider
    Events {
        provider: String,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Follow a scan until it reaches a terminal status
    Watch {
        scan_id: String,
        #[arg(long, default_value = "unknown")]
        scan_type: String,
        #[arg(long, default_value = "")]
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut admin_headers = HeaderMap::new();
    admin_headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let token = cli
        .token
        .clone()
        .or_else(|| std::env::var(TOKEN_ENV).ok())
        .unwrap_or_default();

    let control = |body: Value| {
        client
            .post(format!("{}/v1/circuit-breaker", cli.url))
            .header("x-internal-token", token.as_str())
            .json(&body)
            .send()
    };

    match &cli.command {
        Commands::Check { provider } => {
            print_response(control(json!({"action": "check", "provider_id": provider})).await?).await?;
        }
        Commands::Success { provider, latency_ms } => {
            let body = json!({"action": "record_success", "provider_id": provider, "latency_ms": latency_ms});
            print_response(control(body).await?).await?;
        }
        Commands::Failure { provider, message } => {
            let body = json!({"action": "record_failure", "provider_id": provider, "error_message": message});
            print_response(control(body).await?).await?;
        }
        Commands::Reset { provider } => {
            print_response(control(json!({"action": "manual_reset", "provider_id": provider})).await?).await?;
        }
        Commands::Health { provider } => {
            print_response(control(json!({"action": "get_health", "provider_id": provider})).await?).await?;
        }
        Commands::Status => {
            let res = client.get(format!("{}/admin/status", cli.url))
                .headers(admin_headers)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Providers => {
            let res = client.get(format!("{}/admin/providers", cli.url))
                .headers(admin_headers)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Events { provider, limit } => {
            let res = client.get(format!("{}/admin/providers/{}/events", cli.url, provider))
                .query(&[("limit", limit)])
                .headers(admin_headers)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Watch { scan_id, scan_type, target } => {
            watch(cli.config.as_deref(), ClientScanPointer::new(scan_id, scan_type, target)).await?;
        }
    }

    Ok(())
}

async fn watch(
    config: Option<&std::path::Path>,
    pointer: ClientScanPointer,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_or_default(config)?.observer;
    let source = Arc::new(RestSignals::new(&config.rest_url, &config.api_key)?);
    let feed: Arc<dyn PushFeed> = Arc::new(RealtimeFeed::new(&config.realtime_url, &config.api_key)?);
    let pointers: Arc<dyn PointerStore> = match &config.pointer_path {
        Some(path) => Arc::new(FilePointerStore::new(path)),
        None => Arc::new(MemoryPointerStore::new()),
    };

    let tracker = ScanTracker::new(source, Some(feed), pointers, config);
    tracker.start_tracking(pointer);

    let print = |view: &TrackerView| {
        if view.active_scan.is_none() {
            return;
        }
        match serde_json::to_string(view) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Error: {}", e),
        }
    };
    tokio::select! {
        _ = tracker.follow(print) => {}
        _ = tokio::signal::ctrl_c() => tracker.clear_active_scan(),
    }
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: service returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
