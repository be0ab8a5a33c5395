use hlsproxy::fetch::{FetchError, HttpFetcher, PlaylistFetcher};
use hlsproxy::hls::{ParseError, Playlist, PlaylistParser};
use hlsproxy::metric::{Metric, NullMetric};
use hlsproxy::policy::{FixedQualityPolicy, Quality};
use hlsproxy::proxy::{ProxyConfig, ProxyError, ProxyServer, StreamProxy};
use hlsproxy::upstream;
use log::{error, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::io::AsyncBufReadExt;
use url::Url;

mod cli;
mod event_log;
mod metric;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cmd = cli::Hlsproxy::from_args();

    let res = match cmd {
        cli::Hlsproxy::Serve { manifest, port, bind, public_url, quality, timeout_secs } => {
            let mut config = ProxyConfig::new(SocketAddr::new(bind, port), manifest);
            config.public_url = public_url;
            config.initial_quality = quality;
            config.upstream_timeout = Duration::from_secs(timeout_secs);
            serve(config).await
        },
        cli::Hlsproxy::Inspect { manifest, timeout_secs } => {
            inspect(manifest, Duration::from_secs(timeout_secs)).await
        },
    };
    // exit explicitly, since the stdin reader may still be blocked in a read
    match res {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1)
        },
    }
}

#[derive(Debug)]
enum CliError {
    Proxy(ProxyError),
    Http(reqwest::Error),
    Fetch(FetchError),
    Parse(ParseError),
    Json(serde_json::Error),
    Histogram(hdrhistogram::CreationError),
}
impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Proxy(e) => write!(f, "{}", e),
            CliError::Http(e) => write!(f, "{}", e),
            CliError::Fetch(e) => write!(f, "couldn't load playlist: {}", e),
            CliError::Parse(e) => write!(f, "{}", e),
            CliError::Json(e) => write!(f, "{}", e),
            CliError::Histogram(e) => write!(f, "{:?}", e),
        }
    }
}
impl From<ProxyError> for CliError {
    fn from(e: ProxyError) -> Self {
        CliError::Proxy(e)
    }
}
impl From<reqwest::Error> for CliError {
    fn from(e: reqwest::Error) -> Self {
        CliError::Http(e)
    }
}
impl From<FetchError> for CliError {
    fn from(e: FetchError) -> Self {
        CliError::Fetch(e)
    }
}
impl From<ParseError> for CliError {
    fn from(e: ParseError) -> Self {
        CliError::Parse(e)
    }
}
impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Json(e)
    }
}
impl From<hdrhistogram::CreationError> for CliError {
    fn from(e: hdrhistogram::CreationError) -> Self {
        CliError::Histogram(e)
    }
}

async fn serve(config: ProxyConfig) -> Result<(), CliError> {
    let histogram = hdrhistogram::Histogram::new(3)?;
    let (latency, writer) = metric::create_metric_channel("upstream_latency_ms", histogram);
    let latency = Arc::new(latency);
    let writer = tokio::spawn(writer.consume());

    let server = ProxyServer::bind_with_metric(config, latency.clone())?
        .with_observer(Arc::new(event_log::LoggingObserver));
    let proxy = server.proxy();
    match proxy.local_playlist_url() {
        Some(url) => println!("{}", url),
        None => warn!("no local URL for {}", proxy.remote_playlist_url()),
    }
    tokio::spawn(read_policy_commands(proxy));

    server.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("couldn't listen for Ctrl-C: {}", e);
            futures::future::pending::<()>().await
        }
        info!("shutting down");
    }).await?;

    latency.close();
    if let Err(e) = writer.await {
        warn!("metric writer failed: {}", e);
    }
    Ok(())
}

/// Apply the policy commands typed on stdin, one per line
async fn read_policy_commands(proxy: Arc<StreamProxy>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => apply_policy_command(&proxy, &line),
            Ok(None) => break,
            Err(e) => {
                warn!("couldn't read policy command: {}", e);
                break;
            },
        }
    }
}

fn apply_policy_command(proxy: &StreamProxy, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if line.eq_ignore_ascii_case("off") {
        proxy.set_policy(None);
        return;
    }
    let quality: Quality = match line.parse() {
        Ok(q) => q,
        Err(e) => {
            warn!("{}", e);
            return;
        },
    };
    let policy = FixedQualityPolicy::new(quality);
    if let Playlist::Master(master) = &*proxy.playlist() {
        match policy.select(master) {
            Some(rendition) => info!("quality {} selects {}", quality, rendition.url()),
            None => info!("quality {} matches no rendition of {}", quality, master.url()),
        }
    }
    proxy.set_policy(Some(Arc::new(policy)));
}

async fn inspect(manifest: Url, timeout: Duration) -> Result<(), CliError> {
    let client = upstream::create_client(timeout)?;
    let latency: Arc<dyn Metric> = Arc::new(NullMetric);
    let client = upstream::Client::new(client, upstream::DEFAULT_RESPONSE_LIMIT_BYTES, latency);
    let fetcher = HttpFetcher::new(client);
    let body = fetcher.fetch_playlist(&manifest).await?;
    let mut parser = PlaylistParser::new(&fetcher);
    let playlist = parser.parse(&manifest, &body).await?;
    let summary = event_log::ManifestSummary::of(&playlist);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
