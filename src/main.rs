//! browserstep CLI: runs a step list against a discovered or launched
//! browser, lists targets, captures a screenshot, or prints captured errors.
//! Stdout carries the run's JSON output; all logging goes to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use base64::Engine;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};

use browserstep::browser::launcher;
use browserstep::capture::{ConsoleCapture, NetworkCapture};
use browserstep::config::RunConfig;
use browserstep::discovery::Discovery;
use browserstep::error::Error;
use browserstep::page_session::PageSession;
use browserstep::session::SessionRegistry;
use browserstep::step::executor::StepExecutor;
use browserstep::step::{Step, StepStatus};
use browserstep::target::TargetRegistry;
use browserstep::transport::{ReconnectConfig, Transport};

const EXIT_OK: i32 = 0;
const EXIT_STEP_ERROR: i32 = 1;
const EXIT_VALIDATION_ERROR: i32 = 2;
const EXIT_CONNECTION_ERROR: i32 = 3;

/// browserstep: drives a remote-debugging-protocol browser through JSON step lists.
#[derive(Parser)]
#[command(name = "browserstep", version, about)]
struct Cli {
    /// Discovery host (overrides BROWSERSTEP_HOST / localhost)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Discovery port (overrides BROWSERSTEP_PORT / 9222)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Site-profile directory (overrides BROWSERSTEP_PROFILE_DIR)
    #[arg(long, global = true)]
    profile_dir: Option<PathBuf>,

    /// Launch a local Chrome instead of attaching to an already-running one
    #[arg(long, global = true)]
    launch: bool,

    /// Run a launched Chrome with a visible window (default: headless)
    #[arg(long, global = true)]
    headed: bool,

    /// URL (or regex) pattern the target page must match
    #[arg(long, global = true, default_value = ".*")]
    url_pattern: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a step list (a JSON array of Step objects) from a file, or stdin when omitted.
    Run {
        file: Option<PathBuf>,
        /// Keep running after a step error instead of stopping the run.
        #[arg(long)]
        continue_on_error: bool,
    },
    /// List the browser's current targets (tabs, workers, ...).
    ListTargets,
    /// Capture a screenshot of the selected page.
    Screenshot {
        out: PathBuf,
        #[arg(long, default_value = "png")]
        format: String,
    },
    /// Attach briefly and print the console/network errors captured meanwhile.
    Errors {
        #[arg(long, default_value_t = 2000)]
        duration_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log to stderr only — stdout carries the command's JSON output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    let mut config = RunConfig::from_env();
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.profile_dir.is_some() {
        config.profile_dir = cli.profile_dir.clone();
    }

    let mut launched_chrome: Option<Child> = None;
    if cli.launch {
        match launch_chrome(cli.headed).await {
            Ok((child, port)) => {
                config.host = "localhost".into();
                config.port = port;
                launched_chrome = Some(child);
            }
            Err(err) => {
                tracing::error!("failed to launch chrome: {err:#}");
                std::process::exit(EXIT_CONNECTION_ERROR);
            }
        }
    }

    let exit_code = match cli.command {
        Cmd::Run { file, continue_on_error } => {
            run_steps(&config, &cli.url_pattern, file, !continue_on_error).await
        }
        Cmd::ListTargets => list_targets(&config).await,
        Cmd::Screenshot { out, format } => screenshot(&config, &cli.url_pattern, out, format).await,
        Cmd::Errors { duration_ms } => print_errors(&config, &cli.url_pattern, duration_ms).await,
    };

    if let Some(mut child) = launched_chrome {
        let _ = child.kill().await;
    }

    std::process::exit(exit_code);
}

/// Spawns a local Chrome headless (by default) with a throwaway profile
/// directory and `--remote-debugging-port=0`, then parses the
/// "DevTools listening on ws://host:port/..." line Chrome writes to stderr
/// to learn the port the OS assigned it.
async fn launch_chrome(headed: bool) -> anyhow::Result<(Child, u16)> {
    let binary = launcher::find_chrome_binary()?;
    let profile_dir = tempfile::tempdir().context("creating throwaway Chrome profile dir")?;
    let args = launcher::default_chrome_args(!headed, profile_dir.path());

    let mut command = Command::new(&binary);
    command.args(&args).stderr(std::process::Stdio::piped()).stdout(std::process::Stdio::null());
    let mut child = command.spawn().context("spawning chrome process")?;

    let stderr = child.stderr.take().context("chrome stderr not piped")?;
    let mut lines = BufReader::new(stderr).lines();

    let port = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(line) = lines.next_line().await.ok().flatten() {
            if let Some(port) = parse_devtools_port(&line) {
                return Some(port);
            }
        }
        None
    })
    .await
    .context("timed out waiting for chrome devtools endpoint")?;

    // Keep the profile directory alive for the process lifetime by leaking it;
    // the OS reclaims it on the next temp-dir sweep.
    std::mem::forget(profile_dir);

    match port {
        Some(port) => Ok((child, port)),
        None => {
            let _ = child.kill().await;
            bail!("chrome exited before printing a devtools endpoint")
        }
    }
}

fn parse_devtools_port(line: &str) -> Option<u16> {
    let marker = "DevTools listening on ws://";
    let rest = line.strip_prefix(marker).or_else(|| line.split(marker).nth(1))?;
    let host_port = rest.split('/').next()?;
    host_port.rsplit(':').next()?.parse().ok()
}

struct Attached {
    transport: Arc<Transport>,
    target_registry: Arc<TargetRegistry>,
    session_registry: Arc<SessionRegistry>,
    page: Arc<PageSession>,
}

/// Discovers a `type=page` target matching `url_pattern`, connects the duplex
/// transport, starts the target/session registries, and attaches a session.
/// Retries discovery for a few seconds since a just-launched browser's first
/// tab may not be listed immediately.
async fn attach_page(config: &RunConfig, url_pattern: &str) -> browserstep::error::Result<Attached> {
    let discovery = Discovery::new(&config.host, config.port);
    let discovery_timeout = Duration::from_secs(5);
    let give_up_at = tokio::time::Instant::now() + Duration::from_secs(10);

    let target = loop {
        match discovery.find_page_by_url(url_pattern, discovery_timeout).await {
            Ok(Some(target)) => break target,
            Ok(None) if tokio::time::Instant::now() < give_up_at => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(None) => {
                return Err(Error::discovery(format!(
                    "no page target matching {url_pattern:?}"
                )))
            }
            Err(err) => return Err(err),
        }
    };

    let version = discovery.get_version(discovery_timeout).await?;
    let transport = Arc::new(
        Transport::connect_with_reconnect(&version.web_socket_debugger_url, ReconnectConfig::default()).await?,
    );

    let target_registry = Arc::new(TargetRegistry::new(transport.clone()));
    target_registry.start().await?;

    let session_registry = Arc::new(SessionRegistry::new(transport.clone()));
    session_registry.start().await;

    let session_id = session_registry.attach(&target.id).await?;
    let page = Arc::new(PageSession::new(transport.clone(), session_id, target.id.clone()));

    Ok(Attached { transport, target_registry, session_registry, page })
}

async fn run_steps(
    config: &RunConfig,
    url_pattern: &str,
    file: Option<PathBuf>,
    stop_on_error: bool,
) -> i32 {
    let input = match read_step_input(file).await {
        Ok(input) => input,
        Err(err) => {
            tracing::error!("failed to read step input: {err:#}");
            return EXIT_VALIDATION_ERROR;
        }
    };

    let steps: Vec<Step> = match serde_json::from_str(&input) {
        Ok(steps) => steps,
        Err(err) => {
            tracing::error!("step list is not a valid JSON array of steps: {err}");
            return EXIT_VALIDATION_ERROR;
        }
    };

    let attached = match attach_page(config, url_pattern).await {
        Ok(attached) => attached,
        Err(err) => {
            tracing::error!("failed to attach to a page: {err}");
            return EXIT_CONNECTION_ERROR;
        }
    };

    let console = Arc::new(ConsoleCapture::new(config.max_messages));
    let network = Arc::new(NetworkCapture::new(Vec::new()));
    if let Err(err) = console.start(&attached.page).await {
        tracing::warn!("console capture failed to start: {err}");
    }
    if let Err(err) = network.start(&attached.page).await {
        tracing::warn!("network capture failed to start: {err}");
    }

    let executor = StepExecutor::new(
        attached.page.clone(),
        attached.target_registry.clone(),
        attached.session_registry.clone(),
        config.clone(),
        console,
        network,
    );

    let exit_code = match executor.run(&steps, stop_on_error).await {
        Ok(report) => {
            let status = report.status;
            println!("{}", serde_json::to_string(&report).unwrap_or_default());
            match status {
                StepStatus::Ok => EXIT_OK,
                StepStatus::Error => EXIT_STEP_ERROR,
            }
        }
        Err(err) => {
            tracing::error!("run validation failed: {err}");
            EXIT_VALIDATION_ERROR
        }
    };

    attached.transport.close().await;
    exit_code
}

async fn read_step_input(file: Option<PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("reading step list from stdin")?;
            Ok(buf)
        }
    }
}

async fn list_targets(config: &RunConfig) -> i32 {
    let discovery = Discovery::new(&config.host, config.port);
    match discovery.get_targets(Duration::from_secs(5)).await {
        Ok(targets) => {
            println!("{}", serde_json::to_string(&targets.iter().map(target_to_json).collect::<Vec<_>>()).unwrap_or_default());
            EXIT_OK
        }
        Err(err) => {
            tracing::error!("target discovery failed: {err}");
            EXIT_CONNECTION_ERROR
        }
    }
}

fn target_to_json(target: &browserstep::discovery::DiscoveredTarget) -> serde_json::Value {
    serde_json::json!({
        "id": target.id,
        "type": target.target_type,
        "title": target.title,
        "url": target.url,
    })
}

async fn screenshot(config: &RunConfig, url_pattern: &str, out: PathBuf, format: String) -> i32 {
    let attached = match attach_page(config, url_pattern).await {
        Ok(attached) => attached,
        Err(err) => {
            tracing::error!("failed to attach to a page: {err}");
            return EXIT_CONNECTION_ERROR;
        }
    };

    let console = Arc::new(ConsoleCapture::new(config.max_messages));
    let network = Arc::new(NetworkCapture::new(Vec::new()));
    let executor = StepExecutor::new(
        attached.page.clone(),
        attached.target_registry.clone(),
        attached.session_registry.clone(),
        config.clone(),
        console,
        network,
    );

    let step = Step(
        serde_json::json!({ "screenshot": { "format": format } })
            .as_object()
            .cloned()
            .unwrap(),
    );

    let exit_code = match executor.run(&[step], true).await {
        Ok(report) => match report.steps.first().and_then(|s| s.output.clone()) {
            Some(output) => match write_screenshot(&output, &out).await {
                Ok(()) => EXIT_OK,
                Err(err) => {
                    tracing::error!("failed to write screenshot: {err:#}");
                    EXIT_STEP_ERROR
                }
            },
            None => {
                tracing::error!("screenshot step produced no output");
                EXIT_STEP_ERROR
            }
        },
        Err(err) => {
            tracing::error!("screenshot validation failed: {err}");
            EXIT_VALIDATION_ERROR
        }
    };

    attached.transport.close().await;
    exit_code
}

async fn write_screenshot(output: &serde_json::Value, out: &PathBuf) -> anyhow::Result<()> {
    let data = output
        .get("data")
        .and_then(|v| v.as_str())
        .context("screenshot output missing base64 data")?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .context("decoding base64 screenshot data")?;
    tokio::fs::write(out, bytes).await.context("writing screenshot file")
}

async fn print_errors(config: &RunConfig, url_pattern: &str, duration_ms: u64) -> i32 {
    let attached = match attach_page(config, url_pattern).await {
        Ok(attached) => attached,
        Err(err) => {
            tracing::error!("failed to attach to a page: {err}");
            return EXIT_CONNECTION_ERROR;
        }
    };

    let console = Arc::new(ConsoleCapture::new(config.max_messages));
    let network = Arc::new(NetworkCapture::new(Vec::new()));
    if let Err(err) = console.start(&attached.page).await {
        tracing::warn!("console capture failed to start: {err}");
    }
    if let Err(err) = network.start(&attached.page).await {
        tracing::warn!("network capture failed to start: {err}");
    }

    tokio::time::sleep(Duration::from_millis(duration_ms)).await;

    let aggregator = browserstep::capture::ErrorAggregator::new(console, network);
    println!("{}", serde_json::to_string(&aggregator.to_json().await).unwrap_or_default());

    attached.transport.close().await;
    EXIT_OK
}
