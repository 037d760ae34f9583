//! CLI entry point: argument parsing, logging setup, and the wiring that
//! turns a `Settings` file into a running `Scheduler`.

pub mod auth;
pub mod backoff;
pub mod constants;
pub mod error;
pub mod gql;
pub mod http;
pub mod models;
pub mod pool;
pub mod ratelimit;
pub mod scheduler;
pub mod services;
pub mod settings;
pub mod utils;
pub mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use auth::Auth;
use error::MinerError;
use gql::GqlClient;
use http::HttpClient;
use pool::Pool;
use scheduler::Scheduler;
use services::watch::Watcher;
use settings::Settings;

/// Mine time-gated Twitch drops in the background.
#[derive(Parser, Debug)]
#[command(name = "twitch-drops-core", version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity; repeat up to four times
    /// (error, warning, info, call, debug).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run a single inventory fetch, print the resulting campaign list, and exit.
    #[arg(long)]
    dump: bool,

    /// Raise the websocket sub-logger to DEBUG (or INFO if -vvvv is already set).
    #[arg(long, hide = true)]
    debug_ws: bool,

    /// Raise the GQL sub-logger to DEBUG (or INFO if -vvvv is already set).
    #[arg(long, hide = true)]
    debug_gql: bool,

    /// Path to the persisted settings file.
    #[arg(long, default_value = "settings.json")]
    settings: PathBuf,

    /// Path to the persisted cookie jar.
    #[arg(long, default_value = "cookies.json")]
    cookies: PathBuf,

    /// Directory daily-rotating log files are written under.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

/// `-v` count to a base level for the `twitch_drops_core` target, mirroring
/// the original's `ERROR, WARNING, INFO, CALL, DEBUG` ladder (`CALL` has no
/// tracing equivalent, so it collapses onto `DEBUG` one step early).
fn base_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Build the `EnvFilter` directive string for a sub-logger override: DEBUG
/// normally, but INFO when the global level is already maxed out, matching
/// `ParsedArgs.debug_ws`/`debug_gql` not being allowed to go *below* the
/// global verbosity.
fn sublogger_directive(target: &str, verbose: u8) -> String {
    let level = if verbose >= 4 { "info" } else { "debug" };
    format!("twitch_drops_core::{target}={level}")
}

fn init_logging(cli: &Cli) -> tracing_appender::non_blocking::WorkerGuard {
    let mut directives = vec![format!("twitch_drops_core={}", base_level(cli.verbose))];
    if cli.debug_ws {
        directives.push(sublogger_directive("websocket", cli.verbose));
        directives.push(sublogger_directive("pool", cli.verbose));
    }
    if cli.debug_gql {
        directives.push(sublogger_directive("gql", cli.verbose));
    }
    let filter = directives
        .into_iter()
        .fold(EnvFilter::new("error"), |filter, directive| {
            filter.add_directive(directive.parse().expect("well-formed log directive"))
        });

    let file_appender = tracing_appender::rolling::daily(&cli.log_dir, "twitch-drops-core.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli);

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("fatal: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<(), MinerError> {
    let settings = Settings::load(&cli.settings);
    let quality = settings.get().connection_quality;
    let proxy = settings.get().proxy.clone();
    let proxy = if proxy.is_empty() { None } else { Some(proxy.as_str()) };
    if let Some(p) = proxy {
        tracing::info!("using proxy {}", utils::mask_proxy_url(p));
    }

    let http_client = HttpClient::new(quality, proxy, &cli.cookies);
    let auth = Arc::new(Auth::new(http_client.clone()));
    let gql = GqlClient::new(http_client.clone(), auth.clone());
    let (pool, ws_events) = Pool::new(auth.clone());
    let watcher = Watcher::new(http_client.clone(), auth.clone());

    let on_device_code: auth::DeviceCodeCallback = Arc::new(|code: &str, url: &str| {
        println!("Log in at {url} and enter the code: {code}");
    });
    auth.validate(on_device_code).await?;
    let user_id = auth.snapshot().await.user_id;

    let scheduler = Scheduler::new(http_client, auth, gql, pool, watcher, settings, user_id, cli.dump);
    scheduler.run(ws_events).await
}
