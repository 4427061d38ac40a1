use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use waypoint_proxy::acceptor::Acceptor;
use waypoint_proxy::blacklist::Blacklist;
use waypoint_proxy::cache::persist::{load_snapshot, spawn_periodic};
use waypoint_proxy::cache::Cache;
use waypoint_proxy::config::Config;
use waypoint_proxy::control::Control;
use waypoint_proxy::handler::Handler;
use waypoint_proxy::logging;

const CONFIG_PATH: &str = "config.json";
const SNAPSHOT_PATH: &str = "cache.pkl";
const FULL_LOG_PATH: &str = "proxy.log";
const DASH_LOG_PATH: &str = "proxy_dash.log";
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match Config::load_from_json(CONFIG_PATH) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("no usable config at {CONFIG_PATH} ({e}), starting with defaults");
            Config::default()
        }
    };

    let blacklist = match config.compile_blacklist() {
        Ok(patterns) => Arc::new(Blacklist::new(patterns)),
        Err(e) => {
            log::error!("blacklist patterns in {CONFIG_PATH} are invalid: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cache = Arc::new(Cache::new(config.cache_limit));
    load_snapshot(&cache, SNAPSHOT_PATH).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (sink, sink_handle) = logging::spawn(FULL_LOG_PATH, DASH_LOG_PATH, shutdown_rx.clone());
    let persist_handle = spawn_periodic(
        Arc::clone(&cache),
        SNAPSHOT_PATH,
        SNAPSHOT_INTERVAL,
        shutdown_rx.clone(),
    );

    let _control = Control::new(
        Arc::clone(&cache),
        Arc::clone(&blacklist),
        SNAPSHOT_PATH,
        CONFIG_PATH,
    );

    let handler = Handler::new(Arc::clone(&cache), Arc::clone(&blacklist), sink);
    let acceptor = match Acceptor::bind(&config.host, config.port, handler).await {
        Ok(acceptor) => acceptor,
        Err(e) => {
            log::error!("failed to bind {}:{}: {e}", config.host, config.port);
            return ExitCode::FAILURE;
        }
    };

    log::info!("listening on {}:{}", config.host, config.port);
    let acceptor_handle = tokio::spawn(acceptor.run(shutdown_rx));

    spawn_reload_on_hangup(Arc::clone(&blacklist));

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    let _ = acceptor_handle.await;
    let _ = persist_handle.await;
    let _ = sink_handle.await;

    ExitCode::SUCCESS
}

/// Reloads the blacklist from the configuration file whenever the process
/// receives SIGHUP, the same reload trigger the dashboard's configuration
/// writer is expected to send instead of restarting the proxy subprocess.
fn spawn_reload_on_hangup(blacklist: Arc<Blacklist>) {
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("could not install SIGHUP handler: {e}");
                return;
            }
        };
        loop {
            hangup.recv().await;
            match Config::load_from_json(CONFIG_PATH) {
                Ok(config) => match blacklist.reload_from_strings(&config.blacklist) {
                    Ok(()) => log::info!("blacklist reloaded from {CONFIG_PATH}"),
                    Err(e) => log::warn!("reload rejected, keeping previous blacklist: {e}"),
                },
                Err(e) => log::warn!("could not reload {CONFIG_PATH}: {e}"),
            }
        }
    });
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("could not install SIGTERM handler: {e}");
            let _ = ctrl_c.await;
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate.recv() => {}
    }
}
