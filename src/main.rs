use actix_web::{App, HttpServer, dev::ServerHandle, web::Data};
use anyhow::{Context, Result};
use emberlink_ota::{
    api::{Api, routes},
    config::AppConfig,
    connectivity::{ConnectivityManager, OsRadio},
    session::Updater,
    storage::FileFlash,
};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info, warn};
use std::{io::Write, sync::Arc};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast,
};

enum ShutdownReason {
    Reboot,
    Shutdown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Reboot => write!(f, "rebooting into new boot target"),
            ShutdownReason::Shutdown => write!(f, "shutting down"),
        }
    }
}

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize();

    let config = AppConfig::get();

    let connectivity = Arc::new(ConnectivityManager::new(
        Arc::new(OsRadio),
        config.wifi.connectivity.clone(),
        config.wifi.settings,
    ));
    // Degraded connectivity is not fatal: the device stays reachable via
    // whatever mode came up and a restart retries the association.
    if let Err(e) = connectivity.start().await {
        warn!("initial connectivity degraded: {e}");
    }

    let store = Arc::new(
        FileFlash::new(&config.update.flash_dir, config.update.region_size)
            .context("failed to open update region")?,
    );
    let updater = Arc::new(Updater::new(store));

    let (restart_tx, mut restart_rx) = broadcast::channel(1);
    let api = Api {
        updater,
        connectivity,
        restart_tx,
        idle_timeout: config.update.idle_timeout,
        restart_grace: config.update.restart_grace,
    };

    let (server_handle, server_task) = run_server(api, config.ui.port)?;

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            debug!("ctrl-c received");
            ShutdownReason::Shutdown
        },
        _ = sigterm.recv() => {
            debug!("SIGTERM received");
            ShutdownReason::Shutdown
        },
        _ = restart_rx.recv() => {
            debug!("device restart requested");
            ShutdownReason::Reboot
        },
        result = server_task => {
            match result {
                Ok(Ok(())) => debug!("server stopped normally"),
                Ok(Err(e)) => error!("server stopped with error: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
            ShutdownReason::Shutdown
        },
    };

    info!("{reason}");
    server_handle.stop(true).await;

    // On firmware targets the reboot itself belongs to the platform; here the
    // process exits and the supervisor boots whatever the marker points at.
    Ok(())
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));
}

fn run_server(
    api: Api,
    port: u16,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    info!("starting server on 0.0.0.0:{port}");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(api.clone()))
            .configure(routes)
    })
    .bind(format!("0.0.0.0:{port}"))
    .context("bind failed")?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    Ok((server_handle, server_task))
}
