//! # pulsecore-server
//!
//! Binary entry point: logging init, CLI parsing, configuration loading,
//! and graceful shutdown of the pipeline service.

use std::env;
use std::process;

use clap::{Arg, Command};
use dotenvy::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulsecore::{config::Config, error::CoreError, PipelineService, SERVICE_NAME, VERSION};

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = dotenv() {
        warn!("failed to load .env file: {}", e);
    }

    let matches = create_cli().get_matches();

    if matches.get_flag("validate-config") {
        match load_configuration().await {
            Ok(_) => {
                info!("configuration is valid");
                process::exit(0);
            }
            Err(e) => {
                error!("configuration validation failed: {}", e);
                process::exit(1);
            }
        }
    }

    info!("starting {} version {} ({} logical cpus)", SERVICE_NAME, VERSION, num_cpus::get());

    let mut config = match load_configuration().await {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Some(port) = matches.get_one::<String>("port").and_then(|p| p.parse().ok()) {
        config.server.port = port;
    }
    if let Some(workers) = matches.get_one::<String>("workers").and_then(|w| w.parse().ok()) {
        config.processing.worker_count = workers;
    }

    info!("configuration loaded: environment={}", config.environment.name);

    if let Err(e) = run_service(config).await {
        error!("service failed: {}", e);
        process::exit(1);
    }

    info!("service stopped gracefully");
}

fn init_logging() {
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
    );

    if log_format == "json" {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .init();
    } else {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .init();
    }

    info!("logging initialized with level: {}", log_level);
}

fn create_cli() -> Command {
    Command::new(SERVICE_NAME)
        .version(VERSION)
        .about("Event processing core: ingestion, anomaly detection, retry/DLQ, and broadcast fan-out")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("configuration file path")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("validate-config")
                .long("validate-config")
                .help("validate configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("override server port")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("COUNT")
                .help("override worker pool size")
                .action(clap::ArgAction::Set),
        )
}

async fn load_configuration() -> Result<Config, CoreError> {
    let config = Config::from_env().map_err(|e| CoreError::configuration(e.to_string()))?;
    config
        .validate()
        .map_err(|e| CoreError::configuration(e.to_string()))?;
    Ok(config)
}

async fn run_service(config: Config) -> Result<(), CoreError> {
    let service = PipelineService::new(config).await?;

    let service_handle = {
        let service = service.clone();
        tokio::spawn(async move { service.start().await })
    };

    tokio::select! {
        result = service_handle => {
            match result {
                Ok(Ok(())) => info!("service completed"),
                Ok(Err(e)) => {
                    error!("service failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("service task panicked: {}", e);
                    return Err(CoreError::internal("service task panicked"));
                }
            }
        }
        _ = PipelineService::shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("initiating graceful shutdown");
    service.stop().await
}
