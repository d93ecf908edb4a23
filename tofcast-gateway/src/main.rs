use std::path::PathBuf;

use axum::extract::State;
use axum::{Json, Router, routing::get};
use clap::Parser;
use tofcast_gateway::{
    Config, FragmentReceiver, GatewayState, HealthSnapshot, MeasurementPublisher,
    MockObservationSource, ObservationSource, SourceConfig, StdoutSink, TcpObservationSource,
    run_publisher, run_reassembler,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tofcast-gateway")]
#[command(about = "Receives broadcast ToF measurements and publishes them")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tofcast-gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tracing=info,tofcast_gateway=info".to_owned());
    // stdout carries the published messages
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(
        http_addr = %config.server.http_addr,
        target = %config.receiver.target_name,
        payload_limit = config.receiver.payload_limit,
        topic = %config.publisher.topic,
        "Starting tofcast-gateway"
    );

    match config.source {
        SourceConfig::Mock {
            interval_ms,
            repeats,
            noise_devices,
        } => {
            info!(
                interval_ms,
                repeats,
                noise_devices,
                "Using mock observation source"
            );
            let source = MockObservationSource::new(
                config.receiver.target_name.clone(),
                config.receiver.payload_limit,
                interval_ms,
                repeats,
                noise_devices,
            )?;
            run_gateway(source, config).await?;
        }
        SourceConfig::Tcp { addr } => {
            info!(%addr, "Using TCP bridge observation source");
            run_gateway(TcpObservationSource::new(addr), config).await?;
        }
    }

    Ok(())
}

async fn run_gateway<O: ObservationSource>(source: O, config: Config) -> color_eyre::Result<()> {
    let cancel = CancellationToken::new();
    let state = GatewayState::new();

    let receiver =
        FragmentReceiver::new(config.receiver.target_name, config.receiver.payload_limit)?;
    let publisher = MeasurementPublisher::new(
        StdoutSink::new(),
        config.publisher.topic,
        config.publisher.max_payload_bytes,
    );

    let observations = source.start(cancel.clone()).await?;

    // One slot: a finished record waits here until the publisher takes it.
    let (record_tx, record_rx) = mpsc::channel(1);

    let reassembler_handle = tokio::spawn(run_reassembler(
        observations,
        receiver,
        record_tx,
        state.clone(),
        cancel.clone(),
    ));

    let cancel_for_publisher = cancel.clone();
    let state_for_publisher = state.clone();
    let publisher_handle = tokio::spawn(async move {
        let result = run_publisher(
            record_rx,
            publisher,
            state_for_publisher,
            cancel_for_publisher.clone(),
        )
        .await;
        if result.is_err() {
            cancel_for_publisher.cancel();
        }
        result
    });

    let http_addr = config.server.http_addr;
    let axum_app = Router::new()
        .route("/health", get(health_handler))
        .with_state(state);
    let axum_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();

    tokio::select! {
        result = axum::serve(axum_listener, axum_app).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }
    cancel.cancel();

    let _ = reassembler_handle.await;
    publisher_handle.await??;

    info!("tofcast-gateway shut down complete");
    Ok(())
}

async fn health_handler(State(state): State<GatewayState>) -> Json<HealthSnapshot> {
    Json(state.snapshot().await)
}
