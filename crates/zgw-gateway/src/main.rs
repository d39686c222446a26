//! Zonal gateway DoIP server
//!
//! Accepts one tester connection at a time on the DoIP port and serves it
//! with the zgw-doip engine. Further testers wait in the listen backlog
//! until the current connection ends.
//!
//! # Usage
//!
//! ```bash
//! ./zgw-gateway --config config/zgw-gateway.toml
//! RUST_LOG=zgw_doip=debug ./zgw-gateway --bind 127.0.0.1:13400 --log-format json
//! ```

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zgw_doip::sw_package::ecu_name;
use zgw_doip::{EngineConfig, EngineEvent, ProtocolEngine};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "zgw-gateway")]
#[command(about = "Zonal gateway DoIP/UDS server")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:13400")]
    bind: SocketAddr,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Enable debug logging (ignored when RUST_LOG is set)
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(args: &Args) {
    let default = if args.verbose {
        "zgw_gateway=debug,zgw_doip=debug"
    } else {
        "zgw_gateway=info,zgw_doip=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());

    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = match &args.config {
        Some(path) => {
            info!("Loading config from: {}", path);
            EngineConfig::load(path).with_context(|| format!("Failed to load config {}", path))?
        }
        None => EngineConfig::default(),
    };

    info!(
        bind = %args.bind,
        logical_address = format!("0x{:04X}", config.local_logical_address),
        ecu = ecu_name(config.ecu_id),
        max_block_length = config.transfer.max_block_length,
        "Starting zonal gateway"
    );

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => break,
        };
        stream.set_nodelay(true)?;
        info!(%peer, "Tester connected");

        let engine = ProtocolEngine::new(config.clone()).context("Invalid engine config")?;
        let (handle, mut events) = zgw_doip::spawn(stream, engine);
        let interrupted = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => log_event(&event),
                    None => break false,
                },
                _ = tokio::signal::ctrl_c() => break true,
            }
        };

        let result = if interrupted {
            handle.shutdown().await
        } else {
            handle.join().await
        };
        match result {
            Ok(()) => info!(%peer, "Tester disconnected"),
            Err(e) => warn!(%peer, error = %e, "Connection ended with error"),
        }
        if interrupted {
            break;
        }
    }

    info!("Shutting down");
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::RoutingActivated { tester_address, .. } => {
            info!(tester = format!("0x{:04X}", tester_address), "Routing active");
        }
        EngineEvent::RoutingExpired { tester_address } => {
            warn!(tester = ?tester_address, "Routing expired");
        }
        EngineEvent::RoutingDeactivated => info!("Routing deactivated"),
        EngineEvent::AliveCheckResponse { .. } => {}
        EngineEvent::VciReport(report) => {
            for record in &report.records {
                info!(
                    ecu = %record.ecu_id,
                    sw = %record.sw_version,
                    hw = %record.hw_version,
                    serial = %record.serial,
                    "VCI"
                );
            }
        }
        EngineEvent::HealthReport(report) => {
            for record in &report.records {
                info!(
                    ecu = %record.ecu_id,
                    status = ?record.status,
                    dtc_count = record.dtc_count,
                    battery_mv = record.battery_mv,
                    temperature_c = record.temperature_celsius(),
                    "Health"
                );
            }
        }
        EngineEvent::ReadinessReport(report) => {
            for record in &report.records {
                info!(
                    ecu = %record.ecu_id,
                    ready = record.ready_for_update,
                    battery_mv = record.battery_mv,
                    memory_kb = record.available_memory_kb,
                    "Readiness"
                );
            }
        }
        EngineEvent::UdsResponse {
            source_address,
            message,
        } => {
            info!(
                source = format!("0x{:04X}", source_address),
                service_id = format!("0x{:02X}", message.service_id),
                "UDS response"
            );
        }
        EngineEvent::RoutineStarted { routine_id } => {
            info!(routine_id = format!("0x{:04X}", routine_id), "Routine started");
        }
        EngineEvent::TransferStarted { address, size } => {
            info!(address = format!("0x{:08X}", address), size, "Download started");
        }
        EngineEvent::TransferCompleted {
            address,
            data,
            package,
        } => match package {
            Some(pkg) => info!(
                address = format!("0x{:08X}", address),
                size = data.len(),
                target = ecu_name(pkg.header.target_ecu_id),
                version = %pkg.header.version,
                disposition = ?pkg.disposition,
                staging = format!("0x{:08X}", pkg.staging.start),
                "Download complete"
            ),
            None => info!(
                address = format!("0x{:08X}", address),
                size = data.len(),
                "Download complete (unverified)"
            ),
        },
        EngineEvent::TransferFailed { nrc, reason } => {
            warn!(nrc = %nrc, %reason, "Download failed");
        }
    }
}
