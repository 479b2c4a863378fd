mod cli;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands};
use geopresence_client::{PresenceController, PresenceSettings, PresenceView, WebSocketTransport};
use geopresence_core::{distance_meters, Config, ConfigValidator, Coordinate, SourceKind};
use geopresence_relay::RelayServer;

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("geopresence=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => handle_init(),
        Commands::ConfigSample { output } => {
            let path = output.unwrap_or_else(|| std::path::PathBuf::from("./geopresence.sample.yaml"));
            Config::sample().save(&path)?;
            println!("Sample configuration written to {}", path.display());
            Ok(())
        }
        Commands::Distance { from, to } => {
            let from = parse_coordinate(&from)?;
            let to = parse_coordinate(&to)?;
            println!("{:.1}", distance_meters(from, to));
            Ok(())
        }
        Commands::Relay { host, port } => {
            let mut config = Config::load(&cli.config_path)?;
            if let Some(host) = host {
                config.relay.host = host;
            }
            if let Some(port) = port {
                config.relay.port = port;
            }
            let server = RelayServer::bind(&format!("{}:{}", config.relay.host, config.relay.port)).await?;
            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Relay stopped");
                    Ok(())
                }
            }
        }
        Commands::Track {
            endpoint,
            room,
            fixed,
            gpsd_host,
            gpsd_port,
            json,
        } => {
            let mut config = Config::load(&cli.config_path)?;
            if let Some(endpoint) = endpoint {
                config.connection.endpoint = endpoint;
            }
            if let Some(room) = room {
                config.connection.room = room;
            }
            if let Some(fixed) = fixed {
                let point = parse_coordinate(&fixed)?;
                config.source.kind = SourceKind::Fixed;
                config.source.fixed_lat = Some(point.latitude());
                config.source.fixed_lon = Some(point.longitude());
            }
            if let Some(host) = gpsd_host {
                config.source.gpsd_host = host;
            }
            if let Some(port) = gpsd_port {
                config.source.gpsd_port = port;
            }
            ConfigValidator::validate(&config)?;
            run_track(config, json).await
        }
    }
}

async fn run_track(config: Config, json: bool) -> Result<()> {
    let source = geopresence_sensor::source_from_config(&config.source)
        .context("failed to set up position source")?;
    let (controller, handle) =
        PresenceController::new(PresenceSettings::from(&config), WebSocketTransport::new(), source);

    info!("Tracking as {} in room {}", controller.identity(), config.connection.room);
    let task = controller.spawn();

    handle.start_sharing()?;
    handle.connect(config.connection.endpoint.clone(), config.connection.room.clone())?;

    let mut view = handle.view();
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                if json {
                    println!("{}", serde_json::to_string(&current)?);
                } else {
                    print_view(&current);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                handle.shutdown().await?;
                break;
            }
        }
    }

    task.await.context("presence task failed")?;
    Ok(())
}

fn print_view(view: &PresenceView) {
    let position = view
        .self_location
        .map(|loc| loc.coordinate.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let room = view.room.as_deref().unwrap_or("-");
    let close = view.close_peers().count();

    println!(
        "[{}] room {} | you at {} | {} peer(s), {} close",
        view.status,
        room,
        position,
        view.peers.len(),
        close
    );
    if let Some(error) = &view.error {
        println!("  error: {}", error);
    }
    for peer in view.close_peers() {
        let seen = chrono::DateTime::from_timestamp_millis(peer.last_seen)
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "  {}  {:.0} m  {}  (seen {})",
            peer.id,
            peer.distance_meters.unwrap_or_default(),
            peer.coordinate,
            seen
        );
    }
}

fn parse_coordinate(text: &str) -> Result<Coordinate> {
    let (lat, lon) = text
        .split_once(',')
        .ok_or_else(|| anyhow!("expected \"lat,lon\", got '{}'", text))?;
    let lat: f64 = lat.trim().parse().with_context(|| format!("bad latitude '{}'", lat))?;
    let lon: f64 = lon.trim().parse().with_context(|| format!("bad longitude '{}'", lon))?;
    Ok(Coordinate::new(lat, lon)?)
}

fn handle_init() -> Result<()> {
    use std::io::{self, Write};

    let config_path = Config::default_path();

    if config_path.exists() {
        print!("Configuration already exists at {}. Overwrite? [y/N] ", config_path.display());
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled");
            return Ok(());
        }
    }

    let mut config = Config::default();

    print!("Room name [{}]: ", config.connection.room);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    if !input.trim().is_empty() {
        config.connection.room = input.trim().to_string();
    }

    print!("Relay endpoint [{}]: ", config.connection.endpoint);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    if !input.trim().is_empty() {
        config.connection.endpoint = input.trim().to_string();
    }

    ConfigValidator::validate(&config)?;
    config.save(&config_path)?;
    println!("Configuration saved to {}", config_path.display());
    Ok(())
}
