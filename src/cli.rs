use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "geopresence", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room and follow nearby participants
    Track {
        /// Relay endpoint (ws:// or wss://)
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Room to join
        #[arg(short, long)]
        room: Option<String>,

        /// Report a fixed position instead of reading gpsd, as "lat,lon"
        #[arg(long, value_name = "LAT,LON", allow_hyphen_values = true)]
        fixed: Option<String>,

        /// gpsd host
        #[arg(long)]
        gpsd_host: Option<String>,

        /// gpsd port
        #[arg(long)]
        gpsd_port: Option<u16>,

        /// Print every view as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Run the development relay
    Relay {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Great-circle distance in meters between two "lat,lon" points
    Distance {
        #[arg(allow_hyphen_values = true)]
        from: String,
        #[arg(allow_hyphen_values = true)]
        to: String,
    },

    /// Initialize configuration
    Init,

    /// Generate sample configuration
    ConfigSample {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_track_overrides() {
        let cli = Cli::parse_from([
            "geopresence",
            "-c",
            "/tmp/g.yaml",
            "track",
            "--room",
            "r",
            "--fixed",
            "-33.86,151.2",
            "--json",
        ]);
        assert_eq!(cli.config_path.as_deref(), Some("/tmp/g.yaml"));
        match cli.command {
            Commands::Track {
                room, fixed, json, ..
            } => {
                assert_eq!(room.as_deref(), Some("r"));
                assert_eq!(fixed.as_deref(), Some("-33.86,151.2"));
                assert!(json);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_distance() {
        let cli = Cli::parse_from(["geopresence", "distance", "0,0", "-1,0.5"]);
        assert!(matches!(cli.command, Commands::Distance { .. }));
    }
}
