// gpsd Position Source
//
// Talks to a local gpsd daemon over its JSON watch protocol and turns TPV
// (time-position-velocity) reports into position samples.

use crate::adapter::{PositionSample, PositionSource, PositionStream, SamplingOptions, SensorError};
use async_trait::async_trait;
use geopresence_core::{now_millis, Coordinate};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// Fixes with a larger horizontal error are skipped in high-accuracy mode (meters)
pub const HIGH_ACCURACY_MAX_EPH_M: f64 = 50.0;

/// gpsd adapter configuration
#[derive(Debug, Clone)]
pub struct GpsdSource {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    time: Option<String>,
    eph: Option<f64>,
}

impl GpsdSource {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse one line of gpsd output.
    ///
    /// Returns `None` for anything that is not a usable 2D/3D fix.
    pub fn parse_report(line: &str, options: &SamplingOptions) -> Option<PositionSample> {
        let report: GpsdReport = match serde_json::from_str(line) {
            Ok(report) => report,
            Err(e) => {
                tracing::debug!("Ignoring unparseable gpsd line: {}", e);
                return None;
            }
        };

        if report.class != "TPV" || report.mode < 2 {
            return None;
        }
        if options.high_accuracy
            && report.eph.is_some_and(|eph| eph > HIGH_ACCURACY_MAX_EPH_M)
        {
            tracing::debug!("Skipping low-accuracy fix (eph={:?})", report.eph);
            return None;
        }

        let coordinate = Coordinate::new(report.lat?, report.lon?).ok()?;
        let captured_at = report
            .time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(now_millis);

        Some(PositionSample {
            coordinate,
            captured_at,
        })
    }
}

#[async_trait]
impl PositionSource for GpsdSource {
    fn source_name(&self) -> &str {
        "gpsd"
    }

    async fn subscribe(&self, options: &SamplingOptions) -> Result<PositionStream, SensorError> {
        let addr = self.addr();
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| SensorError::Unavailable(format!("gpsd at {}: {}", addr, e)))?;
        stream
            .write_all(WATCH_COMMAND)
            .await
            .map_err(|e| SensorError::Unavailable(format!("gpsd watch failed: {}", e)))?;

        tracing::info!("Subscribed to gpsd at {}", addr);

        let options = *options;
        let mut lines = BufReader::new(stream).lines();

        let samples = async_stream::stream! {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(sample) = GpsdSource::parse_report(&line, &options) {
                            yield Ok::<_, SensorError>(sample);
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("gpsd closed the connection");
                        yield Err(SensorError::Unavailable("gpsd closed the connection".to_string()));
                        break;
                    }
                    Err(e) => {
                        tracing::error!("gpsd read error: {}", e);
                        yield Err(SensorError::Unavailable(e.to_string()));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(samples))
    }
}
