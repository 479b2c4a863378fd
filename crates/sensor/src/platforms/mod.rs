pub mod gpsd;
pub mod scripted;

use crate::adapter::{PositionSource, SensorError};
use geopresence_core::{Coordinate, SourceConfig, SourceKind};
use std::sync::Arc;
use std::time::Duration;

/// Build the position source selected in the configuration
pub fn from_config(config: &SourceConfig) -> Result<Arc<dyn PositionSource>, SensorError> {
    match config.kind {
        SourceKind::Gpsd => Ok(Arc::new(gpsd::GpsdSource::new(
            config.gpsd_host.clone(),
            config.gpsd_port,
        ))),
        SourceKind::Fixed => {
            let (Some(lat), Some(lon)) = (config.fixed_lat, config.fixed_lon) else {
                return Err(SensorError::Unavailable(
                    "fixed source needs fixed_lat and fixed_lon".to_string(),
                ));
            };
            let point = Coordinate::new(lat, lon)
                .map_err(|e| SensorError::Unavailable(e.to_string()))?;
            Ok(Arc::new(scripted::ScriptedSource::fixed(
                point,
                Duration::from_millis(config.fixed_interval_ms),
            )))
        }
    }
}
