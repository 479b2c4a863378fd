pub mod config;
pub mod error;
pub mod geo;
pub mod identity;

// Re-export commonly used types
pub use config::{
    Config, ConfigLoader, ConfigValidator, ConnectionConfig, PresenceConfig, RelayConfig,
    SamplingConfig, SourceConfig, SourceKind,
};
pub use error::{DomainError, GeoPresenceError, InfraError};
pub use geo::{distance_km, distance_meters, Coordinate};
pub use identity::{now_millis, Identity};
