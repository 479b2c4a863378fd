// Position Sources
//
// This crate wraps device location backends behind one interface and turns
// their output into a restartable, filtered sample sequence.

pub mod adapter;
pub mod platforms;
pub mod sampler;

pub use adapter::{PositionSample, PositionSource, PositionStream, SamplingOptions, SensorError};
pub use platforms::from_config as source_from_config;
pub use platforms::gpsd::GpsdSource;
pub use platforms::scripted::ScriptedSource;
pub use sampler::{GeoSampler, Sampling};
