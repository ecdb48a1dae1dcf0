pub mod alerts;
pub mod anomaly;
pub mod assembler;
pub mod config;
pub mod cursor;
pub mod error;
pub mod extractor;
pub mod graph;
pub mod identity;
pub mod model;
pub mod pager;
pub mod sampler;
pub mod services;

pub use assembler::{ServiceMapPage, ServiceMapRequest, ServiceMapService, transform_service_map};
pub use config::Config;
pub use cursor::TraceSampleCursor;
pub use error::{Result, ServiceMapError};
pub use graph::ServiceMapGraph;
pub use pager::{MAX_REQUESTS, collect_service_map};
