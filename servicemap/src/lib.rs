#[path = "handlers.rs"]
pub mod handlers;

pub use handlers::{
    format_summary, parse_filter, parse_time, render_json, resolve_time_range,
};

pub use servicemap_core::{
    Config, ServiceMapGraph, ServiceMapRequest, ServiceMapService, collect_service_map,
};
