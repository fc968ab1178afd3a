pub mod detection;
pub mod detector_trait;
pub mod frame_source;
pub mod heuristic_detector;
pub mod http_api;
pub mod inference_engine_trait;
pub mod latest_slot;
pub mod lookout_server;
pub mod model_detector;
pub mod pipeline;
pub mod pipeline_registry;
pub mod rate_limiter;
pub mod relay;
pub mod telemetry;
pub mod value_stats;
