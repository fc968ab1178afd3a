// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use crate::detector_trait::{DetectorKind, DetectorParams, InputSize, create_detector};
use crate::http_api::{AppState, ServerSettings, cors_layer, router};
use crate::inference_engine_trait::InferenceEngineTrait;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about=None, rename_all = "snake_case")]
pub struct Args {
    /// Port to serve HTTP and websocket requests on, all interfaces.
    #[arg(long, default_value = "8000")]
    pub port: u16,

    /// Which detector to run: heuristic|model. The legacy values "wasm"
    /// and "server" are accepted as aliases.
    #[arg(long, env = "MODE", value_parser = parse_detector_kind,
          default_value = "heuristic")]
    pub mode: DetectorKind,

    /// Model file for the model detector.
    #[arg(long, env = "ONNX_MODEL")]
    pub model_path: Option<String>,

    /// Maximum frames per second processed by each streaming pipeline.
    /// Zero or negative means unthrottled.
    #[arg(long, default_value = "15.0")]
    pub max_rate_hz: f64,

    #[arg(long, default_value = "320")]
    pub input_width: u32,

    #[arg(long, default_value = "240")]
    pub input_height: u32,

    /// Model detector: minimum score for a detection to be reported.
    #[arg(long, default_value = "0.25")]
    pub score_threshold: f32,

    /// Model detector: maximum detections reported per frame.
    #[arg(long, default_value = "100")]
    pub max_detections: usize,

    /// Number of telemetry samples retained for summaries.
    #[arg(long, default_value = "10000")]
    pub telemetry_capacity: usize,

    /// Window size for per-pipeline inference latency stats.
    #[arg(long, default_value = "100")]
    pub stats_capacity: usize,

    /// Queue depth when pushing results to a streaming client.
    #[arg(long, default_value = "1")]
    pub listener_capacity: usize,

    /// Whether pipelines record their own telemetry samples.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub pipeline_telemetry: bool,

    /// Fixed seed for the heuristic detector's labels and scores.
    #[arg(long)]
    pub detector_seed: Option<u64>,

    /// Allowed CORS origins, comma separated. Any origin when unset.
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Directory of static client files to serve for unmatched paths.
    #[arg(long)]
    pub static_dir: Option<PathBuf>,

    #[arg(long, default_value = ".")]
    pub log_dir: String,

    #[arg(long, default_value = "lookout_log.txt")]
    pub log_file: String,
}

fn parse_detector_kind(arg: &str) -> Result<DetectorKind, String> {
    DetectorKind::parse(arg).ok_or_else(
        || format!("unknown mode {:?}; expected heuristic or model", arg))
}

impl Args {
    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams{
            input_size: InputSize{width: self.input_width,
                                  height: self.input_height},
            model_path: self.model_path.clone(),
            score_threshold: self.score_threshold,
            max_detections: self.max_detections,
            seed: self.detector_seed,
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings{
            max_rate_hz: self.max_rate_hz,
            telemetry_capacity: self.telemetry_capacity,
            stats_capacity: self.stats_capacity,
            listener_capacity: self.listener_capacity,
            pipeline_telemetry: self.pipeline_telemetry,
            ..ServerSettings::default()
        }
    }
}

// `get_engine` Is called to obtain the inference runtime backing the model
//     detector, if any. This function is called after logging has been set
//     up. Returning None leaves the model detector producing no detections.
pub fn server_main(
    product_name: &str,
    get_engine: fn(&Args) -> Option<Arc<dyn InferenceEngineTrait + Send + Sync>>) {
    let args = Args::parse();

    // Set up logging.
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Could not create log file in {}: {}", args.log_dir, e);
            std::process::exit(1);
        }
    };
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Got control-c");
        std::thread::sleep(Duration::from_millis(500));
        info!("Exiting");
        std::process::exit(-1);
    }) {
        error!("Could not install control-c handler: {}", e);
    }

    let engine = get_engine(&args);
    async_main(args, product_name, engine);
}

#[tokio::main]
async fn async_main(args: Args, product_name: &str,
                    engine: Option<Arc<dyn InferenceEngineTrait + Send + Sync>>) {
    if args.mode == DetectorKind::Model && engine.is_none() {
        info!("No inference engine provided; model detector will report no detections");
    }
    let detector = create_detector(args.mode, &args.detector_params(), engine);
    let state = AppState::new(args.mode, detector, args.server_settings());
    let app = router(state, cors_layer(&args.cors_origins), args.static_dir.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let server = match hyper::Server::try_bind(&addr) {
        Ok(builder) => builder,
        Err(e) => {
            error!("Could not bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("{} listening at {:?}, {} detector, max {} frames/sec per stream",
          product_name, addr, args.mode.as_str(), args.max_rate_hz);
    if let Err(e) = server.serve(app.into_make_service()).await {
        error!("Server error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["lookout-server"]).unwrap();
        assert_eq!(args.port, 8000);
        assert_eq!(args.max_rate_hz, 15.0);
        assert_eq!(args.listener_capacity, 1);
        assert!(args.pipeline_telemetry);
        let params = args.detector_params();
        assert_eq!(params.input_size, InputSize{width: 320, height: 240});
        assert_eq!(params.score_threshold, 0.25);
        assert_eq!(params.max_detections, 100);
    }

    #[test]
    fn test_args_legacy_mode_and_origins() {
        let args = Args::try_parse_from(
            ["lookout-server", "--mode", "server",
             "--cors_origins", "http://a.example,http://b.example",
             "--pipeline_telemetry", "false"]).unwrap();
        assert_eq!(args.mode, DetectorKind::Model);
        assert_eq!(args.cors_origins.len(), 2);
        assert!(!args.server_settings().pipeline_telemetry);
    }

    #[test]
    fn test_args_rejects_unknown_mode() {
        assert!(Args::try_parse_from(["lookout-server", "--mode", "gpu"]).is_err());
    }

}  // mod tests.
