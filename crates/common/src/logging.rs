use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use tracing::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

pub struct LoggerConfig {
    whoami: String,
    otlp_url: Option<String>,
}

impl LoggerConfig {
    pub fn with_base_name(whoami: impl Into<String>) -> Self {
        Self {
            whoami: whoami.into(),
            otlp_url: None,
        }
    }

    pub fn set_otlp_url(&mut self, url: String) {
        self.otlp_url = Some(url);
    }
}

/// Reads the OTLP collector URL from the environment, if set.
pub fn get_otlp_url_from_env() -> Option<String> {
    std::env::var("CONCLAVE_OTLP_URL").ok()
}

/// Initializes the logging subsystem with the provided config.
pub fn init(config: LoggerConfig) {
    let filt = tracing_subscriber::EnvFilter::from_default_env();
    let stdout_sub = tracing_subscriber::fmt::layer().compact().with_filter(filt);

    if let Some(otlp_url) = &config.otlp_url {
        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(otlp_url);

        let tp = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .install_batch(opentelemetry_sdk::runtime::TokioCurrentThread)
            .expect("init: opentelemetry");

        let tracer = tp.tracer("conclave-log");
        let otel_sub = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(stdout_sub)
            .with(otel_sub)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_sub).init();
    }

    info!(whoami = %config.whoami, "logging started");
}

/// Flushes and tears down logging resources on shutdown.
pub fn finalize() {
    info!("shutting down logging");
}
