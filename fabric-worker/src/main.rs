//! Worker process entrypoint: configuration, telemetry, liveness, the
//! scheduler and its platform jobs, and graceful shutdown.

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use fabric_common::broker::{Broker, MemoryBroker};
use fabric_common::locks::MemoryLockService;
use fabric_common::metrics::{attach_ops_metrics, serve};
use fabric_delivery::adapters::WebhookAdapter;
use fabric_delivery::dispatcher::NotificationDispatcher;
use fabric_delivery::publish::PublishSaga;
use fabric_worker::config::Config;
use fabric_worker::registry::{HttpPublishAdapter, PlatformJobs};
use fabric_worker::scheduler::{JobScheduler, SchedulerOptions};
use health::{HealthRegistry, HeartbeatFile};

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("invalid configuration: {error}");
            return 1;
        }
    };

    init_tracing(&config);
    install_panic_hook();

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker", time::Duration::seconds(60));
    let heartbeat = HeartbeatFile::new(&config.heartbeat_path).spawn();

    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::default());
    let scheduler = JobScheduler::with_options(
        broker.clone(),
        SchedulerOptions {
            poll_interval: config.poll_interval.0,
            ..Default::default()
        },
    );
    scheduler.set_liveness(worker_liveness);

    let (saga, dispatcher) = match &config.database_url {
        Some(url) => match PgPoolOptions::new().max_connections(10).connect_lazy(url) {
            Ok(pool) => {
                let dispatcher = Arc::new(
                    NotificationDispatcher::new(pool.clone())
                        .with_adapter(Arc::new(WebhookAdapter::new(config.request_timeout.0))),
                );
                let saga = config.publish_endpoint.clone().map(|endpoint| {
                    Arc::new(PublishSaga::new(
                        pool.clone(),
                        Arc::new(MemoryLockService::new()),
                        Arc::new(HttpPublishAdapter::new(endpoint, config.request_timeout.0)),
                    ))
                });
                (saga, Some(dispatcher))
            }
            Err(error) => {
                eprintln!("invalid DATABASE_URL: {error}");
                return 1;
            }
        },
        None => {
            info!("no DATABASE_URL configured; delivery jobs are disabled");
            (None, None)
        }
    };

    let jobs = PlatformJobs {
        broker,
        export_base_dir: config.export_base_dir.clone().into(),
        enable_feedback_ingest: config.enable_feedback_ingest,
        saga,
        dispatcher,
    };
    if let Err(error) = jobs.register(&scheduler) {
        error!(%error, "failed to register platform jobs");
        return 1;
    }
    if let Err(error) = scheduler.start_workers(config.worker_concurrency) {
        error!(%error, "failed to start workers");
        return 1;
    }
    info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = %config.environment,
        concurrency = config.worker_concurrency,
        "fabric worker started"
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", {
            let liveness = liveness.clone();
            get(move || ready(liveness.get_status()))
        });
    let router = attach_ops_metrics(router);
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!(%error, "failed to serve ops routes");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");
    heartbeat.abort();

    match scheduler.stop().await {
        Ok(()) => {
            info!("clean shutdown");
            0
        }
        Err(error) => {
            error!(%error, "shutdown did not complete cleanly");
            1
        }
    }
}

pub async fn index() -> &'static str {
    "fabric worker"
}

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };
}

fn init_tracer(
    sink_url: &str,
    sampling_rate: f64,
    service_name: &str,
) -> Result<Tracer, opentelemetry::trace::TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
}

/// Stdout logging always; OTLP export only when configured, and its
/// failure must not prevent startup.
fn init_tracing(config: &Config) {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );

    let otel_layer = config
        .otel_url
        .as_deref()
        .and_then(|url| {
            match init_tracer(url, config.sampling_rate(), &config.service_name) {
                Ok(tracer) => Some(OpenTelemetryLayer::new(tracer)),
                Err(error) => {
                    eprintln!("failed to initialize OTLP tracing, continuing without: {error}");
                    None
                }
            }
        })
        .map(|layer| layer.with_filter(LevelFilter::INFO));

    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();
}

/// Uncaught panics take the graceful path the same way signals do, with a
/// one-second floor before the process is forced down with exit code 1.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_secs(1));
            std::process::exit(1);
        });
    }));
}
