use anyhow::{Context, Result};
use clap::Parser;
use lotero_agent::{
    chain::format_address,
    config::{Args, Config},
    evm::EvmChain,
    notify,
    treasury::{ensure_allowance, spawn_scheduler},
    Agent, Api, Chain, FacilitatorGate,
};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "lotero-agent".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("lotero-agent");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let args = Args::parse();
    let config = Config::load(args, |key| std::env::var(key).ok()).context("invalid configuration")?;

    let chain = EvmChain::connect(&config.evm).context("failed to connect to chain")?;
    let chain: Arc<dyn Chain> = Arc::new(chain);
    info!(
        executor = %format_address(chain.executor()),
        slot_machine = %format_address(chain.slot_machine()),
        network = %config.settings.network,
        "chain connected"
    );
    ensure_allowance(chain.as_ref())
        .await
        .context("failed to approve stable allowance")?;

    let notifier = notify::from_config(config.telegram.as_ref());
    let agent = Arc::new(Agent::new(chain, notifier, config.settings.clone()));

    if let Some(period) = config.reconcile_interval {
        spawn_scheduler(agent.clone(), period);
    }

    let gate = Arc::new(
        FacilitatorGate::new(&config.payment).context("failed to build facilitator client")?,
    );
    let api = Api::new(agent, gate, config.payment.clone(), config.rate_limits);
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(address = %config.bind, "serving");
    axum::serve(
        listener,
        api.router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server failed")?;
    Ok(())
}
