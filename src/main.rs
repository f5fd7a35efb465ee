//! Companiond - Entry Point
//!
//! Long-running daemon: heartbeat scheduler plus nightly consolidator,
//! sharing one context. SIGINT drains in-flight cycles before exit.

use companiond::sensors::builtin::{
    ActivityPatternSensor, RecentConversationSensor, TimeContextSensor,
    ACTIVITY_PATTERN_MANIFEST, RECENT_CONVERSATION_MANIFEST, TIME_CONTEXT_MANIFEST,
};
use companiond::sensors::registry::SensorPlugin;
use companiond::{
    Config, Consolidator, Context, Heartbeat, HttpReasoning, NullTransport, Reasoning,
    SensorRegistry, Store, TelegramTransport, Transport, UnconfiguredReasoning,
};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Companiond v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let store = Store::open(&config.db_path)?;

    // Shared handle for sensors that read the store directly
    let sensor_store = Arc::new(std::sync::Mutex::new(Store::open(&config.db_path)?));
    let tz = config.tz();
    let plugins = vec![
        SensorPlugin::new(TIME_CONTEXT_MANIFEST, Arc::new(TimeContextSensor::new(tz))),
        SensorPlugin::new(
            ACTIVITY_PATTERN_MANIFEST,
            Arc::new(ActivityPatternSensor::new(
                Arc::clone(&sensor_store),
                config.owner_id,
                tz,
            )),
        ),
        SensorPlugin::new(
            RECENT_CONVERSATION_MANIFEST,
            Arc::new(RecentConversationSensor::new(
                Arc::clone(&sensor_store),
                config.owner_id,
            )),
        ),
    ];
    let registry = SensorRegistry::discover(plugins, &config.present_keys);
    let report = registry.report();
    info!(
        "Sensors: {} registered, {} skipped, {} disabled for missing config",
        report.registered.len(),
        report.skipped.len(),
        report.force_disabled.len()
    );
    for (name, reason) in &report.skipped {
        warn!("Sensor '{}' skipped: {}", name, reason);
    }

    let reasoning: Arc<dyn Reasoning> = match config.reasoning_url.as_deref() {
        Some(url) => Arc::new(HttpReasoning::new(
            url,
            config.reasoning_api_key.as_deref(),
            &config.reasoning_model,
            config.reasoning_timeout,
        )),
        None => {
            warn!("REASONING_BASE_URL not set; running in observe-only mode");
            Arc::new(UnconfiguredReasoning)
        }
    };

    let transport: Arc<dyn Transport> = match config.telegram_token.as_deref() {
        Some(token) => Arc::new(TelegramTransport::new(token, config.owner_id)),
        None => {
            warn!("TELEGRAM_BOT_TOKEN not set; notifications go to the log only");
            Arc::new(NullTransport)
        }
    };

    let ctx = Context::new(config, store, registry)?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let heartbeat = Heartbeat::new(Arc::clone(&ctx), Arc::clone(&reasoning), transport);
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx.clone()));

    let consolidator = Consolidator::new(Arc::clone(&ctx), reasoning);
    let stats = consolidator.stats();
    let consolidator_task = tokio::spawn(consolidator.run_continuous(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining in-flight work");
    shutdown_tx.send(true)?;

    heartbeat_task.await?;
    consolidator_task.await?;

    info!("Companiond stopped ({})", stats.summary());
    Ok(())
}
