use anyhow::Result;
use clap::Parser;
use meterflow_billing::config::BillingConfig;
use meterflow_billing::engine::{
    InvoiceNumberer, InvoicingEngine, NullTaxCalculator, RatingEngine,
};
use meterflow_billing::scheduler::Scheduler;
use meterflow_billing::storage::{
    PgConnection, SqlCycleRepository, SqlInvoiceRepository, SqlLedgerRepository,
    SqlRatingRepository, SqlSubscriptionRepository, SqlUsageRepository,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "meterflow-billing")]
#[command(about = "Meterflow Billing Engine - cycle lifecycle, rating and invoicing")]
struct Args {
    #[arg(short, long, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Generate sample configuration file")]
    gen_config: bool,

    #[arg(long, help = "Dry run mode (validate config without starting)")]
    dry_run: bool,

    #[arg(long, help = "Run a single scheduler tick and exit")]
    run_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meterflow_billing=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.gen_config {
        let config = BillingConfig::default();
        let toml = toml::to_string_pretty(&config)?;
        println!("{}", toml);
        return Ok(());
    }

    let config = BillingConfig::load(args.config)?;

    info!("Starting Meterflow Billing Engine");
    info!("Environment: {}", config.service.environment);
    info!("Service ID: {}", config.service.service_id);

    if args.dry_run {
        info!("Configuration validated successfully (dry-run mode)");
        return Ok(());
    }

    let connection = Arc::new(PgConnection::connect(&config.database).await?);

    info!("Running database migrations");
    connection.run_migrations().await?;

    let cycles = Arc::new(SqlCycleRepository::new(connection.clone()));
    let subscriptions = Arc::new(SqlSubscriptionRepository::new(connection.clone()));
    let usage = Arc::new(SqlUsageRepository::new(connection.clone()));
    let rating_store = Arc::new(SqlRatingRepository::new(connection.clone()));
    let invoices = Arc::new(SqlInvoiceRepository::new(connection.clone()));
    let ledger = Arc::new(SqlLedgerRepository::new(connection.clone()));

    let rating = Arc::new(RatingEngine::new(
        cycles.clone(),
        subscriptions.clone(),
        usage,
        rating_store.clone(),
    ));
    let numberer = InvoiceNumberer::new(invoices.clone(), &config.invoicing.number_template);
    let invoicing = Arc::new(InvoicingEngine::new(
        cycles.clone(),
        subscriptions.clone(),
        rating_store,
        invoices,
        ledger,
        Arc::new(NullTaxCalculator),
        numberer,
        config.invoicing.finalize_immediately,
    ));

    let scheduler = Scheduler::new(
        cycles,
        subscriptions,
        rating,
        invoicing,
        config.scheduler.clone(),
    );

    if args.run_once {
        let report = scheduler.run_once().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    scheduler.start().await?;
    info!(
        "Scheduler running every {} seconds",
        config.scheduler.tick_interval_seconds
    );

    shutdown_signal().await;

    info!("Shutdown signal received, stopping after current tick");
    scheduler.stop().await;

    info!("Meterflow Billing Engine stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
