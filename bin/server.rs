// FuelEU Compliance Core - Web Server
// REST API with Axum over the shared compliance service

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fueleu_compliance::api::build_router;
use fueleu_compliance::{load_csv, ComplianceConfig, ComplianceService};

#[derive(Debug, Parser)]
#[command(name = "fueleu-server", version, about = "FuelEU compliance REST server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000", env = "FUELEU_LISTEN")]
    listen: String,

    /// SQLite database file
    #[arg(long, default_value = "fueleu.db", env = "FUELEU_DB")]
    db: PathBuf,

    /// JSON compliance configuration
    #[arg(long, env = "FUELEU_CONFIG")]
    config: Option<PathBuf>,

    /// Import this CSV before serving (duplicates are skipped)
    #[arg(long, env = "FUELEU_SEED")]
    seed: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fueleu_compliance=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();

    println!("🌐 FuelEU Compliance - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = match &args.config {
        Some(path) => ComplianceConfig::load_from_file(path)?,
        None => ComplianceConfig::default(),
    };

    let service = ComplianceService::open(&args.db, config)
        .with_context(|| format!("Failed to open database at {:?}", args.db))?;
    println!("✓ Database opened: {:?}", args.db);

    if let Some(seed) = &args.seed {
        let routes = load_csv(seed)?;
        let inserted = service.import_routes(&routes)?;
        println!("✓ Seeded {} of {} routes from {:?}", inserted, routes.len(), seed);
    }

    let app = build_router(service);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", args.listen))?;

    info!(address = %args.listen, "server listening");
    println!("\n🚀 Server running on http://{}", args.listen);
    println!("   Routes:     /routes, /routes/comparison");
    println!("   Compliance: /compliance/cb, /compliance/adjusted-cb");
    println!("   Banking:    /compliance/banking/{{bank,apply,borrow,records}}");
    println!("   Pools:      /pools");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    Ok(())
}
