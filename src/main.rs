use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

// Use library instead of local modules
use fueleu_compliance::{load_csv, ComplianceConfig, ComplianceService, RouteFilter};

#[derive(Debug, Parser)]
#[command(name = "fueleu", version, about = "FuelEU compliance ledger CLI")]
struct Cli {
    /// SQLite database file
    #[arg(long, default_value = "fueleu.db", env = "FUELEU_DB")]
    db: PathBuf,

    /// JSON compliance configuration (targets, borrowing policy)
    #[arg(long, env = "FUELEU_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Import already-computed route records from CSV
    Import { csv: PathBuf },
    /// List routes
    Routes {
        #[arg(long)]
        year: Option<i32>,
    },
    /// Mark a route (numeric id) as the comparison baseline
    Baseline { id: i64 },
    /// Compare every route against the baseline
    Compare,
    /// Compliance balance for a ship-year
    Cb { ship_id: String, year: i32 },
    /// Bank surplus for a ship-year
    Bank { ship_id: String, year: i32, amount: f64 },
    /// Apply banked surplus to a ship-year
    Apply { ship_id: String, year: i32, amount: f64 },
    /// Borrow credit into a deficit ship-year (when enabled in config)
    Borrow { ship_id: String, year: i32, amount: f64 },
    /// Create a pool from two or more ships
    Pool {
        year: i32,
        #[arg(required = true, num_args = 2..)]
        ships: Vec<String>,
    },
    /// List pools
    Pools {
        #[arg(long)]
        year: Option<i32>,
    },
}

fn load_config(path: Option<&Path>) -> Result<ComplianceConfig> {
    match path {
        Some(path) => ComplianceConfig::load_from_file(path),
        None => Ok(ComplianceConfig::default()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let service = ComplianceService::open(&cli.db, config)?;

    match cli.command {
        Command::Import { csv } => run_import(&service, &csv)?,
        Command::Routes { year } => {
            let routes = service.list_routes(&RouteFilter {
                year,
                ..RouteFilter::default()
            })?;
            println!("{:<5} {:<8} {:<12} {:<6} {:>6} {:>10} {:>10}", "ID", "ROUTE", "VESSEL", "FUEL", "YEAR", "GHG", "FUEL(t)");
            for r in routes {
                println!(
                    "{:<5} {:<8} {:<12} {:<6} {:>6} {:>10.2} {:>10.1}{}",
                    r.id, r.route_id, r.vessel_type, r.fuel_type, r.year, r.ghg_intensity, r.fuel_consumption,
                    if r.is_baseline { "  ⭐ baseline" } else { "" }
                );
            }
        }
        Command::Baseline { id } => {
            let route = service.set_baseline(id)?;
            println!("⭐ Baseline set: {} ({}, {})", route.route_id, route.vessel_type, route.year);
        }
        Command::Compare => {
            let report = service.comparison()?;
            println!("Baseline: {}", report.baseline);
            for c in report.comparisons {
                println!(
                    "   {:<8} {:>10.4} vs {:>10.4}  {:>+8.2}%  {}",
                    c.route_id, c.comparison_intensity, c.baseline_intensity, c.percent_diff,
                    if c.compliant { "✅" } else { "❌" }
                );
            }
        }
        Command::Cb { ship_id, year } => {
            let adjusted = service.adjusted_cb(&ship_id, year)?;
            println!("🚢 {} ({})", ship_id, year);
            println!("   CB:          {:>18.2} gCO2e", adjusted.cb_gco2eq);
            println!("   Banked:      {:>18.2} gCO2e", adjusted.banked);
            println!("   Applied:     {:>18.2} gCO2e", adjusted.applied);
            println!("   Borrowed:    {:>18.2} gCO2e", adjusted.borrowed);
            println!("   Repayment:   {:>18.2} gCO2e", adjusted.repayment_due);
            println!("   Pooled:      {:>18.2} gCO2e", adjusted.pooled);
            println!("   Adjusted CB: {:>18.2} gCO2e", adjusted.adjusted_cb_gco2eq);
        }
        Command::Bank { ship_id, year, amount } => {
            let outcome = service.bank_surplus(&ship_id, year, amount)?;
            println!("✓ Banked {:.2} for {} ({}); balance {:.2}", amount, ship_id, year, outcome.banked_balance);
        }
        Command::Apply { ship_id, year, amount } => {
            let outcome = service.apply_banked(&ship_id, year, amount)?;
            println!("✓ Applied {:.2} to {} ({}); balance {:.2}", amount, ship_id, year, outcome.banked_balance);
        }
        Command::Borrow { ship_id, year, amount } => {
            service.borrow_forward(&ship_id, year, amount)?;
            println!("✓ Borrowed {:.2} into {} ({})", amount, ship_id, year);
        }
        Command::Pool { year, ships } => {
            let pool = service.create_pool(year, &ships)?;
            println!("✓ Pool {} ({}) total {:.2}", pool.pool_id, pool.year, pool.total_cb);
            for m in &pool.members {
                println!("   {:<8} {:>18.2} → {:>18.2}", m.ship_id, m.cb_before, m.cb_after);
            }
        }
        Command::Pools { year } => {
            for pool in service.list_pools(year)? {
                println!("{}  {}  total {:.2}  members {}", pool.pool_id, pool.year, pool.total_cb, pool.members.len());
            }
        }
    }

    Ok(())
}

fn run_import(service: &ComplianceService, csv_path: &Path) -> Result<()> {
    println!("🗄️  Route Import - CSV → SQLite + WAL");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\n📂 Loading CSV...");
    let routes = load_csv(csv_path)?;
    println!("✓ Loaded {} routes from CSV", routes.len());

    println!("\n💾 Inserting routes...");
    let inserted = service.import_routes(&routes)?;

    println!("✓ Inserted: {} routes", inserted);
    println!("✓ Skipped duplicates: {}", routes.len() - inserted);

    Ok(())
}
