//! coopstock operator CLI.
//!
//! # Usage
//!
//! ```bash
//! # Apply the ledger schema
//! coopstock migrate
//!
//! # Replay every product of an outlet and report drift
//! coopstock reconcile --tenant <uuid> --outlet <uuid> --fail-on-drift
//!
//! # Show one product's stock level
//! coopstock stock --tenant <uuid> --outlet <uuid> --product <uuid>
//! ```
//!
//! # Environment Variables
//!
//! - `DATABASE_URL` - `PostgreSQL` connection string
//! - `DATABASE_MAX_CONNECTIONS` - pool size (default 10)
//! - `RUST_LOG`, `COOPSTOCK_LOG_FORMAT` - logging

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};
use uuid::Uuid;

mod commands;

#[derive(Parser)]
#[command(name = "coopstock")]
#[command(author, version, about = "coopstock ledger tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Replay the ledger of every product in an outlet against cached stock
    Reconcile {
        #[arg(long)]
        tenant: Uuid,

        #[arg(long)]
        outlet: Uuid,

        /// Exit non-zero when any product drifted
        #[arg(long)]
        fail_on_drift: bool,
    },
    /// Print the stock level of one product
    Stock {
        #[arg(long)]
        tenant: Uuid,

        #[arg(long)]
        outlet: Uuid,

        #[arg(long)]
        product: Uuid,
    },
}

#[tokio::main]
async fn main() {
    coopstock_observability::init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("command failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await,
        Commands::Reconcile {
            tenant,
            outlet,
            fail_on_drift,
        } => commands::reconcile::run(tenant.into(), outlet.into(), fail_on_drift).await,
        Commands::Stock {
            tenant,
            outlet,
            product,
        } => commands::reconcile::stock_level(tenant.into(), outlet.into(), product.into()).await,
    }
}
