//! Cargo subcommand for Rowqueue operations.
//!
//! This binary provides `cargo rowqueue` subcommands for installing and
//! inspecting a Rowqueue schema.
//!
//! Usage:
//!   cargo rowqueue migrate --database-url postgresql://localhost/rowqueue
//!   cargo rowqueue status --database-url postgresql://localhost/rowqueue
//!   cargo rowqueue sweep --database-url postgresql://localhost/rowqueue
//!   cargo rowqueue plans --schema jobs

use clap::{Parser, Subcommand};
use rowqueue::{
    Config, Migrator, Plans, Supervisor,
    db::{Executor, PgExecutor},
};
use std::{process, sync::Arc};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cargo",
    bin_name = "cargo",
    version,
    about = "Rowqueue job queue management tool"
)]
struct Cli {
    #[command(subcommand)]
    command: CargoCommand,
}

#[derive(Subcommand)]
enum CargoCommand {
    #[command(name = "rowqueue", about = "Rowqueue job queue operations", version)]
    Rowqueue {
        #[command(subcommand)]
        command: RowqueueCommand,
    },
}

#[derive(clap::Args)]
struct Connection {
    #[arg(
        long = "database-url",
        env = "DATABASE_URL",
        help = "Database connection URL",
        value_name = "URL"
    )]
    database_url: Option<String>,

    #[arg(long, help = "Schema that holds the queue tables", value_name = "SCHEMA")]
    schema: Option<String>,

    #[arg(long, help = "Read settings from a TOML file", value_name = "FILE")]
    config: Option<String>,
}

#[derive(Subcommand)]
enum RowqueueCommand {
    #[command(about = "Install the queue schema, or verify an installed one")]
    Migrate {
        #[command(flatten)]
        connection: Connection,
    },

    #[command(about = "Show the schema version and job counts per queue")]
    Status {
        #[command(flatten)]
        connection: Connection,
    },

    #[command(about = "Run one expire, archive, and purge pass")]
    Sweep {
        #[command(flatten)]
        connection: Connection,
    },

    #[command(about = "Print the schema DDL without connecting")]
    Plans {
        #[arg(long, default_value = "rowqueue", help = "Schema name")]
        schema: String,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    // RUST_LOG wins over ROWQUEUE_LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = Config::from_env()
            .map(|config| config.logging.level)
            .unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let CargoCommand::Rowqueue { command } = cli.command;
    let result = match command {
        RowqueueCommand::Migrate { connection } => run_migrations(connection).await,
        RowqueueCommand::Status { connection } => show_status(connection).await,
        RowqueueCommand::Sweep { connection } => run_sweep(connection).await,
        RowqueueCommand::Plans { schema } => print_plans(&schema),
    };

    if let Err(e) = result {
        eprintln!("❌ Error: {}", e);
        process::exit(1);
    }
}

impl Connection {
    fn config(&self) -> rowqueue::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::from_env()?,
        };
        if let Some(url) = &self.database_url {
            config = config.with_database_url(url);
        }
        if let Some(schema) = &self.schema {
            config = config.with_schema(schema);
        }
        config.validate()?;
        Ok(config)
    }

    async fn open(&self) -> rowqueue::Result<(Config, Arc<dyn Executor>, Arc<Plans>)> {
        let config = self.config()?;
        let executor: Arc<dyn Executor> = Arc::new(PgExecutor::connect(&config.database).await?);
        let plans = Arc::new(Plans::new(&config.schema)?);
        Ok((config, executor, plans))
    }
}

async fn run_migrations(connection: Connection) -> CliResult {
    let (config, executor, plans) = connection.open().await?;
    println!("🔧 Installing Rowqueue schema {}...", config.schema);

    Migrator::new(Arc::clone(&executor), plans).install().await?;
    executor.close().await;

    println!("✅ Schema {} is installed and up to date", config.schema);
    Ok(())
}

async fn show_status(connection: Connection) -> CliResult {
    let (config, executor, plans) = connection.open().await?;
    println!("📊 Rowqueue status for schema {}", config.schema);
    println!();

    let migrator = Migrator::new(Arc::clone(&executor), Arc::clone(&plans));
    let Some(version) = migrator.version().await? else {
        println!("⏳ Schema is not installed");
        println!("💡 Run: cargo rowqueue migrate --database-url <URL>");
        executor.close().await;
        return Ok(());
    };
    println!("Schema version: {}", version);

    let supervisor = Supervisor::new(Arc::clone(&executor), plans, config.maintenance.clone());
    let counts = supervisor.count_states().await?;
    executor.close().await;

    println!("Total jobs: {}", counts.all);
    for (state, count) in &counts.states {
        println!("  {:<10} {}", state.as_str(), count);
    }
    for (name, queue) in &counts.queues {
        println!();
        println!("Queue {} ({} jobs)", name, queue.all);
        for (state, count) in queue.states.iter().filter(|(_, count)| **count > 0) {
            println!("  {:<10} {}", state.as_str(), count);
        }
    }
    println!();
    Ok(())
}

async fn run_sweep(connection: Connection) -> CliResult {
    let (config, executor, plans) = connection.open().await?;
    let migrator = Migrator::new(Arc::clone(&executor), Arc::clone(&plans));
    migrator.check().await?;

    let supervisor = Supervisor::new(Arc::clone(&executor), plans, config.maintenance.clone());
    let expired = supervisor.expire().await?;
    let archived = supervisor.archive().await?;
    let purged = supervisor.purge().await?;
    executor.close().await;

    println!("🧹 Expired {} jobs", expired);
    println!("📦 Archived {} jobs", archived);
    println!("🗑️  Purged {} archived jobs", purged);
    Ok(())
}

fn print_plans(schema: &str) -> CliResult {
    let plans = Plans::new(schema)?;
    for statement in plans.create() {
        println!("{};", statement.text.trim());
        println!();
    }
    println!("{};", plans.insert_version.text.trim());
    Ok(())
}
