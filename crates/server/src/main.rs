mod config;
mod http;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use api::blob::DbBlobStore;
use api::customers;
use api::schema::{build_schema, AppSchema};
use clap::{Args, Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use platform_obs::{init_tracing, ObsConfig};
use sea_orm::{Database, DatabaseConnection};
use tracing::info;

use crate::{config::AppConfig, http::AppState};

#[derive(Parser, Debug)]
#[command(name = "atelier-tracker", version, about = "Jewellery order tracker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP + GraphQL server.
    Serve(ServeCommand),
    /// Run database migrations.
    #[command(subcommand)]
    Migrate(MigrateCommand),
    /// Create the admin account if it does not exist yet.
    SeedAdmin(SeedAdminCommand),
    /// Print the GraphQL schema.
    PrintSchema {
        #[arg(long, value_name = "FILE", help = "Write to a file instead of stdout")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum MigrateCommand {
    /// Apply pending migrations.
    Up,
    /// Roll back the most recent migration.
    Down,
    /// Roll back everything and apply again.
    Reset,
}

#[derive(Args, Debug)]
struct ServeCommand {
    #[arg(long, env = "BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
    #[arg(long, help = "Allow starting even when migrations are pending")]
    allow_dirty: bool,
}

#[derive(Args, Debug)]
struct SeedAdminCommand {
    #[arg(long, default_value = "Admin")]
    name: String,
    #[arg(long, env = "ADMIN_MOBILE")]
    mobile: String,
    #[arg(long, env = "ADMIN_PASSWORD", hide_env_values = true)]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _obs = init_tracing(ObsConfig::from_env("atelier-tracker"))?;
    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load()?);
    match cli.command {
        Command::Serve(cmd) => run_server(cmd, config).await,
        Command::Migrate(action) => migrate(action, &config).await,
        Command::SeedAdmin(cmd) => seed_admin(cmd, &config).await,
        Command::PrintSchema { output } => print_schema(output, &config),
    }
}

async fn connect(config: &AppConfig) -> Result<DatabaseConnection> {
    Database::connect(&config.database_url)
        .await
        .context("failed to connect to DATABASE_URL")
}

async fn run_server(cmd: ServeCommand, config: Arc<AppConfig>) -> Result<()> {
    let db = Arc::new(connect(&config).await?);
    ensure_migrations(db.as_ref(), cmd.allow_dirty).await?;
    let AppSchema(schema) = build_schema(
        db.clone(),
        Arc::new(config.auth.clone()),
        config.tracker,
    );
    let state = AppState {
        db: db.clone(),
        schema,
        blobs: Arc::new(DbBlobStore::new(db)),
        config: config.clone(),
    };
    http::serve(cmd.bind, state).await
}

async fn ensure_migrations(db: &DatabaseConnection, allow_dirty: bool) -> Result<()> {
    let pending = Migrator::get_pending_migrations(db).await?;
    if !pending.is_empty() && !allow_dirty {
        anyhow::bail!(
            "pending migrations detected; run `atelier-tracker migrate up` or pass --allow-dirty"
        );
    }
    Ok(())
}

async fn migrate(action: MigrateCommand, config: &AppConfig) -> Result<()> {
    let db = connect(config).await?;
    match action {
        MigrateCommand::Up => {
            Migrator::up(&db, None).await?;
            info!("database migrations applied");
        }
        MigrateCommand::Down => {
            Migrator::down(&db, Some(1)).await?;
            info!("most recent migration rolled back");
        }
        MigrateCommand::Reset => {
            Migrator::reset(&db).await?;
            Migrator::up(&db, None).await?;
            info!("database reset");
        }
    }
    Ok(())
}

async fn seed_admin(cmd: SeedAdminCommand, config: &AppConfig) -> Result<()> {
    let db = connect(config).await?;
    let (admin, created) = customers::seed_admin(&db, &cmd.name, &cmd.mobile, &cmd.password)
        .await
        .context("failed to seed admin account")?;
    if created {
        info!(customer_id = %admin.id, mobile = %admin.mobile_number, "admin account created");
    } else {
        info!(customer_id = %admin.id, "account with that mobile number already exists");
    }
    Ok(())
}

fn print_schema(output: Option<PathBuf>, config: &AppConfig) -> Result<()> {
    let AppSchema(schema) = build_schema(
        Arc::new(DatabaseConnection::Disconnected),
        Arc::new(config.auth.clone()),
        config.tracker,
    );
    let sdl = schema.sdl();
    match output {
        Some(path) => {
            std::fs::write(&path, sdl)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "schema written");
        }
        None => println!("{}", sdl),
    }
    Ok(())
}
