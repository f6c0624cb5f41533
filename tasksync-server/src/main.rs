use clap::{Parser, Subcommand};
use std::sync::Arc;
use tasksync_server::{auth::AuthState, database::ServerDatabase, router, AppState};

#[derive(Parser)]
#[command(name = "tasksync-server", about = "Remote record service for tasksync clients")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket server (default)
    Serve,
    /// Create an API key and secret for a client application
    GenerateCredentials {
        /// Label stored with the credentials
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> tasksync_core::SyncResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasksync_server=debug,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost:5432/tasksync".to_string());

    let db = match ServerDatabase::new(&database_url).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!(%e, "Failed to initialize database");
            return Ok(());
        }
    };

    if let Err(e) = db.run_migrations().await {
        tracing::error!(%e, "Failed to run migrations");
        return Ok(());
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::GenerateCredentials { name } => generate_credentials(db, &name).await,
        Command::Serve => serve(db).await,
    }
}

async fn generate_credentials(
    db: Arc<ServerDatabase>,
    name: &str,
) -> tasksync_core::SyncResult<()> {
    let auth = AuthState::new(db);
    let credentials = AuthState::generate_api_credentials();
    auth.save_credentials(&credentials, name).await?;

    println!("Credentials for {}:", name);
    println!("  TASKSYNC_API_KEY={}", credentials.api_key);
    println!("  TASKSYNC_API_SECRET={}", credentials.secret);
    println!("The secret is shown once; store it with the client configuration.");
    Ok(())
}

async fn serve(db: Arc<ServerDatabase>) -> tasksync_core::SyncResult<()> {
    let record_quota = match std::env::var("RECORD_QUOTA") {
        Ok(value) => match value.parse::<i64>() {
            Ok(quota) => Some(quota),
            Err(e) => {
                tracing::error!(%e, value = %value, "Invalid RECORD_QUOTA");
                return Ok(());
            }
        },
        Err(_) => None,
    };

    let app = router(Arc::new(AppState::new(db, record_quota)));

    let addr = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    tracing::info!("SERVER: Starting record service on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%e, addr = %addr);
            return Ok(());
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(%e, addr = %addr);
    }

    Ok(())
}
