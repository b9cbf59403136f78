use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use somnium_session::config::ConfigError;
use somnium_session::live::{ExponentialBackoff, HttpConnector, run_with_reconnect};
use somnium_session::{
    ClientError, FileStorage, HttpSessionApi, LiveChannel, LiveEvent, LoginRequest, Navigator, Role,
    SessionClient, SessionConfig, StreamEndpoint, scopes,
};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("http client setup failed: {0}")]
    Api(#[from] somnium_session::ApiError),
    #[error("stream setup failed: {0}")]
    Stream(#[from] somnium_session::live::StreamError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "somnium", about = "Somnium session client: login, monitor, live streams")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and keep the session checked until interrupted, then sign out.
    Session(SessionArgs),
    /// Print the persisted credential cache.
    Status,
    /// Clear the persisted credential cache without contacting the backend.
    Clear,
    /// Print the scopes granted to a role.
    Scopes { role: Role },
}

#[derive(Args, Debug)]
struct SessionArgs {
    #[arg(long, env = "SOMNIUM_EMAIL")]
    email: String,

    #[arg(long, env = "SOMNIUM_PASSWORD", hide_env_values = true)]
    password: String,

    #[arg(long, default_value = "nurse")]
    role: Role,

    #[arg(long, default_value_t = false)]
    remember_me: bool,

    /// Path the session "navigates" to after login.
    #[arg(long)]
    redirect: Option<String>,

    /// Follow the vitals stream for this patient.
    #[arg(long, conflicts_with = "alerts")]
    patient: Option<Uuid>,

    /// Follow the alerts stream.
    #[arg(long, default_value_t = false)]
    alerts: bool,
}

/// Prints navigation targets instead of switching views.
struct CliNavigator {
    location: watch::Sender<String>,
}

impl Navigator for CliNavigator {
    fn navigate(&self, target: &str) {
        tracing::info!(%target, "navigate");
        println!("-> {target}");
        self.location.send_replace(target.to_owned());
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = SessionConfig::from_env()?;

    match cli.command {
        Command::Session(args) => run_session(config, args).await,
        Command::Status => run_status(&config),
        Command::Clear => run_clear(&config),
        Command::Scopes { role } => {
            print_json(&json!({ "role": role.as_str(), "scopes": scopes::scopes_for(role) }))
        }
    }
}

async fn run_session(config: SessionConfig, args: SessionArgs) -> Result<(), CliError> {
    let (location_tx, location_rx) = watch::channel(String::from("/auth"));
    let navigator = Arc::new(CliNavigator { location: location_tx });
    let api = Arc::new(HttpSessionApi::new(&config)?);
    let storage = Arc::new(FileStorage::new(config.storage_path.clone()));
    let client = SessionClient::new(config.clone(), api.clone(), storage, navigator.clone());
    client.hydrate();

    let request = LoginRequest::new(args.email, args.password, args.role).remember_me(args.remember_me);
    let target = client.login(&request, args.redirect.as_deref()).await?;
    navigator.navigate(&target);
    if let Some(user) = client.store().user() {
        print_json(&json!({ "user": user.email, "role": user.role.as_str(), "target": target }))?;
    }

    let _monitor = client.monitor(location_rx);

    let endpoint = match (args.patient, args.alerts) {
        (Some(patient), _) => Some(StreamEndpoint::PatientVitals(patient)),
        (None, true) => Some(StreamEndpoint::Alerts),
        (None, false) => None,
    };
    let stream = match endpoint {
        Some(endpoint) => {
            let channel: Arc<LiveChannel> =
                Arc::new(LiveChannel::new(Arc::new(HttpConnector::new(&config)?)).on_message(print_event));
            let api = Arc::clone(&api);
            let store = client.store().clone();
            let task_channel = Arc::clone(&channel);
            let task = tokio::spawn(async move {
                let credential = || if store.is_authenticated() { api.credential() } else { None };
                if let Err(e) = run_with_reconnect(&task_channel, endpoint, credential, ExponentialBackoff::default()).await
                {
                    tracing::error!(error = %e, "live stream stopped");
                }
            });
            Some((channel, task))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, signing out");

    if let Some((channel, task)) = stream {
        task.abort();
        channel.close().await;
    }
    client.logout().await;
    Ok(())
}

fn run_status(config: &SessionConfig) -> Result<(), CliError> {
    let client = offline_client(config)?;
    let snapshot = client.store().snapshot();
    let user = snapshot.user.as_ref().map(|user| {
        json!({
            "id": user.id,
            "email": user.email,
            "full_name": user.full_name,
            "role": user.role.as_str(),
            "department": user.department,
        })
    });
    print_json(&json!({
        "authenticated": snapshot.is_authenticated,
        "user": user,
        "storage": config.storage_path,
    }))
}

fn run_clear(config: &SessionConfig) -> Result<(), CliError> {
    let client = offline_client(config)?;
    client.store().logout();
    println!("cleared {}", config.storage_path.display());
    Ok(())
}

/// A hydrated client for local cache inspection. Never contacts the backend.
fn offline_client(config: &SessionConfig) -> Result<SessionClient, CliError> {
    let (location, _) = watch::channel(String::new());
    let client = SessionClient::from_config(config.clone(), Arc::new(CliNavigator { location }))?;
    client.hydrate();
    Ok(client)
}

fn print_event(event: &LiveEvent) {
    let rendered = serde_json::to_string(event).unwrap_or_else(|_| event.event.clone());
    println!("{rendered}");
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
