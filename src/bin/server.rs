use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use stargazer::cache::{Cache, Clock, KvStore, MemoryStore, RestStore, SystemClock};
use stargazer::credentials::CredentialCache;
use stargazer::notifications::clients::{ClientRegistry, Endpoints};
use stargazer::notifications::service::Dispatcher;
use stargazer::server::config::ServerConfig;
use stargazer::services::connect_service::{BotLinks, ConnectService};
use stargazer::services::github_service::{GitHubApi, GitHubApp, GitHubOAuth};
use stargazer::services::installation_service::InstallationService;
use stargazer::services::session_service::SessionService;
use stargazer::services::settings_service::SettingsService;
use stargazer::version::{USER_AGENT, VERSION};
use stargazer::web::{self, AppState};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MEMORY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "stargazer-server", about = "Relays GitHub star events to chat channels")]
struct Args {
    /// Optional TOML config file; environment variables override it.
    #[arg(long)]
    config: Option<String>,
    /// Print the version and exit.
    #[arg(long)]
    version: bool,
}

fn init_logging(log_dir: &str) -> WorkerGuard {
    // Log to a file: JSON format, daily rotation
    let (file_writer, guard) = tracing_appender::non_blocking(rolling::daily(log_dir, "server.log"));
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
    }
    info!("Shutdown signal received.");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    if args.version {
        println!("stargazer-server version: {VERSION}");
        return Ok(());
    }

    let config = ServerConfig::load(args.config.as_deref())?;
    let _log_guard = init_logging(&config.log_dir);
    info!(version = VERSION, bind_addr = %config.bind_addr, "Starting server...");

    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn KvStore> = match (&config.kv_url, &config.kv_token) {
        (Some(url), Some(token)) => {
            info!(kv_url = %url, "Using the REST key-value store.");
            Arc::new(RestStore::new(http.clone(), url, token))
        }
        _ => {
            warn!("KV_URL/KV_TOKEN not set; state is kept in memory and lost on restart.");
            let memory = Arc::new(MemoryStore::new(clock.clone()));
            memory.spawn_sweeper(MEMORY_SWEEP_INTERVAL);
            memory
        }
    };
    let cache = Cache::new(store, clock);

    let oauth = GitHubOAuth::new(
        http.clone(),
        &config.github_client_id,
        &config.github_client_secret,
    );
    let app = GitHubApp::new(http.clone(), config.github_app_id, &config.github_app_private_key)?;
    let credentials = Arc::new(CredentialCache::new(cache.clone(), Arc::new(oauth), Arc::new(app)));

    let registry = Arc::new(ClientRegistry::new(
        http.clone(),
        Endpoints::default(),
        config.telegram_bot_token.clone(),
        config.discord_bot_token.clone(),
    ));
    match registry.default_telegram() {
        Some(bot) => {
            let url = config.telegram_webhook_url();
            bot.set_webhook(&url).await?;
            info!(%url, "Telegram webhook registered.");
        }
        None => warn!("TELEGRAM_BOT_TOKEN not set; telegram notifiers need their own token."),
    }
    let dispatcher = Arc::new(Dispatcher::new(registry, config.dispatch_options()));

    let installations = Arc::new(InstallationService::new(
        cache.clone(),
        credentials,
        GitHubApi::new(http),
    ));
    let links = BotLinks {
        telegram_bot_username: config.telegram_bot_username.clone(),
        discord_app_id: config.discord_app_id.clone(),
    };

    let app_state = Arc::new(AppState {
        sessions: Arc::new(SessionService::new(&config.secret_key)),
        connect: Arc::new(ConnectService::new(cache.clone(), links)),
        settings: Arc::new(SettingsService::new(
            cache,
            installations.clone(),
            dispatcher.clone(),
        )),
        installations,
        dispatcher,
        config: Arc::new(config),
    });

    let listener = tokio::net::TcpListener::bind(&app_state.config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening.");
    axum::serve(listener, web::create_router(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped.");
    Ok(())
}
