//! Process entry point CLI (§4.8 ADDED). Deliberately thin — `serve`
//! starts the bridge server, `check-config` loads and validates
//! configuration without starting anything, printing a human-readable
//! report and exiting non-zero on a mandatory-secret gap.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::analyzer::TranscriptAnalyzer;
use crate::config::{Config, Secrets};
use crate::generative::GenerativeClient;
use crate::notification::{MessagingClient, MessagingConfig, NotificationDispatcher};
use crate::persistence::PersistenceClient;
use crate::session::SessionClients;
use crate::telephony::rest::{CallDetailFetcher, TelephonyRestConfig};
use crate::tenant::TenantCache;

#[derive(Parser)]
#[command(name = "call-bridge")]
#[command(about = "Real-time telephony-to-LLM bridge with post-call transcript analysis", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge server (default command).
    Serve {
        /// Override the configured bind host.
        #[arg(long)]
        host: Option<String>,
        /// Override the configured bind port.
        #[arg(long)]
        port: Option<u16>,
        /// TLS certificate (PEM). Requires `--key`.
        #[arg(long)]
        cert: Option<String>,
        /// TLS private key (PEM). Requires `--cert`.
        #[arg(long)]
        key: Option<String>,
    },
    /// Load and validate configuration, then exit.
    CheckConfig,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { host: None, port: None, cert: None, key: None }) {
        Commands::Serve { host, port, cert, key } => serve(host, port, cert, key).await,
        Commands::CheckConfig => check_config().await,
    }
}

async fn serve(host: Option<String>, port: Option<u16>, cert: Option<String>, key: Option<String>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(host) = host {
        config.server.bind_host = host;
    }
    if let Some(port) = port {
        config.server.bind_port = port;
    }
    let config = Arc::new(config);

    let secrets = match Secrets::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let clients = Arc::new(build_session_clients(&config, &secrets));
    crate::server::run(config, clients, cert, key).await
}

async fn check_config() -> Result<()> {
    let config = Config::load()?;
    println!("config file: {}", crate::config::config_path()?.display());
    println!("bind address: {}:{}", config.server.bind_host, config.server.bind_port);
    println!("ws base path: {}", config.server.ws_base_path);
    println!("default tenant: {}", config.tenancy.default_tenant_id);
    println!(
        "audio rates: telephony={}hz llm_in={}hz llm_out={}hz",
        config.audio.telephony_rate_hz, config.audio.llm_input_rate_hz, config.audio.llm_output_rate_hz
    );

    match Secrets::from_env() {
        Ok(_) => {
            println!("secrets: all mandatory environment variables present");
            Ok(())
        }
        Err(e) => {
            eprintln!("secrets: {e}");
            std::process::exit(1);
        }
    }
}

fn build_session_clients(config: &Arc<Config>, secrets: &Secrets) -> SessionClients {
    let persistence = PersistenceClient::new(secrets.persistence_url.clone(), secrets.persistence_key.clone());
    let tenant_cache = Arc::new(TenantCache::new(persistence.clone(), config.tenancy.default_tenant_id.clone()));
    let call_detail_fetcher = Arc::new(CallDetailFetcher::new(TelephonyRestConfig::new(
        secrets.telephony_account_sid.clone(),
        secrets.telephony_auth_token.clone(),
    )));

    let generative = GenerativeClient::new(secrets.llm_api_key.clone());
    let analyzer = Arc::new(TranscriptAnalyzer::new(generative.clone()));

    let messaging = MessagingClient::new(MessagingConfig {
        auth_key: secrets.messaging_auth_key.clone(),
        integrated_number: secrets.messaging_sender_number.clone(),
        default_owner_phone: config.tenancy.default_owner_phone.clone(),
        default_country_code: config.tenancy.default_country_code.clone(),
    });
    let notifications = Arc::new(NotificationDispatcher::new(messaging, generative.clone(), persistence.clone()));

    SessionClients {
        config: config.clone(),
        tenant_cache,
        persistence,
        call_detail_fetcher,
        notifications,
        analyzer,
        generative,
        llm_api_key: secrets.llm_api_key.clone(),
    }
}
