use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use uma_user_agent::agent::config::Config;
use uma_user_agent::comms::local_api;
use uma_user_agent::transport::ResilientClient;
use uma_user_agent::uma::{AuthorizationServer, UmaClient};
use uma_user_agent::utils::logging;

#[derive(Parser)]
#[command(
    name = "uma-user-agent",
    version,
    about = "UMA 2.0 user agent for nginx auth_request"
)]
struct AppCli {
    /// JSON config file; environment variables override its values
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the auth_request HTTP server (default)
    Serve {
        /// Overrides the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Obtain a user ID token with the OAuth password grant
    IdToken {
        /// Authorization Server base URL
        #[arg(long)]
        as_uri: String,
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
}

async fn id_token(config: &Config, as_uri: &str, username: &str, password: &str) -> Result<()> {
    if !config.is_ready() {
        bail!("CLIENT_ID and CLIENT_SECRET must be configured");
    }
    let transport = Arc::new(ResilientClient::new(config)?);
    let client = UmaClient::new(
        config.client_id.clone(),
        config.client_secret.clone(),
        transport,
    );
    let server = AuthorizationServer::new(as_uri);
    let token = client
        .password_grant_id_token(&server, username, password)
        .await
        .context("password grant")?;
    println!("{token}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppCli::parse();
    let config = Config::load(args.config.as_deref())?;
    logging::init(&config.log_level);

    match args.command {
        Some(Commands::IdToken {
            as_uri,
            username,
            password,
        }) => id_token(&config, &as_uri, &username, &password).await?,
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(config.listen_port);
            info!(version = uma_user_agent::VERSION, "starting auth_request server on port {port}");
            local_api::serve(config, port).await?;
        }
        None => {
            let port = config.listen_port;
            info!(version = uma_user_agent::VERSION, "starting auth_request server on port {port}");
            local_api::serve(config, port).await?;
        }
    }

    Ok(())
}
