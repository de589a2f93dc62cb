use anyhow::Context;
use rpcsession::core::config::ConfigError;
use rpcsession::{
    ChannelHandler, CredentialConfig, HmacSigner, Notification, NotificationHandler, Session, SessionConfig,
    SessionError, TokenSource,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment prefix: `VENUE_WS_URL`, `VENUE_CLIENT_ID`, `VENUE_CLIENT_SECRET`, ...
const ENV_PREFIX: &str = "VENUE";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rpcsession=debug")))
        .init();

    let config = load_config().context("Failed to load session configuration")?;

    // Public channels work without credentials
    let signer: Option<Arc<dyn TokenSource>> = match CredentialConfig::from_env(ENV_PREFIX) {
        Ok(credentials) if credentials.has_credentials() => {
            Some(Arc::new(HmacSigner::from_credentials(&credentials)))
        }
        _ => {
            tracing::info!("No credentials found, connecting without login");
            None
        }
    };

    let channels: Vec<String> = std::env::args().skip(1).collect();
    if channels.is_empty() {
        anyhow::bail!("usage: rpcsession <channel> [<channel> ...]");
    }

    let session = Session::new(config, signer)?;
    session.set_error_observer(|e: &SessionError| eprintln!("session error: {}", e));
    session
        .connect(Duration::from_secs(15))
        .await
        .context("Failed to connect")?;

    let (handler, mut notifications) = ChannelHandler::new();
    let handler = Arc::new(handler);
    for channel in &channels {
        session.subscribe(channel, SharedHandler(Arc::clone(&handler))).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notification = notifications.recv() => match notification {
                Some(n) => println!("{} {}", n.channel, n.data),
                None => break,
            },
        }
    }

    session.close().await;
    Ok(())
}

#[cfg(feature = "env-file")]
fn load_config() -> Result<SessionConfig, ConfigError> {
    SessionConfig::from_env_file(ENV_PREFIX, ".env")
}

#[cfg(not(feature = "env-file"))]
fn load_config() -> Result<SessionConfig, ConfigError> {
    SessionConfig::from_env(ENV_PREFIX)
}

/// Lets several channels feed one queue.
struct SharedHandler(Arc<ChannelHandler>);

impl NotificationHandler for SharedHandler {
    fn handle(&self, notification: Notification) {
        self.0.handle(notification);
    }
}
