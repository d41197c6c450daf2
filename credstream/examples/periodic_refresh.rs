use std::time::Duration;

use clap::Parser;
use credstream::{
    policy::RetryPolicy,
    sources::oauth2::{dto, ClientCredentialsProvider},
    ClientId, ClientSecret, CredentialsConfig, CredentialsProvider, RefreshConfig, Scope,
    TokenStatus,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's token request URL
    #[arg(short, long, env)]
    token_url: reqwest::Url,

    /// The client ID of the client
    #[arg(short, long, env)]
    client_id: String,

    /// The client secret used to identify the client to the issuing authority
    #[arg(short = 's', long, env, hide_env_values = true)]
    client_secret: String,

    /// The scopes to request a token for
    #[arg(long, env, value_delimiter = ' ')]
    scopes: Vec<String>,

    /// The fraction of a token's lifetime after which it is refreshed
    #[arg(long, env, default_value_t = credstream::policy::DEFAULT_EXPIRATION_REFRESH_RATIO)]
    refresh_ratio: f64,

    /// The number of attempts made to acquire each token
    #[arg(long, env, default_value_t = credstream::policy::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Wait for the first token before starting to poll
    #[arg(long, env)]
    block_for_initial: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let credentials = dto::ClientCredentialsWithScopes::new(
        dto::ClientCredentials {
            client_id: ClientId::from(opts.client_id),
            client_secret: ClientSecret::from(opts.client_secret),
        },
        opts.scopes.into_iter().map(Scope::from).collect(),
    );

    let identity =
        ClientCredentialsProvider::new(reqwest::Client::new(), opts.token_url, credentials);

    let refresh = RefreshConfig::new(
        opts.refresh_ratio,
        Duration::from_secs(60),
        RetryPolicy::new(opts.max_attempts, Duration::from_secs(1))?,
    )?;
    let config = CredentialsConfig::new(refresh.clone())
        .with_block_for_initial(opts.block_for_initial);

    let provider = CredentialsProvider::new(identity, config)?;

    provider.on_next(|token| {
        tracing::info!(
            expiry = token.expires_at().0,
            principal = token.principal(),
            "new access token"
        );
        Ok(())
    });
    provider.on_error(|error| {
        tracing::warn!(error = (&error as &dyn std::error::Error), "token error");
        Ok(())
    });

    provider.start_async().await?;

    let (username, _) = provider.get_credentials_async().await?;
    tracing::info!(%username, "first credentials");

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        let Some(token) = provider.current_token() else {
            tracing::warn!(status = ?provider.status(), "no token held");
            continue;
        };

        let status = token.token_status_with_clock(&credstream_clock::System, &refresh);
        match status {
            TokenStatus::Fresh => {
                tracing::debug!(?status, expiry = token.expires_at().0, "pulled token")
            }
            TokenStatus::Due => {
                tracing::warn!(?status, expiry = token.expires_at().0, "pulled token")
            }
            TokenStatus::Expired => {
                tracing::error!(?status, expiry = token.expires_at().0, "pulled token");
                provider.get_credentials_async().await.ok();
            }
        }
    }
}
