use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use relay_server::auth::jwt::{self, JwtVerifier};
use relay_server::config::{generate_config_template, Config};
use relay_server::db::{self, store::SqliteMessageStore};
use relay_server::routes;
use relay_server::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relay_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .init();
    }

    // Configured secret wins over the generated key file
    let jwt_secret = match &config.jwt_secret {
        Some(secret) => secret.as_bytes().to_vec(),
        None => jwt::load_or_generate_jwt_secret(&config.data_dir)?,
    };

    // Handle --issue-token: print a signed token for the given user and exit
    if let Some(user_id) = config.issue_token {
        let token = jwt::issue_access_token(
            &jwt_secret,
            user_id,
            None,
            i64::try_from(config.token_ttl_secs)?,
        )?;
        println!("{}", token);
        return Ok(());
    }

    tracing::info!("relay server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    let app_state = AppState::new(
        Arc::new(JwtVerifier::new(jwt_secret)),
        Arc::new(SqliteMessageStore::new(db)),
        config.session.clone(),
    );

    tracing::info!(
        forward_mode = ?config.session.forward_mode,
        ping_interval_secs = config.session.ping_interval_secs,
        "Session settings loaded"
    );

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
