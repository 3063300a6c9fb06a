//! Tillguard CLI - operator command line for the session core
//!
//! A thin adapter over [`SessionManager`]: every command restores the
//! persisted session, runs one operation and exits.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tillguard_core::{init_logging, performance, TillConfig, TillError};
use tillguard_session::{AuthGateway, Permission, SessionError, SessionManager, SessionStatus};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "tillguard")]
#[command(about = "Sign in to the point-of-sale API and inspect what the session may do")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and persist the session. The password comes from
    /// TILLGUARD_PASSWORD unless --password-stdin is given.
    Login {
        username: String,

        /// Read the password from the first line of stdin
        #[arg(long)]
        password_stdin: bool,
    },

    /// Sign out locally and on the server
    Logout,

    /// Show the current session
    Status {
        /// Also ask the server whether the session is still valid
        #[arg(long)]
        check: bool,
    },

    /// Exchange the refresh token for a new access token
    Refresh,

    /// Check a permission code such as `orders.create`
    Can { permission: String },

    /// List accessible menus, or check a single one
    Menu { menu: Option<String> },

    /// Send an authenticated GET and print the JSON body
    Get { path: String },

    /// Manage configuration
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,

        /// Print the effective configuration
        #[arg(long)]
        show: bool,

        /// Validate the effective configuration
        #[arg(long)]
        validate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match (&cli.command, cli.config.as_deref()) {
        (Commands::Config { init: true, .. }, Some(path)) if !path.exists() => TillConfig::default(),
        (_, path) => TillConfig::load(path).context("Failed to load configuration")?,
    };

    let mut logging_config = config.logging.clone();
    if cli.verbose {
        logging_config.level = "debug".to_string();
    }
    init_logging(&logging_config).map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    debug!("Starting tillguard v{}", env!("CARGO_PKG_VERSION"));

    if let Commands::Config {
        init,
        show,
        validate,
    } = cli.command
    {
        return handle_config(&config, cli.config, init, show, validate);
    }

    config
        .validate()
        .inspect_err(TillError::log)
        .context("Invalid configuration")?;

    let manager = SessionManager::from_config(&config)?;
    let restored = manager.restore().await?;
    debug!(status = %restored, "Session restored");

    let result = match cli.command {
        Commands::Login {
            username,
            password_stdin,
        } => handle_login(&manager, &username, password_stdin).await,
        Commands::Logout => handle_logout(&manager).await,
        Commands::Status { check } => handle_status(&manager, check).await,
        Commands::Refresh => handle_refresh(&manager).await,
        Commands::Can { permission } => handle_can(&manager, &permission).await,
        Commands::Menu { menu } => handle_menu(&manager, menu.as_deref()).await,
        Commands::Get { path } => handle_get(&manager, &path).await,
        Commands::Config { .. } => Ok(()),
    };

    result.map_err(|e| match e.downcast::<SessionError>() {
        Ok(session_error) => {
            if let Some(inner) = session_error.core_error() {
                inner.log();
            }
            anyhow!("{}", session_error.user_message())
        }
        Err(other) => other,
    })
}

const PASSWORD_ENV: &str = "TILLGUARD_PASSWORD";

/// Password from stdin or the environment, never from argv
fn read_password(from_stdin: bool) -> Result<String> {
    if from_stdin {
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .context("Failed to read password from stdin")?;
        return Ok(line.trim_end_matches(['\r', '\n']).to_string());
    }

    std::env::var(PASSWORD_ENV)
        .map_err(|_| anyhow!("Set {} or pass --password-stdin", PASSWORD_ENV))
}

async fn handle_login(manager: &SessionManager, username: &str, password_stdin: bool) -> Result<()> {
    let password = read_password(password_stdin)?;
    let user = performance::measure_async("login", manager.login(username, &password)).await?;

    println!("Signed in as {}", user.display_string());
    if let Some(remaining) = manager.time_remaining().await {
        println!("Session valid for {} minutes", remaining.num_minutes());
    }
    Ok(())
}

async fn handle_logout(manager: &SessionManager) -> Result<()> {
    if !manager.is_authenticated().await {
        println!("Not signed in");
        return Ok(());
    }

    manager.logout().await?;
    println!("Signed out");
    Ok(())
}

async fn handle_status(manager: &SessionManager, check: bool) -> Result<()> {
    if check && manager.is_authenticated().await && !manager.validate().await {
        println!("Session was rejected by the server; signed out");
        return Ok(());
    }

    let Some(user) = manager.current_user().await else {
        println!("Status: {}", SessionStatus::Anonymous);
        return Ok(());
    };

    println!("Status: {}", manager.status().await);
    println!("User: {}", user.display_string());
    if let Some(expires_at) = manager.expires_at().await {
        println!("Expires: {}", expires_at.to_rfc3339());
    }

    let codes: Vec<&str> = manager
        .permissions()
        .await
        .iter()
        .map(|p| p.code())
        .collect();
    println!("Permissions: {}", codes.join(", "));
    Ok(())
}

async fn handle_refresh(manager: &SessionManager) -> Result<()> {
    if !manager.is_authenticated().await {
        return Err(SessionError::NotAuthenticated.into());
    }

    if manager.refresh().await {
        println!("Access token refreshed");
        Ok(())
    } else {
        Err(SessionError::SessionExpired.into())
    }
}

async fn handle_can(manager: &SessionManager, code: &str) -> Result<()> {
    let permission: Permission = code.parse().map_err(anyhow::Error::msg)?;

    manager.require_permission(permission).await?;
    println!("Allowed: {}", permission);
    Ok(())
}

async fn handle_menu(manager: &SessionManager, menu: Option<&str>) -> Result<()> {
    match menu {
        Some(menu) => {
            if manager.can_access_menu(menu).await {
                println!("Allowed: {}", menu);
                Ok(())
            } else {
                Err(anyhow!("Menu '{}' is not available to this session", menu))
            }
        }
        None => {
            if !manager.is_authenticated().await {
                return Err(SessionError::NotAuthenticated.into());
            }
            for menu in manager.accessible_menus().await {
                println!("{}", menu);
            }
            Ok(())
        }
    }
}

async fn handle_get(manager: &SessionManager, path: &str) -> Result<()> {
    let gateway = AuthGateway::for_session(manager.clone());
    let body: serde_json::Value = gateway.get_json(path).await?;

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn handle_config(
    config: &TillConfig,
    path: Option<PathBuf>,
    init: bool,
    show: bool,
    validate: bool,
) -> Result<()> {
    if init {
        let path = path
            .or_else(TillConfig::default_path)
            .ok_or_else(|| anyhow!("No configuration directory available; pass --config"))?;

        if path.exists() {
            return Err(anyhow!("Configuration already exists at {}", path.display()));
        }

        TillConfig::default().save_to_file(&path)?;
        info!("Configuration initialized at {}", path.display());
        println!("Configuration written to {}", path.display());
    }

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    if validate {
        config.validate()?;
        println!("Configuration is valid");
    }

    Ok(())
}
