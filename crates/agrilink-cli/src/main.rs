//! agrilink - command-line shell for the farmer session.
//!
//! Restores the persisted session on start and lets you sign in, register,
//! sign out, or watch session changes as they happen.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use futures::StreamExt;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agrilink_core::{
    AuthState, BackendClient, Config, FileSessionStore, KeyringSessionStore, ManagerSettings,
    ProfileFields, SessionError, SessionManager, SessionStorageKind, SessionStore,
};

// ============================================================================
// Constants
// ============================================================================

/// Log file name prefix; the appender adds the date
const LOG_FILE_PREFIX: &str = "agrilink.log";

const USAGE: &str = "\
Usage: agrilink <command>

Commands:
  status           Show who is signed in
  login [email]    Sign in with email and password
  signup           Register a new farmer account
  logout           Sign out and forget the saved session
  watch            Print session changes until interrupted";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Status,
    Login(Option<String>),
    Signup,
    Logout,
    Watch,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        match args.first().map(String::as_str) {
            None | Some("status") => Ok(Command::Status),
            Some("login") => Ok(Command::Login(args.get(1).cloned())),
            Some("signup") => Ok(Command::Signup),
            Some("logout") => Ok(Command::Logout),
            Some("watch") => Ok(Command::Watch),
            Some(other) => Err(anyhow!("Unknown command '{}'\n\n{}", other, USAGE)),
        }
    }
}

/// Initialize the tracing subscriber for logging.
/// Returns the guard that flushes the file writer; keep it alive.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn build_store(config: &Config) -> Result<Arc<dyn SessionStore>> {
    match config.session_storage {
        SessionStorageKind::File => {
            let secret = KeyringSessionStore::device_secret()
                .context("Session file encryption needs the OS keychain")?;
            Ok(Arc::new(FileSessionStore::new(&config.data_dir()?, secret)))
        }
        SessionStorageKind::Keyring => Ok(Arc::new(KeyringSessionStore)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{}", USAGE);
        return Ok(());
    }
    let command = Command::parse(&args)?;

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config ({}), using defaults", e);
            Config::default()
        }
    }
    .with_env_overrides()?;
    config.validate()?;

    let log_dir = config.data_dir().ok();
    if let Some(ref dir) = log_dir {
        let _ = std::fs::create_dir_all(dir);
    }
    let _log_guard = init_tracing(log_dir.as_deref());
    info!(command = ?command, "agrilink starting");

    let client = Arc::new(BackendClient::new(&config.backend_url, &config.anon_key)?);
    let store = build_store(&config)?;

    let mut settings = ManagerSettings::from(&config);
    if command != Command::Watch {
        settings.auto_refresh_interval = None;
    }
    let manager = SessionManager::new(client.clone(), client, store, settings);

    if let Err(e) = manager.init().await {
        warn!(error = %e, "Session restore failed");
        eprintln!("Could not restore saved session: {}", describe_error(&e));
    }

    let result = match command {
        Command::Status => {
            print_status(&manager);
            Ok(())
        }
        Command::Login(email) => login(&manager, &mut config, email).await,
        Command::Signup => signup(&manager, &mut config).await,
        Command::Logout => logout(&manager).await,
        Command::Watch => watch(&manager).await,
    };

    manager.dispose();
    info!("agrilink shutting down");
    result
}

// ============================================================================
// Commands
// ============================================================================

fn print_status(manager: &SessionManager) {
    let state = manager.state();
    println!("{}", state);
    if let Some(session) = state.session() {
        println!("Token expires in {} minutes", session.minutes_until_expiry());
    }
    if let Some(profile) = state.profile() {
        println!("District: {}", profile.district);
        println!("Phone: {}", profile.phone);
        println!("Language: {}", profile.language);
    }
}

async fn login(manager: &SessionManager, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt_with_default("Email", config.last_email.as_deref())?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    println!("\nSigning in...");
    match manager.sign_in(&email, &password).await {
        Ok((_, profile)) => {
            remember_email(config, &email);
            println!("Welcome, {}!", profile.name);
            Ok(())
        }
        Err(SessionError::ProfileNotFound { .. }) => {
            remember_email(config, &email);
            println!("Signed in, but no farmer profile exists for {}.", email);
            Ok(())
        }
        Err(e) => Err(anyhow!(describe_error(&e))),
    }
}

async fn signup(manager: &SessionManager, config: &mut Config) -> Result<()> {
    println!("\n=== Register ===\n");
    let name = prompt("Name of farmer")?;
    let email = prompt("Email")?;
    let phone = prompt("Phone number")?;
    let district = prompt("District")?;
    let password = rpassword::prompt_password("Password: ")?;

    let fields = ProfileFields {
        name,
        phone,
        district,
    };

    println!("\nCreating account...");
    match manager.sign_up(&email, &password, &fields).await {
        Ok((_, profile)) => {
            remember_email(config, &email);
            println!("Account created. Welcome, {}!", profile.name);
            Ok(())
        }
        Err(e) => Err(anyhow!(describe_error(&e))),
    }
}

async fn logout(manager: &SessionManager) -> Result<()> {
    match manager.sign_out().await {
        Ok(()) => println!("Signed out."),
        Err(e) => println!("Signed out locally ({}).", describe_error(&e)),
    }
    Ok(())
}

async fn watch(manager: &SessionManager) -> Result<()> {
    println!("{}", manager.state());
    let mut changes = Box::pin(manager.subscribe().into_stream());
    while let Some(state) = changes.next().await {
        let stamp = Local::now().format("%H:%M:%S");
        match state {
            AuthState::Authenticating => {}
            other => println!("[{}] {}", stamp, other),
        }
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn remember_email(config: &mut Config, email: &str) {
    config.last_email = Some(email.trim().to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

/// User-facing message for a session failure
fn describe_error(err: &SessionError) -> String {
    match err {
        SessionError::InvalidCredentials => "Invalid email or password".to_string(),
        SessionError::IdentifierAlreadyRegistered => {
            "That email is already registered. Try logging in.".to_string()
        }
        SessionError::WeakSecret(reason) => format!("Password too weak: {}", reason),
        SessionError::Validation(reason) => reason.clone(),
        SessionError::Network(_) => {
            "Unable to reach the server. Check your internet connection.".to_string()
        }
        SessionError::SessionExpired => "Your session has ended. Please log in again.".to_string(),
        SessionError::ProfileMismatch { .. } => {
            "Your farmer profile could not be matched to this account. Contact support.".to_string()
        }
        other => other.to_string(),
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_with_default(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(default) => {
            let input = prompt(&format!("{} [{}]", label, default))?;
            Ok(if input.is_empty() {
                default.to_string()
            } else {
                input
            })
        }
        None => prompt(label),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse(&args(&[])).unwrap(), Command::Status);
        assert_eq!(Command::parse(&args(&["status"])).unwrap(), Command::Status);
        assert_eq!(Command::parse(&args(&["login"])).unwrap(), Command::Login(None));
        assert_eq!(
            Command::parse(&args(&["login", "farmer@example.com"])).unwrap(),
            Command::Login(Some("farmer@example.com".to_string()))
        );
        assert_eq!(Command::parse(&args(&["signup"])).unwrap(), Command::Signup);
        assert_eq!(Command::parse(&args(&["logout"])).unwrap(), Command::Logout);
        assert_eq!(Command::parse(&args(&["watch"])).unwrap(), Command::Watch);
        assert!(Command::parse(&args(&["harvest"])).is_err());
    }

    #[test]
    fn test_describe_error() {
        assert_eq!(
            describe_error(&SessionError::InvalidCredentials),
            "Invalid email or password"
        );
        assert!(describe_error(&SessionError::Network("timeout".into())).contains("internet"));
        assert!(describe_error(&SessionError::SessionExpired).contains("log in again"));
        let mismatch = SessionError::ProfileMismatch {
            user_id: "u1".into(),
            profile_user_id: "u2".into(),
        };
        assert!(!describe_error(&mismatch).contains("internet"));
        assert_eq!(
            describe_error(&SessionError::Validation("name is required".into())),
            "name is required"
        );
    }
}
