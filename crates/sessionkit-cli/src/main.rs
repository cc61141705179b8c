//! sessionkit - manage an API session from the terminal.
//!
//! Each invocation runs one command against the configured API. Credentials
//! and the cached user live in the platform data directory; process exit
//! counts as closing the tab, so credential rotation runs on the way out.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use sessionkit_core::auth::USER_CACHE_KEY;
use sessionkit_core::{ApiError, Authentication, Config, ReqwestTransport, Storages, SystemClock};
use tokio::sync::oneshot;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Overrides `http.base_url` from the config file
const BASE_URL_ENV: &str = "SESSIONKIT_BASE_URL";

/// Directory for a daily rolling log file
const LOG_DIR_ENV: &str = "SESSIONKIT_LOG_DIR";

const LOG_FILE: &str = "sessionkit.log";

const USAGE: &str = "\
Usage: sessionkit <command> [args]

Commands:
  login [username]               Log in, prompting for the password
  logout                         End the session
  check [--force]                Validate the session with the server
  whoami                         Print the cached user
  token                          Print the stored access token
  refresh                        Exchange the refresh token for a new access token
  register <email> [name]        Create an account, prompting for a password
  forgot-password <email>        Request a password reset
  reset-password <token> <email> Set a new password with a reset token
  sweep                          Purge expired cache entries

Options:
  --remember                     Keep the credential across sessions (login)";

/// Initialize the tracing subscriber for logging.
/// Returns the file writer guard, which must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => {
            let appender = rolling::daily(PathBuf::from(dir), LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
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

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };
    if command == "--help" || command == "-h" {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load()?;
    if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
        config.http.base_url = Some(base_url);
    }
    let data_dir = config.data_dir()?;

    let clock = Arc::new(SystemClock);
    let storages = Storages::open(&data_dir, &config, clock.clone());
    let transport = Arc::new(ReqwestTransport::new(config.http.timeout_secs)?);
    let auth = Authentication::init(&config, storages, transport, clock).await;

    let (unload_tx, unload_rx) = oneshot::channel::<()>();
    let unload = auth.token().watch_unload(async move {
        let _ = unload_rx.await;
    });

    info!(command = %command, "sessionkit starting");
    let result = run(&auth, command, &args[1..]).await;

    // Exit is the unload signal
    let _ = unload_tx.send(());
    unload.await.context("Credential rotation task failed")?;

    result
}

async fn run(auth: &Authentication, command: &str, args: &[String]) -> Result<()> {
    let flag = |name: &str| args.iter().any(|arg| arg == name);
    let positional: Vec<&String> = args.iter().filter(|arg| !arg.starts_with("--")).collect();

    match command {
        "login" => {
            let username = match positional.first() {
                Some(username) => username.to_string(),
                None => prompt("Username: ")?,
            };
            let password = rpassword::prompt_password("Password: ")?;
            auth.remember(flag("--remember") || auth.should_remember());

            let user = auth
                .login(json!({"username": username, "password": password}))
                .await
                .map_err(report)?;
            print_json(&user)?;
        }
        "logout" => {
            auth.logout().await;
            println!("Logged out");
        }
        "check" => {
            if auth.check(flag("--force")).await {
                println!("Authenticated");
            } else {
                bail!("Not authenticated");
            }
        }
        "whoami" => match auth.user().await {
            Some(user) => {
                print_json(&user)?;
                if let Some(age) = auth.cache().age(USER_CACHE_KEY).await {
                    eprintln!("Cached {}", age);
                }
            }
            None => bail!("No cached user. Run `sessionkit check` first."),
        },
        "token" => match auth.token().get().await {
            Some(token) => println!("{}", token),
            None => bail!("No stored token"),
        },
        "refresh" => {
            if !auth.refresh(json!({})).await {
                bail!("Token refresh failed");
            }
            println!("Token refreshed");
        }
        "register" => {
            let Some(email) = positional.first() else {
                bail!("Usage: sessionkit register <email> [name]");
            };
            let password = rpassword::prompt_password("Password: ")?;
            let confirmation = rpassword::prompt_password("Confirm password: ")?;
            let mut data = json!({
                "email": email,
                "password": password,
                "password_confirmation": confirmation,
            });
            if let Some(name) = positional.get(1) {
                data["name"] = json!(name);
            }

            let user = auth.register(data).await.map_err(report)?;
            print_json(&user)?;
        }
        "forgot-password" => {
            let Some(email) = positional.first() else {
                bail!("Usage: sessionkit forgot-password <email>");
            };
            let response = auth
                .forgot_password(json!({"email": email}))
                .await
                .map_err(report)?;
            print_json(&response)?;
        }
        "reset-password" => {
            let (Some(token), Some(email)) = (positional.first(), positional.get(1)) else {
                bail!("Usage: sessionkit reset-password <token> <email>");
            };
            let password = rpassword::prompt_password("New password: ")?;
            let confirmation = rpassword::prompt_password("Confirm password: ")?;
            let response = auth
                .reset_password(json!({
                    "token": token,
                    "email": email,
                    "password": password,
                    "password_confirmation": confirmation,
                }))
                .await
                .map_err(report)?;
            print_json(&response)?;
        }
        "sweep" => {
            auth.cache().refresh().await;
            println!("{} live cache entries", auth.cache().len().await);
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("Unknown command: {}", other);
        }
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print per-field validation messages before handing the error back
fn report(error: ApiError) -> anyhow::Error {
    if let ApiError::Validation { errors, .. } = &error {
        for (field, reason) in errors {
            match reason {
                Value::String(reason) => eprintln!("  {}: {}", field, reason),
                other => eprintln!("  {}: {}", field, other),
            }
        }
    }
    error.into()
}
