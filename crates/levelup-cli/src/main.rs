//! LevelUp CLI
//!
//! Signs in against the LevelUp backend and runs voice interview calls.

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use levelup_client::{AuthSession, AuthStore, AuthTokens, BackendClient, ClientError};
use levelup_session::{
    create_router, AppState, CallStatus, Config, EngineService, GatewayEngine, Redirector,
    SessionController, SessionEvent, StartParams,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep_until, Instant};
use tracing_subscriber::EnvFilter;

/// How long to wait for the post-call redirect after the call ended.
const REDIRECT_GRACE: Duration = Duration::from_secs(5);

/// LevelUp - practice interviews with a voice assistant
#[derive(Parser, Debug)]
#[command(name = "levelup")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: levelup.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the access token
    Login {
        /// Account name
        username: String,
        /// Password (prompted for when omitted)
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the stored access token
    Logout,
    /// Create an account
    Signup {
        /// Account name
        username: String,
        /// Email address
        email: String,
        /// Password (prompted for when omitted)
        #[arg(long)]
        password: Option<String>,
    },
    /// List your interviews
    Interviews,
    /// Run a voice interview call
    Interview {
        /// Interview to practice (not needed with --mock)
        #[arg(value_name = "ID", required_unless_present = "mock")]
        id: Option<i64>,
        /// Open mock interview; the assistant creates the interview record
        #[arg(long)]
        mock: bool,
        /// Port for the local control API
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::debug!(config = ?args.config, "Config file");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let cwd = std::env::current_dir()?;
    let mut auth = open_auth(&config, &cwd)?;

    match args.command {
        Command::Login { username, password } => {
            let password = password_or_prompt(password)?;
            let claims = auth.login(&username, &password).await.map_err(|e| {
                anyhow::anyhow!("{e}\n\nSuggestion: Check your username and password")
            })?;
            println!("Logged in as {}", claims.display_name());
            Ok(())
        }
        Command::Logout => {
            auth.logout()?;
            println!("Logged out");
            Ok(())
        }
        Command::Signup {
            username,
            email,
            password,
        } => {
            let password = password_or_prompt(password)?;
            auth.register(&username, &email, &password).await?;
            println!("Account created. Sign in with: levelup login {username}");
            Ok(())
        }
        Command::Interviews => list_interviews(&config, &mut auth).await,
        Command::Interview { id, mock, port } => {
            let port = port.unwrap_or(config.api_port);
            run_interview(config, &mut auth, id, mock, port).await
        }
    }
}

/// Loads configuration from the specified path or default location.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Config::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Config::load().map_err(|e| anyhow::anyhow!("{e}")),
    }
}

fn open_auth(config: &Config, cwd: &Path) -> anyhow::Result<AuthSession> {
    let store = AuthStore::new(config.auth_path(cwd));
    AuthSession::open(&config.backend.base_url, store).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read stored credentials: {e}\n\nSuggestion: Run 'levelup logout' and sign in again"
        )
    })
}

/// Returns valid credentials or explains how to get them.
fn require_login(auth: &mut AuthSession) -> anyhow::Result<AuthTokens> {
    auth.ensure_valid(Utc::now()).map_err(|e| match e {
        ClientError::NotLoggedIn | ClientError::TokenExpired => {
            anyhow::anyhow!("{e}\n\nSuggestion: Run 'levelup login <USERNAME>' first")
        }
        other => anyhow::anyhow!("{other}"),
    })
}

fn password_or_prompt(password: Option<String>) -> anyhow::Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    print!("Password: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }
    Ok(password)
}

async fn list_interviews(config: &Config, auth: &mut AuthSession) -> anyhow::Result<()> {
    let tokens = require_login(auth)?;
    let backend = BackendClient::new(&config.backend.base_url, tokens);

    let mut interviews = match backend.list_interviews().await {
        Ok(interviews) => interviews,
        Err(e) => return Err(auth.handle_error(e).into()),
    };
    interviews.sort_by_key(|interview| std::cmp::Reverse(interview.created_at));

    if interviews.is_empty() {
        println!("No interviews yet. Try: levelup interview --mock");
        return Ok(());
    }

    for interview in &interviews {
        println!(
            "#{:<5} {:<28} {:<12} {:<10} {} questions  ({})",
            interview.id,
            interview.role.as_deref().unwrap_or("-"),
            interview.interview_type.as_deref().unwrap_or("-"),
            interview.level.as_deref().unwrap_or("-"),
            interview.questions().len(),
            interview.created_at.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

/// Runs one call and follows it until it is over.
#[allow(clippy::too_many_lines)]
async fn run_interview(
    config: Config,
    auth: &mut AuthSession,
    id: Option<i64>,
    mock: bool,
    port: u16,
) -> anyhow::Result<()> {
    let tokens = require_login(auth)?;
    let claims = tokens.claims()?;
    let assistant_id = config.assistant_id(mock)?.to_string();
    if config.engine.public_key.trim().is_empty() {
        anyhow::bail!(
            "engine.publicKey is not set\n\nSuggestion: Set engine.publicKey in your levelup.json or export LEVELUP_ENGINE_PUBLIC_KEY"
        );
    }

    let backend = BackendClient::new(&config.backend.base_url, tokens.clone());

    let params = match (mock, id) {
        (false, Some(id)) => {
            let interview = match backend.get_interview(id).await {
                Ok(interview) => interview,
                Err(e) => return Err(auth.handle_error(e).into()),
            };
            let questions = interview.questions();
            println!(
                "Interview #{}: {} ({} questions)",
                interview.id,
                interview.role.as_deref().unwrap_or("practice"),
                questions.len()
            );
            StartParams::interview(&questions)?
        }
        (false, None) => anyhow::bail!("An interview ID is required unless --mock is given"),
        (true, _) => {
            println!("Mock interview as {}", claims.display_name());
            StartParams::mock(claims.username.as_deref(), &tokens.access_token)
        }
    };

    let gateway_url = config.engine.gateway_url.clone();
    let public_key = config.engine.public_key.clone();
    let engine = EngineService::new(move || {
        Arc::new(GatewayEngine::new(gateway_url.clone(), public_key.clone()))
    });

    let redirector = config.session.redirect_enabled.then(|| {
        Redirector::new(Arc::new(backend), config.session.redirect_signal.clone())
    });
    let controller = SessionController::new(engine, config.session.clone(), redirector);
    controller.attach_listeners().await;

    // Local control API
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let state = AppState::new(config, controller.clone(), &assistant_id, params.clone());
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port"
        )
    })?;
    let router = create_router(state);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });
    println!("Session API running on http://{addr} (events on ws://{addr}/ws)");

    let mut events = controller.subscribe();
    if let Err(e) = controller.start_session(&assistant_id, params).await {
        controller.shutdown().await;
        server_handle.abort();
        return Err(anyhow::anyhow!("{}", e.user_message()));
    }
    println!("Press Ctrl+C to hang up");

    let mut finish_by: Option<Instant> = None;
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C");
                let status = controller.session().await.status;
                if status.can_end() {
                    println!();
                    println!("Hanging up...");
                    if let Err(e) = controller.end_session().await {
                        tracing::warn!(error = %e, "Failed to end call");
                    }
                } else {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::StatusChanged(change)) => {
                        print_status_change(change.to);
                        match change.to {
                            CallStatus::Idle => {
                                finish_by = Some(Instant::now() + REDIRECT_GRACE);
                            }
                            CallStatus::Error => {
                                failure = change.last_error;
                                break;
                            }
                            _ => {}
                        }
                    }
                    Ok(SessionEvent::Tick(tick)) => {
                        if let Err(e) = show_duration(&mut io::stdout(), &tick.formatted) {
                            tracing::debug!(error = %e, "Cannot update the duration line");
                        }
                    }
                    Ok(SessionEvent::Navigate(navigation)) => {
                        println!("Interview saved: {}", navigation.path);
                        println!("View it with: levelup interviews");
                        break;
                    }
                    Ok(SessionEvent::Error(_) | SessionEvent::Connected(_)) => {}
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!(missed = n, "Event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            () = sleep_until(finish_by.unwrap_or_else(Instant::now)), if finish_by.is_some() => {
                break;
            }
        }
    }

    controller.shutdown().await;
    server_handle.abort();

    match failure {
        Some(message) => anyhow::bail!("{message}"),
        None => Ok(()),
    }
}

fn print_status_change(status: CallStatus) {
    match status {
        CallStatus::Connecting => println!("Connecting..."),
        CallStatus::Active => println!("Call connected"),
        CallStatus::Ending => println!(),
        CallStatus::Idle => {
            println!();
            println!("Call ended");
        }
        CallStatus::Error => println!(),
    }
}

/// Rewrites the duration line in place.
fn show_duration(out: &mut impl Write, formatted: &str) -> io::Result<()> {
    write!(out, "\r  Duration: {formatted}")?;
    out.flush()
}
