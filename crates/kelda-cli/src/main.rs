//! kelda — the deployment CLI.
//!
//! `kelda run` shows the diff between the deployed and proposed blueprints,
//! asks for confirmation, and submits the new blueprint to the daemon.
//!
//! Exit codes: 0 success, 1 parse error, 2 connection error, 3 declined.

mod diff;
mod load;
mod priority;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

const EXIT_PARSE: u8 = 1;
const EXIT_CONNECT: u8 = 2;
const EXIT_DECLINED: u8 = 3;

#[derive(Parser)]
#[command(name = "kelda", about = "Deploy and inspect Kelda blueprints")]
struct Cli {
    /// Address of the daemon's API endpoint.
    #[arg(long, default_value = "http://127.0.0.1:9000")]
    host: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a blueprint file, or a directory of fragments applied in
    /// priority-prefix order.
    Run {
        path: PathBuf,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        force: bool,
    },

    /// Print the currently deployed blueprint.
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { path, force } => run(&cli.host, &path, force).await,
        Command::Show => show(&cli.host).await,
    }
}

async fn run(host: &str, path: &std::path::Path, force: bool) -> ExitCode {
    let proposed = match load::load_blueprint(path) {
        Ok(proposed) => proposed,
        Err(err) => {
            eprintln!("failed to load blueprint: {err:#}");
            return ExitCode::from(EXIT_PARSE);
        }
    };
    if let Err(err) = kelda_blueprint::Blueprint::from_json(&proposed) {
        eprintln!("invalid blueprint: {err}");
        return ExitCode::from(EXIT_PARSE);
    }

    let current = match fetch_blueprint(host).await {
        Ok(current) => current,
        Err(err) => {
            eprintln!("failed to reach the daemon at {host}: {err}");
            return ExitCode::from(EXIT_CONNECT);
        }
    };

    let current = if current.is_empty() { "{}".to_string() } else { current };
    match diff::diff_deployment(&current, &proposed) {
        Ok(rendered) if rendered.is_empty() => {
            println!("no change to deploy");
            return ExitCode::SUCCESS;
        }
        Ok(rendered) => {
            print!("{}", diff::colorize_diff(&rendered));
        }
        Err(err) => {
            eprintln!("failed to diff blueprints: {err}");
            return ExitCode::from(EXIT_PARSE);
        }
    }

    if !force {
        let stdin = std::io::stdin();
        let mut reader = stdin.lock();
        match diff::confirm(&mut reader, "deploy this change?") {
            Ok(true) => {}
            Ok(false) => {
                eprintln!("deployment cancelled");
                return ExitCode::from(EXIT_DECLINED);
            }
            Err(err) => {
                eprintln!("failed to read confirmation: {err}");
                return ExitCode::from(EXIT_DECLINED);
            }
        }
    }

    match push_blueprint(host, &proposed).await {
        Ok(()) => {
            println!("blueprint deployed");
            ExitCode::SUCCESS
        }
        Err(PushError::Rejected(reason)) => {
            eprintln!("daemon rejected the blueprint: {reason}");
            ExitCode::from(EXIT_PARSE)
        }
        Err(PushError::Connect(err)) => {
            eprintln!("failed to reach the daemon at {host}: {err}");
            ExitCode::from(EXIT_CONNECT)
        }
    }
}

async fn show(host: &str) -> ExitCode {
    match fetch_blueprint(host).await {
        Ok(blueprint) if blueprint.is_empty() => {
            println!("no blueprint deployed");
            ExitCode::SUCCESS
        }
        Ok(blueprint) => {
            match serde_json::from_str::<serde_json::Value>(&blueprint)
                .and_then(|v| serde_json::to_string_pretty(&v))
            {
                Ok(pretty) => println!("{pretty}"),
                Err(_) => println!("{blueprint}"),
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to reach the daemon at {host}: {err}");
            ExitCode::from(EXIT_CONNECT)
        }
    }
}

async fn fetch_blueprint(host: &str) -> Result<String, reqwest::Error> {
    let response = reqwest::get(format!("{host}/api/blueprint")).await?;
    response.error_for_status()?.text().await
}

enum PushError {
    Rejected(String),
    Connect(reqwest::Error),
}

async fn push_blueprint(host: &str, blueprint: &str) -> Result<(), PushError> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{host}/api/blueprint"))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(blueprint.to_string())
        .send()
        .await
        .map_err(PushError::Connect)?;

    if response.status().is_success() {
        return Ok(());
    }
    let reason = response
        .text()
        .await
        .unwrap_or_else(|err| err.to_string());
    Err(PushError::Rejected(reason))
}
