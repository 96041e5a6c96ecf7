use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info};

mod api;
mod child;
mod launch;
mod models;
mod port;
mod report;
mod severity;
mod supervisor;

use child::{ManagedChild, SupervisedChild};
use launch::LaunchPlan;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "arrear-notify")]
#[command(about = "Dev stack supervisor and arrear analytics for the Sathyabama Arrear Notification System", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API and the web dev server on the first free port
    DevAll {
        /// First port to try
        #[arg(long, env = "API_PORT", default_value_t = port::DEFAULT_START_PORT)]
        start_port: u16,
        #[arg(long, default_value_t = port::DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u16,
        /// Start uvicorn without --reload
        #[arg(long)]
        no_reload: bool,
        #[command(flatten)]
        process: ProcessArgs,
    },
    /// Run only the API server
    Backend {
        #[arg(long, env = "API_PORT", default_value_t = port::DEFAULT_START_PORT)]
        port: u16,
        #[arg(long)]
        reload: bool,
        #[command(flatten)]
        process: ProcessArgs,
    },
    /// Write a markdown arrear analytics report
    Report {
        #[command(flatten)]
        api: ApiArgs,
        /// Read students from a CSV export instead of the API
        #[arg(long)]
        students_csv: Option<PathBuf>,
        /// Read notifications from a CSV export instead of the API
        #[arg(long)]
        notifications_csv: Option<PathBuf>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Check the API health endpoint
    Health {
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Show a student's arrears and recent outreach
    Student {
        roll_no: String,
        #[command(flatten)]
        api: ApiArgs,
    },
}

#[derive(Args)]
struct ProcessArgs {
    /// Directory holding backend/, package.json and .venv
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,
    /// Python interpreter used to run uvicorn (defaults to the project venv)
    #[arg(long)]
    python: Option<PathBuf>,
    /// Seconds to wait after SIGTERM before killing children
    #[arg(long, default_value_t = supervisor::DEFAULT_GRACE.as_secs())]
    grace_secs: u64,
}

#[derive(Args)]
struct ApiArgs {
    #[arg(long, env = "VITE_API_BASE_URL")]
    api_base: Option<String>,
    #[arg(long, env = "API_PORT", default_value_t = port::DEFAULT_START_PORT)]
    api_port: u16,
}

impl ApiArgs {
    fn client(&self) -> api::ApiClient {
        api::ApiClient::new(api::resolve_api_base(self.api_base.as_deref(), self.api_port))
    }
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn supervise(children: Vec<ManagedChild>, grace_secs: u64) -> anyhow::Result<i32> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _signals = supervisor::forward_os_signals(tx)?;

    for child in children.iter() {
        info!(name = child.name(), pid = ?child.pid(), "supervising");
    }

    let mut supervisor = Supervisor::new(children, Duration::from_secs(grace_secs));
    let code = supervisor.run(rx).await?;
    debug!(state = ?supervisor.state(), code, "supervisor finished");
    Ok(code)
}

async fn dev_all(
    start_port: u16,
    max_attempts: u16,
    reload: bool,
    process: ProcessArgs,
) -> anyhow::Result<i32> {
    let selected = port::find_available_port(start_port, max_attempts).await?;
    let plan = LaunchPlan::new(
        selected,
        &process.project_dir,
        process.python.as_deref(),
        reload,
    );

    println!("{}", plan.banner());
    info!(port = plan.port, reload, "launching dev stack");

    let mut api = ManagedChild::spawn(&plan.api)?;
    let web = match ManagedChild::spawn(&plan.web) {
        Ok(web) => web,
        Err(e) => {
            supervisor::reap_child(&mut api).await;
            return Err(e.into());
        }
    };

    supervise(vec![api, web], process.grace_secs).await
}

async fn backend(port: u16, reload: bool, process: ProcessArgs) -> anyhow::Result<i32> {
    let spec = launch::api_command(
        port,
        &process.project_dir,
        process.python.as_deref(),
        reload,
    );
    println!("[backend] Starting API on port {port}");

    let api = ManagedChild::spawn(&spec)?;
    supervise(vec![api], process.grace_secs).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::DevAll {
            start_port,
            max_attempts,
            no_reload,
            process,
        } => {
            let code = dev_all(start_port, max_attempts, !no_reload, process).await?;
            std::process::exit(code);
        }
        Commands::Backend {
            port,
            reload,
            process,
        } => {
            let code = backend(port, reload, process).await?;
            std::process::exit(code);
        }
        Commands::Report {
            api: api_args,
            students_csv,
            notifications_csv,
            out,
        } => {
            let (source, students, notifications) =
                if students_csv.is_some() || notifications_csv.is_some() {
                    let students = match &students_csv {
                        Some(path) => api::load_students_csv(path)?,
                        None => Vec::new(),
                    };
                    let notifications = match &notifications_csv {
                        Some(path) => api::load_notifications_csv(path)?,
                        None => Vec::new(),
                    };
                    let source = students_csv
                        .iter()
                        .chain(notifications_csv.iter())
                        .map(|path| path.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    (source, students, notifications)
                } else {
                    let client = api_args.client();
                    let (students, notifications) =
                        tokio::try_join!(client.students(), client.notifications())
                            .context("failed to load analytics data")?;
                    (client.base().to_string(), students, notifications)
                };

            let today = chrono::Local::now().date_naive();
            let report = report::build_report(&source, today, &students, &notifications);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!(
                "Report written to {} ({} students, {} notifications).",
                out.display(),
                students.len(),
                notifications.len()
            );
        }
        Commands::Health { api: api_args } => {
            let client = api_args.client();
            let health = client
                .health()
                .await
                .with_context(|| format!("backend at {} is unreachable", client.base()))?;
            println!(
                "Backend {} (mode: {}, database connected: {})",
                if health.ok { "ok" } else { "degraded" },
                health.mode,
                if health.db_connected { "yes" } else { "no" }
            );
            if let Some(error) = health.db_error {
                println!("Database error: {error}");
            }
        }
        Commands::Student {
            roll_no,
            api: api_args,
        } => {
            let profile = api_args.client().student_profile(&roll_no).await?;
            print!("{}", report::render_profile(&profile));
        }
    }

    Ok(())
}
