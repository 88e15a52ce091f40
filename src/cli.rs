use crate::connection;
use crate::engine::DeadlineCli;
use crate::model::{
    JobSubmission, ProgressEvent, RunConfig, RunOutcome, CONDA_CHANNEL_PARAMETER,
};
use crate::orchestrator::{process_run_completion, run_controller, UiCommand};
use crate::settings::{id_from_display, Settings};
use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Exit status after a second Ctrl-C (128 + SIGINT).
const EXIT_INTERRUPTED: i32 = 130;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// Optional output sink; `None` in silent mode.
struct Output {
    tx: Option<mpsc::UnboundedSender<OutputLine>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Output {
    fn new(silent: bool) -> Self {
        if silent {
            return Self {
                tx: None,
                handle: None,
            };
        }
        let (tx, handle) = spawn_output_writer();
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn out(&self, msg: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(OutputLine::Stdout(msg.into()));
        }
    }

    fn err(&self, msg: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(OutputLine::Stderr(msg.into()));
        }
    }

    async fn finish(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "deadline-software-cli",
    version,
    about = "List the software available to an AWS Deadline Cloud queue by running a job bundle"
)]
pub struct Cli {
    /// Farm to submit to (defaults to the last used farm)
    #[arg(long)]
    pub farm_id: Option<String>,

    /// Queue to submit to (defaults to the last used queue)
    #[arg(long)]
    pub queue_id: Option<String>,

    /// Job bundle directory to submit
    #[arg(long, default_value = "list_software")]
    pub bundle: PathBuf,

    /// Conda channel passed to the bundle as CondaChannel
    #[arg(long)]
    pub conda_channel: Option<String>,

    /// Extra job parameter as KEY=VALUE (repeatable)
    #[arg(long = "parameter", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub parameters: Vec<(String, String)>,

    /// Path or name of the Deadline Cloud CLI executable
    #[arg(long, default_value = "deadline")]
    pub deadline_bin: PathBuf,

    /// Delay between job status checks
    #[arg(long, default_value = "5s")]
    pub poll_interval: humantime::Duration,

    /// Give up waiting for the job after this long
    #[arg(long, default_value = "5m")]
    pub max_wait: humantime::Duration,

    /// Wait after task completion before fetching logs
    #[arg(long, default_value = "5s")]
    pub drain_delay: humantime::Duration,

    /// Timeout for fetching job logs
    #[arg(long, default_value = "60s")]
    pub log_timeout: humantime::Duration,

    /// Consecutive failed status checks tolerated before failing the run
    #[arg(long, default_value_t = 0)]
    pub status_retries: u32,

    /// Print JSON result and exit
    #[arg(long)]
    pub json: bool,

    /// Print the text summary; this is the default output mode
    /// and the flag only makes the choice explicit
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Export found packages as CSV (file or directory)
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Export found packages as JSON (file or directory)
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Save the raw job log to this file
    #[arg(long)]
    pub raw_log: Option<PathBuf>,

    /// List available farms and exit
    #[arg(long)]
    pub list_farms: bool,

    /// List queues of the selected farm and exit
    #[arg(long)]
    pub list_queues: bool,

    /// Check connectivity to Deadline Cloud and exit
    #[arg(long)]
    pub check_connection: bool,

    /// Timeout for the connectivity check
    #[arg(long, default_value = "30s")]
    pub connection_timeout: humantime::Duration,

    /// Use --save-settings true or --save-settings false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub save_settings: bool,

    /// Log filter (env-filter syntax); RUST_LOG takes precedence
    #[arg(long, default_value = "warn")]
    pub log: String,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{s}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }
    if args.json && args.text {
        return Err(anyhow::anyhow!("--json and --text are mutually exclusive"));
    }

    if args.check_connection {
        return run_check_connection(&args).await;
    }
    if args.list_farms {
        return run_list_farms(&args).await;
    }
    if args.list_queues {
        return run_list_queues(&args).await;
    }

    run_job(args).await
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> RunConfig {
    RunConfig {
        poll_interval: Duration::from(args.poll_interval),
        max_wait: Duration::from(args.max_wait),
        drain_delay: Duration::from(args.drain_delay),
        log_timeout: Duration::from(args.log_timeout),
        status_retries: args.status_retries,
    }
}

fn build_client(args: &Cli) -> DeadlineCli {
    DeadlineCli::new(args.deadline_bin.clone()).with_log_timeout(Duration::from(args.log_timeout))
}

/// Build the job submission from CLI arguments, falling back to saved settings.
pub fn build_submission(args: &Cli, settings: &Settings) -> Result<JobSubmission> {
    let farm_id = args
        .farm_id
        .as_deref()
        .or(settings.farm_id.as_deref())
        .map(id_from_display)
        .context("no farm selected; pass --farm-id (see --list-farms)")?
        .to_string();
    let queue_id = args
        .queue_id
        .as_deref()
        .or(settings.queue_id.as_deref())
        .map(id_from_display)
        .context("no queue selected; pass --queue-id (see --list-queues)")?
        .to_string();
    if !args.bundle.is_dir() {
        anyhow::bail!("job bundle directory not found: {}", args.bundle.display());
    }

    let channel = args
        .conda_channel
        .clone()
        .unwrap_or_else(|| settings.conda_channel_or_default().to_string());
    let mut parameters = BTreeMap::new();
    parameters.insert(CONDA_CHANNEL_PARAMETER.to_string(), channel);
    for (key, value) in &args.parameters {
        parameters.insert(key.clone(), value.clone());
    }

    Ok(JobSubmission::new(
        farm_id,
        queue_id,
        args.bundle.clone(),
        parameters,
    )?)
}

fn settings_for(submission: &JobSubmission) -> Settings {
    Settings {
        farm_id: Some(submission.farm_id().to_string()),
        queue_id: Some(submission.queue_id().to_string()),
        conda_channel: submission
            .parameters()
            .get(CONDA_CHANNEL_PARAMETER)
            .cloned(),
    }
}

async fn run_check_connection(args: &Cli) -> Result<()> {
    let output = Output::new(args.silent);
    let client = build_client(args);
    let status =
        connection::check_connection(&client, Duration::from(args.connection_timeout)).await;
    let warning = if status.is_connected() {
        connection::check_cli_version(&client).await
    } else {
        None
    };

    if args.json {
        let out = serde_json::json!({
            "connected": status.is_connected(),
            "message": status.message(),
            "version_warning": warning,
        });
        output.out(serde_json::to_string_pretty(&out)?);
    } else {
        output.out(status.message());
        if let Some(w) = warning.as_deref() {
            output.err(format!("Warning: {w}"));
        }
    }
    output.finish().await;

    match status {
        connection::ConnectionStatus::Connected { .. } => Ok(()),
        connection::ConnectionStatus::Error(detail) => {
            Err(anyhow::anyhow!("Connection Error: {detail}"))
        }
        other => Err(anyhow::anyhow!("{}", other.message())),
    }
}

async fn run_list_farms(args: &Cli) -> Result<()> {
    let client = build_client(args);
    let farms = client.list_farms().await?;
    let output = Output::new(args.silent);
    if args.json {
        output.out(serde_json::to_string_pretty(&farms)?);
    } else {
        let summary = crate::text_summary::build_listing(
            "farms",
            farms.iter().map(|f| (f.id.as_str(), f.name.as_str())),
        );
        for line in summary.lines {
            output.out(line);
        }
    }
    output.finish().await;
    Ok(())
}

async fn run_list_queues(args: &Cli) -> Result<()> {
    let settings = Settings::load();
    let farm_id = args
        .farm_id
        .as_deref()
        .or(settings.farm_id.as_deref())
        .map(id_from_display)
        .context("no farm selected; pass --farm-id (see --list-farms)")?
        .to_string();
    let client = build_client(args);
    let queues = client.list_queues(&farm_id).await?;
    let output = Output::new(args.silent);
    if args.json {
        output.out(serde_json::to_string_pretty(&queues)?);
    } else {
        let summary = crate::text_summary::build_listing(
            "queues",
            queues.iter().map(|q| (q.id.as_str(), q.name.as_str())),
        );
        for line in summary.lines {
            output.out(line);
        }
    }
    output.finish().await;
    Ok(())
}

/// Submit the bundle, follow the job, then extract and present its records.
async fn run_job(args: Cli) -> Result<()> {
    let settings = Settings::load();
    let submission = build_submission(&args, &settings)?;
    let cfg = build_config(&args);
    let client = Arc::new(build_client(&args));
    let output = Output::new(args.silent);

    if let Some(w) = connection::check_cli_version(&client).await {
        tracing::warn!("{w}");
        output.err(format!("Warning: {w}"));
    }

    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // First Ctrl-C stops monitoring at the next poll; a second one exits even
    // if a CLI call is hung. The job itself keeps running on the farm.
    let signal_tx = cmd_tx.clone();
    let notice_tx = output.tx.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        let _ = signal_tx.send(UiCommand::Stop);
        if let Some(tx) = &notice_tx {
            let _ = tx.send(OutputLine::Stderr(
                "Stopping after the current status check; press Ctrl-C again to exit now".into(),
            ));
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(EXIT_INTERRUPTED);
        }
    });

    let controller = tokio::spawn(run_controller(
        client,
        cfg.clone(),
        submission.clone(),
        evt_tx,
        cmd_rx,
    ));

    let mut pct = 0u8;
    while let Some(ev) = evt_rx.recv().await {
        if let ProgressEvent::JobIdAssigned(_) = &ev {
            if args.save_settings {
                match settings_for(&submission).save() {
                    Ok(p) => tracing::debug!(path = %p.display(), "settings saved"),
                    Err(e) => tracing::warn!(error = %e, "could not save settings"),
                }
            }
        }
        if args.json {
            output.err(serde_json::to_string(&ev)?);
            continue;
        }
        match ev {
            ProgressEvent::Progress(p) => pct = p,
            ProgressEvent::Status(msg) => output.err(format!("[{pct:>3}%] {msg}")),
            ProgressEvent::Failed(failure) => {
                output.err(format!("[{pct:>3}%] Error: {}", failure.reason()))
            }
            ProgressEvent::JobIdAssigned(_) | ProgressEvent::Completed(_) => {}
        }
    }

    drop(cmd_tx);
    let outcome = controller.await.context("controller task failed")?;
    signal_task.abort();

    let res = match outcome {
        Ok(outcome) => present_outcome(&args, &cfg, &output, outcome),
        Err(e) => Err(e),
    };
    output.finish().await;
    res
}

fn present_outcome(
    args: &Cli,
    cfg: &RunConfig,
    output: &Output,
    outcome: RunOutcome,
) -> Result<()> {
    match outcome {
        RunOutcome::Completed { job_id, raw_log } => {
            let debug_path = crate::storage::default_debug_log_path();
            let processed = process_run_completion(args, &raw_log, debug_path.as_deref());
            for msg in &processed.messages {
                output.err(msg.clone());
            }

            if args.json {
                let out = serde_json::json!({
                    "job_id": &job_id,
                    "packages": &processed.records,
                    "raw_log": &processed.raw_log_path,
                    "config": cfg,
                });
                output.out(serde_json::to_string_pretty(&out)?);
            } else {
                let summary = crate::text_summary::build_text_summary(&job_id, &processed.records);
                for line in summary.lines {
                    output.out(line);
                }
            }

            if processed.records.is_empty() {
                return Err(anyhow::anyhow!(
                    "no software packages found in the output of job {job_id}"
                ));
            }
            Ok(())
        }
        RunOutcome::Failed { job_id, failure } => match job_id {
            Some(id) => Err(anyhow::Error::new(failure).context(format!("job {id} failed"))),
            None => Err(anyhow::Error::new(failure).context("job submission failed")),
        },
        RunOutcome::Stopped { job_id } => match job_id {
            Some(id) => Err(anyhow::anyhow!(
                "stopped monitoring job {id}; it may still be running on the farm"
            )),
            None => Err(anyhow::anyhow!("stopped before the job was submitted")),
        },
    }
}
