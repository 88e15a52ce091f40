//! Run lifecycle controller.
//!
//! Owns start/stop orchestration of a single job run. Presentation layers read
//! the engine's events directly; the controller only forwards commands and
//! reports how the run ended.

use crate::engine::{EngineControl, FarmClient, JobEngine};
use crate::model::{JobSubmission, ProgressEvent, RunConfig, RunOutcome};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;

/// Commands emitted by presentation layers to control the running job.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Stop,
}

/// Internal handle for a running job task.
struct RunCtx {
    ctrl_tx: UnboundedSender<EngineControl>,
    handle: Option<tokio::task::JoinHandle<RunOutcome>>,
}

/// Spawn a new job run and return its control handle.
fn start_run<C: FarmClient>(
    client: Arc<C>,
    cfg: RunConfig,
    submission: JobSubmission,
    event_tx: UnboundedSender<ProgressEvent>,
) -> RunCtx {
    let (ctrl_tx, ctrl_rx) = tokio::sync::mpsc::unbounded_channel::<EngineControl>();
    let engine = JobEngine::new(client, cfg);
    let handle = tokio::spawn(async move { engine.run(submission, event_tx, ctrl_rx).await });
    RunCtx {
        ctrl_tx,
        handle: Some(handle),
    }
}

/// Run one job to its end, forwarding stop commands to the engine.
///
/// A closed command channel is not a stop: the run continues to completion.
pub(crate) async fn run_controller<C: FarmClient>(
    client: Arc<C>,
    cfg: RunConfig,
    submission: JobSubmission,
    event_tx: UnboundedSender<ProgressEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<RunOutcome> {
    // A stop is only observed at the next poll boundary, which can be a full
    // poll interval away.
    let patience = cfg.poll_interval + Duration::from_secs(1);
    let mut run_ctx = start_run(client, cfg, submission, event_tx);
    let mut commands_open = true;
    let mut stop_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if commands_open => {
                match cmd {
                    Some(UiCommand::Stop) => {
                        tracing::info!("stop requested");
                        let _ = run_ctx.ctrl_tx.send(EngineControl::Stop);
                        if stop_deadline.is_none() {
                            stop_deadline = Some(tokio::time::Instant::now() + patience);
                        }
                    }
                    None => commands_open = false,
                }
            }
            // Keep the JoinHandle in place until this branch wins so a losing
            // branch never drops it.
            joined = async {
                match run_ctx.handle.as_mut() {
                    Some(h) => h.await,
                    None => futures::future::pending().await,
                }
            } => {
                run_ctx.handle.take();
                return joined.context("job run task failed");
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = stop_deadline {
                    if tokio::time::Instant::now() >= deadline {
                        tracing::warn!("still waiting for the job run to observe the stop request");
                        stop_deadline = None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{running, tasks, ScriptedClient};
    use crate::model::TaskRunStatus;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn submission() -> JobSubmission {
        JobSubmission::new("farm-1", "queue-1", "list_software", BTreeMap::new()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn returns_the_run_outcome() {
        let client = Arc::new(
            ScriptedClient::new("job-c1")
                .with_statuses([Ok(running()), Ok(tasks(TaskRunStatus::Succeeded))])
                .with_logs(Ok("pkg 1.0 h0 chan\n".into())),
        );
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let outcome = run_controller(client, RunConfig::default(), submission(), event_tx, cmd_rx)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { ref job_id, .. } if job_id == "job-c1"));

        let mut last = None;
        while let Ok(ev) = event_rx.try_recv() {
            last = Some(ev);
        }
        assert!(matches!(last, Some(ProgressEvent::Completed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_command_reaches_the_engine() {
        let client = Arc::new(ScriptedClient::new("job-c2"));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(
            client.clone(),
            RunConfig::default(),
            submission(),
            event_tx,
            cmd_rx,
        ));

        while let Some(ev) = event_rx.recv().await {
            if matches!(&ev, ProgressEvent::Status(m) if m.starts_with("Job: ")) {
                cmd_tx.send(UiCommand::Stop).unwrap();
            }
            assert!(!ev.is_terminal());
        }
        let outcome = controller.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Stopped {
                job_id: Some("job-c2".into())
            }
        );
        assert_eq!(client.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_command_channel_does_not_stop_the_run() {
        let client = Arc::new(
            ScriptedClient::new("job-c3")
                .with_statuses([Ok(running()), Ok(tasks(TaskRunStatus::Failed))]),
        );
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
        drop(cmd_tx);
        let outcome = run_controller(client.clone(), RunConfig::default(), submission(), event_tx, cmd_rx)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(client.polls(), 2);
    }
}
