mod deadline;

pub use deadline::DeadlineCli;

use crate::error::{ClientError, RunFailure};
use crate::model::{
    JobHandle, JobPhase, JobStatusSnapshot, JobSubmission, ProgressEvent, RunConfig, RunOutcome,
};
use crate::progress::{self, ProgressTracker};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// The remote farm operations a job run depends on.
pub trait FarmClient: Send + Sync + 'static {
    fn submit(
        &self,
        submission: &JobSubmission,
    ) -> impl Future<Output = Result<JobHandle, ClientError>> + Send;

    fn get_status(
        &self,
        job: &JobHandle,
        farm_id: &str,
        queue_id: &str,
    ) -> impl Future<Output = Result<JobStatusSnapshot, ClientError>> + Send;

    fn get_logs(&self, job: &JobHandle) -> impl Future<Output = Result<String, ClientError>> + Send;
}

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Stop monitoring. Observed at the next poll boundary; an in-flight
    /// status query or sleep finishes first.
    Stop,
}

/// Drives one job through submit, poll and log retrieval.
pub struct JobEngine<C> {
    client: Arc<C>,
    cfg: RunConfig,
}

enum PollOutcome {
    Succeeded,
    Failed(RunFailure),
    Stopped,
}

impl<C: FarmClient> JobEngine<C> {
    pub fn new(client: Arc<C>, cfg: RunConfig) -> Self {
        Self { client, cfg }
    }

    pub async fn run(
        self,
        submission: JobSubmission,
        event_tx: mpsc::UnboundedSender<ProgressEvent>,
        mut control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> RunOutcome {
        let mut run = RunState::new(event_tx);

        run.enter(JobPhase::Submitting);
        run.progress(progress::SUBMITTING);
        run.status("Submitting job to AWS Deadline Cloud...");

        let job = match self.client.submit(&submission).await {
            Ok(job) => job,
            Err(e) => return run.fail(RunFailure::Submission(e.to_string())),
        };

        run.enter(JobPhase::AwaitingJobId);
        tracing::info!(job_id = %job, farm_id = submission.farm_id(), "job submitted");
        run.job = Some(job.clone());
        run.emit(ProgressEvent::JobIdAssigned(job.job_id.clone()));
        run.progress(progress::SUBMITTED);
        run.status(format!("Job submitted: {job}"));

        run.enter(JobPhase::Polling);
        run.status("Waiting for job to complete...");
        match self
            .poll_until_done(&submission, &job, &mut run, &mut control_rx)
            .await
        {
            PollOutcome::Succeeded => {}
            PollOutcome::Failed(failure) => return run.fail(failure),
            PollOutcome::Stopped => return run.stopped(),
        }

        // Logs lag behind task completion on the farm side.
        run.enter(JobPhase::DrainDelay);
        run.status("Tasks completed, waiting for logs...");
        tokio::time::sleep(self.cfg.drain_delay).await;

        run.enter(JobPhase::FetchingLogs);
        run.status("Retrieving job logs...");
        match self.client.get_logs(&job).await {
            Ok(text) if !text.trim().is_empty() => run.complete(text),
            Ok(_) => run.fail(RunFailure::LogRetrieval(
                "Failed to retrieve job output: logs were empty".into(),
            )),
            Err(e) => run.fail(RunFailure::LogRetrieval(e.to_string())),
        }
    }

    fn timeout(&self) -> RunFailure {
        RunFailure::Timeout {
            waited_secs: self.cfg.max_wait.as_secs(),
        }
    }

    async fn poll_until_done(
        &self,
        submission: &JobSubmission,
        job: &JobHandle,
        run: &mut RunState,
        control_rx: &mut mpsc::UnboundedReceiver<EngineControl>,
    ) -> PollOutcome {
        let start = Instant::now();
        let mut failed_queries = 0u32;

        loop {
            if stop_requested(control_rx) {
                return PollOutcome::Stopped;
            }
            let Some(remaining) = self
                .cfg
                .max_wait
                .checked_sub(start.elapsed())
                .filter(|r| !r.is_zero())
            else {
                return PollOutcome::Failed(self.timeout());
            };

            // A hung query may not outlive the overall budget.
            let query = self
                .client
                .get_status(job, submission.farm_id(), submission.queue_id());
            let Ok(result) = tokio::time::timeout(remaining, query).await else {
                tracing::warn!(job_id = %job, "status query still running when the wait budget ran out");
                return PollOutcome::Failed(self.timeout());
            };

            match result {
                Ok(snapshot) => {
                    failed_queries = 0;
                    let JobStatusSnapshot {
                        lifecycle_status,
                        task_run_status,
                    } = snapshot;
                    tracing::debug!(
                        job_id = %job,
                        lifecycle = lifecycle_status.as_str(),
                        tasks = task_run_status.as_str(),
                        "status poll"
                    );
                    run.status(format!(
                        "Job: {}, Tasks: {}...",
                        lifecycle_status.as_str(),
                        task_run_status.as_str()
                    ));

                    if task_run_status.is_success() {
                        return PollOutcome::Succeeded;
                    }
                    if task_run_status.is_terminal_failure() {
                        return PollOutcome::Failed(RunFailure::TaskFailure(format!(
                            "Tasks {}",
                            task_run_status.as_str().to_lowercase()
                        )));
                    }
                    if lifecycle_status.is_terminal_failure() {
                        return PollOutcome::Failed(RunFailure::TaskFailure(format!(
                            "Job {}",
                            lifecycle_status.as_str().to_lowercase()
                        )));
                    }
                }
                Err(e) => {
                    failed_queries += 1;
                    if failed_queries > self.cfg.status_retries {
                        return PollOutcome::Failed(RunFailure::StatusQuery(e.to_string()));
                    }
                    tracing::warn!(job_id = %job, error = %e, attempt = failed_queries, "status query failed");
                    run.status(format!(
                        "Status check failed ({failed_queries}/{}), retrying: {e}",
                        self.cfg.status_retries
                    ));
                }
            }

            run.progress(progress::polling_progress(start.elapsed(), self.cfg.max_wait));
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }
}

// Drains pending control messages without waiting.
fn stop_requested(control_rx: &mut mpsc::UnboundedReceiver<EngineControl>) -> bool {
    let mut stop = false;
    while let Ok(msg) = control_rx.try_recv() {
        match msg {
            EngineControl::Stop => stop = true,
        }
    }
    stop
}

/// Per-run state: current phase, progress high-water mark, event sink.
struct RunState {
    phase: JobPhase,
    progress: ProgressTracker,
    job: Option<JobHandle>,
    event_tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl RunState {
    fn new(event_tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            phase: JobPhase::Idle,
            progress: ProgressTracker::default(),
            job: None,
            event_tx,
        }
    }

    fn enter(&mut self, next: JobPhase) {
        debug_assert!(
            !self.phase.is_terminal(),
            "no transition leaves a terminal phase"
        );
        tracing::trace!(from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
    }

    fn emit(&self, ev: ProgressEvent) {
        debug_assert!(
            ev.is_terminal() || !self.phase.is_terminal(),
            "nothing follows a terminal event"
        );
        // The receiver may be gone; the run still finishes.
        let _ = self.event_tx.send(ev);
    }

    fn status(&self, msg: impl Into<String>) {
        self.emit(ProgressEvent::Status(msg.into()));
    }

    fn progress(&mut self, pct: u8) {
        let pct = self.progress.advance(pct);
        self.emit(ProgressEvent::Progress(pct));
    }

    fn job_id(&self) -> Option<String> {
        self.job.as_ref().map(|j| j.job_id.clone())
    }

    fn fail(&mut self, failure: RunFailure) -> RunOutcome {
        self.enter(JobPhase::Failed);
        tracing::warn!(job_id = ?self.job_id(), reason = %failure, "job run failed");
        self.emit(ProgressEvent::Failed(failure.clone()));
        RunOutcome::Failed {
            job_id: self.job_id(),
            failure,
        }
    }

    fn complete(&mut self, raw_log: String) -> RunOutcome {
        self.progress(progress::COMPLETE);
        self.status("Job completed successfully");
        self.enter(JobPhase::Succeeded);
        self.emit(ProgressEvent::Completed(raw_log.clone()));
        RunOutcome::Completed {
            job_id: self.job_id().unwrap_or_default(),
            raw_log,
        }
    }

    fn stopped(&mut self) -> RunOutcome {
        tracing::info!(job_id = ?self.job_id(), "job monitoring stopped");
        self.status("Job monitoring stopped");
        RunOutcome::Stopped {
            job_id: self.job_id(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{running, tasks, ScriptedClient};
    use super::*;
    use crate::model::{LifecycleStatus, TaskRunStatus};
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const LOG: &str =
        "[2025-12-03T21:49:43.773000+00:00] blender 3.6.23 481731fa_0 deadline-cloud\n";

    fn submission() -> JobSubmission {
        JobSubmission::new("farm-1", "queue-1", "list_software", BTreeMap::new()).unwrap()
    }

    async fn run_to_end(client: Arc<ScriptedClient>) -> (RunOutcome, Vec<ProgressEvent>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let engine = JobEngine::new(client, RunConfig::default());
        let outcome = engine.run(submission(), event_tx, ctrl_rx).await;
        let mut events = Vec::new();
        while let Ok(ev) = event_rx.try_recv() {
            events.push(ev);
        }
        (outcome, events)
    }

    fn progress_values(events: &[ProgressEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    fn terminal_count(events: &[ProgressEvent]) -> usize {
        events.iter().filter(|e| e.is_terminal()).count()
    }

    #[tokio::test(start_paused = true)]
    async fn success_path_completes_once_with_monotonic_progress() {
        let client = Arc::new(
            ScriptedClient::new("job-abc123")
                .with_statuses([Ok(running()), Ok(running()), Ok(tasks(TaskRunStatus::Succeeded))])
                .with_logs(Ok(LOG.to_string())),
        );
        let started = Instant::now();
        let (outcome, events) = run_to_end(client.clone()).await;

        assert_eq!(
            outcome,
            RunOutcome::Completed {
                job_id: "job-abc123".into(),
                raw_log: LOG.into()
            }
        );
        assert_eq!(terminal_count(&events), 1);
        assert_eq!(events.last(), Some(&ProgressEvent::Completed(LOG.into())));
        assert!(events.contains(&ProgressEvent::JobIdAssigned("job-abc123".into())));

        let pct = progress_values(&events);
        assert!(pct.windows(2).all(|w| w[0] <= w[1]), "{pct:?}");
        assert_eq!(pct.first(), Some(&10));
        assert_eq!(pct.last(), Some(&100));

        assert_eq!(client.polls(), 3);
        assert_eq!(client.log_fetches.load(Ordering::SeqCst), 1);
        // Two poll sleeps plus the drain delay.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn event_order_follows_the_lifecycle() {
        let client = Arc::new(
            ScriptedClient::new("job-1")
                .with_statuses([Ok(tasks(TaskRunStatus::Succeeded))])
                .with_logs(Ok(LOG.to_string())),
        );
        let (_, events) = run_to_end(client).await;
        let expected = vec![
            ProgressEvent::Progress(10),
            ProgressEvent::Status("Submitting job to AWS Deadline Cloud...".into()),
            ProgressEvent::JobIdAssigned("job-1".into()),
            ProgressEvent::Progress(30),
            ProgressEvent::Status("Job submitted: job-1".into()),
            ProgressEvent::Status("Waiting for job to complete...".into()),
            ProgressEvent::Status("Job: CREATE_COMPLETE, Tasks: SUCCEEDED...".into()),
            ProgressEvent::Status("Tasks completed, waiting for logs...".into()),
            ProgressEvent::Status("Retrieving job logs...".into()),
            ProgressEvent::Progress(100),
            ProgressEvent::Status("Job completed successfully".into()),
            ProgressEvent::Completed(LOG.into()),
        ];
        assert_eq!(events, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn task_failure_stops_polling_immediately() {
        for (k, terminal) in [(1usize, TaskRunStatus::Failed), (4, TaskRunStatus::Canceled)] {
            let mut script: Vec<_> = (0..k - 1).map(|_| Ok(running())).collect();
            script.push(Ok(tasks(terminal.clone())));
            let client = Arc::new(ScriptedClient::new("job-f").with_statuses(script));
            let (outcome, events) = run_to_end(client.clone()).await;

            let expected = RunFailure::TaskFailure(format!(
                "Tasks {}",
                terminal.as_str().to_lowercase()
            ));
            assert_eq!(
                outcome,
                RunOutcome::Failed {
                    job_id: Some("job-f".into()),
                    failure: expected.clone()
                }
            );
            assert_eq!(client.polls(), k);
            assert_eq!(terminal_count(&events), 1);
            assert_eq!(events.last(), Some(&ProgressEvent::Failed(expected)));
            assert_eq!(client.log_fetches.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_failure_fails_the_run() {
        let client = Arc::new(ScriptedClient::new("job-l").with_statuses([
            Ok(running()),
            Ok(JobStatusSnapshot::new(
                LifecycleStatus::CreateFailed,
                TaskRunStatus::Unknown,
            )),
        ]));
        let (outcome, _) = run_to_end(client.clone()).await;
        match outcome {
            RunOutcome::Failed { failure, .. } => {
                assert_eq!(failure, RunFailure::TaskFailure("Job create_failed".into()))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(client.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_sixty_polls() {
        let client = Arc::new(ScriptedClient::new("job-slow"));
        let started = Instant::now();
        let (outcome, events) = run_to_end(client.clone()).await;

        assert_eq!(
            outcome,
            RunOutcome::Failed {
                job_id: Some("job-slow".into()),
                failure: RunFailure::Timeout { waited_secs: 300 }
            }
        );
        assert_eq!(client.polls(), 60);
        assert_eq!(started.elapsed(), Duration::from_secs(300));
        assert_eq!(terminal_count(&events), 1);

        let pct = progress_values(&events);
        assert!(pct.windows(2).all(|w| w[0] <= w[1]));
        assert!(pct.iter().all(|p| *p <= 90));
        assert_eq!(pct.last(), Some(&89));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_status_query_is_bounded_by_the_wait_budget() {
        let client = Arc::new(ScriptedClient::new("job-hang").with_hanging_status());
        let started = Instant::now();
        let (outcome, events) = run_to_end(client.clone()).await;

        assert_eq!(
            outcome,
            RunOutcome::Failed {
                job_id: Some("job-hang".into()),
                failure: RunFailure::Timeout { waited_secs: 300 }
            }
        );
        assert_eq!(client.polls(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(300));
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_error_fails_before_any_poll() {
        let client = Arc::new(
            ScriptedClient::new("unused")
                .with_submit_error(ClientError::MissingJobId("garbage output".into())),
        );
        let (outcome, events) = run_to_end(client.clone()).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                job_id: None,
                failure: RunFailure::Submission(
                    "Could not extract job ID from output: garbage output".into()
                )
            }
        );
        assert_eq!(client.polls(), 0);
        assert!(!events
            .iter()
            .any(|e| matches!(e, ProgressEvent::JobIdAssigned(_))));
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_query_error_is_fail_fast_by_default() {
        let client = Arc::new(ScriptedClient::new("job-q").with_statuses([
            Ok(running()),
            Err(ClientError::StatusQuery("throttled".into())),
            Ok(tasks(TaskRunStatus::Succeeded)),
        ]));
        let (outcome, _) = run_to_end(client.clone()).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                job_id: Some("job-q".into()),
                failure: RunFailure::StatusQuery("throttled".into())
            }
        );
        assert_eq!(client.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_query_retries_when_configured() {
        let client = Arc::new(
            ScriptedClient::new("job-r")
                .with_statuses([
                    Err(ClientError::StatusQuery("blip".into())),
                    Ok(tasks(TaskRunStatus::Succeeded)),
                ])
                .with_logs(Ok(LOG.to_string())),
        );
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let cfg = RunConfig {
            status_retries: 1,
            ..RunConfig::default()
        };
        let outcome = JobEngine::new(client.clone(), cfg)
            .run(submission(), event_tx, ctrl_rx)
            .await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(client.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_or_failed_logs_fail_the_run() {
        let client = Arc::new(
            ScriptedClient::new("job-e")
                .with_statuses([Ok(tasks(TaskRunStatus::Succeeded))])
                .with_logs(Ok("  \n".into())),
        );
        let (outcome, events) = run_to_end(client).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                failure: RunFailure::LogRetrieval(_),
                ..
            }
        ));
        assert!(!events.contains(&ProgressEvent::Progress(100)));

        let client = Arc::new(
            ScriptedClient::new("job-e2")
                .with_statuses([Ok(tasks(TaskRunStatus::Succeeded))])
                .with_logs(Err(ClientError::LogTimeout)),
        );
        let (outcome, _) = run_to_end(client).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                job_id: Some("job-e2".into()),
                failure: RunFailure::LogRetrieval("Timeout while retrieving job logs".into())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_poll_is_silent() {
        let client = Arc::new(ScriptedClient::new("job-s"));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        ctrl_tx.send(EngineControl::Stop).unwrap();

        let outcome = JobEngine::new(client.clone(), RunConfig::default())
            .run(submission(), event_tx, ctrl_rx)
            .await;
        assert_eq!(
            outcome,
            RunOutcome::Stopped {
                job_id: Some("job-s".into())
            }
        );
        assert_eq!(client.polls(), 0);
        let mut events = Vec::new();
        while let Ok(ev) = event_rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(terminal_count(&events), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_honored_at_the_next_poll_boundary() {
        let client = Arc::new(ScriptedClient::new("job-b"));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let engine = JobEngine::new(client.clone(), RunConfig::default());
        let handle = tokio::spawn(engine.run(submission(), event_tx, ctrl_rx));

        let mut seen_polls = 0;
        while let Some(ev) = event_rx.recv().await {
            if let ProgressEvent::Status(msg) = &ev {
                if msg.starts_with("Job: ") {
                    seen_polls += 1;
                    if seen_polls == 2 {
                        ctrl_tx.send(EngineControl::Stop).unwrap();
                    }
                }
            }
            assert!(!ev.is_terminal());
        }

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, RunOutcome::Stopped { .. }));
        assert_eq!(client.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_are_independent() {
        let a = Arc::new(
            ScriptedClient::new("job-aaa")
                .with_statuses([Ok(running()), Ok(tasks(TaskRunStatus::Succeeded))])
                .with_logs(Ok(LOG.to_string())),
        );
        let b = Arc::new(
            ScriptedClient::new("job-bbb").with_statuses([Ok(tasks(TaskRunStatus::Failed))]),
        );
        let (ra, rb) = tokio::join!(run_to_end(a.clone()), run_to_end(b.clone()));

        assert!(matches!(ra.0, RunOutcome::Completed { ref job_id, .. } if job_id == "job-aaa"));
        assert!(
            matches!(rb.0, RunOutcome::Failed { job_id: Some(ref id), .. } if id == "job-bbb")
        );
        assert!(ra
            .1
            .iter()
            .all(|e| !matches!(e, ProgressEvent::JobIdAssigned(id) if id != "job-aaa")));
        assert_eq!(a.polls(), 2);
        assert_eq!(b.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_receiver_does_not_abort_the_run() {
        let client = Arc::new(
            ScriptedClient::new("job-d")
                .with_statuses([Ok(tasks(TaskRunStatus::Succeeded))])
                .with_logs(Ok(LOG.to_string())),
        );
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        drop(event_rx);
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let outcome = JobEngine::new(client, RunConfig::default())
            .run(submission(), event_tx, ctrl_rx)
            .await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
    }
}
