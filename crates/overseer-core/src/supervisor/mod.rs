//! Process Supervisor: owns the agent subprocess.
//!
//! One agent runs at a time. Three tasks serve each run:
//!
//! - the **reader** drains stdout line by line, classifies each line, feeds
//!   the tracker, updates [`ProcessState`] and publishes live events, all
//!   in the order the agent wrote them;
//! - the **stderr drain** logs stderr at debug level;
//! - the **monitor** owns the [`Child`], waits for it to exit (or kills it
//!   on request), closes any open iteration as cancelled and converges the
//!   state to stopped.
//!
//! After exit the reader gets `exit_drain_timeout` to reach EOF. Past that
//! it is told to stop reading, but a line it is already handling always
//! finishes, so a closed iteration is never lost.
//!
//! Pause and resume only record intent and send a signal; the phase flips
//! when the agent confirms with a `paused` or `resumed` event.

pub mod signals;
pub mod state;

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use overseer_db::HistoryStore;
use overseer_db::models::NewIterationRecord;

use crate::backlog::Backlog;
use crate::broadcast::{Broadcaster, IterationEnded, LiveEvent};
use crate::classifier::{Classified, TextMarker, classify};
use crate::events::{AgentEvent, parse_reset_time};
use crate::hours::AllowedHours;
use crate::tracker::{IterationStarted, IterationTracker};

use self::signals::{AgentSignal, Delivery};
pub use self::state::{Phase, ProcessState, Status, StatusSnapshot};

/// Countdown used when a `rate_limited` event carries no usable reset time.
pub const DEFAULT_RATE_LIMIT_SECS: i64 = 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("agent is already running (pid {0})")]
    AlreadyRunning(u32),
    #[error("agent is not running")]
    NotRunning,
    #[error("invalid start options: {0}")]
    InvalidOptions(String),
    #[error("failed to spawn agent `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        signal: AgentSignal,
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// How the agent is launched and stopped.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub agent_binary: String,
    /// Arguments placed before the per-run flags.
    pub agent_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// How long a graceful stop waits before killing.
    pub grace_period: Duration,
    /// How long the monitor lets the reader run on after the process
    /// exits before telling it to stop reading.
    pub exit_drain_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(agent_binary: impl Into<String>) -> Self {
        Self {
            agent_binary: agent_binary.into(),
            ..Self::default()
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_binary: "autoclaude".to_string(),
            agent_args: vec!["run".to_string(), "--json-events".to_string()],
            working_dir: None,
            grace_period: Duration::from_secs(10),
            exit_drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Per-run options for [`Supervisor::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub performer: Option<String>,
    pub max_iterations: Option<u32>,
    pub allowed_hours: Option<AllowedHours>,
}

impl StartOptions {
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.max_iterations == Some(0) {
            return Err(SupervisorError::InvalidOptions(
                "max_iterations must be greater than zero".to_string(),
            ));
        }
        if let Some(performer) = &self.performer
            && performer.trim().is_empty()
        {
            return Err(SupervisorError::InvalidOptions(
                "performer must not be empty".to_string(),
            ));
        }
        if let Some(hours) = self.allowed_hours {
            AllowedHours::new(hours.start, hours.end)
                .map_err(|e| SupervisorError::InvalidOptions(e.to_string()))?;
        }
        Ok(())
    }

    /// Flags appended to the agent command line.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(n) = self.max_iterations {
            args.push("--max-iterations".to_string());
            args.push(n.to_string());
        }
        if let Some(performer) = &self.performer {
            args.push("--performer".to_string());
            args.push(performer.clone());
        }
        let hours = self.allowed_hours.unwrap_or_default();
        args.push("--start-hour".to_string());
        args.push(hours.start.to_string());
        args.push("--end-hour".to_string());
        args.push(hours.end.to_string());
        args
    }
}

/// Result of [`Supervisor::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// The agent exited on its own after `SIGTERM`.
    Graceful,
    /// The agent was killed.
    Killed,
}

/// Handle on the running agent, held while it is alive.
struct RunHandle {
    pid: u32,
    kill: Arc<Notify>,
    /// `Some(killed)` once the monitor has finished cleaning up.
    done: watch::Receiver<Option<bool>>,
}

/// The stdout reader task and its stop switch.
struct Reader {
    task: JoinHandle<()>,
    stop: CancellationToken,
}

struct Inner {
    config: SupervisorConfig,
    state: Mutex<ProcessState>,
    // Lock order: `run` before `state`.
    run: Mutex<Option<RunHandle>>,
    history: HistoryStore,
    backlog: Arc<dyn Backlog>,
    broadcaster: Broadcaster,
}

/// Shared handle to the supervisor. Clones refer to the same agent.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        history: HistoryStore,
        backlog: Arc<dyn Backlog>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ProcessState::default()),
                run: Mutex::new(None),
                history,
                backlog,
                broadcaster,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.inner.history
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.inner.state.lock().await.snapshot(Utc::now())
    }

    /// Spawn the agent. Fails without touching state when an agent is
    /// already running or the spawn fails.
    pub async fn start(&self, options: StartOptions) -> Result<u32, SupervisorError> {
        options.validate()?;

        let mut run = self.inner.run.lock().await;
        if let Some(handle) = run.as_ref() {
            return Err(SupervisorError::AlreadyRunning(handle.pid));
        }

        let config = &self.inner.config;
        let mut cmd = Command::new(&config.agent_binary);
        cmd.args(&config.agent_args).args(options.launch_args());
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let spawn_error = |source: std::io::Error| SupervisorError::Spawn {
            binary: config.agent_binary.clone(),
            source,
        };
        let mut child = cmd.spawn().map_err(spawn_error)?;
        let Some(pid) = child.id() else {
            return Err(spawn_error(std::io::Error::other(
                "agent exited before its pid was read",
            )));
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        {
            let mut state = self.inner.state.lock().await;
            *state = ProcessState::started(
                pid,
                options.performer.clone(),
                options.max_iterations,
                options.allowed_hours,
                Utc::now(),
            );
        }

        let tracker = Arc::new(Mutex::new(
            IterationTracker::new(Arc::clone(&self.inner.backlog))
                .with_performer(options.performer.clone()),
        ));

        tokio::spawn(Arc::clone(&self.inner).seed_counts(pid, Arc::clone(&tracker)));

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = output_lines(stderr);
                while let Some(line) = lines.next().await {
                    debug!(pid, line = %line, "agent stderr");
                }
            });
        }

        let stop_reading = CancellationToken::new();
        let reader = {
            let inner = Arc::clone(&self.inner);
            let tracker = Arc::clone(&tracker);
            let stop_reading = stop_reading.clone();
            tokio::spawn(async move {
                if let Some(stdout) = stdout {
                    let mut lines = output_lines(stdout);
                    loop {
                        // Only the wait for a line is interruptible.
                        let line = tokio::select! {
                            line = lines.next() => line,
                            _ = stop_reading.cancelled() => {
                                debug!(pid, "stopped reading agent output");
                                break;
                            }
                        };
                        let Some(line) = line else { break };
                        inner.handle_line(&tracker, &line).await;
                    }
                }
                debug!(pid, "agent stdout closed");
            })
        };

        let kill = Arc::new(Notify::new());
        let (done_tx, done_rx) = watch::channel(None);
        tokio::spawn(Arc::clone(&self.inner).monitor(
            child,
            pid,
            Arc::clone(&kill),
            Reader {
                task: reader,
                stop: stop_reading,
            },
            tracker,
            done_tx,
        ));

        *run = Some(RunHandle {
            pid,
            kill,
            done: done_rx,
        });
        drop(run);

        info!(pid, binary = %config.agent_binary, performer = ?options.performer, "agent started");
        self.inner.publish_status().await;
        Ok(pid)
    }

    /// Stop the agent.
    ///
    /// Graceful: `SIGTERM`, then wait up to the grace period before
    /// killing. Forced: kill right away. A forced stop issued while a
    /// graceful one is waiting kills immediately; both callers return once
    /// the state is stopped.
    pub async fn stop(&self, force: bool) -> Result<StopOutcome, SupervisorError> {
        let (pid, kill, mut done) = {
            let run = self.inner.run.lock().await;
            match run.as_ref() {
                Some(handle) => (handle.pid, Arc::clone(&handle.kill), handle.done.clone()),
                None => return Ok(StopOutcome::NotRunning),
            }
        };

        if force {
            info!(pid, "force-stopping agent");
            kill.notify_one();
            wait_done(&mut done).await;
            return Ok(StopOutcome::Killed);
        }

        info!(pid, "stopping agent");
        match signals::send(pid, AgentSignal::Terminate) {
            Ok(Delivery::Delivered) => {}
            Ok(Delivery::AlreadyExited) => debug!(pid, "agent already exited"),
            Err(e) => {
                warn!(pid, error = %e, "SIGTERM failed, killing agent");
                kill.notify_one();
            }
        }

        let grace = self.inner.config.grace_period;
        let killed = match tokio::time::timeout(grace, wait_done(&mut done)).await {
            Ok(killed) => killed,
            Err(_) => {
                warn!(pid, ?grace, "agent did not exit within grace period, killing");
                kill.notify_one();
                wait_done(&mut done).await
            }
        };

        Ok(if killed {
            StopOutcome::Killed
        } else {
            StopOutcome::Graceful
        })
    }

    /// Ask the agent to pause after its current iteration.
    ///
    /// Only intent is recorded here; the reported status changes when the
    /// agent emits `paused`.
    pub async fn pause(&self) -> Result<(), SupervisorError> {
        let run = self.inner.run.lock().await;
        let Some(handle) = run.as_ref() else {
            return Err(SupervisorError::NotRunning);
        };
        let pid = handle.pid;

        let mut state = self.inner.state.lock().await;
        if state.phase == Phase::Paused || state.pause_requested {
            return Ok(());
        }
        match signals::send(pid, AgentSignal::Pause) {
            Ok(Delivery::Delivered) => {
                state.pause_requested = true;
                info!(pid, "pause requested");
                Ok(())
            }
            Ok(Delivery::AlreadyExited) => {
                debug!(pid, "pause ignored, agent already exited");
                Ok(())
            }
            Err(source) => Err(SupervisorError::Signal {
                signal: AgentSignal::Pause,
                pid,
                source,
            }),
        }
    }

    /// Ask a paused (or pausing) agent to continue. A no-op otherwise.
    pub async fn resume(&self) -> Result<(), SupervisorError> {
        let run = self.inner.run.lock().await;
        let Some(handle) = run.as_ref() else {
            return Ok(());
        };
        let pid = handle.pid;

        let mut state = self.inner.state.lock().await;
        if state.phase != Phase::Paused && !state.pause_requested {
            return Ok(());
        }
        match signals::send(pid, AgentSignal::Resume) {
            Ok(Delivery::Delivered) => {
                state.pause_requested = false;
                info!(pid, "resume requested");
                Ok(())
            }
            Ok(Delivery::AlreadyExited) => {
                debug!(pid, "resume ignored, agent already exited");
                Ok(())
            }
            Err(source) => Err(SupervisorError::Signal {
                signal: AgentSignal::Resume,
                pid,
                source,
            }),
        }
    }

    /// Resolves once no agent is running.
    pub async fn wait_stopped(&self) {
        let done = {
            let run = self.inner.run.lock().await;
            run.as_ref().map(|handle| handle.done.clone())
        };
        if let Some(mut done) = done {
            wait_done(&mut done).await;
        }
    }
}

impl Inner {
    async fn publish_status(&self) {
        let snapshot = self.state.lock().await.snapshot(Utc::now());
        self.broadcaster
            .publish(LiveEvent::StatusChange(snapshot))
            .await;
    }

    /// Classify one stdout line and push its effects through the pipeline.
    async fn handle_line(&self, tracker: &Mutex<IterationTracker>, line: &str) {
        let classified = classify(line);

        let (observed, no_progress_count, pending, done) = {
            let mut tracker = tracker.lock().await;
            let observed = tracker.observe(&classified).await;
            (
                observed,
                tracker.no_progress_count(),
                tracker.last_pending(),
                tracker.last_done(),
            )
        };

        if observed.closed.is_some() || observed.started.is_some() {
            let mut state = self.state.lock().await;
            state.tasks_pending = pending.or(state.tasks_pending);
            state.tasks_completed = done.or(state.tasks_completed);
        }

        if let Some(record) = observed.closed {
            self.record_iteration(record, no_progress_count).await;
        }
        match &classified {
            Classified::Structured(event) => self.apply_event(event).await,
            Classified::Heuristic(_) => {
                self.apply_text(&classified, observed.started.as_ref())
                    .await
            }
        }
        if let Some(started) = observed.started {
            self.broadcaster
                .publish(LiveEvent::IterationStart(started))
                .await;
        }
        self.broadcaster
            .publish(LiveEvent::OutputLine(classified.output_line()))
            .await;
    }

    /// Persist a closed iteration. Failure is logged, never fatal.
    async fn record_iteration(&self, record: NewIterationRecord, no_progress_count: u32) {
        let record_id = match self.history.append(&record).await {
            Ok(stored) => Some(stored.id),
            Err(e) => {
                warn!(
                    iteration = record.iteration_number,
                    result = %record.result,
                    error = %format!("{e:#}"),
                    "failed to append iteration to history"
                );
                None
            }
        };

        self.state.lock().await.no_progress_count = no_progress_count;

        self.broadcaster
            .publish(LiveEvent::IterationEnd(IterationEnded::from_record(
                &record,
                no_progress_count,
                record_id,
            )))
            .await;
    }

    /// Fold a structured event into the process state.
    async fn apply_event(&self, event: &AgentEvent) {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        match event {
            AgentEvent::IterationStart {
                iteration,
                performer,
                emoji,
                tasks_done,
                tasks_pending,
                max_iterations,
            } => {
                state.iteration = Some(*iteration);
                state.performer = Some(performer.clone());
                state.performer_emoji = emoji.clone();
                state.tasks_completed = tasks_done.or(state.tasks_completed);
                state.tasks_pending = tasks_pending.or(state.tasks_pending);
                state.max_iterations = max_iterations.or(state.max_iterations);
                state.rate_limited_until = None;
            }
            AgentEvent::IterationEnd {
                tasks_done,
                tasks_pending,
                ..
            } => {
                state.tasks_completed = tasks_done.or(state.tasks_completed);
                state.tasks_pending = tasks_pending.or(state.tasks_pending);
            }
            AgentEvent::Paused { after_iteration } => {
                state.phase = Phase::Paused;
                state.pause_requested = false;
                info!(pid = ?state.pid, after_iteration = ?after_iteration, "agent paused");
            }
            AgentEvent::Resumed {} => {
                state.phase = Phase::Running;
                state.pause_requested = false;
                state.rate_limited_until = None;
                info!(pid = ?state.pid, "agent resumed");
            }
            AgentEvent::RateLimited { reset_time } => {
                let until = reset_time
                    .as_deref()
                    .and_then(parse_reset_time)
                    .unwrap_or(now + chrono::Duration::seconds(DEFAULT_RATE_LIMIT_SECS));
                state.rate_limited_until = Some(until);
                info!(pid = ?state.pid, %until, "agent rate limited");
                drop(state);
                self.broadcaster
                    .publish(LiveEvent::RateLimited { until })
                    .await;
                self.publish_status().await;
                return;
            }
            AgentEvent::Error { message, code } => {
                warn!(pid = ?state.pid, code = ?code, message = %message, "agent reported an error");
                drop(state);
                self.broadcaster
                    .publish(LiveEvent::Error {
                        message: message.clone(),
                    })
                    .await;
                return;
            }
            AgentEvent::Completed {
                reason,
                total_iterations,
                tasks_done,
                tasks_pending,
            } => {
                state.tasks_completed = tasks_done.or(state.tasks_completed);
                state.tasks_pending = tasks_pending.or(state.tasks_pending);
                info!(
                    pid = ?state.pid,
                    reason = reason.as_str(),
                    total_iterations = ?total_iterations,
                    "agent completed"
                );
            }
            AgentEvent::Terminated {
                by_user,
                after_iteration,
            } => {
                info!(pid = ?state.pid, by_user, after_iteration = ?after_iteration, "agent terminated");
            }
            AgentEvent::Output { .. } => return,
        }

        let snapshot = state.snapshot(now);
        drop(state);
        self.broadcaster
            .publish(LiveEvent::StatusChange(snapshot))
            .await;
    }

    /// Fold a plain-text line's boundary and performer into the process
    /// state.
    async fn apply_text(&self, classified: &Classified, started: Option<&IterationStarted>) {
        let marker = classified.text_marker();
        let performer = classified.text_performer();
        if marker.is_none() && performer.is_none() {
            return;
        }

        let now = Utc::now();
        let mut state = self.state.lock().await;
        if let Some(name) = performer {
            state.performer = Some(name);
        }
        if let Some(started) = started {
            state.iteration = Some(started.iteration);
            state.performer = Some(started.performer.clone());
            if !started.emoji.is_empty() {
                state.performer_emoji = Some(started.emoji.clone());
            }
            state.rate_limited_until = None;
        }

        if marker == Some(TextMarker::RateLimited) {
            let until = now + chrono::Duration::seconds(DEFAULT_RATE_LIMIT_SECS);
            state.rate_limited_until = Some(until);
            info!(pid = ?state.pid, %until, "agent reported a rate limit");
            drop(state);
            self.broadcaster
                .publish(LiveEvent::RateLimited { until })
                .await;
            self.publish_status().await;
            return;
        }

        let snapshot = state.snapshot(now);
        drop(state);
        self.broadcaster
            .publish(LiveEvent::StatusChange(snapshot))
            .await;
    }

    /// Read the backlog once at start so status has counts before the
    /// agent reports any. Never overrides counts that arrived first.
    async fn seed_counts(self: Arc<Self>, pid: u32, tracker: Arc<Mutex<IterationTracker>>) {
        let counts = match self.backlog.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                debug!(pid, error = %e, "no initial backlog counts");
                return;
            }
        };
        tracker.lock().await.seed(counts);

        let mut state = self.state.lock().await;
        if state.pid == Some(pid) {
            state.tasks_pending.get_or_insert(counts.pending);
            state.tasks_completed.get_or_insert(counts.done);
            debug!(pid, pending = counts.pending, done = counts.done, "seeded backlog counts");
        }
    }

    /// Own the child until it exits, then reconcile.
    async fn monitor(
        self: Arc<Self>,
        mut child: Child,
        pid: u32,
        kill: Arc<Notify>,
        mut reader: Reader,
        tracker: Arc<Mutex<IterationTracker>>,
        done: watch::Sender<Option<bool>>,
    ) {
        let mut killed = false;
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill.notified() => {
                killed = true;
                force_kill(&mut child, pid);
                child.wait().await
            }
        };
        match &status {
            Ok(status) => info!(pid, %status, killed, "agent exited"),
            Err(e) => warn!(pid, error = %e, "failed to wait for agent"),
        }

        let drain = self.config.exit_drain_timeout;
        let joined = match tokio::time::timeout(drain, &mut reader.task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(pid, ?drain, "agent output still open after exit, stopping reader");
                reader.stop.cancel();
                (&mut reader.task).await
            }
        };
        if let Err(e) = joined {
            warn!(pid, error = %e, "agent output reader failed");
        }

        let (closed, no_progress_count) = {
            let mut tracker = tracker.lock().await;
            let closed = tracker.finish().await;
            (closed, tracker.no_progress_count())
        };
        if let Some(record) = closed {
            info!(pid, iteration = record.iteration_number, "open iteration cancelled by exit");
            self.record_iteration(record, no_progress_count).await;
        }

        {
            let mut run = self.run.lock().await;
            if run.as_ref().is_some_and(|handle| handle.pid == pid) {
                *run = None;
            }
            *self.state.lock().await = ProcessState::default();
        }
        self.publish_status().await;

        let _ = done.send(Some(killed));
    }
}

/// Kill the agent's process group, falling back to the child alone.
fn force_kill(child: &mut Child, pid: u32) {
    match signals::send(pid, AgentSignal::Kill) {
        Ok(_) => {}
        Err(e) => {
            warn!(pid, error = %e, "failed to kill process group, killing agent only");
            if let Err(e) = child.start_kill() {
                warn!(pid, error = %e, "failed to kill agent");
            }
        }
    }
}

/// Wait for the monitor to finish. Returns whether the agent was killed.
async fn wait_done(done: &mut watch::Receiver<Option<bool>>) -> bool {
    match done.wait_for(Option::is_some).await {
        Ok(killed) => (*killed).unwrap_or(false),
        // Monitor gone without reporting; nothing left to wait for.
        Err(_) => false,
    }
}

/// Lines from a child pipe, ending at EOF or the first read error.
fn output_lines<R>(pipe: R) -> Pin<Box<dyn Stream<Item = String> + Send>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let stream = async_stream::stream! {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    yield line;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error reading agent output");
                    break;
                }
            }
        }
    };
    Box::pin(stream)
}
