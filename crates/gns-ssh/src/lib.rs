//! SSH session and job manager.
//!
//! Mirrors the console manager's session semantics over a different
//! transport and adds a per-session job store. Every command lands in BOTH
//! the continuous output buffer (for diff/paged reads) and a job record
//! (for polling and history); the two lifetimes are independent.
//!
//! Execution is adaptive: `wait_timeout > 0` blocks the caller until the
//! command completes or the wait budget runs out; `wait_timeout == 0`
//! returns a job id immediately and the command keeps running in the
//! background, bounded by its read timeout. The blocking ssh2 driver is
//! confined to `spawn_blocking`.

#![forbid(unsafe_code)]

pub mod driver;
pub mod jobs;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gns_proto::{DeviceSpec, Job, JobStatus, OutputBuffer, ReadMode};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use driver::{DriverError, SshDriver, SshFailure, SshFailureKind, profile_for};
pub use jobs::JobStore;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error(transparent)]
    ConnectionFailed(#[from] SshFailure),

    #[error("no SSH session for '{0}'; run configure first")]
    SessionNotFound(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("invalid expect pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("internal executor error: {0}")]
    Internal(String),
}

pub type SshResult<T> = Result<T, SshError>;

// ─── Tunables ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SshTunables {
    pub buffer_cap: usize,
    pub buffer_trim: usize,
    pub page_lines: usize,
    pub history_cap: usize,
    pub connect_timeout: Duration,
    /// Read timeout applied when the caller does not supply one.
    pub default_read_timeout: Duration,
}

impl Default for SshTunables {
    fn default() -> Self {
        Self {
            buffer_cap: gns_proto::buffer::DEFAULT_BUFFER_CAP,
            buffer_trim: gns_proto::buffer::DEFAULT_TRIM_TO,
            page_lines: gns_proto::buffer::DEFAULT_PAGE_LINES,
            history_cap: 1000,
            connect_timeout: Duration::from_secs(15),
            default_read_timeout: Duration::from_secs(30),
        }
    }
}

// ─── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConfigureOutcome {
    pub node_name: String,
    pub session_id: String,
    /// True when a healthy existing session was kept.
    pub reused: bool,
    pub device_type: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Synchronous path: the job finished within the wait budget.
    Completed { job: Job },
    /// Asynchronous path: poll `get_job_status` with this id.
    Pending { job_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub node_name: String,
    pub completed: bool,
    pub status: JobStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SshSessionStatus {
    pub node_name: String,
    pub session_id: String,
    pub device_type: String,
    pub host: String,
    pub port: u16,
    pub persist: bool,
    pub job_count: usize,
    pub running_jobs: usize,
    pub buffer_bytes: usize,
    pub pending_bytes: usize,
    pub idle_secs: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupScope {
    /// Drop sessions whose owning node no longer exists.
    Orphaned,
    /// Drop everything.
    All,
}

/// Options for `send_command`.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub read_timeout: Option<Duration>,
    pub expect_string: Option<String>,
    /// Zero means asynchronous.
    pub wait_timeout: Duration,
}

// ─── Session ──────────────────────────────────────────────────────────────────

struct SshSession {
    id: String,
    spec: DeviceSpec,
    persist: bool,
    driver: Arc<Mutex<SshDriver>>,
    buffer: Arc<Mutex<OutputBuffer>>,
    jobs: Arc<Mutex<JobStore>>,
    last_activity: Instant,
    created_at: DateTime<Utc>,
}

impl SshSession {
    /// Reuse is only safe when the connection coordinates match.
    fn compatible_with(&self, spec: &DeviceSpec) -> bool {
        self.spec.host == spec.host
            && self.spec.port == spec.port
            && self.spec.username == spec.username
            && self.spec.device_type == spec.device_type
    }
}

struct SlotState {
    session: Option<SshSession>,
    /// Set (under both the map and slot locks) when the slot has been
    /// unlinked from the map. A holder that raced the removal must refetch
    /// instead of installing a session nothing can find.
    retired: bool,
}

type Slot = Arc<AsyncMutex<SlotState>>;

/// Finished jobs that outlived their session. Non-persistent sessions close
/// as soon as their command settles; the record moves here so the job id
/// handed to an asynchronous caller stays pollable. FIFO-capped like
/// per-session history.
struct RetiredJobs {
    jobs: VecDeque<(String, Job)>,
    cap: usize,
}

impl RetiredJobs {
    fn new(cap: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    fn push(&mut self, node: String, job: Job) {
        self.jobs.push_back((node, job));
        while self.jobs.len() > self.cap {
            self.jobs.pop_front();
        }
    }

    fn get(&self, id: &str) -> Option<(String, Job)> {
        self.jobs.iter().find(|(_, j)| j.id == id).cloned()
    }
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct SshSessionManager {
    slots: Arc<AsyncMutex<HashMap<String, Slot>>>,
    /// job id → owning node. A job id is unique for the process lifetime
    /// and belongs to exactly one session.
    job_index: Arc<Mutex<HashMap<String, String>>>,
    retired_jobs: Arc<Mutex<RetiredJobs>>,
    tunables: SshTunables,
}

impl SshSessionManager {
    pub fn new(tunables: SshTunables) -> Self {
        Self {
            slots: Arc::new(AsyncMutex::new(HashMap::new())),
            job_index: Arc::new(Mutex::new(HashMap::new())),
            retired_jobs: Arc::new(Mutex::new(RetiredJobs::new(tunables.history_cap))),
            tunables,
        }
    }

    // ── configure ─────────────────────────────────────────────────────────

    /// Create or reuse a session. Reuse requires a live transport that
    /// passes an empty-command probe and matching connection coordinates;
    /// `force_recreate` skips reuse entirely.
    pub async fn configure(
        &self,
        node: &str,
        spec: DeviceSpec,
        persist: bool,
        force_recreate: bool,
    ) -> SshResult<ConfigureOutcome> {
        // Re-fetch if the slot was retired between the map lookup and the
        // lock; installing into an unlinked slot would orphan the session.
        let mut state = loop {
            let slot = self.slot_for(node).await;
            let guard = slot.clone().lock_owned().await;
            if !guard.retired {
                break guard;
            }
        };

        if !force_recreate {
            if let Some(session) = state.session.as_mut() {
                if session.compatible_with(&spec) {
                    let driver = session.driver.clone();
                    let alive = tokio::task::spawn_blocking(move || driver.lock().probe())
                        .await
                        .unwrap_or(false);
                    if alive {
                        session.last_activity = Instant::now();
                        debug!(node, session = %session.id, "reusing healthy ssh session");
                        return Ok(ConfigureOutcome {
                            node_name: node.to_string(),
                            session_id: session.id.clone(),
                            reused: true,
                            device_type: session.spec.device_type.clone(),
                            host: session.spec.host.clone(),
                            port: session.spec.port,
                        });
                    }
                    warn!(node, "ssh session failed health check, rebuilding");
                } else {
                    debug!(node, "ssh spec changed, rebuilding session");
                }
            }
        }

        if let Some(stale) = state.session.take() {
            close_driver(stale.driver).await;
        }

        let dial_spec = spec.clone();
        let connect_timeout = self.tunables.connect_timeout;
        let driver =
            tokio::task::spawn_blocking(move || SshDriver::connect(&dial_spec, connect_timeout))
                .await
                .map_err(|e| SshError::Internal(e.to_string()))??;

        let session = SshSession {
            id: Uuid::new_v4().to_string(),
            persist,
            driver: Arc::new(Mutex::new(driver)),
            buffer: Arc::new(Mutex::new(OutputBuffer::new(
                self.tunables.buffer_cap,
                self.tunables.buffer_trim,
                self.tunables.page_lines,
            ))),
            jobs: Arc::new(Mutex::new(JobStore::new(self.tunables.history_cap))),
            last_activity: Instant::now(),
            created_at: Utc::now(),
            spec,
        };
        info!(node, session = %session.id, host = %session.spec.host, "ssh session established");
        let outcome = ConfigureOutcome {
            node_name: node.to_string(),
            session_id: session.id.clone(),
            reused: false,
            device_type: session.spec.device_type.clone(),
            host: session.spec.host.clone(),
            port: session.spec.port,
        };
        state.session = Some(session);
        Ok(outcome)
    }

    // ── command execution ─────────────────────────────────────────────────

    pub async fn send_command(
        &self,
        node: &str,
        command: &str,
        options: CommandOptions,
    ) -> SshResult<CommandOutcome> {
        let expect = options
            .expect_string
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        let read_timeout = options
            .read_timeout
            .unwrap_or(self.tunables.default_read_timeout);

        let slot = self
            .existing_slot(node)
            .await
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;
        let mut state = slot.lock().await;
        let session = state
            .session
            .as_mut()
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;

        let job_id = Uuid::new_v4().to_string();
        session.jobs.lock().push(Job {
            id: job_id.clone(),
            command: command.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: JobStatus::Running,
            output: String::new(),
            error: None,
            execution_time: 0.0,
        });
        self.job_index
            .lock()
            .insert(job_id.clone(), node.to_string());
        session.last_activity = Instant::now();

        let driver = session.driver.clone();
        let buffer = session.buffer.clone();
        let jobs = session.jobs.clone();
        // The waiter reads the finished job through its own handle so a
        // non-persistent session closing underneath it cannot lose the
        // result.
        let waiter_jobs = session.jobs.clone();
        let persist = session.persist;
        drop(state);

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let task_command = command.to_string();
        let task_job_id = job_id.clone();
        let cleanup = if persist {
            None
        } else {
            Some(NonPersistCleanup {
                node: node.to_string(),
                job_id: job_id.clone(),
                jobs: jobs.clone(),
                slots: self.slots.clone(),
                job_index: self.job_index.clone(),
                retired_jobs: self.retired_jobs.clone(),
            })
        };

        tokio::spawn(async move {
            run_job(
                driver,
                buffer,
                jobs,
                task_job_id,
                task_command,
                expect,
                read_timeout,
            )
            .await;
            if let Some(cleanup) = cleanup {
                cleanup.run().await;
            }
            let _ = done_tx.send(());
        });

        if options.wait_timeout.is_zero() {
            return Ok(CommandOutcome::Pending { job_id });
        }
        match tokio::time::timeout(options.wait_timeout, done_rx).await {
            Ok(_) => {
                let job = waiter_jobs
                    .lock()
                    .get(&job_id)
                    .ok_or_else(|| SshError::JobNotFound(job_id.clone()))?;
                Ok(CommandOutcome::Completed { job })
            }
            Err(_) => Ok(CommandOutcome::Pending { job_id }),
        }
    }

    /// Push configuration lines synchronously.
    pub async fn send_config_set(
        &self,
        node: &str,
        commands: Vec<String>,
        read_timeout: Option<Duration>,
    ) -> SshResult<Job> {
        let read_timeout = read_timeout.unwrap_or(self.tunables.default_read_timeout);
        let slot = self
            .existing_slot(node)
            .await
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;
        let mut state = slot.lock().await;
        let session = state
            .session
            .as_mut()
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;

        let job_id = Uuid::new_v4().to_string();
        let summary = commands.join("; ");
        session.jobs.lock().push(Job {
            id: job_id.clone(),
            command: summary.clone(),
            started_at: Utc::now(),
            finished_at: None,
            status: JobStatus::Running,
            output: String::new(),
            error: None,
            execution_time: 0.0,
        });
        self.job_index
            .lock()
            .insert(job_id.clone(), node.to_string());
        session.last_activity = Instant::now();

        let driver = session.driver.clone();
        let result = tokio::task::spawn_blocking(move || {
            driver.lock().send_config_set(&commands, read_timeout)
        })
        .await
        .map_err(|e| SshError::Internal(e.to_string()))?;

        let (status, output, error) = settle(result);
        record_result(&session.buffer, &session.jobs, &job_id, &summary, status, &output, &error);

        session
            .jobs
            .lock()
            .get(&job_id)
            .ok_or_else(|| SshError::JobNotFound(job_id))
    }

    // ── reads & history ───────────────────────────────────────────────────

    pub async fn read_buffer(&self, node: &str, mode: ReadMode) -> SshResult<String> {
        let slot = self
            .existing_slot(node)
            .await
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;
        let mut state = slot.lock().await;
        let session = state
            .session
            .as_mut()
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;
        session.last_activity = Instant::now();
        Ok(session.buffer.lock().read(mode))
    }

    pub async fn get_history(
        &self,
        node: &str,
        limit: Option<usize>,
        search: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> SshResult<Vec<Job>> {
        let slot = self
            .existing_slot(node)
            .await
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;
        let state = slot.lock().await;
        let session = state
            .session
            .as_ref()
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;
        Ok(session.jobs.lock().history(limit, search, since))
    }

    pub async fn get_command_output(&self, node: &str, job_id: &str) -> SshResult<Job> {
        let slot = self
            .existing_slot(node)
            .await
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;
        let state = slot.lock().await;
        let session = state
            .session
            .as_ref()
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;
        session
            .jobs
            .lock()
            .get(job_id)
            .ok_or_else(|| SshError::JobNotFound(job_id.to_string()))
    }

    /// Poll a job by id alone; the owning session is found via the index,
    /// falling back to the retired store for jobs whose non-persistent
    /// session already closed.
    pub async fn get_job_status(&self, job_id: &str) -> SshResult<JobStatusReport> {
        let node = { self.job_index.lock().get(job_id).cloned() };
        if let Some(node) = node {
            if let Some(job) = self.lookup_job(job_id).await? {
                return Ok(job_report(node, job));
            }
        }
        if let Some((node, job)) = self.retired_jobs.lock().get(job_id) {
            return Ok(job_report(node, job));
        }
        Err(SshError::JobNotFound(job_id.to_string()))
    }

    // ── status / lifecycle ────────────────────────────────────────────────

    pub async fn session_status(&self, node: &str) -> SshResult<SshSessionStatus> {
        let slot = self
            .existing_slot(node)
            .await
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;
        let state = slot.lock().await;
        let session = state
            .session
            .as_ref()
            .ok_or_else(|| SshError::SessionNotFound(node.to_string()))?;
        Ok(Self::status_of(node, session))
    }

    pub async fn status_all(&self) -> Vec<SshSessionStatus> {
        let slots: Vec<(String, Slot)> = {
            let map = self.slots.lock().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut out = Vec::new();
        for (name, slot) in slots {
            let state = slot.lock().await;
            if let Some(session) = state.session.as_ref() {
                out.push(Self::status_of(&name, session));
            }
        }
        out.sort_by(|a, b| a.node_name.cmp(&b.node_name));
        out
    }

    pub async fn disconnect(&self, node: &str) -> SshResult<bool> {
        let slot = {
            let mut map = self.slots.lock().await;
            map.remove(node)
        };
        let Some(slot) = slot else { return Ok(false) };
        let mut state = slot.lock().await;
        // The slot is already unlinked from the map.
        state.retired = true;
        match state.session.take() {
            Some(session) => {
                info!(node, session = %session.id, "ssh session disconnected");
                close_driver(session.driver).await;
                self.job_index.lock().retain(|_, owner| owner.as_str() != node);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn disconnect_all(&self) -> usize {
        let slots: Vec<Slot> = {
            let mut map = self.slots.lock().await;
            map.drain().map(|(_, v)| v).collect()
        };
        let mut closed = 0;
        for slot in slots {
            let mut state = slot.lock().await;
            state.retired = true;
            if let Some(session) = state.session.take() {
                close_driver(session.driver).await;
                closed += 1;
            }
        }
        self.job_index.lock().clear();
        closed
    }

    /// Drop orphaned sessions (owning node gone from the project) or all.
    pub async fn cleanup(&self, scope: CleanupScope, known_nodes: &[String]) -> Vec<String> {
        let names: Vec<String> = {
            let map = self.slots.lock().await;
            map.keys().cloned().collect()
        };
        let mut removed = Vec::new();
        for name in names {
            let drop_it = match scope {
                CleanupScope::All => true,
                CleanupScope::Orphaned => !known_nodes.contains(&name),
            };
            if drop_it && self.disconnect(&name).await.unwrap_or(false) {
                removed.push(name);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), ?scope, "ssh cleanup removed sessions");
        }
        removed
    }

    /// Idle sweep; busy sessions hold their slot lock and are skipped.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let slots: Vec<(String, Slot)> = {
            let map = self.slots.lock().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut closed = Vec::new();
        for (name, slot) in slots {
            let Ok(mut state) = slot.try_lock() else {
                continue;
            };
            let evict = state
                .session
                .as_ref()
                .is_some_and(|s| s.last_activity.elapsed() >= idle_timeout
                    && s.jobs.lock().running_count() == 0);
            if evict {
                if let Some(session) = state.session.take() {
                    info!(node = %name, session = %session.id, "closing idle ssh session");
                    close_driver(session.driver).await;
                    closed.push(name);
                }
            }
        }
        if !closed.is_empty() {
            {
                let mut index = self.job_index.lock();
                index.retain(|_, owner| !closed.contains(owner));
            }
            let mut map = self.slots.lock().await;
            for name in &closed {
                let should_remove = if let Some(slot) = map.get(name) {
                    let mut remove = false;
                    if let Ok(mut state) = slot.try_lock() {
                        if state.session.is_none() {
                            state.retired = true;
                            remove = true;
                        }
                    }
                    remove
                } else {
                    false
                };
                if should_remove {
                    map.remove(name);
                }
            }
        }
        closed
    }

    pub async fn session_count(&self) -> usize {
        let slots: Vec<Slot> = {
            let map = self.slots.lock().await;
            map.values().cloned().collect()
        };
        let mut count = 0;
        for slot in slots {
            match slot.try_lock() {
                Ok(state) if state.session.is_some() => count += 1,
                Ok(_) => {}
                // Busy slot implies a live session.
                Err(_) => count += 1,
            }
        }
        count
    }

    // ── internals ─────────────────────────────────────────────────────────

    async fn slot_for(&self, node: &str) -> Slot {
        let mut map = self.slots.lock().await;
        map.entry(node.to_string())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(SlotState {
                    session: None,
                    retired: false,
                }))
            })
            .clone()
    }

    async fn existing_slot(&self, node: &str) -> Option<Slot> {
        self.slots.lock().await.get(node).cloned()
    }

    async fn lookup_job(&self, job_id: &str) -> SshResult<Option<Job>> {
        let node = {
            match self.job_index.lock().get(job_id) {
                Some(n) => n.clone(),
                None => return Ok(None),
            }
        };
        let Some(slot) = self.existing_slot(&node).await else {
            return Ok(None);
        };
        let state = slot.lock().await;
        Ok(state
            .session
            .as_ref()
            .and_then(|s| s.jobs.lock().get(job_id)))
    }

    fn status_of(node: &str, session: &SshSession) -> SshSessionStatus {
        let jobs = session.jobs.lock();
        let buf = session.buffer.lock();
        SshSessionStatus {
            node_name: node.to_string(),
            session_id: session.id.clone(),
            device_type: session.spec.device_type.clone(),
            host: session.spec.host.clone(),
            port: session.spec.port,
            persist: session.persist,
            job_count: jobs.len(),
            running_jobs: jobs.running_count(),
            buffer_bytes: buf.len(),
            pending_bytes: buf.pending(),
            idle_secs: session.last_activity.elapsed().as_secs(),
            created_at: session.created_at,
        }
    }
}

impl Default for SshSessionManager {
    fn default() -> Self {
        Self::new(SshTunables::default())
    }
}

// ─── Job execution helpers ────────────────────────────────────────────────────

/// Teardown for a non-persistent session once its command settles: the
/// finished record moves to the retired store (so the job id stays
/// pollable), the job index is pruned, and the emptied slot is unlinked.
struct NonPersistCleanup {
    node: String,
    job_id: String,
    jobs: Arc<Mutex<JobStore>>,
    slots: Arc<AsyncMutex<HashMap<String, Slot>>>,
    job_index: Arc<Mutex<HashMap<String, String>>>,
    retired_jobs: Arc<Mutex<RetiredJobs>>,
}

impl NonPersistCleanup {
    async fn run(self) {
        // Retire this command's record through its own store handle, which
        // outlives the session even if a concurrent command already closed
        // it.
        if let Some(job) = self.jobs.lock().get(&self.job_id) {
            if job.is_completed() {
                self.retired_jobs.lock().push(self.node.clone(), job);
            }
        }

        let slot = { self.slots.lock().await.get(&self.node).cloned() };
        if let Some(slot) = slot {
            let mut state = slot.lock().await;
            if let Some(session) = state.session.take() {
                debug!(node = %self.node, session = %session.id, "closing non-persistent ssh session");
                close_driver(session.driver).await;
            }
        }

        self.job_index.lock().retain(|_, owner| *owner != self.node);

        // Unlink the emptied slot; a racing configure sees `retired` and
        // refetches rather than installing into a detached slot.
        let mut map = self.slots.lock().await;
        let should_remove = if let Some(slot) = map.get(&self.node) {
            let mut remove = false;
            if let Ok(mut state) = slot.try_lock() {
                if state.session.is_none() {
                    state.retired = true;
                    remove = true;
                }
            }
            remove
        } else {
            false
        };
        if should_remove {
            map.remove(&self.node);
        }
    }
}

fn job_report(node: String, job: Job) -> JobStatusReport {
    JobStatusReport {
        job_id: job.id.clone(),
        node_name: node,
        completed: job.is_completed(),
        status: job.status,
        output: job.output,
        error: job.error,
        execution_time: job.execution_time,
    }
}

async fn run_job(
    driver: Arc<Mutex<SshDriver>>,
    buffer: Arc<Mutex<OutputBuffer>>,
    jobs: Arc<Mutex<JobStore>>,
    job_id: String,
    command: String,
    expect: Option<Regex>,
    read_timeout: Duration,
) {
    let exec_command = command.clone();
    let result = tokio::task::spawn_blocking(move || {
        driver
            .lock()
            .send_command(&exec_command, expect.as_ref(), read_timeout)
    })
    .await;

    let (status, output, error) = match result {
        Ok(r) => settle(r),
        Err(e) => (
            JobStatus::Failed,
            String::new(),
            Some(format!("executor error: {e}")),
        ),
    };
    record_result(&buffer, &jobs, &job_id, &command, status, &output, &error);
}

/// Collapse a driver result into `(status, output, error)`.
fn settle(result: Result<String, DriverError>) -> (JobStatus, String, Option<String>) {
    match result {
        Ok(output) => (JobStatus::Completed, output, None),
        Err(DriverError::Timeout { partial }) => (
            JobStatus::TimedOut,
            partial,
            Some("command did not complete within the read timeout".to_string()),
        ),
        Err(DriverError::Eof { partial }) => (
            JobStatus::Failed,
            partial,
            Some("channel closed by peer".to_string()),
        ),
        Err(e) => (JobStatus::Failed, String::new(), Some(e.to_string())),
    }
}

/// Dual storage: append to the continuous buffer and finalize the job.
fn record_result(
    buffer: &Mutex<OutputBuffer>,
    jobs: &Mutex<JobStore>,
    job_id: &str,
    command: &str,
    status: JobStatus,
    output: &str,
    error: &Option<String>,
) {
    {
        let mut buf = buffer.lock();
        buf.append(command);
        buf.append("\n");
        if !output.is_empty() {
            buf.append(output);
            buf.append("\n");
        }
    }
    let finished = Utc::now();
    jobs.lock().update(job_id, |job| {
        job.status = status;
        job.output = output.to_string();
        job.error = error.clone();
        job.finished_at = Some(finished);
        job.execution_time = (finished - job.started_at).num_milliseconds() as f64 / 1000.0;
    });
}

async fn close_driver(driver: Arc<Mutex<SshDriver>>) {
    let _ = tokio::task::spawn_blocking(move || driver.lock().close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused_spec() -> DeviceSpec {
        DeviceSpec {
            device_type: "linux".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "root".to_string(),
            password: "root".to_string(),
            secret: None,
            key_file: None,
            timeout: Some(1),
        }
    }

    fn test_manager() -> SshSessionManager {
        SshSessionManager::new(SshTunables {
            connect_timeout: Duration::from_millis(500),
            ..SshTunables::default()
        })
    }

    #[tokio::test]
    async fn test_configure_refused_is_classified() {
        let mgr = test_manager();
        let err = mgr
            .configure("R1", refused_spec(), true, false)
            .await
            .expect_err("refused");
        match err {
            SshError::ConnectionFailed(f) => {
                assert_eq!(f.kind, SshFailureKind::ConnectionRefused);
                assert!(!f.kind.suggested_action().is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        // Failed configure leaves no session behind.
        assert_eq!(mgr.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_command_requires_configure() {
        let mgr = test_manager();
        let err = mgr
            .send_command("R1", "show version", CommandOptions::default())
            .await
            .expect_err("no session");
        assert!(matches!(err, SshError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_read_and_history_require_session() {
        let mgr = test_manager();
        assert!(matches!(
            mgr.read_buffer("R1", ReadMode::Diff).await,
            Err(SshError::SessionNotFound(_))
        ));
        assert!(matches!(
            mgr.get_history("R1", None, None, None).await,
            Err(SshError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_job_id() {
        let mgr = test_manager();
        let err = mgr.get_job_status("no-such-job").await.expect_err("missing");
        assert!(matches!(err, SshError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_cleanup_and_status_on_empty_manager() {
        let mgr = test_manager();
        assert!(mgr.status_all().await.is_empty());
        assert!(mgr.cleanup(CleanupScope::All, &[]).await.is_empty());
        assert!(mgr.sweep_idle(Duration::from_secs(0)).await.is_empty());
        assert!(!mgr.disconnect("ghost").await.expect("disconnect"));
    }

    #[test]
    fn test_settle_maps_driver_results() {
        let (s, o, e) = settle(Ok("done".to_string()));
        assert_eq!(s, JobStatus::Completed);
        assert_eq!(o, "done");
        assert!(e.is_none());

        let (s, o, e) = settle(Err(DriverError::Timeout {
            partial: "partial out".to_string(),
        }));
        assert_eq!(s, JobStatus::TimedOut);
        assert_eq!(o, "partial out");
        assert!(e.is_some());

        let (s, _, e) = settle(Err(DriverError::Eof {
            partial: String::new(),
        }));
        assert_eq!(s, JobStatus::Failed);
        assert!(e.expect("error").contains("closed"));
    }

    fn finished_job(id: &str, command: &str) -> Job {
        Job {
            id: id.to_string(),
            command: command.to_string(),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            status: JobStatus::Completed,
            output: "done".to_string(),
            error: None,
            execution_time: 0.1,
        }
    }

    #[test]
    fn test_retired_jobs_fifo_cap_and_lookup() {
        let mut retired = RetiredJobs::new(2);
        for i in 0..3 {
            retired.push("R1".to_string(), finished_job(&format!("j-{i}"), "show clock"));
        }
        // Oldest evicted, newest two pollable.
        assert!(retired.get("j-0").is_none());
        let (node, job) = retired.get("j-2").expect("retired job");
        assert_eq!(node, "R1");
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_retired_job_still_pollable_by_id() {
        // Simulate the non-persistent teardown path: the session is gone
        // but the finished record was retired, so polling the id works.
        let mgr = test_manager();
        mgr.retired_jobs
            .lock()
            .push("R1".to_string(), finished_job("j-retired", "show version"));

        let report = mgr.get_job_status("j-retired").await.expect("report");
        assert!(report.completed);
        assert_eq!(report.node_name, "R1");
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.output, "done");
    }

    #[test]
    fn test_record_result_feeds_both_stores() {
        let buffer = Mutex::new(OutputBuffer::default());
        let jobs = Mutex::new(JobStore::new(10));
        jobs.lock().push(Job {
            id: "j-1".to_string(),
            command: "show clock".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: JobStatus::Running,
            output: String::new(),
            error: None,
            execution_time: 0.0,
        });

        record_result(
            &buffer,
            &jobs,
            "j-1",
            "show clock",
            JobStatus::Completed,
            "12:00:00 UTC",
            &None,
        );

        let job = jobs.lock().get("j-1").expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert!(job.execution_time >= 0.0);

        let mut buf = buffer.lock();
        let text = buf.read(ReadMode::All);
        assert!(text.contains("show clock"));
        assert!(text.contains("12:00:00 UTC"));
    }
}
