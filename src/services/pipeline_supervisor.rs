// PipelineSupervisor Service
// Owns one pipeline state machine per station: launch, monitor, restart, teardown

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::models::{
    secs, PipelineMode, PipelineState, PipelineStatus, RestartPolicy, StationPipelineConfig,
    SupervisorSettings,
};
use crate::services::events::{EventHub, LogSeverity, PipelineEventSink};
use crate::services::launch_args::{
    build_encoder_args, build_single_args, build_snapshot_args, destination_urls, redact_arg,
    redact_args, select_audio_source, LaunchError,
};
use crate::services::log_router::{describe_exit, spawn_output_pump, OutputTail};
use crate::services::now_playing::{probe_now_playing, NowPlayingError, NowPlayingPoller, ProbeResult};
use crate::services::overlay::{build_overlay_filters, OverlayTextSources};
use crate::services::playlist::{materialize_playlist, MaterializedPlaylist, PlaylistPolicy};
use crate::services::station_paths::StationPaths;
use crate::services::station_store::StationStore;
use crate::services::text_capability::TextRenderCapability;

const SOURCE_SUPERVISOR: &str = "supervisor";
const SOURCE_FFMPEG: &str = "ffmpeg";
const SOURCE_FEEDER: &str = "feeder";

/// Time allowed for output pumps to drain after the process exits
const PUMP_DRAIN: Duration = Duration::from_secs(1);

/// Pause before the next feeder spawn when one fails immediately
const FEEDER_FAILURE_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Station not found: {0}")]
    StationNotFound(String),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("Playlist unavailable: {0}")]
    Playlist(String),
    #[error("Configuration store error: {0}")]
    Store(String),
    #[error("Failed to spawn FFmpeg: {0}")]
    Spawn(String),
    #[error("Snapshot failed: {0}")]
    Snapshot(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    NowPlaying(#[from] NowPlayingError),
}

impl SupervisorError {
    /// Configuration problems that automatic restarts cannot fix
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::StationNotFound(_) | Self::Launch(_) | Self::Playlist(_) | Self::Store(_)
        )
    }
}

/// Exponential restart delay: `min(base * factor^attempt, cap)`
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub factor: f64,
    pub cap_secs: f64,
}

impl BackoffPolicy {
    pub fn delay(&self, base_secs: f64, attempt: u32) -> Duration {
        let factor = if self.factor.is_finite() && self.factor >= 1.0 { self.factor } else { 1.0 };
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = base_secs.max(0.0) * factor.powi(exponent);
        let capped = if raw.is_finite() { raw.min(self.cap_secs) } else { self.cap_secs };
        secs(capped)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        let settings = SupervisorSettings::default();
        Self {
            factor: settings.backoff_factor,
            cap_secs: settings.backoff_cap_secs,
        }
    }
}

/// Runtime knobs for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub ffmpeg_path: String,
    /// Parent of the per-station directories
    pub stations_root: PathBuf,
    pub backoff: BackoffPolicy,
    pub restart_settle: Duration,
    pub stop_grace: Duration,
    pub playlist: PlaylistPolicy,
    pub metadata_timeout: Duration,
    pub snapshot_timeout: Duration,
}

impl SupervisorOptions {
    pub fn from_settings(settings: &SupervisorSettings, ffmpeg_path: String, stations_root: PathBuf) -> Self {
        Self {
            ffmpeg_path,
            stations_root,
            backoff: BackoffPolicy {
                factor: settings.backoff_factor,
                cap_secs: settings.backoff_cap_secs,
            },
            restart_settle: settings.restart_settle(),
            stop_grace: settings.stop_grace(),
            playlist: PlaylistPolicy::from_settings(settings),
            metadata_timeout: settings.metadata_timeout(),
            snapshot_timeout: settings.snapshot_timeout(),
        }
    }
}

struct RestartTimer {
    handle: JoinHandle<()>,
    due: Instant,
}

/// Processes of one launch, tracked as a unit
struct ProcessSet {
    stop_tx: watch::Sender<bool>,
    watcher: JoinHandle<()>,
    feeder: Option<JoinHandle<()>>,
}

impl ProcessSet {
    /// Ask every process to terminate; the returned tasks finish once they have
    fn request_stop(self) -> Vec<JoinHandle<()>> {
        let _ = self.stop_tx.send(true);
        let mut tasks = vec![self.watcher];
        tasks.extend(self.feeder);
        tasks
    }
}

/// Supervisor-owned record for one station
#[derive(Default)]
struct PipelineInstance {
    state: PipelineState,
    /// Bumped on every launch so stale exit callbacks and timers are ignored
    generation: u64,
    restart_count: u32,
    policy: RestartPolicy,
    last_error: Option<String>,
    started_at: Option<Instant>,
    pid: Option<u32>,
    processes: Option<ProcessSet>,
    poller: Option<NowPlayingPoller>,
    restart_timer: Option<RestartTimer>,
    restarts_exhausted: bool,
}

impl PipelineInstance {
    fn status(&self, station_id: &str) -> PipelineStatus {
        let now = Instant::now();
        PipelineStatus {
            station_id: station_id.to_string(),
            state: self.state,
            pid: self.pid,
            restart_count: self.restart_count,
            max_restart_attempts: self.policy.max_attempts,
            uptime_seconds: match (self.state, self.started_at) {
                (PipelineState::Running, Some(started)) => now.duration_since(started).as_secs(),
                _ => 0,
            },
            last_error: self.last_error.clone(),
            restart_pending: self.restart_timer.is_some(),
            next_restart_in_seconds: self
                .restart_timer
                .as_ref()
                .map(|t| t.due.saturating_duration_since(now).as_secs_f64()),
            restarts_exhausted: self.restarts_exhausted,
        }
    }

    fn cancel_restart_timer(&mut self) -> bool {
        match self.restart_timer.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
    }
}

type StationSlot = Arc<Mutex<PipelineInstance>>;

struct Inner {
    store: Arc<dyn StationStore>,
    options: SupervisorOptions,
    capability: TextRenderCapability,
    events: Arc<EventHub>,
    /// Locked only to insert or remove slots
    stations: RwLock<HashMap<String, StationSlot>>,
}

/// Manages station pipelines
#[derive(Clone)]
pub struct PipelineSupervisor {
    inner: Arc<Inner>,
}

impl PipelineSupervisor {
    pub fn new(store: Arc<dyn StationStore>, options: SupervisorOptions) -> Self {
        let capability = TextRenderCapability::new(options.ffmpeg_path.clone());
        Self::with_capability(store, options, capability)
    }

    pub fn with_capability(
        store: Arc<dyn StationStore>,
        options: SupervisorOptions,
        capability: TextRenderCapability,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                options,
                capability,
                events: Arc::new(EventHub::new()),
                stations: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register an event subscriber
    pub fn subscribe(&self, sink: Arc<dyn PipelineEventSink>) {
        self.inner.events.subscribe(sink);
    }

    pub fn text_capability(&self) -> &TextRenderCapability {
        &self.inner.capability
    }

    /// Launch the station pipeline; a no-op while it is starting or running
    pub async fn start(&self, station_id: &str) -> Result<PipelineStatus, SupervisorError> {
        let slot = self.inner.slot_or_insert(station_id);
        let mut inst = slot.lock().await;

        if inst.state.is_active() {
            log::debug!("[{station_id}] Start ignored, pipeline is {}", inst.state);
            return Ok(inst.status(station_id));
        }

        // A manual start supersedes any scheduled automatic one
        inst.cancel_restart_timer();
        self.inner.launch(&mut inst, station_id).await?;
        Ok(inst.status(station_id))
    }

    /// Mark the pipeline stopped, then terminate its processes in the background
    pub async fn stop(&self, station_id: &str) -> Result<PipelineStatus, SupervisorError> {
        let Some(slot) = self.inner.slot(station_id) else {
            return Ok(PipelineStatus::never_started(station_id));
        };
        let mut inst = slot.lock().await;
        self.inner.stop_locked(&mut inst, station_id);
        Ok(inst.status(station_id))
    }

    /// Stop, settle, reset the restart budget, and start again
    pub async fn restart(&self, station_id: &str) -> Result<PipelineStatus, SupervisorError> {
        let slot = self.inner.slot_or_insert(station_id);
        {
            let mut inst = slot.lock().await;
            self.inner.stop_locked(&mut inst, station_id);
            self.inner.set_state(&mut inst, station_id, PipelineState::Restarting);
        }

        tokio::time::sleep(self.inner.options.restart_settle).await;

        let mut inst = slot.lock().await;
        if inst.state != PipelineState::Restarting {
            // Stopped or started by someone else while settling
            log::info!("[{station_id}] Restart superseded, pipeline is {}", inst.state);
            return Ok(inst.status(station_id));
        }

        inst.restart_count = 0;
        inst.restarts_exhausted = false;
        self.inner.launch(&mut inst, station_id).await?;
        Ok(inst.status(station_id))
    }

    /// Restart a live or failed pipeline, otherwise just refresh its playlist
    pub async fn apply_config(&self, station_id: &str) -> Result<PipelineStatus, SupervisorError> {
        let state = match self.inner.slot(station_id) {
            Some(slot) => {
                let inst = slot.lock().await;
                inst.state
            }
            None => PipelineState::Stopped,
        };

        match state {
            PipelineState::Starting | PipelineState::Running | PipelineState::Error | PipelineState::Restarting => {
                self.restart(station_id).await
            }
            PipelineState::Stopped => {
                self.materialize_playlist(station_id).await?;
                Ok(self.get_status(station_id).await)
            }
        }
    }

    pub async fn get_status(&self, station_id: &str) -> PipelineStatus {
        let Some(slot) = self.inner.slot(station_id) else {
            return PipelineStatus::never_started(station_id);
        };
        let inst = slot.lock().await;
        inst.status(station_id)
    }

    pub async fn get_all_statuses(&self) -> HashMap<String, PipelineStatus> {
        let mut statuses = HashMap::new();
        for (station_id, slot) in self.inner.slots() {
            let status = slot.lock().await.status(&station_id);
            statuses.insert(station_id, status);
        }
        statuses
    }

    /// Rewrite the station manifest without touching a running pipeline
    pub async fn materialize_playlist(&self, station_id: &str) -> Result<MaterializedPlaylist, SupervisorError> {
        let config = self.inner.load_config(station_id)?;
        let paths = self.inner.paths_for(&config)?;
        let policy = self.inner.options.playlist;

        // The running encoder may be reading the manifest; replacement is atomic
        tokio::task::spawn_blocking(move || materialize_playlist(&config, &paths, &policy))
            .await
            .map_err(|e| SupervisorError::Playlist(format!("Materializer task failed: {e}")))?
            .map_err(SupervisorError::Playlist)
    }

    /// Render one still frame with the station's manifest and overlay
    pub async fn generate_snapshot(&self, station_id: &str) -> Result<PathBuf, SupervisorError> {
        let config = self.inner.load_config(station_id)?;
        let paths = self.inner.paths_for(&config)?;

        if !paths.manifest().is_file() {
            self.materialize_playlist(station_id).await?;
        }
        paths.ensure_now_playing_files().map_err(SupervisorError::Snapshot)?;

        let overlay = self.inner.overlay_filters(&config, &paths).await;
        paths.ensure_dir().map_err(SupervisorError::Snapshot)?;
        // Unique per request so concurrent snapshots never share a file
        let tmp = tempfile::Builder::new()
            .prefix("snapshot-")
            .suffix(".jpg")
            .tempfile_in(paths.dir())?;
        let args = build_snapshot_args(&config, &paths.manifest(), &overlay, tmp.path())?;
        log::debug!("[{station_id}] Snapshot args: {:?}", redact_args(&args));

        let output = tokio::time::timeout(
            self.inner.options.snapshot_timeout,
            Command::new(&self.inner.options.ffmpeg_path)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            SupervisorError::Snapshot(format!(
                "FFmpeg did not finish within {:?}",
                self.inner.options.snapshot_timeout
            ))
        })?
        .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

        let written = tmp.path().metadata().map(|m| m.len() > 0).unwrap_or(false);
        if !output.status.success() || !written {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no output");
            return Err(SupervisorError::Snapshot(format!(
                "FFmpeg exited with {}: {}",
                output.status,
                redact_arg(detail)
            )));
        }

        let snapshot = paths.snapshot();
        tmp.persist(&snapshot).map_err(|e| SupervisorError::Io(e.error))?;
        log::info!("[{station_id}] Snapshot written to {}", snapshot.display());
        Ok(snapshot)
    }

    /// One-shot metadata fetch for the station's configured source
    pub async fn test_now_playing(&self, station_id: &str) -> Result<ProbeResult, SupervisorError> {
        let config = self.inner.load_config(station_id)?;
        Ok(probe_now_playing(&config.now_playing, self.inner.options.metadata_timeout).await?)
    }

    /// Stop the pipeline and forget the station
    pub async fn remove_station(&self, station_id: &str) -> Result<(), SupervisorError> {
        if let Some(slot) = self.inner.slot(station_id) {
            let mut inst = slot.lock().await;
            self.inner.stop_locked(&mut inst, station_id);
        }
        if let Ok(mut stations) = self.inner.stations.write() {
            stations.remove(station_id);
        }
        log::info!("[{station_id}] Station removed from supervisor");
        Ok(())
    }

    /// Stop every station without waiting for processes to exit
    pub async fn stop_all(&self) {
        for (station_id, slot) in self.inner.slots() {
            let mut inst = slot.lock().await;
            self.inner.stop_locked(&mut inst, &station_id);
        }
    }

    /// Stop every station and wait for their processes, bounded by the grace window
    pub async fn shutdown(&self) {
        let mut tasks = Vec::new();
        for (station_id, slot) in self.inner.slots() {
            let mut inst = slot.lock().await;
            tasks.extend(self.inner.stop_locked(&mut inst, &station_id));
        }

        let deadline = self.inner.options.stop_grace + Duration::from_secs(2);
        let wait_all = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(deadline, wait_all).await.is_err() {
            log::warn!("Timed out waiting for pipeline processes to exit");
        }
    }
}

impl Inner {
    fn slot(&self, station_id: &str) -> Option<StationSlot> {
        self.stations.read().ok()?.get(station_id).cloned()
    }

    fn slot_or_insert(&self, station_id: &str) -> StationSlot {
        if let Some(slot) = self.slot(station_id) {
            return slot;
        }
        let mut stations = self.stations.write().unwrap_or_else(|e| {
            log::warn!("Station map lock poisoned, recovering: {e}");
            e.into_inner()
        });
        stations
            .entry(station_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PipelineInstance::default())))
            .clone()
    }

    fn slots(&self) -> Vec<(String, StationSlot)> {
        self.stations
            .read()
            .map(|stations| stations.iter().map(|(id, slot)| (id.clone(), slot.clone())).collect())
            .unwrap_or_default()
    }

    fn load_config(&self, station_id: &str) -> Result<StationPipelineConfig, SupervisorError> {
        self.store
            .load_config(station_id)
            .map_err(SupervisorError::Store)?
            .ok_or_else(|| SupervisorError::StationNotFound(station_id.to_string()))
    }

    fn paths_for(&self, config: &StationPipelineConfig) -> Result<StationPaths, SupervisorError> {
        StationPaths::new(&self.options.stations_root, &config.slug).map_err(SupervisorError::Store)
    }

    async fn overlay_filters(&self, config: &StationPipelineConfig, paths: &StationPaths) -> Vec<String> {
        if !config.overlay.enabled {
            return Vec::new();
        }
        let text_supported = self.capability.supports_drawtext().await;
        let (combined, artist, title) = (paths.now_playing(), paths.artist(), paths.title());
        let sources = OverlayTextSources {
            combined: &combined,
            artist: &artist,
            title: &title,
            label: config.overlay.label_text.as_deref(),
        };
        build_overlay_filters(&config.overlay, &sources, text_supported)
    }

    fn note(&self, station_id: &str, severity: LogSeverity, message: &str) {
        match severity {
            LogSeverity::Error => log::error!("[{station_id}] {message}"),
            LogSeverity::Warn => log::warn!("[{station_id}] {message}"),
            LogSeverity::Info => log::info!("[{station_id}] {message}"),
            LogSeverity::Debug => log::debug!("[{station_id}] {message}"),
        }
        self.events.on_log(station_id, severity, SOURCE_SUPERVISOR, message);
    }

    fn set_state(&self, inst: &mut PipelineInstance, station_id: &str, state: PipelineState) {
        if inst.state != state {
            inst.state = state;
            self.events.on_status_change(station_id, state);
        }
    }

    /// Transition to Stopped and tear down everything the instance owns
    fn stop_locked(&self, inst: &mut PipelineInstance, station_id: &str) -> Vec<JoinHandle<()>> {
        let had_timer = inst.cancel_restart_timer();
        let processes = inst.processes.take();

        if inst.state == PipelineState::Stopped && processes.is_none() && !had_timer {
            return Vec::new();
        }

        // Exit callbacks and timers from the stopped run must not act on a later state
        inst.generation += 1;
        self.set_state(inst, station_id, PipelineState::Stopped);
        inst.stop_poller();
        inst.pid = None;
        inst.started_at = None;
        inst.restarts_exhausted = false;

        if had_timer {
            self.note(station_id, LogSeverity::Info, "Pending restart cancelled");
        }

        match processes {
            Some(set) => {
                self.note(station_id, LogSeverity::Info, "Stopping pipeline");
                set.request_stop()
            }
            None => Vec::new(),
        }
    }

    /// Build and spawn the pipeline, recording the outcome on the instance
    async fn launch(self: &Arc<Self>, inst: &mut PipelineInstance, station_id: &str) -> Result<(), SupervisorError> {
        inst.generation += 1;
        inst.last_error = None;
        inst.restarts_exhausted = false;
        self.set_state(inst, station_id, PipelineState::Starting);

        match self.try_launch(inst, station_id).await {
            Ok(()) => {
                self.set_state(inst, station_id, PipelineState::Running);
                Ok(())
            }
            Err(e) => {
                inst.stop_poller();
                inst.pid = None;
                inst.started_at = None;
                inst.last_error = Some(e.to_string());
                self.set_state(inst, station_id, PipelineState::Error);
                self.note(station_id, LogSeverity::Error, &format!("Launch failed: {e}"));

                if !e.is_precondition() {
                    self.schedule_restart(inst, station_id);
                }
                Err(e)
            }
        }
    }

    async fn try_launch(self: &Arc<Self>, inst: &mut PipelineInstance, station_id: &str) -> Result<(), SupervisorError> {
        let config = self.load_config(station_id)?;
        inst.policy = config.restart.clone();

        // Fail fast before touching the filesystem
        select_audio_source(&config)?;
        destination_urls(&config)?;

        let paths = self.paths_for(&config)?;
        let policy = self.options.playlist;
        let playlist = {
            let (config, paths) = (config.clone(), paths.clone());
            tokio::task::spawn_blocking(move || materialize_playlist(&config, &paths, &policy))
                .await
                .map_err(|e| SupervisorError::Playlist(format!("Materializer task failed: {e}")))?
                .map_err(SupervisorError::Playlist)?
        };
        paths.ensure_now_playing_files().map_err(SupervisorError::Playlist)?;

        inst.poller = NowPlayingPoller::spawn(
            station_id.to_string(),
            config.now_playing.clone(),
            paths.clone(),
            self.options.metadata_timeout,
            self.events.clone(),
        );

        let overlay = self.overlay_filters(&config, &paths).await;
        let (set, pid) = match config.pipeline_mode {
            PipelineMode::Single => {
                let args = build_single_args(&config, &playlist.manifest_path, &overlay)?;
                self.spawn_single(station_id, inst.generation, args)?
            }
            PipelineMode::Piped => {
                let args = build_encoder_args(&config, &overlay)?;
                self.spawn_piped(station_id, inst.generation, args, &config, &playlist)?
            }
        };

        inst.processes = Some(set);
        inst.pid = pid;
        inst.started_at = Some(Instant::now());
        self.note(
            station_id,
            LogSeverity::Info,
            &format!(
                "Pipeline started (pid {}, mode {:?}, attempt {})",
                pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
                config.pipeline_mode,
                inst.restart_count
            ),
        );
        Ok(())
    }

    fn spawn_ffmpeg(&self, station_id: &str, args: &[String], stdin: Stdio) -> Result<Child, SupervisorError> {
        log::info!("[{station_id}] Spawning FFmpeg: {:?}", redact_args(args));
        Command::new(&self.options.ffmpeg_path)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{} ({e})", self.options.ffmpeg_path)))
    }

    fn spawn_single(
        self: &Arc<Self>,
        station_id: &str,
        generation: u64,
        args: Vec<String>,
    ) -> Result<(ProcessSet, Option<u32>), SupervisorError> {
        let mut child = self.spawn_ffmpeg(station_id, &args, Stdio::piped())?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let (stop_tx, stop_rx) = watch::channel(false);

        let watcher = self.watch_primary(station_id, generation, child, stdin, stop_rx);
        Ok((ProcessSet { stop_tx, watcher, feeder: None }, pid))
    }

    #[cfg(unix)]
    fn spawn_piped(
        self: &Arc<Self>,
        station_id: &str,
        generation: u64,
        args: Vec<String>,
        config: &StationPipelineConfig,
        playlist: &MaterializedPlaylist,
    ) -> Result<(ProcessSet, Option<u32>), SupervisorError> {
        let mut child = self.spawn_ffmpeg(station_id, &args, Stdio::piped())?;
        let pid = child.id();

        // The encoder's stdin becomes the write end shared by every feeder
        let pipe = match child.stdin.take().map(|stdin| stdin.into_owned_fd()) {
            Some(Ok(fd)) => fd,
            Some(Err(e)) => {
                let _ = child.start_kill();
                return Err(SupervisorError::Spawn(format!("Failed to take encoder stdin: {e}")));
            }
            None => {
                let _ = child.start_kill();
                return Err(SupervisorError::Spawn("Encoder stdin was not piped".to_string()));
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let feeder = tokio::spawn(run_feeder(
            station_id.to_string(),
            self.options.ffmpeg_path.clone(),
            config.clone(),
            playlist.items.clone(),
            playlist.repeat_count,
            pipe,
            stop_rx.clone(),
            self.options.stop_grace,
            self.events.clone(),
        ));
        let watcher = self.watch_primary(station_id, generation, child, None, stop_rx);
        Ok((ProcessSet { stop_tx, watcher, feeder: Some(feeder) }, pid))
    }

    #[cfg(not(unix))]
    fn spawn_piped(
        self: &Arc<Self>,
        _station_id: &str,
        _generation: u64,
        _args: Vec<String>,
        _config: &StationPipelineConfig,
        _playlist: &MaterializedPlaylist,
    ) -> Result<(ProcessSet, Option<u32>), SupervisorError> {
        Err(SupervisorError::Spawn("Piped pipeline mode requires a Unix host".to_string()))
    }

    /// Own the primary process until it exits or a stop is requested
    fn watch_primary(
        self: &Arc<Self>,
        station_id: &str,
        generation: u64,
        mut child: Child,
        mut stdin: Option<ChildStdin>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tail = OutputTail::new();
        let mut pumps = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_output_pump(stderr, station_id.to_string(), SOURCE_FFMPEG, tail.clone(), self.events.clone()));
        }
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_output_pump(stdout, station_id.to_string(), SOURCE_FFMPEG, tail.clone(), self.events.clone()));
        }

        let inner: Weak<Inner> = Arc::downgrade(self);
        let station_id = station_id.to_string();
        let grace = self.options.stop_grace;

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    for pump in pumps {
                        let _ = tokio::time::timeout(PUMP_DRAIN, pump).await;
                    }
                    let reason = describe_exit("FFmpeg", &status, &tail.snapshot());
                    if let Some(inner) = inner.upgrade() {
                        inner.handle_exit(&station_id, generation, reason).await;
                    }
                }
                _ = stop_requested(&mut stop_rx) => {
                    terminate_child(&mut child, stdin.take(), grace, &station_id, SOURCE_FFMPEG).await;
                }
            }
        })
    }

    /// Primary process exit: record the failure and maybe schedule a restart
    async fn handle_exit(self: &Arc<Self>, station_id: &str, generation: u64, reason: String) {
        let Some(slot) = self.slot(station_id) else {
            return;
        };
        let mut inst = slot.lock().await;

        if inst.generation != generation || inst.state == PipelineState::Stopped {
            log::debug!("[{station_id}] Ignoring exit of superseded or stopped pipeline: {reason}");
            return;
        }

        // Stop any feeder still attached to this launch
        if let Some(set) = inst.processes.take() {
            set.request_stop();
        }
        inst.stop_poller();
        inst.pid = None;
        inst.started_at = None;
        inst.last_error = Some(reason.clone());
        self.set_state(&mut inst, station_id, PipelineState::Error);
        self.note(station_id, LogSeverity::Error, &format!("Pipeline exited: {reason}"));

        self.schedule_restart(&mut inst, station_id);
    }

    /// Arm the backoff timer if the policy and remaining budget allow it
    fn schedule_restart(self: &Arc<Self>, inst: &mut PipelineInstance, station_id: &str) {
        inst.cancel_restart_timer();

        if !inst.policy.auto_restart {
            self.note(station_id, LogSeverity::Warn, "Auto-restart disabled, pipeline stays in error");
            return;
        }
        if inst.restart_count >= inst.policy.max_attempts {
            inst.restarts_exhausted = true;
            self.note(
                station_id,
                LogSeverity::Error,
                &format!(
                    "Restart budget exhausted after {} attempts, manual restart required",
                    inst.restart_count
                ),
            );
            return;
        }

        let delay = self.options.backoff.delay(inst.policy.base_delay_secs, inst.restart_count);
        inst.restart_count += 1;
        self.note(
            station_id,
            LogSeverity::Warn,
            &format!(
                "Restarting in {:.1}s (attempt {}/{})",
                delay.as_secs_f64(),
                inst.restart_count,
                inst.policy.max_attempts
            ),
        );

        let generation = inst.generation;
        let inner = Arc::downgrade(self);
        let station = station_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.fire_restart(&station, generation).await;
            }
        });
        inst.restart_timer = Some(RestartTimer { handle, due: Instant::now() + delay });
    }

    async fn fire_restart(self: &Arc<Self>, station_id: &str, generation: u64) {
        let Some(slot) = self.slot(station_id) else {
            return;
        };
        let mut inst = slot.lock().await;

        if inst.generation != generation || inst.state != PipelineState::Error || inst.restart_timer.is_none() {
            return;
        }
        // Our own handle; dropping it does not cancel this task
        inst.restart_timer = None;

        self.set_state(&mut inst, station_id, PipelineState::Restarting);
        if let Err(e) = self.launch(&mut inst, station_id).await {
            log::debug!("[{station_id}] Automatic restart failed: {e}");
        }
    }
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        // A dropped sender means the owning process set is gone
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            log::debug!("SIGTERM to pid {pid} failed: {e}");
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

/// Graceful quit ("q" on stdin plus SIGTERM), force-kill after the grace window
async fn terminate_child(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    grace: Duration,
    station_id: &str,
    tag: &str,
) {
    if let Some(mut stdin) = stdin {
        let _ = stdin.write_all(b"q\n").await;
        let _ = stdin.flush().await;
    }
    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => log::info!("[{station_id}] {tag} exited after stop ({status})"),
        Ok(Err(e)) => log::warn!("[{station_id}] Failed to wait for {tag}: {e}"),
        Err(_) => {
            log::warn!("[{station_id}] {tag} did not exit within {grace:?}, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// Feed each playlist item, repeat by repeat, into the encoder's stdin
///
/// Feeder exits are logged only; when the loop ends the pipe closes and the
/// encoder's own exit drives the restart decision.
#[cfg(unix)]
#[allow(clippy::too_many_arguments)]
async fn run_feeder(
    station_id: String,
    ffmpeg_path: String,
    config: StationPipelineConfig,
    items: Vec<PathBuf>,
    repeat_count: u32,
    pipe: std::os::fd::OwnedFd,
    mut stop_rx: watch::Receiver<bool>,
    grace: Duration,
    events: Arc<dyn PipelineEventSink>,
) {
    use crate::services::launch_args::build_feeder_args;

    let note = |severity: LogSeverity, message: String| {
        match severity {
            LogSeverity::Error | LogSeverity::Warn => log::warn!("[{station_id}] {message}"),
            _ => log::debug!("[{station_id}] {message}"),
        }
        events.on_log(&station_id, severity, SOURCE_FEEDER, &message);
    };

    for repeat in 0..repeat_count {
        for item in &items {
            if *stop_rx.borrow() {
                return;
            }

            let stdout = match pipe.try_clone() {
                Ok(fd) => Stdio::from(fd),
                Err(e) => {
                    note(LogSeverity::Error, format!("Failed to share encoder pipe: {e}"));
                    return;
                }
            };

            let args = build_feeder_args(&config, item);
            let spawned = Command::new(&ffmpeg_path)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();

            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    note(LogSeverity::Error, format!("Failed to spawn feeder for {}: {e}", item.display()));
                    return;
                }
            };

            let tail = OutputTail::new();
            let pump = child.stderr.take().map(|stderr| {
                spawn_output_pump(stderr, station_id.clone(), SOURCE_FEEDER, tail.clone(), events.clone())
            });

            let started = Instant::now();
            tokio::select! {
                status = child.wait() => {
                    if let Some(pump) = pump {
                        let _ = tokio::time::timeout(PUMP_DRAIN, pump).await;
                    }
                    match status {
                        Ok(status) if status.success() => note(
                            LogSeverity::Debug,
                            format!("Fed {} (repeat {}/{repeat_count})", item.display(), repeat + 1),
                        ),
                        other => {
                            let reason = describe_exit("Feeder", &other, &tail.snapshot());
                            note(LogSeverity::Warn, format!("{reason} while feeding {}", item.display()));
                            if started.elapsed() < FEEDER_FAILURE_PAUSE {
                                tokio::time::sleep(FEEDER_FAILURE_PAUSE).await;
                            }
                        }
                    }
                }
                _ = stop_requested(&mut stop_rx) => {
                    terminate_child(&mut child, None, grace, &station_id, SOURCE_FEEDER).await;
                    return;
                }
            }
        }
    }

    note(LogSeverity::Info, "Playlist fully fed, closing encoder input".to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AudioSource, Destination, PlaylistItem};
    use crate::services::events::RecordingSink;
    use crate::services::station_store::JsonStationStore;
    use tempfile::{tempdir, TempDir};

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let policy = BackoffPolicy { factor: 1.5, cap_secs: 60.0 };
        assert_eq!(policy.delay(5.0, 0), Duration::from_secs(5));
        assert_eq!(policy.delay(5.0, 1), Duration::from_secs_f64(7.5));
        assert_eq!(policy.delay(5.0, 2), Duration::from_secs_f64(11.25));

        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = policy.delay(5.0, attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
        assert_eq!(policy.delay(5.0, 10), Duration::from_secs(60));
        assert_eq!(policy.delay(5.0, u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_precondition_classification() {
        assert!(SupervisorError::StationNotFound("x".into()).is_precondition());
        assert!(SupervisorError::Launch(LaunchError::NoDestinations).is_precondition());
        assert!(!SupervisorError::Spawn("boom".into()).is_precondition());
    }

    struct Harness {
        dir: TempDir,
        store: Arc<JsonStationStore>,
        supervisor: PipelineSupervisor,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn runs(&self) -> usize {
            std::fs::read_to_string(self.dir.path().join("runs"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        fn media(&self) -> PathBuf {
            self.dir.path().join("media.mp4")
        }

        fn station(&self, id: &str) -> StationPipelineConfig {
            let mut config = StationPipelineConfig::new(id, format!("{id}-slug"));
            config.playlist = vec![PlaylistItem {
                path: self.media(),
                enabled: true,
                position: 0,
                duration_secs: Some(60.0),
            }];
            config.audio_sources = vec![AudioSource {
                url: "http://127.0.0.1:9/live".to_string(),
                priority: 0,
                enabled: true,
            }];
            config.destinations = vec![Destination {
                name: "Main".to_string(),
                url: "rtmp://127.0.0.1:9/live".to_string(),
                stream_key: Some("key".to_string()),
                enabled: true,
            }];
            config.restart = RestartPolicy { auto_restart: true, base_delay_secs: 1.0, max_attempts: 3 };
            config
        }

        fn save(&self, config: &StationPipelineConfig) {
            self.store.save(config).unwrap();
        }

        async fn wait_for<F>(&self, station_id: &str, mut check: F) -> PipelineStatus
        where
            F: FnMut(&PipelineStatus, usize) -> bool,
        {
            for _ in 0..200 {
                let status = self.supervisor.get_status(station_id).await;
                if check(&status, self.runs()) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("condition not reached; last status {:?}", self.supervisor.get_status(station_id).await);
        }
    }

    /// Stub media tool: records each run, then runs `body`
    #[cfg(unix)]
    fn harness(body: &str) -> Harness {
        harness_with(body, |_| {})
    }

    #[cfg(unix)]
    fn harness_with(body: &str, tweak: impl FnOnce(&mut SupervisorSettings)) -> Harness {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let script = dir.path().join("ffmpeg-stub");
        let runs = dir.path().join("runs");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nLOG='{}'\nfor a in \"$@\"; do [ \"$a\" = \"pipe:1\" ] && FEEDER=1; done\n{body}\n",
                runs.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("media.mp4"), b"not really video").unwrap();

        let store = Arc::new(JsonStationStore::new(dir.path().join("stations")));
        let mut settings = SupervisorSettings::default();
        settings.restart_settle_secs = 0.1;
        settings.stop_grace_secs = 2.0;
        settings.coverage_window_hours = 0.0;
        tweak(&mut settings);
        let options = SupervisorOptions::from_settings(
            &settings,
            script.to_string_lossy().to_string(),
            dir.path().join("data"),
        );

        let supervisor = PipelineSupervisor::with_capability(
            store.clone(),
            options,
            TextRenderCapability::fixed(true),
        );
        let sink = Arc::new(RecordingSink::default());
        supervisor.subscribe(sink.clone());

        Harness { dir, store, supervisor, sink }
    }

    fn process_alive(pid: u32) -> bool {
        #[cfg(unix)]
        {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_happy_path_start_and_stop() {
        let h = harness("echo run >> \"$LOG\"\nexec sleep 30");
        h.save(&h.station("st-1"));

        let status = h.supervisor.start("st-1").await.unwrap();
        assert_eq!(status.state, PipelineState::Running);
        let pid = status.pid.expect("primary pid");
        assert!(process_alive(pid));

        let manifest = h.dir.path().join("data").join("st-1-slug").join("playlist.txt");
        let contents = std::fs::read_to_string(&manifest).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains(&h.media().display().to_string()));

        let stopped = h.supervisor.stop("st-1").await.unwrap();
        assert_eq!(stopped.state, PipelineState::Stopped);
        assert!(stopped.pid.is_none());

        for _ in 0..100 {
            if !process_alive(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!process_alive(pid));
        assert_eq!(
            h.sink.states_for("st-1"),
            vec![PipelineState::Starting, PipelineState::Running, PipelineState::Stopped]
        );

        // Stopping again is a no-op
        let again = h.supervisor.stop("st-1").await.unwrap();
        assert_eq!(again.state, PipelineState::Stopped);
        assert_eq!(h.sink.states_for("st-1").len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_starts_spawn_once() {
        let h = harness("echo run >> \"$LOG\"\nexec sleep 30");
        h.save(&h.station("st-1"));

        let (a, b) = tokio::join!(h.supervisor.start("st-1"), h.supervisor.start("st-1"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.pid, b.pid);

        h.wait_for("st-1", |_, runs| runs == 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.runs(), 1);

        h.supervisor.shutdown().await;
        assert_eq!(h.supervisor.get_status("st-1").await.state, PipelineState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_destination_fails_without_spawning() {
        let h = harness("echo run >> \"$LOG\"\nexec sleep 30");
        let mut config = h.station("st-1");
        config.destinations[0].enabled = false;
        h.save(&config);

        let err = h.supervisor.start("st-1").await.unwrap_err();
        assert!(err.is_precondition());
        assert!(matches!(err, SupervisorError::Launch(LaunchError::NoDestinations)));

        let status = h.supervisor.get_status("st-1").await;
        assert_eq!(status.state, PipelineState::Error);
        assert!(status.last_error.unwrap().contains("destinations"));
        assert!(!status.restart_pending);
        assert!(status.pid.is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.runs(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unknown_station_is_precondition_error() {
        let h = harness("exit 0");
        let err = h.supervisor.start("ghost").await.unwrap_err();
        assert!(matches!(err, SupervisorError::StationNotFound(_)));
        assert_eq!(h.supervisor.get_status("ghost").await.state, PipelineState::Error);
        assert_eq!(
            h.supervisor.get_status("never-seen").await.state,
            PipelineState::Stopped
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_loop_exhausts_budget_then_manual_restart_resets() {
        let h = harness("echo run >> \"$LOG\"\necho 'Connection refused' >&2\nexit 1");
        let mut config = h.station("st-1");
        config.restart.max_attempts = 2;
        config.restart.base_delay_secs = 1.0;
        h.save(&config);

        h.supervisor.start("st-1").await.unwrap();

        let status = h
            .wait_for("st-1", |s, runs| runs >= 3 && s.state == PipelineState::Error && s.restarts_exhausted)
            .await;
        assert_eq!(status.restart_count, 2);
        assert!(!status.restart_pending);
        assert!(status.last_error.unwrap().contains("Server refused connection"));

        // No further timer fires
        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert_eq!(h.runs(), 3);
        let scheduled = h
            .sink
            .log_messages(LogSeverity::Warn)
            .iter()
            .filter(|m| m.starts_with("Restarting in"))
            .count();
        assert_eq!(scheduled, 2);

        let restarted = h.supervisor.restart("st-1").await.unwrap();
        assert_eq!(restarted.restart_count, 0);
        assert!(!restarted.restarts_exhausted);
        h.wait_for("st-1", |_, runs| runs >= 4).await;

        h.supervisor.stop("st-1").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_cancels_pending_restart() {
        let h = harness("echo run >> \"$LOG\"\nexit 1");
        h.save(&h.station("st-1"));

        h.supervisor.start("st-1").await.unwrap();
        let pending = h.wait_for("st-1", |s, _| s.restart_pending).await;
        assert_eq!(pending.state, PipelineState::Error);
        assert!(pending.next_restart_in_seconds.unwrap() <= 1.0);

        let stopped = h.supervisor.stop("st-1").await.unwrap();
        assert_eq!(stopped.state, PipelineState::Stopped);
        assert!(!stopped.restart_pending);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.runs(), 1);
        assert_eq!(h.supervisor.get_status("st-1").await.state, PipelineState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_piped_mode_feeds_every_repeat_and_encoder_exit_is_authoritative() {
        let h = harness(
            "if [ -n \"$FEEDER\" ]; then echo feed >> \"$LOG.feeder\"; echo frame; exit 3; fi\n\
             echo run >> \"$LOG\"\ncat > /dev/null\nexit 0",
        );
        let mut config = h.station("st-1");
        config.pipeline_mode = PipelineMode::Piped;
        config.restart.auto_restart = false;
        h.save(&config);

        h.supervisor.start("st-1").await.unwrap();
        let status = h.wait_for("st-1", |s, _| s.state == PipelineState::Error).await;
        assert!(status.last_error.unwrap().contains("exited with code 0"));
        assert!(!status.restart_pending);

        let feeder_runs = std::fs::read_to_string(h.dir.path().join("runs.feeder")).unwrap();
        assert_eq!(feeder_runs.lines().count(), 2);
        assert_eq!(h.runs(), 1);
        assert!(h
            .sink
            .logs
            .lock()
            .unwrap()
            .iter()
            .any(|(_, sev, source, _)| *sev == LogSeverity::Warn && source == SOURCE_FEEDER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_apply_config_on_stopped_station_only_materializes() {
        let h = harness("echo run >> \"$LOG\"\nexec sleep 30");
        h.save(&h.station("st-1"));

        let status = h.supervisor.apply_config("st-1").await.unwrap();
        assert_eq!(status.state, PipelineState::Stopped);
        assert!(h.dir.path().join("data/st-1-slug/playlist.txt").is_file());
        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("data/st-1-slug/repeat_count")).unwrap().trim(),
            "2"
        );
        assert_eq!(h.runs(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generate_snapshot_replaces_image() {
        let h = harness("for last; do :; done\nprintf jpg > \"$last\"");
        h.save(&h.station("st-1"));

        let path = h.supervisor.generate_snapshot("st-1").await.unwrap();
        assert_eq!(path, h.dir.path().join("data/st-1-slug/snapshot.jpg"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "jpg");
        assert_eq!(station_files(&h, "jpg"), vec!["snapshot.jpg".to_string()]);
    }

    fn station_files(h: &Harness, extension: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(h.dir.path().join("data/st-1-slug"))
            .unwrap()
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(&format!(".{extension}")))
            .collect();
        names.sort();
        names
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_snapshots_use_separate_files() {
        // Each run writes its own output path, slowly enough for the two to overlap
        let h = harness("for last; do :; done\necho \"$last\" >> \"$LOG\"\nsleep 0.3\nprintf jpg > \"$last\"");
        h.save(&h.station("st-1"));
        h.supervisor.materialize_playlist("st-1").await.unwrap();

        let (first, second) = tokio::join!(
            h.supervisor.generate_snapshot("st-1"),
            h.supervisor.generate_snapshot("st-1")
        );
        assert_eq!(first.unwrap(), second.unwrap());

        let outputs = std::fs::read_to_string(h.dir.path().join("runs")).unwrap();
        let outputs: Vec<&str> = outputs.lines().collect();
        assert_eq!(outputs.len(), 2);
        assert_ne!(outputs[0], outputs[1]);
        assert_eq!(station_files(&h, "jpg"), vec!["snapshot.jpg".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_during_restart_does_not_schedule_automatic_restart() {
        // First run fails after a second, later runs stay up
        let h = harness(
            "[ -f \"$LOG\" ] && AGAIN=1\necho run >> \"$LOG\"\n[ -n \"$AGAIN\" ] && exec sleep 30\nsleep 1\nexit 1",
        );
        h.save(&h.station("st-1"));
        h.supervisor.start("st-1").await.unwrap();

        // Queue the restart behind the slot lock, then let the child exit and queue its callback too
        let slot = h.supervisor.inner.slot("st-1").unwrap();
        let guard = slot.lock().await;
        let supervisor = h.supervisor.clone();
        let restart = tokio::spawn(async move { supervisor.restart("st-1").await });
        tokio::time::sleep(Duration::from_millis(1600)).await;
        drop(guard);

        let restarted = restart.await.unwrap().unwrap();
        assert_eq!(restarted.state, PipelineState::Running);
        assert_eq!(restarted.restart_count, 0);
        assert!(!restarted.restart_pending);
        h.wait_for("st-1", |_, runs| runs >= 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = h.supervisor.get_status("st-1").await;
        assert_eq!(status.state, PipelineState::Running);
        assert_eq!(h.runs(), 2);
        assert!(!h
            .sink
            .log_messages(LogSeverity::Warn)
            .iter()
            .any(|m| m.starts_with("Restarting in")));

        h.supervisor.stop("st-1").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_manual_start_from_error_keeps_restart_count() {
        let h = harness("echo run >> \"$LOG\"\nexit 1");
        let mut config = h.station("st-1");
        config.restart.base_delay_secs = 5.0;
        h.save(&config);

        h.supervisor.start("st-1").await.unwrap();
        h.wait_for("st-1", |s, _| s.restart_pending && s.restart_count == 1).await;

        let started = h.supervisor.start("st-1").await.unwrap();
        assert_eq!(started.restart_count, 1);
        assert!(!started.restart_pending);

        let failed = h.wait_for("st-1", |s, runs| runs >= 2 && s.restart_pending).await;
        assert_eq!(failed.restart_count, 2);

        h.supervisor.stop("st-1").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_during_restart_settle_wins() {
        let h = harness_with("echo run >> \"$LOG\"\nexec sleep 30", |s| s.restart_settle_secs = 1.0);
        h.save(&h.station("st-1"));
        h.supervisor.start("st-1").await.unwrap();

        let supervisor = h.supervisor.clone();
        let restart = tokio::spawn(async move { supervisor.restart("st-1").await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.supervisor.get_status("st-1").await.state, PipelineState::Restarting);

        let stopped = h.supervisor.stop("st-1").await.unwrap();
        assert_eq!(stopped.state, PipelineState::Stopped);

        let superseded = restart.await.unwrap().unwrap();
        assert_eq!(superseded.state, PipelineState::Stopped);
        assert_eq!(h.runs(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_during_restart_settle_wins() {
        let h = harness_with("echo run >> \"$LOG\"\nexec sleep 30", |s| s.restart_settle_secs = 1.0);
        h.save(&h.station("st-1"));
        h.supervisor.start("st-1").await.unwrap();

        let supervisor = h.supervisor.clone();
        let restart = tokio::spawn(async move { supervisor.restart("st-1").await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = h.supervisor.start("st-1").await.unwrap();
        assert_eq!(started.state, PipelineState::Running);
        let pid = started.pid;

        let superseded = restart.await.unwrap().unwrap();
        assert_eq!(superseded.state, PipelineState::Running);
        assert_eq!(superseded.pid, pid);
        assert_eq!(h.runs(), 2);

        h.supervisor.stop("st-1").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_all_stops_every_station() {
        let h = harness("echo run >> \"$LOG\"\nexec sleep 30");
        h.save(&h.station("st-1"));
        h.save(&h.station("st-2"));
        h.supervisor.start("st-1").await.unwrap();
        h.supervisor.start("st-2").await.unwrap();

        h.supervisor.stop_all().await;

        let all = h.supervisor.get_all_statuses().await;
        assert_eq!(all.len(), 2);
        for status in all.values() {
            assert_eq!(status.state, PipelineState::Stopped);
            assert!(status.pid.is_none());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_station_stops_and_forgets() {
        let h = harness("echo run >> \"$LOG\"\nexec sleep 30");
        h.save(&h.station("st-1"));
        h.save(&h.station("st-2"));

        h.supervisor.start("st-1").await.unwrap();
        h.supervisor.start("st-2").await.unwrap();
        assert_eq!(h.supervisor.get_all_statuses().await.len(), 2);

        h.supervisor.remove_station("st-1").await.unwrap();
        let all = h.supervisor.get_all_statuses().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all["st-2"].state, PipelineState::Running);

        h.supervisor.shutdown().await;
    }
}
