//! Animation loop over the canonical timeline.
//!
//! The engine is a single task that owns the frame index. The autoplay
//! timer, scrubbing and selection changes all reach it as commands over one
//! channel, and every change is published through a watch channel. Fetch
//! triggers for the frame to display go out on a separate channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tile_common::{LayerSet, Timeline, Viewport};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

/// Starts a prefetch generation for the current selection.
///
/// Each call supersedes whatever the previous call started.
pub trait PrefetchLauncher: Send + Sync {
    fn launch(&self, layers: &LayerSet, viewport: &Viewport, timeline: &Timeline);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Stopped,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Tick,
    Scrub,
    /// Layers, viewport or timeline changed
    Selection,
}

/// Request to fetch and display one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTrigger {
    pub frame_index: usize,
    pub instant: Option<DateTime<Utc>>,
    pub reason: TriggerReason,
}

/// Published engine state.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    pub current_index: usize,
    pub frame_count: usize,
    pub layers: LayerSet,
    pub viewport: Option<Viewport>,
    /// Frame currently on screen; kept while a new selection loads
    pub last_rendered: Option<usize>,
    /// Prefetch generations launched so far
    pub launches: u64,
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub frame_period: Duration,
    pub scrub_debounce: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            frame_period: Duration::from_millis(500),
            scrub_debounce: Duration::from_millis(150),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Playback engine has stopped")]
    Closed,
}

enum Command {
    Play,
    Stop,
    Toggle,
    SetFrame(usize),
    Step(isize),
    SetLayers(LayerSet),
    SetViewport(Viewport),
    SetTimeline(Timeline),
    MarkRendered(usize),
    Timeline(oneshot::Sender<Timeline>),
    RefreshTimeline(DateTime<Utc>, oneshot::Sender<bool>),
}

/// Cloneable control surface for a running engine.
#[derive(Clone)]
pub struct PlaybackHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<PlaybackState>,
}

impl PlaybackHandle {
    async fn send(&self, command: Command) -> Result<(), PlaybackError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PlaybackError::Closed)
    }

    pub async fn play(&self) -> Result<(), PlaybackError> {
        self.send(Command::Play).await
    }

    pub async fn stop(&self) -> Result<(), PlaybackError> {
        self.send(Command::Stop).await
    }

    pub async fn toggle(&self) -> Result<(), PlaybackError> {
        self.send(Command::Toggle).await
    }

    /// Jump to `index` (clamped). Fetching is debounced.
    pub async fn set_frame(&self, index: usize) -> Result<(), PlaybackError> {
        self.send(Command::SetFrame(index)).await
    }

    /// Move by `delta` frames, wrapping. Fetching is debounced.
    pub async fn step(&self, delta: isize) -> Result<(), PlaybackError> {
        self.send(Command::Step(delta)).await
    }

    pub async fn set_layers(&self, layers: LayerSet) -> Result<(), PlaybackError> {
        self.send(Command::SetLayers(layers)).await
    }

    pub async fn set_viewport(&self, viewport: Viewport) -> Result<(), PlaybackError> {
        self.send(Command::SetViewport(viewport)).await
    }

    pub async fn set_timeline(&self, timeline: Timeline) -> Result<(), PlaybackError> {
        self.send(Command::SetTimeline(timeline)).await
    }

    pub async fn mark_rendered(&self, index: usize) -> Result<(), PlaybackError> {
        self.send(Command::MarkRendered(index)).await
    }

    /// The timeline the engine is currently animating.
    pub async fn timeline(&self) -> Result<Timeline, PlaybackError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Timeline(tx)).await?;
        rx.await.map_err(|_| PlaybackError::Closed)
    }

    /// Rebuild the timeline anchored at `now` once its refresh period has
    /// elapsed, with the same shape. Returns whether it was rebuilt.
    pub async fn refresh_timeline(&self, now: DateTime<Utc>) -> Result<bool, PlaybackError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::RefreshTimeline(now, tx)).await?;
        rx.await.map_err(|_| PlaybackError::Closed)
    }

    pub fn state(&self) -> PlaybackState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.clone()
    }
}

/// Entry point for starting the engine task.
pub struct PlaybackEngine;

impl PlaybackEngine {
    /// Spawn the engine. Returns its handle, the trigger stream and the task.
    pub fn spawn(
        timeline: Timeline,
        layers: LayerSet,
        config: PlaybackConfig,
        launcher: Arc<dyn PrefetchLauncher>,
    ) -> (
        PlaybackHandle,
        mpsc::UnboundedReceiver<FetchTrigger>,
        JoinHandle<()>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();

        let state = PlaybackState {
            status: PlaybackStatus::Stopped,
            current_index: timeline.latest_observed_index().unwrap_or(0),
            frame_count: timeline.len(),
            layers,
            viewport: None,
            last_rendered: None,
            launches: 0,
        };
        let (state_tx, state_rx) = watch::channel(state.clone());

        let actor = Actor {
            timeline,
            state,
            config,
            launcher,
            state_tx,
            triggers: trigger_tx,
            ticker: None,
            scrub_deadline: None,
        };
        let task = tokio::spawn(actor.run(command_rx));

        (
            PlaybackHandle {
                commands: command_tx,
                state: state_rx,
            },
            trigger_rx,
            task,
        )
    }
}

struct Actor {
    timeline: Timeline,
    state: PlaybackState,
    config: PlaybackConfig,
    launcher: Arc<dyn PrefetchLauncher>,
    state_tx: watch::Sender<PlaybackState>,
    triggers: mpsc::UnboundedSender<FetchTrigger>,
    ticker: Option<Interval>,
    scrub_deadline: Option<Instant>,
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(frames = self.timeline.len(), "Playback engine started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                // Autoplay holds while a scrub is settling
                _ = next_tick(&mut self.ticker), if self.scrub_deadline.is_none() => self.advance(),
                _ = deadline(self.scrub_deadline) => self.scrub_settled(),
            }
        }

        debug!("Playback engine stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Play => self.play(),
            Command::Stop => self.stop(),
            Command::Toggle => match self.state.status {
                PlaybackStatus::Playing => self.stop(),
                PlaybackStatus::Stopped => self.play(),
            },
            Command::SetFrame(index) => self.scrub_to(index),
            Command::Step(delta) => {
                let count = self.timeline.len() as isize;
                if count > 0 {
                    let next = (self.state.current_index as isize + delta).rem_euclid(count);
                    self.scrub_to(next as usize);
                }
            }
            Command::SetLayers(layers) => {
                if layers != self.state.layers {
                    self.state.layers = layers;
                    self.selection_changed();
                }
            }
            Command::SetViewport(viewport) => {
                if self.state.viewport != Some(viewport) {
                    self.state.viewport = Some(viewport);
                    self.selection_changed();
                }
            }
            Command::SetTimeline(timeline) => self.replace_timeline(timeline),
            Command::MarkRendered(index) => {
                self.state.last_rendered = Some(index);
                self.publish();
            }
            Command::Timeline(reply) => {
                let _ = reply.send(self.timeline.clone());
            }
            Command::RefreshTimeline(now, reply) => {
                let stale = self.timeline.is_stale(now);
                if stale {
                    let config = self.timeline.config().clone();
                    debug!(built_at = %self.timeline.built_at(), now = %now, "Timeline is stale");
                    self.replace_timeline(Timeline::build(now, config));
                }
                let _ = reply.send(stale);
            }
        }
    }

    /// Swap in a new timeline. An engine resting on the newest observed
    /// frame moves to the new newest; any other position is clamped.
    fn replace_timeline(&mut self, timeline: Timeline) {
        let resting = self.timeline.latest_observed_index() == Some(self.state.current_index);
        self.timeline = timeline;
        self.state.frame_count = self.timeline.len();
        self.state.current_index = match self.timeline.latest_observed_index() {
            Some(latest) if resting => latest,
            _ => self
                .state
                .current_index
                .min(self.timeline.len().saturating_sub(1)),
        };
        self.selection_changed();
    }

    fn play(&mut self) {
        if self.state.status == PlaybackStatus::Playing || self.timeline.is_empty() {
            return;
        }
        let period = self.config.frame_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self.state.status = PlaybackStatus::Playing;
        self.publish();
    }

    fn stop(&mut self) {
        self.ticker = None;
        if self.state.status != PlaybackStatus::Stopped {
            self.state.status = PlaybackStatus::Stopped;
            self.publish();
        }
    }

    fn advance(&mut self) {
        let count = self.timeline.len();
        if count == 0 {
            return;
        }
        self.state.current_index = (self.state.current_index + 1) % count;
        self.publish();
        self.trigger(TriggerReason::Tick);
    }

    fn scrub_to(&mut self, index: usize) {
        if self.timeline.is_empty() {
            return;
        }
        self.state.current_index = index.min(self.timeline.len() - 1);
        self.scrub_deadline = Some(Instant::now() + self.config.scrub_debounce);
        self.publish();
    }

    /// Fetch the scrubbed frame and resume autoplay a full period later.
    fn scrub_settled(&mut self) {
        self.scrub_deadline = None;
        self.trigger(TriggerReason::Scrub);
        if let Some(ticker) = self.ticker.as_mut() {
            ticker.reset();
        }
    }

    /// Supersede the running prefetch and refetch the current frame. The
    /// frame on screen stays until the new one renders.
    fn selection_changed(&mut self) {
        if let Some(viewport) = &self.state.viewport {
            self.launcher
                .launch(&self.state.layers, viewport, &self.timeline);
            self.state.launches += 1;
            info!(
                layers = self.state.layers.len(),
                zoom = viewport.zoom,
                frames = self.timeline.len(),
                "Relaunched prefetch"
            );
        }
        self.publish();
        self.trigger(TriggerReason::Selection);
    }

    fn trigger(&self, reason: TriggerReason) {
        if self.timeline.is_empty() {
            return;
        }
        let trigger = FetchTrigger {
            frame_index: self.state.current_index,
            instant: self.timeline.get(self.state.current_index).map(|f| f.instant),
            reason,
        };
        // Nobody listening is fine
        let _ = self.triggers.send(trigger);
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}
