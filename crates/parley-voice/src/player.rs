//! Audio player: the playback unit every helper drives.
//!
//! A player owns at most one resource at a time. Status changes are published
//! in order on a broadcast channel; every transition into `Idle` carries the
//! `PlaybackEnd` that caused it.
//!
//! How the resource turns into audio depends on the subscriber. When a
//! subscriber offers a [`TrackEngine`] (a transport with its own mixer) the
//! resource is handed to it whole. Otherwise a task ticks once per frame
//! duration, pulls one frame from the resource's decoder and hands it to every
//! ready subscriber.

use crate::error::VoiceError;
use crate::resource::{AudioResource, FrameResult, ResourceHandle, VolumeControl};
use crate::transport::AudioFrame;
use crate::lock;
use async_trait::async_trait;
use parley_types::{NoSubscriberBehavior, PlaybackEnd, PlayerStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 64;

static NEXT_PLAYER_ID: AtomicU64 = AtomicU64::new(1);

/// How a player reacts to missing listeners and stalled resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerBehaviors {
    pub no_subscriber: NoSubscriberBehavior,
    /// Consecutive ticks a playing resource may fail to deliver a frame.
    pub max_missed_frames: u32,
    pub frame_duration: Duration,
}

impl Default for PlayerBehaviors {
    fn default() -> Self {
        Self {
            no_subscriber: NoSubscriberBehavior::Pause,
            max_missed_frames: 5,
            frame_duration: Duration::from_millis(20),
        }
    }
}

/// A single status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub old: PlayerStatus,
    pub new: PlayerStatus,
    /// Set exactly when `new` is `Idle`.
    pub end: Option<PlaybackEnd>,
}

/// Receiver side of a player subscription; usually a voice connection.
pub trait FrameSink: Send + Sync + 'static {
    fn is_ready(&self) -> bool;
    fn send_frame(&self, frame: &AudioFrame);

    /// Engine that plays whole resources on this sink's behalf, if any.
    fn track_engine(&self) -> Option<Arc<dyn TrackEngine>> {
        None
    }
}

/// Plays whole resources, pacing and mixing them itself.
#[async_trait]
pub trait TrackEngine: Send + Sync + 'static {
    /// Plays `resource` until it ends or `run` is cancelled. Progress and the
    /// terminal reason are reported through `run`.
    async fn play(&self, resource: AudioResource, run: PlaybackRun);
}

/// A track engine's view of the player it is playing for.
pub struct PlaybackRun {
    shared: Arc<Shared>,
    generation: u64,
    cancel: CancellationToken,
    events: broadcast::Receiver<StateChange>,
}

impl PlaybackRun {
    pub fn player_id(&self) -> u64 {
        self.shared.id
    }

    /// Cancelled when the player is stopped.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Audio is flowing: `Buffering` becomes `Playing`.
    pub fn started(&self) {
        self.shared
            .transition_from(self.generation, PlayerStatus::Buffering, PlayerStatus::Playing);
    }

    /// Next pause (`Paused`) or resume (`Playing`) of the player. `None` once
    /// this run is over.
    pub async fn next_control(&mut self) -> Option<PlayerStatus> {
        loop {
            match self.events.recv().await {
                Ok(StateChange { new: PlayerStatus::Idle, .. }) => return None,
                // Our own `started`.
                Ok(StateChange {
                    old: PlayerStatus::Buffering,
                    new: PlayerStatus::Playing,
                    ..
                }) => {}
                Ok(StateChange { new, .. }) if new == PlayerStatus::Paused || new == PlayerStatus::Playing => {
                    if self.shared.status_for(self.generation).is_none() {
                        return None;
                    }
                    return Some(new);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return self.shared.status_for(self.generation);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Ends the run with `end`. Has no effect if the player moved on.
    pub fn finish(self, end: PlaybackEnd) {
        self.shared.finish(self.generation, end);
    }
}

impl std::fmt::Debug for PlaybackRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackRun")
            .field("player_id", &self.shared.id)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Clone)]
pub struct Player {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    behaviors: PlayerBehaviors,
    state: Mutex<State>,
    events: broadcast::Sender<StateChange>,
}

struct State {
    status: PlayerStatus,
    resource: Option<ResourceHandle>,
    cancel: Option<CancellationToken>,
    generation: u64,
    sinks: Vec<(u64, Arc<dyn FrameSink>)>,
    next_sink_id: u64,
}

impl Player {
    pub fn new(behaviors: PlayerBehaviors) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_PLAYER_ID.fetch_add(1, Ordering::Relaxed),
                behaviors,
                state: Mutex::new(State {
                    status: PlayerStatus::Idle,
                    resource: None,
                    cancel: None,
                    generation: 0,
                    sinks: Vec::new(),
                    next_sink_id: 1,
                }),
                events,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn behaviors(&self) -> &PlayerBehaviors {
        &self.shared.behaviors
    }

    pub fn status(&self) -> PlayerStatus {
        lock(&self.shared.state).status
    }

    /// The resource currently assigned, if any. Cleared on every return to `Idle`.
    pub fn resource(&self) -> Option<ResourceHandle> {
        lock(&self.shared.state).resource.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.state).sinks.len()
    }

    /// Subscribes to status transitions. Only transitions after this call are
    /// delivered.
    pub fn events(&self) -> broadcast::Receiver<StateChange> {
        self.shared.events.subscribe()
    }

    /// Starts playing `resource`.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::PlayerBusy` if another resource is still assigned;
    /// stop the player or wait for `Idle` first.
    pub fn play(&self, resource: AudioResource) -> Result<ResourceHandle, VoiceError> {
        let handle = resource.handle();
        let cancel = CancellationToken::new();
        let (generation, engine, events) = {
            let mut state = lock(&self.shared.state);
            if state.status != PlayerStatus::Idle {
                return Err(VoiceError::PlayerBusy);
            }
            state.generation += 1;
            state.resource = Some(handle.clone());
            state.cancel = Some(cancel.clone());
            self.shared
                .transition(&mut state, PlayerStatus::Buffering, None);
            let engine = state.sinks.iter().find_map(|(_, sink)| sink.track_engine());
            (state.generation, engine, self.shared.events.subscribe())
        };

        let shared = self.shared.clone();
        match engine {
            Some(engine) => {
                debug!(player_id = shared.id, resource_id = handle.id(), "handing resource to track engine");
                let run = PlaybackRun {
                    shared,
                    generation,
                    cancel,
                    events,
                };
                tokio::spawn(async move { engine.play(resource, run).await });
            }
            None => {
                let (frames, decoder) = resource.spawn();
                let volume = handle.volume_control();
                tokio::spawn(async move {
                    run_playback(shared, frames, volume, generation, cancel).await;
                    decoder.abort();
                });
            }
        }

        Ok(handle)
    }

    /// Stops the current resource. Returns `false` if the player was already idle.
    pub fn stop(&self) -> bool {
        let mut state = lock(&self.shared.state);
        if state.status == PlayerStatus::Idle {
            return false;
        }
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        self.shared
            .transition(&mut state, PlayerStatus::Idle, Some(PlaybackEnd::Stopped));
        true
    }

    pub fn pause(&self) -> bool {
        let mut state = lock(&self.shared.state);
        match state.status {
            PlayerStatus::Playing | PlayerStatus::Buffering | PlayerStatus::AutoPaused => {
                self.shared.transition(&mut state, PlayerStatus::Paused, None);
                true
            }
            _ => false,
        }
    }

    pub fn unpause(&self) -> bool {
        let mut state = lock(&self.shared.state);
        if state.status != PlayerStatus::Paused {
            return false;
        }
        self.shared.transition(&mut state, PlayerStatus::Playing, None);
        true
    }

    pub(crate) fn add_sink(&self, sink: Arc<dyn FrameSink>) -> u64 {
        let mut state = lock(&self.shared.state);
        let id = state.next_sink_id;
        state.next_sink_id += 1;
        state.sinks.push((id, sink));
        id
    }

    pub(crate) fn remove_sink(&self, sink_id: u64) -> bool {
        let mut state = lock(&self.shared.state);
        let before = state.sinks.len();
        state.sinks.retain(|(id, _)| *id != sink_id);
        state.sinks.len() != before
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Shared {
    fn transition(&self, state: &mut State, new: PlayerStatus, end: Option<PlaybackEnd>) {
        if state.status == new {
            return;
        }
        let old = std::mem::replace(&mut state.status, new);
        if new == PlayerStatus::Idle {
            state.resource = None;
            state.cancel = None;
        }
        debug!(player_id = self.id, from = %old, to = %new, end = ?end, "player state change");
        // Nobody listening is fine.
        let _ = self.events.send(StateChange { old, new, end });
    }

    /// Current status, or `None` if `generation` is no longer the active run.
    fn status_for(&self, generation: u64) -> Option<PlayerStatus> {
        let state = lock(&self.state);
        (state.generation == generation && state.status != PlayerStatus::Idle)
            .then_some(state.status)
    }

    fn transition_for(&self, generation: u64, new: PlayerStatus) {
        let mut state = lock(&self.state);
        if state.generation == generation && state.status != PlayerStatus::Idle {
            self.transition(&mut state, new, None);
        }
    }

    fn transition_from(&self, generation: u64, from: PlayerStatus, to: PlayerStatus) {
        let mut state = lock(&self.state);
        if state.generation == generation && state.status == from {
            self.transition(&mut state, to, None);
        }
    }

    fn finish(&self, generation: u64, end: PlaybackEnd) {
        let mut state = lock(&self.state);
        if state.generation == generation && state.status != PlayerStatus::Idle {
            self.transition(&mut state, PlayerStatus::Idle, Some(end));
        }
    }

    fn ready_sinks(&self) -> Vec<Arc<dyn FrameSink>> {
        lock(&self.state)
            .sinks
            .iter()
            .filter(|(_, sink)| sink.is_ready())
            .map(|(_, sink)| sink.clone())
            .collect()
    }
}

async fn run_playback(
    shared: Arc<Shared>,
    mut frames: mpsc::Receiver<FrameResult>,
    volume: Option<VolumeControl>,
    generation: u64,
    cancel: CancellationToken,
) {
    let behaviors = shared.behaviors.clone();
    let mut ticker = time::interval(behaviors.frame_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed: u32 = 0;

    let end = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(status) = shared.status_for(generation) else {
            return;
        };
        if status == PlayerStatus::Paused {
            continue;
        }

        let sinks = shared.ready_sinks();
        if sinks.is_empty() {
            match behaviors.no_subscriber {
                NoSubscriberBehavior::Pause => {
                    if status != PlayerStatus::Buffering {
                        shared.transition_for(generation, PlayerStatus::AutoPaused);
                    }
                    continue;
                }
                NoSubscriberBehavior::Stop => break PlaybackEnd::NoSubscribers,
                NoSubscriberBehavior::Play => {}
            }
        }

        match frames.try_recv() {
            Ok(Ok(frame)) => {
                missed = 0;
                if status != PlayerStatus::Playing {
                    shared.transition_for(generation, PlayerStatus::Playing);
                }
                let frame = match &volume {
                    Some(control) => control.apply(frame),
                    None => frame,
                };
                for sink in &sinks {
                    sink.send_frame(&frame);
                }
            }
            Ok(Err(e)) => break PlaybackEnd::Errored(e.to_string()),
            Err(TryRecvError::Empty) => {
                if status == PlayerStatus::Buffering {
                    continue;
                }
                if status == PlayerStatus::AutoPaused {
                    shared.transition_for(generation, PlayerStatus::Playing);
                }
                missed += 1;
                if missed > behaviors.max_missed_frames {
                    warn!(
                        player_id = shared.id,
                        missed, "resource stalled past missed-frame tolerance"
                    );
                    break PlaybackEnd::Underrun;
                }
                for sink in &sinks {
                    sink.send_frame(&AudioFrame::Silence);
                }
            }
            Err(TryRecvError::Disconnected) => break PlaybackEnd::Finished,
        }
    };

    shared.finish(generation, end);
}

/// Waits for the next transition into `Idle` and returns its terminal reason.
///
/// # Errors
///
/// Returns `VoiceError::Cancelled` if the player was dropped first.
pub async fn wait_for_idle(
    events: &mut broadcast::Receiver<StateChange>,
) -> Result<PlaybackEnd, VoiceError> {
    loop {
        match events.recv().await {
            Ok(StateChange {
                new: PlayerStatus::Idle,
                end,
                ..
            }) => return Ok(end.unwrap_or(PlaybackEnd::Stopped)),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "player event receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(VoiceError::Cancelled),
        }
    }
}

/// Player factory: a player that keeps consuming its resource with nobody
/// listening and tolerates `behaviors.max_missed_frames` stalled ticks.
///
/// # Errors
///
/// Returns `VoiceError::Config` if the frame duration is zero.
pub fn create_player(behaviors: PlayerBehaviors) -> Result<Player, VoiceError> {
    if behaviors.frame_duration.is_zero() {
        return Err(VoiceError::Config(
            "player frame duration must be greater than zero".to_string(),
        ));
    }
    Ok(Player::new(behaviors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{create_audio_resource, AudioSource, ResourceOptions};
    use bytes::Bytes;
    use futures_util::{stream, StreamExt};
    use parley_types::StreamType;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        frames: AtomicUsize,
        silence: AtomicUsize,
    }

    impl FrameSink for CountingSink {
        fn is_ready(&self) -> bool {
            true
        }

        fn send_frame(&self, frame: &AudioFrame) {
            if frame.is_silence() {
                self.silence.fetch_add(1, Ordering::SeqCst);
            } else {
                self.frames.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn fast_behaviors(no_subscriber: NoSubscriberBehavior) -> PlayerBehaviors {
        PlayerBehaviors {
            no_subscriber,
            max_missed_frames: 3,
            frame_duration: Duration::from_millis(5),
        }
    }

    fn opus_resource(packets: usize) -> AudioResource {
        let items = (0..packets).map(|i| Ok(Bytes::from(vec![0xf8, i as u8])));
        create_audio_resource(
            AudioSource::stream(stream::iter(items.collect::<Vec<_>>())),
            ResourceOptions {
                stream_type: StreamType::Opus,
                inline_volume: true,
                ..ResourceOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn plays_every_frame_then_goes_idle() {
        let player = Player::new(fast_behaviors(NoSubscriberBehavior::Play));
        let sink = Arc::new(CountingSink::default());
        player.add_sink(sink.clone());
        let mut events = player.events();

        player.play(opus_resource(4)).unwrap();
        let end = wait_for_idle(&mut events).await.unwrap();

        assert_eq!(end, PlaybackEnd::Finished);
        assert_eq!(sink.frames.load(Ordering::SeqCst), 4);
        assert_eq!(player.status(), PlayerStatus::Idle);
        assert!(player.resource().is_none());
    }

    #[tokio::test]
    async fn play_while_busy_is_rejected() {
        let player = Player::new(fast_behaviors(NoSubscriberBehavior::Play));
        let pending = create_audio_resource(
            AudioSource::stream(stream::pending()),
            ResourceOptions {
                stream_type: StreamType::Opus,
                ..ResourceOptions::default()
            },
        );
        player.play(pending).unwrap();
        assert!(matches!(
            player.play(opus_resource(1)),
            Err(VoiceError::PlayerBusy)
        ));
        assert!(player.stop());
        assert!(!player.stop());
    }

    #[tokio::test]
    async fn stop_reports_stopped_reason() {
        let player = Player::new(fast_behaviors(NoSubscriberBehavior::Play));
        let mut events = player.events();
        let pending = create_audio_resource(
            AudioSource::stream(stream::pending()),
            ResourceOptions {
                stream_type: StreamType::Opus,
                ..ResourceOptions::default()
            },
        );
        player.play(pending).unwrap();
        player.stop();
        assert_eq!(wait_for_idle(&mut events).await.unwrap(), PlaybackEnd::Stopped);
    }

    #[tokio::test]
    async fn stalled_resource_underruns_after_tolerance() {
        let player = Player::new(fast_behaviors(NoSubscriberBehavior::Play));
        let sink = Arc::new(CountingSink::default());
        player.add_sink(sink.clone());
        let mut events = player.events();

        let first = stream::iter(vec![Ok(Bytes::from_static(&[0xf8, 0x00]))]);
        let resource = create_audio_resource(
            AudioSource::stream(first.chain(stream::pending())),
            ResourceOptions {
                stream_type: StreamType::Opus,
                ..ResourceOptions::default()
            },
        );
        player.play(resource).unwrap();

        assert_eq!(wait_for_idle(&mut events).await.unwrap(), PlaybackEnd::Underrun);
        assert_eq!(sink.frames.load(Ordering::SeqCst), 1);
        assert_eq!(sink.silence.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn decoder_errors_end_playback_with_reason() {
        let player = Player::new(fast_behaviors(NoSubscriberBehavior::Play));
        let mut events = player.events();
        let resource = create_audio_resource(
            AudioSource::parse("/missing/clip.ogg"),
            ResourceOptions {
                stream_type: StreamType::OggOpus,
                ..ResourceOptions::default()
            },
        );
        player.play(resource).unwrap();

        match wait_for_idle(&mut events).await.unwrap() {
            PlaybackEnd::Errored(message) => assert!(message.contains("failed to open")),
            other => panic!("expected Errored, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stop_behavior_ends_without_subscribers() {
        let player = Player::new(fast_behaviors(NoSubscriberBehavior::Stop));
        let mut events = player.events();
        player.play(opus_resource(10)).unwrap();
        assert_eq!(
            wait_for_idle(&mut events).await.unwrap(),
            PlaybackEnd::NoSubscribers
        );
    }

    #[tokio::test]
    async fn pause_holds_frames_until_unpaused() {
        let player = Player::new(fast_behaviors(NoSubscriberBehavior::Play));
        let sink = Arc::new(CountingSink::default());
        player.add_sink(sink.clone());
        let mut events = player.events();

        player.play(opus_resource(3)).unwrap();
        assert!(player.pause());
        assert_eq!(player.status(), PlayerStatus::Paused);
        time::sleep(Duration::from_millis(40)).await;
        assert_eq!(sink.frames.load(Ordering::SeqCst), 0);

        assert!(player.unpause());
        assert_eq!(wait_for_idle(&mut events).await.unwrap(), PlaybackEnd::Finished);
        assert_eq!(sink.frames.load(Ordering::SeqCst), 3);
    }

    /// Plays nothing itself; records what the player asked of it.
    #[derive(Default)]
    struct ScriptedEngine {
        controls: Mutex<Vec<PlayerStatus>>,
        volumes: Mutex<Vec<Option<f32>>>,
        cancelled: AtomicUsize,
    }

    #[async_trait]
    impl TrackEngine for ScriptedEngine {
        async fn play(&self, resource: AudioResource, mut run: PlaybackRun) {
            self.volumes.lock().unwrap().push(resource.handle().volume());
            run.started();
            let cancel = run.cancellation();
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        self.cancelled.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                    control = run.next_control() => match control {
                        Some(status) => {
                            let mut controls = self.controls.lock().unwrap();
                            controls.push(status);
                            // Paused then resumed: let the track end.
                            if status == PlayerStatus::Playing {
                                drop(controls);
                                run.finish(PlaybackEnd::Finished);
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        }
    }

    struct EngineSink {
        engine: Arc<ScriptedEngine>,
        frames: AtomicUsize,
    }

    impl FrameSink for EngineSink {
        fn is_ready(&self) -> bool {
            true
        }

        fn send_frame(&self, _frame: &AudioFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }

        fn track_engine(&self) -> Option<Arc<dyn TrackEngine>> {
            Some(self.engine.clone())
        }
    }

    fn engine_sink() -> Arc<EngineSink> {
        Arc::new(EngineSink {
            engine: Arc::default(),
            frames: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn track_engine_takes_over_playback() {
        let player = Player::new(fast_behaviors(NoSubscriberBehavior::Play));
        let sink = engine_sink();
        player.add_sink(sink.clone());
        let mut events = player.events();

        let handle = player.play(opus_resource(3)).unwrap();
        // Set before the engine task first runs.
        handle.set_volume(0.5);
        loop {
            let change = events.recv().await.unwrap();
            if change.new == PlayerStatus::Playing {
                break;
            }
        }

        assert!(player.pause());
        assert!(player.unpause());
        assert_eq!(wait_for_idle(&mut events).await.unwrap(), PlaybackEnd::Finished);
        assert_eq!(
            *sink.engine.controls.lock().unwrap(),
            vec![PlayerStatus::Paused, PlayerStatus::Playing]
        );
        assert_eq!(*sink.engine.volumes.lock().unwrap(), vec![Some(0.5)]);
        // The engine plays the resource; no frames are ticked out.
        assert_eq!(sink.frames.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_cancels_the_track_engine() {
        let player = Player::new(fast_behaviors(NoSubscriberBehavior::Play));
        let sink = engine_sink();
        player.add_sink(sink.clone());
        let mut events = player.events();

        player.play(opus_resource(3)).unwrap();
        tokio::task::yield_now().await;
        assert!(player.stop());
        assert_eq!(wait_for_idle(&mut events).await.unwrap(), PlaybackEnd::Stopped);

        for _ in 0..50 {
            if sink.engine.cancelled.load(Ordering::SeqCst) == 1 {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sink.engine.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn factory_rejects_zero_frame_duration() {
        let behaviors = PlayerBehaviors {
            frame_duration: Duration::ZERO,
            ..PlayerBehaviors::default()
        };
        assert!(matches!(create_player(behaviors), Err(VoiceError::Config(_))));
    }
}
