//! Per-stem playback controller.
//!
//! A controller owns one `PlaybackState` and drives one `PlaybackDevice`.
//! Device notifications arrive over a `Subscription`, a scoped receiver:
//! dropping it (on deactivation or source change) closes the channel, so a
//! device can never reach a discarded state.  Each subscription carries a
//! generation and the controller ignores anything tagged with another one.
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::PlaybackError;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    PositionUpdated(f64),
    MetadataReady { duration_secs: f64 },
    Ended,
    Error(String),
}

/// Device side of a subscription.
#[derive(Debug, Clone)]
pub struct DeviceEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, DeviceEvent)>,
}

impl DeviceEventSender {
    /// Returns false once the subscriber has gone away.
    pub fn emit(&self, event: DeviceEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    pub fn is_released(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Controller side of a subscription.  Released on drop.
#[derive(Debug)]
pub struct Subscription {
    generation: u64,
    rx: mpsc::UnboundedReceiver<(u64, DeviceEvent)>,
}

impl Subscription {
    pub fn channel() -> (DeviceEventSender, Subscription) {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        (
            DeviceEventSender { generation, tx },
            Subscription { generation, rx },
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn recv(&mut self) -> Option<(u64, DeviceEvent)> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<(u64, DeviceEvent)> {
        self.rx.try_recv().ok()
    }
}

/// What a controller needs from an audio backend.
pub trait PlaybackDevice: Send + Sync {
    fn load(&self, url: &str) -> impl Future<Output = Result<(), PlaybackError>> + Send;
    fn play(&self) -> impl Future<Output = Result<(), PlaybackError>> + Send;
    fn pause(&self) -> impl Future<Output = Result<(), PlaybackError>> + Send;
    fn seek_to(&self, secs: f64) -> impl Future<Output = Result<(), PlaybackError>> + Send;
    fn set_muted(&self, muted: bool);
    /// Start delivering notifications to a fresh subscription.  Any earlier
    /// subscription stops receiving.
    fn subscribe(&self) -> Subscription;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub source_url: String,
    pub is_playing: bool,
    pub is_muted: bool,
    pub position_secs: f64,
    /// `None` until the device has reported metadata.
    pub duration_secs: Option<f64>,
    pub is_loading: bool,
    /// Terminal for this stem until `reload`.
    pub last_error: Option<PlaybackError>,
}

impl PlaybackState {
    fn fresh(source_url: String, is_muted: bool) -> Self {
        Self {
            source_url,
            is_playing: false,
            is_muted,
            position_secs: 0.0,
            duration_secs: None,
            is_loading: true,
            last_error: None,
        }
    }
}

pub struct PlaybackController<D> {
    device: D,
    state: PlaybackState,
    subscription: Option<Subscription>,
}

impl<D: PlaybackDevice> PlaybackController<D> {
    pub fn new(device: D, source_url: impl Into<String>) -> Self {
        Self {
            device,
            state: PlaybackState::fresh(source_url.into(), false),
            subscription: None,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_some()
    }

    /// Generation of the live subscription, if any.
    pub fn generation(&self) -> Option<u64> {
        self.subscription.as_ref().map(Subscription::generation)
    }

    /// Subscribe to the device and load the current source.
    pub async fn activate(&mut self) {
        // Subscribe before loading so an early metadata event is not lost.
        self.subscription = Some(self.device.subscribe());
        self.device.set_muted(self.state.is_muted);

        info!("playback: loading {}", self.state.source_url);
        if let Err(e) = self.device.load(&self.state.source_url).await {
            warn!("playback: load failed for {}: {}", self.state.source_url, e);
            self.fail(e);
        }
    }

    /// Release the device subscription.  Events still queued are discarded.
    pub fn deactivate(&mut self) {
        if self.subscription.take().is_some() {
            debug!("playback: released subscription for {}", self.state.source_url);
        }
    }

    /// Point the controller at another stem.  The old subscription is
    /// released before the new source is loaded.
    pub async fn set_source(&mut self, source_url: impl Into<String>) {
        let was_active = self.is_active();
        self.deactivate();
        self.state = PlaybackState::fresh(source_url.into(), self.state.is_muted);
        if was_active {
            self.activate().await;
        }
    }

    /// Clear a terminal error and load the same source again.
    pub async fn reload(&mut self) {
        info!("playback: reload {}", self.state.source_url);
        self.deactivate();
        let source_url = std::mem::take(&mut self.state.source_url);
        self.state = PlaybackState::fresh(source_url, self.state.is_muted);
        self.activate().await;
    }

    pub async fn toggle_play_pause(&mut self) {
        if self.state.last_error.is_some() {
            debug!("playback: ignoring play/pause in error state");
            return;
        }

        if self.state.is_playing {
            match self.device.pause().await {
                Ok(()) => self.state.is_playing = false,
                Err(e) => {
                    warn!("playback: pause failed: {}", e);
                    self.fail(e);
                }
            }
        } else {
            match self.device.play().await {
                Ok(()) => self.state.is_playing = true,
                Err(e) => {
                    warn!("playback: play failed: {}", e);
                    self.fail(e);
                }
            }
        }
    }

    pub fn toggle_mute(&mut self) {
        self.state.is_muted = !self.state.is_muted;
        self.device.set_muted(self.state.is_muted);
    }

    /// Seek to a fraction (0..=1) of the duration.  No-op while loading, in
    /// the error state, or before the duration is known.
    pub async fn seek(&mut self, fraction: f64) {
        if self.state.is_loading || self.state.last_error.is_some() {
            return;
        }
        let Some(duration) = self.state.duration_secs.filter(|d| *d > 0.0) else {
            return;
        };
        if !fraction.is_finite() {
            return;
        }

        let target = fraction.clamp(0.0, 1.0) * duration;
        self.state.position_secs = target;
        if let Err(e) = self.device.seek_to(target).await {
            warn!("playback: seek to {:.2}s failed: {}", target, e);
        }
    }

    /// Apply one device notification.  Events from any other generation than
    /// the live subscription are dropped, as is everything after a terminal
    /// error.
    pub fn handle_event(&mut self, generation: u64, event: DeviceEvent) {
        if self.generation() != Some(generation) {
            debug!("playback: dropping stale event {:?}", event);
            return;
        }
        if self.state.last_error.is_some() {
            return;
        }

        match event {
            DeviceEvent::MetadataReady { duration_secs } => {
                if duration_secs.is_finite() && duration_secs >= 0.0 {
                    self.state.duration_secs = Some(duration_secs);
                    self.state.position_secs = self.state.position_secs.clamp(0.0, duration_secs);
                    self.state.is_loading = false;
                }
            }
            DeviceEvent::PositionUpdated(secs) => {
                if !secs.is_finite() {
                    return;
                }
                let upper = self.state.duration_secs.unwrap_or(f64::MAX);
                self.state.position_secs = secs.clamp(0.0, upper);
            }
            DeviceEvent::Ended => {
                self.state.is_playing = false;
                self.state.position_secs = 0.0;
            }
            DeviceEvent::Error(message) => {
                warn!("playback: device error on {}: {}", self.state.source_url, message);
                self.fail(PlaybackError::Device(message));
            }
        }
    }

    /// Apply every notification already queued; returns how many were seen.
    pub fn pump(&mut self) -> usize {
        let mut seen = 0;
        while let Some((generation, event)) =
            self.subscription.as_mut().and_then(Subscription::try_recv)
        {
            self.handle_event(generation, event);
            seen += 1;
        }
        seen
    }

    /// Wait for the next notification and apply it.  `None` when inactive
    /// or when the device side has gone away.  Cancel safe.
    pub async fn next_event(&mut self) -> Option<DeviceEvent> {
        let (generation, event) = self.subscription.as_mut()?.recv().await?;
        self.handle_event(generation, event.clone());
        Some(event)
    }

    /// Position as a fraction of the duration, 0 when unknown.
    pub fn progress_fraction(&self) -> f64 {
        match self.state.duration_secs {
            Some(d) if d > 0.0 => (self.state.position_secs / d).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }

    pub fn remaining(&self) -> Option<f64> {
        self.state
            .duration_secs
            .map(|d| (d - self.state.position_secs).max(0.0))
    }

    fn fail(&mut self, error: PlaybackError) {
        self.state.last_error = Some(error);
        self.state.is_loading = false;
        self.state.is_playing = false;
    }
}

/// `m:ss`, with minutes unbounded.
pub fn format_time(secs: f64) -> String {
    if !secs.is_finite() || secs < 0.0 {
        return "0:00".to_string();
    }
    let total = secs.floor() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDevice {
        commands: Mutex<Vec<String>>,
        sender: Mutex<Option<DeviceEventSender>>,
        fail_load: bool,
        fail_play: bool,
        fail_pause: bool,
    }

    impl FakeDevice {
        fn record(&self, command: String) {
            self.commands.lock().unwrap().push(command);
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn sender(&self) -> DeviceEventSender {
            self.sender.lock().unwrap().clone().unwrap()
        }

        fn emit(&self, event: DeviceEvent) -> bool {
            self.sender().emit(event)
        }
    }

    impl PlaybackDevice for FakeDevice {
        fn load(&self, url: &str) -> impl Future<Output = Result<(), PlaybackError>> + Send {
            self.record(format!("load {}", url));
            let result = if self.fail_load {
                Err(PlaybackError::Load("cannot decode".into()))
            } else {
                Ok(())
            };
            std::future::ready(result)
        }

        fn play(&self) -> impl Future<Output = Result<(), PlaybackError>> + Send {
            self.record("play".into());
            let result = if self.fail_play {
                Err(PlaybackError::Play("device busy".into()))
            } else {
                Ok(())
            };
            std::future::ready(result)
        }

        fn pause(&self) -> impl Future<Output = Result<(), PlaybackError>> + Send {
            self.record("pause".into());
            let result = if self.fail_pause {
                Err(PlaybackError::Device("ipc closed".into()))
            } else {
                Ok(())
            };
            std::future::ready(result)
        }

        fn seek_to(&self, secs: f64) -> impl Future<Output = Result<(), PlaybackError>> + Send {
            self.record(format!("seek {}", secs));
            std::future::ready(Ok(()))
        }

        fn set_muted(&self, muted: bool) {
            self.record(format!("mute {}", muted));
        }

        fn subscribe(&self) -> Subscription {
            let (tx, sub) = Subscription::channel();
            *self.sender.lock().unwrap() = Some(tx);
            sub
        }
    }

    async fn loaded(duration: f64) -> PlaybackController<FakeDevice> {
        let mut c = PlaybackController::new(FakeDevice::default(), "http://h/stems/j/vocals.wav");
        c.activate().await;
        c.device().emit(DeviceEvent::MetadataReady {
            duration_secs: duration,
        });
        c.pump();
        c
    }

    #[tokio::test]
    async fn metadata_clears_loading_and_sets_duration() {
        let c = loaded(200.0).await;
        assert!(!c.state().is_loading);
        assert_eq!(c.state().duration_secs, Some(200.0));
        assert_eq!(
            c.device().commands(),
            vec!["mute false", "load http://h/stems/j/vocals.wav"]
        );
    }

    #[tokio::test]
    async fn seek_half_of_200_seconds_lands_at_100() {
        let mut c = loaded(200.0).await;
        c.seek(0.5).await;
        assert_eq!(c.state().position_secs, 100.0);
        assert!(c.device().commands().contains(&"seek 100".to_string()));
        assert_eq!(c.progress_fraction(), 0.5);
        assert_eq!(c.remaining(), Some(100.0));
    }

    #[tokio::test]
    async fn seek_before_metadata_is_a_no_op() {
        let mut c = PlaybackController::new(FakeDevice::default(), "u");
        c.activate().await;
        c.seek(0.5).await;
        assert_eq!(c.state().position_secs, 0.0);
        assert!(c.device().commands().iter().all(|cmd| !cmd.starts_with("seek")));
    }

    #[tokio::test]
    async fn seek_fraction_is_clamped() {
        let mut c = loaded(60.0).await;
        c.seek(3.0).await;
        assert_eq!(c.state().position_secs, 60.0);
    }

    #[tokio::test]
    async fn play_pause_flips_on_success() {
        let mut c = loaded(10.0).await;
        c.toggle_play_pause().await;
        assert!(c.state().is_playing);
        c.toggle_play_pause().await;
        assert!(!c.state().is_playing);
        assert!(c.state().last_error.is_none());
    }

    #[tokio::test]
    async fn failed_play_records_error_and_stops() {
        let device = FakeDevice {
            fail_play: true,
            ..Default::default()
        };
        let mut c = PlaybackController::new(device, "u");
        c.activate().await;
        c.toggle_play_pause().await;

        assert!(!c.state().is_playing);
        assert_eq!(
            c.state().last_error,
            Some(PlaybackError::Play("device busy".into()))
        );

        // Terminal: further toggles do not reach the device.
        c.toggle_play_pause().await;
        let plays = c.device().commands().iter().filter(|c| *c == "play").count();
        assert_eq!(plays, 1);
    }

    #[tokio::test]
    async fn failed_pause_records_error_and_stops() {
        let device = FakeDevice {
            fail_pause: true,
            ..Default::default()
        };
        let mut c = PlaybackController::new(device, "u");
        c.activate().await;
        c.toggle_play_pause().await;
        assert!(c.state().is_playing);

        c.toggle_play_pause().await;
        assert!(!c.state().is_playing);
        assert_eq!(
            c.state().last_error,
            Some(PlaybackError::Device("ipc closed".into()))
        );

        c.toggle_play_pause().await;
        let pauses = c.device().commands().iter().filter(|c| *c == "pause").count();
        assert_eq!(pauses, 1);
    }

    #[tokio::test]
    async fn failed_load_is_terminal_until_reload() {
        let device = FakeDevice {
            fail_load: true,
            ..Default::default()
        };
        let mut c = PlaybackController::new(device, "u");
        c.activate().await;
        assert!(!c.state().is_loading);
        let shown = c.state().last_error.as_ref().map(|e| e.to_string());
        assert_eq!(shown.as_deref(), Some("failed to load audio: cannot decode"));
    }

    #[tokio::test]
    async fn position_updates_are_clamped_to_duration() {
        let mut c = loaded(100.0).await;
        c.device().emit(DeviceEvent::PositionUpdated(42.5));
        c.device().emit(DeviceEvent::PositionUpdated(250.0));
        assert_eq!(c.pump(), 2);
        assert_eq!(c.state().position_secs, 100.0);
        c.device().emit(DeviceEvent::PositionUpdated(-1.0));
        c.pump();
        assert_eq!(c.state().position_secs, 0.0);
    }

    #[tokio::test]
    async fn ended_resets_position_and_stops() {
        let mut c = loaded(100.0).await;
        c.toggle_play_pause().await;
        c.device().emit(DeviceEvent::PositionUpdated(99.0));
        c.device().emit(DeviceEvent::Ended);
        c.pump();
        assert!(!c.state().is_playing);
        assert_eq!(c.state().position_secs, 0.0);
    }

    #[tokio::test]
    async fn device_error_is_terminal_and_reload_recovers() {
        let mut c = loaded(100.0).await;
        c.device().emit(DeviceEvent::Error("codec not found".into()));
        c.device().emit(DeviceEvent::PositionUpdated(5.0));
        c.pump();
        assert_eq!(
            c.state().last_error,
            Some(PlaybackError::Device("codec not found".into()))
        );
        assert_eq!(c.state().position_secs, 0.0);

        c.seek(0.5).await;
        assert_eq!(c.state().position_secs, 0.0);

        c.reload().await;
        assert!(c.state().last_error.is_none());
        assert!(c.state().is_loading);
        assert_eq!(c.state().source_url, "http://h/stems/j/vocals.wav");
    }

    #[tokio::test]
    async fn mute_is_applied_and_survives_source_change() {
        let mut c = loaded(10.0).await;
        c.toggle_mute();
        assert!(c.state().is_muted);

        c.set_source("http://h/stems/j/drums.wav").await;
        assert!(c.state().is_muted);
        assert!(c.state().is_loading);
        let commands = c.device().commands();
        assert_eq!(
            commands.last().map(String::as_str),
            Some("load http://h/stems/j/drums.wav")
        );
        assert!(commands.contains(&"mute true".to_string()));
    }

    #[tokio::test]
    async fn source_change_releases_old_subscription() {
        let mut c = loaded(10.0).await;
        let old = c.device().sender();
        let old_generation = c.generation().unwrap();

        c.set_source("other").await;
        assert!(old.is_released());
        assert!(!old.emit(DeviceEvent::Ended));
        assert_ne!(c.generation(), Some(old_generation));

        // A stale event handed in directly is ignored too.
        c.handle_event(old_generation, DeviceEvent::MetadataReady { duration_secs: 1.0 });
        assert!(c.state().is_loading);
    }

    #[tokio::test]
    async fn deactivation_drops_queued_events() {
        let mut c = loaded(10.0).await;
        let sender = c.device().sender();
        sender.emit(DeviceEvent::PositionUpdated(3.0));
        c.deactivate();

        assert!(sender.is_released());
        assert_eq!(c.pump(), 0);
        assert_eq!(c.state().position_secs, 0.0);
        assert!(c.next_event().await.is_none());
    }

    #[tokio::test]
    async fn next_event_applies_and_returns_the_event() {
        let mut c = loaded(10.0).await;
        c.device().emit(DeviceEvent::PositionUpdated(4.0));
        assert_eq!(c.next_event().await, Some(DeviceEvent::PositionUpdated(4.0)));
        assert_eq!(c.state().position_secs, 4.0);
    }

    #[test]
    fn time_formatting() {
        assert_eq!(format_time(0.0), "0:00");
        assert_eq!(format_time(59.9), "0:59");
        assert_eq!(format_time(200.0), "3:20");
        assert_eq!(format_time(3725.0), "62:05");
        assert_eq!(format_time(f64::NAN), "0:00");
        assert_eq!(format_time(-3.0), "0:00");
    }
}
