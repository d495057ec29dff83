//! Local media capture.
//!
//! A [`MediaStream`] is a shared handle over a list of [`MediaTrack`]s. Tracks
//! stay live (holding the capture device) until [`MediaTrack::stop`] is
//! called; the session that acquired a stream is its only owner and is
//! responsible for stopping it on every exit path.

pub mod synthetic;

use async_trait::async_trait;
use log::{info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

use super::error::MediaError;

pub use synthetic::SyntheticDevices;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

type StopHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: Arc<AtomicBool>,
    live: AtomicBool,
    on_stop: Mutex<Option<StopHook>>,
}

/// One audio or video track. Clones share state.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        let id: [u8; 8] = rand::random();
        Self::with_id(hex::encode(id), kind, label)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                enabled: Arc::new(AtomicBool::new(true)),
                live: AtomicBool::new(true),
                on_stop: Mutex::new(None),
            }),
        }
    }

    /// A receive-side view of this track: same id and kind, and an `enabled`
    /// flag that follows the sender's.
    pub fn mirror(&self) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: self.inner.id.clone(),
                kind: self.inner.kind,
                label: self.inner.label.clone(),
                enabled: Arc::clone(&self.inner.enabled),
                live: AtomicBool::new(true),
                on_stop: Mutex::new(None),
            }),
        }
    }

    /// Run `hook` once, when the track is first stopped.
    pub fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        *self
            .inner
            .on_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Release the underlying device. Only the first call has an effect.
    pub fn stop(&self) {
        if !self.inner.live.swap(false, Ordering::SeqCst) {
            return;
        }
        let hook = self
            .inner
            .on_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// A set of tracks. Clones share the same track list.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<RwLock<Vec<MediaTrack>>>,
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks())
            .finish()
    }
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        let stream = Self::new(id);
        for track in tracks {
            stream.add_track(track);
        }
        stream
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.tracks()
            .into_iter()
            .filter(|t| t.kind() == kind)
            .collect()
    }

    /// Add a track unless one with the same id is already present.
    pub fn add_track(&self, track: MediaTrack) -> bool {
        let mut tracks = self
            .tracks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }

    pub fn has_live_tracks(&self) -> bool {
        self.tracks().iter().any(MediaTrack::is_live)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing_mode: FacingMode,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            facing_mode: FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Microphone always, camera only for video calls.
    pub fn for_call(wants_video: bool) -> Self {
        Self {
            audio: AudioConstraints::default(),
            video: wants_video.then(VideoConstraints::default),
        }
    }
}

/// Raw capture failure, named after the DOM exceptions capture APIs raise.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureFailure {
    #[error("NotAllowedError")]
    NotAllowed,
    #[error("NotFoundError")]
    NotFound,
    #[error("NotReadableError")]
    NotReadable,
    #[error("{name}: {message}")]
    Other { name: String, message: String },
}

impl CaptureFailure {
    pub fn from_name(name: &str, message: impl Into<String>) -> Self {
        match name {
            "NotAllowedError" | "PermissionDeniedError" => Self::NotAllowed,
            "NotFoundError" | "DevicesNotFoundError" => Self::NotFound,
            "NotReadableError" | "TrackStartError" => Self::NotReadable,
            _ => Self::Other {
                name: name.to_string(),
                message: message.into(),
            },
        }
    }
}

/// Platform capture API.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    /// May wait indefinitely on a permission prompt.
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CaptureFailure>;
}

/// Turns a capture request into a live stream or a classified [`MediaError`].
#[derive(Clone)]
pub struct MediaAcquirer {
    devices: Arc<dyn CaptureDevices>,
}

impl MediaAcquirer {
    pub fn new(devices: Arc<dyn CaptureDevices>) -> Self {
        Self { devices }
    }

    pub async fn acquire(&self, wants_video: bool) -> Result<MediaStream, MediaError> {
        let constraints = MediaConstraints::for_call(wants_video);
        match self.devices.get_user_media(&constraints).await {
            Ok(stream) => {
                info!(
                    "Acquired local stream {} ({} audio, {} video)",
                    stream.id(),
                    stream.audio_tracks().len(),
                    stream.video_tracks().len()
                );
                Ok(stream)
            }
            Err(failure) => {
                warn!("Media acquisition failed: {}", failure);
                Err(match failure {
                    CaptureFailure::NotAllowed => {
                        MediaError::PermissionDenied { video: wants_video }
                    }
                    CaptureFailure::NotFound => MediaError::DeviceNotFound { video: wants_video },
                    CaptureFailure::NotReadable => MediaError::DeviceBusy,
                    CaptureFailure::Other { name, message } => {
                        MediaError::Other(format!("{}: {}", name, message))
                    }
                })
            }
        }
    }
}
