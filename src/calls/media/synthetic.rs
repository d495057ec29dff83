use super::{CaptureDevices, CaptureFailure, MediaConstraints, MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Software capture devices that produce placeholder tracks.
///
/// Counts how many tracks are live so callers can check that every path
/// releases the "hardware".
pub struct SyntheticDevices {
    microphone_present: AtomicBool,
    camera_present: AtomicBool,
    permission_denied: AtomicBool,
    busy: AtomicBool,
    prompt_delay: Mutex<Duration>,
    next_failure: Mutex<Option<CaptureFailure>>,
    last_constraints: Mutex<Option<MediaConstraints>>,
    live_tracks: Arc<AtomicUsize>,
    requests: AtomicUsize,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            microphone_present: AtomicBool::new(true),
            camera_present: AtomicBool::new(true),
            permission_denied: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            prompt_delay: Mutex::new(Duration::ZERO),
            next_failure: Mutex::new(None),
            last_constraints: Mutex::new(None),
            live_tracks: Arc::new(AtomicUsize::new(0)),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn set_microphone_present(&self, present: bool) {
        self.microphone_present.store(present, Ordering::SeqCst);
    }

    pub fn set_camera_present(&self, present: bool) {
        self.camera_present.store(present, Ordering::SeqCst);
    }

    pub fn deny_permission(&self, denied: bool) {
        self.permission_denied.store(denied, Ordering::SeqCst);
    }

    /// Simulate another application holding the devices.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Time the simulated permission prompt stays open.
    pub fn set_prompt_delay(&self, delay: Duration) {
        *self
            .prompt_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Fail the next request with the named capture error.
    pub fn fail_next(&self, name: &str, message: &str) {
        *self
            .next_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) =
            Some(CaptureFailure::from_name(name, message));
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.live_tracks.load(Ordering::SeqCst)
    }

    /// Number of capture requests made so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn last_constraints(&self) -> Option<MediaConstraints> {
        *self
            .last_constraints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn open_track(&self, kind: TrackKind, label: &str) -> MediaTrack {
        let track = MediaTrack::new(kind, label);
        self.live_tracks.fetch_add(1, Ordering::SeqCst);
        let live = Arc::clone(&self.live_tracks);
        track.on_stop(move || {
            live.fetch_sub(1, Ordering::SeqCst);
        });
        track
    }
}

#[async_trait]
impl CaptureDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, CaptureFailure> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self
            .last_constraints
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(*constraints);

        let delay = *self
            .prompt_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .next_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(failure) = injected {
            return Err(failure);
        }
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(CaptureFailure::NotAllowed);
        }
        let wants_video = constraints.video.is_some();
        if !self.microphone_present.load(Ordering::SeqCst)
            || (wants_video && !self.camera_present.load(Ordering::SeqCst))
        {
            return Err(CaptureFailure::NotFound);
        }
        if self.busy.load(Ordering::SeqCst) {
            return Err(CaptureFailure::NotReadable);
        }

        let id: [u8; 8] = rand::random();
        let stream = MediaStream::new(format!("local-{}", hex::encode(id)));
        stream.add_track(self.open_track(TrackKind::Audio, "Synthetic Microphone"));
        if wants_video {
            stream.add_track(self.open_track(TrackKind::Video, "Synthetic Camera"));
        }
        debug!(
            "Synthetic capture opened {} track(s) for {}",
            stream.tracks().len(),
            stream.id()
        );
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_requests_and_constraints() {
        let devices = SyntheticDevices::new();
        assert!(devices.last_constraints().is_none());

        let stream = devices
            .get_user_media(&MediaConstraints::for_call(false))
            .await
            .unwrap();
        assert_eq!(devices.requests(), 1);
        assert_eq!(stream.tracks().len(), 1);
        assert!(devices.last_constraints().unwrap().video.is_none());
        stream.stop_all();
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let devices = SyntheticDevices::new();
        devices.fail_next("AbortError", "prompt dismissed");
        let err = devices
            .get_user_media(&MediaConstraints::for_call(false))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CaptureFailure::Other {
                name: "AbortError".to_string(),
                message: "prompt dismissed".to_string()
            }
        );
        assert!(
            devices
                .get_user_media(&MediaConstraints::for_call(false))
                .await
                .is_ok()
        );
    }
}
