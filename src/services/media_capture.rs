use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::MediaAccessError;
use crate::models::session::MediaKind;
use crate::services::session_machine::MediaOutcome;

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn stop(&mut self);
}

/// An acquired capture stream. All tracks are stopped on `stop` or drop.
pub struct MediaStream {
    kind: MediaKind,
    id: String,
    tracks: Vec<Box<dyn MediaTrack>>,
    ended: Option<oneshot::Receiver<()>>,
}

impl MediaStream {
    pub fn new(kind: MediaKind, tracks: Vec<Box<dyn MediaTrack>>) -> Self {
        Self {
            kind,
            id: Uuid::new_v4().to_string(),
            tracks,
            ended: None,
        }
    }

    /// Fires when the user ends the stream from outside the exam (for
    /// example the browser's "Stop sharing" button).
    pub fn with_end_signal(mut self, ended: oneshot::Receiver<()>) -> Self {
        self.ended = Some(ended);
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn take_end_signal(&mut self) -> Option<oneshot::Receiver<()>> {
        self.ended.take()
    }

    pub fn stop(&mut self) {
        for track in self.tracks.iter_mut() {
            tracing::debug!(stream = %self.id, track = track.id(), "stopping media track");
            track.stop();
        }
        self.tracks.clear();
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// `getUserMedia` / `getDisplayMedia` equivalent.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self) -> Result<MediaStream, MediaAccessError>;
    async fn get_display_media(&self) -> Result<MediaStream, MediaAccessError>;
}

/// Holds the capture streams of exactly one session.
pub struct MediaCaptureManager {
    devices: Arc<dyn MediaDevices>,
    webcam: Option<MediaStream>,
    screen: Option<MediaStream>,
}

impl MediaCaptureManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            webcam: None,
            screen: None,
        }
    }

    pub async fn acquire_webcam(&mut self) -> Result<(), MediaAccessError> {
        let stream = self.devices.get_user_media().await?;
        tracing::info!(stream = stream.id(), "webcam stream acquired");
        if let Some(mut previous) = self.webcam.replace(stream) {
            previous.stop();
        }
        Ok(())
    }

    pub async fn acquire_screen_capture(&mut self) -> Result<(), MediaAccessError> {
        let stream = self.devices.get_display_media().await?;
        tracing::info!(stream = stream.id(), "screen capture stream acquired");
        if let Some(mut previous) = self.screen.replace(stream) {
            previous.stop();
        }
        Ok(())
    }

    pub async fn acquire(&mut self, webcam: bool, screen: bool) -> MediaOutcome {
        let mut outcome = MediaOutcome::default();
        if webcam {
            let result = self.acquire_webcam().await;
            if let Err(err) = &result {
                tracing::warn!(error = %err, "webcam acquisition failed");
            }
            outcome.webcam = Some(result);
        }
        if screen {
            let result = self.acquire_screen_capture().await;
            if let Err(err) = &result {
                tracing::warn!(error = %err, "screen capture acquisition failed");
            }
            outcome.screen = Some(result);
        }
        outcome
    }

    pub fn is_active(&self, kind: MediaKind) -> bool {
        self.slot(kind).is_some()
    }

    pub fn take_end_signal(&mut self, kind: MediaKind) -> Option<oneshot::Receiver<()>> {
        match kind {
            MediaKind::Webcam => self.webcam.as_mut()?.take_end_signal(),
            MediaKind::Screen => self.screen.as_mut()?.take_end_signal(),
        }
    }

    pub fn release(&mut self, kind: MediaKind) {
        let slot = match kind {
            MediaKind::Webcam => self.webcam.take(),
            MediaKind::Screen => self.screen.take(),
        };
        if let Some(mut stream) = slot {
            stream.stop();
            tracing::info!(%kind, stream = stream.id(), "media stream released");
        }
    }

    pub fn release_all(&mut self) {
        self.release(MediaKind::Webcam);
        self.release(MediaKind::Screen);
    }

    fn slot(&self, kind: MediaKind) -> Option<&MediaStream> {
        match kind {
            MediaKind::Webcam => self.webcam.as_ref(),
            MediaKind::Screen => self.screen.as_ref(),
        }
    }
}

impl Drop for MediaCaptureManager {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionState {
    Granted,
    Denied,
    Dismissed,
    #[default]
    Unavailable,
}

/// Permission outcomes the exam client observed for its own
/// `getUserMedia` / `getDisplayMedia` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaGrants {
    #[serde(default)]
    pub webcam: PermissionState,
    #[serde(default)]
    pub screen: PermissionState,
}

/// Device capability backed by the client's attested permission state.
/// The physical streams live in the browser; stopping a track here flips
/// the published `*Active` flags the client follows.
pub struct AttestedMediaDevices {
    grants: MediaGrants,
}

impl AttestedMediaDevices {
    pub fn new(grants: MediaGrants) -> Self {
        Self { grants }
    }

    fn open(&self, kind: MediaKind, state: PermissionState) -> Result<MediaStream, MediaAccessError> {
        match state {
            PermissionState::Granted => {
                let track = AttestedTrack {
                    id: format!("{}-{}", kind, Uuid::new_v4()),
                    stopped: false,
                };
                Ok(MediaStream::new(kind, vec![Box::new(track)]))
            }
            PermissionState::Denied => Err(MediaAccessError::PermissionDenied(kind)),
            PermissionState::Dismissed => Err(MediaAccessError::Aborted(kind)),
            PermissionState::Unavailable => Err(MediaAccessError::Unavailable(kind)),
        }
    }
}

#[async_trait]
impl MediaDevices for AttestedMediaDevices {
    async fn get_user_media(&self) -> Result<MediaStream, MediaAccessError> {
        self.open(MediaKind::Webcam, self.grants.webcam)
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaAccessError> {
        self.open(MediaKind::Screen, self.grants.screen)
    }
}

struct AttestedTrack {
    id: String,
    stopped: bool,
}

impl MediaTrack for AttestedTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            tracing::debug!(track = %self.id, "attested track marked stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTrack {
        id: String,
        stops: Arc<AtomicUsize>,
    }

    impl MediaTrack for CountingTrack {
        fn id(&self) -> &str {
            &self.id
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingDevices {
        stops: Arc<AtomicUsize>,
        deny_screen: bool,
    }

    #[async_trait]
    impl MediaDevices for CountingDevices {
        async fn get_user_media(&self) -> Result<MediaStream, MediaAccessError> {
            let tracks: Vec<Box<dyn MediaTrack>> = vec![
                Box::new(CountingTrack {
                    id: "video".into(),
                    stops: self.stops.clone(),
                }),
                Box::new(CountingTrack {
                    id: "audio".into(),
                    stops: self.stops.clone(),
                }),
            ];
            Ok(MediaStream::new(MediaKind::Webcam, tracks))
        }

        async fn get_display_media(&self) -> Result<MediaStream, MediaAccessError> {
            if self.deny_screen {
                return Err(MediaAccessError::PermissionDenied(MediaKind::Screen));
            }
            let tracks: Vec<Box<dyn MediaTrack>> = vec![Box::new(CountingTrack {
                id: "display".into(),
                stops: self.stops.clone(),
            })];
            Ok(MediaStream::new(MediaKind::Screen, tracks))
        }
    }

    fn manager(deny_screen: bool) -> (MediaCaptureManager, Arc<AtomicUsize>) {
        let stops = Arc::new(AtomicUsize::new(0));
        let devices = Arc::new(CountingDevices {
            stops: stops.clone(),
            deny_screen,
        });
        (MediaCaptureManager::new(devices), stops)
    }

    #[tokio::test]
    async fn release_all_stops_every_track_once() {
        let (mut media, stops) = manager(false);
        let outcome = media.acquire(true, true).await;
        assert!(outcome.webcam_live());
        assert!(outcome.screen_live());

        media.release_all();
        assert_eq!(stops.load(Ordering::SeqCst), 3);
        assert!(!media.is_active(MediaKind::Webcam));

        media.release_all();
        drop(media);
        assert_eq!(stops.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dropping_the_manager_releases_streams() {
        let (mut media, stops) = manager(false);
        media.acquire(true, false).await;
        drop(media);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn partial_failure_keeps_the_successful_stream() {
        let (mut media, _stops) = manager(true);
        let outcome = media.acquire(true, true).await;
        assert!(outcome.webcam_live());
        assert_eq!(
            outcome.screen,
            Some(Err(MediaAccessError::PermissionDenied(MediaKind::Screen)))
        );
        assert!(media.is_active(MediaKind::Webcam));
        assert!(!media.is_active(MediaKind::Screen));
    }

    #[tokio::test]
    async fn attested_devices_follow_reported_permissions() {
        let devices = AttestedMediaDevices::new(MediaGrants {
            webcam: PermissionState::Granted,
            screen: PermissionState::Dismissed,
        });
        let stream = devices.get_user_media().await.unwrap();
        assert_eq!(stream.live_tracks(), 1);
        assert_eq!(
            devices.get_display_media().await.unwrap_err(),
            MediaAccessError::Aborted(MediaKind::Screen)
        );
    }
}
