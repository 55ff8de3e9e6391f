use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    CameraFacing, LocalMedia, LocalTrack, MediaAcquisition, MediaConstraints, MediaError, TrackKind,
    VideoDevice,
};

/// Headless capture source: mints track descriptors for a fixed device list.
pub struct StaticMediaSource {
    devices: Vec<VideoDevice>,
    next_track: AtomicU64,
    live: Mutex<HashSet<String>>,
}

impl Default for StaticMediaSource {
    fn default() -> Self {
        Self::new(vec![
            VideoDevice {
                id: "camera-front".into(),
                label: "Front camera".into(),
                facing: CameraFacing::Front,
            },
            VideoDevice {
                id: "camera-back".into(),
                label: "Back camera".into(),
                facing: CameraFacing::Back,
            },
        ])
    }
}

impl StaticMediaSource {
    pub fn new(devices: Vec<VideoDevice>) -> Self {
        Self {
            devices,
            next_track: AtomicU64::new(1),
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Tracks minted and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.live.lock().len()
    }

    fn mint(&self, kind: TrackKind, device_id: Option<String>) -> LocalTrack {
        let seq = self.next_track.fetch_add(1, Ordering::Relaxed);
        let prefix = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let track = LocalTrack {
            id: format!("{prefix}-{seq}"),
            kind,
            device_id,
            enabled: true,
        };
        self.live.lock().insert(track.id.clone());
        track
    }
}

#[async_trait]
impl MediaAcquisition for StaticMediaSource {
    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        let audio = constraints
            .audio
            .then(|| self.mint(TrackKind::Audio, Some("microphone".into())));
        let video = if constraints.video {
            let device = self
                .devices
                .iter()
                .find(|device| device.facing == constraints.facing)
                .or_else(|| self.devices.first())
                .ok_or_else(|| MediaError::Device("no video device available".into()))?;
            Some(self.mint(TrackKind::Video, Some(device.id.clone())))
        } else {
            None
        };
        Ok(LocalMedia {
            stream_id: Uuid::new_v4().to_string(),
            audio,
            video,
        })
    }

    async fn enumerate_video_devices(&self) -> Result<Vec<VideoDevice>, MediaError> {
        Ok(self.devices.clone())
    }

    async fn open_video_device(&self, device: &VideoDevice) -> Result<LocalTrack, MediaError> {
        if !self.devices.iter().any(|known| known.id == device.id) {
            return Err(MediaError::Device(format!("unknown device {}", device.id)));
        }
        Ok(self.mint(TrackKind::Video, Some(device.id.clone())))
    }

    fn set_track_enabled(&self, track: &mut LocalTrack, enabled: bool) {
        track.enabled = enabled;
    }

    fn stop_track(&self, track: &LocalTrack) {
        self.live.lock().remove(&track.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn acquires_front_camera_and_microphone_by_default() {
        let source = StaticMediaSource::default();
        let media = source
            .acquire_local_media(&MediaConstraints::default())
            .await
            .expect("media");
        assert_eq!(media.audio.as_ref().map(|t| t.kind), Some(TrackKind::Audio));
        let video = media.video.as_ref().expect("video track");
        assert_eq!(video.device_id.as_deref(), Some("camera-front"));
        assert_eq!(source.live_tracks(), 2);

        for track in media.tracks() {
            source.stop_track(track);
        }
        assert_eq!(source.live_tracks(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn video_without_devices_is_an_error() {
        let source = StaticMediaSource::new(Vec::new());
        let result = source.acquire_local_media(&MediaConstraints::default()).await;
        assert!(matches!(result, Err(MediaError::Device(_))));

        let audio_only = MediaConstraints {
            video: false,
            ..MediaConstraints::default()
        };
        let media = source.acquire_local_media(&audio_only).await.expect("audio");
        assert!(media.video.is_none());
    }
}
