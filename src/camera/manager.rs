//! Camera lifecycle from a declarative list.
//!
//! Probing runs serially: the RTSP sources usually sit behind one
//! switch and authenticator, and a thundering herd of probes takes
//! them all down together. The batch is retried until every camera is
//! ready or disabled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::camera::{Camera, CameraState};
use crate::config::{CameraConfig, SignalingConfig};
use crate::error::{AppError, Result};
use crate::webrtc::config::WebRtcConfig;

const BATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Owns every camera by name.
pub struct CameraManager {
    signaling: SignalingConfig,
    webrtc: WebRtcConfig,
    cameras: RwLock<HashMap<String, Arc<Camera>>>,
}

impl CameraManager {
    pub fn new(signaling: SignalingConfig, webrtc: WebRtcConfig) -> Self {
        Self {
            signaling,
            webrtc,
            cameras: RwLock::new(HashMap::new()),
        }
    }

    /// Register a camera. Names are unique.
    pub async fn add(&self, config: CameraConfig) -> Result<()> {
        let mut cameras = self.cameras.write().await;
        if cameras.contains_key(&config.name) {
            return Err(AppError::CameraExists(config.name));
        }
        let name = config.name.clone();
        let camera = Camera::new(config, self.signaling.clone(), self.webrtc.clone());
        cameras.insert(name, camera);
        Ok(())
    }

    /// Stop and drop a camera.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let camera = self
            .cameras
            .write()
            .await
            .remove(name)
            .ok_or_else(|| AppError::CameraNotFound(name.to_string()))?;
        camera.stop().await;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Camera>> {
        self.cameras.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cameras.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Probe every camera, serially, until the whole set has settled
    /// (ready or disabled). Blocks until then.
    pub async fn initialize_all(&self) {
        info!("initializing cameras");
        loop {
            let cameras = self.snapshot().await;
            let mut pending = 0usize;

            for camera in &cameras {
                if camera.state() != CameraState::Initializing {
                    continue;
                }
                match camera.initialize().await {
                    Ok(()) => {
                        info!("[{}] camera ready", camera.name());
                    }
                    Err(AppError::UnsupportedCodec { .. }) => {
                        // settled: that camera is out, the rest go on
                    }
                    Err(e) => {
                        warn!("[{}] initialization failed: {}", camera.name(), e);
                        pending += 1;
                    }
                }
            }

            if pending == 0 {
                let disabled = cameras
                    .iter()
                    .filter(|c| c.state() == CameraState::Disabled)
                    .count();
                info!(
                    "all cameras initialized ({} active, {} disabled)",
                    cameras.len() - disabled,
                    disabled
                );
                return;
            }
            warn!("{} cameras still unreachable, retrying batch", pending);
            tokio::time::sleep(BATCH_RETRY_DELAY).await;
        }
    }

    /// Start every settled camera (disabled ones join their room too,
    /// to answer with faults).
    pub async fn start_all(&self) -> Result<()> {
        for camera in self.snapshot().await {
            if let Err(e) = camera.start().await {
                warn!("[{}] start failed: {}", camera.name(), e);
            }
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for camera in self.snapshot().await {
            camera.stop().await;
        }
    }

    /// Stable iteration order for the serial probe.
    async fn snapshot(&self) -> Vec<Arc<Camera>> {
        let cameras = self.cameras.read().await;
        let mut list: Vec<Arc<Camera>> = cameras.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;

    fn test_config(name: &str) -> CameraConfig {
        CameraConfig {
            name: name.into(),
            url: format!("rtsp://127.0.0.1:554/{}", name),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn duplicate_names_rejected() {
        let manager = CameraManager::new(SignalingConfig::default(), WebRtcConfig::default());
        manager.add(test_config("cam_a")).await.unwrap();
        assert!(matches!(
            manager.add(test_config("cam_a")).await,
            Err(AppError::CameraExists(_))
        ));
    }

    #[tokio::test]
    async fn remove_unknown_camera_errors() {
        let manager = CameraManager::new(SignalingConfig::default(), WebRtcConfig::default());
        assert!(matches!(
            manager.remove("missing").await,
            Err(AppError::CameraNotFound(_))
        ));
    }

    #[tokio::test]
    async fn names_are_sorted() {
        let manager = CameraManager::new(SignalingConfig::default(), WebRtcConfig::default());
        manager.add(test_config("gate")).await.unwrap();
        manager.add(test_config("atrium")).await.unwrap();
        assert_eq!(manager.names().await, vec!["atrium", "gate"]);
    }

    #[tokio::test]
    async fn new_cameras_start_initializing() {
        let manager = CameraManager::new(SignalingConfig::default(), WebRtcConfig::default());
        manager.add(test_config("cam_a")).await.unwrap();
        let camera = manager.get("cam_a").await.unwrap();
        assert_eq!(camera.state(), CameraState::Initializing);
    }
}
