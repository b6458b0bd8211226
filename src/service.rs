//! Inbound command surface
//!
//! The boundary the web layer calls into. Holds the one manager instance
//! per control surface and exposes the dashboard operations: compositor
//! commands and snapshots, avatar hotkey triggers and refreshes, and the
//! explicit reconnect actions.

use std::sync::Arc;

use crate::surface::avatar::AvatarManager;
use crate::surface::compositor::{
    CommandOutcome, CompositorCommand, CompositorManager, StateSnapshot,
};
use crate::surface::ControlSurface;
use crate::types::Result;

/// The control surfaces of one running dashboard.
#[derive(Clone)]
pub struct ControlService {
    compositor: Arc<CompositorManager>,
    avatar: Arc<AvatarManager>,
}

impl ControlService {
    pub fn new(compositor: Arc<CompositorManager>, avatar: Arc<AvatarManager>) -> Self {
        Self { compositor, avatar }
    }

    pub fn compositor(&self) -> &Arc<CompositorManager> {
        &self.compositor
    }

    pub fn avatar(&self) -> &Arc<AvatarManager> {
        &self.avatar
    }

    /// Run one compositor command. `Ok(None)` while disconnected.
    pub async fn execute_compositor(
        &self,
        command: CompositorCommand,
    ) -> Result<Option<CommandOutcome>> {
        self.compositor.execute(command).await
    }

    /// Composite scene/source/input read. `Ok(None)` while disconnected.
    pub async fn compositor_snapshot(&self) -> Result<Option<StateSnapshot>> {
        self.compositor.snapshot_state().await
    }

    /// Manual reconnect action for the compositor.
    pub async fn reconnect_compositor(&self) -> bool {
        self.compositor.connect().await
    }

    pub async fn trigger_avatar_hotkey(&self, hotkey_id: &str) {
        self.avatar.trigger_hotkey(hotkey_id).await;
    }

    /// Refresh the hotkey list, or, while disconnected, kick off a
    /// reconnect attempt instead.
    pub async fn request_avatar_refresh(&self) {
        self.avatar.request_hotkey_refresh().await;
    }

    pub fn reconnect_avatar(&self) {
        self.avatar.start();
    }

    /// Both managers behind the shared lifecycle contract, for uniform
    /// status rendering and shutdown.
    pub fn surfaces(&self) -> Vec<Arc<dyn ControlSurface>> {
        vec![self.compositor.clone(), self.avatar.clone()]
    }

    pub async fn shutdown(&self) {
        for surface in self.surfaces() {
            surface.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialStore;
    use crate::events::TracingSink;
    use crate::surface::{ConnectionConfig, ConnectionState};
    use std::time::Duration;

    fn offline_service(dir: &tempfile::TempDir) -> ControlService {
        let sink = Arc::new(TracingSink);
        // Port 9 (discard) is never served in the test environment.
        let config = ConnectionConfig::new("127.0.0.1", 9)
            .with_connect_timeout(Duration::from_millis(200))
            .with_request_timeout(Duration::from_millis(200));
        let compositor = Arc::new(CompositorManager::new(config.clone(), sink.clone()));
        let store = CredentialStore::new(dir.path().join("token.json"));
        let avatar = Arc::new(AvatarManager::new(config, store, sink));
        ControlService::new(compositor, avatar)
    }

    #[test]
    fn test_commands_are_absent_while_offline() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let service = offline_service(&dir);

            let outcome = service
                .execute_compositor(CompositorCommand::ToggleStream)
                .await
                .unwrap();
            assert!(outcome.is_none());
            assert!(service.compositor_snapshot().await.unwrap().is_none());
            service.trigger_avatar_hotkey("h1").await;
        });
    }

    #[test]
    fn test_surfaces_expose_both_managers() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let service = offline_service(&dir);

            let surfaces = service.surfaces();
            assert_eq!(surfaces.len(), 2);
            for surface in &surfaces {
                assert_eq!(surface.state(), ConnectionState::Disconnected);
                assert!(!surface.is_connected());
            }
            service.shutdown().await;
        });
    }
}
