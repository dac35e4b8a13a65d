//! Runtime permission gate
//!
//! Scanning needs the radio-scan and radio-connect capabilities, and on some
//! platforms location access as well. The gate asks for each in turn and stops
//! at the first refusal. A grant is remembered for the rest of the session; a
//! refusal is not, so the next scan is the user's retry.

use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, info, warn};

/// Platform permission prompts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Ask for the radio-scan capability
    async fn request_scan_permission(&self) -> bool;

    /// Ask for the radio-connect capability
    async fn request_connect_permission(&self) -> bool;

    /// Ask for location access
    async fn request_location_permission(&self) -> bool;
}

/// Provider for desktop platforms, where the OS prompts on first radio use
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopPermissions;

#[async_trait]
impl PermissionProvider for DesktopPermissions {
    async fn request_scan_permission(&self) -> bool {
        true
    }

    async fn request_connect_permission(&self) -> bool {
        true
    }

    async fn request_location_permission(&self) -> bool {
        true
    }
}

/// Binary gate in front of every scan
pub struct PermissionGate {
    provider: Box<dyn PermissionProvider>,
    requires_location: bool,
    granted: Mutex<bool>,
}

impl PermissionGate {
    pub fn new(provider: Box<dyn PermissionProvider>, requires_location: bool) -> Self {
        Self {
            provider,
            requires_location,
            granted: Mutex::new(false),
        }
    }

    /// Returns true only if every required capability is granted
    pub async fn ensure_permissions(&self) -> bool {
        if self.cached() {
            return true;
        }

        let granted = self.request_all().await;
        if granted {
            if let Ok(mut slot) = self.granted.lock() {
                *slot = true;
            }
        } else {
            debug!("Permissions refused; the next scan asks again");
        }
        granted
    }

    /// Forget a remembered grant, e.g. after the user revoked it in system settings
    pub fn reset(&self) {
        if let Ok(mut slot) = self.granted.lock() {
            *slot = false;
        }
    }

    fn cached(&self) -> bool {
        self.granted.lock().map(|slot| *slot).unwrap_or(false)
    }

    async fn request_all(&self) -> bool {
        if !self.provider.request_scan_permission().await {
            warn!("Radio scan permission denied");
            return false;
        }
        if !self.provider.request_connect_permission().await {
            warn!("Radio connect permission denied");
            return false;
        }
        if self.requires_location && !self.provider.request_location_permission().await {
            warn!("Location permission denied");
            return false;
        }
        info!("Bluetooth permissions granted");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_granted() {
        let mut provider = MockPermissionProvider::new();
        provider.expect_request_scan_permission().times(1).returning(|| true);
        provider.expect_request_connect_permission().times(1).returning(|| true);
        provider.expect_request_location_permission().times(1).returning(|| true);

        let gate = PermissionGate::new(Box::new(provider), true);
        assert!(gate.ensure_permissions().await);
        // Second call is served from the remembered grant
        assert!(gate.ensure_permissions().await);
    }

    #[tokio::test]
    async fn test_denial_short_circuits() {
        let mut provider = MockPermissionProvider::new();
        provider.expect_request_scan_permission().times(1).returning(|| false);
        provider.expect_request_connect_permission().never();
        provider.expect_request_location_permission().never();

        let gate = PermissionGate::new(Box::new(provider), true);
        assert!(!gate.ensure_permissions().await);
    }

    #[tokio::test]
    async fn test_denial_is_asked_again() {
        let mut provider = MockPermissionProvider::new();
        let mut answers = vec![false, true].into_iter();
        provider
            .expect_request_scan_permission()
            .times(2)
            .returning(move || answers.next().unwrap_or(false));
        provider.expect_request_connect_permission().times(1).returning(|| true);

        let gate = PermissionGate::new(Box::new(provider), false);
        assert!(!gate.ensure_permissions().await);
        assert!(gate.ensure_permissions().await);
        // Grant is remembered; no third prompt
        assert!(gate.ensure_permissions().await);
    }

    #[tokio::test]
    async fn test_location_skipped_when_not_required() {
        let mut provider = MockPermissionProvider::new();
        provider.expect_request_scan_permission().returning(|| true);
        provider.expect_request_connect_permission().returning(|| true);
        provider.expect_request_location_permission().never();

        let gate = PermissionGate::new(Box::new(provider), false);
        assert!(gate.ensure_permissions().await);
    }

    #[tokio::test]
    async fn test_reset_forgets_grant() {
        let mut provider = MockPermissionProvider::new();
        let mut answers = vec![true, false].into_iter();
        provider.expect_request_scan_permission().times(2).returning(move || answers.next().unwrap_or(false));
        provider.expect_request_connect_permission().times(1).returning(|| true);

        let gate = PermissionGate::new(Box::new(provider), false);
        assert!(gate.ensure_permissions().await);
        gate.reset();
        assert!(!gate.ensure_permissions().await);
    }
}
