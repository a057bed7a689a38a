//! Advertisement routing across registered sessions.
//!
//! The router owns no radio. A [`Scanner`] hands it advertisements, and the
//! router forwards each one to the [`DeviceSession`] registered for the
//! sender's address, after the configured address prefix filter.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, with_retry};
use crate::session::DeviceSession;
use crate::transport::{Advertisement, Scanner, Transport, same_address};

/// What happened to one routed advertisement.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// The address did not pass the prefix filter.
    Filtered,
    /// No session is registered for the address.
    Unknown,
    /// The session did not know its settings yet; they were fetched and the
    /// frame was dropped.
    SettingsFetched,
    /// The frame updated the session's cached reading.
    Decoded,
    /// The session could not use the frame.
    Rejected(String),
}

impl RouteOutcome {
    pub fn is_decoded(&self) -> bool {
        matches!(self, Self::Decoded)
    }
}

/// Tally of one scan window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteSummary {
    pub seen: usize,
    pub filtered: usize,
    pub unknown: usize,
    pub settings_fetched: usize,
    pub decoded: usize,
    pub rejected: usize,
}

impl RouteSummary {
    fn record(&mut self, outcome: &RouteOutcome) {
        self.seen += 1;
        match outcome {
            RouteOutcome::Filtered => self.filtered += 1,
            RouteOutcome::Unknown => self.unknown += 1,
            RouteOutcome::SettingsFetched => self.settings_fetched += 1,
            RouteOutcome::Decoded => self.decoded += 1,
            RouteOutcome::Rejected(_) => self.rejected += 1,
        }
    }
}

/// Dispatches advertisements to registered sessions.
pub struct AdvertisingRouter<T: Transport> {
    config: RouterConfig,
    sessions: RwLock<Vec<Arc<DeviceSession<T>>>>,
}

impl<T: Transport> std::fmt::Debug for AdvertisingRouter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvertisingRouter")
            .field("config", &self.config)
            .field("sessions", &self.len())
            .finish()
    }
}

impl<T: Transport> Default for AdvertisingRouter<T> {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl<T: Transport> AdvertisingRouter<T> {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Register a session.
    ///
    /// Returns `false` when a session with the same address (compared
    /// case-insensitively) is already registered.
    pub fn register(&self, session: Arc<DeviceSession<T>>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions
            .iter()
            .any(|s| same_address(s.address(), session.address()))
        {
            debug!(address = session.address(), "Session already registered");
            return false;
        }
        if !self.config.accepts(session.address()) {
            warn!(
                address = session.address(),
                "Registered session does not match the address prefix; its advertisements will be filtered"
            );
        }
        sessions.push(session);
        true
    }

    /// Remove and return the session for `address`.
    pub fn unregister(&self, address: &str) -> Option<Arc<DeviceSession<T>>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let index = sessions
            .iter()
            .position(|s| same_address(s.address(), address))?;
        Some(sessions.remove(index))
    }

    pub fn session(&self, address: &str) -> Option<Arc<DeviceSession<T>>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| same_address(s.address(), address))
            .cloned()
    }

    /// Registered sessions in registration order.
    pub fn sessions(&self) -> Vec<Arc<DeviceSession<T>>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forward one advertisement to its session.
    pub async fn route(&self, advertisement: &Advertisement) -> RouteOutcome {
        if !self.config.accepts(&advertisement.address) {
            return RouteOutcome::Filtered;
        }
        let Some(session) = self.session(&advertisement.address) else {
            return RouteOutcome::Unknown;
        };

        match session.handle_advertisement(&advertisement.payload).await {
            Ok(true) => RouteOutcome::Decoded,
            Ok(false) => RouteOutcome::SettingsFetched,
            Err(e) => {
                debug!(address = %advertisement.address, error = %e, "Advertisement not used");
                RouteOutcome::Rejected(e.to_string())
            }
        }
    }

    /// Run one scan window and route everything it saw.
    ///
    /// A failed scan is retried with [`RetryConfig::for_scan`].
    pub async fn scan_and_route<S: Scanner + ?Sized>(&self, scanner: &S) -> Result<RouteSummary> {
        let duration = self.config.scan_duration;
        let advertisements =
            with_retry(&RetryConfig::for_scan(), "scan", || scanner.scan(duration)).await?;

        let mut summary = RouteSummary::default();
        for advertisement in &advertisements {
            let outcome = self.route(advertisement).await;
            summary.record(&outcome);
        }
        debug!(?summary, "Scan window routed");
        Ok(summary)
    }

    /// Initialize every session whose settings are still unknown.
    ///
    /// Sessions are initialized one after another, since they usually share
    /// one adapter. Returns the failures keyed by address.
    pub async fn init_all(&self) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for session in self.sessions() {
            if session.settings_known() {
                continue;
            }
            match session.init().await {
                Ok(()) => info!(address = session.address(), "Sensor ready"),
                Err(e) => {
                    warn!(address = session.address(), error = %e, "Sensor init failed");
                    failures.push((session.address().to_string(), e));
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    fn session(address: &str) -> Arc<DeviceSession<MockTransport>> {
        Arc::new(DeviceSession::new(address, MockTransport::new()))
    }

    fn advertisement(address: &str, payload: Vec<u8>) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            name: None,
            payload,
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_register_dedupes_case_insensitively() {
        let router = AdvertisingRouter::default();
        assert!(router.register(session("A4:C1:38:00:00:01")));
        assert!(!router.register(session("a4:c1:38:00:00:01")));
        assert_eq!(router.len(), 1);
        assert!(router.session("a4:C1:38:00:00:01").is_some());
    }

    #[test]
    fn test_lookup_ignores_separators() {
        let router = AdvertisingRouter::default();
        router.register(session("a4c138123456"));
        assert!(!router.register(session("A4:C1:38:12:34:56")));
        assert!(router.session("A4:C1:38:12:34:56").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_reaches_session_registered_without_colons() {
        let router = AdvertisingRouter::default();
        router.register(session("a4c138123456"));

        // Settings are unknown, so the first frame triggers the fetch
        let outcome = router
            .route(&advertisement("A4:C1:38:12:34:56", vec![0; 6]))
            .await;
        assert_eq!(outcome, RouteOutcome::SettingsFetched);
    }

    #[test]
    fn test_unregister() {
        let router = AdvertisingRouter::default();
        router.register(session("A4:C1:38:00:00:01"));
        assert!(router.unregister("a4:c1:38:00:00:01").is_some());
        assert!(router.unregister("A4:C1:38:00:00:01").is_none());
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn test_prefix_filter_runs_before_lookup() {
        let router = AdvertisingRouter::new(RouterConfig::default());
        router.register(session("11:22:33:44:55:66"));

        let outcome = router
            .route(&advertisement("11:22:33:44:55:66", vec![0; 6]))
            .await;
        assert_eq!(outcome, RouteOutcome::Filtered);

        let outcome = router
            .route(&advertisement("A4:C1:38:99:99:99", vec![0; 6]))
            .await;
        assert_eq!(outcome, RouteOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_any_address_routes_everything() {
        let router: AdvertisingRouter<MockTransport> = AdvertisingRouter::new(RouterConfig::default().any_address());
        let outcome = router
            .route(&advertisement("11:22:33:44:55:66", vec![0; 6]))
            .await;
        assert_eq!(outcome, RouteOutcome::Unknown);
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = RouteSummary::default();
        summary.record(&RouteOutcome::Decoded);
        summary.record(&RouteOutcome::Filtered);
        summary.record(&RouteOutcome::Rejected("short".into()));
        assert_eq!(summary.seen, 3);
        assert_eq!(summary.decoded, 1);
        assert_eq!(summary.filtered, 1);
        assert_eq!(summary.rejected, 1);
    }
}
