use std::collections::HashMap;
use std::net::IpAddr;

use log::{debug, info};
use tokio::time::{Duration, Instant};

/// Graceful-restart helper-mode bookkeeping [RFC 4724]. When a peer's
/// session drops, its routes are held stale for the restart window the
/// peer advertised (falling back to the configured default), then swept.
#[derive(Debug)]
pub struct RestartHelper {
    default_restart_time: u16,
    windows: HashMap<IpAddr, Instant>,
}

impl RestartHelper {
    pub fn new(default_restart_time: u16) -> Self {
        Self {
            default_restart_time,
            windows: HashMap::new(),
        }
    }

    /// Session-state-change checkpoint (down): arm the stale window.
    /// The restart time from the peer's capability is authoritative.
    pub fn session_down(&mut self, peer_ip: IpAddr, advertised: Option<u16>) -> Duration {
        let restart_time = advertised.unwrap_or(self.default_restart_time);
        let window = Duration::from_secs(u64::from(restart_time));
        info!(
            "Holding routes from {} stale for {}s",
            peer_ip, restart_time
        );
        self.windows.insert(peer_ip, Instant::now() + window);
        window
    }

    /// Session-state-change checkpoint (re-established): the window no
    /// longer applies; stale routes clear via re-announcement and EoR
    pub fn session_up(&mut self, peer_ip: IpAddr) {
        if self.windows.remove(&peer_ip).is_some() {
            debug!("{} reconnected within its restart window", peer_ip);
        }
    }

    /// End-of-RIB from a restarted peer closes its window
    pub fn end_of_rib(&mut self, peer_ip: IpAddr) -> bool {
        self.windows.remove(&peer_ip).is_some()
    }

    /// Peers whose stale window has lapsed without a comeback
    pub fn expired(&mut self) -> Vec<IpAddr> {
        let now = Instant::now();
        let lapsed: Vec<IpAddr> = self
            .windows
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(peer_ip, _)| *peer_ip)
            .collect();
        for peer_ip in &lapsed {
            self.windows.remove(peer_ip);
        }
        lapsed
    }

    pub fn pending(&self) -> Vec<IpAddr> {
        self.windows.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> IpAddr {
        "192.0.2.2".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_from_peer_capability() {
        let mut helper = RestartHelper::new(120);
        let window = helper.session_down(peer(), Some(30));
        assert_eq!(window, Duration::from_secs(30));
        assert!(helper.expired().is_empty());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(helper.expired(), vec![peer()]);
        assert!(helper.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_window_without_capability() {
        let mut helper = RestartHelper::new(120);
        assert_eq!(
            helper.session_down(peer(), None),
            Duration::from_secs(120)
        );
        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(helper.expired().is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(helper.expired(), vec![peer()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_comeback_cancels_window() {
        let mut helper = RestartHelper::new(120);
        helper.session_down(peer(), Some(60));
        helper.session_up(peer());
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(helper.expired().is_empty());
    }

    #[test]
    fn test_end_of_rib_closes_window() {
        let mut helper = RestartHelper::new(120);
        helper.session_down(peer(), Some(60));
        assert!(helper.end_of_rib(peer()));
        assert!(!helper.end_of_rib(peer()));
    }
}
