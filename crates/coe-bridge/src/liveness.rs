//! Peer liveness tracking
//!
//! CMI devices resend their pages periodically, so a configured peer that
//! stays silent longer than `offline_after` is reported offline.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

/// Availability of one tracked peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// Peer IP address
    pub address: IpAddr,
    /// Whether traffic was seen within the offline threshold
    pub online: bool,
    /// Time of the last datagram from this peer
    pub last_seen: Option<DateTime<Utc>>,
}

/// Last-seen times of the configured peers
#[derive(Debug)]
pub struct LivenessTracker {
    offline_after: Duration,
    last_seen: Mutex<BTreeMap<IpAddr, Option<DateTime<Utc>>>>,
}

impl LivenessTracker {
    /// Create a tracker with the given offline threshold
    pub fn new(offline_after: Duration) -> Self {
        Self {
            offline_after,
            last_seen: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start tracking a peer that has not sent anything yet
    pub fn track(&self, address: IpAddr) {
        self.last_seen.lock().entry(address).or_insert(None);
    }

    /// Record traffic from `address`
    ///
    /// Returns false for addresses that are not tracked. The first datagram
    /// from a tracked peer is logged at info.
    pub fn touch(&self, address: IpAddr, now: DateTime<Utc>) -> bool {
        let mut last_seen = self.last_seen.lock();
        match last_seen.get_mut(&address) {
            Some(seen) => {
                if seen.is_none() {
                    info!("First datagram from CMI {}", address);
                }
                *seen = Some(now);
                true
            }
            None => {
                debug!("Datagram from untracked sender {}", address);
                false
            }
        }
    }

    /// Availability of every tracked peer at `now`
    pub fn statuses(&self, now: DateTime<Utc>) -> Vec<PeerStatus> {
        self.last_seen
            .lock()
            .iter()
            .map(|(address, seen)| PeerStatus {
                address: *address,
                online: self.is_fresh(*seen, now),
                last_seen: *seen,
            })
            .collect()
    }

    /// Availability of one peer, or `None` when it is not tracked
    pub fn is_online(&self, address: IpAddr, now: DateTime<Utc>) -> Option<bool> {
        self.last_seen
            .lock()
            .get(&address)
            .map(|seen| self.is_fresh(*seen, now))
    }

    /// Number of tracked peers
    pub fn len(&self) -> usize {
        self.last_seen.lock().len()
    }

    /// Whether no peer is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(&self, seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match seen {
            // A timestamp ahead of `now` fails to convert and counts as fresh
            Some(seen) => (now - seen)
                .to_std()
                .map_or(true, |elapsed| elapsed <= self.offline_after),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_never_seen_is_offline() {
        let tracker = LivenessTracker::new(Duration::from_secs(600));
        tracker.track(ip("10.0.0.1"));

        let statuses = tracker.statuses(at(0));
        assert_eq!(
            statuses,
            vec![PeerStatus {
                address: ip("10.0.0.1"),
                online: false,
                last_seen: None,
            }]
        );
    }

    #[test]
    fn test_goes_offline_after_threshold() {
        let tracker = LivenessTracker::new(Duration::from_secs(600));
        tracker.track(ip("10.0.0.1"));
        assert!(tracker.touch(ip("10.0.0.1"), at(0)));

        assert_eq!(tracker.is_online(ip("10.0.0.1"), at(600)), Some(true));
        assert_eq!(tracker.is_online(ip("10.0.0.1"), at(601)), Some(false));

        tracker.touch(ip("10.0.0.1"), at(700));
        assert_eq!(tracker.is_online(ip("10.0.0.1"), at(701)), Some(true));
        assert_eq!(tracker.statuses(at(701))[0].last_seen, Some(at(700)));
    }

    #[test]
    fn test_untracked_sender_ignored() {
        let tracker = LivenessTracker::new(Duration::from_secs(600));
        assert!(!tracker.touch(ip("10.0.0.9"), at(0)));
        assert!(tracker.is_empty());
        assert_eq!(tracker.is_online(ip("10.0.0.9"), at(0)), None);
    }

    #[test]
    fn test_track_does_not_reset_last_seen() {
        let tracker = LivenessTracker::new(Duration::from_secs(60));
        tracker.track(ip("10.0.0.1"));
        tracker.touch(ip("10.0.0.1"), at(0));
        tracker.track(ip("10.0.0.1"));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.is_online(ip("10.0.0.1"), at(10)), Some(true));
    }

    #[test]
    fn test_statuses_sorted_by_address() {
        let tracker = LivenessTracker::new(Duration::from_secs(60));
        tracker.track(ip("10.0.0.2"));
        tracker.track(ip("10.0.0.1"));
        let addresses: Vec<_> = tracker
            .statuses(at(0))
            .into_iter()
            .map(|status| status.address)
            .collect();
        assert_eq!(addresses, vec![ip("10.0.0.1"), ip("10.0.0.2")]);
    }
}
