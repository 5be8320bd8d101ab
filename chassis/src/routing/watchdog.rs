//! Hub watchdog: periodic ping/pong and lost-peer detection.
//!
//! The runtime fires `on_half_cycle` every `watchdog_timeout / 2`; the
//! logic itself is tick-driven so the loss path can be exercised without
//! timers. Lost clients take the same deregister-on-error path a
//! transport failure takes.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::warn;

use chassis_proto::types::ClientId;

use super::table::RoutingTable;

/// Result of one watchdog half-cycle.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WatchdogTick {
    /// Clients to PING now.
    pub ping_targets: Vec<ClientId>,
    /// Clients declared lost; handle as deregister-on-error.
    pub lost: Vec<ClientId>,
}

/// Watchdog bookkeeping. The pong counters themselves live in the
/// routing table.
pub struct Watchdog {
    enabled: bool,
    allowed_missing_pongs: u32,
    /// Ad-hoc pings with individual deadlines, outside the regular cycle.
    pinged: HashMap<ClientId, Instant>,
}

impl Watchdog {
    #[must_use]
    pub fn new(enabled: bool, allowed_missing_pongs: u32) -> Self {
        Self {
            enabled,
            allowed_missing_pongs,
            pinged: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Advance one half-cycle: bump every counter, collect the clients
    /// over the limit, ping the rest.
    pub fn on_half_cycle(&mut self, table: &mut RoutingTable) -> WatchdogTick {
        if !self.enabled {
            return WatchdogTick::default();
        }

        table.increment_missed_pongs();
        let lost = table.clients_over_pong_limit(self.allowed_missing_pongs);
        for client in &lost {
            warn!(
                "client {client:#06x} missed more than {} pongs, declaring lost",
                self.allowed_missing_pongs
            );
            self.pinged.remove(client);
        }

        let ping_targets = table
            .registered_clients()
            .into_iter()
            .filter(|client| !lost.contains(client))
            .collect();

        WatchdogTick { ping_targets, lost }
    }

    /// A PONG arrived.
    pub fn on_pong(&mut self, table: &mut RoutingTable, client: ClientId) {
        table.reset_missed_pongs(client);
        self.pinged.remove(&client);
    }

    /// Ping one client on demand, with its own deadline.
    pub fn ping_client(&mut self, client: ClientId, now: Instant, timeout: Duration) {
        self.pinged.insert(client, now + timeout);
    }

    /// Ad-hoc pings whose deadline passed; each takes the lost-client
    /// path.
    pub fn expired_pings(&mut self, now: Instant) -> Vec<ClientId> {
        let expired: Vec<ClientId> = self
            .pinged
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(client, _)| *client)
            .collect();
        for client in &expired {
            self.pinged.remove(client);
        }
        expired
    }

    /// Forget a client entirely (deregistration).
    pub fn forget(&mut self, client: ClientId) {
        self.pinged.remove(&client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A silent client is declared lost within three half-cycles at
    /// `allowed_missing_pongs = 2`.
    #[test]
    fn silent_client_is_lost_within_three_cycles() {
        let mut table = RoutingTable::new();
        table.register_client(0x1001, None);
        table.register_client(0x1002, None);
        let mut watchdog = Watchdog::new(true, 2);

        // cycle 1 and 2: everyone still tolerated
        for _ in 0..2 {
            let tick = watchdog.on_half_cycle(&mut table);
            assert!(tick.lost.is_empty());
            assert_eq!(tick.ping_targets.len(), 2);
        }

        // 0x1002 answers, 0x1001 stays silent
        watchdog.on_pong(&mut table, 0x1002);

        let tick = watchdog.on_half_cycle(&mut table);
        assert_eq!(tick.lost, vec![0x1001]);
        assert!(!tick.ping_targets.contains(&0x1001));
        assert!(tick.ping_targets.contains(&0x1002));
    }

    #[test]
    fn pong_resets_the_counter() {
        let mut table = RoutingTable::new();
        table.register_client(0x1001, None);
        let mut watchdog = Watchdog::new(true, 2);

        for _ in 0..10 {
            watchdog.on_half_cycle(&mut table);
            watchdog.on_pong(&mut table, 0x1001);
        }
        assert!(watchdog.on_half_cycle(&mut table).lost.is_empty());
    }

    #[test]
    fn disabled_watchdog_does_nothing() {
        let mut table = RoutingTable::new();
        table.register_client(0x1001, None);
        let mut watchdog = Watchdog::new(false, 0);

        for _ in 0..5 {
            assert_eq!(watchdog.on_half_cycle(&mut table), WatchdogTick::default());
        }
    }

    #[test]
    fn adhoc_ping_expires_individually() {
        let mut watchdog = Watchdog::new(true, 2);
        let t = Instant::now();

        watchdog.ping_client(0x1001, t, Duration::from_millis(100));
        watchdog.ping_client(0x1002, t, Duration::from_millis(500));

        assert!(watchdog.expired_pings(t + Duration::from_millis(50)).is_empty());
        assert_eq!(
            watchdog.expired_pings(t + Duration::from_millis(200)),
            vec![0x1001]
        );
        assert_eq!(
            watchdog.expired_pings(t + Duration::from_millis(600)),
            vec![0x1002]
        );
    }

    #[test]
    fn answered_adhoc_ping_does_not_expire() {
        let mut table = RoutingTable::new();
        table.register_client(0x1001, None);
        let mut watchdog = Watchdog::new(true, 2);
        let t = Instant::now();

        watchdog.ping_client(0x1001, t, Duration::from_millis(100));
        watchdog.on_pong(&mut table, 0x1001);
        assert!(watchdog.expired_pings(t + Duration::from_secs(1)).is_empty());
    }
}
