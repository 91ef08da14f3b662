//! Invalid-share banning.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BanningConfig {
    pub enabled: bool,
    /// Ban duration in seconds.
    pub time: u64,
    /// Invalid share percentage at or above which a client is banned.
    pub invalid_percent: f64,
    /// Shares counted before a verdict is reached.
    pub check_threshold: u32,
    /// Seconds between sweeps of expired bans.
    pub purge_interval: u64,
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time: 600,
            invalid_percent: 50.0,
            check_threshold: 500,
            purge_interval: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BanVerdict {
    /// Not enough shares counted yet.
    Pending,
    /// Share quality is acceptable; counting starts over.
    Reset,
    Ban { invalid_percent: f64 },
}

impl BanningConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.time)
    }

    pub fn verdict(&self, valid: u32, invalid: u32) -> BanVerdict {
        let total = valid + invalid;
        if total < self.check_threshold || total == 0 {
            return BanVerdict::Pending;
        }
        let invalid_percent = f64::from(invalid) / f64::from(total) * 100.0;
        if invalid_percent >= self.invalid_percent {
            BanVerdict::Ban { invalid_percent }
        } else {
            BanVerdict::Reset
        }
    }
}

/// Valid and invalid share counts of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareCounter {
    valid: u32,
    invalid: u32,
}

impl ShareCounter {
    /// Count a share and decide. Always `Pending` with banning disabled.
    pub fn record(&mut self, valid: bool, config: &BanningConfig) -> BanVerdict {
        if !config.enabled {
            return BanVerdict::Pending;
        }
        if valid {
            self.valid += 1;
        } else {
            self.invalid += 1;
        }

        let verdict = config.verdict(self.valid, self.invalid);
        if verdict == BanVerdict::Reset {
            *self = Self::default();
        }
        verdict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanStatus {
    NotBanned,
    Banned { remaining: Duration },
    /// The ban had run out and was lifted by this check.
    Forgiven,
}

/// Banned addresses and when they were banned.
#[derive(Debug)]
pub struct BanTable {
    duration: Duration,
    entries: Mutex<HashMap<IpAddr, Instant>>,
}

impl BanTable {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ban(&self, ip: IpAddr) {
        self.entries.lock().insert(ip, Instant::now());
    }

    pub fn check(&self, ip: IpAddr) -> BanStatus {
        let mut entries = self.entries.lock();
        let Some(banned_at) = entries.get(&ip) else {
            return BanStatus::NotBanned;
        };

        let elapsed = banned_at.elapsed();
        if elapsed < self.duration {
            BanStatus::Banned {
                remaining: self.duration - elapsed,
            }
        } else {
            entries.remove(&ip);
            BanStatus::Forgiven
        }
    }

    /// Drop expired bans, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, banned_at| banned_at.elapsed() < self.duration);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use test_case::test_case;

    #[test_case(251, 250 => BanVerdict::Reset ; "mostly valid resets")]
    #[test_case(250, 250 => matches BanVerdict::Ban { .. } ; "exactly half bans")]
    #[test_case(250, 251 => matches BanVerdict::Ban { .. } ; "mostly invalid bans")]
    #[test_case(100, 300 => BanVerdict::Pending ; "below threshold")]
    fn test_verdict(valid: u32, invalid: u32) -> BanVerdict {
        BanningConfig::default().verdict(valid, invalid)
    }

    #[test]
    fn test_counter_resets_after_good_window() {
        let config = BanningConfig {
            check_threshold: 4,
            ..Default::default()
        };
        let mut counter = ShareCounter::default();

        assert_eq!(counter.record(true, &config), BanVerdict::Pending);
        assert_eq!(counter.record(true, &config), BanVerdict::Pending);
        assert_eq!(counter.record(true, &config), BanVerdict::Pending);
        assert_eq!(counter.record(false, &config), BanVerdict::Reset);
        assert_eq!(counter, ShareCounter::default());

        for _ in 0..3 {
            assert_eq!(counter.record(false, &config), BanVerdict::Pending);
        }
        assert_eq!(
            counter.record(true, &config),
            BanVerdict::Ban {
                invalid_percent: 75.0
            }
        );
    }

    #[test]
    fn test_counter_disabled() {
        let config = BanningConfig {
            enabled: false,
            check_threshold: 1,
            ..Default::default()
        };
        let mut counter = ShareCounter::default();
        for _ in 0..10 {
            assert_eq!(counter.record(false, &config), BanVerdict::Pending);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_expires_and_is_forgiven() {
        let table = BanTable::new(Duration::from_secs(600));
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        table.ban(ip);
        assert_eq!(table.check(other), BanStatus::NotBanned);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(
            table.check(ip),
            BanStatus::Banned {
                remaining: Duration::from_secs(500)
            }
        );

        tokio::time::advance(Duration::from_secs(500)).await;
        assert_eq!(table.check(ip), BanStatus::Forgiven);
        assert_eq!(table.check(ip), BanStatus::NotBanned);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let table = BanTable::new(Duration::from_secs(60));
        table.ban(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        tokio::time::advance(Duration::from_secs(30)).await;
        table.ban(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(table.purge_expired(), 1);
        assert_eq!(table.len(), 1);
    }
}
