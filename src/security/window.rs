//! Sliding-window attempt counters keyed by client IP.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// A full map evicts 1/20th of its capacity at once.
const EVICTION_BATCH_DIVISOR: usize = 20;

/// Timestamps of recent attempts from one IP.
#[derive(Debug, Clone)]
pub struct AttemptWindow {
    hits: VecDeque<Instant>,
    last_seen: Instant,
}

impl AttemptWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            hits: VecDeque::new(),
            last_seen: now,
        }
    }

    /// Drop hits that are `span` or more in the past.
    pub fn prune(&mut self, now: Instant, span: Duration) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= span {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prune, append `now`, and return the resulting count.
    pub fn record(&mut self, now: Instant, span: Duration) -> usize {
        self.prune(now, span);
        self.hits.push_back(now);
        self.last_seen = now;
        self.hits.len()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// Bounded map of per-IP windows sharing one span.
#[derive(Debug)]
pub struct WindowMap {
    span: Duration,
    max_tracked: usize,
    windows: DashMap<IpAddr, AttemptWindow>,
}

impl WindowMap {
    pub fn new(span: Duration, max_tracked: usize) -> Self {
        Self {
            span,
            max_tracked: max_tracked.max(1),
            windows: DashMap::new(),
        }
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    /// Record one attempt. A new IP arriving at the cap first evicts a batch
    /// of the least recently seen IPs.
    pub fn record(&self, ip: IpAddr, now: Instant) -> usize {
        if !self.windows.contains_key(&ip) && self.windows.len() >= self.max_tracked {
            let excess = self.windows.len() + 1 - self.max_tracked;
            self.evict_oldest(excess.max(self.eviction_batch()));
        }

        let mut window = self
            .windows
            .entry(ip)
            .or_insert_with(|| AttemptWindow::new(now));
        window.record(now, self.span)
    }

    fn eviction_batch(&self) -> usize {
        (self.max_tracked / EVICTION_BATCH_DIVISOR).max(1)
    }

    /// Current count without recording.
    pub fn count(&self, ip: IpAddr, now: Instant) -> usize {
        match self.windows.get_mut(&ip) {
            Some(mut window) => {
                window.prune(now, self.span);
                window.len()
            }
            None => 0,
        }
    }

    /// Prune every window with `span` and drop the empty ones. Returns how
    /// many IPs were dropped.
    pub fn sweep(&self, now: Instant, span: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.prune(now, span);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Remove the `n` least recently seen IPs.
    pub fn evict_oldest(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }

        let mut by_age: Vec<(IpAddr, Instant)> = self
            .windows
            .iter()
            .map(|entry| (*entry.key(), entry.value().last_seen()))
            .collect();
        if n < by_age.len() {
            by_age.select_nth_unstable_by_key(n, |&(_, seen)| seen);
            by_age.truncate(n);
        }

        by_age
            .into_iter()
            .filter(|(ip, _)| self.windows.remove(ip).is_some())
            .count()
    }

    /// Evict down to the cap. Returns how many IPs were removed.
    pub fn trim(&self) -> usize {
        let excess = self.windows.len().saturating_sub(self.max_tracked);
        self.evict_oldest(excess)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.windows.contains_key(&ip)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
