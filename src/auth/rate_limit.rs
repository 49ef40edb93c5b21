use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use chrono::{DateTime, Utc, Duration};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

/// At most `max_requests` admissions in any trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self { max_requests, window }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Resource name -> policy. Resources not listed here are never limited.
    pub policies: HashMap<String, RateLimitPolicy>,
    /// Upper bound on tracked `(identity, resource)` windows; 0 means unbounded.
    pub max_tracked_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert("login".to_string(), RateLimitPolicy::new(5, Duration::minutes(1)));
        policies.insert("register".to_string(), RateLimitPolicy::new(3, Duration::minutes(10)));

        Self {
            policies,
            max_tracked_keys: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    identity: String,
    resource: String,
}

#[derive(Debug)]
struct RequestWindow {
    timestamps: VecDeque<DateTime<Utc>>,
    /// Position in `LimiterState::recency`.
    touched: u64,
}

impl RequestWindow {
    fn new(touched: u64) -> Self {
        Self {
            timestamps: VecDeque::new(),
            touched,
        }
    }

    fn cleanup_old_requests(&mut self, now: DateTime<Utc>, window_size: Duration) {
        let cutoff = now - window_size;
        self.timestamps.retain(|ts| *ts > cutoff);
    }

    fn add_request(&mut self, now: DateTime<Utc>) {
        self.timestamps.push_back(now);
    }

    fn request_count(&self) -> usize {
        self.timestamps.len()
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    policies: HashMap<String, RateLimitPolicy>,
    windows: HashMap<WindowKey, RequestWindow>,
    /// Access order of `windows`, oldest first.
    recency: BTreeMap<u64, WindowKey>,
    next_touch: u64,
}

impl LimiterState {
    /// The window for `key`, created if missing, marked most recently used.
    fn touch(&mut self, key: WindowKey, max_tracked_keys: usize) -> &mut RequestWindow {
        let touched = self.next_touch;
        self.next_touch += 1;

        if let Some(window) = self.windows.get_mut(&key) {
            self.recency.remove(&window.touched);
            window.touched = touched;
        } else if max_tracked_keys > 0 && self.windows.len() >= max_tracked_keys {
            self.evict_least_recent();
        }

        self.recency.insert(touched, key.clone());
        self.windows
            .entry(key)
            .or_insert_with(|| RequestWindow::new(touched))
    }

    fn evict_least_recent(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            debug!(identity = %key.identity, resource = %key.resource, "evicting idle rate limit window");
            self.windows.remove(&key);
        }
    }
}

/// Sliding-window admission control per `(identity, resource)`.
///
/// Policies and request histories sit behind one mutex, and each
/// [`allow`](Self::allow) holds it from reading the clock to recording the
/// request, so concurrent callers can never both pass the last free slot. A
/// single lock is plenty for the volume an auth endpoint sees; sharding by
/// key would be the next step if it ever shows up as contention.
///
/// Histories are pruned when their key is next touched. Keys that go quiet
/// keep their (stale) window until [`prune_idle`](Self::prune_idle) runs or
/// the `max_tracked_keys` cap evicts the least recently used one.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    max_tracked_keys: usize,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                policies: config.policies,
                ..LimiterState::default()
            }),
            max_tracked_keys: config.max_tracked_keys,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        // No code path panics while holding the lock; recover rather than wedge every caller.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit or reject one request from `identity` against `resource`.
    ///
    /// Resources without a policy are always admitted. A rejected request is
    /// not recorded, so it does not extend the caller's lockout.
    pub fn allow(&self, identity: &str, resource: &str) -> bool {
        let mut state = self.lock();
        let now = self.clock.now();

        let Some(policy) = state.policies.get(resource).copied() else {
            return true;
        };

        let key = WindowKey {
            identity: identity.to_string(),
            resource: resource.to_string(),
        };
        let window = state.touch(key, self.max_tracked_keys);
        window.cleanup_old_requests(now, policy.window);

        if window.request_count() >= policy.max_requests {
            warn!(
                identity = %identity,
                resource = %resource,
                max_requests = policy.max_requests,
                window_secs = policy.window.num_seconds(),
                "rate limit exceeded"
            );
            return false;
        }

        window.add_request(now);
        true
    }

    /// Merge `limits` into the policy table, replacing existing entries for
    /// the same resource. Nothing is ever removed through this call.
    pub fn add_limits<I>(&self, limits: I)
    where
        I: IntoIterator<Item = (String, RateLimitPolicy)>,
    {
        let mut state = self.lock();
        for (resource, policy) in limits {
            debug!(resource = %resource, max_requests = policy.max_requests, "rate limit policy set");
            state.policies.insert(resource, policy);
        }
    }

    pub fn policy(&self, resource: &str) -> Option<RateLimitPolicy> {
        self.lock().policies.get(resource).copied()
    }

    /// Drop windows with no requests left inside their policy window.
    ///
    /// Returns the number of windows removed.
    pub fn prune_idle(&self) -> usize {
        let mut state = self.lock();
        let now = self.clock.now();
        let LimiterState {
            policies,
            windows,
            recency,
            ..
        } = &mut *state;
        let before = windows.len();

        windows.retain(|key, window| {
            let keep = match policies.get(&key.resource) {
                Some(policy) => {
                    window.cleanup_old_requests(now, policy.window);
                    window.request_count() > 0
                }
                None => false,
            };
            if !keep {
                recency.remove(&window.touched);
            }
            keep
        });

        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().windows.len()
    }
}
