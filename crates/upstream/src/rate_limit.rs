//! Named rate limit budgets and their auto-tuner.
//!
//! A budget is a set of fixed-window token rules matched by method glob. Any
//! entity referencing the budget name shares its tokens. The auto-tuner
//! grows capacity while upstream throttle feedback stays quiet and shrinks
//! it when upstreams start answering 429.

use manifold_config::{AutoTuneConfig, BudgetRuleConfig, RateLimitBudgetConfig};
use manifold_primitives::{GatewayError, Pattern};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
// tokio's Instant so paused-clock tests drive the windows deterministically
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, trace};

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    issued: u64,
}

#[derive(Debug)]
struct BudgetRule {
    method: Pattern,
    /// Current capacity; adjusted by the auto-tuner.
    capacity: AtomicU64,
    /// Capacity as configured; the auto-tune floor.
    original_capacity: u64,
    period: Duration,
    wait_time: Duration,
    state: Mutex<WindowState>,
}

impl BudgetRule {
    fn new(config: &BudgetRuleConfig) -> Self {
        Self {
            method: config.method.clone(),
            capacity: AtomicU64::new(config.max_count),
            original_capacity: config.max_count,
            period: config.period,
            wait_time: config.wait_time,
            state: Mutex::new(WindowState { window_start: Instant::now(), issued: 0 }),
        }
    }

    /// Takes a token if one is available, otherwise reports how long until
    /// the current window rolls over.
    fn try_take(&self) -> Result<(), Duration> {
        let capacity = self.capacity.load(Ordering::Acquire);
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.window_start);
        if elapsed >= self.period {
            state.window_start = now;
            state.issued = 0;
        }
        if state.issued < capacity {
            state.issued += 1;
            return Ok(())
        }
        Err(self.period.saturating_sub(now.duration_since(state.window_start)))
    }
}

/// A named token budget shared by every referent of the name.
#[derive(Debug)]
pub struct RateLimitBudget {
    name: String,
    rules: Vec<BudgetRule>,
    auto_tune: Option<AutoTuneConfig>,
    /// Requests that drew from this budget since the last adjustment.
    observed_requests: AtomicU64,
    /// Upstream throttle responses observed since the last adjustment.
    observed_throttles: AtomicU64,
}

impl RateLimitBudget {
    /// Builds a budget from its configuration.
    pub fn new(config: &RateLimitBudgetConfig) -> Self {
        Self {
            name: config.name.clone(),
            rules: config.rules.iter().map(BudgetRule::new).collect(),
            auto_tune: config.auto_tune.clone(),
            observed_requests: AtomicU64::new(0),
            observed_throttles: AtomicU64::new(0),
        }
    }

    /// The budget's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consumes one token from the first rule matching `method`.
    ///
    /// Waits up to the rule's `wait_time` for the window to roll over; if no
    /// token materialized by then the call fails with `rate-limit-exceeded`.
    /// Methods matching no rule are not limited.
    pub async fn acquire(&self, method: &str) -> Result<(), GatewayError> {
        let Some(rule) = self.rules.iter().find(|rule| rule.method.matches(method)) else {
            return Ok(())
        };

        let deadline = Instant::now() + rule.wait_time;
        loop {
            match rule.try_take() {
                Ok(()) => {
                    self.observed_requests.fetch_add(1, Ordering::AcqRel);
                    return Ok(())
                }
                Err(until_rollover) => {
                    let now = Instant::now();
                    if now >= deadline {
                        trace!(target: "upstream::budget", budget = %self.name, method, "wait window exhausted");
                        return Err(GatewayError::rate_limited(&self.name))
                    }
                    let wait = until_rollover.min(deadline.duration_since(now));
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Feedback from the upstream path: a request completed, possibly with a
    /// throttled response. Feeds the auto-tuner.
    pub fn note_outcome(&self, throttled: bool) {
        if throttled {
            self.observed_throttles.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Applies one auto-tune adjustment from the accumulated feedback.
    fn adjust(&self) {
        let Some(tune) = &self.auto_tune else { return };

        let requests = self.observed_requests.swap(0, Ordering::AcqRel);
        let throttles = self.observed_throttles.swap(0, Ordering::AcqRel);
        if requests == 0 {
            return
        }
        let throttle_rate = throttles as f64 / requests as f64;

        for rule in &self.rules {
            let capacity = rule.capacity.load(Ordering::Acquire);
            let adjusted = if throttle_rate < tune.error_rate_threshold {
                ((capacity as f64 * tune.increase_factor) as u64).min(tune.max_budget)
            } else {
                ((capacity as f64 * tune.decrease_factor) as u64).max(rule.original_capacity)
            };
            if adjusted != capacity {
                debug!(
                    target: "upstream::budget",
                    budget = %self.name,
                    rule = %rule.method,
                    capacity,
                    adjusted,
                    throttle_rate,
                    "auto-tuned budget capacity"
                );
                rule.capacity.store(adjusted, Ordering::Release);
            }
        }
    }

    #[cfg(test)]
    fn capacity_of(&self, method: &str) -> u64 {
        self.rules
            .iter()
            .find(|rule| rule.method.matches(method))
            .map(|rule| rule.capacity.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Registry of budgets by name. Process-wide, built once at startup.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    budgets: HashMap<String, Arc<RateLimitBudget>>,
}

impl RateLimiterRegistry {
    /// Builds every configured budget.
    pub fn new(configs: &[RateLimitBudgetConfig]) -> Self {
        Self {
            budgets: configs
                .iter()
                .map(|config| (config.name.clone(), Arc::new(RateLimitBudget::new(config))))
                .collect(),
        }
    }

    /// Looks up a budget by name.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimitBudget>> {
        self.budgets.get(name).cloned()
    }

    /// All registered budgets.
    pub fn budgets(&self) -> impl Iterator<Item = &Arc<RateLimitBudget>> {
        self.budgets.values()
    }
}

/// Periodic budget adjustment task.
#[derive(Debug)]
pub struct AutoTuner {
    budgets: Vec<Arc<RateLimitBudget>>,
    period: Duration,
}

impl AutoTuner {
    /// Collects the budgets that opted into auto-tuning.
    pub fn new(registry: &RateLimiterRegistry) -> Self {
        let budgets: Vec<_> =
            registry.budgets().filter(|b| b.auto_tune.is_some()).cloned().collect();
        let period = budgets
            .iter()
            .filter_map(|b| b.auto_tune.as_ref().map(|t| t.adjustment_period))
            .min()
            .unwrap_or(Duration::from_secs(60));
        Self { budgets, period }
    }

    /// Spawns the adjustment loop. Adjustments apply on the next window.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it so feedback can accrue
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for budget in &self.budgets {
                    budget.adjust();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_primitives::ErrorKind;

    fn budget(max_count: u64, period: Duration, wait_time: Duration) -> RateLimitBudget {
        RateLimitBudget::new(&RateLimitBudgetConfig {
            name: "test".to_owned(),
            rules: vec![BudgetRuleConfig {
                method: Pattern::new("*"),
                max_count,
                period,
                wait_time,
            }],
            auto_tune: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn waits_then_fails_when_exhausted() {
        let budget = budget(1, Duration::from_secs(1), Duration::from_millis(500));
        budget.acquire("eth_call").await.unwrap();

        let started = tokio::time::Instant::now();
        let err = budget.acquire("eth_call").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimitExceeded);
        // waited the full wait window before giving up
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn token_returns_after_rollover() {
        let budget = budget(1, Duration::from_millis(100), Duration::from_millis(500));
        budget.acquire("eth_call").await.unwrap();
        // the wait window spans a rollover, so the second call succeeds
        budget.acquire("eth_call").await.unwrap();
    }

    #[tokio::test]
    async fn unmatched_methods_are_not_limited() {
        let budget = RateLimitBudget::new(&RateLimitBudgetConfig {
            name: "narrow".to_owned(),
            rules: vec![BudgetRuleConfig {
                method: Pattern::new("eth_getLogs"),
                max_count: 0,
                period: Duration::from_secs(1),
                wait_time: Duration::ZERO,
            }],
            auto_tune: None,
        });
        budget.acquire("eth_chainId").await.unwrap();
        assert!(budget.acquire("eth_getLogs").await.is_err());
    }

    #[test]
    fn auto_tune_grows_and_shrinks() {
        let config = RateLimitBudgetConfig {
            name: "tuned".to_owned(),
            rules: vec![BudgetRuleConfig {
                method: Pattern::new("*"),
                max_count: 100,
                period: Duration::from_secs(1),
                wait_time: Duration::ZERO,
            }],
            auto_tune: Some(AutoTuneConfig::default()),
        };
        let budget = RateLimitBudget::new(&config);

        // quiet feedback grows capacity
        budget.observed_requests.store(100, Ordering::Release);
        budget.adjust();
        assert_eq!(budget.capacity_of("eth_call"), 105);

        // noisy feedback shrinks it, floored at the configured capacity
        for _ in 0..5 {
            budget.observed_requests.store(100, Ordering::Release);
            budget.observed_throttles.store(50, Ordering::Release);
            budget.adjust();
        }
        assert_eq!(budget.capacity_of("eth_call"), 100);
    }
}
