//! Enforcement objects built from rules.
//!
//! The registry treats a [`TrafficShapingController`] as opaque: it stores it
//! next to the rule that produced it and hands it to request-path callers. The
//! controllers defined here back the built-in generator pairs:
//!
//! | Strategy | Behavior | Controller |
//! |----------|----------|------------|
//! | `Direct` | `Reject` | [`RejectController`] |
//! | `Direct` | `Throttling` | [`ThrottlingController`] |
//! | `WarmUp` | `Throttling` | [`ThrottlingController`] with a warm-up ramp |

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::Clock;
use crate::rule::{MetricType, Rule};

const WINDOW_MILLIS: u64 = 1_000;

/// Per-request input to a controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckContext {
    /// Permits requested by this call.
    pub batch_count: u32,
    /// Requests already in flight for the resource (excluding this one).
    pub concurrency: u32,
}

impl CheckContext {
    pub fn new(batch_count: u32) -> Self {
        Self { batch_count, concurrency: 0 }
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }
}

impl Default for CheckContext {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Why a request was rejected.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum BlockReason {
    /// The rule's threshold is already used up.
    ThresholdExceeded { threshold: f64 },
    /// Pacing would make the request wait longer than the queueing bound.
    QueueingTimeout { wait: Duration, max: Duration },
    /// Reason supplied by an operator-defined controller.
    Custom(String),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::ThresholdExceeded { threshold } => {
                write!(f, "threshold {} exceeded", threshold)
            }
            BlockReason::QueueingTimeout { wait, max } => {
                write!(f, "queueing time {:?} exceeds limit {:?}", wait, max)
            }
            BlockReason::Custom(reason) => write!(f, "{}", reason),
        }
    }
}

/// Outcome of checking one controller (or a resource's whole sequence).
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Proceed now.
    Pass,
    /// Proceed after waiting this long.
    Wait(Duration),
    /// Reject.
    Blocked(BlockReason),
}

impl Decision {
    pub fn is_pass(&self) -> bool {
        matches!(self, Decision::Pass)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Decision::Blocked(_))
    }
}

/// Enforcement object attached to a rule.
pub trait TrafficShapingController: Send + Sync + fmt::Debug {
    /// Decide whether a request may proceed.
    fn check(&self, ctx: &CheckContext) -> Decision;
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Direct/Reject: a fixed one-second window for QPS, an in-flight comparison
/// for concurrency.
#[derive(Debug)]
pub struct RejectController {
    rule: Arc<Rule>,
    clock: Arc<dyn Clock>,
    // (window start, permits passed in window)
    window: Mutex<(u64, f64)>,
}

impl RejectController {
    pub fn new(rule: Arc<Rule>, clock: Arc<dyn Clock>) -> Self {
        let start = clock.now_millis();
        Self { rule, clock, window: Mutex::new((start, 0.0)) }
    }
}

impl TrafficShapingController for RejectController {
    fn check(&self, ctx: &CheckContext) -> Decision {
        let threshold = self.rule.count;
        let batch = f64::from(ctx.batch_count);
        let blocked = Decision::Blocked(BlockReason::ThresholdExceeded { threshold });
        match self.rule.metric_type {
            MetricType::Concurrency => {
                if f64::from(ctx.concurrency) + batch > threshold {
                    blocked
                } else {
                    Decision::Pass
                }
            }
            MetricType::Qps => {
                let now = self.clock.now_millis();
                let mut window = lock(&self.window);
                if now.saturating_sub(window.0) >= WINDOW_MILLIS {
                    *window = (now, 0.0);
                }
                if window.1 + batch > threshold {
                    return blocked;
                }
                window.1 += batch;
                Decision::Pass
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WarmUp {
    started_at: u64,
    period_millis: u64,
    cold_factor: f64,
}

/// Throttling: paces requests evenly at `count` per second and queues each
/// for at most `max_queueing_time_ms`. With a warm-up ramp the effective rate
/// climbs linearly from `count / cold_factor` to `count`.
#[derive(Debug)]
pub struct ThrottlingController {
    rule: Arc<Rule>,
    clock: Arc<dyn Clock>,
    warm_up: Option<WarmUp>,
    // Time the most recently admitted request was scheduled for.
    last_passed: Mutex<Option<u64>>,
}

impl ThrottlingController {
    pub fn new(rule: Arc<Rule>, clock: Arc<dyn Clock>) -> Self {
        Self { rule, clock, warm_up: None, last_passed: Mutex::new(None) }
    }

    pub fn with_warm_up(rule: Arc<Rule>, clock: Arc<dyn Clock>) -> Self {
        let warm_up = WarmUp {
            started_at: clock.now_millis(),
            period_millis: u64::from(rule.warm_up_period_sec) * 1_000,
            cold_factor: f64::from(rule.effective_cold_factor()),
        };
        Self { rule, clock, warm_up: Some(warm_up), last_passed: Mutex::new(None) }
    }

    fn effective_rate(&self, now: u64) -> f64 {
        let Some(w) = self.warm_up else {
            return self.rule.count;
        };
        let elapsed = now.saturating_sub(w.started_at);
        if w.period_millis == 0 || elapsed >= w.period_millis {
            return self.rule.count;
        }
        let progress = elapsed as f64 / w.period_millis as f64;
        let cold = self.rule.count / w.cold_factor;
        cold + (self.rule.count - cold) * progress
    }
}

impl TrafficShapingController for ThrottlingController {
    fn check(&self, ctx: &CheckContext) -> Decision {
        let now = self.clock.now_millis();
        let rate = self.effective_rate(now);
        if rate <= 0.0 {
            return Decision::Blocked(BlockReason::ThresholdExceeded { threshold: rate });
        }
        let interval = (f64::from(ctx.batch_count) * WINDOW_MILLIS as f64 / rate).round() as u64;
        let mut last = lock(&self.last_passed);
        let expected = last.map_or(now, |l| l.saturating_add(interval));
        if expected <= now {
            *last = Some(now);
            return Decision::Pass;
        }
        let wait = Duration::from_millis(expected - now);
        let max = Duration::from_millis(u64::from(self.rule.max_queueing_time_ms));
        if wait > max {
            return Decision::Blocked(BlockReason::QueueingTimeout { wait, max });
        }
        *last = Some(expected);
        Decision::Wait(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rule::{ControlBehavior, TokenCalculateStrategy};

    fn manual() -> (Arc<ManualClock>, Arc<dyn Clock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let dynclock: Arc<dyn Clock> = clock.clone();
        (clock, dynclock)
    }

    #[test]
    fn reject_controller_limits_qps_per_window() {
        let (clock, dynclock) = manual();
        let tc = RejectController::new(Arc::new(Rule::new("api", 2.0)), dynclock);
        let ctx = CheckContext::default();
        assert!(tc.check(&ctx).is_pass());
        assert!(tc.check(&ctx).is_pass());
        assert!(tc.check(&ctx).is_blocked());

        clock.advance(1_000);
        assert!(tc.check(&ctx).is_pass());
    }

    #[test]
    fn reject_controller_compares_concurrency() {
        let (_, dynclock) = manual();
        let rule = Rule { metric_type: MetricType::Concurrency, ..Rule::new("db", 3.0) };
        let tc = RejectController::new(Arc::new(rule), dynclock);
        assert!(tc.check(&CheckContext::new(1).with_concurrency(2)).is_pass());
        assert_eq!(
            tc.check(&CheckContext::new(1).with_concurrency(3)),
            Decision::Blocked(BlockReason::ThresholdExceeded { threshold: 3.0 })
        );
    }

    #[test]
    fn throttling_paces_and_bounds_queueing() {
        let (clock, dynclock) = manual();
        let rule = Rule {
            control_behavior: ControlBehavior::Throttling,
            max_queueing_time_ms: 150,
            ..Rule::new("api", 10.0)
        };
        let tc = ThrottlingController::new(Arc::new(rule), dynclock);
        let ctx = CheckContext::default();

        assert_eq!(tc.check(&ctx), Decision::Pass);
        assert_eq!(tc.check(&ctx), Decision::Wait(Duration::from_millis(100)));
        assert!(matches!(tc.check(&ctx), Decision::Blocked(BlockReason::QueueingTimeout { .. })));

        clock.advance(300);
        assert_eq!(tc.check(&ctx), Decision::Pass);
    }

    #[test]
    fn throttling_with_zero_count_blocks() {
        let (_, dynclock) = manual();
        let rule = Rule { control_behavior: ControlBehavior::Throttling, ..Rule::new("off", 0.0) };
        let tc = ThrottlingController::new(Arc::new(rule), dynclock);
        assert!(tc.check(&CheckContext::default()).is_blocked());
    }

    #[test]
    fn warm_up_ramps_to_full_rate() {
        let (clock, dynclock) = manual();
        let rule = Rule {
            token_calculate_strategy: TokenCalculateStrategy::WarmUp,
            control_behavior: ControlBehavior::Throttling,
            warm_up_period_sec: 10,
            ..Rule::new("api", 30.0)
        };
        let tc = ThrottlingController::with_warm_up(Arc::new(rule), dynclock);
        assert!((tc.effective_rate(10_000) - 10.0).abs() < 1e-9);
        assert!((tc.effective_rate(15_000) - 20.0).abs() < 1e-9);
        assert!((tc.effective_rate(25_000) - 30.0).abs() < 1e-9);

        clock.advance(10_000);
        assert!(tc.check(&CheckContext::default()).is_pass());
    }
}
