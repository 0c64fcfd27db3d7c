//! Flow rule data model.
//!
//! A [`Rule`] describes one flow-shaping policy for one resource. Rules are
//! plain values; the registry only turns them into controllers after they pass
//! [`crate::validate::is_valid_rule`].

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// Cold factor applied when a warm-up rule leaves `warm_up_cold_factor` at zero.
pub const DEFAULT_WARM_UP_COLD_FACTOR: u32 = 3;

/// Quantity measured against a rule's `count`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "i32", into = "i32"))]
pub enum MetricType {
    /// Requests currently in flight.
    Concurrency,
    /// Requests per second.
    #[default]
    Qps,
}

impl TryFrom<i32> for MetricType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MetricType::Concurrency),
            1 => Ok(MetricType::Qps),
            other => Err(format!("unknown metric type: {other}")),
        }
    }
}

impl From<MetricType> for i32 {
    fn from(value: MetricType) -> Self {
        match value {
            MetricType::Concurrency => 0,
            MetricType::Qps => 1,
        }
    }
}

/// How `ref_resource` relates to `resource`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "i32", into = "i32"))]
pub enum RelationStrategy {
    /// The rule measures the resource itself.
    #[default]
    CurrentResource,
    /// The rule measures `ref_resource` and limits `resource` with it.
    AssociatedResource,
}

impl TryFrom<i32> for RelationStrategy {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RelationStrategy::CurrentResource),
            1 => Ok(RelationStrategy::AssociatedResource),
            other => Err(format!("unknown relation strategy: {other}")),
        }
    }
}

impl From<RelationStrategy> for i32 {
    fn from(value: RelationStrategy) -> Self {
        match value {
            RelationStrategy::CurrentResource => 0,
            RelationStrategy::AssociatedResource => 1,
        }
    }
}

/// Allocation strategy: how much capacity is available over time.
///
/// Integers other than 0 and 1 are operator-defined strategies; pair them with
/// a generator registered through [`crate::GeneratorRegistry::set`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "i32", into = "i32"))]
pub enum TokenCalculateStrategy {
    /// Full capacity from the first request.
    #[default]
    Direct,
    /// Capacity ramps up from a cold start.
    WarmUp,
    /// Operator-defined strategy.
    Custom(i32),
}

impl From<i32> for TokenCalculateStrategy {
    fn from(value: i32) -> Self {
        match value {
            0 => TokenCalculateStrategy::Direct,
            1 => TokenCalculateStrategy::WarmUp,
            other => TokenCalculateStrategy::Custom(other),
        }
    }
}

impl From<TokenCalculateStrategy> for i32 {
    fn from(value: TokenCalculateStrategy) -> Self {
        match value {
            TokenCalculateStrategy::Direct => 0,
            TokenCalculateStrategy::WarmUp => 1,
            TokenCalculateStrategy::Custom(v) => v,
        }
    }
}

impl fmt::Display for TokenCalculateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenCalculateStrategy::Direct => write!(f, "Direct"),
            TokenCalculateStrategy::WarmUp => write!(f, "WarmUp"),
            TokenCalculateStrategy::Custom(v) => write!(f, "Custom({v})"),
        }
    }
}

/// What happens to demand that exceeds the allowance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "i32", into = "i32"))]
pub enum ControlBehavior {
    /// Reject excess requests immediately.
    #[default]
    Reject,
    /// Pace requests, queueing them up to `max_queueing_time_ms`.
    Throttling,
    /// Operator-defined behavior.
    Custom(i32),
}

impl From<i32> for ControlBehavior {
    fn from(value: i32) -> Self {
        match value {
            0 => ControlBehavior::Reject,
            1 => ControlBehavior::Throttling,
            other => ControlBehavior::Custom(other),
        }
    }
}

impl From<ControlBehavior> for i32 {
    fn from(value: ControlBehavior) -> Self {
        match value {
            ControlBehavior::Reject => 0,
            ControlBehavior::Throttling => 1,
            ControlBehavior::Custom(v) => v,
        }
    }
}

impl fmt::Display for ControlBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlBehavior::Reject => write!(f, "Reject"),
            ControlBehavior::Throttling => write!(f, "Throttling"),
            ControlBehavior::Custom(v) => write!(f, "Custom({v})"),
        }
    }
}

/// One flow-shaping policy for one resource.
///
/// `id == 0` means unassigned. Non-zero ids are the handle
/// [`crate::FlowRuleManager::update_rule`] uses, so they must be unique among
/// appended rules.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct Rule {
    pub id: u64,
    pub resource: String,
    pub metric_type: MetricType,
    pub count: f64,
    pub relation_strategy: RelationStrategy,
    pub ref_resource: String,
    pub token_calculate_strategy: TokenCalculateStrategy,
    pub control_behavior: ControlBehavior,
    pub warm_up_period_sec: u32,
    /// Zero selects [`DEFAULT_WARM_UP_COLD_FACTOR`].
    pub warm_up_cold_factor: u32,
    pub max_queueing_time_ms: u32,
}

/// Tuple used to detect two semantically duplicate rules on one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassifyingKey<'a> {
    pub resource: &'a str,
    pub relation_strategy: RelationStrategy,
    pub token_calculate_strategy: TokenCalculateStrategy,
    pub control_behavior: ControlBehavior,
}

impl Rule {
    /// Shorthand for a direct/reject QPS rule.
    pub fn new(resource: impl Into<String>, count: f64) -> Self {
        Self { resource: resource.into(), count, ..Self::default() }
    }

    /// Check the rule's internal consistency.
    pub fn validate(&self) -> Result<(), RuleError> {
        crate::validate::is_valid_rule(self)
    }

    pub fn classifying_key(&self) -> ClassifyingKey<'_> {
        ClassifyingKey {
            resource: &self.resource,
            relation_strategy: self.relation_strategy,
            token_calculate_strategy: self.token_calculate_strategy,
            control_behavior: self.control_behavior,
        }
    }

    /// Generator lookup key for this rule.
    pub fn generator_key(&self) -> crate::generator::GeneratorKey {
        crate::generator::GeneratorKey::new(self.token_calculate_strategy, self.control_behavior)
    }

    /// Resource whose statistics this rule is measured against.
    pub fn stat_resource(&self) -> &str {
        match self.relation_strategy {
            RelationStrategy::AssociatedResource => &self.ref_resource,
            RelationStrategy::CurrentResource => &self.resource,
        }
    }

    pub(crate) fn effective_cold_factor(&self) -> u32 {
        if self.warm_up_cold_factor == 0 {
            DEFAULT_WARM_UP_COLD_FACTOR
        } else {
            self.warm_up_cold_factor
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rule{{id={}, resource={}, metric={:?}, count={}, strategy={}, behavior={}",
            self.id,
            self.resource,
            self.metric_type,
            self.count,
            self.token_calculate_strategy,
            self.control_behavior
        )?;
        if self.relation_strategy == RelationStrategy::AssociatedResource {
            write!(f, ", ref={}", self.ref_resource)?;
        }
        if self.token_calculate_strategy == TokenCalculateStrategy::WarmUp {
            write!(
                f,
                ", warm_up={}s, cold_factor={}",
                self.warm_up_period_sec,
                self.effective_cold_factor()
            )?;
        }
        if self.control_behavior == ControlBehavior::Throttling {
            write!(f, ", max_queueing={}ms", self.max_queueing_time_ms)?;
        }
        write!(f, "}}")
    }
}
