//! Structural rule validation.

use crate::error::RuleError;
use crate::rule::{ControlBehavior, RelationStrategy, Rule, TokenCalculateStrategy};

/// Check a rule's internal consistency before it may be activated.
///
/// Pure: the rule is never modified. Custom strategy/behavior values pass
/// structurally; whether they make sense is their generator's concern.
pub fn is_valid_rule(rule: &Rule) -> Result<(), RuleError> {
    if rule.resource.is_empty() {
        return Err(RuleError::EmptyResource);
    }
    if !rule.count.is_finite() || rule.count < 0.0 {
        return Err(RuleError::InvalidCount { count: rule.count });
    }
    if rule.relation_strategy == RelationStrategy::AssociatedResource
        && rule.ref_resource.is_empty()
    {
        return Err(RuleError::EmptyRefResource);
    }
    if rule.token_calculate_strategy == TokenCalculateStrategy::WarmUp {
        if rule.control_behavior != ControlBehavior::Throttling {
            return Err(RuleError::WarmUpRequiresThrottling { behavior: rule.control_behavior });
        }
        if rule.warm_up_period_sec == 0 {
            return Err(RuleError::ZeroWarmUpPeriod);
        }
        if rule.warm_up_cold_factor == 1 {
            return Err(RuleError::InvalidColdFactor { factor: 1 });
        }
    }
    // max_queueing_time_ms is unsigned; throttling needs no further check.
    Ok(())
}
