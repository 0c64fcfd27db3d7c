//! Error types for rule validation, registry operations and the shaping middleware.
use std::fmt;

use crate::generator::GeneratorKey;
use crate::shaping::BlockReason;

/// A rule failed structural validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RuleError {
    /// `resource` is empty.
    #[error("resource must not be empty")]
    EmptyResource,
    /// `count` is negative, NaN or infinite.
    #[error("count must be a finite, non-negative number (got {count})")]
    InvalidCount {
        /// Offending threshold.
        count: f64,
    },
    /// A warm-up strategy was paired with something other than throttling.
    #[error("warm-up strategy requires throttling behavior (got {behavior})")]
    WarmUpRequiresThrottling {
        /// Behavior the rule asked for.
        behavior: crate::rule::ControlBehavior,
    },
    /// A warm-up strategy was given no warm-up period.
    #[error("warm_up_period_sec must be positive for warm-up strategy")]
    ZeroWarmUpPeriod,
    /// A cold factor of 1 yields no ramp.
    #[error("warm_up_cold_factor must be greater than 1 (got {factor})")]
    InvalidColdFactor {
        /// Offending factor.
        factor: u32,
    },
    /// An associated-resource relation names no resource.
    #[error("ref_resource must not be empty for associated-resource relation")]
    EmptyRefResource,
}

/// Errors returned by the generator and rule registries.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum FlowError {
    /// The rule failed validation.
    #[error("invalid rule: {0}")]
    InvalidRule(#[from] RuleError),
    /// No generator is registered for the rule's (strategy, behavior) pair.
    #[error("no traffic shaping generator registered for {key}")]
    UnresolvedGenerator {
        /// Pair that could not be resolved.
        key: GeneratorKey,
    },
    /// The generator refused to build a controller.
    #[error("generator for {key} failed: {reason}")]
    GeneratorFailed {
        /// Pair whose generator failed.
        key: GeneratorKey,
        /// Generator-provided reason.
        reason: String,
    },
    /// Built-in generator pairs cannot be replaced or removed.
    #[error("generator for {key} is built in and cannot be modified")]
    ProtectedGenerator {
        /// Protected pair.
        key: GeneratorKey,
    },
    /// The resource already carries a rule with the same classifying key.
    #[error("resource '{resource}' already has an equivalent rule (id {existing_id})")]
    DuplicateRule {
        /// Target resource.
        resource: String,
        /// Id of the rule already in place.
        existing_id: u64,
    },
    /// A live rule already uses this id.
    #[error("rule id {id} is already used by resource '{resource}'")]
    DuplicateId {
        /// Conflicting id.
        id: u64,
        /// Resource that holds the live rule.
        resource: String,
    },
    /// No live rule carries this id.
    #[error("no rule with id {id}")]
    NotFound {
        /// Id that was looked up.
        id: u64,
    },
    /// A per-resource load received a rule for another resource.
    #[error("rule targets resource '{found}', expected '{expected}'")]
    ResourceMismatch {
        /// Resource being loaded.
        expected: String,
        /// Resource named by the rule.
        found: String,
    },
}

impl FlowError {
    /// True for the two conflict variants raised by `append_rule`.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::DuplicateRule { .. } | Self::DuplicateId { .. })
    }

    /// True when the rule could not be turned into a controller.
    pub fn is_activation_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidRule(_) | Self::UnresolvedGenerator { .. } | Self::GeneratorFailed { .. }
        )
    }
}

/// Error produced by [`crate::layer::FlowControlService`].
#[derive(Debug, Clone)]
pub enum ShapingError<E> {
    /// A controller for the resource rejected the request.
    Blocked { resource: String, reason: BlockReason },
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ShapingError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked { resource, reason } => {
                write!(f, "request to '{}' blocked: {}", resource, reason)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ShapingError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Blocked { .. } => None,
        }
    }
}

impl<E> ShapingError<E> {
    /// Check if the request was rejected by flow control.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Blocked { .. } => None,
        }
    }

    /// Borrow the block reason if present.
    pub fn block_reason(&self) -> Option<&BlockReason> {
        match self {
            Self::Blocked { reason, .. } => Some(reason),
            Self::Inner(_) => None,
        }
    }
}
