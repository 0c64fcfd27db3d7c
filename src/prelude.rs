//! Convenient re-exports for common flowshape types.
pub use crate::{
    error::{FlowError, RuleError, ShapingError},
    generator::GeneratorRegistry,
    layer::FlowControlLayer,
    manager::{FlowRuleManager, LoadOutcome},
    rule::{ControlBehavior, MetricType, RelationStrategy, Rule, TokenCalculateStrategy},
    shaping::{CheckContext, Decision, TrafficShapingController},
};
