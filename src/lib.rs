#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # flowshape
//!
//! Rule management core for adaptive flow shaping: decides which
//! traffic-shaping controllers govern each named resource and keeps that
//! decision consistent while rules change at runtime.
//!
//! ## Features
//!
//! - **Validated rules** ([`Rule`], [`validate::is_valid_rule`])
//! - **Pluggable generators** keyed by (allocation strategy, control behavior),
//!   with protected built-ins ([`GeneratorRegistry`])
//! - **Copy-on-write registry** with bulk load, append, update and clear
//!   ([`FlowRuleManager`]); readers never wait on writers
//! - **Tower middleware** that applies a resource's rules to a service
//!   ([`FlowControlLayer`])
//!
//! ## Quick Start
//!
//! ```rust
//! use flowshape::{CheckContext, FlowRuleManager, Rule};
//!
//! let manager = FlowRuleManager::new();
//! let outcome = manager.load_rules(vec![Rule { id: 1, ..Rule::new("checkout", 2.0) }]);
//! assert!(outcome.changed && outcome.is_complete());
//!
//! let ctx = CheckContext::new(1);
//! assert!(manager.check("checkout", &ctx).is_pass());
//! assert!(manager.check("checkout", &ctx).is_pass());
//! assert!(manager.check("checkout", &ctx).is_blocked());
//!
//! manager.clear_rules();
//! assert!(manager.get_rules().is_empty());
//! ```

pub mod clock;
pub mod error;
pub mod generator;
pub mod layer;
pub mod manager;
pub mod prelude;
pub mod publish;
pub mod rule;
pub mod shaping;
pub mod validate;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{FlowError, RuleError, ShapingError};
pub use generator::{ControllerGenerator, GeneratorKey, GeneratorRegistry, BUILTIN_KEYS};
pub use layer::{FlowControlLayer, FlowControlService};
pub use manager::{Controller, ControllerMap, FlowRuleManager, LoadOutcome, SkippedRule};
pub use rule::{ControlBehavior, MetricType, RelationStrategy, Rule, TokenCalculateStrategy};
pub use shaping::{BlockReason, CheckContext, Decision, TrafficShapingController};
pub use validate::is_valid_rule;
