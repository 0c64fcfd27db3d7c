//! Registry of traffic-shaping generators.
//!
//! A generator turns a validated [`Rule`] into its enforcement object. Lookups
//! are keyed by the rule's (allocation strategy, control behavior) pair. The
//! built-in pairs are registered at construction and guarded against
//! replacement or removal; every other pair belongs to operators.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::error::FlowError;
use crate::rule::{ControlBehavior, Rule, TokenCalculateStrategy};
use crate::shaping::{RejectController, ThrottlingController, TrafficShapingController};

/// Constructor producing an enforcement object from a rule.
pub type ControllerGenerator = Arc<
    dyn Fn(&Arc<Rule>) -> Result<Arc<dyn TrafficShapingController>, String> + Send + Sync,
>;

/// Lookup key for a generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeneratorKey {
    pub token_calculate_strategy: TokenCalculateStrategy,
    pub control_behavior: ControlBehavior,
}

impl GeneratorKey {
    pub const fn new(strategy: TokenCalculateStrategy, behavior: ControlBehavior) -> Self {
        Self { token_calculate_strategy: strategy, control_behavior: behavior }
    }

    /// Whether this pair is one of the protected defaults.
    pub fn is_builtin(&self) -> bool {
        BUILTIN_KEYS.contains(self)
    }
}

impl fmt::Display for GeneratorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.token_calculate_strategy, self.control_behavior)
    }
}

/// Pairs registered by every [`GeneratorRegistry`] and never modifiable.
pub const BUILTIN_KEYS: [GeneratorKey; 3] = [
    GeneratorKey::new(TokenCalculateStrategy::Direct, ControlBehavior::Reject),
    GeneratorKey::new(TokenCalculateStrategy::Direct, ControlBehavior::Throttling),
    GeneratorKey::new(TokenCalculateStrategy::WarmUp, ControlBehavior::Throttling),
];

fn builtin<F>(build: F) -> ControllerGenerator
where
    F: Fn(Arc<Rule>) -> Arc<dyn TrafficShapingController> + Send + Sync + 'static,
{
    Arc::new(move |rule: &Arc<Rule>| -> Result<Arc<dyn TrafficShapingController>, String> {
        Ok(build(rule.clone()))
    })
}

/// Thread-safe map from generator key to constructor.
pub struct GeneratorRegistry {
    entries: RwLock<HashMap<GeneratorKey, ControllerGenerator>>,
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GeneratorRegistry{{keys:{:?}}}", self.keys())
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneratorRegistry {
    /// Registry with the built-in generators reading a monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    /// Registry whose built-in controllers read `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let mut entries: HashMap<GeneratorKey, ControllerGenerator> = HashMap::new();
        let c = clock.clone();
        entries.insert(
            BUILTIN_KEYS[0],
            builtin(move |rule| {
                Arc::new(RejectController::new(rule, c.clone())) as Arc<dyn TrafficShapingController>
            }),
        );
        let c = clock.clone();
        entries.insert(
            BUILTIN_KEYS[1],
            builtin(move |rule| {
                Arc::new(ThrottlingController::new(rule, c.clone()))
                    as Arc<dyn TrafficShapingController>
            }),
        );
        entries.insert(
            BUILTIN_KEYS[2],
            builtin(move |rule| {
                Arc::new(ThrottlingController::with_warm_up(rule, clock.clone()))
                    as Arc<dyn TrafficShapingController>
            }),
        );
        Self { entries: RwLock::new(entries) }
    }

    /// Register or replace the generator for a custom pair.
    ///
    /// Built-in pairs are rejected with [`FlowError::ProtectedGenerator`] and
    /// the registry is left untouched. Controllers already built from an
    /// earlier generator are unaffected.
    pub fn set<F>(
        &self,
        strategy: TokenCalculateStrategy,
        behavior: ControlBehavior,
        generator: F,
    ) -> Result<(), FlowError>
    where
        F: Fn(&Arc<Rule>) -> Result<Arc<dyn TrafficShapingController>, String>
            + Send
            + Sync
            + 'static,
    {
        let key = GeneratorKey::new(strategy, behavior);
        if key.is_builtin() {
            warn!(target: "flowshape::generators", %key, "refusing to replace built-in generator");
            return Err(FlowError::ProtectedGenerator { key });
        }
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if map.insert(key, Arc::new(generator)).is_some() {
            info!(target: "flowshape::generators", %key, "generator replaced");
        } else {
            info!(target: "flowshape::generators", %key, "generator registered");
        }
        Ok(())
    }

    /// Remove the generator for a custom pair.
    ///
    /// Returns `Ok(false)` when nothing was registered for the pair.
    pub fn remove(
        &self,
        strategy: TokenCalculateStrategy,
        behavior: ControlBehavior,
    ) -> Result<bool, FlowError> {
        let key = GeneratorKey::new(strategy, behavior);
        if key.is_builtin() {
            warn!(target: "flowshape::generators", %key, "refusing to remove built-in generator");
            return Err(FlowError::ProtectedGenerator { key });
        }
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = map.remove(&key).is_some();
        if removed {
            info!(target: "flowshape::generators", %key, "generator removed");
        }
        Ok(removed)
    }

    /// Whether a generator is registered for the pair.
    pub fn contains(&self, strategy: TokenCalculateStrategy, behavior: ControlBehavior) -> bool {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        map.contains_key(&GeneratorKey::new(strategy, behavior))
    }

    /// Registered keys, built-ins included, in a stable order.
    pub fn keys(&self) -> Vec<GeneratorKey> {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<GeneratorKey> = map.keys().copied().collect();
        keys.sort_by_key(|k| (i32::from(k.token_calculate_strategy), i32::from(k.control_behavior)));
        keys
    }

    pub(crate) fn resolve(&self, key: &GeneratorKey) -> Option<ControllerGenerator> {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key).cloned()
    }

    /// Build the enforcement object for an already validated rule.
    pub(crate) fn generate(
        &self,
        rule: &Arc<Rule>,
    ) -> Result<Arc<dyn TrafficShapingController>, FlowError> {
        let key = rule.generator_key();
        let generator = self.resolve(&key).ok_or(FlowError::UnresolvedGenerator { key })?;
        // Lock released: the generator may itself consult the registry.
        generator(rule).map_err(|reason| FlowError::GeneratorFailed { key, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaping::{CheckContext, Decision};

    #[derive(Debug)]
    struct AlwaysPass;

    impl TrafficShapingController for AlwaysPass {
        fn check(&self, _ctx: &CheckContext) -> Decision {
            Decision::Pass
        }
    }

    fn custom() -> (TokenCalculateStrategy, ControlBehavior) {
        (TokenCalculateStrategy::Custom(111), ControlBehavior::Custom(112))
    }

    #[test]
    fn builtins_are_present_and_protected() {
        let reg = GeneratorRegistry::new();
        for key in BUILTIN_KEYS {
            assert!(reg.contains(key.token_calculate_strategy, key.control_behavior));
        }

        let err = reg
            .set(TokenCalculateStrategy::Direct, ControlBehavior::Reject, |_| {
                Ok(Arc::new(AlwaysPass) as Arc<dyn TrafficShapingController>)
            })
            .unwrap_err();
        assert!(matches!(err, FlowError::ProtectedGenerator { .. }));
        assert!(reg.remove(TokenCalculateStrategy::Direct, ControlBehavior::Reject).is_err());
        assert!(reg.contains(TokenCalculateStrategy::Direct, ControlBehavior::Reject));
    }

    #[test]
    fn builtin_reject_generator_survives_overwrite_attempt() {
        let reg = GeneratorRegistry::new();
        let _ = reg.set(TokenCalculateStrategy::Direct, ControlBehavior::Reject, |_| {
            Ok(Arc::new(AlwaysPass) as Arc<dyn TrafficShapingController>)
        });
        let rule = Arc::new(Rule::new("r", 0.0));
        let tc = reg.generate(&rule).unwrap();
        // A zero-count reject rule blocks; AlwaysPass would not.
        assert!(tc.check(&CheckContext::default()).is_blocked());
    }

    #[test]
    fn custom_pairs_register_replace_and_remove() {
        let reg = GeneratorRegistry::new();
        let (s, b) = custom();
        assert!(!reg.contains(s, b));

        reg.set(s, b, |_| Ok(Arc::new(AlwaysPass) as Arc<dyn TrafficShapingController>)).unwrap();
        reg.set(s, b, |_| Ok(Arc::new(AlwaysPass) as Arc<dyn TrafficShapingController>)).unwrap();
        assert!(reg.contains(s, b));
        assert_eq!(reg.keys().len(), BUILTIN_KEYS.len() + 1);

        assert_eq!(reg.remove(s, b), Ok(true));
        assert_eq!(reg.remove(s, b), Ok(false));
        assert!(!reg.contains(s, b));
        assert_eq!(reg.keys().len(), BUILTIN_KEYS.len());
    }

    #[test]
    fn generate_reports_missing_and_failing_generators() {
        let reg = GeneratorRegistry::new();
        let (s, b) = custom();
        let rule = Arc::new(Rule {
            token_calculate_strategy: s,
            control_behavior: b,
            ..Rule::new("r", 1.0)
        });
        assert!(matches!(reg.generate(&rule), Err(FlowError::UnresolvedGenerator { .. })));

        reg.set(s, b, |_| Err("unsupported".to_string())).unwrap();
        match reg.generate(&rule) {
            Err(FlowError::GeneratorFailed { reason, .. }) => assert_eq!(reason, "unsupported"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
