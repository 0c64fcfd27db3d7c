//! Flow rule registry.
//!
//! [`FlowRuleManager`] owns the live mapping from resource name to its ordered
//! controllers. Writers (`load_rules`, `append_rule`, `update_rule`,
//! `clear_rules` and the per-resource variants) are serialized and build a
//! private copy of the mapping before publishing it in one atomic swap.
//! Readers take a snapshot and never wait on a writer's activation work.
//!
//! ## Ordering
//! Controllers of one resource keep insertion order; that order is the order
//! [`FlowRuleManager::check`] evaluates them in.
//!
//! ## Open corners
//! - `update_rule` looks for the id on the incoming rule's own resource first,
//!   then on the other resources in name order. A rule whose resource changes
//!   moves to the end of the new resource's sequence.
//! - `load_rules` never fails as a whole; rules that cannot be activated are
//!   reported in [`LoadOutcome::skipped`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tracing::{debug, info, warn};

use crate::error::FlowError;
use crate::generator::GeneratorRegistry;
use crate::publish::Published;
use crate::rule::{ControlBehavior, Rule, TokenCalculateStrategy};
use crate::shaping::{CheckContext, Decision, TrafficShapingController};

/// A validated rule paired with the enforcement object built from it.
#[derive(Clone, Debug)]
pub struct Controller {
    rule: Arc<Rule>,
    shaper: Arc<dyn TrafficShapingController>,
}

impl Controller {
    /// Rule this controller was built from (the exact value passed in).
    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    /// Opaque enforcement object.
    pub fn shaper(&self) -> &Arc<dyn TrafficShapingController> {
        &self.shaper
    }

    pub fn check(&self, ctx: &CheckContext) -> Decision {
        self.shaper.check(ctx)
    }
}

/// Resource name to controllers, in evaluation order.
pub type ControllerMap = HashMap<String, Vec<Controller>>;

/// A rule dropped by a bulk load.
#[derive(Clone, Debug, PartialEq)]
pub struct SkippedRule {
    /// Position in the input.
    pub index: usize,
    pub id: u64,
    pub resource: String,
    pub error: FlowError,
}

/// Result of a bulk load.
#[derive(Clone, Debug, Default, PartialEq)]
#[must_use]
pub struct LoadOutcome {
    /// Whether the published mapping changed.
    pub changed: bool,
    /// Rules that failed activation, in input order.
    pub skipped: Vec<SkippedRule>,
}

impl LoadOutcome {
    /// True when every input rule was activated.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Process-wide rule registry.
#[derive(Debug, Default)]
pub struct FlowRuleManager {
    controllers: Published<ControllerMap>,
    generators: GeneratorRegistry,
}

static GLOBAL: OnceLock<FlowRuleManager> = OnceLock::new();

impl FlowRuleManager {
    /// Empty registry with the built-in generators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry using the given generators.
    pub fn with_generators(generators: GeneratorRegistry) -> Self {
        Self { controllers: Published::default(), generators }
    }

    /// Lazily created process-wide instance.
    pub fn global() -> &'static FlowRuleManager {
        GLOBAL.get_or_init(FlowRuleManager::new)
    }

    pub fn generators(&self) -> &GeneratorRegistry {
        &self.generators
    }

    /// See [`GeneratorRegistry::set`].
    pub fn set_traffic_shaping_generator<F>(
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
        self.generators.set(strategy, behavior, generator)
    }

    /// See [`GeneratorRegistry::remove`].
    pub fn remove_traffic_shaping_generator(
        &self,
        strategy: TokenCalculateStrategy,
        behavior: ControlBehavior,
    ) -> Result<bool, FlowError> {
        self.generators.remove(strategy, behavior)
    }

    fn activate(&self, rule: Arc<Rule>) -> Result<Controller, FlowError> {
        rule.validate()?;
        let shaper = self.generators.generate(&rule)?;
        Ok(Controller { rule, shaper })
    }

    fn activate_all<I>(&self, rules: I, only: Option<&str>) -> (Vec<Controller>, Vec<SkippedRule>)
    where
        I: IntoIterator,
        I::Item: Into<Arc<Rule>>,
    {
        let mut built = Vec::new();
        let mut skipped = Vec::new();
        for (index, rule) in rules.into_iter().enumerate() {
            let rule: Arc<Rule> = rule.into();
            let result = match only {
                Some(expected) if rule.resource != expected => Err(FlowError::ResourceMismatch {
                    expected: expected.to_string(),
                    found: rule.resource.clone(),
                }),
                _ => self.activate(rule.clone()),
            };
            match result {
                Ok(controller) => built.push(controller),
                Err(error) => {
                    warn!(target: "flowshape::rules", index, rule = %rule, %error, "skipping flow rule");
                    skipped.push(SkippedRule {
                        index,
                        id: rule.id,
                        resource: rule.resource.clone(),
                        error,
                    });
                }
            }
        }
        (built, skipped)
    }

    /// Replace every rule with `rules`.
    ///
    /// Rules are grouped by resource in input order. Ids are not checked for
    /// uniqueness here. Rules that fail validation or generator resolution are
    /// skipped and reported; they never abort the load. When the result equals
    /// the live mapping by value, nothing is published and the live
    /// controllers keep their state.
    pub fn load_rules<I>(&self, rules: I) -> LoadOutcome
    where
        I: IntoIterator,
        I::Item: Into<Arc<Rule>>,
    {
        let (built, skipped) = self.activate_all(rules, None);
        let mut next = ControllerMap::new();
        for controller in built {
            next.entry(controller.rule.resource.clone()).or_default().push(controller);
        }
        let total: usize = next.values().map(Vec::len).sum();

        let changed = self.controllers.update(|cur| {
            if same_rules(cur, &next) {
                (None, false)
            } else {
                (Some(next), true)
            }
        });

        info!(
            target: "flowshape::rules",
            loaded = total,
            skipped = skipped.len(),
            changed,
            "flow rules loaded"
        );
        LoadOutcome { changed, skipped }
    }

    /// Replace the rules of a single resource, leaving others untouched.
    ///
    /// Rules naming another resource are skipped with
    /// [`FlowError::ResourceMismatch`]. An empty input removes the resource.
    pub fn load_rules_of_resource<I>(&self, resource: &str, rules: I) -> LoadOutcome
    where
        I: IntoIterator,
        I::Item: Into<Arc<Rule>>,
    {
        let (built, skipped) = self.activate_all(rules, Some(resource));
        let loaded = built.len();
        let changed = self.controllers.update(|cur| {
            let unchanged = match cur.get(resource) {
                Some(live) => same_sequence(live, &built),
                None => built.is_empty(),
            };
            if unchanged {
                return (None, false);
            }
            let mut next = cur.clone();
            if built.is_empty() {
                next.remove(resource);
            } else {
                next.insert(resource.to_string(), built);
            }
            (Some(next), true)
        });

        info!(
            target: "flowshape::rules",
            resource,
            loaded,
            skipped = skipped.len(),
            changed,
            "flow rules of resource loaded"
        );
        LoadOutcome { changed, skipped }
    }

    /// Add one rule without disturbing other resources.
    ///
    /// Fails if the rule cannot be activated, if its resource already has a
    /// rule with the same classifying key, or if its non-zero id is already
    /// live on any resource. On failure nothing is published.
    pub fn append_rule(&self, rule: impl Into<Arc<Rule>>) -> Result<(), FlowError> {
        let rule: Arc<Rule> = rule.into();
        rule.validate()?;
        self.controllers.edit(|cur| -> Result<(Option<ControllerMap>, ()), FlowError> {
            if let Some(existing) = cur
                .get(&rule.resource)
                .and_then(|seq| seq.iter().find(|c| c.rule.classifying_key() == rule.classifying_key()))
            {
                return Err(FlowError::DuplicateRule {
                    resource: rule.resource.clone(),
                    existing_id: existing.rule.id,
                });
            }
            if rule.id != 0 {
                if let Some((resource, _)) = find_by_id(cur, rule.id, &rule.resource) {
                    return Err(FlowError::DuplicateId { id: rule.id, resource: resource.to_string() });
                }
            }
            let controller = self.activate(rule.clone())?;
            let mut next = cur.clone();
            next.entry(rule.resource.clone()).or_default().push(controller);
            Ok((Some(next), ()))
        })?;
        debug!(target: "flowshape::rules", rule = %rule, "flow rule appended");
        Ok(())
    }

    /// Replace the live rule carrying `rule.id` in place.
    ///
    /// The id must be non-zero and live. The incoming rule must activate and
    /// must not duplicate the classifying key of another rule on its target
    /// resource; otherwise the old controller stays. Same-resource updates
    /// keep their position; a changed resource moves the entry to the end of
    /// the new resource's sequence.
    pub fn update_rule(&self, rule: impl Into<Arc<Rule>>) -> Result<(), FlowError> {
        let rule: Arc<Rule> = rule.into();
        if rule.id == 0 {
            return Err(FlowError::NotFound { id: 0 });
        }
        let moved_from = self.controllers.edit(|cur| -> Result<(Option<ControllerMap>, Option<String>), FlowError> {
            let (old_resource, index) =
                find_by_id(cur, rule.id, &rule.resource).ok_or(FlowError::NotFound { id: rule.id })?;
            let old_resource = old_resource.to_string();
            let controller = self.activate(rule.clone())?;

            let same_resource = old_resource == rule.resource;
            if let Some(seq) = cur.get(&rule.resource) {
                let clash = seq.iter().enumerate().find(|(i, c)| {
                    !(same_resource && *i == index)
                        && c.rule.classifying_key() == rule.classifying_key()
                });
                if let Some((_, existing)) = clash {
                    return Err(FlowError::DuplicateRule {
                        resource: rule.resource.clone(),
                        existing_id: existing.rule.id,
                    });
                }
            }

            let mut next = cur.clone();
            if same_resource {
                if let Some(seq) = next.get_mut(&old_resource) {
                    seq[index] = controller;
                }
                return Ok((Some(next), None));
            }
            if let Some(seq) = next.get_mut(&old_resource) {
                seq.remove(index);
                if seq.is_empty() {
                    next.remove(&old_resource);
                }
            }
            next.entry(rule.resource.clone()).or_default().push(controller);
            Ok((Some(next), Some(old_resource)))
        })?;
        match moved_from {
            Some(from) => {
                debug!(target: "flowshape::rules", rule = %rule, from = %from, "flow rule updated and moved")
            }
            None => debug!(target: "flowshape::rules", rule = %rule, "flow rule updated"),
        }
        Ok(())
    }

    /// Drop every rule. Generators are kept.
    pub fn clear_rules(&self) {
        self.controllers.publish(ControllerMap::new());
        info!(target: "flowshape::rules", "flow rules cleared");
    }

    /// Drop one resource's rules. Returns whether any were present.
    pub fn clear_rules_of_resource(&self, resource: &str) -> bool {
        let removed = self.controllers.update(|cur| {
            if !cur.contains_key(resource) {
                return (None, false);
            }
            let mut next = cur.clone();
            next.remove(resource);
            (Some(next), true)
        });
        if removed {
            info!(target: "flowshape::rules", resource, "flow rules of resource cleared");
        }
        removed
    }

    /// Independent copies of every live rule.
    ///
    /// Resources are visited in name order; within a resource, evaluation
    /// order. Mutating the result never affects the registry.
    pub fn get_rules(&self) -> Vec<Rule> {
        let snapshot = self.controllers.load();
        sorted_resources(&snapshot)
            .flat_map(|(_, seq)| seq.iter().map(|c| Rule::clone(&c.rule)))
            .collect()
    }

    /// Copies of one resource's live rules, in evaluation order.
    pub fn get_rules_of_resource(&self, resource: &str) -> Vec<Rule> {
        let snapshot = self.controllers.load();
        snapshot
            .get(resource)
            .map(|seq| seq.iter().map(|c| Rule::clone(&c.rule)).collect())
            .unwrap_or_default()
    }

    /// The exact `Arc`s backing the live controllers, without copying rules.
    ///
    /// Same order as [`get_rules`](Self::get_rules). Callers share these
    /// values with the registry and must treat them as read-only.
    pub fn shared_rules(&self) -> Vec<Arc<Rule>> {
        let snapshot = self.controllers.load();
        sorted_resources(&snapshot)
            .flat_map(|(_, seq)| seq.iter().map(|c| c.rule.clone()))
            .collect()
    }

    /// Zero-copy snapshot of the live mapping for hot-path readers.
    pub fn controllers(&self) -> Arc<ControllerMap> {
        self.controllers.load()
    }

    /// Evaluate a resource's controllers in order.
    ///
    /// The first [`Decision::Blocked`] wins. Otherwise the longest requested
    /// wait is returned, or [`Decision::Pass`]. A resource without rules
    /// passes.
    pub fn check(&self, resource: &str, ctx: &CheckContext) -> Decision {
        let snapshot = self.controllers.load();
        let Some(seq) = snapshot.get(resource) else {
            return Decision::Pass;
        };
        let mut decision = Decision::Pass;
        for controller in seq {
            match controller.check(ctx) {
                Decision::Pass => {}
                Decision::Wait(wait) => {
                    decision = match decision {
                        Decision::Wait(prev) if prev >= wait => Decision::Wait(prev),
                        _ => Decision::Wait(wait),
                    };
                }
                blocked @ Decision::Blocked(_) => return blocked,
            }
        }
        decision
    }
}

fn sorted_resources(map: &ControllerMap) -> impl Iterator<Item = (&String, &Vec<Controller>)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter()
}

/// Locate a live rule by id, preferring `preferred`'s sequence.
fn find_by_id<'a>(map: &'a ControllerMap, id: u64, preferred: &str) -> Option<(&'a str, usize)> {
    if let Some((name, seq)) = map.get_key_value(preferred) {
        if let Some(i) = seq.iter().position(|c| c.rule.id == id) {
            return Some((name.as_str(), i));
        }
    }
    sorted_resources(map).filter(|(name, _)| name.as_str() != preferred).find_map(|(name, seq)| {
        seq.iter().position(|c| c.rule.id == id).map(|i| (name.as_str(), i))
    })
}

fn same_sequence(a: &[Controller], b: &[Controller]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| *x.rule == *y.rule)
}

fn same_rules(a: &ControllerMap, b: &ControllerMap) -> bool {
    a.len() == b.len()
        && a.iter().all(|(resource, seq)| b.get(resource).is_some_and(|other| same_sequence(seq, other)))
}
