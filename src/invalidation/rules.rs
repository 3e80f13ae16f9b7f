//! Rule engine: which cascades an event triggers.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::event::{InvalidationEvent, InvalidationType, RuleAction};
use crate::pattern::KeyPattern;

/// Extra gate evaluated after trigger and pattern matching.
pub type RulePredicate = Arc<dyn Fn(&InvalidationEvent) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct InvalidationRule {
    pub id: String,
    /// Matched against each id of the event target.
    pub pattern: KeyPattern,
    pub triggers: HashSet<InvalidationType>,
    pub action: RuleAction,
    /// Published as pattern intents when the rule fires.
    pub cascade: Vec<KeyPattern>,
    pub priority: i32,
    pub enabled: bool,
    predicate: Option<RulePredicate>,
}

impl InvalidationRule {
    /// An enabled delete rule with no triggers, cascades, or predicate.
    pub fn new(id: impl Into<String>, pattern: KeyPattern) -> Self {
        Self {
            id: id.into(),
            pattern,
            triggers: HashSet::new(),
            action: RuleAction::Delete,
            cascade: Vec::new(),
            priority: 0,
            enabled: true,
            predicate: None,
        }
    }

    pub fn on(mut self, trigger: InvalidationType) -> Self {
        self.triggers.insert(trigger);
        self
    }

    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.action = action;
        self
    }

    pub fn cascade_to(mut self, pattern: KeyPattern) -> Self {
        self.cascade.push(pattern);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&InvalidationEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &InvalidationEvent) -> bool {
        self.enabled
            && self.triggers.contains(&event.kind)
            && self
                .pattern
                .matches_any(event.target.ids().iter().map(String::as_str))
            && self
                .predicate
                .as_ref()
                .is_none_or(|predicate| predicate(event))
    }
}

impl fmt::Debug for InvalidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRule")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("triggers", &self.triggers)
            .field("action", &self.action)
            .field("cascade", &self.cascade)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl From<&crate::config::RuleSettings> for InvalidationRule {
    fn from(settings: &crate::config::RuleSettings) -> Self {
        Self {
            id: settings.id.clone(),
            pattern: settings.pattern.clone(),
            triggers: settings.triggers.iter().copied().collect(),
            action: settings.action,
            cascade: settings.cascade.clone(),
            priority: settings.priority,
            enabled: settings.enabled,
            predicate: None,
        }
    }
}

/// Rules kept sorted by descending priority; equal priorities keep insertion order.
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    rules: Vec<InvalidationRule>,
}

impl RuleSet {
    /// Insert or replace by id. Returns the replaced rule.
    pub fn insert(&mut self, rule: InvalidationRule) -> Option<InvalidationRule> {
        let replaced = self.remove(&rule.id);
        let position = self
            .rules
            .iter()
            .position(|existing| existing.priority < rule.priority)
            .unwrap_or(self.rules.len());
        self.rules.insert(position, rule);
        replaced
    }

    pub fn remove(&mut self, id: &str) -> Option<InvalidationRule> {
        let position = self.rules.iter().position(|rule| rule.id == id)?;
        Some(self.rules.remove(position))
    }

    /// Returns false if no rule has `id`.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|rule| rule.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Rules firing for `event`, highest priority first.
    pub fn matching<'a>(
        &'a self,
        event: &'a InvalidationEvent,
    ) -> impl Iterator<Item = &'a InvalidationRule> + 'a {
        self.rules.iter().filter(move |rule| rule.matches(event))
    }

    pub fn iter(&self) -> impl Iterator<Item = &InvalidationRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
