//! Conditions gating whether a target is fetched in the current session.

use serde_json::{Map, Value};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionKind {
    /// Current UTC hour, 0..=23.
    Time,
    Location,
    UserSegment,
    DeviceType,
    /// Looked up in [`WarmingContext::attributes`].
    Custom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WarmingCondition {
    pub kind: ConditionKind,
    pub operator: ConditionOperator,
    pub value: Value,
}

impl WarmingCondition {
    pub fn new(kind: ConditionKind, operator: ConditionOperator, value: Value) -> Self {
        Self {
            kind,
            operator,
            value,
        }
    }

    /// A condition whose subject is missing from the context is unmet.
    pub fn evaluate(&self, context: &WarmingContext, now: OffsetDateTime) -> bool {
        let actual = match &self.kind {
            ConditionKind::Time => Some(Value::from(now.hour())),
            ConditionKind::Location => context.location.clone().map(Value::String),
            ConditionKind::UserSegment => context.user_segment.clone().map(Value::String),
            ConditionKind::DeviceType => context.device_type.clone().map(Value::String),
            ConditionKind::Custom(name) => context.attributes.get(name).cloned(),
        };
        actual.is_some_and(|actual| apply(self.operator, &actual, &self.value))
    }
}

fn apply(operator: ConditionOperator, actual: &Value, expected: &Value) -> bool {
    match operator {
        ConditionOperator::Eq => loosely_equal(actual, expected),
        ConditionOperator::Ne => !loosely_equal(actual, expected),
        ConditionOperator::Gt => compare(actual, expected).is_some_and(|o| o.is_gt()),
        ConditionOperator::Lt => compare(actual, expected).is_some_and(|o| o.is_lt()),
        ConditionOperator::Gte => compare(actual, expected).is_some_and(|o| o.is_ge()),
        ConditionOperator::Lte => compare(actual, expected).is_some_and(|o| o.is_le()),
        ConditionOperator::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| loosely_equal(item, needle)),
            _ => false,
        },
        ConditionOperator::In => match expected {
            Value::Array(items) => items.iter().any(|item| loosely_equal(actual, item)),
            _ => false,
        },
    }
}

/// Numbers compare by value so `23` equals `23.0`.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Caller-supplied context for condition evaluation and usage tracking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarmingContext {
    pub location: Option<String>,
    pub user_segment: Option<String>,
    pub device_type: Option<String>,
    pub attributes: Map<String, Value>,
}

impl WarmingContext {
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_user_segment(mut self, segment: impl Into<String>) -> Self {
        self.user_segment = Some(segment.into());
        self
    }

    pub fn with_device_type(mut self, device: impl Into<String>) -> Self {
        self.device_type = Some(device.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.location.is_none()
            && self.user_segment.is_none()
            && self.device_type.is_none()
            && self.attributes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    const TEN_AM: OffsetDateTime = datetime!(2024-05-01 10:15 UTC);

    #[test]
    fn time_condition_uses_current_hour() {
        let late = WarmingCondition::new(ConditionKind::Time, ConditionOperator::Gt, json!(23));
        assert!(!late.evaluate(&WarmingContext::default(), TEN_AM));

        let morning = WarmingCondition::new(ConditionKind::Time, ConditionOperator::Gte, json!(10));
        assert!(morning.evaluate(&WarmingContext::default(), TEN_AM));

        let business = WarmingCondition::new(
            ConditionKind::Time,
            ConditionOperator::In,
            json!([9, 10, 11]),
        );
        assert!(business.evaluate(&WarmingContext::default(), TEN_AM));
    }

    #[test]
    fn missing_context_value_is_unmet() {
        let condition =
            WarmingCondition::new(ConditionKind::Location, ConditionOperator::Ne, json!("eu"));
        assert!(!condition.evaluate(&WarmingContext::default(), TEN_AM));
        assert!(condition.evaluate(&WarmingContext::default().with_location("us"), TEN_AM));
    }

    #[test]
    fn string_and_custom_operators() {
        let context = WarmingContext::default()
            .with_user_segment("premium-eu")
            .with_attribute("plans", json!(["pro", "team"]));

        let contains = WarmingCondition::new(
            ConditionKind::UserSegment,
            ConditionOperator::Contains,
            json!("premium"),
        );
        assert!(contains.evaluate(&context, TEN_AM));

        let plan = WarmingCondition::new(
            ConditionKind::Custom("plans".to_string()),
            ConditionOperator::Contains,
            json!("team"),
        );
        assert!(plan.evaluate(&context, TEN_AM));

        let mismatched = WarmingCondition::new(
            ConditionKind::UserSegment,
            ConditionOperator::Gt,
            json!(3),
        );
        assert!(!mismatched.evaluate(&context, TEN_AM));
    }

    #[test]
    fn numbers_compare_by_value() {
        let condition = WarmingCondition::new(ConditionKind::Time, ConditionOperator::Eq, json!(10.0));
        assert!(condition.evaluate(&WarmingContext::default(), TEN_AM));
    }
}
