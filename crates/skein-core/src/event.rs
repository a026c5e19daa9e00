//! Event filter matching
//!
//! Shared by the Listen task (deciding whether collected events satisfy
//! the consumption strategy) and by the runtime's event subscriptions
//! (deciding which pending listens an incoming event should resume).

use serde_json::Value;

use crate::dsl::EventFilter;
use crate::error::WorkflowError;
use crate::expr;
use crate::scope::Scope;
use crate::tree::Position;

/// Whether an event envelope satisfies a filter
///
/// Each `with` entry must match the event attribute of the same name:
/// a `${ ... }` string is evaluated against the event and must yield
/// `true` or the attribute's value; anything else compares for equality.
/// Correlation entries extract a value `from` the event and, when
/// `expect` is present, compare it.
pub fn matches(filter: &EventFilter, event: &Value, at: &Position) -> Result<bool, WorkflowError> {
    let scope = Scope::new();

    for (attribute, expected) in &filter.with {
        let actual = event.get(attribute).cloned().unwrap_or(Value::Null);
        let matched = match expected {
            Value::String(s) => match expr::as_marked_expression(s) {
                Some(src) => match expr::evaluate(src, event, &scope, at)? {
                    Value::Bool(b) => b,
                    other => other == actual,
                },
                None => actual == *expected,
            },
            other => actual == *other,
        };
        if !matched {
            return Ok(false);
        }
    }

    if let Some(correlations) = &filter.correlate {
        for correlation in correlations.values() {
            let extracted = expr::evaluate_field(&correlation.from, event, &scope, at)?;
            match &correlation.expect {
                None => {
                    if extracted.is_null() {
                        return Ok(false);
                    }
                }
                Some(expected) => {
                    let expected = expr::evaluate_value(expected, event, &scope, at)?;
                    if extracted != expected {
                        return Ok(false);
                    }
                }
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;

    fn at() -> Position {
        Position::parse("/do/0/listen").unwrap()
    }

    fn filter(with: Value) -> EventFilter {
        EventFilter {
            with: serde_json::from_value::<IndexMap<String, Value>>(with).unwrap(),
            correlate: None,
        }
    }

    #[test]
    fn test_literal_attribute_match() {
        let f = filter(json!({"type": "order.placed"}));
        assert!(matches(&f, &json!({"type": "order.placed", "id": "1"}), &at()).unwrap());
        assert!(!matches(&f, &json!({"type": "order.cancelled"}), &at()).unwrap());
        assert!(!matches(&f, &json!({}), &at()).unwrap());
    }

    #[test]
    fn test_expression_attribute_match() {
        let f = filter(json!({"type": "${ .type | startswith(\"order.\") }"}));
        assert!(matches(&f, &json!({"type": "order.placed"}), &at()).unwrap());
        assert!(!matches(&f, &json!({"type": "invoice.sent"}), &at()).unwrap());
    }

    #[test]
    fn test_correlation() {
        let f: EventFilter = serde_json::from_value(json!({
            "with": {"type": "payment.received"},
            "correlate": {
                "order": {"from": ".data.orderId", "expect": "o-42"}
            }
        }))
        .unwrap();
        let good = json!({"type": "payment.received", "data": {"orderId": "o-42"}});
        let bad = json!({"type": "payment.received", "data": {"orderId": "o-7"}});
        assert!(matches(&f, &good, &at()).unwrap());
        assert!(!matches(&f, &bad, &at()).unwrap());
    }

    #[test]
    fn test_correlation_without_expect_requires_presence() {
        let f: EventFilter = serde_json::from_value(json!({
            "with": {},
            "correlate": {"key": {"from": ".data.key"}}
        }))
        .unwrap();
        assert!(matches(&f, &json!({"data": {"key": "k"}}), &at()).unwrap());
        assert!(!matches(&f, &json!({"data": {}}), &at()).unwrap());
    }
}
