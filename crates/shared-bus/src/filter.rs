//! # Subscription Rules
//!
//! Server-side filters deciding which topic messages reach a subscription.
//! A filter is a small boolean expression over message properties; its
//! `Display` form is the SQL-like text a broker would store.

use crate::message::{BusMessage, PropertyValue};
use std::fmt;

/// Name of the catch-all rule every new subscription starts with.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Boolean expression evaluated against a message's properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleFilter {
    /// Matches every message.
    True,
    /// `name = value`. False when the property is absent.
    Equals {
        /// Property name.
        name: String,
        /// Expected value.
        value: PropertyValue,
    },
    /// `name <> value`. False when the property is absent (SQL null semantics).
    NotEquals {
        /// Property name.
        name: String,
        /// Rejected value.
        value: PropertyValue,
    },
    /// `name IS NULL`.
    Missing(String),
    /// Both sides must match.
    And(Box<RuleFilter>, Box<RuleFilter>),
    /// Either side must match.
    Or(Box<RuleFilter>, Box<RuleFilter>),
}

impl RuleFilter {
    /// `name = value`
    pub fn equals(name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        RuleFilter::Equals {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `name <> value`
    pub fn not_equals(name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        RuleFilter::NotEquals {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `name IS NULL`
    pub fn missing(name: impl Into<String>) -> Self {
        RuleFilter::Missing(name.into())
    }

    /// `self AND other`
    #[must_use]
    pub fn and(self, other: RuleFilter) -> Self {
        RuleFilter::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`
    #[must_use]
    pub fn or(self, other: RuleFilter) -> Self {
        RuleFilter::Or(Box::new(self), Box::new(other))
    }

    /// Check if a message passes this filter.
    #[must_use]
    pub fn matches(&self, message: &BusMessage) -> bool {
        match self {
            RuleFilter::True => true,
            RuleFilter::Equals { name, value } => message.properties.get(name) == Some(value),
            RuleFilter::NotEquals { name, value } => message
                .properties
                .get(name)
                .is_some_and(|actual| actual != value),
            RuleFilter::Missing(name) => !message.properties.contains_key(name),
            RuleFilter::And(lhs, rhs) => lhs.matches(message) && rhs.matches(message),
            RuleFilter::Or(lhs, rhs) => lhs.matches(message) || rhs.matches(message),
        }
    }
}

impl fmt::Display for RuleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleFilter::True => write!(f, "1=1"),
            RuleFilter::Equals { name, value } => write!(f, "{name} = {value}"),
            RuleFilter::NotEquals { name, value } => write!(f, "{name} <> {value}"),
            RuleFilter::Missing(name) => write!(f, "{name} IS NULL"),
            RuleFilter::And(lhs, rhs) => write!(f, "({lhs}) AND ({rhs})"),
            RuleFilter::Or(lhs, rhs) => write!(f, "({lhs}) OR ({rhs})"),
        }
    }
}

/// A named rule attached to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDescription {
    /// Rule name, unique within the subscription.
    pub name: String,
    /// Filter expression.
    pub filter: RuleFilter,
}

impl RuleDescription {
    /// Create a rule description.
    pub fn new(name: impl Into<String>, filter: RuleFilter) -> Self {
        Self {
            name: name.into(),
            filter,
        }
    }
}
