//! LDAP search filter AST and its codecs (RFC 4515 text, RFC 4511 BER).

mod packet;
mod text;

#[cfg(test)]
pub(crate) mod eval;

pub use packet::{filter_to_packet, packet_to_filter, read_filter, write_filter};
pub use text::{filter_to_query, query_to_filter};

use std::fmt;

/// Matching rule OID for bitwise AND (all bits of the assertion set).
pub const BITWISE_AND_RULE: &str = "1.2.840.113556.1.4.803";
/// Matching rule OID for bitwise OR (any bit of the assertion set).
pub const BITWISE_OR_RULE: &str = "1.2.840.113556.1.4.804";

/// Assertion value as carried on the wire. Usually UTF-8 text; raw bytes for
/// binary attributes such as objectGUID and objectSid.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct AssertionValue(Vec<u8>);

impl AssertionValue {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The value as text, `None` if it is not UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rewrite a text value with `f`. Binary values come back unchanged.
    pub fn map_text<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String,
    {
        match String::from_utf8(self.0) {
            Ok(text) => Self(f(text).into_bytes()),
            Err(e) => Self(e.into_bytes()),
        }
    }
}

impl fmt::Debug for AssertionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(text) => write!(f, "{:?}", text),
            None => write!(f, "b\"{}\"", self.0.escape_ascii()),
        }
    }
}

impl From<&str> for AssertionValue {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for AssertionValue {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for AssertionValue {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for AssertionValue {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl PartialEq<str> for AssertionValue {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<&str> for AssertionValue {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

/// Parsed search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch {
        attribute: String,
        value: AssertionValue,
    },
    Substring {
        attribute: String,
        components: Vec<SubstringComponent>,
    },
    GreaterOrEqual {
        attribute: String,
        value: AssertionValue,
    },
    LessOrEqual {
        attribute: String,
        value: AssertionValue,
    },
    Present {
        attribute: String,
    },
    ApproxMatch {
        attribute: String,
        value: AssertionValue,
    },
    ExtensibleMatch {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: AssertionValue,
        dn_attributes: bool,
    },
}

/// Substring component. Order is significant: `Initial` first, `Final` last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstringComponent {
    Initial(AssertionValue),
    Any(AssertionValue),
    Final(AssertionValue),
}

impl SubstringComponent {
    pub fn value(&self) -> &AssertionValue {
        match self {
            SubstringComponent::Initial(v) | SubstringComponent::Any(v) | SubstringComponent::Final(v) => v,
        }
    }

    /// Same position, new value.
    pub fn with_value(&self, value: AssertionValue) -> Self {
        match self {
            SubstringComponent::Initial(_) => SubstringComponent::Initial(value),
            SubstringComponent::Any(_) => SubstringComponent::Any(value),
            SubstringComponent::Final(_) => SubstringComponent::Final(value),
        }
    }
}

impl Filter {
    pub fn equality(attribute: impl Into<String>, value: impl Into<AssertionValue>) -> Self {
        Filter::EqualityMatch {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn greater_or_equal(attribute: impl Into<String>, value: impl Into<AssertionValue>) -> Self {
        Filter::GreaterOrEqual {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn less_or_equal(attribute: impl Into<String>, value: impl Into<AssertionValue>) -> Self {
        Filter::LessOrEqual {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present {
            attribute: attribute.into(),
        }
    }

    pub fn not(inner: Filter) -> Self {
        Filter::Not(Box::new(inner))
    }

    /// Extensible match on an attribute with a matching rule, no dnAttributes.
    pub fn extensible(attribute: impl Into<String>, rule: impl Into<String>, value: impl Into<AssertionValue>) -> Self {
        Filter::ExtensibleMatch {
            matching_rule: Some(rule.into()),
            attribute: Some(attribute.into()),
            value: value.into(),
            dn_attributes: false,
        }
    }

    /// Attribute description of a leaf, if it has one.
    pub fn attribute(&self) -> Option<&str> {
        match self {
            Filter::EqualityMatch { attribute, .. }
            | Filter::Substring { attribute, .. }
            | Filter::GreaterOrEqual { attribute, .. }
            | Filter::LessOrEqual { attribute, .. }
            | Filter::Present { attribute }
            | Filter::ApproxMatch { attribute, .. } => Some(attribute),
            Filter::ExtensibleMatch { attribute, .. } => attribute.as_deref(),
            Filter::And(_) | Filter::Or(_) | Filter::Not(_) => None,
        }
    }

    /// True when the tree survives a trip through the text form unchanged.
    pub fn is_well_formed(&self) -> bool {
        match self {
            Filter::And(children) | Filter::Or(children) => children.iter().all(Filter::is_well_formed),
            Filter::Not(inner) => inner.is_well_formed(),
            Filter::Substring { components, .. } => substrings_well_formed(components),
            Filter::ExtensibleMatch {
                matching_rule,
                attribute,
                dn_attributes,
                ..
            } => extensible_well_formed(matching_rule.as_deref(), attribute.as_deref(), *dn_attributes),
            _ => true,
        }
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                1 + children.iter().map(Filter::node_count).sum::<usize>()
            }
            Filter::Not(inner) => 1 + inner.node_count(),
            _ => 1,
        }
    }
}

/// Non-empty, ordered, and no empty values (`(cn=*)` would read back as a presence test).
pub(crate) fn substrings_well_formed(components: &[SubstringComponent]) -> bool {
    if components.is_empty() || components.iter().any(|c| c.value().is_empty()) {
        return false;
    }
    let last = components.len() - 1;
    components.iter().enumerate().all(|(i, c)| match c {
        SubstringComponent::Initial(_) => i == 0,
        SubstringComponent::Final(_) => i == last,
        SubstringComponent::Any(_) => true,
    })
}

/// A rule literally named `dn` without dnAttributes prints as `:dn:` and reads back as the flag.
pub(crate) fn extensible_well_formed(matching_rule: Option<&str>, attribute: Option<&str>, dn_attributes: bool) -> bool {
    match matching_rule {
        None => attribute.is_some(),
        Some(rule) => !rule.is_empty() && (dn_attributes || !rule.eq_ignore_ascii_case("dn")),
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&filter_to_query(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_order_validation() {
        use SubstringComponent::*;
        assert!(substrings_well_formed(&[Initial("a".into()), Any("b".into()), Final("c".into())]));
        assert!(substrings_well_formed(&[Any("b".into())]));
        assert!(!substrings_well_formed(&[Any("b".into()), Initial("a".into())]));
        assert!(!substrings_well_formed(&[Final("c".into()), Any("b".into())]));
        assert!(!substrings_well_formed(&[]));
        assert!(!substrings_well_formed(&[Initial("".into())]));
        assert!(!substrings_well_formed(&[Initial("a".into()), Any("".into())]));
    }

    #[test]
    fn test_extensible_rule_named_dn_is_not_well_formed() {
        let ambiguous = Filter::extensible("cn", "dn", "x");
        assert!(!ambiguous.is_well_formed());
        let flagged = Filter::ExtensibleMatch {
            matching_rule: Some("dn".into()),
            attribute: Some("cn".into()),
            value: "x".into(),
            dn_attributes: true,
        };
        assert!(flagged.is_well_formed());
        let bare = Filter::ExtensibleMatch {
            matching_rule: None,
            attribute: None,
            value: "x".into(),
            dn_attributes: false,
        };
        assert!(!bare.is_well_formed());
    }

    #[test]
    fn test_assertion_value_text_and_binary() {
        let text = AssertionValue::from("John");
        assert_eq!(text.as_str(), Some("John"));
        assert_eq!(text.clone().map_text(|s| s.to_uppercase()), "JOHN");

        let guid = AssertionValue::from(vec![0x9fu8, 0xaa, 0x01, 0xff]);
        assert_eq!(guid.as_str(), None);
        assert_eq!(guid.clone().map_text(|s| s.to_uppercase()), guid);
        assert_eq!(format!("{:?}", guid), "b\"\\x9f\\xaa\\x01\\xff\"");
    }

    #[test]
    fn test_attribute_accessor() {
        assert_eq!(Filter::equality("cn", "x").attribute(), Some("cn"));
        assert_eq!(Filter::And(vec![]).attribute(), None);
        let ext = Filter::ExtensibleMatch {
            matching_rule: Some("2.5.13.2".into()),
            attribute: None,
            value: "x".into(),
            dn_attributes: true,
        };
        assert_eq!(ext.attribute(), None);
    }

    #[test]
    fn test_node_count() {
        let f = Filter::And(vec![Filter::present("cn"), Filter::not(Filter::equality("sn", "x"))]);
        assert_eq!(f.node_count(), 4);
    }

    #[test]
    fn test_display_uses_text_codec() {
        let f = Filter::And(vec![Filter::equality("cn", "John"), Filter::equality("sn", "Doe")]);
        assert_eq!(f.to_string(), "(&(cn=John)(sn=Doe))");
    }
}
