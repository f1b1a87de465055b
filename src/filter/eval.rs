// Reference evaluator used by tests to compare a filter before and after rewriting.

use std::collections::HashMap;

use super::{AssertionValue, Filter, SubstringComponent, BITWISE_AND_RULE, BITWISE_OR_RULE};

/// Attribute name (lowercase) to values.
pub(crate) type Entry = HashMap<String, Vec<String>>;

pub(crate) fn entry(pairs: &[(&str, &str)]) -> Entry {
    let mut out: Entry = HashMap::new();
    for (name, value) in pairs {
        out.entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    out
}

pub(crate) fn matches(filter: &Filter, entry: &Entry) -> bool {
    match filter {
        Filter::And(children) => children.iter().all(|c| matches(c, entry)),
        Filter::Or(children) => children.iter().any(|c| matches(c, entry)),
        Filter::Not(inner) => !matches(inner, entry),
        Filter::EqualityMatch { attribute, value } | Filter::ApproxMatch { attribute, value } => {
            values(entry, attribute).iter().any(|v| same(v, value))
        }
        Filter::GreaterOrEqual { attribute, value } => values(entry, attribute)
            .iter()
            .any(|v| compare(v, value) != std::cmp::Ordering::Less),
        Filter::LessOrEqual { attribute, value } => values(entry, attribute)
            .iter()
            .any(|v| compare(v, value) != std::cmp::Ordering::Greater),
        Filter::Present { attribute } => !values(entry, attribute).is_empty(),
        Filter::Substring {
            attribute,
            components,
        } => values(entry, attribute)
            .iter()
            .any(|v| substring_matches(&v.as_bytes().to_ascii_lowercase(), components)),
        Filter::ExtensibleMatch {
            matching_rule,
            attribute,
            value,
            ..
        } => {
            let Some(attribute) = attribute else {
                return false;
            };
            values(entry, attribute).iter().any(|v| {
                let bits = || Some((v.parse::<u64>().ok()?, value.as_str()?.parse::<u64>().ok()?));
                match matching_rule.as_deref() {
                    Some(BITWISE_AND_RULE) => bits().is_some_and(|(actual, mask)| actual & mask == mask),
                    Some(BITWISE_OR_RULE) => bits().is_some_and(|(actual, mask)| actual & mask != 0),
                    _ => same(v, value),
                }
            })
        }
    }
}

fn values<'a>(entry: &'a Entry, attribute: &str) -> &'a [String] {
    entry
        .get(&attribute.to_ascii_lowercase())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn same(a: &str, b: &AssertionValue) -> bool {
    a.as_bytes().eq_ignore_ascii_case(b.as_bytes())
}

fn compare(a: &str, b: &AssertionValue) -> std::cmp::Ordering {
    match (a.parse::<i64>().ok(), b.as_str().and_then(|t| t.parse::<i64>().ok())) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.as_bytes().to_ascii_lowercase().cmp(&b.as_bytes().to_ascii_lowercase()),
    }
}

fn substring_matches(value: &[u8], components: &[SubstringComponent]) -> bool {
    let mut rest = value;
    for component in components {
        let needle = component.value().as_bytes().to_ascii_lowercase();
        match component {
            SubstringComponent::Initial(_) => match rest.strip_prefix(needle.as_slice()) {
                Some(r) => rest = r,
                None => return false,
            },
            SubstringComponent::Any(_) => match find(rest, &needle) {
                Some(i) => rest = &rest[i + needle.len()..],
                None => return false,
            },
            SubstringComponent::Final(_) => return rest.ends_with(&needle),
        }
    }
    true
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Small corpus of entries for equivalence checks.
pub(crate) fn corpus() -> Vec<Entry> {
    vec![
        entry(&[("cn", "John Doe"), ("sn", "Doe"), ("userAccountControl", "512"), ("mail", "john@example.com")]),
        entry(&[("cn", "Jane"), ("sn", "Roe"), ("userAccountControl", "514")]),
        entry(&[("cn", "admin"), ("userAccountControl", "66048"), ("adminCount", "1")]),
        entry(&[("cn", "John"), ("sn", "Smith"), ("userAccountControl", "2")]),
        entry(&[("sn", "Doe"), ("mail", "x@y")]),
        entry(&[]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::query_to_filter;

    fn count(text: &str) -> usize {
        let f = query_to_filter(text).unwrap();
        corpus().iter().filter(|e| matches(&f, e)).count()
    }

    #[test]
    fn test_evaluator_basics() {
        assert_eq!(count("(cn=john doe)"), 1);
        assert_eq!(count("(sn=Doe)"), 2);
        assert_eq!(count("(!(sn=Doe))"), 4);
        assert_eq!(count("(cn=J*)"), 3);
        assert_eq!(count("(cn=*o*n*)"), 2);
        assert_eq!(count("(userAccountControl>=514)"), 2);
        assert_eq!(count("(userAccountControl:1.2.840.113556.1.4.803:=2)"), 2);
        assert_eq!(count("(userAccountControl:1.2.840.113556.1.4.804:=3)"), 2);
        assert_eq!(count("(&)"), 6);
        assert_eq!(count("(|)"), 0);
    }
}
