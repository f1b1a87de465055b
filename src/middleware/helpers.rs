// Building blocks shared by the rewrite steps.

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};

use crate::filter::Filter;
use crate::tables::{AttributeFormat, AttributeTables};

/// Rebuild `And`/`Or`/`Not` from processed children and hand every other node to `f`.
pub fn map_leaves<F>(filter: Filter, f: &mut F) -> Filter
where
    F: FnMut(Filter) -> Filter,
{
    match filter {
        Filter::And(children) => Filter::And(children.into_iter().map(|c| map_leaves(c, f)).collect()),
        Filter::Or(children) => Filter::Or(children.into_iter().map(|c| map_leaves(c, f)).collect()),
        Filter::Not(inner) => Filter::not(map_leaves(*inner, f)),
        leaf => f(leaf),
    }
}

pub fn random_case(s: &str, p: f64, rng: &mut dyn RngCore) -> String {
    s.chars()
        .map(|c| {
            if rng.gen_bool(p) {
                if c.is_lowercase() {
                    c.to_uppercase().next().unwrap_or(c)
                } else {
                    c.to_lowercase().next().unwrap_or(c)
                }
            } else {
                c
            }
        })
        .collect()
}

/// Replace characters with `\xx` escapes of their UTF-8 bytes, each with probability `p`.
pub fn random_hex_escape(s: &str, p: f64, rng: &mut dyn RngCore) -> String {
    let mut out = String::with_capacity(s.len() * 2);
    for c in s.chars() {
        if rng.gen_bool(p) {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("\\{:02x}", b));
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub fn spaces(min: usize, max: usize, rng: &mut dyn RngCore) -> String {
    " ".repeat(rng.gen_range(min..=max.max(min)))
}

const GARBAGE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub fn random_name(min_len: usize, max_len: usize, rng: &mut dyn RngCore) -> String {
    let len = rng.gen_range(min_len.max(1)..=max_len.max(min_len.max(1)));
    let mut out = String::with_capacity(len);
    out.push(char::from(GARBAGE_ALPHABET[rng.gen_range(0..26)]));
    for _ in 1..len {
        out.push(char::from(*GARBAGE_ALPHABET.choose(rng).unwrap_or(&b'x')));
    }
    out
}

pub fn is_numeric_oid(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Insert up to `max_zeros` leading zeros in front of every OID arc.
pub fn oid_leading_zeros(oid: &str, max_zeros: usize, rng: &mut dyn RngCore) -> String {
    oid.split('.')
        .map(|arc| format!("{}{}", "0".repeat(rng.gen_range(0..=max_zeros)), arc))
        .collect::<Vec<_>>()
        .join(".")
}

/// Split an attribute description into its type and `;options` suffix.
pub fn split_options(attr: &str) -> (&str, &str) {
    match attr.find(';') {
        Some(i) => (&attr[..i], &attr[i..]),
        None => (attr, ""),
    }
}

/// Registered OID for an attribute description, keeping its options.
pub fn attribute_oid(attr: &str, tables: &AttributeTables) -> Option<String> {
    let (base, options) = split_options(attr);
    tables.oid(base).map(|oid| format!("{}{}", oid, options))
}

/// Attribute name to OID, optionally with an `oID.` prefix and leading zeros.
/// Names without a registered OID are returned unchanged.
pub fn obfuscate_attribute_oid(
    attr: &str,
    tables: &AttributeTables,
    prefix_probability: f64,
    max_zeros: usize,
    rng: &mut dyn RngCore,
) -> String {
    let Some(with_options) = attribute_oid(attr, tables) else {
        return attr.to_string();
    };
    let (oid, options) = split_options(&with_options);
    let mut out = String::new();
    if rng.gen_bool(prefix_probability) {
        out.push_str("oID.");
    }
    out.push_str(&oid_leading_zeros(oid, max_zeros, rng));
    out.push_str(options);
    out
}

/// Printable ASCII, the alphabet of the string odometer.
const ODOMETER_MIN: char = ' ';
const ODOMETER_MAX: char = '~';

fn in_odometer(c: char) -> bool {
    (ODOMETER_MIN..=ODOMETER_MAX).contains(&c)
}

/// Next string in odometer order over printable ASCII: increment the last
/// non-maximal character and reset everything after it. All-maximal strings
/// grow by one minimal character.
pub fn string_successor(s: &str) -> Option<String> {
    let mut chars: Vec<char> = s.chars().collect();
    if !chars.iter().all(|&c| in_odometer(c)) {
        return None;
    }
    match chars.iter().rposition(|&c| c != ODOMETER_MAX) {
        Some(i) => {
            chars[i] = char::from(chars[i] as u8 + 1);
            chars[i + 1..].iter_mut().for_each(|c| *c = ODOMETER_MIN);
        }
        None => chars.push(ODOMETER_MIN),
    }
    Some(chars.into_iter().collect())
}

/// Mirror of [`string_successor`]. `None` when every character is already minimal.
pub fn string_predecessor(s: &str) -> Option<String> {
    let mut chars: Vec<char> = s.chars().collect();
    if !chars.iter().all(|&c| in_odometer(c)) {
        return None;
    }
    let i = chars.iter().rposition(|&c| c != ODOMETER_MIN)?;
    chars[i] = char::from(chars[i] as u8 - 1);
    chars[i + 1..].iter_mut().for_each(|c| *c = ODOMETER_MAX);
    Some(chars.into_iter().collect())
}

/// Adjust the last sub-authority of a textual SID (`S-1-5-21-...-RID`).
fn sid_adjacent(s: &str, up: bool) -> Option<String> {
    if !s.to_ascii_uppercase().starts_with("S-") {
        return None;
    }
    let (head, last) = s.rsplit_once('-')?;
    let rid: u32 = last.parse().ok()?;
    let next = if up { rid.checked_add(1)? } else { rid.checked_sub(1)? };
    Some(format!("{}-{}", head, next))
}

fn integer_adjacent(s: &str, up: bool) -> Option<String> {
    let value: i64 = s.trim().parse().ok()?;
    let next = if up { value.checked_add(1)? } else { value.checked_sub(1)? };
    Some(next.to_string())
}

/// Type-aware predecessor and successor of a value. `None` when either side is undefined.
pub fn adjacent_values(value: &str, format: AttributeFormat) -> Option<(String, String)> {
    match format {
        AttributeFormat::Integer | AttributeFormat::Bitmask => {
            Some((integer_adjacent(value, false)?, integer_adjacent(value, true)?))
        }
        AttributeFormat::Sid => Some((sid_adjacent(value, false)?, sid_adjacent(value, true)?)),
        AttributeFormat::String | AttributeFormat::Dn => {
            Some((string_predecessor(value)?, string_successor(value)?))
        }
        AttributeFormat::Timestamp | AttributeFormat::Binary => None,
    }
}

/// Split a DN into RDN strings on unescaped, unquoted commas.
pub fn split_dn(dn: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    let mut quoted = false;
    for c in dn.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                quoted = !quoted;
            }
            ',' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !parts.is_empty() {
        parts.push(current);
    }
    parts
}

pub fn split_rdn(rdn: &str) -> Option<(&str, &str)> {
    rdn.split_once('=')
}
