// Rewrite steps over the search filter AST.

use rand::seq::SliceRandom;
use rand::Rng;

use super::helpers::{
    adjacent_values, map_leaves, obfuscate_attribute_oid, random_case, random_hex_escape, random_name, spaces,
    split_dn,
};
use super::{ObfuscationContext, ObfuscationOptions, Step};
use crate::filter::{AssertionValue, Filter, SubstringComponent, BITWISE_AND_RULE, BITWISE_OR_RULE};
use crate::tables::AttributeFormat;

pub const NAMES: &[&str] = &[
    "Spacing",
    "Timestamp",
    "Case",
    "HexValue",
    "OIDAttribute",
    "ANRAttribute",
    "DoubleNegation",
    "DeMorgan",
    "Reorder",
    "RedundantWrap",
    "EqualityByInclusion",
    "EqualityByExclusion",
    "ExactBitwiseBreakout",
    "BitwiseDecompose",
    "Garbage",
    "WildcardSplit",
    "ApproxMatch",
];

/// Attribute used by Active Directory for ambiguous name resolution.
pub const ANR_ATTRIBUTE: &str = "aNR";

pub(crate) fn build(name: &str, opts: &ObfuscationOptions) -> Option<Step<Filter>> {
    let o = opts.clone();
    let step = match name {
        "spacing" => Step::new("Spacing", move |f, ctx| spacing(f, ctx, o.spacing_min, o.spacing_max)),
        "timestamp" => Step::new("Timestamp", move |f, ctx| timestamp(f, ctx, o.timestamp_max_chars)),
        "case" => Step::new("Case", move |f, ctx| case(f, ctx, o.case_probability)),
        "hexvalue" => Step::new("HexValue", move |f, ctx| hex_value(f, ctx, o.hex_probability)),
        "oidattribute" => Step::new("OIDAttribute", move |f, ctx| {
            oid_attribute(f, ctx, o.oid_prefix_probability, o.oid_max_leading_zeros)
        }),
        "anrattribute" => Step::new("ANRAttribute", |f, ctx| anr_attribute(f, ctx)),
        "doublenegation" => Step::new("DoubleNegation", move |f, ctx| {
            double_negation(f, ctx, o.double_negation_probability, o.double_negation_max_depth)
        }),
        "demorgan" => Step::new("DeMorgan", move |f, ctx| de_morgan(f, ctx, o.demorgan_probability)),
        "reorder" => Step::new("Reorder", |f, ctx| reorder(f, ctx)),
        "redundantwrap" => Step::new("RedundantWrap", move |f, ctx| {
            redundant_wrap(f, ctx, o.wrap_probability, o.wrap_max_depth)
        }),
        "equalitybyinclusion" => Step::new("EqualityByInclusion", |f, ctx| equality_by_inclusion(f, ctx)),
        "equalitybyexclusion" => Step::new("EqualityByExclusion", |f, ctx| equality_by_exclusion(f, ctx)),
        "exactbitwisebreakout" => Step::new("ExactBitwiseBreakout", |f, ctx| exact_bitwise_breakout(f, ctx)),
        "bitwisedecompose" => Step::new("BitwiseDecompose", move |f, ctx| {
            bitwise_decompose(f, ctx, o.bitwise_max_bits)
        }),
        "garbage" => Step::new("Garbage", move |f, ctx| garbage(f, ctx, o.garbage_min, o.garbage_max)),
        "wildcardsplit" => Step::new("WildcardSplit", |f, ctx| wildcard_split(f, ctx)),
        "approxmatch" => Step::new("ApproxMatch", |f, ctx| approx_match(f, ctx)),
        _ => return None,
    };
    Some(step)
}

/// Whitespace after RDN separators in DN values and after the `=` of exact ANR values.
pub fn spacing(filter: Filter, ctx: &mut ObfuscationContext<'_>, min: usize, max: usize) -> Filter {
    map_leaves(filter, &mut |leaf| match leaf {
        Filter::EqualityMatch { attribute, value } if attribute.eq_ignore_ascii_case(ANR_ATTRIBUTE) => {
            let value = value.map_text(|text| match text.strip_prefix('=') {
                Some(rest) => format!("={}{}", spaces(min, max, ctx.rng), rest),
                None => text,
            });
            Filter::EqualityMatch { attribute, value }
        }
        leaf => map_value(leaf, &mut |attribute, value| {
            if ctx.tables.format(attribute) == AttributeFormat::Dn {
                let rdns = split_dn(&value);
                let mut out = String::new();
                for (i, rdn) in rdns.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                        out.push_str(&spaces(min, max, ctx.rng));
                    }
                    out.push_str(rdn);
                }
                out
            } else {
                value
            }
        }),
    })
}

fn is_anr(attribute: &str, ctx: &ObfuscationContext<'_>) -> bool {
    attribute.eq_ignore_ascii_case(ANR_ATTRIBUTE) || ctx.tables.is_anr(attribute)
}

/// Apply `f(attribute, value)` to the text assertion value of a simple leaf.
/// Binary values are passed through.
fn map_value<F>(leaf: Filter, f: &mut F) -> Filter
where
    F: FnMut(&str, String) -> String,
{
    match leaf {
        Filter::EqualityMatch { attribute, value } => {
            let value = value.map_text(|v| f(&attribute, v));
            Filter::EqualityMatch { attribute, value }
        }
        Filter::GreaterOrEqual { attribute, value } => {
            let value = value.map_text(|v| f(&attribute, v));
            Filter::GreaterOrEqual { attribute, value }
        }
        Filter::LessOrEqual { attribute, value } => {
            let value = value.map_text(|v| f(&attribute, v));
            Filter::LessOrEqual { attribute, value }
        }
        Filter::ApproxMatch { attribute, value } => {
            let value = value.map_text(|v| f(&attribute, v));
            Filter::ApproxMatch { attribute, value }
        }
        other => other,
    }
}

/// Like [`map_value`], also covering substring components.
fn map_value_and_substrings<F>(leaf: Filter, f: &mut F) -> Filter
where
    F: FnMut(&str, String) -> String,
{
    match leaf {
        Filter::Substring {
            attribute,
            components,
        } => {
            let components = components
                .into_iter()
                .map(|c| {
                    let value = c.value().clone().map_text(|v| f(&attribute, v));
                    c.with_value(value)
                })
                .collect();
            Filter::Substring {
                attribute,
                components,
            }
        }
        other => map_value(other, f),
    }
}

/// `YYYYMMDDHHMMSS[.fff]Z`
fn is_generalized_time(value: &str) -> bool {
    let Some(body) = value.strip_suffix('Z').or_else(|| value.strip_suffix('z')) else {
        return false;
    };
    let (whole, fraction) = match body.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (body, None),
    };
    whole.len() == 14
        && whole.bytes().all(|b| b.is_ascii_digit())
        && fraction.map_or(true, |f| f.bytes().all(|b| b.is_ascii_digit()))
}

/// Vary the text around the fractional boundary of generalized-time values:
/// zero seconds and minutes may be dropped, the decimal sign may become `,`,
/// and the fraction is padded with random digits.
pub fn timestamp(filter: Filter, ctx: &mut ObfuscationContext<'_>, max_chars: usize) -> Filter {
    if max_chars == 0 {
        return filter;
    }
    map_leaves(filter, &mut |leaf| {
        map_value(leaf, &mut |_, value| {
            if !is_generalized_time(&value) {
                return value;
            }
            let (body, zone) = value.split_at(value.len() - 1);
            let (whole, fraction) = body.split_once('.').unwrap_or((body, ""));

            let mut whole = whole;
            let mut fraction = fraction.to_string();
            if fraction.bytes().all(|b| b == b'0') {
                // HHMMSS -> HHMM -> HH while the dropped fields are zero
                while whole.len() > 10 && whole.ends_with("00") && ctx.rng.gen_bool(0.5) {
                    whole = &whole[..whole.len() - 2];
                }
                // keep the random padding below one second in the coarser unit
                let zeros = (14 - whole.len()) * 2;
                while fraction.len() < zeros {
                    fraction.push('0');
                }
            }
            let sign = if ctx.rng.gen_bool(0.5) { ',' } else { '.' };
            let extra: String = (0..ctx.rng.gen_range(1..=max_chars))
                .map(|_| char::from(b'0' + ctx.rng.gen_range(0..10u8)))
                .collect();
            format!("{}{}{}{}{}", whole, sign, fraction, extra, zone)
        })
    })
}

/// Random case on attribute names, and on values whose matching ignores case.
pub fn case(filter: Filter, ctx: &mut ObfuscationContext<'_>, p: f64) -> Filter {
    map_leaves(filter, &mut |leaf| {
        let leaf = map_value_and_substrings(leaf, &mut |attribute, value| {
            if ctx.tables.format(attribute).is_case_insensitive() {
                random_case(&value, p, ctx.rng)
            } else {
                value
            }
        });
        rename_attribute(leaf, &mut |attribute| random_case(&attribute, p, ctx.rng))
    })
}

/// Apply `f` to the attribute description of a leaf.
fn rename_attribute<F>(leaf: Filter, f: &mut F) -> Filter
where
    F: FnMut(String) -> String,
{
    match leaf {
        Filter::EqualityMatch { attribute, value } => Filter::EqualityMatch {
            attribute: f(attribute),
            value,
        },
        Filter::GreaterOrEqual { attribute, value } => Filter::GreaterOrEqual {
            attribute: f(attribute),
            value,
        },
        Filter::LessOrEqual { attribute, value } => Filter::LessOrEqual {
            attribute: f(attribute),
            value,
        },
        Filter::ApproxMatch { attribute, value } => Filter::ApproxMatch {
            attribute: f(attribute),
            value,
        },
        Filter::Present { attribute } => Filter::Present {
            attribute: f(attribute),
        },
        Filter::Substring {
            attribute,
            components,
        } => Filter::Substring {
            attribute: f(attribute),
            components,
        },
        Filter::ExtensibleMatch {
            matching_rule,
            attribute,
            value,
            dn_attributes,
        } => Filter::ExtensibleMatch {
            matching_rule,
            attribute: attribute.map(|a| f(a)),
            value,
            dn_attributes,
        },
        other => other,
    }
}

/// `\xx` escapes inside string and DN assertion values.
/// Relies on the directory unescaping assertion values, as Active Directory does.
pub fn hex_value(filter: Filter, ctx: &mut ObfuscationContext<'_>, p: f64) -> Filter {
    map_leaves(filter, &mut |leaf| {
        map_value_and_substrings(leaf, &mut |attribute, value| {
            if ctx.tables.format(attribute).is_case_insensitive() {
                random_hex_escape(&value, p, ctx.rng)
            } else {
                value
            }
        })
    })
}

pub fn oid_attribute(filter: Filter, ctx: &mut ObfuscationContext<'_>, prefix_probability: f64, max_zeros: usize) -> Filter {
    map_leaves(filter, &mut |leaf| {
        rename_attribute(leaf, &mut |attribute| {
            obfuscate_attribute_oid(&attribute, ctx.tables, prefix_probability, max_zeros, ctx.rng)
        })
    })
}

/// `attr=V` (and `~=`, `>=`, `<=`) on ANR attributes becomes `aNR==V`.
pub fn anr_attribute(filter: Filter, ctx: &mut ObfuscationContext<'_>) -> Filter {
    map_leaves(filter, &mut |leaf| match leaf {
        Filter::EqualityMatch { ref attribute, ref value }
        | Filter::ApproxMatch { ref attribute, ref value }
        | Filter::GreaterOrEqual { ref attribute, ref value }
        | Filter::LessOrEqual { ref attribute, ref value }
            if ctx.tables.is_anr(attribute) =>
        {
            let mut anr = b"=".to_vec();
            anr.extend_from_slice(value.as_bytes());
            Filter::equality(ANR_ATTRIBUTE, anr)
        }
        other => other,
    })
}

pub fn double_negation(filter: Filter, ctx: &mut ObfuscationContext<'_>, p: f64, max_depth: usize) -> Filter {
    map_leaves(filter, &mut |leaf| {
        if !ctx.rng.gen_bool(p) {
            return leaf;
        }
        let depth = ctx.rng.gen_range(1..=max_depth.max(1));
        (0..depth).fold(leaf, |acc, _| Filter::not(Filter::not(acc)))
    })
}

/// `&(a..)` -> `!(|(!a)..)` and `|(a..)` -> `!(&(!a)..)`, each with probability `p`.
pub fn de_morgan(filter: Filter, ctx: &mut ObfuscationContext<'_>, p: f64) -> Filter {
    match filter {
        Filter::And(children) => {
            let children: Vec<Filter> = children.into_iter().map(|c| de_morgan(c, ctx, p)).collect();
            if ctx.rng.gen_bool(p) {
                Filter::not(Filter::Or(children.into_iter().map(Filter::not).collect()))
            } else {
                Filter::And(children)
            }
        }
        Filter::Or(children) => {
            let children: Vec<Filter> = children.into_iter().map(|c| de_morgan(c, ctx, p)).collect();
            if ctx.rng.gen_bool(p) {
                Filter::not(Filter::And(children.into_iter().map(Filter::not).collect()))
            } else {
                Filter::Or(children)
            }
        }
        Filter::Not(inner) => Filter::not(de_morgan(*inner, ctx, p)),
        leaf => leaf,
    }
}

/// Shuffle the direct children of every `And`/`Or`.
pub fn reorder(filter: Filter, ctx: &mut ObfuscationContext<'_>) -> Filter {
    match filter {
        Filter::And(mut children) => {
            children.shuffle(ctx.rng);
            Filter::And(children.into_iter().map(|c| reorder(c, ctx)).collect())
        }
        Filter::Or(mut children) => {
            children.shuffle(ctx.rng);
            Filter::Or(children.into_iter().map(|c| reorder(c, ctx)).collect())
        }
        Filter::Not(inner) => Filter::not(reorder(*inner, ctx)),
        leaf => leaf,
    }
}

/// Wrap the whole filter in single-child `And`/`Or` nodes.
pub fn redundant_wrap(filter: Filter, ctx: &mut ObfuscationContext<'_>, p: f64, max_depth: usize) -> Filter {
    let depth = ctx.rng.gen_range(1..=max_depth.max(1));
    (0..depth).fold(filter, |acc, _| {
        if !ctx.rng.gen_bool(p) {
            acc
        } else if ctx.rng.gen_bool(0.5) {
            Filter::And(vec![acc])
        } else {
            Filter::Or(vec![acc])
        }
    })
}

/// `attr=V` -> `(&(attr>=pred)(attr<=succ)(!(attr=pred))(!(attr=succ)))`.
pub fn equality_by_inclusion(filter: Filter, ctx: &mut ObfuscationContext<'_>) -> Filter {
    map_leaves(filter, &mut |leaf| match leaf {
        Filter::EqualityMatch { attribute, value } => {
            let format = ctx.tables.format(&attribute);
            match value.as_str().and_then(|text| adjacent_values(text, format)) {
                Some((pred, succ)) => Filter::And(vec![
                    Filter::greater_or_equal(attribute.clone(), pred.clone()),
                    Filter::less_or_equal(attribute.clone(), succ.clone()),
                    Filter::not(Filter::equality(attribute.clone(), pred)),
                    Filter::not(Filter::equality(attribute, succ)),
                ]),
                None => Filter::EqualityMatch { attribute, value },
            }
        }
        other => other,
    })
}

/// `attr=V` -> `(&(attr=*)(!(attr<=pred))(!(attr>=succ)))`.
pub fn equality_by_exclusion(filter: Filter, ctx: &mut ObfuscationContext<'_>) -> Filter {
    map_leaves(filter, &mut |leaf| match leaf {
        Filter::EqualityMatch { attribute, value } => {
            let format = ctx.tables.format(&attribute);
            match value.as_str().and_then(|text| adjacent_values(text, format)) {
                Some((pred, succ)) => Filter::And(vec![
                    Filter::present(attribute.clone()),
                    Filter::not(Filter::less_or_equal(attribute.clone(), pred)),
                    Filter::not(Filter::greater_or_equal(attribute, succ)),
                ]),
                None => Filter::EqualityMatch { attribute, value },
            }
        }
        other => other,
    })
}

/// Numeric `attr=V` -> all bits of V set and none of `!V` set.
/// Values are treated as unsigned 32-bit; anything else is left alone.
pub fn exact_bitwise_breakout(filter: Filter, ctx: &mut ObfuscationContext<'_>) -> Filter {
    map_leaves(filter, &mut |leaf| match leaf {
        Filter::EqualityMatch { attribute, value } if ctx.tables.format(&attribute).is_numeric() => {
            match parse_u32(&value) {
                Some(v) => Filter::And(vec![
                    Filter::extensible(attribute.clone(), BITWISE_AND_RULE, v.to_string()),
                    Filter::not(Filter::extensible(attribute, BITWISE_OR_RULE, (!v).to_string())),
                ]),
                None => Filter::EqualityMatch { attribute, value },
            }
        }
        other => other,
    })
}

/// Split a bitwise AND/OR match into single-bit matches plus one remainder match.
pub fn bitwise_decompose(filter: Filter, ctx: &mut ObfuscationContext<'_>, max_bits: usize) -> Filter {
    map_leaves(filter, &mut |leaf| match leaf {
        Filter::ExtensibleMatch {
            matching_rule: Some(rule),
            attribute,
            value,
            dn_attributes,
        } if rule == BITWISE_AND_RULE || rule == BITWISE_OR_RULE => {
            let bits: Vec<u32> = match parse_u32(&value) {
                Some(v) => (0..32).map(|i| 1u32 << i).filter(|bit| v & bit != 0).collect(),
                None => Vec::new(),
            };
            if bits.len() < 2 || max_bits < 2 {
                return Filter::ExtensibleMatch {
                    matching_rule: Some(rule),
                    attribute,
                    value,
                    dn_attributes,
                };
            }
            let mut bits = bits;
            bits.shuffle(ctx.rng);
            let singles = ctx.rng.gen_range(1..=(max_bits - 1).min(bits.len() - 1));
            let remainder: u32 = bits[singles..].iter().fold(0, |acc, bit| acc | bit);
            let leaf_for = |mask: u32| Filter::ExtensibleMatch {
                matching_rule: Some(rule.clone()),
                attribute: attribute.clone(),
                value: mask.to_string().into(),
                dn_attributes,
            };
            let mut children: Vec<Filter> = bits[..singles].iter().map(|&bit| leaf_for(bit)).collect();
            children.push(leaf_for(remainder));
            if rule == BITWISE_AND_RULE {
                Filter::And(children)
            } else {
                Filter::Or(children)
            }
        }
        other => other,
    })
}

fn parse_u32(value: &AssertionValue) -> Option<u32> {
    value.as_str()?.trim().parse().ok()
}

/// `(|original garbage..)` where every garbage leaf should match nothing.
pub fn garbage(filter: Filter, ctx: &mut ObfuscationContext<'_>, min: usize, max: usize) -> Filter {
    let count = ctx.rng.gen_range(min..=max.max(min));
    if count == 0 {
        return filter;
    }
    let mut children = vec![filter];
    for _ in 0..count {
        let leaf = match ctx.rng.gen_range(0..3) {
            0 => Filter::present(random_name(8, 14, ctx.rng)),
            1 => Filter::equality(random_name(8, 14, ctx.rng), random_name(6, 16, ctx.rng)),
            _ => {
                let existing = ctx.tables.known_attributes();
                let attribute = existing
                    .choose(ctx.rng)
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| random_name(8, 14, ctx.rng));
                Filter::equality(attribute, random_name(24, 32, ctx.rng))
            }
        };
        children.push(leaf);
    }
    Filter::Or(children)
}

/// Split at a random character boundary strictly inside `value`.
fn split_value(value: &str, ctx: &mut ObfuscationContext<'_>) -> Option<(String, String)> {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < 2 {
        return None;
    }
    let at = ctx.rng.gen_range(1..chars.len());
    Some((chars[..at].iter().collect(), chars[at..].iter().collect()))
}

/// Turn string equality into a substring match split at a random offset, or
/// split one component of an existing substring match in two. Broadens the
/// match to values with extra characters at the split point.
pub fn wildcard_split(filter: Filter, ctx: &mut ObfuscationContext<'_>) -> Filter {
    map_leaves(filter, &mut |leaf| match leaf {
        Filter::EqualityMatch { attribute, value }
            if ctx.tables.format(&attribute).is_case_insensitive() && !is_anr(&attribute, ctx) =>
        {
            match value.as_str().and_then(|text| split_value(text, ctx)) {
                Some((head, tail)) => Filter::Substring {
                    attribute,
                    components: vec![
                        SubstringComponent::Initial(head.into()),
                        SubstringComponent::Final(tail.into()),
                    ],
                },
                None => Filter::EqualityMatch { attribute, value },
            }
        }
        Filter::Substring {
            attribute,
            mut components,
        } if ctx.tables.format(&attribute).is_case_insensitive() => {
            let candidates: Vec<usize> = (0..components.len())
                .filter(|&i| components[i].value().as_str().is_some_and(|t| t.chars().count() >= 2))
                .collect();
            if let Some(&i) = candidates.choose(ctx.rng) {
                let split = components[i].value().as_str().and_then(|text| split_value(text, ctx));
                if let Some((head, tail)) = split {
                    let (head, tail) = (AssertionValue::from(head), AssertionValue::from(tail));
                    let (first, second) = match &components[i] {
                        SubstringComponent::Initial(_) => {
                            (SubstringComponent::Initial(head), SubstringComponent::Any(tail))
                        }
                        SubstringComponent::Any(_) => (SubstringComponent::Any(head), SubstringComponent::Any(tail)),
                        SubstringComponent::Final(_) => {
                            (SubstringComponent::Any(head), SubstringComponent::Final(tail))
                        }
                    };
                    components[i] = first;
                    components.insert(i + 1, second);
                }
            }
            Filter::Substring {
                attribute,
                components,
            }
        }
        other => other,
    })
}

/// String equality `attr=V` becomes `attr~=V`.
pub fn approx_match(filter: Filter, ctx: &mut ObfuscationContext<'_>) -> Filter {
    map_leaves(filter, &mut |leaf| match leaf {
        Filter::EqualityMatch { attribute, value } if ctx.tables.format(&attribute).is_case_insensitive() => {
            Filter::ApproxMatch { attribute, value }
        }
        other => other,
    })
}
