// Rewrite steps over the requested attribute list of a search.

use rand::seq::SliceRandom;
use rand::Rng;

use super::helpers::{obfuscate_attribute_oid, random_case, random_name};
use super::{ObfuscationContext, ObfuscationOptions, Step};

pub const NAMES: &[&str] = &[
    "Case",
    "OIDAttribute",
    "Duplicate",
    "GarbageNonExisting",
    "GarbageExisting",
    "ReplaceWithWildcard",
    "ReplaceWithEmpty",
    "Reorder",
];

pub const ALL_USER_ATTRIBUTES: &str = "*";
pub const ALL_OPERATIONAL_ATTRIBUTES: &str = "+";
pub const NO_ATTRIBUTES: &str = "1.1";

/// `*`, `+` and `1.1` are selectors, not attribute names.
fn is_selector(attr: &str) -> bool {
    attr == ALL_USER_ATTRIBUTES || attr == ALL_OPERATIONAL_ATTRIBUTES || attr == NO_ATTRIBUTES
}

pub(crate) fn build(name: &str, opts: &ObfuscationOptions) -> Option<Step<Vec<String>>> {
    let o = opts.clone();
    let step = match name {
        "case" => Step::new("Case", move |attrs, ctx| case(attrs, ctx, o.case_probability)),
        "oidattribute" => Step::new("OIDAttribute", move |attrs, ctx| {
            oid_attribute(attrs, ctx, o.oid_prefix_probability, o.oid_max_leading_zeros)
        }),
        "duplicate" => Step::new("Duplicate", move |attrs, ctx| {
            duplicate(attrs, ctx, o.duplicate_probability, o.duplicate_max)
        }),
        "garbagenonexisting" => Step::new("GarbageNonExisting", move |attrs, ctx| {
            garbage_non_existing(attrs, ctx, o.garbage_min, o.garbage_max)
        }),
        "garbageexisting" => Step::new("GarbageExisting", move |attrs, ctx| {
            garbage_existing(attrs, ctx, o.garbage_min, o.garbage_max)
        }),
        "replacewithwildcard" => Step::new("ReplaceWithWildcard", |attrs, _ctx| replace_with_wildcard(attrs)),
        "replacewithempty" => Step::new("ReplaceWithEmpty", |attrs, _ctx| replace_with_empty(attrs)),
        "reorder" => Step::new("Reorder", |attrs, ctx| reorder(attrs, ctx)),
        _ => return None,
    };
    Some(step)
}

pub fn case(attrs: Vec<String>, ctx: &mut ObfuscationContext<'_>, p: f64) -> Vec<String> {
    attrs
        .into_iter()
        .map(|a| random_case(&a, p, ctx.rng))
        .collect()
}

pub fn oid_attribute(
    attrs: Vec<String>,
    ctx: &mut ObfuscationContext<'_>,
    prefix_probability: f64,
    max_zeros: usize,
) -> Vec<String> {
    attrs
        .into_iter()
        .map(|a| {
            if is_selector(&a) {
                a
            } else {
                obfuscate_attribute_oid(&a, ctx.tables, prefix_probability, max_zeros, ctx.rng)
            }
        })
        .collect()
}

/// Repeat attributes in place, each with probability `p`, up to `max` extra copies.
pub fn duplicate(attrs: Vec<String>, ctx: &mut ObfuscationContext<'_>, p: f64, max: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(attrs.len() * 2);
    for attr in attrs {
        let copies = if max > 0 && ctx.rng.gen_bool(p) {
            ctx.rng.gen_range(1..=max)
        } else {
            0
        };
        for _ in 0..copies {
            out.push(attr.clone());
        }
        out.push(attr);
    }
    out
}

fn insert_randomly(mut attrs: Vec<String>, extra: Vec<String>, ctx: &mut ObfuscationContext<'_>) -> Vec<String> {
    for name in extra {
        let at = ctx.rng.gen_range(0..=attrs.len());
        attrs.insert(at, name);
    }
    attrs
}

/// Insert synthesized attribute names that no directory defines.
pub fn garbage_non_existing(
    attrs: Vec<String>,
    ctx: &mut ObfuscationContext<'_>,
    min: usize,
    max: usize,
) -> Vec<String> {
    // An empty list already selects every user attribute.
    if attrs.is_empty() {
        return attrs;
    }
    let count = ctx.rng.gen_range(min..=max.max(min));
    let extra = (0..count).map(|_| random_name(8, 14, ctx.rng)).collect();
    insert_randomly(attrs, extra, ctx)
}

/// Insert names of real attributes from the lookup tables.
pub fn garbage_existing(attrs: Vec<String>, ctx: &mut ObfuscationContext<'_>, min: usize, max: usize) -> Vec<String> {
    if attrs.is_empty() {
        return attrs;
    }
    let known = ctx.tables.known_attributes();
    if known.is_empty() {
        return attrs;
    }
    let count = ctx.rng.gen_range(min..=max.max(min));
    let extra = known
        .choose_multiple(ctx.rng, count)
        .map(|name| name.to_string())
        .collect();
    insert_randomly(attrs, extra, ctx)
}

/// Request every user attribute, keeping the operational selector if present.
pub fn replace_with_wildcard(attrs: Vec<String>) -> Vec<String> {
    let mut out = vec![ALL_USER_ATTRIBUTES.to_string()];
    if attrs.iter().any(|a| a == ALL_OPERATIONAL_ATTRIBUTES) {
        out.push(ALL_OPERATIONAL_ATTRIBUTES.to_string());
    }
    out
}

/// An empty list means every user attribute.
pub fn replace_with_empty(attrs: Vec<String>) -> Vec<String> {
    if attrs.iter().any(|a| a == ALL_OPERATIONAL_ATTRIBUTES) {
        vec![ALL_USER_ATTRIBUTES.to_string(), ALL_OPERATIONAL_ATTRIBUTES.to_string()]
    } else {
        Vec::new()
    }
}

pub fn reorder(mut attrs: Vec<String>, ctx: &mut ObfuscationContext<'_>) -> Vec<String> {
    attrs.shuffle(ctx.rng);
    attrs
}
