// Rewrite steps over attribute/value entries of Add and Modify requests.
// Only names are touched; values pass through untouched.

use rand::seq::SliceRandom;

use super::helpers::{obfuscate_attribute_oid, random_case};
use super::{ObfuscationContext, ObfuscationOptions, Step};
use crate::ldap_protocol::AttributeEntry;

pub const NAMES: &[&str] = &["Case", "OIDAttribute", "Reorder"];

pub(crate) fn build(name: &str, opts: &ObfuscationOptions) -> Option<Step<Vec<AttributeEntry>>> {
    let o = opts.clone();
    let step = match name {
        "case" => Step::new("Case", move |entries, ctx| case(entries, ctx, o.case_probability)),
        "oidattribute" => Step::new("OIDAttribute", move |entries, ctx| {
            oid_attribute(entries, ctx, o.oid_prefix_probability, o.oid_max_leading_zeros)
        }),
        "reorder" => Step::new("Reorder", |entries, ctx| reorder(entries, ctx)),
        _ => return None,
    };
    Some(step)
}

pub fn case(entries: Vec<AttributeEntry>, ctx: &mut ObfuscationContext<'_>, p: f64) -> Vec<AttributeEntry> {
    entries
        .into_iter()
        .map(|e| AttributeEntry {
            name: random_case(&e.name, p, ctx.rng),
            values: e.values,
        })
        .collect()
}

pub fn oid_attribute(
    entries: Vec<AttributeEntry>,
    ctx: &mut ObfuscationContext<'_>,
    prefix_probability: f64,
    max_zeros: usize,
) -> Vec<AttributeEntry> {
    entries
        .into_iter()
        .map(|e| AttributeEntry {
            name: obfuscate_attribute_oid(&e.name, ctx.tables, prefix_probability, max_zeros, ctx.rng),
            values: e.values,
        })
        .collect()
}

pub fn reorder(mut entries: Vec<AttributeEntry>, ctx: &mut ObfuscationContext<'_>) -> Vec<AttributeEntry> {
    entries.shuffle(ctx.rng);
    entries
}
