// Rewrite steps over distinguished names (search base, entry DNs).
// DNs are split on unescaped, unquoted commas; each RDN is rewritten on its own.

use rand::{Rng, RngCore};

use super::helpers::{is_numeric_oid, oid_leading_zeros, random_case, spaces, split_dn, split_rdn};
use super::{ObfuscationContext, ObfuscationOptions, Step};

pub const NAMES: &[&str] = &[
    "OIDAttribute",
    "Case",
    "HexValue",
    "Spacing",
    "DoubleQuotes",
    "OIDLeadingZeros",
    "OIDPrefix",
];

const OID_PREFIX: &str = "oID.";

pub(crate) fn build(name: &str, opts: &ObfuscationOptions) -> Option<Step<String>> {
    let o = opts.clone();
    let step = match name {
        "oidattribute" => Step::new("OIDAttribute", |dn, ctx| oid_attribute(dn, ctx)),
        "case" => Step::new("Case", move |dn, ctx| case(dn, ctx, o.case_probability)),
        "hexvalue" => Step::new("HexValue", move |dn, ctx| hex_value(dn, ctx, o.hex_probability)),
        "spacing" => Step::new("Spacing", move |dn, ctx| spacing(dn, ctx, o.spacing_min, o.spacing_max)),
        "doublequotes" => Step::new("DoubleQuotes", |dn, _ctx| double_quotes(dn)),
        "oidleadingzeros" => Step::new("OIDLeadingZeros", move |dn, ctx| {
            oid_leading_zeros_step(dn, ctx, o.oid_max_leading_zeros)
        }),
        "oidprefix" => Step::new("OIDPrefix", |dn, _ctx| oid_prefix(dn)),
        _ => return None,
    };
    Some(step)
}

/// Rebuild a DN, mapping every `type=value` RDN through `f`. RDNs without `=` are kept.
fn map_rdns<F>(dn: &str, mut f: F) -> String
where
    F: FnMut(&str, &str) -> String,
{
    split_dn(dn)
        .iter()
        .map(|rdn| match split_rdn(rdn) {
            Some((attr, value)) => f(attr, value),
            None => rdn.clone(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Attribute type without an `oID.` prefix, if it is a numeric OID.
fn numeric_type(attr: &str) -> Option<&str> {
    let bare = attr
        .get(..OID_PREFIX.len())
        .filter(|p| p.eq_ignore_ascii_case(OID_PREFIX))
        .map_or(attr, |_| &attr[OID_PREFIX.len()..]);
    is_numeric_oid(bare).then_some(bare)
}

/// Replace attribute types that have a registered OID.
pub fn oid_attribute(dn: String, ctx: &mut ObfuscationContext<'_>) -> String {
    map_rdns(&dn, |attr, value| match ctx.tables.oid(attr.trim()) {
        Some(oid) => format!("{}={}", oid, value),
        None => format!("{}={}", attr, value),
    })
}

pub fn case(dn: String, ctx: &mut ObfuscationContext<'_>, p: f64) -> String {
    map_rdns(&dn, |attr, value| {
        format!("{}={}", random_case(attr, p, ctx.rng), random_case(value, p, ctx.rng))
    })
}

/// Escape value characters as `\xx`, leaving existing escapes, quoted and `#`-encoded values alone.
fn escape_dn_value(value: &str, p: f64, rng: &mut dyn RngCore) -> String {
    if value.starts_with('#') || value.starts_with('"') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() * 2);
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(c);
            if let Some(next) = chars.next() {
                out.push(next);
            }
            continue;
        }
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

pub fn hex_value(dn: String, ctx: &mut ObfuscationContext<'_>, p: f64) -> String {
    map_rdns(&dn, |attr, value| format!("{}={}", attr, escape_dn_value(value, p, ctx.rng)))
}

/// Leading and trailing whitespace around every RDN.
pub fn spacing(dn: String, ctx: &mut ObfuscationContext<'_>, min: usize, max: usize) -> String {
    map_rdns(&dn, |attr, value| {
        format!(
            "{}{}={}{}",
            spaces(min, max, ctx.rng),
            attr,
            value,
            spaces(min, max, ctx.rng)
        )
    })
}

/// Quote plain values: `cn=John` becomes `cn="John"`.
pub fn double_quotes(dn: String) -> String {
    map_rdns(&dn, |attr, value| {
        if value.is_empty() || value.contains(&['"', '\\', '+'][..]) || value.starts_with('#') {
            format!("{}={}", attr, value)
        } else {
            format!("{}=\"{}\"", attr, value)
        }
    })
}

pub fn oid_leading_zeros_step(dn: String, ctx: &mut ObfuscationContext<'_>, max_zeros: usize) -> String {
    map_rdns(&dn, |attr, value| match numeric_type(attr) {
        Some(oid) => {
            let prefix = &attr[..attr.len() - oid.len()];
            format!("{}{}={}", prefix, oid_leading_zeros(oid, max_zeros.max(1), ctx.rng), value)
        }
        None => format!("{}={}", attr, value),
    })
}

pub fn oid_prefix(dn: String) -> String {
    map_rdns(&dn, |attr, value| {
        if is_numeric_oid(attr) {
            format!("{}{}={}", OID_PREFIX, attr, value)
        } else {
            format!("{}={}", attr, value)
        }
    })
}
