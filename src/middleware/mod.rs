//! Middleware chains: ordered pipelines of named rewrite steps over one payload kind,
//! plus the registry that builds them from step names.

pub mod attr_entries;
pub mod attr_list;
pub mod basedn;
pub mod filter;
pub mod helpers;

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::filter::Filter;
use crate::ldap_protocol::AttributeEntry;
use crate::observer::ProxyObserver;
use crate::tables::AttributeTables;

/// Per-invocation inputs shared by every step of a chain.
pub struct ObfuscationContext<'a> {
    pub rng: &'a mut dyn RngCore,
    pub tables: &'a AttributeTables,
    pub observer: &'a dyn ProxyObserver,
}

type StepFn<T> = dyn Fn(T, &mut ObfuscationContext<'_>) -> T + Send + Sync;

/// A named transform `T -> T`. Steps consume their input.
pub struct Step<T> {
    name: &'static str,
    apply: Arc<StepFn<T>>,
}

impl<T> Clone for Step<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            apply: Arc::clone(&self.apply),
        }
    }
}

impl<T> Step<T> {
    pub fn new<F>(name: &'static str, apply: F) -> Self
    where
        F: Fn(T, &mut ObfuscationContext<'_>) -> T + Send + Sync + 'static,
    {
        Self {
            name,
            apply: Arc::new(apply),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, value: T, ctx: &mut ObfuscationContext<'_>) -> T {
        (self.apply)(value, ctx)
    }
}

impl<T> fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Step").field(&self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub struct MiddlewareChain<T> {
    label: &'static str,
    steps: Vec<Step<T>>,
}

impl<T> MiddlewareChain<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            steps: Vec::new(),
        }
    }

    pub fn add(&mut self, step: Step<T>) {
        self.steps.push(step);
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(Step::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Fold `value` through every step in order. In verbose mode each step is
    /// reported to the observer before it runs.
    pub fn execute(&self, value: T, ctx: &mut ObfuscationContext<'_>, verbose: bool) -> T {
        self.steps.iter().fold(value, |acc, step| {
            if verbose {
                ctx.observer.on_step(self.label, step.name());
            }
            step.apply(acc, ctx)
        })
    }
}

/// Tunables for the rewrite steps. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationOptions {
    pub case_probability: f64,
    pub hex_probability: f64,
    pub spacing_min: usize,
    pub spacing_max: usize,
    pub double_negation_probability: f64,
    pub double_negation_max_depth: usize,
    pub demorgan_probability: f64,
    pub wrap_probability: f64,
    pub wrap_max_depth: usize,
    pub oid_prefix_probability: f64,
    pub oid_max_leading_zeros: usize,
    pub garbage_min: usize,
    pub garbage_max: usize,
    pub duplicate_probability: f64,
    pub duplicate_max: usize,
    pub bitwise_max_bits: usize,
    pub timestamp_max_chars: usize,
}

impl Default for ObfuscationOptions {
    fn default() -> Self {
        Self {
            case_probability: 0.5,
            hex_probability: 0.3,
            spacing_min: 1,
            spacing_max: 3,
            double_negation_probability: 0.5,
            double_negation_max_depth: 2,
            demorgan_probability: 0.5,
            wrap_probability: 0.5,
            wrap_max_depth: 2,
            oid_prefix_probability: 0.5,
            oid_max_leading_zeros: 3,
            garbage_min: 1,
            garbage_max: 3,
            duplicate_probability: 0.5,
            duplicate_max: 2,
            bitwise_max_bits: 4,
            timestamp_max_chars: 3,
        }
    }
}

impl ObfuscationOptions {
    pub fn validate(&self) -> Result<()> {
        for (name, p) in [
            ("case_probability", self.case_probability),
            ("hex_probability", self.hex_probability),
            ("double_negation_probability", self.double_negation_probability),
            ("demorgan_probability", self.demorgan_probability),
            ("wrap_probability", self.wrap_probability),
            ("oid_prefix_probability", self.oid_prefix_probability),
            ("duplicate_probability", self.duplicate_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                bail!("option {} must be within [0, 1], got {}", name, p);
            }
        }
        for (name, min, max) in [
            ("spacing", self.spacing_min, self.spacing_max),
            ("garbage", self.garbage_min, self.garbage_max),
        ] {
            if min > max {
                bail!("option {}_min ({}) exceeds {}_max ({})", name, min, name, max);
            }
        }
        Ok(())
    }
}

/// Step names per chain, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub filter: Vec<String>,
    pub attr_list: Vec<String>,
    pub basedn: Vec<String>,
    pub attr_entries: Vec<String>,
}

/// The four chains applied to intercepted requests.
#[derive(Debug, Clone)]
pub struct ChainSet {
    pub filter: MiddlewareChain<Filter>,
    pub attr_list: MiddlewareChain<Vec<String>>,
    pub basedn: MiddlewareChain<String>,
    pub attr_entries: MiddlewareChain<Vec<AttributeEntry>>,
}

impl Default for ChainSet {
    fn default() -> Self {
        Self {
            filter: MiddlewareChain::new("filter"),
            attr_list: MiddlewareChain::new("attr_list"),
            basedn: MiddlewareChain::new("basedn"),
            attr_entries: MiddlewareChain::new("attr_entries"),
        }
    }
}

/// Builds steps by name. Lookup is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareRegistry {
    options: ObfuscationOptions,
}

impl MiddlewareRegistry {
    pub fn new(options: ObfuscationOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ObfuscationOptions {
        &self.options
    }

    pub fn filter_step(&self, name: &str) -> Option<Step<Filter>> {
        filter::build(&name.to_ascii_lowercase(), &self.options)
    }

    pub fn attr_list_step(&self, name: &str) -> Option<Step<Vec<String>>> {
        attr_list::build(&name.to_ascii_lowercase(), &self.options)
    }

    pub fn basedn_step(&self, name: &str) -> Option<Step<String>> {
        basedn::build(&name.to_ascii_lowercase(), &self.options)
    }

    pub fn attr_entries_step(&self, name: &str) -> Option<Step<Vec<AttributeEntry>>> {
        attr_entries::build(&name.to_ascii_lowercase(), &self.options)
    }

    /// Build every chain; the first unknown step name is an error.
    pub fn build_chains(&self, config: &ChainConfig) -> Result<ChainSet> {
        let mut chains = ChainSet::default();
        populate(&mut chains.filter, &config.filter, filter::NAMES, |n| self.filter_step(n))?;
        populate(&mut chains.attr_list, &config.attr_list, attr_list::NAMES, |n| {
            self.attr_list_step(n)
        })?;
        populate(&mut chains.basedn, &config.basedn, basedn::NAMES, |n| self.basedn_step(n))?;
        populate(&mut chains.attr_entries, &config.attr_entries, attr_entries::NAMES, |n| {
            self.attr_entries_step(n)
        })?;
        Ok(chains)
    }
}

fn populate<T>(
    chain: &mut MiddlewareChain<T>,
    names: &[String],
    known: &[&str],
    build: impl Fn(&str) -> Option<Step<T>>,
) -> Result<()> {
    for name in names {
        match build(name) {
            Some(step) => chain.add(step),
            None => bail!(
                "unknown {} middleware '{}' (available: {})",
                chain.label(),
                name,
                known.join(", ")
            ),
        }
    }
    Ok(())
}
