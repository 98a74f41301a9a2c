//! Represents parsed manifest strings with embedded variable references, e.g.
//! `cc $cflags -c $in -o $out`, and mechanisms for expanding those into
//! plain strings.

use crate::smallmap::SmallMap;
use std::borrow::Cow;

/// An environment providing a mapping of variable name to variable value.
/// A given EvalString may be expanded against several environments; the
/// first one with a value for a variable wins.
pub trait Env {
    fn get_var(&self, var: &str) -> Option<Cow<str>>;
}

/// One token within an EvalString, either literal text or a variable reference.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalPart<T: AsRef<str>> {
    Literal(T),
    VarRef(T),
}

/// A parsed but unexpanded variable-reference string, e.g. "cc $in -o $out".
/// This is generic to support EvalString<&str>, which is used for immediately-
/// expanded evals, like top-level bindings, and EvalString<String>, which is
/// used for delayed evals like in `rule` blocks.
#[derive(Debug, PartialEq)]
pub struct EvalString<T: AsRef<str>>(Vec<EvalPart<T>>);

impl<T: AsRef<str>> EvalString<T> {
    pub fn new(parts: Vec<EvalPart<T>>) -> Self {
        EvalString(parts)
    }

    /// Expand into a plain string.  Unknown variables expand to nothing.
    pub fn evaluate(&self, envs: &[&dyn Env]) -> String {
        let mut val = String::new();
        for part in &self.0 {
            match part {
                EvalPart::Literal(s) => val.push_str(s.as_ref()),
                EvalPart::VarRef(v) => {
                    if let Some(value) = envs.iter().find_map(|env| env.get_var(v.as_ref())) {
                        val.push_str(&value);
                    }
                }
            }
        }
        val
    }
}

impl EvalString<&str> {
    pub fn into_owned(self) -> EvalString<String> {
        EvalString(
            self.0
                .into_iter()
                .map(|part| match part {
                    EvalPart::Literal(s) => EvalPart::Literal(s.to_owned()),
                    EvalPart::VarRef(s) => EvalPart::VarRef(s.to_owned()),
                })
                .collect(),
        )
    }
}

/// A single scope's worth of variable definitions, already expanded.
#[derive(Debug, Default, Clone)]
pub struct Vars<'text>(SmallMap<&'text str, String>);

impl<'text> Vars<'text> {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn insert(&mut self, key: &'text str, val: String) {
        self.0.insert(key, val);
    }
    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }
}

impl<'text> Env for Vars<'text> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.get(var).map(|val| Cow::Borrowed(val.as_str()))
    }
}

/// A single scope's worth of variable definitions, expanded when used.
/// Rule and build bindings are lazy because they can refer to `$in`/`$out`.
#[derive(Debug, Default)]
pub struct LazyVars(SmallMap<String, EvalString<String>>);

impl LazyVars {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, key: &str) -> Option<&EvalString<String>> {
        self.0.get(key)
    }
    pub fn insert(&mut self, key: String, val: EvalString<String>) {
        self.0.insert(key, val);
    }
    pub fn keyvals(&self) -> impl Iterator<Item = &(String, EvalString<String>)> {
        self.0.iter()
    }
}

impl Env for LazyVars {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.get(var).map(|val| Cow::Owned(val.evaluate(&[])))
    }
}
