use std::fmt;

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchemeError {
    #[error("{node}: missing attribute '{attr}'")]
    MissingAttribute { node: String, attr: &'static str },
    #[error("{node}: illegal value {value:?} for attribute '{attr}'")]
    IllegalValue {
        node: String,
        attr: &'static str,
        value: String,
    },
    #[error("duplicate name {name:?} among {scope}")]
    DuplicateName { scope: &'static str, name: String },
    #[error("{node}: unresolved reference {reference:?}")]
    UnresolvedRef { node: String, reference: String },
    #[error("{node}: ambiguous symbol {sym:?}, provided by plugins {first:?} and {second:?}")]
    AmbiguousSymbol {
        node: String,
        sym: String,
        first: String,
        second: String,
    },
    #[error("plugin {plugin:?}: version {found} is incompatible with host {host}")]
    IncompatiblePluginVersion {
        plugin: String,
        found: String,
        host: String,
    },
    #[error("plugin {plugin:?}: {message}")]
    PluginInit { plugin: String, message: String },
    #[error("deploy text, line {line}: {message}")]
    DeploySyntax { line: usize, message: String },
}

/// Accumulates every scheme-load failure before reporting; the loader never
/// short-circuits on the first problem.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemeErrorStack {
    errors: Vec<SchemeError>,
}

impl SchemeErrorStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: SchemeError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemeError> {
        self.errors.iter()
    }

    /// Ok(value) when clean, Err(self) otherwise.
    pub fn into_result<T>(self, value: T) -> Result<T, SchemeErrorStack> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl From<SchemeError> for SchemeErrorStack {
    fn from(error: SchemeError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl fmt::Display for SchemeErrorStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, error) in self.errors.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SchemeErrorStack {}
