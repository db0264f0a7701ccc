//! Schema engine contract.
//!
//! The binder consults the schema for the declared argument signatures of a
//! service method, and asks it to marshal a configuration subtree against one
//! signature. `check` is a pure function so overload resolution can dry-run
//! every candidate without side effects, and binder tests can supply fixtures.

use crate::config::ConfigNode;
use crate::rpc::ArgDoc;
use thiserror::Error;

/// Declared type of one method argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgType {
    Bool,
    Uint32,
    Str,
    StrArray,
    /// Nested dictionary marshalled from a child element.
    Dict,
}

/// One declared argument of a method signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgSpec {
    /// Element or attribute name the value is taken from.
    pub name: String,
    pub ty: ArgType,
    pub required: bool,
}

/// One declared overload of a service method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSignature {
    pub service: String,
    pub method: String,
    pub args: Vec<ArgSpec>,
}

impl MethodSignature {
    /// Compact rendering for diagnostics, e.g. `link.linkUp(name, mtu?)`.
    pub fn describe(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                if a.required {
                    a.name.clone()
                } else {
                    format!("{}?", a.name)
                }
            })
            .collect();
        format!("{}.{}({})", self.service, self.method, args.join(", "))
    }
}

/// Marshalling failure for one (signature, subtree) pair.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("cannot type {subject} against {signature}: {detail}")]
pub struct TypeError {
    pub signature: String,
    pub subject: String,
    pub detail: String,
}

/// The schema/type engine, consumed only through this seam.
pub trait SchemaEngine: Send + Sync {
    /// Declared overloads of `method` on `service`, in declaration order.
    /// An empty result means the service does not declare the method.
    fn signatures(&self, service: &str, method: &str) -> Vec<MethodSignature>;

    /// Marshal a configuration subtree into an argument document for one
    /// signature. Pure: no side effects, safe to call per candidate overload.
    fn check(&self, signature: &MethodSignature, config: &ConfigNode) -> Result<ArgDoc, TypeError>;
}
