//! runvault core types: run identity, correlation annotations, clock and errors.

#![forbid(unsafe_code)]

pub mod annotation;
pub mod clock;
pub mod config;
pub mod error;
pub mod naming;
pub mod run;

pub use annotation::{Correlation, CorrelationRefs};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{ClientError, ConversionError, ReconcileError};
pub use run::{Completion, Converter, Identity, OwnerRef, OwnerRefs, RecordData, ResourceClient, RunView};

pub mod prelude {
    pub use super::{
        Clock, ClientError, Completion, Config, ConversionError, Converter, Correlation, CorrelationRefs, Identity,
        OwnerRef, ReconcileError, RecordData, ResourceClient, RunView,
    };
}

/// A parsed `<namespace>/<name>` reconcile key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileKey {
    pub namespace: String,
    pub name: String,
}

impl ReconcileKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn parse(key: &str) -> Result<Self, ReconcileError> {
        match key.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(ReconcileError::InvalidKey(key.to_string())),
        }
    }
}

impl std::fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
