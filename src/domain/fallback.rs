use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::warn;

/// A value that may have been substituted after a failed lookup.
///
/// Callers see the substitution instead of having the error swallowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fallback<T> {
    pub value: T,
    pub degraded: bool,
    pub reason: Option<String>,
}

impl<T> Fallback<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value,
            degraded: false,
            reason: None,
        }
    }

    pub fn degraded(value: T, reason: impl Into<String>) -> Self {
        Self {
            value,
            degraded: true,
            reason: Some(reason.into()),
        }
    }

    /// Take the result when it succeeded, otherwise `fallback` flagged as degraded.
    pub fn from_result<E: Display>(
        result: std::result::Result<T, E>,
        fallback: T,
        what: &str,
    ) -> Self {
        match result {
            Ok(value) => Self::fresh(value),
            Err(e) => {
                warn!(what, error = %e, "Lookup failed, using fallback value");
                Self::degraded(fallback, format!("{what}: {e}"))
            }
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fallback<U> {
        Fallback {
            value: f(self.value),
            degraded: self.degraded,
            reason: self.reason,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}
