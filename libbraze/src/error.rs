pub use anyhow::Error;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Prints a non-fatal diagnostic. Routed through our own function so that callers that want to
/// suppress or capture warnings have a single place to hook.
pub(crate) fn warning(message: &str) {
    println!("WARNING: braze: {message}");
}

/// An error indicating that linking cannot continue because the same strong symbol was defined by
/// more than one regular input.
#[derive(Debug, Clone)]
pub struct MultipleDefinitions {
    pub name: String,
}

impl Display for MultipleDefinitions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "multiple definitions of `{}'.", self.name)
    }
}

impl core::error::Error for MultipleDefinitions {}
