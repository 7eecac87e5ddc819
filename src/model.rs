//! Immutable model and prompt configuration.
//!
//! Providers differ only in their parameter payloads, so `Model` is a plain
//! value struct generic over that payload rather than a trait hierarchy. Both
//! types are read-only after construction; batchers record only their names on
//! message rows.

use serde::{Deserialize, Serialize};

/// A named model configuration with provider-specific generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model<P> {
    /// Name recorded as `model_name` on every message submitted with this
    /// configuration
    pub name: String,
    /// Provider-specific generation parameters (temperature, token limits,
    /// thinking mode, ...)
    pub params: P,
}

impl<P> Model<P> {
    pub fn new(name: impl Into<String>, params: P) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// A named system instruction, optionally flagged for provider-side caching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPrompt {
    /// Name recorded as `prompt_name` on every message submitted with this
    /// prompt
    pub name: String,
    pub text: String,
    /// Ask the provider to cache this prompt across requests
    pub cache: bool,
}

impl TextPrompt {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            cache: false,
        }
    }

    pub fn cached(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            cache: true,
            ..Self::new(name, text)
        }
    }
}
