use std::time::Duration;

use hyper::Uri;

use crate::translate::{Mapper, ModelMap};

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.x.ai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "grok-3-latest";
pub const DEFAULT_MODEL_PREFIX: &str = "grok-";

/// Relay settings, resolved once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Full upstream chat completions endpoint.
    pub upstream_url: Uri,
    /// Model used for every name outside the upstream namespace.
    pub default_model: String,
    /// Prefix that marks a model name as native to the upstream.
    pub model_prefix: String,
    /// Accepted `x-proxy-key` values. Empty disables the check.
    pub proxy_keys: Vec<String>,
    /// Limit on connecting to the upstream and receiving its response headers.
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_url: Uri::from_static(DEFAULT_UPSTREAM_URL),
            default_model: DEFAULT_MODEL.into(),
            model_prefix: DEFAULT_MODEL_PREFIX.into(),
            proxy_keys: Vec::new(),
            timeout: None,
        }
    }
}

impl Config {
    pub fn mapper(&self) -> Mapper {
        Mapper::new(ModelMap::new(
            self.default_model.clone(),
            self.model_prefix.clone(),
        ))
    }
}
