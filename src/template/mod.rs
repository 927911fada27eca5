//! Cache configuration rendering
//!
//! Turns a defaulted [`CacheSpec`] into the text of `redis.conf`. Rendering
//! is pure: the same spec always yields the same bytes, which is what makes
//! the content fingerprint on the Deployment meaningful.

use minijinja::{context, Environment, UndefinedBehavior};

#[cfg(test)]
use mockall::automock;

use crate::crd::CacheSpec;
use crate::validation::is_valid_secret_name;
use crate::Error;

/// Template for the cache server configuration file
///
/// The credential is never inlined; only the secret name is recorded so the
/// file can be inspected without leaking it.
pub const REDIS_CONFIG_TEMPLATE: &str = "\
port {{ port }}
maxmemory {{ max_memory }}
maxmemory-policy {{ max_memory_eviction_policy }}
{%- if password_secret %}
# requirepass is sourced from secret {{ password_secret }}
{%- endif %}
";

/// Renders configuration text for a cache instance
#[cfg_attr(test, automock)]
pub trait ConfigRenderer: Send + Sync {
    /// Render the configuration file for a defaulted spec
    fn render(&self, spec: &CacheSpec) -> Result<String, Error>;
}

/// minijinja-backed renderer for `redis.conf`
pub struct RedisConfigRenderer {
    env: Environment<'static>,
    template: String,
}

impl RedisConfigRenderer {
    /// Create a renderer using the built-in template
    pub fn new() -> Self {
        Self::with_template(REDIS_CONFIG_TEMPLATE)
    }

    /// Create a renderer using a custom template
    ///
    /// The template sees `port`, `max_memory`, `max_memory_eviction_policy`
    /// and `password_secret`. Referencing anything else is a render error.
    pub fn with_template(template: impl Into<String>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        Self {
            env,
            template: template.into(),
        }
    }
}

impl Default for RedisConfigRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRenderer for RedisConfigRenderer {
    fn render(&self, spec: &CacheSpec) -> Result<String, Error> {
        // The name lands in the file verbatim.
        if !is_valid_secret_name(&spec.password_secret) {
            return Err(Error::render(format!(
                "passwordSecret {:?} is not a valid Secret name",
                spec.password_secret
            )));
        }

        let ctx = context! {
            port => spec.port,
            max_memory => &spec.max_memory,
            max_memory_eviction_policy => &spec.max_memory_eviction_policy,
            password_secret => &spec.password_secret,
        };

        self.env
            .render_str(&self.template, ctx)
            .map_err(|e| Error::render(e.to_string()))
    }
}
