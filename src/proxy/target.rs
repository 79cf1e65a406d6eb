//! Target registration and the immutable prefix registry.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use url::Url;

use crate::error::{Result, ShroudError};

/// Pre/post dispatch mutators attached to a target.
///
/// External collaborators (the statistics server, most prominently) implement
/// this to observe forwarding. `before_dispatch` runs immediately before the
/// upstream dispatch and its return value is what is actually sent.
/// `after_dispatch` runs after the dispatch with `Some(response)` on success
/// or `None` on transport failure; its return value is what continues
/// downstream, so implementations must hand the response back unchanged
/// unless they intend to substitute it.
pub trait Hooks: Send + Sync {
    fn before_dispatch(&self, req: Request<Full<Bytes>>) -> Request<Full<Bytes>>;

    fn after_dispatch(&self, res: Option<Response<Bytes>>) -> Option<Response<Bytes>>;
}

/// One upstream origin exposed under a local path prefix.
///
/// This is the registration value handed to [`Proxy::new`]. The origin is
/// validated when the registry is built, not per request.
///
/// [`Proxy::new`]: crate::proxy::Proxy::new
#[derive(Clone)]
pub struct Target {
    /// Absolute upstream origin, e.g. `https://example.com`
    pub base_origin: String,
    /// Local path prefix the origin is mounted under, e.g. `/ex/`
    pub prefix: String,
    /// Optional dispatch hooks (install these before proxy construction)
    pub hooks: Option<Arc<dyn Hooks>>,
}

impl Target {
    pub fn new(base_origin: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            base_origin: base_origin.into(),
            prefix: prefix.into(),
            hooks: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }
}

/// A target after validation, as held by the registry.
pub struct RegisteredTarget {
    /// Normalized prefix, always starting with `/`
    pub prefix: String,
    /// Parsed upstream origin
    pub origin: Url,
    /// Origin string used for same-origin matching during rewriting,
    /// without a trailing slash
    origin_str: String,
    pub hooks: Option<Arc<dyn Hooks>>,
}

impl RegisteredTarget {
    pub fn origin_str(&self) -> &str {
        &self.origin_str
    }
}

/// Immutable mapping from path prefix to target.
///
/// Built once at proxy construction and never mutated afterwards, so
/// concurrent lookups need no synchronization. Duplicate prefixes follow a
/// last-registration-wins policy.
pub struct TargetRegistry {
    targets: HashMap<String, Arc<RegisteredTarget>>,
}

impl TargetRegistry {
    /// Validate and index the given targets.
    ///
    /// Prefixes are normalized to a leading `/`. Any origin that fails to
    /// parse as an absolute URL aborts construction; the proxy is never
    /// created with a half-valid registry.
    pub fn new(targets: Vec<Target>) -> Result<Self> {
        let mut map = HashMap::new();
        for target in targets {
            let prefix = normalize_prefix(&target.prefix);
            let origin =
                Url::parse(&target.base_origin).map_err(|source| ShroudError::InvalidOrigin {
                    url: target.base_origin.clone(),
                    source,
                })?;
            if origin.host_str().is_none() {
                return Err(ShroudError::InvalidConfig(format!(
                    "target origin {} has no host",
                    target.base_origin
                )));
            }

            let origin_str = origin.as_str().trim_end_matches('/').to_string();
            // last registration wins
            map.insert(
                prefix.clone(),
                Arc::new(RegisteredTarget {
                    prefix,
                    origin,
                    origin_str,
                    hooks: target.hooks,
                }),
            );
        }
        Ok(Self { targets: map })
    }

    /// Find the target whose prefix the path falls under.
    ///
    /// Exact prefix matching only; with overlapping registrations the winner
    /// is unspecified (longest-prefix routing is a non-goal).
    pub fn lookup(&self, path: &str) -> Option<Arc<RegisteredTarget>> {
        self.targets
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, target)| Arc::clone(target))
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{}", prefix)
    }
}
