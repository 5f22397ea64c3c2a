//! Limiter key derivation.

use super::LimiterKind;

/// Namespace of persisted limiter state.
const STATE_NAMESPACE: &str = "limiter";
/// Namespace of cross-instance update channels.
const UPDATES_NAMESPACE: &str = "updates";
/// Namespace of tenant configuration.
const CONFIG_NAMESPACE: &str = "configure";

/// A key that uniquely identifies a limiter instance.
///
/// The key is composed of the algorithm kind, the tenant key and the
/// discriminating arguments in the order they were supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    /// The algorithm configured for the tenant
    pub kind: LimiterKind,
    /// The tenant the limit is configured against
    pub tenant: String,
    /// Additional discriminating values
    pub args: Vec<String>,
}

impl LimiterKey {
    /// Create a new limiter key.
    pub fn new(kind: LimiterKind, tenant: &str, args: &[String]) -> Self {
        Self {
            kind,
            tenant: tenant.to_string(),
            args: args.to_vec(),
        }
    }

    /// Key of the persisted runtime state.
    /// Format: "limiter:{tag}:{tenant}[:{arg}...]"
    pub fn storage_key(&self) -> String {
        self.derive(STATE_NAMESPACE)
    }

    /// Name of the channel carrying state updates between instances.
    /// Format: "updates:{tag}:{tenant}[:{arg}...]"
    pub fn channel(&self) -> String {
        self.derive(UPDATES_NAMESPACE)
    }

    fn derive(&self, namespace: &str) -> String {
        let mut key = format!("{}:{}:{}", namespace, self.kind.tag(), self.tenant);
        if !self.args.is_empty() {
            key.push(':');
            key.push_str(&self.args.join(":"));
        }
        key
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// Key of a tenant's stored configuration.
pub fn configuration_key(tenant: &str) -> String {
    format!("{}:{}", CONFIG_NAMESPACE, tenant)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_storage_key_without_args() {
        let key = LimiterKey::new(LimiterKind::TokenBucket, "api", &[]);
        assert_eq!(key.storage_key(), "limiter:tbl:api");
        assert_eq!(key.channel(), "updates:tbl:api");
    }

    #[test]
    fn test_storage_key_with_args() {
        let key = LimiterKey::new(
            LimiterKind::SlidingWindow,
            "api",
            &args(&["/users", "GET", "10.0.0.1"]),
        );
        assert_eq!(key.storage_key(), "limiter:sw:api:/users:GET:10.0.0.1");
        assert_eq!(key.channel(), "updates:sw:api:/users:GET:10.0.0.1");
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = LimiterKey::new(LimiterKind::TokenBucket, "api", &args(&["u1"]));
        let b = LimiterKey::new(LimiterKind::TokenBucket, "api", &args(&["u1"]));
        assert_eq!(a, b);
        assert_eq!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn test_kind_separates_keys() {
        let tb = LimiterKey::new(LimiterKind::TokenBucket, "api", &[]);
        let sw = LimiterKey::new(LimiterKind::SlidingWindow, "api", &[]);
        assert_ne!(tb.storage_key(), sw.storage_key());
    }

    #[test]
    fn test_namespaces_never_collide() {
        let key = LimiterKey::new(LimiterKind::SlidingWindow, "updates", &args(&["sw"]));
        assert_ne!(key.storage_key(), key.channel());
        assert_ne!(configuration_key("api"), key.storage_key());
        assert_eq!(configuration_key("api"), "configure:api");
    }
}
