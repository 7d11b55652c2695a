//! Egress domain policy

/// Domain allowlist applied to every proxied request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainPolicy {
    allow_all: bool,
    allowed: Vec<String>,
}

impl DomainPolicy {
    pub fn new(allowed: &[String], allow_all: bool) -> Self {
        Self {
            allow_all,
            allowed: allowed.iter().map(|d| normalize(d)).collect(),
        }
    }

    /// Policy that lets everything through
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            allowed: Vec::new(),
        }
    }

    /// True when `host` or one of its parent domains is allowed.
    ///
    /// `api.example.com` matches `example.com`; `badexample.com` does not.
    /// An empty allowlist denies everything unless `allow_all` is set.
    pub fn is_allowed(&self, host: &str) -> bool {
        if self.allow_all {
            return true;
        }
        let host = normalize(host);
        if host.is_empty() {
            return false;
        }
        self.allowed.iter().any(|entry| {
            entry == "*" || host == *entry || host.ends_with(&format!(".{}", entry))
        })
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}
