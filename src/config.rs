use std::path::PathBuf;

use regex::Regex;

/// Limits and fetch behavior for the asset engine.
#[derive(Debug, Clone)]
pub struct AssetConfig {
    /// Size limit for resources fetched by URL. 0 disables the check.
    pub max_remote_size: i64,
    /// Size limit to wait for resources fetched by URL. Accepted for
    /// compatibility; not enforced yet.
    pub max_remote_wait_size: i64,
    /// Size limit for resources pushed directly. 0 disables the check.
    pub max_size: i64,
    /// URLs must match this pattern before a fetch is attempted; fetching is
    /// disabled entirely when unset.
    pub original_url_pattern: Option<Regex>,
    /// User-Agent header sent when fetching remote resources.
    pub http_user_agent: String,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            max_remote_size: 1000 * 1024 * 1024,
            max_remote_wait_size: 10 * 1024 * 1024,
            max_size: 0,
            original_url_pattern: None,
            http_user_agent: "AssetsClient".to_string(),
        }
    }
}

/// Layout and permissions of the content-addressed directory tree.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub dir: PathBuf,
    pub path_depth: u8,
    pub dir_perm: u32,
    pub file_perm: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./storage"),
            path_depth: 2,
            dir_perm: 0o755,
            file_perm: 0o655,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: String,
    /// Fallback value for the response Content-Type header.
    pub fallback_mimetype: String,
    /// Cache lifetime in seconds advertised to clients; 0 disables cache
    /// headers entirely.
    pub cache_ttl: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            fallback_mimetype: "application/octet-stream".to_string(),
            cache_ttl: 0,
        }
    }
}

/// Parse a permission flag given as an octal string like "0755".
pub fn parse_perm(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    u32::from_str_radix(digits, 8).map_err(|e| format!("invalid permission {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perm_parsing() {
        assert_eq!(parse_perm("0755").unwrap(), 0o755);
        assert_eq!(parse_perm("644").unwrap(), 0o644);
        assert_eq!(parse_perm("0o700").unwrap(), 0o700);
        assert!(parse_perm("abc").is_err());
        assert!(parse_perm("0999").is_err());
    }
}
