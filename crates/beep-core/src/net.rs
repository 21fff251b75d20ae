use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Decide whether the host should honor standard proxy environment
/// variables.
///
/// Behavior:
/// - `BEEP_KEEP_PROXIES=1/true/yes/on` forces proxies on.
/// - `BEEP_KEEP_PROXIES=0/false/no/off/""` forces proxies off.
/// - If unset, proxies are enabled only when at least one proxy env var is
///   set.
pub(crate) fn keep_proxies() -> bool {
    match env::var("BEEP_KEEP_PROXIES") {
        Ok(raw) => {
            let value = raw.trim().to_ascii_lowercase();
            !matches!(value.as_str(), "" | "0" | "false" | "no" | "off")
        }
        Err(_) => {
            const PROXY_KEYS: &[&str] = &[
                "HTTP_PROXY",
                "http_proxy",
                "HTTPS_PROXY",
                "https_proxy",
                "ALL_PROXY",
                "all_proxy",
                "NO_PROXY",
                "no_proxy",
            ];
            PROXY_KEYS.iter().any(|key| {
                env::var(key)
                    .ok()
                    .map(|value| !value.trim().is_empty())
                    .unwrap_or(false)
            })
        }
    }
}

/// Shared blocking HTTP client for provisioner downloads. No global
/// request timeout; downloads are streamed and cancellation is handled at
/// the chunk level.
pub(crate) fn build_http_client() -> Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder()
        .user_agent(concat!("beep-python/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30));
    if !keep_proxies() {
        builder = builder.no_proxy();
    }
    builder.build().context("failed to build http client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let previous = env::var(key).ok();
            match value {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }

    fn clear_proxy_env() -> Vec<EnvGuard> {
        [
            "HTTP_PROXY",
            "http_proxy",
            "HTTPS_PROXY",
            "https_proxy",
            "ALL_PROXY",
            "all_proxy",
            "NO_PROXY",
            "no_proxy",
        ]
        .iter()
        .map(|key| EnvGuard::set(key, None))
        .collect()
    }

    #[test]
    #[serial]
    fn keep_proxies_defaults_to_proxy_env_presence() {
        let _keep = EnvGuard::set("BEEP_KEEP_PROXIES", None);
        let _cleared = clear_proxy_env();
        assert!(!keep_proxies());
        let _proxy = EnvGuard::set("HTTPS_PROXY", Some("http://proxy.example"));
        assert!(keep_proxies());
    }

    #[test]
    #[serial]
    fn keep_proxies_env_var_wins() {
        let _cleared = clear_proxy_env();
        let _proxy = EnvGuard::set("HTTP_PROXY", Some("http://proxy.example"));
        let _keep = EnvGuard::set("BEEP_KEEP_PROXIES", Some("0"));
        assert!(!keep_proxies());
    }
}
