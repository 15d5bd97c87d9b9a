use crate::api::UrlSigner;
use qbee_shared::config::ParametersBundle;
use std::collections::HashMap;

/// Per-run mapping used for `$(key)` substitution, built by merging
/// `parameters` and `secrets` from the parameters bundle. Secret values are
/// additionally exposed for the reporter's redaction list.
#[derive(Debug, Default)]
pub struct ParameterStore {
    values: HashMap<String, String>,
    secrets: Vec<String>,
}

impl ParameterStore {
    pub fn from_bundle(bundle: Option<&ParametersBundle>) -> Self {
        let mut store = Self::default();
        if let Some(bundle) = bundle {
            for p in &bundle.parameters {
                store.values.insert(p.key.clone(), p.value.clone());
            }
            for s in &bundle.secrets {
                store.values.insert(s.key.clone(), s.value.clone());
                store.secrets.push(s.value.clone());
            }
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Verbatim secret values, for report redaction.
    pub fn secret_values(&self) -> &[String] {
        &self.secrets
    }

    #[cfg(test)]
    pub fn from_entries(entries: &[(&str, &str)]) -> Self {
        let mut store = Self::default();
        for (k, v) in entries {
            store.values.insert(k.to_string(), v.to_string());
        }
        store
    }
}

/// Built-in device facts resolvable as `$(sys.*)` tokens.
#[derive(Debug, Default, Clone)]
pub struct SystemFacts {
    map: HashMap<String, String>,
}

impl SystemFacts {
    /// Collect the fact table once per run. Package type/architecture come
    /// from the package-manager collaborator; the rest is probed locally.
    pub fn collect(pkg_type: &str, pkg_arch: &str) -> Self {
        let mut map = HashMap::new();

        if let Some(host) = hostname() {
            map.insert("sys.host".to_string(), host);
        }
        map.insert("sys.os_type".to_string(), std::env::consts::OS.to_string());
        map.insert(
            "sys.os".to_string(),
            os_release_field("ID").unwrap_or_else(|| std::env::consts::OS.to_string()),
        );
        if let Some(flavor) = os_release_field("VERSION_CODENAME")
            .or_else(|| os_release_field("VERSION_ID"))
        {
            map.insert("sys.flavor".to_string(), flavor);
        }
        if let Some(boot) = boot_time_unix() {
            map.insert("sys.boot_time".to_string(), boot.to_string());
        }
        if !pkg_type.is_empty() {
            map.insert("sys.pkg_type".to_string(), pkg_type.to_string());
        }
        if !pkg_arch.is_empty() {
            map.insert("sys.pkg_arch".to_string(), pkg_arch.to_string());
        }

        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.get("sys.host")
    }

    #[cfg(test)]
    pub fn from_entries(entries: &[(&str, &str)]) -> Self {
        let mut map = HashMap::new();
        for (k, v) in entries {
            map.insert(k.to_string(), v.to_string());
        }
        Self { map }
    }
}

fn hostname() -> Option<String> {
    #[cfg(unix)]
    {
        if let Ok(raw) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if let Ok(raw) = std::fs::read_to_string("/etc/hostname") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}

fn os_release_field(field: &str) -> Option<String> {
    let content = std::fs::read_to_string("/etc/os-release").ok()?;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix(field).and_then(|l| l.strip_prefix('=')) {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

fn boot_time_unix() -> Option<i64> {
    let uptime = std::fs::read_to_string("/proc/uptime").ok()?;
    let seconds: f64 = uptime.split_whitespace().next()?.parse().ok()?;
    Some(chrono::Utc::now().timestamp() - seconds as i64)
}

/// Expand `$(key)` tokens in `input`. Scanning is greedy left-to-right and
/// non-nested; an unclosed `$(` is copied verbatim. Unresolvable tokens are
/// preserved with their delimiters. `warn` receives a message per failed
/// signed-URL callback; substitution continues regardless.
pub async fn expand(
    input: &str,
    store: &ParameterStore,
    facts: &SystemFacts,
    signer: &dyn UrlSigner,
    mut warn: impl FnMut(String),
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find(')') else {
            // Unclosed token: the remainder is literal.
            out.push_str(&rest[start..]);
            return out;
        };
        let key = &after[..end];
        let token = &rest[start..start + 2 + end + 1];

        if let Some(value) = store.get(key) {
            out.push_str(value);
        } else if let Some(value) = facts.get(key) {
            out.push_str(value);
        } else if key.starts_with("file://") {
            match signer.sign_url(key.trim_start_matches("file://")).await {
                Ok(url) => out.push_str(&url),
                Err(e) => {
                    warn(format!("Unable to sign URL for {key}: {e}"));
                    out.push_str(token);
                }
            }
        } else {
            out.push_str(token);
        }

        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};

    struct StaticSigner;

    #[async_trait::async_trait]
    impl UrlSigner for StaticSigner {
        async fn sign_url(&self, path: &str) -> Result<String> {
            Ok(format!("https://cdn.example.com/{path}?sig=abc"))
        }
    }

    struct FailingSigner;

    #[async_trait::async_trait]
    impl UrlSigner for FailingSigner {
        async fn sign_url(&self, _path: &str) -> Result<String> {
            Err(anyhow!("signer offline"))
        }
    }

    fn no_facts() -> SystemFacts {
        SystemFacts::from_entries(&[])
    }

    #[tokio::test]
    async fn test_user_parameters_substituted() {
        let store = ParameterStore::from_entries(&[("region", "eu-1"), ("tier", "prod")]);
        let out = expand(
            "host-$(region)-$(tier)",
            &store,
            &no_facts(),
            &StaticSigner,
            |_| {},
        )
        .await;
        assert_eq!(out, "host-eu-1-prod");
    }

    #[tokio::test]
    async fn test_user_parameters_win_over_facts() {
        let store = ParameterStore::from_entries(&[("sys.host", "override")]);
        let facts = SystemFacts::from_entries(&[("sys.host", "device-7")]);
        let out = expand("$(sys.host)", &store, &facts, &StaticSigner, |_| {}).await;
        assert_eq!(out, "override");
    }

    #[tokio::test]
    async fn test_facts_resolve_sys_tokens() {
        let facts = SystemFacts::from_entries(&[("sys.host", "device-7")]);
        let store = ParameterStore::default();
        let out = expand("name=$(sys.host)", &store, &facts, &StaticSigner, |_| {}).await;
        assert_eq!(out, "name=device-7");
    }

    #[tokio::test]
    async fn test_unknown_token_left_literal() {
        let store = ParameterStore::default();
        let out = expand("$(missing) stays", &store, &no_facts(), &StaticSigner, |_| {}).await;
        assert_eq!(out, "$(missing) stays");
    }

    #[tokio::test]
    async fn test_unclosed_token_copied_verbatim() {
        let store = ParameterStore::from_entries(&[("a", "1")]);
        let out = expand("x=$(a) y=$(broken", &store, &no_facts(), &StaticSigner, |_| {}).await;
        assert_eq!(out, "x=1 y=$(broken");
    }

    #[tokio::test]
    async fn test_file_token_produces_signed_url() {
        let store = ParameterStore::default();
        let out = expand(
            "src=$(file://images/base.img)",
            &store,
            &no_facts(),
            &StaticSigner,
            |_| {},
        )
        .await;
        assert_eq!(out, "src=https://cdn.example.com/images/base.img?sig=abc");
    }

    #[tokio::test]
    async fn test_failed_signing_warns_and_preserves_token() {
        let store = ParameterStore::default();
        let mut warnings = Vec::new();
        let out = expand(
            "src=$(file://x) next=$(file://y)",
            &store,
            &no_facts(),
            &FailingSigner,
            |w| warnings.push(w),
        )
        .await;
        // Both tokens preserved, substitution not aborted.
        assert_eq!(out, "src=$(file://x) next=$(file://y)");
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_secrets_merge_into_store_and_redaction_list() {
        use qbee_shared::config::{Parameter, ParametersBundle};
        let bundle = ParametersBundle {
            parameters: vec![Parameter {
                key: "user".to_string(),
                value: "svc".to_string(),
            }],
            secrets: vec![Parameter {
                key: "token".to_string(),
                value: "s3cret".to_string(),
            }],
            ..Default::default()
        };

        let store = ParameterStore::from_bundle(Some(&bundle));
        assert_eq!(store.get("user"), Some("svc"));
        assert_eq!(store.get("token"), Some("s3cret"));
        assert_eq!(store.secret_values(), ["s3cret"]);
    }
}
