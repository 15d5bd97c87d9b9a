use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// One installed or installable package as seen by the device's package
/// manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub architecture: String,
}

/// Interface to the device's package-manager back-end (apt/yum/opkg). The
/// engine never implements one; the embedding daemon supplies it.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Short identifier, e.g. `deb` or `rpm`. Feeds `$(sys.pkg_type)`.
    fn pkg_type(&self) -> &str;

    /// Package file suffix handled by `install_local`, e.g. `.deb`.
    fn file_suffix(&self) -> &str;

    /// Architecture string as the package manager names it. Feeds
    /// `$(sys.pkg_arch)`.
    async fn package_architecture(&self) -> Result<String>;

    /// Whether another package operation currently holds the manager lock.
    async fn is_busy(&self) -> Result<bool>;

    /// Upgrade everything; returns the number of packages that changed.
    async fn upgrade_all(&self) -> Result<usize>;

    async fn list_packages(&self) -> Result<Vec<PackageInfo>>;

    /// Install from the configured repositories. An empty or `latest`
    /// version means "whatever the repository offers".
    async fn install(&self, name: &str, version: &str) -> Result<()>;

    /// Install a local package file.
    async fn install_local(&self, path: &Path) -> Result<()>;

    /// Read name/version/architecture out of a local package file without
    /// installing it.
    async fn parse_package_file(&self, path: &Path) -> Result<PackageInfo>;
}

/// Matches an installed package against a desired entry. An empty or
/// `latest` desired version matches any installed version.
pub fn is_installed(installed: &[PackageInfo], name: &str, version: &str) -> bool {
    installed.iter().any(|p| {
        p.name == name && (version.is_empty() || version == "latest" || p.version == version)
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scriptable fake used by executor tests.
    pub struct FakePackageManager {
        pub installed: Mutex<Vec<PackageInfo>>,
        pub busy: bool,
        pub upgraded: usize,
        pub install_calls: Mutex<Vec<(String, String)>>,
    }

    impl Default for FakePackageManager {
        fn default() -> Self {
            Self {
                installed: Mutex::new(Vec::new()),
                busy: false,
                upgraded: 0,
                install_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PackageManager for FakePackageManager {
        fn pkg_type(&self) -> &str {
            "deb"
        }

        fn file_suffix(&self) -> &str {
            ".deb"
        }

        async fn package_architecture(&self) -> Result<String> {
            Ok("amd64".to_string())
        }

        async fn is_busy(&self) -> Result<bool> {
            Ok(self.busy)
        }

        async fn upgrade_all(&self) -> Result<usize> {
            Ok(self.upgraded)
        }

        async fn list_packages(&self) -> Result<Vec<PackageInfo>> {
            Ok(self.installed.lock().unwrap().clone())
        }

        async fn install(&self, name: &str, version: &str) -> Result<()> {
            self.install_calls
                .lock()
                .unwrap()
                .push((name.to_string(), version.to_string()));
            self.installed.lock().unwrap().push(PackageInfo {
                name: name.to_string(),
                version: if version.is_empty() {
                    "1.0".to_string()
                } else {
                    version.to_string()
                },
                architecture: "amd64".to_string(),
            });
            Ok(())
        }

        async fn install_local(&self, path: &Path) -> Result<()> {
            let info = self.parse_package_file(path).await?;
            self.install_calls
                .lock()
                .unwrap()
                .push((info.name.clone(), info.version.clone()));
            self.installed.lock().unwrap().push(info);
            Ok(())
        }

        async fn parse_package_file(&self, path: &Path) -> Result<PackageInfo> {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (name, version) = stem.split_once('_').unwrap_or((stem.as_str(), "1.0"));
            Ok(PackageInfo {
                name: name.to_string(),
                version: version.to_string(),
                architecture: "amd64".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_installed_version_matching() {
        let installed = vec![PackageInfo {
            name: "curl".to_string(),
            version: "8.1".to_string(),
            architecture: "amd64".to_string(),
        }];

        assert!(is_installed(&installed, "curl", "8.1"));
        assert!(is_installed(&installed, "curl", ""));
        assert!(is_installed(&installed, "curl", "latest"));
        assert!(!is_installed(&installed, "curl", "8.2"));
        assert!(!is_installed(&installed, "wget", ""));
    }
}
