pub mod template;

use crate::api::{Client, UrlSigner};
use crate::params::{ParameterStore, SystemFacts, expand};
use crate::report::BundleReporter;
use anyhow::{Context, Result, bail, ensure};
use futures_util::StreamExt;
use md5::Md5;
use qbee_shared::files::{Digest, DigestAlgorithm, FileMetadata};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Headroom required on the destination filesystem beyond the bytes still
/// to be downloaded.
const SPARE_DISK_BYTES: u64 = 1024 * 1024;

const FILE_MODE: u32 = 0o640;
const DIR_MODE: u32 = 0o750;

/// Idempotently materializes remote or local files into their target paths
/// with verified contents, inherited ownership and bounded disk use. All
/// operations are safe to re-run.
pub struct FileManager<'a> {
    api: &'a Client,
    signer: &'a dyn UrlSigner,
    store: &'a ParameterStore,
    facts: &'a SystemFacts,
    cache_dir: PathBuf,
}

enum Source {
    /// `file://` URI on the local filesystem.
    Local(PathBuf),
    /// Control-plane file path.
    Api(String),
}

fn classify_source(src: &str) -> Source {
    match src.strip_prefix("file://") {
        Some(local) => Source::Local(PathBuf::from(local)),
        None => Source::Api(src.to_string()),
    }
}

impl<'a> FileManager<'a> {
    pub fn new(
        api: &'a Client,
        signer: &'a dyn UrlSigner,
        store: &'a ParameterStore,
        facts: &'a SystemFacts,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            signer,
            store,
            facts,
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub async fn resolve(&self, input: &str, reporter: &BundleReporter<'_>) -> String {
        expand(input, self.store, self.facts, self.signer, |w| {
            reporter.warn(w)
        })
        .await
    }

    /// Download `src` to the absolute path `dst` unless the destination
    /// already matches the expected checksum. Returns whether the
    /// destination was created or replaced.
    pub async fn download_file(
        &self,
        reporter: &BundleReporter<'_>,
        label: &str,
        src: &str,
        dst: &str,
        known: Option<FileMetadata>,
    ) -> Result<bool> {
        let src = self.resolve(src, reporter).await;
        let dst = self.resolve(dst, reporter).await;

        let created = self
            .download_resolved(&src, &dst, known)
            .await
            .with_context(|| format!("{label}: failed to download {src} to {dst}"))?;

        if created {
            reporter.info(format!("Successfully downloaded file {src} to {dst}"));
        }
        Ok(created)
    }

    /// Render the template `src` against `params` into the absolute path
    /// `dst`. The source is cached under the file-distribution cache; the
    /// comparison digest is computed over the rendered output.
    pub async fn download_template_file(
        &self,
        reporter: &BundleReporter<'_>,
        label: &str,
        src: &str,
        dst: &str,
        params: &HashMap<String, String>,
    ) -> Result<bool> {
        let src = self.resolve(src, reporter).await;
        let dst = self.resolve(dst, reporter).await;
        let dst_path = Path::new(&dst);
        ensure!(dst_path.is_absolute(), "destination {dst} is not absolute");

        let cached = self.template_cache_path(&src);
        let cached_str = cached.to_string_lossy().into_owned();
        self.download_resolved(&src, &cached_str, None)
            .await
            .with_context(|| format!("{label}: failed to fetch template {src}"))?;

        // Digest of what the render WOULD produce, streamed into the hasher.
        let mut hasher = DigestState::new(DigestAlgorithm::Sha256);
        {
            let source = std::fs::File::open(&cached)
                .with_context(|| format!("failed to open cached template {cached_str}"))?;
            template::render(std::io::BufReader::new(source), &mut hasher, params)
                .with_context(|| format!("{label}: failed to render template {src}"))?;
        }
        let rendered = Digest {
            algorithm: DigestAlgorithm::Sha256,
            hex: hasher.finalize_hex(),
        };

        if file_matches(dst_path, &rendered).await? {
            return Ok(false);
        }

        let partial = partial_path(dst_path)?;
        let owner = target_owner(dst_path);
        create_parent_dirs(dst_path)?;
        {
            let source = std::fs::File::open(&cached)
                .with_context(|| format!("failed to open cached template {cached_str}"))?;
            let mut out = open_for_write(&partial, false)?;
            template::render(std::io::BufReader::new(source), &mut out, params)?;
            out.sync_all()?;
        }
        apply_owner(&partial, owner)?;

        // Safety net against a template source changing mid-run.
        if !file_matches(&partial, &rendered).await? {
            let _ = std::fs::remove_file(&partial);
            bail!("{label}: rendered file digest mismatch for {dst}");
        }

        std::fs::rename(&partial, dst_path)
            .with_context(|| format!("failed to install {dst}"))?;
        reporter.info(format!("Successfully rendered template file {src} to {dst}"));
        Ok(true)
    }

    fn template_cache_path(&self, src: &str) -> PathBuf {
        let key = src.trim_start_matches("file://").trim_start_matches('/');
        self.cache_dir.join("file_distribution").join(key)
    }

    async fn download_resolved(
        &self,
        src: &str,
        dst: &str,
        known: Option<FileMetadata>,
    ) -> Result<bool> {
        let dst_path = Path::new(dst);
        ensure!(dst_path.is_absolute(), "destination {dst} is not absolute");

        let source = classify_source(src);
        let metadata = match known {
            Some(metadata) => metadata,
            None => match &source {
                Source::Api(path) => self
                    .api
                    .file_metadata(path)
                    .await
                    .with_context(|| format!("failed to fetch metadata for {src}"))?,
                Source::Local(path) => local_metadata(path).await?,
            },
        };
        let digest = metadata
            .digest()
            .with_context(|| format!("file metadata for {src} carries no checksum"))?;

        if file_matches(dst_path, &digest).await? {
            return Ok(false);
        }

        let partial = partial_path(dst_path)?;
        let offset = match tokio::fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        let owner = target_owner(dst_path);

        if let Some(size) = metadata.size {
            let avail = available_disk_bytes(&nearest_existing_dir(dst_path))?;
            let needed = size.saturating_sub(offset) + SPARE_DISK_BYTES;
            ensure!(
                needed <= avail,
                "not enough disk space for {dst}: need {needed} bytes, {avail} available"
            );
        }

        create_parent_dirs(dst_path)?;

        // A partial that already covers the full size skips straight to
        // verification.
        if metadata.size != Some(offset) || offset == 0 {
            let mut out = open_for_append(&partial).await?;
            match &source {
                Source::Api(path) => {
                    let response = self
                        .api
                        .open_file(path, offset)
                        .await
                        .with_context(|| format!("failed to open {src}"))?;
                    let mut stream = response.bytes_stream();
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk.with_context(|| format!("download of {src} failed"))?;
                        out.write_all(&chunk).await?;
                    }
                }
                Source::Local(path) => {
                    let mut reader = tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("failed to open {src}"))?;
                    reader.seek(std::io::SeekFrom::Start(offset)).await?;
                    tokio::io::copy(&mut reader, &mut out).await?;
                }
            }
            out.sync_all().await?;
        }
        apply_owner(&partial, owner)?;

        if !file_matches(&partial, &digest).await? {
            let _ = tokio::fs::remove_file(&partial).await;
            bail!("digest mismatch after downloading {src}");
        }

        tokio::fs::rename(&partial, dst_path)
            .await
            .with_context(|| format!("failed to install {dst}"))?;
        Ok(true)
    }
}

/// Hidden sibling used so the final install is a single rename.
fn partial_path(dst: &Path) -> Result<PathBuf> {
    let dir = dst.parent().context("destination has no parent directory")?;
    let name = dst
        .file_name()
        .context("destination has no file name")?
        .to_string_lossy();
    Ok(dir.join(format!(".{name}.part")))
}

/// `destination` pointing at an existing directory takes the source's base
/// name; a trailing separator on a path that does not exist is an error, as
/// is an empty destination.
pub fn resolve_destination_path(source: &str, destination: &str) -> Result<String> {
    if destination.is_empty() {
        bail!("destination path is empty");
    }

    let path = Path::new(destination);
    if path.is_dir() {
        let base = Path::new(source)
            .file_name()
            .with_context(|| format!("source {source} has no file name"))?;
        return Ok(path.join(base).to_string_lossy().into_owned());
    }
    if destination.ends_with('/') {
        bail!("destination directory {destination} does not exist");
    }
    Ok(destination.to_string())
}

enum DigestState {
    Sha256(Sha256),
    Md5(Md5),
}

impl DigestState {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => DigestState::Sha256(Sha256::new()),
            DigestAlgorithm::Md5 => DigestState::Md5(Md5::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            DigestState::Sha256(h) => h.update(bytes),
            DigestState::Md5(h) => h.update(bytes),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            DigestState::Sha256(h) => hex::encode(h.finalize()),
            DigestState::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

impl std::io::Write for DigestState {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Hex digest of a file, or `None` when it does not exist.
pub async fn file_digest_hex(
    path: &Path,
    algorithm: DigestAlgorithm,
) -> Result<Option<String>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to open {}", path.display())),
    };

    let mut reader = tokio::io::BufReader::new(file);
    let mut state = DigestState::new(algorithm);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        state.update(&buf[..n]);
    }
    Ok(Some(state.finalize_hex()))
}

/// Whether `path` already matches the metadata checksum. A missing file is
/// simply not ready.
pub async fn is_file_ready(path: &Path, metadata: &FileMetadata) -> Result<bool> {
    let digest = metadata
        .digest()
        .context("file metadata carries no checksum")?;
    file_matches(path, &digest).await
}

async fn file_matches(path: &Path, digest: &Digest) -> Result<bool> {
    match file_digest_hex(path, digest.algorithm).await? {
        Some(actual) => Ok(actual == digest.hex),
        None => Ok(false),
    }
}

async fn local_metadata(path: &Path) -> Result<FileMetadata> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("source file {} not found", path.display()))?;
    let sha256 = file_digest_hex(path, DigestAlgorithm::Sha256)
        .await?
        .with_context(|| format!("source file {} disappeared", path.display()))?;

    Ok(FileMetadata {
        sha256: Some(sha256),
        size: Some(meta.len()),
        ..Default::default()
    })
}

fn nearest_existing_dir(dst: &Path) -> PathBuf {
    let mut probe = dst.parent();
    while let Some(dir) = probe {
        if dir.is_dir() {
            return dir.to_path_buf();
        }
        probe = dir.parent();
    }
    PathBuf::from("/")
}

#[cfg(unix)]
fn available_disk_bytes(dir: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(dir)
        .with_context(|| format!("statvfs failed for {}", dir.display()))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
fn available_disk_bytes(_dir: &Path) -> Result<u64> {
    Ok(u64::MAX)
}

/// Destination ownership: an existing destination keeps its owner, else the
/// closest existing ancestor decides, else the agent's own identity.
#[cfg(unix)]
fn target_owner(dst: &Path) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;

    let mut probe = Some(dst);
    while let Some(path) = probe {
        if let Ok(meta) = std::fs::metadata(path) {
            return (meta.uid(), meta.gid());
        }
        probe = path.parent();
    }
    (
        nix::unistd::geteuid().as_raw(),
        nix::unistd::getegid().as_raw(),
    )
}

#[cfg(not(unix))]
fn target_owner(_dst: &Path) -> (u32, u32) {
    (0, 0)
}

#[cfg(unix)]
fn apply_owner(path: &Path, owner: (u32, u32)) -> Result<()> {
    use nix::unistd::{Gid, Uid, chown};

    match chown(
        path,
        Some(Uid::from_raw(owner.0)),
        Some(Gid::from_raw(owner.1)),
    ) {
        Ok(()) => Ok(()),
        // Unprivileged agents cannot give files away; the copy stays owned
        // by the agent user.
        Err(nix::errno::Errno::EPERM) if !Uid::effective().is_root() => {
            tracing::debug!("cannot chown {} to {}:{}", path.display(), owner.0, owner.1);
            Ok(())
        }
        Err(e) => {
            Err(e).with_context(|| format!("failed to chown {}", path.display()))
        }
    }
}

#[cfg(not(unix))]
fn apply_owner(_path: &Path, _owner: (u32, u32)) -> Result<()> {
    Ok(())
}

fn create_parent_dirs(dst: &Path) -> Result<()> {
    let parent = dst.parent().context("destination has no parent directory")?;
    if parent.is_dir() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder
        .create(parent)
        .with_context(|| format!("failed to create {}", parent.display()))
}

fn open_for_write(path: &Path, append: bool) -> Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.create(true).write(true);
    if append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(FILE_MODE);
    }
    options
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

async fn open_for_append(path: &Path) -> Result<tokio::fs::File> {
    let file = open_for_write(path, true)?;
    Ok(tokio::fs::File::from_std(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Reporter;

    struct NoSigner;

    static NO_SIGNER: NoSigner = NoSigner;

    #[async_trait::async_trait]
    impl UrlSigner for NoSigner {
        async fn sign_url(&self, path: &str) -> Result<String> {
            Ok(path.to_string())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        api: Client,
        store: ParameterStore,
        facts: SystemFacts,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            Self {
                _dir: dir,
                root,
                api: Client::with_http("http://127.0.0.1:1", reqwest::Client::new()),
                store: ParameterStore::default(),
                facts: SystemFacts::from_entries(&[]),
            }
        }

        fn manager(&self) -> FileManager<'_> {
            FileManager::new(
                &self.api,
                &NO_SIGNER,
                &self.store,
                &self.facts,
                self.root.join("cache"),
            )
        }

        fn write_source(&self, name: &str, content: &str) -> String {
            let path = self.root.join(name);
            std::fs::write(&path, content).unwrap();
            format!("file://{}", path.display())
        }

        fn dst(&self, name: &str) -> String {
            self.root.join(name).to_string_lossy().into_owned()
        }
    }

    #[tokio::test]
    async fn test_fresh_download_creates_and_reports() {
        let fx = Fixture::new();
        let reporter = Reporter::new("c1", false, vec![]);
        let bundle = reporter.bundle("file_distribution", "bc1");

        let src = fx.write_source("src.bin", "payload bytes");
        let dst = fx.dst("out.bin");

        let created = fx
            .manager()
            .download_file(&bundle, "files", &src, &dst, None)
            .await
            .unwrap();

        assert!(created);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "payload bytes");
        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].text,
            format!("Successfully downloaded file {src} to {dst}")
        );
    }

    #[tokio::test]
    async fn test_second_download_is_a_noop() {
        let fx = Fixture::new();
        let reporter = Reporter::new("c1", false, vec![]);
        let bundle = reporter.bundle("file_distribution", "bc1");

        let src = fx.write_source("src.bin", "payload bytes");
        let dst = fx.dst("out.bin");

        let manager = fx.manager();
        assert!(manager
            .download_file(&bundle, "files", &src, &dst, None)
            .await
            .unwrap());
        let mtime = std::fs::metadata(&dst).unwrap().modified().unwrap();

        let again = Reporter::new("c1", false, vec![]);
        let bundle_again = again.bundle("file_distribution", "bc1");
        assert!(!manager
            .download_file(&bundle_again, "files", &src, &dst, None)
            .await
            .unwrap());

        assert!(again.is_empty());
        assert_eq!(std::fs::metadata(&dst).unwrap().modified().unwrap(), mtime);
    }

    #[tokio::test]
    async fn test_resume_appends_to_partial() {
        let fx = Fixture::new();
        let reporter = Reporter::new("c1", false, vec![]);
        let bundle = reporter.bundle("file_distribution", "bc1");

        let content = "0123456789abcdef";
        let src = fx.write_source("src.bin", content);
        let dst = fx.dst("out.bin");

        // A torn earlier attempt left the first six bytes behind.
        std::fs::write(fx.root.join(".out.bin.part"), &content[..6]).unwrap();

        let created = fx
            .manager()
            .download_file(&bundle, "files", &src, &dst, None)
            .await
            .unwrap();

        assert!(created);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), content);
        assert!(!fx.root.join(".out.bin.part").exists());
    }

    #[tokio::test]
    async fn test_complete_partial_verifies_without_new_bytes() {
        let fx = Fixture::new();
        let reporter = Reporter::new("c1", false, vec![]);
        let bundle = reporter.bundle("file_distribution", "bc1");

        let content = "entire file already present";
        let src = fx.write_source("src.bin", content);
        let dst = fx.dst("out.bin");
        std::fs::write(fx.root.join(".out.bin.part"), content).unwrap();

        let created = fx
            .manager()
            .download_file(&bundle, "files", &src, &dst, None)
            .await
            .unwrap();

        assert!(created);
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), content);
    }

    #[tokio::test]
    async fn test_digest_mismatch_discards_partial() {
        let fx = Fixture::new();
        let reporter = Reporter::new("c1", false, vec![]);
        let bundle = reporter.bundle("file_distribution", "bc1");

        let src = fx.write_source("src.bin", "real content");
        let dst = fx.dst("out.bin");

        // Claim a checksum the download cannot produce.
        let known = FileMetadata {
            sha256: Some("00".repeat(32)),
            size: Some(12),
            ..Default::default()
        };

        let err = fx
            .manager()
            .download_file(&bundle, "files", &src, &dst, Some(known))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to download"));
        assert!(!fx.root.join(".out.bin.part").exists());
        assert!(!Path::new(&dst).exists());
    }

    #[tokio::test]
    async fn test_relative_destination_rejected() {
        let fx = Fixture::new();
        let reporter = Reporter::new("c1", false, vec![]);
        let bundle = reporter.bundle("file_distribution", "bc1");
        let src = fx.write_source("src.bin", "x");

        let err = fx
            .manager()
            .download_file(&bundle, "files", &src, "relative/out", None)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("not absolute"));
    }

    #[tokio::test]
    async fn test_template_renders_and_is_idempotent() {
        let fx = Fixture::new();
        let reporter = Reporter::new("c1", false, vec![]);
        let bundle = reporter.bundle("file_distribution", "bc1");

        let src = fx.write_source("app.conf.tmpl", "x={{a}}, y={{b}}, z={{c}}\n");
        let dst = fx.dst("app.conf");
        let params: HashMap<String, String> = [("a", "1"), ("b", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let manager = fx.manager();
        let created = manager
            .download_template_file(&bundle, "files", &src, &dst, &params)
            .await
            .unwrap();

        assert!(created);
        assert_eq!(
            std::fs::read_to_string(&dst).unwrap(),
            "x=1, y=2, z={{c}}\n"
        );
        let reports = reporter.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].text.starts_with("Successfully rendered template file"));

        // Re-running renders the same bytes and therefore does nothing.
        let again = Reporter::new("c1", false, vec![]);
        let bundle_again = again.bundle("file_distribution", "bc1");
        let created = manager
            .download_template_file(&bundle_again, "files", &src, &dst, &params)
            .await
            .unwrap();
        assert!(!created);
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_template_source_is_cached() {
        let fx = Fixture::new();
        let reporter = Reporter::new("c1", false, vec![]);
        let bundle = reporter.bundle("file_distribution", "bc1");

        let src = fx.write_source("app.conf.tmpl", "v={{v}}");
        let dst = fx.dst("app.conf");
        let params = HashMap::new();

        fx.manager()
            .download_template_file(&bundle, "files", &src, &dst, &params)
            .await
            .unwrap();

        let cached = fx
            .root
            .join("cache/file_distribution")
            .join(fx.root.strip_prefix("/").unwrap())
            .join("app.conf.tmpl");
        assert!(cached.exists(), "template source should be cached");
    }

    #[tokio::test]
    async fn test_is_file_ready_matches_by_best_digest() {
        let fx = Fixture::new();
        let path = fx.root.join("data");
        std::fs::write(&path, "content").unwrap();

        let sha256 = file_digest_hex(&path, DigestAlgorithm::Sha256)
            .await
            .unwrap()
            .unwrap();
        let meta = FileMetadata {
            md5: "definitely-wrong".to_string(),
            sha256: Some(sha256),
            ..Default::default()
        };
        // sha256 wins over the (wrong) md5.
        assert!(is_file_ready(&path, &meta).await.unwrap());

        let md5 = file_digest_hex(&path, DigestAlgorithm::Md5)
            .await
            .unwrap()
            .unwrap();
        let meta = FileMetadata {
            md5,
            ..Default::default()
        };
        assert!(is_file_ready(&path, &meta).await.unwrap());

        assert!(!is_file_ready(&fx.root.join("missing"), &meta).await.unwrap());
    }

    #[test]
    fn test_resolve_destination_path_rules() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_string_lossy().into_owned();

        // Existing directory: append the source base name.
        let resolved = resolve_destination_path("conf/app.conf", &dir_str).unwrap();
        assert_eq!(resolved, format!("{dir_str}/app.conf"));

        // Plain file path passes through.
        let file = format!("{dir_str}/out.txt");
        assert_eq!(resolve_destination_path("a/b", &file).unwrap(), file);

        // Trailing separator on a missing directory is an error.
        assert!(resolve_destination_path("a/b", &format!("{dir_str}/missing/")).is_err());

        // Empty destination is an error.
        assert!(resolve_destination_path("a/b", "").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_installed_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let fx = Fixture::new();
        let reporter = Reporter::new("c1", false, vec![]);
        let bundle = reporter.bundle("file_distribution", "bc1");

        let src = fx.write_source("src.bin", "content");
        let dst = fx.dst("sub/dir/out.bin");
        fx.manager()
            .download_file(&bundle, "files", &src, &dst, None)
            .await
            .unwrap();

        let mode = std::fs::metadata(&dst).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
        let dir_mode = std::fs::metadata(fx.root.join("sub")).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o750);
    }
}
