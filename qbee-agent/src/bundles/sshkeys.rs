use super::BundleContext;
use super::users::read_passwd;
use anyhow::{Context, Result};
use qbee_shared::config::SshKeysBundle;
use std::path::Path;

/// Desired authorized_keys content: one key per line, newline-terminated,
/// empty when no keys are configured.
fn render_keys(keys: &[String]) -> String {
    let mut out = String::new();
    for key in keys {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.push_str(key);
        out.push('\n');
    }
    out
}

pub(crate) async fn execute(bundle: &SshKeysBundle, ctx: &BundleContext<'_>) -> Result<()> {
    let accounts = read_passwd()?;

    for entry in &bundle.users {
        let username = ctx.resolve(&entry.username).await;
        if username.is_empty() {
            continue;
        }

        let Some(account) = accounts.iter().find(|u| u.name == username) else {
            ctx.reporter
                .err(format!("Unable to configure SSH keys for unknown user {username}"));
            continue;
        };

        let ssh_dir = Path::new(&account.home).join(".ssh");
        let keys_file = ssh_dir.join("authorized_keys");
        let desired = render_keys(&entry.keys);

        let current = std::fs::read_to_string(&keys_file).unwrap_or_default();
        if current == desired {
            continue;
        }

        if let Err(e) = install_keys(&ssh_dir, &keys_file, &desired, account.uid, account.gid) {
            ctx.reporter
                .err(format!("Unable to configure SSH keys for user {username}: {e:#}"));
            continue;
        }
        ctx.reporter
            .info(format!("Configured SSH keys for user {username}"));
    }

    Ok(())
}

fn install_keys(
    ssh_dir: &Path,
    keys_file: &Path,
    content: &str,
    uid: u32,
    gid: u32,
) -> Result<()> {
    if !ssh_dir.is_dir() {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(ssh_dir)
            .with_context(|| format!("failed to create {}", ssh_dir.display()))?;
        set_owner(ssh_dir, uid, gid)?;
    }

    let tmp = ssh_dir.join(".authorized_keys.part");
    {
        use std::io::Write;
        let mut options = std::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&tmp)
            .with_context(|| format!("failed to open {}", tmp.display()))?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    set_owner(&tmp, uid, gid)?;
    std::fs::rename(&tmp, keys_file)
        .with_context(|| format!("failed to install {}", keys_file.display()))?;
    Ok(())
}

#[cfg(unix)]
fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    use nix::unistd::{Gid, Uid, chown};

    match chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EPERM) if !Uid::effective().is_root() => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to chown {}", path.display())),
    }
}

#[cfg(not(unix))]
fn set_owner(_path: &Path, _uid: u32, _gid: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_keys_one_per_line() {
        let keys = vec![
            "ssh-ed25519 AAAA key-one".to_string(),
            "  ssh-rsa BBBB key-two  ".to_string(),
            String::new(),
        ];
        assert_eq!(
            render_keys(&keys),
            "ssh-ed25519 AAAA key-one\nssh-rsa BBBB key-two\n"
        );
    }

    #[test]
    fn test_render_no_keys_is_empty() {
        assert_eq!(render_keys(&[]), "");
    }

    #[cfg(unix)]
    #[test]
    fn test_install_keys_creates_dir_and_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let home = tempfile::tempdir().unwrap();
        let ssh_dir = home.path().join(".ssh");
        let keys_file = ssh_dir.join("authorized_keys");
        let uid = nix::unistd::geteuid().as_raw();
        let gid = nix::unistd::getegid().as_raw();

        install_keys(&ssh_dir, &keys_file, "ssh-ed25519 AAAA\n", uid, gid).unwrap();

        assert_eq!(
            std::fs::read_to_string(&keys_file).unwrap(),
            "ssh-ed25519 AAAA\n"
        );
        let dir_mode = std::fs::metadata(&ssh_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = std::fs::metadata(&keys_file).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
