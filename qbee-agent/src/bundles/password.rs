use super::BundleContext;
use anyhow::{Context, Result};
use qbee_shared::config::PasswordBundle;
use std::path::Path;

const SHADOW_FILE: &str = "/etc/shadow";

/// Apply desired password hashes to shadow-file content. Returns the new
/// content and the names of users whose hash changed. Users present in the
/// desired list but absent from the file are ignored; so are lines that do
/// not look like login entries.
pub(crate) fn apply_hashes(
    content: &str,
    desired: &[(String, String)],
    today: i64,
) -> (String, Vec<String>) {
    let mut changed = Vec::new();
    let mut lines = Vec::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 9 || fields[0].is_empty() {
            lines.push(line.to_string());
            continue;
        }

        let username = fields[0];
        match desired.iter().find(|(name, _)| name == username) {
            Some((_, hash)) if fields[1] != hash => {
                let mut fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
                fields[1] = hash.clone();
                fields[2] = today.to_string();
                lines.push(fields.join(":"));
                changed.push(username.to_string());
            }
            _ => lines.push(line.to_string()),
        }
    }

    let mut out = lines.join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    (out, changed)
}

pub(crate) async fn execute(bundle: &PasswordBundle, ctx: &BundleContext<'_>) -> Result<()> {
    let mut desired = Vec::with_capacity(bundle.users.len());
    for user in &bundle.users {
        let username = ctx.resolve(&user.username).await;
        if username.is_empty() {
            continue;
        }
        desired.push((username, user.passwordhash.clone()));
    }
    if desired.is_empty() {
        return Ok(());
    }

    let shadow = Path::new(SHADOW_FILE);
    let content = std::fs::read_to_string(shadow).context("failed to read shadow file")?;
    let today = chrono::Utc::now().timestamp() / 86_400;
    let (updated, changed) = apply_hashes(&content, &desired, today);

    if changed.is_empty() {
        return Ok(());
    }

    write_shadow(shadow, &updated)?;
    for username in changed {
        ctx.reporter
            .info(format!("Successfully changed password for user {username}"));
    }
    Ok(())
}

fn write_shadow(shadow: &Path, content: &str) -> Result<()> {
    use std::io::Write;

    let tmp = shadow.with_file_name(".shadow.part");
    {
        let mut options = std::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o640);
        }
        let mut file = options
            .open(&tmp)
            .with_context(|| format!("failed to open {}", tmp.display()))?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, shadow).context("failed to replace shadow file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHADOW: &str = "\
root:$6$oldroothash:19000:0:99999:7:::
bin:*:18000:0:99999:7:::
bob:$6$oldbobhash:19100:0:99999:7:::
short:line
";

    fn desired(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(u, h)| (u.to_string(), h.to_string()))
            .collect()
    }

    #[test]
    fn test_changed_hash_is_replaced_and_dated() {
        let (out, changed) = apply_hashes(SHADOW, &desired(&[("bob", "$6$newhash")]), 20_000);
        assert_eq!(changed, vec!["bob"]);
        assert!(out.contains("bob:$6$newhash:20000:0:99999:7:::"));
        // Other entries untouched.
        assert!(out.contains("root:$6$oldroothash:19000:0:99999:7:::"));
    }

    #[test]
    fn test_matching_hash_is_left_alone() {
        let (out, changed) = apply_hashes(SHADOW, &desired(&[("bob", "$6$oldbobhash")]), 20_000);
        assert!(changed.is_empty());
        assert_eq!(out, SHADOW);
    }

    #[test]
    fn test_unlisted_device_user_is_ignored() {
        let (out, changed) = apply_hashes(SHADOW, &desired(&[("alice", "$6$x")]), 20_000);
        assert!(changed.is_empty());
        assert_eq!(out, SHADOW);
    }

    #[test]
    fn test_unrecognized_lines_pass_through() {
        let (out, _) = apply_hashes(SHADOW, &desired(&[("bob", "$6$new")]), 20_000);
        assert!(out.contains("short:line"));
    }

    #[test]
    fn test_multiple_users_changed_in_order() {
        let wanted = desired(&[("root", "$6$r2"), ("bob", "$6$b2")]);
        let (_, changed) = apply_hashes(SHADOW, &wanted, 20_000);
        assert_eq!(changed, vec!["root", "bob"]);
    }
}
