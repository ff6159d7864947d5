//! Repository identity: normalizing a Git remote's origin URL so the same
//! logical repository hashes to the same `repo_id` regardless of how a given
//! clone spells its remote (SSH vs HTTPS, trailing `.git`, case of host).

/// Normalizes a Git origin URL for stable hashing into `repo_id`
/// (spec.md §3.1).
///
/// Handles the two URL shapes `git` clones actually use:
/// - SSH: `git@github.com:owner/repo.git`
/// - HTTPS: `https://github.com/owner/repo.git`
///
/// Output is always `<lowercase-host>/<owner>/<repo>` with any `.git` suffix
/// and credentials stripped, so `git@github.com:acme/widgets.git` and
/// `https://github.com/acme/widgets` normalize identically.
pub fn normalize_origin_url(origin: &str) -> String {
    let trimmed = origin.trim();

    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .or_else(|| trimmed.strip_prefix("ssh://"))
        .unwrap_or(trimmed);

    // scp-like syntax: user@host:path
    let rest = if let Some(at_pos) = without_scheme.find('@') {
        let after_at = &without_scheme[at_pos + 1..];
        if let Some(colon_pos) = after_at.find(':') {
            if !after_at[..colon_pos].contains('/') {
                format!("{}/{}", &after_at[..colon_pos], &after_at[colon_pos + 1..])
            } else {
                after_at.to_string()
            }
        } else {
            after_at.to_string()
        }
    } else {
        without_scheme.to_string()
    };

    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    rest.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_ssh_and_https_to_same_value() {
        let ssh = normalize_origin_url("git@github.com:acme/widgets.git");
        let https = normalize_origin_url("https://github.com/acme/widgets.git");
        assert_eq!(ssh, https);
        assert_eq!(ssh, "github.com/acme/widgets");
    }

    #[test]
    fn strips_trailing_slash() {
        assert_eq!(
            normalize_origin_url("https://github.com/acme/widgets/"),
            "github.com/acme/widgets"
        );
    }

    #[test]
    fn lowercases_host_and_path() {
        assert_eq!(
            normalize_origin_url("https://GitHub.com/Acme/Widgets.git"),
            "github.com/acme/widgets"
        );
    }

    #[test]
    fn handles_ssh_protocol_scheme() {
        assert_eq!(
            normalize_origin_url("ssh://git@github.com/acme/widgets.git"),
            "github.com/acme/widgets"
        );
    }
}
