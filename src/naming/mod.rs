//! Deterministic derivation of preview ids, database names, container names,
//! and external hostnames. Pure functions, no I/O.

use rand::Rng;

/// Maximum length (bytes) of a derived preview id. DNS-label-safe.
const MAX_PREVIEW_ID_BYTES: usize = 63;

/// The two ways a preview can be addressed by its triggering event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewKind {
    PullRequest,
    Branch,
}

/// Lowercase, replace any byte outside `[a-z0-9-_]` with `-`, trim leading
/// and trailing `-`, then truncate to `MAX_PREVIEW_ID_BYTES` bytes.
fn sanitize(input: &str) -> String {
    let lowered = input.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    truncate_bytes(trimmed, MAX_PREVIEW_ID_BYTES)
}

/// Truncate to at most `max` bytes without splitting a UTF-8 code point.
fn truncate_bytes(input: &str, max: usize) -> String {
    if input.len() <= max {
        return input.to_string();
    }
    let mut end = max;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    input[..end].to_string()
}

/// Derive the canonical preview id.
///
/// - `kind=PullRequest` -> `"pr-<N>"`.
/// - `kind=Branch` -> `"branch-<sanitized-branch>"`.
pub fn preview_id(kind: PreviewKind, pr: Option<i64>, branch: &str) -> String {
    match kind {
        PreviewKind::PullRequest => {
            let n = pr.expect("pullRequestNumber required for kind=pull_request");
            sanitize(&format!("pr-{n}"))
        }
        PreviewKind::Branch => sanitize(&format!("branch-{branch}")),
    }
}

/// `<preview_id>` with `-` replaced by `_`, suffixed `_db`.
pub fn database_name(preview_id: &str) -> String {
    format!("{}_db", preview_id.replace('-', "_"))
}

/// `<previewId>-<sanitized-service>-<randHex8>`. The random suffix ensures a
/// fresh container name across redeploys so old containers can be removed
/// asynchronously without a name clash.
pub fn container_name(preview_id: &str, service: &str) -> String {
    let suffix = random_hex8();
    format!("{preview_id}-{}-{suffix}", sanitize(service))
}

fn random_hex8() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 4] = rng.random();
    hex::encode(bytes)
}

/// Sanitizes a string for use as a Traefik router/middleware/service name,
/// which (unlike a hostname) must not contain dots.
pub fn sanitize_router_name(input: &str) -> String {
    sanitize(input).replace('.', "-")
}

/// `<previewId>-<sanitized-owner>.<sanitized-service>.<baseDomain>`.
pub fn external_host(preview_id: &str, repo_owner: &str, service: &str, base_domain: &str) -> String {
    format!(
        "{preview_id}-{}.{}.{base_domain}",
        sanitize(repo_owner),
        sanitize(service)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_id_pull_request() {
        assert_eq!(preview_id(PreviewKind::PullRequest, Some(42), ""), "pr-42");
    }

    #[test]
    fn preview_id_branch() {
        assert_eq!(preview_id(PreviewKind::Branch, None, "main"), "branch-main");
    }

    #[test]
    fn preview_id_branch_sanitizes_slashes_and_case() {
        assert_eq!(
            preview_id(PreviewKind::Branch, None, "Feature/Foo_Bar"),
            "branch-feature-foo_bar"
        );
    }

    #[test]
    fn preview_id_trims_leading_trailing_dashes() {
        assert_eq!(preview_id(PreviewKind::Branch, None, "///weird///"), "branch");
    }

    #[test]
    fn preview_id_truncates_to_63_bytes_even_for_pathological_input() {
        let branch = "x".repeat(500);
        let id = preview_id(PreviewKind::Branch, None, &branch);
        assert!(id.len() <= MAX_PREVIEW_ID_BYTES);
        assert_eq!(id.len(), MAX_PREVIEW_ID_BYTES);
        assert!(id.starts_with("branch-"));
    }

    #[test]
    fn preview_id_truncation_does_not_split_multibyte_char() {
        // Non-ASCII input sanitizes to '-' per byte anyway, but guard against
        // panics on boundary math regardless.
        let branch = "café".repeat(40);
        let id = preview_id(PreviewKind::Branch, None, &branch);
        assert!(id.len() <= MAX_PREVIEW_ID_BYTES);
    }

    #[test]
    fn database_name_replaces_dashes() {
        assert_eq!(database_name("pr-42"), "pr_42_db");
        assert_eq!(database_name("branch-main"), "branch_main_db");
    }

    #[test]
    fn container_name_has_random_suffix_and_is_unique_across_calls() {
        let a = container_name("pr-42", "api");
        let b = container_name("pr-42", "api");
        assert!(a.starts_with("pr-42-api-"));
        assert_ne!(a, b);
        assert_eq!(a.len(), "pr-42-api-".len() + 8);
    }

    #[test]
    fn container_name_sanitizes_service() {
        let name = container_name("pr-1", "My Service!");
        assert!(name.starts_with("pr-1-my-service-"));
    }

    #[test]
    fn external_host_format() {
        assert_eq!(
            external_host("pr-42", "acme", "api", "preview.test"),
            "pr-42-acme.api.preview.test"
        );
    }

    #[test]
    fn external_host_sanitizes_owner_and_service() {
        assert_eq!(
            external_host("branch-main", "Acme Inc", "Web UI", "preview.test"),
            "branch-main-acme-inc.web-ui.preview.test"
        );
    }

    #[test]
    fn preview_id_is_injective_over_small_sample_domain() {
        let samples = vec![
            preview_id(PreviewKind::PullRequest, Some(1), ""),
            preview_id(PreviewKind::PullRequest, Some(2), ""),
            preview_id(PreviewKind::Branch, None, "main"),
            preview_id(PreviewKind::Branch, None, "dev"),
            preview_id(PreviewKind::Branch, None, "1"),
        ];
        for (i, a) in samples.iter().enumerate() {
            for (j, b) in samples.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "collision between {:?} and {:?}", a, b);
                }
            }
        }
    }
}
