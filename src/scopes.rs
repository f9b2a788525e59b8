//! Scope derivation from provider group membership.
//!
//! The scope engine is a pure function: given the set of group names the
//! upstream provider reported and the deployment's `group_mapping`, it
//! returns the scopes whose configured group list intersects the input.
//! Two synthetic scopes overlay the mapping and never come from it:
//! `user:token` on every authenticated session, and `admin:token` when the
//! username is in the admin table at authentication time.

use std::collections::{BTreeMap, BTreeSet};

/// Scope granting a user control over their own tokens. Carried by every
/// authenticated session.
pub const USER_TOKEN_SCOPE: &str = "user:token";

/// Scope granting control over all tokens and the admin list.
pub const ADMIN_TOKEN_SCOPE: &str = "admin:token";

/// GitHub-imposed maximum length of a synthesized group name.
const GITHUB_GROUP_MAX_LEN: usize = 32;

/// Return every scope whose configured group list intersects `groups`.
pub fn scopes_from_groups(
    groups: &[String],
    mapping: &BTreeMap<String, Vec<String>>,
) -> BTreeSet<String> {
    mapping
        .iter()
        .filter(|(_, members)| members.iter().any(|m| groups.contains(m)))
        .map(|(scope, _)| scope.clone())
        .collect()
}

/// Full scope set for a new session: the mapped scopes plus the synthetic
/// overlays.
pub fn session_scopes(
    groups: &[String],
    mapping: &BTreeMap<String, Vec<String>>,
    is_admin: bool,
) -> BTreeSet<String> {
    let mut scopes = scopes_from_groups(groups, mapping);
    scopes.insert(USER_TOKEN_SCOPE.to_string());
    if is_admin {
        scopes.insert(ADMIN_TOKEN_SCOPE.to_string());
    }
    scopes
}

/// Synthesize a group name from a GitHub organization and team slug.
///
/// The name is `<org>-<slug>` truncated to 32 characters. Slugs are
/// lowercase ASCII with hyphens, so the cut always lands on a character
/// boundary; a trailing hyphen left by the cut is trimmed.
pub fn github_group(organization: &str, team_slug: &str) -> String {
    let mut group = format!("{}-{}", organization, team_slug);
    if group.len() > GITHUB_GROUP_MAX_LEN {
        group.truncate(GITHUB_GROUP_MAX_LEN);
        while group.ends_with('-') {
            group.pop();
        }
    }
    group
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(scope, groups)| {
                (
                    scope.to_string(),
                    groups.iter().map(|g| g.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn derivation_matches_on_any_group() {
        let mapping = mapping(&[
            ("exec:admin", &["lsst-sqre-square"]),
            ("read:all", &["lsst-sqre-square", "other-team"]),
            ("write:all", &["unrelated"]),
        ]);
        let groups = vec!["lsst-sqre-square".to_string()];
        let scopes = scopes_from_groups(&groups, &mapping);
        assert_eq!(
            scopes.into_iter().collect::<Vec<_>>(),
            vec!["exec:admin", "read:all"]
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        let mapping = mapping(&[("read:all", &["g1", "g2"])]);
        let groups = vec!["g2".to_string(), "g1".to_string()];
        assert_eq!(
            scopes_from_groups(&groups, &mapping),
            scopes_from_groups(&groups, &mapping)
        );
    }

    #[test]
    fn session_scopes_overlay_synthetics() {
        let mapping = mapping(&[("read:all", &["g1"])]);
        let scopes = session_scopes(&["g1".to_string()], &mapping, false);
        assert!(scopes.contains(USER_TOKEN_SCOPE));
        assert!(!scopes.contains(ADMIN_TOKEN_SCOPE));

        let scopes = session_scopes(&[], &mapping, true);
        assert!(scopes.contains(ADMIN_TOKEN_SCOPE));
        assert!(!scopes.contains("read:all"));
    }

    #[test]
    fn github_group_truncates_without_trailing_hyphen() {
        assert_eq!(github_group("lsst-sqre", "square"), "lsst-sqre-square");
        let group = github_group("a-very-long-organization", "team-with-long-name");
        assert!(group.len() <= 32);
        assert!(!group.ends_with('-'));
    }
}
