//! Branch name resolution

/// Resolve `requested` against branches already in use
///
/// Returns `requested` when free, otherwise the first free of
/// `requested-1`, `requested-2`, ...
pub fn resolve_branch_name<S: AsRef<str>>(requested: &str, taken: &[S]) -> String {
    let is_taken = |candidate: &str| taken.iter().any(|t| t.as_ref() == candidate);

    if !is_taken(requested) {
        return requested.to_string();
    }

    (1u32..)
        .map(|n| format!("{requested}-{n}"))
        .find(|candidate| !is_taken(candidate))
        .unwrap_or_else(|| requested.to_string())
}

/// Directory name for a unit's worktree
pub fn worktree_dir_name(unit_id: &str) -> String {
    unit_id.replace(['/', '\\'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_free_name_is_kept() {
        let taken: [&str; 1] = ["main"];
        assert_eq!(resolve_branch_name("feature/auth", &taken), "feature/auth");
    }

    #[test]
    fn test_suffix_increments_until_free() {
        let taken = ["auth", "auth-1", "auth-2"];
        assert_eq!(resolve_branch_name("auth", &taken), "auth-3");
    }

    #[test]
    fn test_gap_in_suffixes_is_reused() {
        let taken = ["auth", "auth-2"];
        assert_eq!(resolve_branch_name("auth", &taken), "auth-1");
    }

    #[test]
    fn test_two_units_same_branch_differ_by_suffix() {
        let mut taken = vec!["main".to_string()];
        let first = resolve_branch_name("feature/x", &taken);
        taken.push(first.clone());
        let second = resolve_branch_name("feature/x", &taken);

        assert_eq!(first, "feature/x");
        assert_eq!(second, "feature/x-1");
        assert!(second.starts_with(&first));
        assert!(second[first.len()..].trim_start_matches('-').parse::<u32>().is_ok());
    }

    #[test]
    fn test_worktree_dir_name() {
        assert_eq!(worktree_dir_name("feature/auth"), "feature-auth");
    }

    proptest! {
        #[test]
        fn test_resolved_name_is_never_taken(
            base in "[a-z]{1,8}",
            suffixes in prop::collection::vec(0u32..6, 0..6),
        ) {
            let mut taken: Vec<String> = suffixes
                .iter()
                .map(|n| if *n == 0 { base.clone() } else { format!("{base}-{n}") })
                .collect();
            taken.push("main".to_string());

            let resolved = resolve_branch_name(&base, &taken);
            prop_assert!(!taken.contains(&resolved));
            prop_assert!(resolved.starts_with(&base));
        }
    }
}
