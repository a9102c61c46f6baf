//! Resolution of named local checks into shell commands.

/// Build files found at the root of the working directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectMarkers {
    pub flutter: bool,
    pub node: bool,
    pub cargo: bool,
    pub justfile: bool,
    pub makefile: bool,
}

/// What a configured check name means for this project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCheck {
    Shell(String),
    Noop,
    /// A recognized name with no matching project; carries the explanation.
    Unresolvable(String),
}

pub const ANALYZE: &str = "analyze";
pub const UNIT_TEST: &str = "unitTest";
pub const GENERIC_TEST: &str = "genericTest";
pub const NOOP: &str = "noop";

pub fn resolve_check(name: &str, markers: &ProjectMarkers) -> ResolvedCheck {
    match name {
        NOOP => ResolvedCheck::Noop,
        ANALYZE => analyze_command(markers)
            .map(|cmd| ResolvedCheck::Shell(cmd.to_string()))
            .unwrap_or_else(|| unresolvable(name)),
        UNIT_TEST => unit_test_command(markers)
            .map(|cmd| ResolvedCheck::Shell(cmd.to_string()))
            .unwrap_or_else(|| unresolvable(name)),
        GENERIC_TEST => {
            if markers.justfile {
                ResolvedCheck::Shell("just test".to_string())
            } else if markers.makefile {
                ResolvedCheck::Shell("make test".to_string())
            } else {
                unit_test_command(markers)
                    .map(|cmd| ResolvedCheck::Shell(cmd.to_string()))
                    .unwrap_or_else(|| unresolvable(name))
            }
        }
        other => ResolvedCheck::Shell(other.to_string()),
    }
}

fn analyze_command(markers: &ProjectMarkers) -> Option<&'static str> {
    if markers.flutter {
        Some("flutter analyze --no-pub")
    } else if markers.node {
        Some("npm run lint")
    } else if markers.cargo {
        Some("cargo clippy --all-targets -- -D warnings")
    } else {
        None
    }
}

fn unit_test_command(markers: &ProjectMarkers) -> Option<&'static str> {
    if markers.flutter {
        Some("flutter test")
    } else if markers.node {
        Some("npm test")
    } else if markers.cargo {
        Some("cargo test")
    } else {
        None
    }
}

fn unresolvable(name: &str) -> ResolvedCheck {
    ResolvedCheck::Unresolvable(format!(
        "check '{name}' needs a pubspec.yaml, package.json or Cargo.toml in the working directory"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flutter_project_resolves_known_names() {
        let markers = ProjectMarkers {
            flutter: true,
            ..ProjectMarkers::default()
        };
        assert_eq!(
            resolve_check(ANALYZE, &markers),
            ResolvedCheck::Shell("flutter analyze --no-pub".to_string())
        );
        assert_eq!(
            resolve_check(UNIT_TEST, &markers),
            ResolvedCheck::Shell("flutter test".to_string())
        );
        assert_eq!(
            resolve_check(GENERIC_TEST, &markers),
            ResolvedCheck::Shell("flutter test".to_string())
        );
    }

    #[test]
    fn generic_test_prefers_task_runners() {
        let markers = ProjectMarkers {
            node: true,
            makefile: true,
            ..ProjectMarkers::default()
        };
        assert_eq!(
            resolve_check(GENERIC_TEST, &markers),
            ResolvedCheck::Shell("make test".to_string())
        );
    }

    #[test]
    fn unknown_names_are_literal_commands() {
        let markers = ProjectMarkers::default();
        assert_eq!(
            resolve_check("./scripts/lint.sh --strict", &markers),
            ResolvedCheck::Shell("./scripts/lint.sh --strict".to_string())
        );
        assert_eq!(resolve_check(NOOP, &markers), ResolvedCheck::Noop);
    }

    #[test]
    fn known_name_without_project_is_unresolvable() {
        match resolve_check(ANALYZE, &ProjectMarkers::default()) {
            ResolvedCheck::Unresolvable(msg) => assert!(msg.contains("analyze")),
            other => panic!("expected unresolvable, got {other:?}"),
        }
    }
}
