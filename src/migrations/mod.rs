// ABOUTME: Local migration discovery and ordering
// ABOUTME: Migrations are site archive directories or registered scripts, sorted by collation of their ids

pub mod bootstrap;
pub mod engine;
pub mod lifecycle;

use anyhow::{Context, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::ToolkitError;

pub use engine::{migrate, FailurePolicy, MigrateOptions, MigrationProject, MigrationReport};
pub use lifecycle::{MigrationContext, MigrationLifecycle, MigrationScript, NoopLifecycle};

pub const NOTES_FILE: &str = "README.md";

#[derive(Clone)]
pub enum Migration {
    /// Directory imported verbatim as a site archive.
    Archive { id: String, path: PathBuf },
    Script {
        id: String,
        script: Arc<dyn MigrationScript>,
    },
}

impl Migration {
    pub fn id(&self) -> &str {
        match self {
            Migration::Archive { id, .. } | Migration::Script { id, .. } => id,
        }
    }

    pub fn notes(&self) -> Option<String> {
        match self {
            Migration::Archive { path, .. } => std::fs::read_to_string(path.join(NOTES_FILE))
                .ok()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            Migration::Script { script, .. } => script.notes(),
        }
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Migration::Archive { id, path } => f
                .debug_struct("Archive")
                .field("id", id)
                .field("path", path)
                .finish(),
            Migration::Script { id, .. } => f.debug_struct("Script").field("id", id).finish(),
        }
    }
}

/// Script migrations by id, supplied by the project.
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: BTreeMap<String, Arc<dyn MigrationScript>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &str, script: impl MigrationScript + 'static) {
        self.scripts.insert(id.to_string(), Arc::new(script));
    }

    pub fn with(mut self, id: &str, script: impl MigrationScript + 'static) -> Self {
        self.register(id, script);
        self
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

pub fn compile_excludes(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| {
                anyhow::Error::from(ToolkitError::Validation(format!(
                    "invalid exclude pattern {:?}: {}",
                    p, e
                )))
            })
        })
        .collect()
}

/// Directories under `dir` plus registered scripts, minus excludes, in
/// application order. A missing directory contributes nothing.
pub fn collect_migrations(
    dir: &Path,
    scripts: &ScriptRegistry,
    exclude: &[Regex],
) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();
    if dir.is_dir() {
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("Failed to read {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().is_dir() {
                migrations.push(Migration::Archive {
                    id: name,
                    path: entry.into_path(),
                });
            } else {
                debug!("Ignoring {} in migrations directory", name);
            }
        }
    } else {
        debug!("No migrations directory at {}", dir.display());
    }

    for (id, script) in &scripts.scripts {
        if migrations.iter().any(|m| m.id() == id.as_str()) {
            return Err(ToolkitError::Validation(format!(
                "migration {} is both a directory and a registered script",
                id
            ))
            .into());
        }
        migrations.push(Migration::Script {
            id: id.clone(),
            script: Arc::clone(script),
        });
    }

    migrations.retain(|m| {
        let excluded = exclude.iter().any(|re| re.is_match(m.id()));
        if excluded {
            debug!("Excluding migration {}", m.id());
        }
        !excluded
    });
    migrations.sort_by(|a, b| locale_compare(a.id(), b.id()));
    Ok(migrations)
}

/// Punctuation in collation order.
const PUNCTUATION: &str = "_-,;:!?.'\"()[]{}@*/\\&#%`^+<=>|~$";

/// Accented Latin letters and the base letter they sort with.
const LATIN_FOLDS: &[(char, &str)] = &[
    ('a', "àáâãäåāăą"),
    ('c', "çćĉċč"),
    ('d', "ďđ"),
    ('e', "èéêëēĕėęě"),
    ('g', "ĝğġģ"),
    ('h', "ĥħ"),
    ('i', "ìíîïĩīĭįı"),
    ('j', "ĵ"),
    ('k', "ķ"),
    ('l', "ĺļľŀł"),
    ('n', "ñńņňŉ"),
    ('o', "òóôõöøōŏő"),
    ('r', "ŕŗř"),
    ('s', "śŝşš"),
    ('t', "ţťŧ"),
    ('u', "ùúûüũūŭůűų"),
    ('w', "ŵ"),
    ('y', "ýÿŷ"),
    ('z', "źżž"),
];

fn base_letter(lower: char) -> Option<char> {
    LATIN_FOLDS
        .iter()
        .find(|(_, accented)| accented.contains(lower))
        .map(|(base, _)| *base)
}

fn primary_weight(c: char) -> (u8, u32) {
    if c.is_whitespace() {
        (0, c as u32)
    } else if let Some(i) = PUNCTUATION.find(c) {
        (1, i as u32)
    } else if c.is_numeric() {
        (3, c.to_digit(10).unwrap_or(c as u32))
    } else if c.is_alphabetic() {
        let lower = c.to_lowercase().next().unwrap_or(c);
        (4, base_letter(lower).unwrap_or(lower) as u32)
    } else {
        (2, c as u32)
    }
}

fn is_accented(c: char) -> bool {
    base_letter(c.to_lowercase().next().unwrap_or(c)).is_some()
}

/// Orders ids the way a root-locale string comparison does: whitespace and
/// punctuation before digits before letters, letters case-insensitively with
/// lowercase first on ties. Accented Latin letters sort with their base
/// letter, after it on ties; other scripts sort by code point after Latin.
/// Digits compare one by one, not numerically. Remaining ties fall back to
/// bytes so the order is total.
pub fn locale_compare(a: &str, b: &str) -> Ordering {
    a.chars()
        .map(primary_weight)
        .cmp(b.chars().map(primary_weight))
        .then_with(|| a.chars().map(is_accented).cmp(b.chars().map(is_accented)))
        .then_with(|| {
            a.chars()
                .map(char::is_uppercase)
                .cmp(b.chars().map(char::is_uppercase))
        })
        .then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proptest::prelude::*;

    struct Noop;

    #[async_trait]
    impl MigrationScript for Noop {
        async fn run(&self, _ctx: &MigrationContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn sorted(ids: &[&str]) -> Vec<String> {
        let mut ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        ids.sort_by(|a, b| locale_compare(a, b));
        ids
    }

    #[test]
    fn test_collation_order() {
        assert_eq!(
            sorted(&["b", "B", "a", "10_x", "9_x", "_setup", "A"]),
            vec!["_setup", "10_x", "9_x", "a", "A", "b", "B"]
        );
        assert_eq!(
            sorted(&["2023_b", "2023-a", "2023_a"]),
            vec!["2023_a", "2023_b", "2023-a"]
        );
    }

    #[test]
    fn test_accented_letters_sort_with_base_letter() {
        assert_eq!(
            sorted(&["z_a", "é_b", "f_a", "e_b", "É_b"]),
            vec!["e_b", "é_b", "É_b", "f_a", "z_a"]
        );
        assert_eq!(sorted(&["über", "uber", "vat"]), vec!["uber", "über", "vat"]);
    }

    #[test]
    fn test_collect_migrations() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["20230102_prefs", "20230101_meta", "skip_me", ".git"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("20230101_meta/README.md"), "Adds metadata\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let scripts = ScriptRegistry::new().with("20230101_a_script", Noop);
        let exclude = compile_excludes(&["^skip_".to_string()]).unwrap();

        let migrations = collect_migrations(dir.path(), &scripts, &exclude).unwrap();
        let ids: Vec<&str> = migrations.iter().map(Migration::id).collect();
        assert_eq!(ids, vec!["20230101_a_script", "20230101_meta", "20230102_prefs"]);
        assert_eq!(migrations[1].notes().as_deref(), Some("Adds metadata"));
        assert!(matches!(migrations[0], Migration::Script { .. }));
    }

    #[test]
    fn test_duplicate_script_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("m1")).unwrap();
        let scripts = ScriptRegistry::new().with("m1", Noop);
        assert!(collect_migrations(dir.path(), &scripts, &[]).is_err());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let migrations =
            collect_migrations(&dir.path().join("absent"), &ScriptRegistry::new(), &[]).unwrap();
        assert!(migrations.is_empty());
    }

    #[test]
    fn test_bad_exclude_pattern() {
        assert!(compile_excludes(&["(".to_string()]).is_err());
    }

    proptest! {
        #[test]
        fn test_collation_is_a_total_order(a in "[ -~]{0,8}", b in "[ -~]{0,8}", c in "[ -~]{0,8}") {
            prop_assert_eq!(locale_compare(&a, &b), locale_compare(&b, &a).reverse());
            prop_assert_eq!(locale_compare(&a, &b) == Ordering::Equal, a == b);
            if locale_compare(&a, &b) != Ordering::Greater && locale_compare(&b, &c) != Ordering::Greater {
                prop_assert_ne!(locale_compare(&a, &c), Ordering::Greater);
            }
        }

        #[test]
        fn test_sort_independent_of_input_order(mut ids in proptest::collection::vec("[a-zA-Z0-9_-]{1,6}", 0..12)) {
            let mut forward = ids.clone();
            forward.sort_by(|a, b| locale_compare(a, b));
            ids.reverse();
            ids.sort_by(|a, b| locale_compare(a, b));
            prop_assert_eq!(forward, ids);
        }
    }
}
