//! Persisted shell environment consumed by later interactive sessions.
//!
//! The map lives next to the other agent state and is merge-only: entries
//! are added or updated, never cleared. A profile.d script is rendered from
//! the merged map so login shells pick the values up.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, error};

use crate::paths;

const PROFILE_SCRIPT: &str = "/etc/profile.d/stagehand-env.sh";

/// Merges the entries into the persisted environment and re-renders the
/// profile script. Failures are logged and swallowed; a broken env file must
/// not fail the setup run.
pub fn merge_and_apply(env: &BTreeMap<String, String>) {
    if env.is_empty() {
        return;
    }
    let merged = match env_file_path().and_then(|path| merge_into(&path, env)) {
        Ok(merged) => merged,
        Err(e) => {
            error!(error = %e, "could not persist environment file");
            return;
        }
    };
    if let Err(e) = render_profile_to(Path::new(PROFILE_SCRIPT), &merged) {
        debug!(error = %e, "could not render profile script");
    }
}

pub fn env_file_path() -> Result<PathBuf> {
    Ok(paths::state_dir()?.join("env.json"))
}

fn merge_into(path: &Path, env: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let mut merged: BTreeMap<String, String> = match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("parse environment file {}", path.display()))?,
        Err(_) => BTreeMap::new(),
    };
    merged.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    let contents = serde_json::to_string_pretty(&merged)?;
    fs::write(path, contents + "\n")
        .with_context(|| format!("write environment file {}", path.display()))?;
    Ok(merged)
}

fn render_profile_to(path: &Path, env: &BTreeMap<String, String>) -> Result<()> {
    let mut script = String::from("# Generated by stagehand. Do not edit.\n");
    for (key, value) in env {
        script.push_str(&format!("export {}=\"{}\"\n", key, escape(value)));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, script).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_is_additive() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("env.json");

        merge_into(&path, &entries(&[("FOO", "1"), ("BAR", "2")])).unwrap();
        let merged = merge_into(&path, &entries(&[("BAR", "3"), ("BAZ", "4")])).unwrap();

        assert_eq!(merged.get("FOO").map(String::as_str), Some("1"));
        assert_eq!(merged.get("BAR").map(String::as_str), Some("3"));
        assert_eq!(merged.get("BAZ").map(String::as_str), Some("4"));

        let on_disk: BTreeMap<String, String> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, merged);
    }

    #[test]
    fn test_merge_rejects_corrupt_state() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("env.json");
        fs::write(&path, "not json").unwrap();
        assert!(merge_into(&path, &entries(&[("A", "1")])).is_err());
    }

    #[test]
    fn test_render_profile_exports_entries() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("profile.d").join("env.sh");
        render_profile_to(&path, &entries(&[("FOO", "bar"), ("PATH", "/x:/y")])).unwrap();
        let script = fs::read_to_string(&path).unwrap();
        assert!(script.contains("export FOO=\"bar\""));
        assert!(script.contains("export PATH=\"/x:/y\""));
    }

    #[test]
    fn test_escape_quotes_shell_metacharacters() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a\"b"), "a\\\"b");
        assert_eq!(escape("$HOME `id`"), "\\$HOME \\`id\\`");
    }

    #[test]
    fn test_empty_merge_is_a_no_op() {
        // must not touch the filesystem at all
        merge_and_apply(&BTreeMap::new());
    }
}
