//! Decoded descriptors driving a setup run.
//!
//! `WorkspaceInfo` carries everything the host knows about the workspace and
//! is read-only once decoded. `SetupResult` is the merged devcontainer
//! outcome; its remote environment map is rewritten exactly once by
//! [`merge_remote_env`] and the whole structure is sent back to the host as
//! the final result of the run.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::payload;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceInfo {
    pub cli_options: CliOptions,
    pub source: Source,
    pub agent: AgentConfig,
    pub dockerless: DockerlessOptions,
    pub ide: IdeConfig,
    /// String-valued bool, matching the wire format of the host.
    pub pull_from_inside_container: String,
    /// Inactivity timeout for the container daemon, e.g. "15m". Empty
    /// disables the daemon.
    pub container_timeout: String,
}

impl WorkspaceInfo {
    pub fn decode(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let decoded = payload::decode(raw)?;
        serde_json::from_str(&decoded).context("parse workspace info")
    }

    pub fn pulls_from_inside(&self) -> bool {
        matches!(self.pull_from_inside_container.trim(), "true" | "1")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CliOptions {
    /// Re-transfer mounts and re-clone sources even when already present.
    pub reset: bool,
    pub recreate: bool,
    pub disable_daemon: bool,
    /// Extra KEY=VALUE entries applied to the workspace environment.
    pub workspace_env: Vec<String>,
    pub platform: PlatformOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformOptions {
    pub enabled: bool,
    pub platform_host: String,
    pub instance_namespace: String,
    pub instance_name: String,
    pub access_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Source {
    pub git_repository: String,
    pub git_branch: String,
    pub git_commit: String,
    pub image: String,
    pub local_folder: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// One of "", "shallow", "blobless", "treeless".
    pub git_clone_strategy: String,
}

/// Options for the daemon-less image build. All string-valued on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerlessOptions {
    /// Comma-separated list of paths the builder must not copy.
    pub ignore_paths: String,
    pub registry_cache: String,
    pub disable_docker_credentials: String,
}

impl DockerlessOptions {
    pub fn docker_credentials_disabled(&self) -> bool {
        self.disable_docker_credentials.trim() == "true"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdeConfig {
    pub name: String,
    pub options: BTreeMap<String, OptionValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionValue {
    pub value: String,
}

impl IdeConfig {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|v| v.value.as_str())
    }
}

// ── Setup result ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetupResult {
    pub substitution_context: SubstitutionContext,
    pub merged_config: MergedConfig,
}

impl SetupResult {
    pub fn decode(raw: &str) -> Result<Self> {
        let decoded = payload::decode(raw)?;
        serde_json::from_str(&decoded).context("parse setup info")
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.merged_config.mounts
    }

    /// The user later interactive sessions run as. Defaults to root.
    pub fn remote_user(&self) -> &str {
        let user = self.merged_config.remote_user.trim();
        if user.is_empty() { "root" } else { user }
    }

    pub fn workspace_folder(&self) -> &str {
        &self.substitution_context.container_workspace_folder
    }

    pub fn vscode_customization(&self) -> &VsCodeCustomization {
        &self.merged_config.customizations.vscode
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubstitutionContext {
    pub container_workspace_folder: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergedConfig {
    pub remote_env: BTreeMap<String, String>,
    pub remote_user: String,
    pub mounts: Vec<Mount>,
    pub customizations: Customizations,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Customizations {
    pub vscode: VsCodeCustomization,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VsCodeCustomization {
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub extensions: Vec<String>,
}

/// A host-side bind mount transferred into the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mount {
    pub source: String,
    pub target: String,
}

impl fmt::Display for Mount {
    /// Canonical form, used both as the transfer request and as a log key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src={},dst={}", self.source, self.target)
    }
}

// ── Env merge ───────────────────────────────────────────────────────────

/// Resolves `${containerEnv:NAME}` references in the remote environment map
/// against the agent's own process environment. Runs exactly once, before
/// any step reads the map.
pub fn merge_remote_env(result: &mut SetupResult) {
    let process: BTreeMap<String, String> = std::env::vars().collect();
    let env = &mut result.merged_config.remote_env;
    env.entry("PATH".to_string())
        .or_insert_with(|| "${containerEnv:PATH}".to_string());
    for value in env.values_mut() {
        *value = substitute_container_env(value, &process);
    }
}

fn substitute_container_env(value: &str, env: &BTreeMap<String, String>) -> String {
    const PREFIX: &str = "${containerEnv:";

    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find(PREFIX) {
        out.push_str(&rest[..start]);
        let after = &rest[start + PREFIX.len()..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match env.get(name) {
                    Some(resolved) => out.push_str(resolved),
                    // leave unknown references untouched
                    None => out.push_str(&rest[start..start + PREFIX.len() + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_info_round_trip() {
        let info = WorkspaceInfo {
            pull_from_inside_container: "true".to_string(),
            container_timeout: "15m".to_string(),
            ..Default::default()
        };
        let encoded = payload::encode(&serde_json::to_string(&info).unwrap()).unwrap();
        let decoded = WorkspaceInfo::decode(&encoded).unwrap();
        assert!(decoded.pulls_from_inside());
        assert_eq!(decoded.container_timeout, "15m");
    }

    #[test]
    fn test_workspace_info_empty_payload_is_default() {
        let decoded = WorkspaceInfo::decode("").unwrap();
        assert!(!decoded.pulls_from_inside());
        assert!(!decoded.cli_options.reset);
    }

    #[test]
    fn test_setup_result_tolerates_missing_fields() {
        let encoded = payload::encode("{}").unwrap();
        let decoded = SetupResult::decode(&encoded).unwrap();
        assert_eq!(decoded.remote_user(), "root");
        assert!(decoded.mounts().is_empty());
    }

    #[test]
    fn test_mount_display_is_canonical() {
        let mount = Mount {
            source: "/host/data".to_string(),
            target: "/workspace/data".to_string(),
        };
        assert_eq!(mount.to_string(), "src=/host/data,dst=/workspace/data");
    }

    #[test]
    fn test_merge_remote_env_defaults_path() {
        let mut result = SetupResult::default();
        merge_remote_env(&mut result);
        let path = result.merged_config.remote_env.get("PATH").unwrap();
        // substituted against the test process env, so no reference remains
        assert!(!path.contains("${containerEnv:"));
    }

    #[test]
    fn test_merge_remote_env_does_not_override_explicit_path() {
        let mut result = SetupResult::default();
        result
            .merged_config
            .remote_env
            .insert("PATH".to_string(), "/custom/bin".to_string());
        merge_remote_env(&mut result);
        assert_eq!(
            result.merged_config.remote_env.get("PATH").unwrap(),
            "/custom/bin"
        );
    }

    #[test]
    fn test_substitute_container_env() {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), "/root".to_string());
        assert_eq!(
            substitute_container_env("${containerEnv:HOME}/bin", &env),
            "/root/bin"
        );
        assert_eq!(
            substitute_container_env("${containerEnv:MISSING}", &env),
            "${containerEnv:MISSING}"
        );
        assert_eq!(
            substitute_container_env("a-${containerEnv:HOME}-b-${containerEnv:HOME}", &env),
            "a-/root-b-/root"
        );
        // unterminated reference is preserved as-is
        assert_eq!(
            substitute_container_env("${containerEnv:HOME", &env),
            "${containerEnv:HOME"
        );
    }
}
