//! Daemon-less image build through the external builder subprocess.
//!
//! Active only when the container signals dockerless mode. The build runs
//! exactly once per container: the image-config file the builder writes
//! doubles as the idempotency marker. Build metadata shuttles between the
//! build context and a fallback location across invocations so the recovery
//! path can restore it.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::credentials;
use crate::envfile;
use crate::mounts;
use crate::selfexec::SelfInvoke;
use crate::tunnel::TunnelClient;
use crate::workspace::{DockerlessOptions, SetupResult};

pub const MODE_ENV: &str = "DOCKERLESS";
pub const CONTEXT_ENV: &str = "DOCKERLESS_CONTEXT";
const BUILD_INFO_DIR_NAME: &str = ".build-info";

/// Fixed locations inside the dockerless base layer, overridable for tests.
pub struct BuilderPaths {
    pub builder_bin: PathBuf,
    pub image_config: PathBuf,
    pub fallback_build_info: PathBuf,
    pub docker_config_dir: PathBuf,
}

impl Default for BuilderPaths {
    fn default() -> Self {
        Self {
            builder_bin: PathBuf::from("/.dockerless/dockerless"),
            image_config: PathBuf::from("/.dockerless/image.json"),
            fallback_build_info: PathBuf::from("/.dockerless/.build-info"),
            docker_config_dir: PathBuf::from("/.dockerless/.docker"),
        }
    }
}

struct BuildInputs<'a> {
    mode: Option<String>,
    context: Option<String>,
    setup: &'a SetupResult,
    options: &'a DockerlessOptions,
    tunnel: &'a TunnelClient,
    invoke: &'a dyn SelfInvoke,
    debug_output: bool,
    paths: BuilderPaths,
}

pub fn run(
    setup: &SetupResult,
    options: &DockerlessOptions,
    tunnel: &TunnelClient,
    invoke: &dyn SelfInvoke,
    debug_output: bool,
) -> Result<()> {
    execute(BuildInputs {
        mode: env::var(MODE_ENV).ok(),
        context: env::var(CONTEXT_ENV).ok().filter(|c| !c.is_empty()),
        setup,
        options,
        tunnel,
        invoke,
        debug_output,
        paths: BuilderPaths::default(),
    })
}

fn execute(inputs: BuildInputs<'_>) -> Result<()> {
    if inputs.mode.as_deref() != Some("true") {
        return Ok(());
    }

    if inputs.paths.image_config.exists() {
        debug!("skipping dockerless build, container was built already");
        return Ok(());
    }

    let Some(context) = inputs.context.as_deref() else {
        debug!("build context is missing for dockerless build");
        return Ok(());
    };

    let build_info_dir = Path::new(context).join(BUILD_INFO_DIR_NAME);
    recover_build_info(&build_info_dir, &inputs.paths.fallback_build_info)?;

    let binary = inputs.invoke.binary_path()?;

    // scoped to the build subprocess; dropped before housekeeping
    let docker_credentials = if inputs.options.docker_credentials_disabled() {
        None
    } else {
        match credentials::configure_docker(
            inputs.tunnel,
            inputs.invoke,
            &inputs.paths.docker_config_dir,
        ) {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!(error = ?e, "configuring docker credentials failed");
                None
            }
        }
    };

    let args = build_args(inputs.setup, inputs.options, &binary);
    let docker_config = docker_credentials
        .is_some()
        .then(|| inputs.paths.docker_config_dir.clone());
    let result = run_builder(
        &inputs.paths.builder_bin,
        &args,
        docker_config.as_deref(),
        inputs.debug_output,
    );
    drop(docker_credentials);
    result?;

    apply_image_env(&inputs.paths.image_config)?;

    // housekeeping for the next idempotency check; never fails the build
    let _ = fs::remove_dir_all(&inputs.paths.fallback_build_info);
    if let Err(e) = relocate_dir(&build_info_dir, &inputs.paths.fallback_build_info) {
        debug!(error = %e, "could not relocate build info directory");
    }

    Ok(())
}

fn recover_build_info(build_info_dir: &Path, fallback: &Path) -> Result<()> {
    if build_info_dir.exists() {
        return Ok(());
    }
    relocate_dir(fallback, build_info_dir).context("recover build info directory")?;
    if !build_info_dir.exists() {
        bail!(
            "build info directory {} is missing",
            build_info_dir.display()
        );
    }
    Ok(())
}

fn build_args(setup: &SetupResult, options: &DockerlessOptions, binary: &Path) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "--ignore-path".to_string(),
        binary.display().to_string(),
    ];
    args.extend(parse_ignore_paths(&options.ignore_paths));
    args.push("--build-arg".to_string());
    args.push(format!("TARGETOS={}", env::consts::OS));
    args.push("--build-arg".to_string());
    args.push(format!("TARGETARCH={}", target_arch()));
    if !options.registry_cache.is_empty() {
        debug!(cache = %options.registry_cache, "appending registry cache to build arguments");
        args.push("--registry-cache".to_string());
        args.push(options.registry_cache.clone());
    }

    // never re-copy the workspace folder or mounts that already have content
    args.push("--ignore-path".to_string());
    args.push(setup.workspace_folder().to_string());
    for mount in setup.mounts() {
        if mounts::target_populated(mount) {
            args.push("--ignore-path".to_string());
            args.push(mount.target.clone());
        }
    }
    args
}

/// Splits the comma-separated ignore-path option into builder arguments.
/// Empty or whitespace-only input yields no arguments.
pub fn parse_ignore_paths(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',')
        .flat_map(|path| ["--ignore-path".to_string(), path.trim().to_string()])
        .collect()
}

/// Architecture in the convention the builder expects as TARGETARCH.
fn target_arch() -> &'static str {
    match env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn run_builder(
    builder_bin: &Path,
    args: &[String],
    docker_config: Option<&Path>,
    debug_output: bool,
) -> Result<()> {
    info!(
        builder = %builder_bin.display(),
        args = %args.join(" "),
        "starting dockerless build"
    );
    let mut command = Command::new(builder_bin);
    command
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::piped());
    command.stdout(if debug_output {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    if let Some(dir) = docker_config {
        command.env(credentials::DOCKER_CONFIG_ENV, dir);
        // the credential shim lives in the config dir
        let path = env::var("PATH").unwrap_or_default();
        command.env("PATH", format!("{}:{}", dir.display(), path));
    }

    let mut child = command.spawn().context("start dockerless builder")?;

    let stderr_thread = child.stderr.take().map(|pipe| {
        thread::spawn(move || {
            for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                error!(target: "dockerless", "{line}");
            }
        })
    });
    let stdout_thread = child.stdout.take().map(|pipe| {
        thread::spawn(move || {
            for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                debug!(target: "dockerless", "{line}");
            }
        })
    });

    let status = child.wait().context("wait for dockerless builder")?;
    if let Some(thread) = stderr_thread {
        let _ = thread.join();
    }
    if let Some(thread) = stdout_thread {
        let _ = thread.join();
    }

    if !status.success() {
        bail!("dockerless build failed: {status}");
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfigFile {
    #[serde(default)]
    config: ImageConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    #[serde(rename = "Env", default)]
    env: Vec<String>,
}

/// Merges the environment the built image declares into the persisted env
/// file so later interactive sessions see it.
fn apply_image_env(image_config: &Path) -> Result<()> {
    let raw = fs::read_to_string(image_config)
        .with_context(|| format!("read image config {}", image_config.display()))?;
    let parsed: ImageConfigFile = serde_json::from_str(&raw).context("parse container config")?;
    envfile::merge_and_apply(&list_to_map(&parsed.config.env));
    Ok(())
}

fn list_to_map(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Moves a directory, falling back to a copy for cross-device renames.
fn relocate_dir(from: &Path, to: &Path) -> Result<()> {
    if !from.exists() {
        bail!("{} does not exist", from.display());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let mut options = fs_extra::dir::CopyOptions::new();
    options.copy_inside = true;
    fs_extra::dir::move_dir(from, to, &options)
        .with_context(|| format!("move {} to {}", from.display(), to.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selfexec::testutil::FixedBinary;
    use crate::workspace::Mount;
    use std::io::Cursor;
    use std::os::unix::fs::PermissionsExt as _;

    fn idle_tunnel() -> TunnelClient {
        TunnelClient::new(Cursor::new(Vec::new()), Vec::new())
    }

    fn disabled_credentials() -> DockerlessOptions {
        DockerlessOptions {
            disable_docker_credentials: "true".to_string(),
            ..Default::default()
        }
    }

    fn test_paths(root: &Path) -> BuilderPaths {
        BuilderPaths {
            builder_bin: root.join("builder.sh"),
            image_config: root.join("image.json"),
            fallback_build_info: root.join("fallback-build-info"),
            docker_config_dir: root.join("docker"),
        }
    }

    fn inputs<'a>(
        mode: Option<&str>,
        context: Option<&Path>,
        setup: &'a SetupResult,
        options: &'a DockerlessOptions,
        tunnel: &'a TunnelClient,
        invoke: &'a FixedBinary,
        paths: BuilderPaths,
    ) -> BuildInputs<'a> {
        BuildInputs {
            mode: mode.map(str::to_string),
            context: context.map(|c| c.display().to_string()),
            setup,
            options,
            tunnel,
            invoke,
            debug_output: false,
            paths,
        }
    }

    fn write_builder_script(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[test]
    fn test_mode_unset_is_a_no_op() {
        let td = tempfile::tempdir().unwrap();
        let setup = SetupResult::default();
        let options = disabled_credentials();
        let tunnel = idle_tunnel();
        let invoke = FixedBinary(PathBuf::from("/bin/true"));
        // builder binary does not exist; running it would fail loudly
        execute(inputs(
            None,
            Some(td.path()),
            &setup,
            &options,
            &tunnel,
            &invoke,
            test_paths(td.path()),
        ))
        .unwrap();
    }

    #[test]
    fn test_existing_image_config_skips_build() {
        let td = tempfile::tempdir().unwrap();
        let paths = test_paths(td.path());
        fs::write(&paths.image_config, "{}").unwrap();
        let setup = SetupResult::default();
        let options = disabled_credentials();
        let tunnel = idle_tunnel();
        let invoke = FixedBinary(PathBuf::from("/bin/true"));
        execute(inputs(
            Some("true"),
            Some(td.path()),
            &setup,
            &options,
            &tunnel,
            &invoke,
            paths,
        ))
        .unwrap();
    }

    #[test]
    fn test_missing_context_is_a_silent_no_op() {
        let td = tempfile::tempdir().unwrap();
        let setup = SetupResult::default();
        let options = disabled_credentials();
        let tunnel = idle_tunnel();
        let invoke = FixedBinary(PathBuf::from("/bin/true"));
        execute(inputs(
            Some("true"),
            None,
            &setup,
            &options,
            &tunnel,
            &invoke,
            test_paths(td.path()),
        ))
        .unwrap();
    }

    #[test]
    fn test_unrecoverable_build_info_is_fatal() {
        let td = tempfile::tempdir().unwrap();
        let context = td.path().join("context");
        fs::create_dir_all(&context).unwrap();
        let setup = SetupResult::default();
        let options = disabled_credentials();
        let tunnel = idle_tunnel();
        let invoke = FixedBinary(PathBuf::from("/bin/true"));
        let err = execute(inputs(
            Some("true"),
            Some(&context),
            &setup,
            &options,
            &tunnel,
            &invoke,
            test_paths(td.path()),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("recover build info"));
    }

    #[test]
    fn test_build_runs_and_relocates_build_info() {
        let td = tempfile::tempdir().unwrap();
        let paths = test_paths(td.path());
        let context = td.path().join("context");
        fs::create_dir_all(&context).unwrap();

        // recovery path: build info only exists at the fallback location
        fs::create_dir_all(&paths.fallback_build_info).unwrap();
        fs::write(paths.fallback_build_info.join("feature.json"), "{}").unwrap();

        let witness = td.path().join("invoked");
        write_builder_script(
            &paths.builder_bin,
            &format!(
                "echo \"$@\" > {}\nprintf '%s' '{{\"config\":{{\"Env\":[\"BUILT=yes\"]}}}}' > {}",
                witness.display(),
                paths.image_config.display()
            ),
        );

        let setup = SetupResult::default();
        let options = disabled_credentials();
        let tunnel = idle_tunnel();
        let invoke = FixedBinary(PathBuf::from("/bin/agent"));
        execute(inputs(
            Some("true"),
            Some(&context),
            &setup,
            &options,
            &tunnel,
            &invoke,
            test_paths(td.path()),
        ))
        .unwrap();

        let recorded = fs::read_to_string(&witness).unwrap();
        assert!(recorded.starts_with("build --ignore-path /bin/agent"));
        assert!(recorded.contains("TARGETOS="));
        assert!(recorded.contains("TARGETARCH="));

        // build info moved back to the fallback location
        assert!(paths.fallback_build_info.join("feature.json").exists());
        assert!(!context.join(BUILD_INFO_DIR_NAME).exists());
    }

    #[test]
    fn test_builder_failure_is_fatal() {
        let td = tempfile::tempdir().unwrap();
        let paths = test_paths(td.path());
        let context = td.path().join("context");
        fs::create_dir_all(context.join(BUILD_INFO_DIR_NAME)).unwrap();
        write_builder_script(&paths.builder_bin, "exit 1");

        let setup = SetupResult::default();
        let options = disabled_credentials();
        let tunnel = idle_tunnel();
        let invoke = FixedBinary(PathBuf::from("/bin/true"));
        let err = execute(inputs(
            Some("true"),
            Some(&context),
            &setup,
            &options,
            &tunnel,
            &invoke,
            test_paths(td.path()),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("dockerless build failed"));
    }

    #[test]
    fn test_parse_ignore_paths() {
        assert!(parse_ignore_paths("").is_empty());
        assert!(parse_ignore_paths("   \t").is_empty());
        assert_eq!(
            parse_ignore_paths("a, b,c"),
            vec![
                "--ignore-path",
                "a",
                "--ignore-path",
                "b",
                "--ignore-path",
                "c"
            ]
        );
    }

    #[test]
    fn test_target_arch_uses_builder_convention() {
        let arch = target_arch();
        assert_ne!(arch, "x86_64");
        assert_ne!(arch, "aarch64");
    }

    #[test]
    fn test_build_args_ignore_populated_mounts_only() {
        let td = tempfile::tempdir().unwrap();
        let populated = td.path().join("populated");
        fs::create_dir_all(&populated).unwrap();
        fs::write(populated.join("file"), "x").unwrap();
        let empty = td.path().join("empty");
        fs::create_dir_all(&empty).unwrap();

        let mut setup = SetupResult::default();
        setup.substitution_context.container_workspace_folder = "/workspaces/app".to_string();
        setup.merged_config.mounts = vec![
            Mount {
                source: "/host/a".to_string(),
                target: populated.display().to_string(),
            },
            Mount {
                source: "/host/b".to_string(),
                target: empty.display().to_string(),
            },
        ];

        let options = DockerlessOptions {
            registry_cache: "cache.example.com/repo".to_string(),
            ..disabled_credentials()
        };
        let args = build_args(&setup, &options, Path::new("/bin/agent"));
        let joined = args.join(" ");
        assert!(joined.contains("--ignore-path /workspaces/app"));
        assert!(joined.contains(&format!("--ignore-path {}", populated.display())));
        assert!(!joined.contains(&format!("--ignore-path {}", empty.display())));
        assert!(joined.contains("--registry-cache cache.example.com/repo"));
    }

    #[test]
    fn test_list_to_map_splits_on_first_equals() {
        let map = list_to_map(&[
            "PATH=/usr/bin:/bin".to_string(),
            "EQ=a=b".to_string(),
            "BROKEN".to_string(),
        ]);
        assert_eq!(map.get("PATH").map(String::as_str), Some("/usr/bin:/bin"));
        assert_eq!(map.get("EQ").map(String::as_str), Some("a=b"));
        assert!(!map.contains_key("BROKEN"));
    }

    #[test]
    fn test_relocate_dir_moves_contents() {
        let td = tempfile::tempdir().unwrap();
        let from = td.path().join("from");
        fs::create_dir_all(&from).unwrap();
        fs::write(from.join("marker"), "x").unwrap();
        let to = td.path().join("nested").join("to");
        relocate_dir(&from, &to).unwrap();
        assert!(to.join("marker").exists());
        assert!(!from.exists());
    }
}
