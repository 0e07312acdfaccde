//! File utilities backing the runtime-dependency installer: download,
//! extract and mark executable. Network and archive handling shell out to
//! the host's tooling (curl, gunzip, tar, unzip) and surface stderr in the
//! error message when a step fails.

use crate::Result;
use anyhow::Context;
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};

fn run(description: &str, mut command: Command) -> Result<()> {
    debug!("{description}: {command:?}");
    let output = command
        .output()
        .with_context(|| format!("{description}: failed to launch {command:?}"))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "{description} failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
        .into());
    }
    Ok(())
}

pub fn download(url: &str, dest: &Path) -> Result<()> {
    let mut command = Command::new("curl");
    command
        .arg("--fail")
        .arg("--location")
        .arg("--silent")
        .arg("--show-error")
        .arg("--output")
        .arg(dest)
        .arg(url);
    run(&format!("downloading {url}"), command)
}

pub fn gunzip(archive: &Path, dest: &Path) -> Result<()> {
    let out = File::create(dest)
        .with_context(|| format!("could not create {}", dest.display()))?;
    let mut command = Command::new("gunzip");
    command
        .arg("--stdout")
        .arg(archive)
        .stdout(Stdio::from(out));
    run(&format!("extracting {}", archive.display()), command)
}

pub fn untar_gz(archive: &Path, dest_dir: &Path) -> Result<()> {
    let mut command = Command::new("tar");
    command.arg("-xzf").arg(archive).arg("-C").arg(dest_dir);
    run(&format!("extracting {}", archive.display()), command)
}

pub fn unzip(archive: &Path, dest_dir: &Path) -> Result<()> {
    let mut command = Command::new("unzip");
    command.arg("-o").arg(archive).arg("-d").arg(dest_dir);
    run(&format!("extracting {}", archive.display()), command)
}

#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path)?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Run an install command line through the platform shell, in `cwd`, with
/// `env` layered on top of the inherited environment.
pub fn run_install_command(
    command_line: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<()> {
    #[cfg(unix)]
    let mut command = {
        let mut command = Command::new("sh");
        command.arg("-c").arg(command_line);
        command
    };
    #[cfg(windows)]
    let mut command = {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(command_line);
        command
    };

    command.current_dir(cwd).envs(env);
    run(&format!("running '{command_line}'"), command)
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn make_executable_sets_the_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        make_executable(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn install_commands_run_in_the_given_dir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("POLYGLOT_TEST_VALUE".to_string(), "yes".to_string());
        run_install_command("printf '%s' \"$POLYGLOT_TEST_VALUE\" > marker", dir.path(), &env)
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("marker")).unwrap(),
            "yes"
        );
    }

    #[test]
    fn failed_commands_surface_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_install_command("echo nope >&2; exit 3", dir.path(), &HashMap::new())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("nope"), "unexpected error: {message}");
    }
}
