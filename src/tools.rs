//! Locating and probing the external `yt-dlp` and `ffmpeg` binaries.
//!
//! Deployments put these tools in different places: a system package on
//! `PATH`, a static build next to our executable, or an explicit path in the
//! config file. We try each in a fixed order and report every place we
//! looked when nothing turns up.

use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub const YTDLP_PROGRAM: &str = "yt-dlp";
pub const YTDLP_ENV: &str = "YTDLP_PATH";
pub const FFMPEG_PROGRAM: &str = "ffmpeg";
pub const FFMPEG_ENV: &str = "FFMPEG_PATH";

/// Finds `name`, preferring an explicit `configured` path, then the `env_key`
/// variable, then a sibling of the current executable, then `PATH`. The
/// binaries pass the resolved runtime setting as `configured`, which already
/// ranks the environment above the config file.
pub fn locate_program(name: &str, configured: Option<&Path>, env_key: &str) -> Result<PathBuf> {
    let exe_dir = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    locate_program_in(
        name,
        configured,
        env::var_os(env_key).map(PathBuf::from),
        exe_dir.as_deref(),
        env::var_os("PATH"),
    )
}

/// Same search as [`locate_program`] with every input passed explicitly.
pub fn locate_program_in(
    name: &str,
    configured: Option<&Path>,
    env_override: Option<PathBuf>,
    exe_dir: Option<&Path>,
    search_path: Option<OsString>,
) -> Result<PathBuf> {
    let mut searched = Vec::new();

    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        // An explicit setting that points nowhere is a deployment mistake.
        bail!(
            "configured {name} binary {} does not exist",
            path.display()
        );
    }

    if let Some(path) = env_override.filter(|path| !path.as_os_str().is_empty()) {
        if path.is_file() {
            debug!(program = name, path = %path.display(), "using binary from environment");
            return Ok(path);
        }
        searched.push(path);
    }

    if let Some(dir) = exe_dir {
        let sibling = dir.join(executable_name(name));
        if is_executable(&sibling) {
            debug!(program = name, path = %sibling.display(), "using binary next to executable");
            return Ok(sibling);
        }
        searched.push(sibling);
    }

    if let Some(paths) = search_path {
        for dir in env::split_paths(&paths) {
            let candidate = dir.join(executable_name(name));
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
        searched.push(PathBuf::from("$PATH"));
    }

    let tried = searched
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    bail!("{name} binary not found (searched: {tried})");
}

/// Runs `<program> <version_flag>` to fail loudly when a tool is broken.
pub fn ensure_program_available(program: &Path, version_flag: &str) -> Result<()> {
    let status = Command::new(program)
        .arg(version_flag)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("running {}", program.display()))?;

    if !status.success() {
        bail!(
            "{} is installed but returned a failure status ({status})",
            program.display()
        );
    }
    Ok(())
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_owned()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn install_stub(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(executable_name(name));
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    #[test]
    fn configured_path_wins() {
        let dir = tempdir().unwrap();
        let configured = install_stub(dir.path(), "custom-ytdlp");
        let found = locate_program_in("yt-dlp", Some(&configured), None, None, None).unwrap();
        assert_eq!(found, configured);
    }

    #[test]
    fn missing_configured_path_is_an_error() {
        let dir = tempdir().unwrap();
        let err = locate_program_in(
            "yt-dlp",
            Some(&dir.path().join("nope")),
            None,
            None,
            Some(dir.path().as_os_str().to_owned()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn env_override_before_sibling() {
        let env_dir = tempdir().unwrap();
        let exe_dir = tempdir().unwrap();
        let from_env = install_stub(env_dir.path(), "ffmpeg-static");
        install_stub(exe_dir.path(), "ffmpeg");
        let found =
            locate_program_in("ffmpeg", None, Some(from_env.clone()), Some(exe_dir.path()), None)
                .unwrap();
        assert_eq!(found, from_env);
    }

    #[test]
    fn sibling_before_search_path() {
        let exe_dir = tempdir().unwrap();
        let path_dir = tempdir().unwrap();
        let sibling = install_stub(exe_dir.path(), "ffmpeg");
        install_stub(path_dir.path(), "ffmpeg");
        let found = locate_program_in(
            "ffmpeg",
            None,
            None,
            Some(exe_dir.path()),
            Some(path_dir.path().as_os_str().to_owned()),
        )
        .unwrap();
        assert_eq!(found, sibling);
    }

    #[test]
    fn searches_each_path_entry() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        let expected = install_stub(second.path(), "yt-dlp");
        let joined = env::join_paths([first.path(), second.path()]).unwrap();
        let found = locate_program_in("yt-dlp", None, None, None, Some(joined)).unwrap();
        assert_eq!(found, expected);
    }

    #[test]
    fn not_found_lists_searched_locations() {
        let dir = tempdir().unwrap();
        let err = locate_program_in(
            "yt-dlp",
            None,
            Some(dir.path().join("missing")),
            Some(dir.path()),
            Some(OsString::new()),
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("yt-dlp binary not found"));
        assert!(err.contains("missing"));
        assert!(err.contains("$PATH"));
    }

    #[cfg(unix)]
    #[test]
    fn skips_non_executable_files_on_path() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("yt-dlp"), "not a program").unwrap();
        let result = locate_program_in(
            "yt-dlp",
            None,
            None,
            None,
            Some(dir.path().as_os_str().to_owned()),
        );
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn ensure_program_available_checks_exit_status() {
        let dir = tempdir().unwrap();
        let ok = install_stub(dir.path(), "good-tool");
        ensure_program_available(&ok, "--version").unwrap();

        let bad = dir.path().join("bad-tool");
        fs::write(&bad, "#!/bin/sh\nexit 3\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&bad, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(ensure_program_available(&bad, "--version").is_err());
        assert!(ensure_program_available(&dir.path().join("absent"), "-version").is_err());
    }
}
