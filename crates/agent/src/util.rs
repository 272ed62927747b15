//! Small host lookups shared across the agent.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use nix::unistd::{Uid, User};
use rustix::fs::Access;

/// User home directory, `/` when the platform has no answer.
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Login name of the user the agent runs as.
pub fn user_name() -> String {
    if let Ok(Some(user)) = User::from_uid(Uid::current()) {
        return user.name;
    }
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

/// The user's passwd shell when it is executable, `/bin/sh` otherwise.
pub fn preferred_shell() -> String {
    if let Ok(Some(user)) = User::from_uid(Uid::current()) {
        if is_executable(&user.shell) {
            if let Some(shell) = user.shell.to_str() {
                return shell.to_string();
            }
        }
    }
    "/bin/sh".to_string()
}

/// Resolves `program` against the agent's `PATH`.
pub fn find_program_in_path(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && rustix::fs::access(path, Access::EXEC_OK).is_ok()
}

/// Whether `systemd-run` is available and recent enough for
/// `--scope --same-dir` (240 grew `--same-dir` and anything older has been
/// unreliable for transient scopes anyway).
pub fn has_systemd_run() -> bool {
    static HAS: OnceLock<bool> = OnceLock::new();
    *HAS.get_or_init(|| {
        let Some(path) = find_program_in_path("systemd-run") else {
            return false;
        };
        let output = std::process::Command::new(path)
            .arg("--version")
            .stderr(std::process::Stdio::null())
            .output();
        let Ok(output) = output else {
            return false;
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_systemd_version(&stdout).map(|v| v >= 240).unwrap_or(false)
    })
}

fn parse_systemd_version(output: &str) -> Option<u32> {
    let mut fields = output.lines().next()?.split_ascii_whitespace();
    if fields.next()? != "systemd" {
        return None;
    }
    let version = fields.next()?;
    let digits: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_systemd_version() {
        let output = "systemd 254 (254.5-1.fc39)\n+PAM +AUDIT +SELINUX";
        assert_eq!(parse_systemd_version(output), Some(254));

        let output = "systemd 219";
        assert_eq!(parse_systemd_version(output), Some(219));

        assert_eq!(parse_systemd_version(""), None);
        assert_eq!(parse_systemd_version("not systemd"), None);
        assert_eq!(parse_systemd_version("systemd"), None);
    }

    #[test]
    fn test_find_program_in_path() {
        assert!(find_program_in_path("sh").is_some());
        assert!(find_program_in_path("/bin/sh").is_some());
        assert!(find_program_in_path("definitely-not-a-real-program-xyz").is_none());
    }

    #[test]
    fn test_find_program_requires_execute_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("maybe-exec");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();

        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(find_program_in_path(script.to_str().unwrap()).is_none());

        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(find_program_in_path(script.to_str().unwrap()).is_some());
    }

    #[test]
    fn test_preferred_shell_is_absolute() {
        let shell = preferred_shell();
        assert!(shell.starts_with('/'), "unexpected shell: {shell}");
    }
}
