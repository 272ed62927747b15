//! Environment detection for the agent process.
//!
//! The agent may itself be running inside a Flatpak sandbox, in which case
//! host commands have to be routed through `flatpak-spawn`. Detection
//! results are cached for the process lifetime.

use std::path::Path;
use std::sync::OnceLock;

/// Whether the agent runs inside a Flatpak sandbox.
pub fn is_sandboxed() -> bool {
    static SANDBOXED: OnceLock<bool> = OnceLock::new();
    *SANDBOXED.get_or_init(|| Path::new("/.flatpak-info").exists())
}

/// Whether the running kernel is at least `major.minor`.
///
/// Used to gate `TIOCGPTPEER`, which only appeared in Linux 4.13; a Flatpak
/// on an enterprise kernel can easily be older.
pub fn kernel_at_least(major: u32, minor: u32) -> bool {
    static RELEASE: OnceLock<Option<(u32, u32)>> = OnceLock::new();
    let release = RELEASE.get_or_init(|| {
        let raw = std::fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
        parse_kernel_release(&raw)
    });

    match release {
        Some((km, kn)) => (*km > major) || (*km == major && *kn >= minor),
        None => false,
    }
}

fn parse_kernel_release(raw: &str) -> Option<(u32, u32)> {
    let mut parts = raw.trim().split('.');
    let major = leading_number(parts.next()?)?;
    let minor = parts.next().and_then(leading_number).unwrap_or(0);
    Some((major, minor))
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("6.9.12-200.fc40.x86_64\n"), Some((6, 9)));
        assert_eq!(parse_kernel_release("4.13.0"), Some((4, 13)));
        assert_eq!(parse_kernel_release("5.10.0-28-amd64"), Some((5, 10)));
        // Vendor suffixes directly on the minor component.
        assert_eq!(parse_kernel_release("4.4rc1"), Some((4, 4)));
        assert_eq!(parse_kernel_release("6"), Some((6, 0)));
        assert_eq!(parse_kernel_release("garbage"), None);
    }

    #[test]
    fn test_kernel_at_least_is_consistent() {
        // Whatever the host kernel is, the ordering must be monotonic.
        if kernel_at_least(4, 13) {
            assert!(kernel_at_least(4, 0));
            assert!(kernel_at_least(3, 19));
        }
    }
}
