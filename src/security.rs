//! Process-level guards shared by the savetube binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start `process` as root. The downloads directory and the
/// spawned yt-dlp/ffmpeg children inherit whatever account runs the server,
/// so it should be an unprivileged one. Callers may skip this with an
/// explicit `--allow-root` flag.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!(
            "{process} must not be run as root; start it under an unprivileged account or pass --allow-root"
        );
    }
    Ok(())
}
