//! Signal delivery to pool-managed processes.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use super::config::KillSignal;

/// Send `signal` to `pid`.
///
/// A process that no longer exists (`ESRCH`) counts as delivered.
pub fn deliver(pid: u32, signal: KillSignal) -> Result<(), Errno> {
    let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    if raw <= 0 {
        // 0 and negatives address process groups; never signal those.
        return Err(Errno::EINVAL);
    }
    match kill(Pid::from_raw(raw), signal.signal()) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn refuses_group_addressing_pids() {
        assert_eq!(deliver(0, KillSignal::TERM), Err(Errno::EINVAL));
        assert_eq!(deliver(u32::MAX, KillSignal::TERM), Err(Errno::EINVAL));
    }

    #[tokio::test]
    async fn terminates_a_sleeping_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert_eq!(deliver(pid, KillSignal::TERM), Ok(()));
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
