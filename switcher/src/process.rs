//! External miner process control.
//!
//! The engine only needs three operations; the systemd implementation shells
//! out to `systemctl`, other supervisors can plug in behind the same trait.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

use crate::config::MinerServiceSettings;
use crate::error::ControlError;

#[async_trait]
pub trait MinerControl: Send + Sync {
    async fn is_active(&self) -> bool;
    async fn start(&self) -> Result<(), ControlError>;
    async fn restart(&self) -> Result<(), ControlError>;
}

/// Restart the miner if it is running, start it otherwise.
///
/// Never fails: the new config is already on disk and the next supervision
/// pass picks it up even when this attempt does not.
pub async fn restart_best_effort(control: &dyn MinerControl) -> bool {
    if control.is_active().await {
        match control.restart().await {
            Ok(()) => {
                tracing::info!("miner restarted");
                return true;
            }
            Err(e) => tracing::warn!(error = %e, "miner restart failed, trying start"),
        }
    }
    match control.start().await {
        Ok(()) => {
            tracing::info!("miner started");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "could not start miner, switch stays committed");
            false
        }
    }
}

pub struct SystemdMinerControl {
    unit: String,
    use_sudo: bool,
    timeout: Duration,
}

impl SystemdMinerControl {
    pub fn new(settings: &MinerServiceSettings) -> Self {
        Self {
            unit: settings.unit.clone(),
            use_sudo: settings.use_sudo,
            timeout: Duration::from_secs(settings.command_timeout_secs.max(1)),
        }
    }

    fn command(&self, args: &[&str]) -> (Command, String) {
        let mut argv: Vec<&str> = Vec::with_capacity(args.len() + 3);
        if self.use_sudo {
            argv.extend(["sudo", "-n"]);
        }
        argv.push("systemctl");
        argv.extend_from_slice(args);
        argv.push(self.unit.as_str());

        let cmdline = argv.join(" ");
        let mut cmd = Command::new(argv[0]);
        cmd.args(&argv[1..]).kill_on_drop(true);
        (cmd, cmdline)
    }

    async fn run(&self, args: &[&str]) -> Result<(std::process::Output, String), ControlError> {
        let (mut cmd, cmdline) = self.command(args);
        tracing::debug!(command = %cmdline, "running");
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => Err(ControlError::Timeout {
                command: cmdline,
                timeout: self.timeout,
            }),
            Ok(Err(source)) => Err(ControlError::Spawn {
                command: cmdline,
                source,
            }),
            Ok(Ok(output)) => Ok((output, cmdline)),
        }
    }

    async fn run_checked(&self, args: &[&str]) -> Result<(), ControlError> {
        let (output, cmdline) = self.run(args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ControlError::Failed {
                command: cmdline,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl MinerControl for SystemdMinerControl {
    async fn is_active(&self) -> bool {
        match self.run(&["is-active", "--quiet"]).await {
            Ok((output, _)) => output.status.success(),
            Err(e) => {
                tracing::warn!(unit = %self.unit, error = %e, "cannot query miner state");
                false
            }
        }
    }

    async fn start(&self) -> Result<(), ControlError> {
        self.run_checked(&["start"]).await
    }

    async fn restart(&self) -> Result<(), ControlError> {
        self.run_checked(&["restart"]).await
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeMiner;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn inactive_miner_is_started() {
        let miner = FakeMiner::default();
        assert!(restart_best_effort(&miner).await);
        assert_eq!(miner.calls(), vec!["is_active", "start"]);
    }

    #[tokio::test]
    async fn active_miner_is_restarted() {
        let miner = FakeMiner::default();
        miner.active.store(true, Ordering::SeqCst);
        assert!(restart_best_effort(&miner).await);
        assert_eq!(miner.calls(), vec!["is_active", "restart"]);
    }

    #[tokio::test]
    async fn failed_restart_falls_back_to_start() {
        let miner = FakeMiner::default();
        miner.active.store(true, Ordering::SeqCst);
        miner.fail_restart.store(true, Ordering::SeqCst);
        assert!(restart_best_effort(&miner).await);
        assert_eq!(miner.calls(), vec!["is_active", "restart", "start"]);
    }

    #[tokio::test]
    async fn total_failure_is_swallowed() {
        let miner = FakeMiner::default();
        miner.fail_start.store(true, Ordering::SeqCst);
        assert!(!restart_best_effort(&miner).await);
    }

    #[test]
    fn sudo_prefixes_systemctl() {
        let settings = MinerServiceSettings {
            unit: "miner".to_string(),
            use_sudo: true,
            command_timeout_secs: 5,
        };
        let control = SystemdMinerControl::new(&settings);
        assert_eq!(control.command(&["restart"]).1, "sudo -n systemctl restart miner");
    }

    #[tokio::test]
    async fn unknown_unit_reports_inactive() {
        let settings = MinerServiceSettings {
            unit: "chain-switcher-no-such-unit".to_string(),
            use_sudo: false,
            command_timeout_secs: 5,
        };
        let control = SystemdMinerControl::new(&settings);
        // missing systemctl and an unknown unit both read as "not running"
        assert!(!control.is_active().await);
        match control.start().await {
            Err(ControlError::Failed { command, .. }) => {
                assert_eq!(command, "systemctl start chain-switcher-no-such-unit")
            }
            Err(ControlError::Spawn { command, .. }) | Err(ControlError::Timeout { command, .. }) => {
                assert!(command.ends_with("chain-switcher-no-such-unit"))
            }
            Ok(()) => panic!("starting an unknown unit must fail"),
        }
    }
}
