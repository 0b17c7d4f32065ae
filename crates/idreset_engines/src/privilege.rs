#![forbid(unsafe_code)]

use std::env;
use std::process::{Command, Stdio};

use idreset_kernel_contracts::{PlatformFamily, ResetError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationOutcome {
    AlreadyElevated,
    RelaunchRequested,
}

pub trait PrivilegeGate: Send + Sync {
    /// `Ok(true)` when the current process holds elevated rights.
    fn check(&self) -> Result<bool, ResetError>;

    /// Best-effort elevation. Never attempts anything on platforms without a
    /// programmatic path; those return `ElevationFailed` carrying the instruction.
    fn elevate(&self) -> Result<ElevationOutcome, ResetError>;

    fn remediation(&self) -> String;

    fn require(&self) -> Result<(), ResetError> {
        if self.check()? {
            Ok(())
        } else {
            Err(ResetError::PrivilegeRequired {
                remediation: self.remediation(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostPrivilegeGate {
    platform: PlatformFamily,
    relaunch_args: Vec<String>,
}

impl HostPrivilegeGate {
    pub fn new(platform: PlatformFamily, relaunch_args: Vec<String>) -> Self {
        Self {
            platform,
            relaunch_args,
        }
    }

    fn program_label() -> String {
        env::args()
            .next()
            .unwrap_or_else(|| "idreset_http".to_string())
    }
}

impl PrivilegeGate for HostPrivilegeGate {
    fn check(&self) -> Result<bool, ResetError> {
        match self.platform {
            PlatformFamily::Windows => Ok(windows_session_is_elevated()),
            PlatformFamily::MacOs | PlatformFamily::Linux => Ok(effective_user_is_root()),
            PlatformFamily::Other(os) => Err(ResetError::UnsupportedPlatform {
                platform: os.to_string(),
            }),
        }
    }

    fn elevate(&self) -> Result<ElevationOutcome, ResetError> {
        if self.check()? {
            return Ok(ElevationOutcome::AlreadyElevated);
        }
        match self.platform {
            PlatformFamily::Windows => {
                let exe = env::current_exe().map_err(|e| ResetError::ElevationFailed {
                    reason: format!("failed to get executable path: {e}"),
                    remediation: Some(self.remediation()),
                })?;
                let script = run_as_script(&exe.display().to_string(), &self.relaunch_args);
                debug!(script = %script, "requesting elevated relaunch");
                let status = Command::new("powershell")
                    .args(["-NoProfile", "-Command", &script])
                    .status()
                    .map_err(|e| ResetError::ElevationFailed {
                        reason: format!("failed to launch powershell: {e}"),
                        remediation: Some(self.remediation()),
                    })?;
                if !status.success() {
                    return Err(ResetError::ElevationFailed {
                        reason: format!("elevated relaunch was not started ({status})"),
                        remediation: Some(self.remediation()),
                    });
                }
                info!("elevated relaunch requested");
                Ok(ElevationOutcome::RelaunchRequested)
            }
            PlatformFamily::MacOs | PlatformFamily::Linux => Err(ResetError::ElevationFailed {
                reason: format!(
                    "please restart the application with sudo: sudo {}",
                    Self::program_label()
                ),
                remediation: Some(self.remediation()),
            }),
            PlatformFamily::Other(os) => Err(ResetError::ElevationFailed {
                reason: format!("privilege elevation not supported on {os}"),
                remediation: None,
            }),
        }
    }

    fn remediation(&self) -> String {
        remediation_message(self.platform)
    }
}

pub fn remediation_message(platform: PlatformFamily) -> String {
    match platform {
        PlatformFamily::Windows => "Please restart the application as Administrator. \
             Right-click on the executable and select 'Run as administrator'."
            .to_string(),
        PlatformFamily::MacOs | PlatformFamily::Linux => format!(
            "Please restart the application with sudo privileges: sudo {}",
            HostPrivilegeGate::program_label()
        ),
        PlatformFamily::Other(_) => {
            "Administrator privileges are required for this operation.".to_string()
        }
    }
}

fn run_as_script(exe: &str, args: &[String]) -> String {
    let quote = |s: &str| format!("'{}'", s.replace('\'', "''"));
    let mut script = format!("Start-Process {} -Verb RunAs", quote(exe));
    if !args.is_empty() {
        let joined = args.iter().map(|a| quote(a)).collect::<Vec<_>>().join(",");
        script.push_str(" -ArgumentList ");
        script.push_str(&joined);
    }
    script
}

fn windows_session_is_elevated() -> bool {
    Command::new("net")
        .arg("session")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(unix)]
fn effective_user_is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn effective_user_is_root() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use idreset_kernel_contracts::ResetErrorKind;

    #[test]
    fn at_priv_01_unknown_platform_is_unsupported() {
        let gate = HostPrivilegeGate::new(PlatformFamily::Other("haiku"), Vec::new());
        let err = gate.check().expect_err("unknown platform must fail");
        assert_eq!(err.kind(), ResetErrorKind::UnsupportedPlatform);
        let err = gate.require().expect_err("require must propagate");
        assert_eq!(err.kind(), ResetErrorKind::UnsupportedPlatform);
    }

    #[test]
    fn at_priv_02_unix_elevation_returns_instruction_without_acting() {
        let gate = HostPrivilegeGate::new(PlatformFamily::Linux, Vec::new());
        if gate.check().unwrap() {
            assert_eq!(gate.elevate().unwrap(), ElevationOutcome::AlreadyElevated);
            return;
        }
        let err = gate.elevate().expect_err("unix elevation is manual");
        assert_eq!(err.kind(), ResetErrorKind::ElevationFailed);
        assert!(err.to_string().contains("sudo"));
        assert!(err.remediation().unwrap().contains("sudo"));
    }

    #[test]
    fn at_priv_03_run_as_script_quotes_arguments() {
        let script = run_as_script(
            "C:\\Program Files\\idreset.exe",
            &["--bind".to_string(), "it's".to_string()],
        );
        assert_eq!(
            script,
            "Start-Process 'C:\\Program Files\\idreset.exe' -Verb RunAs \
             -ArgumentList '--bind','it''s'"
        );
    }

    #[test]
    fn at_priv_04_remediation_is_platform_specific() {
        assert_eq!(
            remediation_message(PlatformFamily::Windows),
            "Please restart the application as Administrator. Right-click on the executable \
             and select 'Run as administrator'."
        );
        assert!(remediation_message(PlatformFamily::MacOs).contains("sudo"));
    }
}
