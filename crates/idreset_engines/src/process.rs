#![forbid(unsafe_code)]

use std::process::{Command, Stdio};
use std::sync::Arc;

use idreset_kernel_contracts::PlatformFamily;
use tracing::{debug, warn};

/// Process enumeration and termination for the target application.
pub trait ProcessControl: Send + Sync {
    fn target_label(&self) -> String;

    fn is_running(&self) -> bool;

    /// Sends one termination request. Does not wait for the process to exit.
    fn request_termination(&self) -> Result<(), String>;
}

impl<T: ProcessControl + ?Sized> ProcessControl for Arc<T> {
    fn target_label(&self) -> String {
        (**self).target_label()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }

    fn request_termination(&self) -> Result<(), String> {
        (**self).request_termination()
    }
}

#[derive(Debug, Clone)]
pub struct HostProcessControl {
    platform: PlatformFamily,
    process_names: Vec<String>,
}

impl HostProcessControl {
    pub fn new(platform: PlatformFamily, process_names: Vec<String>) -> Self {
        Self {
            platform,
            process_names,
        }
    }

    fn name_is_running(&self, name: &str) -> bool {
        match self.platform {
            PlatformFamily::Windows => {
                let filter = format!("IMAGENAME eq {name}");
                match Command::new("tasklist")
                    .args(["/FI", &filter, "/NH"])
                    .stderr(Stdio::null())
                    .output()
                {
                    Ok(out) => tasklist_mentions(&String::from_utf8_lossy(&out.stdout), name),
                    Err(err) => {
                        debug!(error = %err, "tasklist unavailable");
                        false
                    }
                }
            }
            PlatformFamily::MacOs | PlatformFamily::Linux => Command::new("pgrep")
                .args(["-x", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or_else(|err| {
                    debug!(error = %err, "pgrep unavailable");
                    false
                }),
            PlatformFamily::Other(_) => false,
        }
    }

    fn terminate_name(&self, name: &str) -> Result<(), String> {
        let status = match self.platform {
            PlatformFamily::Windows => Command::new("taskkill")
                .args(["/F", "/IM", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
            PlatformFamily::MacOs | PlatformFamily::Linux => Command::new("pkill")
                .args(["-x", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
            PlatformFamily::Other(os) => {
                return Err(format!("process termination not supported on {os}"))
            }
        }
        .map_err(|e| format!("failed to run termination command for {name}: {e}"))?;
        if !status.success() {
            return Err(format!("termination command for {name} exited with {status}"));
        }
        Ok(())
    }
}

impl ProcessControl for HostProcessControl {
    fn target_label(&self) -> String {
        self.process_names.join("/")
    }

    fn is_running(&self) -> bool {
        self.process_names
            .iter()
            .any(|name| self.name_is_running(name))
    }

    fn request_termination(&self) -> Result<(), String> {
        let mut failures = Vec::new();
        for name in &self.process_names {
            if !self.name_is_running(name) {
                continue;
            }
            if let Err(err) = self.terminate_name(name) {
                warn!(process = %name, error = %err, "termination request failed");
                failures.push(err);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }
}

fn tasklist_mentions(output: &str, name: &str) -> bool {
    let needle = name.to_ascii_lowercase();
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|image| image.to_ascii_lowercase() == needle)
}
