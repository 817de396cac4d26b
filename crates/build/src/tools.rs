use std::{
    ffi::OsString,
    path::Path,
    process::Stdio,
    time::Duration,
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Error, Result};

const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 4 * 60 * 60;
const STDERR_TAIL_LEN: usize = 4096;

/// The disk transformations a build strategy can ask for. Each call either
/// leaves the named image transformed or fails.
#[async_trait::async_trait]
pub trait DiskTools: Send + Sync {
    async fn generate(&self, template: &str, dst: &Path, commands_file: &Path) -> Result<()>;
    async fn create_layered(&self, base: &Path, dst: &Path) -> Result<()>;
    async fn customize(&self, image: &Path, commands_file: &Path) -> Result<()>;
    async fn sysprep(&self, image: &Path) -> Result<()>;
    async fn sparsify(&self, image: &Path) -> Result<()>;
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolOptions {
    #[serde(default = "default_tool_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for ToolOptions {
    fn default() -> Self {
        ToolOptions {
            timeout: default_tool_timeout(),
            verbose: false,
        }
    }
}

fn default_tool_timeout() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

impl ToolOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Runs the libguestfs and qemu binaries found on `PATH`.
#[derive(Clone, Debug, Default)]
pub struct LibguestfsTools {
    options: ToolOptions,
}

impl LibguestfsTools {
    pub fn new(options: ToolOptions) -> LibguestfsTools {
        LibguestfsTools { options }
    }

    fn invocation(&self, tool: &str) -> ToolInvocation {
        let mut invocation = ToolInvocation::new(tool, self.options.timeout());
        if self.options.verbose {
            invocation = invocation.arg("-v");
        }
        invocation
    }
}

#[async_trait::async_trait]
impl DiskTools for LibguestfsTools {
    async fn generate(&self, template: &str, dst: &Path, commands_file: &Path) -> Result<()> {
        self.invocation("virt-builder")
            .arg(prefixed("--commands-from-file=", commands_file))
            .arg(prefixed("--output=", dst))
            .arg("--format=qcow2")
            .arg(template)
            .run()
            .await
    }

    async fn create_layered(&self, base: &Path, dst: &Path) -> Result<()> {
        ToolInvocation::new("qemu-img", self.options.timeout())
            .arg("create")
            .arg("-f")
            .arg("qcow2")
            .arg("-F")
            .arg("qcow2")
            .arg("-b")
            .arg(base.as_os_str())
            .arg(dst.as_os_str())
            .run()
            .await
    }

    async fn customize(&self, image: &Path, commands_file: &Path) -> Result<()> {
        self.invocation("virt-customize")
            .arg(prefixed("--commands-from-file=", commands_file))
            .arg("--format=qcow2")
            .arg(prefixed("--add=", image))
            .run()
            .await
    }

    async fn sysprep(&self, image: &Path) -> Result<()> {
        self.invocation("virt-sysprep")
            .arg("--format=qcow2")
            .arg("--selinux-relabel")
            .arg(prefixed("--add=", image))
            .run()
            .await
    }

    async fn sparsify(&self, image: &Path) -> Result<()> {
        self.invocation("virt-sparsify")
            .arg("--format")
            .arg("qcow2")
            .arg("--in-place")
            .arg(image.as_os_str())
            .run()
            .await
    }
}

fn prefixed(prefix: &str, path: &Path) -> OsString {
    let mut value = OsString::from(prefix);
    value.push(path.as_os_str());
    value
}

/// One external command with a deadline. The child is killed if the
/// invocation is dropped or times out.
pub struct ToolInvocation {
    tool: String,
    args: Vec<OsString>,
    timeout: Duration,
}

impl ToolInvocation {
    pub fn new(tool: &str, timeout: Duration) -> ToolInvocation {
        ToolInvocation {
            tool: tool.to_string(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> ToolInvocation {
        self.args.push(arg.into());
        self
    }

    pub fn command_line(&self) -> String {
        let mut line = self.tool.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    pub async fn run(self) -> Result<()> {
        debug!("running command={}", self.command_line());
        let mut command = Command::new(&self.tool);
        command
            .args(&self.args)
            .env("LIBGUESTFS_BACKEND", "direct")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(home) = std::env::var_os("HOME") {
            command.env("HOME", home);
        }

        let child = command.spawn()?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!("command timed out tool={} timeout={:?}", self.tool, self.timeout);
                return Err(Error::ToolTimeout {
                    tool: self.tool,
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("tool={} stdout:\n{}", self.tool, stdout.trim_end());
        }
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = if stderr.len() > STDERR_TAIL_LEN {
            let mut start = stderr.len() - STDERR_TAIL_LEN;
            while !stderr.is_char_boundary(start) {
                start += 1;
            }
            &stderr[start..]
        } else {
            &stderr[..]
        };
        Err(Error::ToolFailed {
            tool: self.tool,
            status: output.status.to_string(),
            stderr: tail.trim().to_string(),
        })
    }
}
