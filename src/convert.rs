//! Geometry kernel invocation
//!
//! Drives the external process that turns a canonical representation into
//! concrete artifact bytes. Only the current reservation holder calls
//! this, and only into a registry scratch path; publication is the
//! registry's job. No retry policy here either, that belongs to the
//! orchestrator's caller.

use crate::error::{ForgeError, ForgeResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Magic prefix of an ISO 10303-21 (STEP) exchange file
const STEP_HEADER: &[u8] = b"ISO-10303-21";

/// Abstract conversion backend
///
/// The production implementation shells out to a geometry kernel; tests
/// substitute an in-process fake to observe call counts and inject
/// failures.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `representation` into artifact bytes at `scratch`
    ///
    /// On success the complete artifact exists at `scratch`; on failure
    /// nothing observable is left there.
    async fn convert(&self, representation: &[u8], scratch: &Path) -> ForgeResult<()>;

    /// Human-readable backend name for logs
    fn name(&self) -> &'static str;
}

/// Converter backed by an external geometry kernel binary
///
/// Invoked as `<bin> [args..] -o <output> <input>`, the calling
/// convention shared by OpenSCAD-style kernels.
pub struct KernelConverter {
    bin: PathBuf,
    extra_args: Vec<String>,
    timeout: Duration,
    artifact_ext: String,
    validate_output: bool,
}

impl KernelConverter {
    pub fn new(
        bin: impl Into<PathBuf>,
        extra_args: Vec<String>,
        timeout: Duration,
        artifact_ext: impl Into<String>,
        validate_output: bool,
    ) -> Self {
        Self {
            bin: bin.into(),
            extra_args,
            timeout,
            artifact_ext: artifact_ext.into(),
            validate_output,
        }
    }

    fn command_line(&self, output: &Path, input: &Path) -> String {
        format!(
            "{} {} -o {} {}",
            self.bin.display(),
            self.extra_args.join(" "),
            output.display(),
            input.display()
        )
    }

    /// Check the kernel's output for structural validity
    fn validate(&self, scratch: &Path) -> ForgeResult<()> {
        let meta = std::fs::metadata(scratch).map_err(|_| ForgeError::MalformedArtifact {
            path: scratch.to_path_buf(),
            reason: "kernel exited successfully but wrote no output".to_string(),
        })?;
        if meta.len() == 0 {
            return Err(ForgeError::MalformedArtifact {
                path: scratch.to_path_buf(),
                reason: "kernel wrote an empty artifact".to_string(),
            });
        }

        if self.validate_output && self.artifact_ext == "step" {
            let mut head = vec![0u8; STEP_HEADER.len()];
            let ok = std::fs::File::open(scratch)
                .and_then(|mut f| std::io::Read::read_exact(&mut f, &mut head))
                .is_ok()
                && head == STEP_HEADER;
            if !ok {
                return Err(ForgeError::MalformedArtifact {
                    path: scratch.to_path_buf(),
                    reason: "missing ISO-10303-21 header".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Converter for KernelConverter {
    async fn convert(&self, representation: &[u8], scratch: &Path) -> ForgeResult<()> {
        // The kernel reads from a file, so stage the representation next
        // to the scratch output (same volume, cleaned up below).
        let input = scratch.with_extension("src.csg");
        tokio::fs::write(&input, representation)
            .await
            .map_err(|e| ForgeError::io(format!("staging kernel input {}", input.display()), e))?;

        let command_line = self.command_line(scratch, &input);
        debug!("Invoking kernel: {}", command_line);

        let mut command = Command::new(&self.bin);
        command
            .args(&self.extra_args)
            .arg("-o")
            .arg(scratch)
            .arg(&input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = run_with_timeout(command, self.timeout, &command_line).await;
        let _ = tokio::fs::remove_file(&input).await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let _ = tokio::fs::remove_file(scratch).await;
                return Err(e);
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_file(scratch).await;
            return Err(ForgeError::KernelExit {
                command: command_line,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if let Err(e) = self.validate(scratch) {
            let _ = tokio::fs::remove_file(scratch).await;
            return Err(e);
        }

        info!("Kernel produced {}", scratch.display());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "kernel"
    }
}

async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
    command_line: &str,
) -> ForgeResult<std::process::Output> {
    let child = command
        .spawn()
        .map_err(|e| ForgeError::kernel_launch(command_line, e))?;

    // kill_on_drop reaps the child when the timeout wins the race
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|e| ForgeError::io(format!("waiting for {}", command_line), e))
        }
        Err(_) => Err(ForgeError::KernelTimeout {
            command: command_line.to_string(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}
