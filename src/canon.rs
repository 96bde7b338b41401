//! Canonicalization collaborator
//!
//! Thin wrapper around the external tool that lowers a parametric source
//! file into canonical geometry text (OpenSCAD's CSG export, typically).
//! The cache depends on one contract here: identical sources always yield
//! byte-identical output. The wrapper adds nothing of its own to the
//! output; it only stages paths, environment, and a timeout.

use crate::error::{ForgeError, ForgeResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Driver for the external canonicalization binary
pub struct Canonicalizer {
    bin: PathBuf,
    extra_args: Vec<String>,
    timeout: Duration,
    search_path: Option<PathBuf>,
}

impl Canonicalizer {
    pub fn new(
        bin: impl Into<PathBuf>,
        extra_args: Vec<String>,
        timeout: Duration,
        search_path: Option<PathBuf>,
    ) -> Self {
        Self {
            bin: bin.into(),
            extra_args,
            timeout,
            search_path,
        }
    }

    /// Produce the canonical representation for a parametric source file
    pub async fn produce_canonical(&self, source: &Path) -> ForgeResult<Vec<u8>> {
        let output_path = staging_output(source);
        let command_line = format!(
            "{} --export-format csg -o {} {}",
            self.bin.display(),
            output_path.display(),
            source.display()
        );
        debug!("Canonicalizing: {}", command_line);

        let mut command = Command::new(&self.bin);
        command
            .args(&self.extra_args)
            .arg("--export-format")
            .arg("csg")
            .arg("-o")
            .arg(&output_path)
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // AppImage builds of OpenSCAD need this to run headless
        command.env("APPIMAGE_EXTRACT_AND_RUN", "1");
        if let Some(ref search) = self.search_path {
            let value = match std::env::var("OPENSCADPATH") {
                Ok(existing) if !existing.is_empty() => {
                    format!("{}:{}", search.display(), existing)
                }
                _ => search.display().to_string(),
            };
            command.env("OPENSCADPATH", value);
        }

        let child = command
            .spawn()
            .map_err(|e| ForgeError::kernel_launch(&command_line, e))?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| ForgeError::io(format!("waiting for {}", command_line), e))?,
            Err(_) => {
                let _ = tokio::fs::remove_file(&output_path).await;
                return Err(ForgeError::KernelTimeout {
                    command: command_line,
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(ForgeError::KernelExit {
                command: command_line,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let bytes = tokio::fs::read(&output_path).await.map_err(|_| {
            // Imports and surface primitives cannot be lowered to CSG
            ForgeError::MalformedArtifact {
                path: output_path.clone(),
                reason: "canonicalizer produced no CSG output".to_string(),
            }
        })?;
        let _ = tokio::fs::remove_file(&output_path).await;

        if bytes.is_empty() {
            return Err(ForgeError::EmptyRepresentation);
        }
        Ok(bytes)
    }
}

fn staging_output(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".to_string());
    source
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{}.{}.canonical.csg", stem, std::process::id()))
}
