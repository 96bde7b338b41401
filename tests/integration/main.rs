//! Integration tests for forgecache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    fn forgecache() -> Command {
        cargo_bin_cmd!("forgecache")
    }

    #[test]
    fn help_displays() {
        forgecache()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("content-addressed export cache"));
    }

    #[test]
    fn version_displays() {
        forgecache()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("forgecache"));
    }

    #[test]
    fn config_path() {
        forgecache()
            .args(["--no-local", "config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        forgecache()
            .args(["--no-local", "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[export]"));
    }

    #[test]
    fn cache_status_empty() {
        let temp = tempfile::TempDir::new().unwrap();
        forgecache()
            .args(["--no-local", "cache", "status", "--cache-dir"])
            .arg(temp.path().join("cache"))
            .assert()
            .success()
            .stdout(predicate::str::contains("Entries:         0"));
    }

    #[test]
    fn export_without_inputs_fails() {
        forgecache()
            .args(["--no-local", "export"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nothing to export"));
    }
}

#[cfg(unix)]
mod export_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Workspace with a fake kernel that counts its invocations
    struct Workspace {
        dir: TempDir,
        config_path: PathBuf,
        count_file: PathBuf,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let count_file = dir.path().join("kernel-invocations");

            // Parses `-o <out> <in>`, fails on BAD geometry, otherwise
            // emits a STEP-headered artifact derived from the input
            let kernel = dir.path().join("fake-kernel");
            fs::write(
                &kernel,
                format!(
                    r#"#!/bin/sh
out=""
in=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) in="$1"; shift ;;
  esac
done
echo run >> "{count}"
if grep -q BAD "$in"; then
  echo "degenerate geometry" >&2
  exit 2
fi
printf 'ISO-10303-21;\n' > "$out"
cat "$in" >> "$out"
"#,
                    count = count_file.display()
                ),
            )
            .unwrap();
            fs::set_permissions(&kernel, fs::Permissions::from_mode(0o755)).unwrap();

            let config_path = dir.path().join("config.toml");
            fs::write(
                &config_path,
                format!(
                    r#"
[cache]
dir = "{cache}"

[export]
kernel_bin = "{kernel}"
kernel_args = []
timeout_secs = 30
"#,
                    cache = dir.path().join("cache").display(),
                    kernel = kernel.display()
                ),
            )
            .unwrap();

            Self {
                dir,
                config_path,
                count_file,
            }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn write_input(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.path().join(name);
            fs::write(&path, contents).unwrap();
            path
        }

        fn conversions(&self) -> usize {
            fs::read_to_string(&self.count_file)
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        fn export(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("forgecache");
            cmd.arg("--no-local")
                .arg("--config")
                .arg(&self.config_path)
                .arg("export")
                .arg("--json")
                .arg("--out-dir")
                .arg(self.path().join("out"));
            cmd
        }
    }

    fn report(output: &[u8]) -> serde_json::Value {
        serde_json::from_slice(output).expect("report is valid JSON")
    }

    #[test]
    fn identical_inputs_convert_once_and_share_bytes() {
        let ws = Workspace::new();
        let a = ws.write_input("a.csg", "BOX 10x10x10\n");
        let b = ws.write_input("b.csg", "BOX 10x10x10\n");

        let output = ws.export().arg(&a).arg(&b).assert().success();
        let value = report(&output.get_output().stdout);

        assert_eq!(ws.conversions(), 1);
        let results = value["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["status"], "converted");
        assert_eq!(results[0]["fingerprint"], results[1]["fingerprint"]);
        assert_eq!(results[0]["link_strategy"], "symlink");

        let bytes_a = fs::read(ws.path().join("out/a.step")).unwrap();
        let bytes_b = fs::read(ws.path().join("out/b.step")).unwrap();
        assert_eq!(bytes_a, bytes_b);
        assert!(bytes_a.starts_with(b"ISO-10303-21;"));
    }

    #[test]
    fn distinct_input_costs_second_conversion() {
        let ws = Workspace::new();
        let a = ws.write_input("a.csg", "BOX 10x10x10\n");
        let b = ws.write_input("b.csg", "BOX 10x10x10\n");
        let c = ws.write_input("c.csg", "BOX 12x10x10\n");

        ws.export().arg(&a).arg(&b).arg(&c).assert().success();

        assert_eq!(ws.conversions(), 2);
    }

    #[test]
    fn second_run_hits_cache() {
        let ws = Workspace::new();
        let a = ws.write_input("a.csg", "BOX 10x10x10\n");

        ws.export().arg(&a).assert().success();
        assert_eq!(ws.conversions(), 1);

        // Fresh process, same cache directory
        let fresh = ws.write_input("fresh.csg", "BOX 10x10x10\n");
        let output = ws.export().arg(&fresh).assert().success();
        let value = report(&output.get_output().stdout);

        assert_eq!(ws.conversions(), 1);
        assert_eq!(value["results"][0]["cache_hit"], true);
    }

    #[test]
    fn malformed_group_does_not_block_siblings() {
        let ws = Workspace::new();
        let good = ws.write_input("good.csg", "BOX 10x10x10\n");
        let bad = ws.write_input("bad.csg", "BAD GEOMETRY\n");

        let output = ws.export().arg(&bad).arg(&good).assert().failure();
        let value = report(&output.get_output().stdout);

        assert_eq!(value["results"][0]["status"], "failed");
        assert_eq!(value["results"][0]["kind"], "non_zero_exit");
        assert_eq!(value["results"][1]["status"], "converted");
        assert!(ws.path().join("out/good.step").exists());
        assert!(!ws.path().join("out/bad.step").exists());
    }

    #[test]
    fn batch_manifest_drives_outputs() {
        let ws = Workspace::new();
        let a = ws.write_input("a.csg", "TILE 1\n");
        let manifest = ws.path().join("batch.json");
        fs::write(
            &manifest,
            format!(
                r#"[{{"id": "tile-1", "source": "{}", "output": "{}"}}]"#,
                a.display(),
                ws.path().join("custom/tile_one.step").display()
            ),
        )
        .unwrap();

        let mut cmd = cargo_bin_cmd!("forgecache");
        let output = cmd
            .arg("--no-local")
            .arg("--config")
            .arg(&ws.config_path)
            .arg("export")
            .arg("--json")
            .arg("--batch")
            .arg(&manifest)
            .assert()
            .success();
        let value = report(&output.get_output().stdout);

        assert_eq!(value["results"][0]["request_id"], "tile-1");
        assert!(ws.path().join("custom/tile_one.step").exists());
    }

    #[test]
    fn missing_input_fails_only_its_request() {
        let ws = Workspace::new();
        let good = ws.write_input("good.csg", "BOX 10x10x10\n");
        let missing = ws.path().join("never-written.csg");

        let output = ws.export().arg(&missing).arg(&good).assert().failure();
        let value = report(&output.get_output().stdout);

        assert_eq!(value["results"][0]["status"], "failed");
        assert_eq!(value["results"][1]["status"], "converted");
    }

    #[test]
    fn cache_list_shows_committed_entry() {
        let ws = Workspace::new();
        let a = ws.write_input("a.csg", "BOX 10x10x10\n");
        ws.export().arg(&a).assert().success();

        let mut cmd = cargo_bin_cmd!("forgecache");
        cmd.arg("--no-local")
            .arg("--config")
            .arg(&ws.config_path)
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::is_match("^[0-9a-f]{64}\n$").unwrap());
    }

    #[test]
    fn cache_clear_empties_registry() {
        let ws = Workspace::new();
        let a = ws.write_input("a.csg", "BOX 10x10x10\n");
        ws.export().arg(&a).assert().success();

        let mut cmd = cargo_bin_cmd!("forgecache");
        cmd.arg("--no-local")
            .arg("--config")
            .arg(&ws.config_path)
            .args(["cache", "clear", "--yes"])
            .assert()
            .success();

        let mut status = cargo_bin_cmd!("forgecache");
        status
            .arg("--no-local")
            .arg("--config")
            .arg(&ws.config_path)
            .args(["cache", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Entries:         0"));
    }
}
