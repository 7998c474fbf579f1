//! Integration tests for strata

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn strata() -> Command {
        cargo_bin_cmd!("strata")
    }

    fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("strata.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn help_displays() {
        strata()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("boot"));
    }

    #[test]
    fn version_displays() {
        strata()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }

    #[test]
    fn config_path_from_flag() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("custom.toml");
        strata()
            .arg("--config")
            .arg(&config)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_show_flattens_tables() {
        let temp = TempDir::new().unwrap();
        let config = write_config(
            temp.path(),
            "[cache_instance.mem]\ntype = \"ram\"\nsize = 300\n",
        );
        strata()
            .arg("--config")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cache_instance.mem.type=ram"))
            .stdout(predicate::str::contains("cache_instance.mem.size=300"));
    }

    #[test]
    fn boot_library_succeeds() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let config = write_config(
            temp.path(),
            &format!("[cache]\ndir = \"{}\"\n", cache.display()),
        );
        strata()
            .arg("--config")
            .arg(&config)
            .args(["boot", "repo", "--format", "json"])
            .assert()
            .code(0)
            .stdout(predicate::str::contains("\"status\": \"ok\""));
        assert!(cache.join(".stratacache").exists());
        assert!(!cache.join("running.repo").exists());
    }

    #[test]
    fn boot_with_conflicting_options_exits_with_options_status() {
        let temp = TempDir::new().unwrap();
        let config = write_config(
            temp.path(),
            &format!(
                "[cache]\nbase = \"{}\"\ndir = \"{}\"\n",
                temp.path().join("base").display(),
                temp.path().join("dir").display()
            ),
        );
        strata()
            .arg("--config")
            .arg(&config)
            .args(["boot", "repo"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("mutually exclusive"));
        assert!(!temp.path().join("dir").exists());
    }

    #[test]
    fn boot_cycle_reports_failure() {
        let temp = TempDir::new().unwrap();
        let config = write_config(
            temp.path(),
            &format!(
                r#"[cache]
dir = "{}"
primary = "a"

[cache_instance.a]
type = "tiered"
upper = "b"
lower = "default"

[cache_instance.b]
type = "tiered"
upper = "a"
lower = "default"
"#,
                temp.path().join("cache").display()
            ),
        );
        strata()
            .arg("--config")
            .arg(&config)
            .args(["boot", "repo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Circular cache definition"));
    }

    #[test]
    fn plan_prints_tree() {
        let temp = TempDir::new().unwrap();
        let config = write_config(
            temp.path(),
            r#"[cache]
primary = "tiers"
dir = "/srv/strata"

[cache_instance.tiers]
type = "tiered"
upper = "mem"
lower = "default"

[cache_instance.mem]
type = "ram"
size = 256
"#,
        );
        strata()
            .arg("--config")
            .arg(&config)
            .args(["plan", "repo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("tiers"))
            .stdout(predicate::str::contains("mem"))
            .stdout(predicate::str::contains("/srv/strata"));
    }

    #[test]
    fn plan_missing_type_is_options_error() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "[cache]\nprimary = \"ghost\"\n");
        strata()
            .arg("--config")
            .arg(&config)
            .args(["plan", "repo"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("cache_instance.ghost.type"));
    }

    #[test]
    fn invalid_config_file_exits_with_options_status() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "cache = [unterminated");
        strata()
            .arg("--config")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("strata.toml"));
    }
}
