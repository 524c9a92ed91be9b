//! Integration tests for Cairn

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Isolated environment: config, state and cache all live in a temp dir
    struct Env {
        dir: TempDir,
    }

    impl Env {
        fn new() -> Self {
            Self::with_config("")
        }

        fn with_config(extra: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let cache = dir.path().join("cache");
            let config = format!(
                "[general]\naudit_log = false\n\n[cache]\ndir = {:?}\n\n{}",
                cache.display().to_string(),
                extra
            );
            fs::write(dir.path().join("config.toml"), config).unwrap();
            fs::create_dir_all(dir.path().join("work")).unwrap();
            Self { dir }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn work(&self) -> PathBuf {
            self.path().join("work")
        }

        fn cairn(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("cairn");
            cmd.current_dir(self.work())
                .env("HOME", self.path())
                .env("XDG_STATE_HOME", self.path().join("state"))
                .env_remove("CAIRN_CONFIG")
                .arg("--no-local")
                .arg("-c")
                .arg(self.path().join("config.toml"));
            cmd
        }
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("cairn")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("reproducible resolution"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("cairn")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("cairn"));
    }

    #[test]
    fn config_path() {
        let env = Env::new();
        env.cairn()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let env = Env::with_config("[gc]\nkeep_bytes = \"2GB\"\n");
        env.cairn()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("keep_bytes = 2147483648"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let env = Env::with_config("[gc]\nkeep_bytes = \"lots\"\n");
        env.cairn()
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn lock_record_then_resolve() {
        let env = Env::new();
        env.cairn()
            .args([
                "lock",
                "record",
                "core",
                "http.get",
                "-i",
                "https://example.com/a.tgz",
                "-o",
                "sha256:aaa",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Locked"));

        env.cairn()
            .args(["lock", "resolve", "core", "http.get", "-i", "https://example.com/a.tgz"])
            .assert()
            .success()
            .stdout("sha256:aaa\n");

        let content = fs::read_to_string(env.work().join("cairn.lock")).unwrap();
        assert!(content.contains(r#"["core","http.get",["https://example.com/a.tgz"],"sha256:aaa"]"#));
    }

    #[test]
    fn lock_resolve_missing_fails() {
        let env = Env::new();
        env.cairn()
            .args(["lock", "resolve", "core", "http.get", "-i", "https://nowhere"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("is not locked"));
    }

    #[test]
    fn lock_resolve_fallback_pins_output() {
        let env = Env::new();
        let resolve = |fallback: Option<&str>| {
            let mut cmd = env.cairn();
            cmd.args(["lock", "resolve", "core", "git", "-i", "commit", "-i", "https://g/r"]);
            if let Some(output) = fallback {
                cmd.args(["--fallback", output]);
            }
            cmd.assert()
        };

        resolve(Some("abc123")).success().stdout("abc123\n");
        // pinned now: a different fallback is ignored
        resolve(Some("def456")).success().stdout("abc123\n");
        resolve(None).success().stdout("abc123\n");
    }

    #[test]
    fn lock_reject_policy_requires_relock() {
        let env = Env::with_config("[lockfile]\nconflict = \"reject\"\n");
        let record = |output: &str, relock: bool| {
            let mut cmd = env.cairn();
            cmd.args(["lock", "record", "core", "container.from", "-i", "alpine:3"])
                .args(["-i", "linux/amd64", "-o", output]);
            if relock {
                cmd.arg("--relock");
            }
            cmd.assert()
        };

        record("sha256:one", false).success();
        record("sha256:two", false)
            .failure()
            .stderr(predicate::str::contains("conflict"));
        record("sha256:two", true)
            .success()
            .stdout(predicate::str::contains("was sha256:one"));
    }

    #[test]
    fn lock_list_and_verify() {
        let env = Env::new();
        let lockfile = env.path().join("deps.lock");
        let lockfile = lockfile.to_str().unwrap();

        for (url, output) in [("https://b", "sha256:b"), ("https://a", "sha256:a")] {
            env.cairn()
                .args(["lock", "record", "core", "http.get", "-i", url, "-o", output])
                .args(["--lockfile", lockfile])
                .assert()
                .success();
        }

        env.cairn()
            .args(["lock", "list", "--format", "plain", "--lockfile", lockfile])
            .assert()
            .success()
            .stdout(predicate::str::contains("https://a").and(predicate::str::contains("https://b")));

        env.cairn()
            .args(["lock", "verify", "--lockfile", lockfile])
            .assert()
            .success()
            .stdout(predicate::str::contains("2 entries"));
    }

    #[test]
    fn lock_verify_rejects_corrupt_file() {
        let env = Env::new();
        fs::write(env.work().join("cairn.lock"), "[[\"version\",\"1\"]]\nnot json\n").unwrap();
        env.cairn()
            .args(["lock", "verify"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Corrupt lockfile"));
    }

    #[test]
    fn digest_is_stable_and_confined() {
        let env = Env::new();
        let src = env.work().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("main.rs"), "fn main() {}").unwrap();

        let first = env
            .cairn()
            .args(["digest", "dir", "src"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let first = String::from_utf8(first).unwrap();
        assert!(first.starts_with("sha256:"));

        env.cairn()
            .args(["digest", "dir", "src"])
            .assert()
            .success()
            .stdout(first.clone());

        env.cairn()
            .args(["digest", "file", "../config.toml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("outside workspace root"));
    }

    #[test]
    fn digest_json_output() {
        let env = Env::new();
        fs::write(env.work().join("README"), "hello").unwrap();
        env.cairn()
            .args(["digest", "--format", "json", "file", "README"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"size\": 5"));
    }

    #[test]
    fn cache_add_list_and_usage() {
        let env = Env::with_config("[gc]\nkeep_bytes = \"1GB\"\n");
        let file = env.path().join("blob.bin");
        fs::write(&file, vec![7u8; 2048]).unwrap();

        env.cairn()
            .args(["cache", "add"])
            .arg(&file)
            .args(["-d", "test blob"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Added"));

        env.cairn()
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("test blob"));

        env.cairn()
            .args(["cache", "keep-bytes"])
            .assert()
            .success()
            .stdout("1073741824\n");

        env.cairn()
            .args(["cache", "usage"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Entries:  1"));
    }

    #[test]
    fn cache_gc_evicts_over_budget() {
        let env =
            Env::with_config("[gc]\nenabled = false\nkeep_bytes = 0\nsettle_delay_ms = 0\n");
        let file = env.path().join("blob.bin");
        fs::write(&file, vec![1u8; 512]).unwrap();

        for _ in 0..2 {
            env.cairn().args(["cache", "add"]).arg(&file).assert().success();
        }

        env.cairn()
            .args(["cache", "gc", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Would evict 2 entries"));

        env.cairn()
            .args(["cache", "gc"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Evicted"));

        env.cairn()
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries"));
    }

    #[test]
    fn cache_prune_removes_inactive_entries() {
        let env = Env::with_config("[gc]\nenabled = false\nkeep_bytes = \"1GB\"\nsettle_delay_ms = 0\n");
        let file = env.path().join("blob.bin");
        fs::write(&file, b"data").unwrap();

        env.cairn().args(["cache", "add"]).arg(&file).assert().success();
        env.cairn()
            .args(["cache", "prune"])
            .assert()
            .success()
            .stdout(predicate::str::contains("from 1 entries"));

        env.cairn()
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout("");
    }

    #[test]
    fn cache_add_missing_file_fails() {
        let env = Env::new();
        env.cairn()
            .args(["cache", "add", "no-such-file"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Not a file"));
    }
}
