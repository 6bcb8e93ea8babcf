use std::fs;
use std::path::{Path, PathBuf};
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{tempdir, TempDir};
use farrier::util::sha256_file;

struct Env {
    root: TempDir,
}

impl Env {
    fn new() -> Self {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("Formula")).unwrap();
        fs::create_dir_all(root.path().join("sources")).unwrap();
        fs::write(
            root.path().join("config.toml"),
            format!(
                "cache_dir = \"{}\"\nbuild_path = [\"/usr/bin\", \"/bin\"]\n",
                root.path().join("cache").display()
            ),
        )
        .unwrap();
        Self { root }
    }

    fn prefix(&self) -> PathBuf {
        self.root.path().join("prefix")
    }

    fn farrier(&self) -> Command {
        let mut cmd = Command::cargo_bin("farrier").unwrap();
        cmd.env_remove("FARRIER_LOG")
            .env("NO_COLOR", "1")
            .arg("--prefix")
            .arg(self.prefix())
            .arg("--formula-dir")
            .arg(self.root.path().join("Formula"))
            .arg("--config")
            .arg(self.root.path().join("config.toml"));
        cmd
    }

    /// Adds a formula whose source is a single shell script named `name`.
    fn add_formula(&self, name: &str, extra: &str) -> String {
        let source = self.root.path().join("sources").join(format!("{name}-1.0.sh"));
        fs::write(&source, format!("#!/bin/sh\necho hello from {name}\n")).unwrap();
        let sha = sha256_file(&source).unwrap();
        let text = format!(
            r#"name = "{name}"
version = "1.0"
url = "{}"
sha256 = "{sha}"
{extra}
"#,
            source.display()
        );
        fs::write(self.root.path().join("Formula").join(format!("{name}.toml")), &text).unwrap();
        sha
    }

    fn add_tool(&self, name: &str) -> String {
        self.add_formula(
            name,
            &format!(
                r#"
[[build]]
command = "sh"
args = ["-c", "cp {name}-1.0.sh {{out}}/{name}"]

[[artifacts]]
kind = "bin"
path = "{{out}}/{name}"

[[test]]
type = "run"
command = "{name}"
output_contains = "hello from {name}"
"#
            ),
        )
    }
}

fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

#[cfg(unix)]
#[test]
fn test_install_test_list_uninstall() {
    let env = Env::new();
    env.add_tool("pony");

    env.farrier()
        .args(["install", "pony", "--test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed pony"))
        .stdout(predicate::str::contains("1/1 assertions passed"));
    assert!(exists(&env.prefix().join("bin/pony")));

    env.farrier()
        .args(["test", "pony"])
        .assert()
        .success();

    env.farrier()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("pony 1.0"));

    env.farrier()
        .args(["info", "pony"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed: 1.0"));

    env.farrier()
        .args(["uninstall", "pony"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Uninstalled pony"));
    assert!(!exists(&env.prefix().join("bin/pony")));

    env.farrier()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No formulas installed"));
}

#[test]
fn test_unknown_formula_exits_with_resolve_code() {
    let env = Env::new();
    env.farrier()
        .args(["install", "zebra"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("formula 'zebra' not found"));
}

#[test]
fn test_missing_dependency_names_dependent() {
    let env = Env::new();
    env.add_formula("cart", "[[dependencies]]\nname = \"horse\"\n");
    env.farrier()
        .args(["deps", "cart"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("required by 'cart'"));
}

#[test]
fn test_cycle_exits_with_resolve_code() {
    let env = Env::new();
    env.add_formula("egg", "[[dependencies]]\nname = \"hen\"\n");
    env.add_formula("hen", "[[dependencies]]\nname = \"egg\"\n");
    env.farrier()
        .args(["install", "egg"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("egg -> hen -> egg"));
}

#[test]
fn test_deps_prints_install_order() {
    let env = Env::new();
    env.add_formula("rust", "");
    env.add_formula("horse", "[[dependencies]]\nname = \"rust\"\nkind = \"build\"\n");
    env.farrier()
        .args(["deps", "horse"])
        .assert()
        .success()
        .stdout("rust\nhorse\n");
}

#[test]
fn test_checksum_mismatch_exits_with_fetch_code() {
    let env = Env::new();
    let sha = env.add_tool("pony");
    let path = env.root.path().join("Formula/pony.toml");
    let text = fs::read_to_string(&path).unwrap();
    fs::write(&path, text.replace(&sha, &"0".repeat(64))).unwrap();

    env.farrier()
        .args(["install", "pony"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("checksum mismatch"));
    assert!(!exists(&env.prefix().join("bin/pony")));
}

#[cfg(unix)]
#[test]
fn test_build_failure_exits_with_build_code() {
    let env = Env::new();
    env.add_formula(
        "lame",
        r#"
[[build]]
command = "sh"
args = ["-c", "echo cannot walk >&2; exit 9"]
"#,
    );
    env.farrier()
        .args(["install", "lame"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("exit code 9"))
        .stderr(predicate::str::contains("cannot walk"));
}

#[cfg(unix)]
#[test]
fn test_foreign_file_exits_with_install_code() {
    let env = Env::new();
    env.add_tool("pony");
    fs::create_dir_all(env.prefix().join("bin")).unwrap();
    fs::write(env.prefix().join("bin/pony"), "mine").unwrap();

    env.farrier()
        .args(["install", "pony"])
        .assert()
        .code(5);
    assert_eq!(fs::read_to_string(env.prefix().join("bin/pony")).unwrap(), "mine");
}

#[test]
fn test_not_installed_exit_codes() {
    let env = Env::new();
    env.add_tool("pony");
    env.farrier()
        .args(["test", "pony"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("not installed"));
    env.farrier()
        .args(["uninstall", "pony"])
        .assert()
        .code(7);
}

#[cfg(unix)]
#[test]
fn test_failing_assertion_exits_with_test_code() {
    let env = Env::new();
    env.add_formula(
        "ghost",
        r#"
[[test]]
type = "exists"
path = "bin/ghost"
"#,
    );
    env.farrier().args(["install", "ghost"]).assert().success();
    env.farrier()
        .args(["test", "ghost"])
        .assert()
        .code(6)
        .stdout(predicate::str::contains("FAILED bin/ghost exists"));
}

#[cfg(unix)]
#[test]
fn test_uninstall_refuses_runtime_dependency() {
    let env = Env::new();
    env.add_tool("pony");
    env.add_formula("cart", "[[dependencies]]\nname = \"pony\"\n");
    env.farrier().args(["install", "cart"]).assert().success();

    env.farrier()
        .args(["uninstall", "pony"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("required by cart"));
    env.farrier()
        .args(["uninstall", "pony", "--ignore-dependencies"])
        .assert()
        .success();
}

#[cfg(unix)]
#[test]
fn test_clean_removes_cached_archives() {
    let env = Env::new();
    env.add_tool("pony");
    env.farrier().args(["install", "pony"]).assert().success();
    env.farrier()
        .arg("clean")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 archives"));
}
