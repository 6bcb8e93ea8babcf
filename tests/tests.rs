use std::fs;
use std::path::{Path, PathBuf};
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use farrier::*;
use farrier::util::sha256_file;

/// Packs `files` under a single `<stem>/` directory into `<dir>/<stem>.tar.gz`.
fn tarball(dir: &Path, stem: &str, files: &[(&str, &str)]) -> (PathBuf, String) {
    let path = dir.join(format!("{stem}.tar.gz"));
    let encoder = GzEncoder::new(fs::File::create(&path).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (rel, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{stem}/{rel}"), body.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    let sha = sha256_file(&path).unwrap();
    (path, sha)
}

/// A formula directory with a fake `rust` toolchain and `horse`, which
/// builds with the `cargo` that `rust` installs.
fn setup_tests() -> (TempDir, Config) {
    let root = TempDir::new().unwrap();
    let sources = root.path().join("sources");
    let formula_dir = root.path().join("Formula");
    fs::create_dir_all(&sources).unwrap();
    fs::create_dir_all(&formula_dir).unwrap();

    let (rust_url, rust_sha) = tarball(
        &sources,
        "rust-1.80.0",
        &[(
            "cargo",
            "#!/bin/sh\n# cargo install --root DIR --path .\nmkdir -p \"$3/bin\" && cp horse.sh \"$3/bin/horse\" && chmod +x \"$3/bin/horse\"\n",
        )],
    );
    fs::write(
        formula_dir.join("rust.toml"),
        format!(
            r#"
name = "rust"
url = "file://{}"
sha256 = "{rust_sha}"

[[build]]
command = "sh"
args = ["-c", "mkdir -p {{out}}/bin && cp cargo {{out}}/bin/cargo"]

[[artifacts]]
kind = "bin"
path = "{{out}}/bin/cargo"
"#,
            rust_url.display()
        ),
    )
    .unwrap();

    let (horse_url, horse_sha) = tarball(
        &sources,
        "horse-0.1.0",
        &[
            ("horse.sh", "#!/bin/sh\necho neigh\n"),
            ("man/horse.1", ".TH HORSE 1\n"),
        ],
    );
    fs::write(
        formula_dir.join("horse.toml"),
        format!(
            r#"
name = "horse"
desc = "Display an animated ASCII art carousel of horses"
url = "file://{}"
sha256 = "{horse_sha}"

[[dependencies]]
name = "rust"
kind = "build"

[[build]]
command = "cargo"
args = ["install", "--root", "{{out}}", "--path", "."]

[[artifacts]]
kind = "bin"
path = "{{out}}/bin/horse"

[[artifacts]]
kind = "man1"
path = "man/horse.1"

[[test]]
type = "exists"
path = "bin/horse"

[[test]]
type = "run"
command = "horse"
output_contains = "neigh"
"#,
            horse_url.display()
        ),
    )
    .unwrap();

    let config = Config {
        prefix: root.path().join("prefix"),
        formula_dir,
        cache_dir: root.path().join("cache"),
        jobs: 2,
        fetch_timeout_secs: 30,
        build_timeout_secs: 60,
        test_timeout_secs: 30,
        build_path: vec![PathBuf::from("/usr/bin"), PathBuf::from("/bin")],
        passthrough_env: vec![],
    };
    (root, config)
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use farrier::*;
    use crate::setup_tests;

    #[test]
    fn test_install_horse_with_build_dependency() {
        let (_root, config) = setup_tests();
        let formulary = Formulary::load_dir(&config.formula_dir).unwrap();
        let order: Vec<&str> = resolve("horse", &formulary)
            .unwrap()
            .into_iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(order, vec!["rust", "horse"]);

        let pipeline = Pipeline::new(&config, &formulary).unwrap();
        let summary = pipeline
            .install("horse", InstallOptions { ignore_dependencies: false, run_tests: true })
            .unwrap();

        let installed: Vec<&str> = summary.installed.iter().map(|o| o.receipt.name.as_str()).collect();
        assert_eq!(installed, vec!["rust", "horse"]);
        assert!(config.prefix.join("bin/horse").exists());
        assert!(config.prefix.join("share/man/man1/horse.1").exists());
        assert!(summary.test_report.unwrap().passed());

        let receipt = InstallReceipt::load(&config.prefix, "horse").unwrap().unwrap();
        assert_eq!(receipt.version, "0.1.0");
        // rust is a build dependency only.
        assert!(receipt.runtime_dependencies.is_empty());
    }

    #[test]
    fn test_reinstall_is_idempotent() {
        let (_root, config) = setup_tests();
        let formulary = Formulary::load_dir(&config.formula_dir).unwrap();
        let pipeline = Pipeline::new(&config, &formulary).unwrap();

        pipeline.install("horse", InstallOptions::default()).unwrap();
        let first = InstallReceipt::load(&config.prefix, "horse").unwrap().unwrap();
        let summary = pipeline.install("horse", InstallOptions::default()).unwrap();
        let second = InstallReceipt::load(&config.prefix, "horse").unwrap().unwrap();

        assert_eq!(summary.installed.len(), 1);
        assert!(first.same_install(&second));
        assert_eq!(InstallReceipt::all(&config.prefix).unwrap().len(), 2);
        // The archive cache was used the second time around.
        assert_eq!(ArchiveCache::new(&config.cache_dir).entries().unwrap().len(), 2);
    }

    #[test]
    fn test_uninstall_removes_every_file() {
        let (_root, config) = setup_tests();
        let formulary = Formulary::load_dir(&config.formula_dir).unwrap();
        let pipeline = Pipeline::new(&config, &formulary).unwrap();
        pipeline.install("horse", InstallOptions::default()).unwrap();

        let receipt = pipeline.uninstall("horse", false).unwrap();
        for file in &receipt.files {
            assert!(!config.prefix.join(file).exists(), "{} left behind", file.display());
        }
        assert!(!InstallReceipt::is_installed(&config.prefix, "horse"));
        assert!(matches!(
            pipeline.test("horse"),
            Err(FarrierError::NotInstalled { .. })
        ));
        // The build dependency stays.
        assert!(config.prefix.join("bin/cargo").exists());
    }

    #[test]
    fn test_build_failure_reports_exit_code() {
        let (_root, mut config) = setup_tests();
        let text = fs::read_to_string(config.formula_dir.join("rust.toml"))
            .unwrap()
            .replace("mkdir -p {out}/bin && cp cargo {out}/bin/cargo", "echo no toolchain >&2; exit 7");
        fs::write(config.formula_dir.join("rust.toml"), text).unwrap();
        config.jobs = 1;

        let formulary = Formulary::load_dir(&config.formula_dir).unwrap();
        let pipeline = Pipeline::new(&config, &formulary).unwrap();
        let err = pipeline.install("horse", InstallOptions::default()).unwrap_err();
        match &err {
            FarrierError::Build { formula, exit_code, output, .. } => {
                assert_eq!(formula, "rust");
                assert_eq!(*exit_code, Some(7));
                assert!(output.contains("no toolchain"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.stage(), Stage::Build);
        assert!(!InstallReceipt::is_installed(&config.prefix, "horse"));
    }

    #[test]
    fn test_ignore_dependencies_without_toolchain_fails_to_build() {
        let (_root, config) = setup_tests();
        let formulary = Formulary::load_dir(&config.formula_dir).unwrap();
        let pipeline = Pipeline::new(&config, &formulary).unwrap();

        let err = pipeline
            .install("horse", InstallOptions { ignore_dependencies: true, run_tests: false })
            .unwrap_err();
        // No rust installed, so `cargo` is not on the build PATH.
        assert!(matches!(err, FarrierError::Build { exit_code: None, .. }));
    }
}
