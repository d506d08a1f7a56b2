//! The preloadable library end to end: `tests/c/scenarios.c` is compiled
//! against `include/safe_blocks.h` and run under `LD_PRELOAD`, with emulated
//! protection keys so any host can run it.
#![cfg(feature = "interpose")]

use std::{
    env,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Command, Output},
    sync::OnceLock,
};

const SOURCE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/c/scenarios.c");
const INCLUDE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/include");

/// The `cdylib` built alongside the rlib this test links against
fn library() -> PathBuf {
    let exe = env::current_exe().unwrap();
    let deps = exe.parent().unwrap();
    let candidates = [deps.join("libsafeheap.so"), deps.join("../libsafeheap.so")];
    candidates
        .into_iter()
        .find(|p| p.exists())
        .unwrap_or_else(|| panic!("libsafeheap.so not found next to {}", exe.display()))
}

/// Compiled once per test binary. `None` when there is no C compiler.
fn scenarios() -> Option<&'static Path> {
    static BINARY: OnceLock<Option<PathBuf>> = OnceLock::new();
    BINARY
        .get_or_init(|| {
            let out = Path::new(env!("CARGO_TARGET_TMPDIR")).join("scenarios");
            let cc = env::var("CC").unwrap_or_else(|_| "cc".to_owned());
            let status = Command::new(&cc)
                .args(["-O0", "-g", "-I", INCLUDE, SOURCE, "-o"])
                .arg(&out)
                .status();
            match status {
                Ok(status) => {
                    assert!(status.success(), "compiling {SOURCE} failed");
                    Some(out)
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    eprintln!("skipping, no C compiler ({cc})");
                    None
                }
                Err(e) => panic!("running {cc}: {e}"),
            }
        })
        .as_deref()
}

struct Run {
    stdout: String,
    stderr: String,
}

impl Run {
    /// The value printed as `key: value`
    fn value(&self, key: &str) -> &str {
        let prefix = format!("{key}: ");
        self.stdout
            .lines()
            .find_map(|l| l.strip_prefix(&prefix))
            .unwrap_or_else(|| panic!("no {key} in {:?}", self.stdout))
    }
}

/// Registry rows of a `safeheap_dump()`: address, size
fn rows(dump: &str) -> Vec<(String, usize)> {
    dump.lines()
        .filter(|l| l.starts_with("0x"))
        .map(|l| {
            let mut cols = l.split('\t');
            let addr = cols.next().unwrap().to_owned();
            let size = cols.next().unwrap().parse().unwrap();
            (addr, size)
        })
        .collect()
}

fn run(scenario: &str, vars: &[(&str, &str)]) -> Option<Run> {
    let binary = scenarios()?;
    let Output {
        status,
        stdout,
        stderr,
    } = Command::new(binary)
        .arg(scenario)
        .env("LD_PRELOAD", library())
        .env("SAFEHEAP_ISOLATION", "emulated")
        .envs(vars.iter().copied())
        .output()
        .unwrap();
    let run = Run {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    };
    assert!(
        status.success(),
        "{scenario}: {status}\nstdout:\n{}\nstderr:\n{}",
        run.stdout,
        run.stderr
    );
    Some(run)
}

#[test]
fn global_reference_keeps_the_object_until_cleared() {
    let Some(run) = run("global", &[]) else {
        return;
    };
    assert_eq!(run.value("kept"), "1234");
    let addr = run.value("addr");

    let (before, after) = run.stderr.split_once("--- cleared\n").unwrap();
    assert!(before.contains("free requests count: 5"));
    assert!(rows(before).iter().any(|(a, size)| a == addr && *size == 16));

    assert!(after.contains("free requests count: 9"));
    assert!(rows(after).iter().all(|(a, _)| a != addr));
}

#[test]
fn exempt_realloc_and_usable_size() {
    let Some(run) = run("exempt", &[]) else {
        return;
    };
    assert_eq!(run.value("realloc0"), "(nil)");
    assert_eq!(run.value("usable"), "40");

    // Purged, so only the realloc'd-away block and the last one are left
    let rows = rows(&run.stderr);
    assert_eq!(rows.len(), 2, "{}", run.stderr);
    assert!(rows.iter().any(|(_, size)| *size == 40));
    assert!(rows.iter().all(|(a, _)| a != run.value("exempt")));
}

#[test]
fn freeing_a_list_node_by_node() {
    let Some(run) = run("list", &[]) else {
        return;
    };
    assert_eq!(run.value("sum"), "1999000");
}

#[test]
fn constructor_and_destructor_run() {
    let Some(run) = run(
        "lifecycle",
        &[("SAFEHEAP_LOG", "info"), ("SAFEHEAP_DUMP_ON_EXIT", "1")],
    ) else {
        return;
    };
    assert!(run.stderr.contains("[runtime] safe heap at"), "{}", run.stderr);
    assert!(run.stderr.contains("(Emulated)"));
    let (_, exit) = run.stderr.split_once("bookkeeper_dump:").unwrap();
    assert_eq!(rows(exit).len(), 1);
    assert!(exit.contains("[runtime] exiting: 0 free requests"));
}
