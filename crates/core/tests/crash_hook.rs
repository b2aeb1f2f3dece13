use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use cfaraw_core::crash::{crash_dir, install_crash_hook, set_phase, CrashHook};
use cfaraw_core::device::Device;
use tempfile::tempdir;

const MAIN_THREAD_PAYLOAD: &str = "intentional panic on the main thread";
const WORKER_PAYLOAD: &str = "intentional panic in sample worker 3";
const UNWRITABLE_PAYLOAD: &str = "intentional panic with an unwritable crash dir";

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env("CFARAW_PANIC_CHILD_MODE", mode)
        .env("CFARAW_PANIC_CHILD_DATA_DIR", data_dir)
        .output()
        .expect("run panic hook child")
}

fn collect_crash_artifacts(crash_dir: &Path) -> Vec<PathBuf> {
    let mut paths = fs::read_dir(crash_dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("read crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

fn read_all_artifacts(data_dir: &Path) -> String {
    collect_crash_artifacts(&crash_dir(data_dir))
        .iter()
        .map(|path| fs::read_to_string(path).expect("read crash artifact"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var("CFARAW_PANIC_CHILD_MODE") else {
        return;
    };

    let data_dir = PathBuf::from(
        std::env::var("CFARAW_PANIC_CHILD_DATA_DIR")
            .expect("CFARAW_PANIC_CHILD_DATA_DIR must be set"),
    );

    let first_install = install_crash_hook(Some(data_dir.as_path()));
    assert_eq!(first_install, CrashHook::Installed(crash_dir(&data_dir)));
    let second_install = install_crash_hook(Some(data_dir.as_path()));
    assert_eq!(second_install, CrashHook::AlreadyInstalled(crash_dir(&data_dir)));

    match mode.as_str() {
        "main_thread" => panic!("{MAIN_THREAD_PAYLOAD}"),
        "sample_worker" => {
            set_phase("training epoch 1/4");
            let _ = Device::Accelerator.map_indexed(8, |index| {
                if index == 3 {
                    panic!("{WORKER_PAYLOAD}");
                }
                Ok(index)
            });
        }
        "unwritable" => {
            let crash_dir = crash_dir(&data_dir);
            if crash_dir.exists() {
                fs::remove_dir_all(&crash_dir).expect("remove crash directory");
            }
            fs::write(&crash_dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("{UNWRITABLE_PAYLOAD}");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn crash_hook_writes_crash_file() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("main_thread", data_dir.path());

    assert!(!output.status.success(), "child process should panic");

    let crash_artifacts = collect_crash_artifacts(&crash_dir(data_dir.path()));
    assert!(!crash_artifacts.is_empty(), "expected crash artifact");

    let newest_artifact = crash_artifacts.last().expect("artifact path");
    let contents = fs::read_to_string(newest_artifact).expect("read crash artifact");

    assert!(contents.contains("time="));
    assert!(contents.contains(&format!("message={MAIN_THREAD_PAYLOAD}")));
    assert!(contents.contains("phase=startup"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace="));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn crash_hook_records_panics_from_sample_workers() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("sample_worker", data_dir.path());

    assert!(!output.status.success(), "worker panic should reach the caller");
    let contents = read_all_artifacts(data_dir.path());
    assert!(contents.contains(&format!("message={WORKER_PAYLOAD}")));
    assert!(contents.contains("phase=training epoch 1/4"));
}

#[test]
fn crash_hook_unwritable_crash_dir_warns_and_does_not_repanic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("unwritable", data_dir.path());

    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(UNWRITABLE_PAYLOAD));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
