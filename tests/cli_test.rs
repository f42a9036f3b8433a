//! End-to-end tests driving the lanbeam binary
//!
//! A receiver runs with `--once` in the background and a sender pushes files
//! to it over loopback.

use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn lanbeam_bin() -> String {
    env!("CARGO_BIN_EXE_lanbeam").to_string()
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Config file so the user's own config never leaks into tests.
fn write_config(dir: &Path, name: &str) -> String {
    let path = dir.join("config.toml");
    fs::write(&path, format!("device_name = \"{}\"\nidle_timeout_secs = 10\n", name)).unwrap();
    path.to_str().unwrap().to_string()
}

fn spawn_receiver(config: &str, port: u16, dest: &Path) -> Child {
    Command::new(lanbeam_bin())
        .args([
            "--config",
            config,
            "receive",
            "--port",
            &port.to_string(),
            "--dest",
            dest.to_str().unwrap(),
            "--once",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap()
}

/// Run `lanbeam send`, retrying while the receiver is still starting up.
fn send_with_retry(config: &str, port: u16, paths: &[&Path]) -> Output {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let mut cmd = Command::new(lanbeam_bin());
        cmd.args(["--config", config, "send", &format!("127.0.0.1:{}", port)]);
        cmd.args(paths);
        let output = cmd.output().unwrap();

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || !stderr.contains("Failed to connect") {
            return output;
        }
        assert!(Instant::now() < deadline, "receiver never came up: {}", stderr);
        thread::sleep(Duration::from_millis(100));
    }
}

fn wait_for_exit(child: &mut Child) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return status.success();
        }
        thread::sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    false
}

// =============================================================================
// Send / Receive
// =============================================================================

#[test]
fn test_send_directory_to_receiver() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let config = write_config(home.path(), "test-laptop");

    let album = source.path().join("album");
    fs::create_dir_all(album.join("raw")).unwrap();
    fs::write(album.join("cover.jpg"), vec![0xAB; 70_000]).unwrap();
    fs::write(album.join("raw/notes.txt"), "shot on film").unwrap();
    fs::write(source.path().join("readme.txt"), "hello").unwrap();

    let port = free_port();
    let mut receiver = spawn_receiver(&config, port, dest.path());

    let output = send_with_retry(
        &config,
        port,
        &[album.as_path(), source.path().join("readme.txt").as_path()],
    );
    assert!(
        output.status.success(),
        "lanbeam send failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    assert!(wait_for_exit(&mut receiver), "receiver did not exit after --once");
    let stdout = receiver.wait_with_output().unwrap().stdout;
    let stdout = String::from_utf8_lossy(&stdout);
    assert!(stdout.contains("test-laptop"), "receiver output: {}", stdout);

    assert_eq!(fs::read(dest.path().join("album/cover.jpg")).unwrap(), vec![0xAB; 70_000]);
    assert_eq!(
        fs::read_to_string(dest.path().join("album/raw/notes.txt")).unwrap(),
        "shot on film"
    );
    assert_eq!(fs::read_to_string(dest.path().join("readme.txt")).unwrap(), "hello");
}

#[test]
#[cfg(unix)]
fn test_executable_bit_survives() {
    use std::os::unix::fs::PermissionsExt;

    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let config = write_config(home.path(), "builder");

    let script = source.path().join("deploy.sh");
    fs::write(&script, "#!/bin/sh\necho deploy\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let port = free_port();
    let mut receiver = spawn_receiver(&config, port, dest.path());
    let output = send_with_retry(&config, port, &[script.as_path()]);
    assert!(output.status.success());
    assert!(wait_for_exit(&mut receiver));

    let mode = fs::metadata(dest.path().join("deploy.sh")).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0, "mode was {:o}", mode);
}

// =============================================================================
// Argument and config errors
// =============================================================================

#[test]
fn test_send_missing_path_fails() {
    let home = TempDir::new().unwrap();
    let config = write_config(home.path(), "laptop");

    let output = Command::new(lanbeam_bin())
        .args(["--config", &config, "send", "127.0.0.1:1", "/definitely/not/here"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to collect files"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_file_fails() {
    let home = TempDir::new().unwrap();
    let missing = home.path().join("nope.toml");

    let output = Command::new(lanbeam_bin())
        .args(["--config", missing.to_str().unwrap(), "receive", "--once"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Config file not found"));
}
