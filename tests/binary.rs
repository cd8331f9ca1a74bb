//! Integration tests for the dgsh-conc and dgsh-tee binaries.

use std::{
    env, fs,
    io::Write,
    path::PathBuf,
    process::{Command, Output, Stdio},
};

use color_eyre::Result;
use rand::Rng;
use serial_test::serial;

fn exe_path(name: &str) -> PathBuf {
    let bin_dir = env::current_exe()
        .unwrap()
        .parent()
        .expect("test executable's directory")
        .parent()
        .expect("output directory")
        .to_path_buf();
    bin_dir.join(name)
}

/// A dgsh-tee command outside any graph: negotiation degenerates to
/// stdio passthrough.
fn tee_cmd() -> Command {
    let mut cmd = Command::new(exe_path("dgsh-tee"));
    cmd.env_remove("DGSH_IN").env_remove("DGSH_OUT");
    cmd
}

fn cmd_stdout(out: Output) -> String {
    String::from_utf8(out.stdout).expect("non utf-8 output")
}

#[test]
fn test_tee_help_flag() {
    let out = tee_cmd()
        .arg("--help")
        .output()
        .expect("failed to run dgsh-tee --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("Buffer data"));
    assert!(stdout.contains("-s"));
}

#[test]
fn test_conc_help_flag() {
    let out = Command::new(exe_path("dgsh-conc"))
        .arg("--help")
        .output()
        .expect("failed to run dgsh-conc --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("Input concentrator"));
    assert!(stdout.contains("Output concentrator"));
}

#[test]
fn test_tee_copies_stdin_to_stdout() -> Result<()> {
    let mut child = tee_cmd()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"pass through me\n")?;
    let out = child.wait_with_output()?;
    assert!(out.status.success());
    assert_eq!(out.stdout, b"pass through me\n");
    Ok(())
}

#[test]
fn test_tee_copies_file_to_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    fs::write(&input, "file to file\n")?;

    let status = tee_cmd()
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .status()?;
    assert!(status.success());
    assert_eq!(fs::read_to_string(&output)?, "file to file\n");
    Ok(())
}

#[test]
fn test_tee_fans_out_to_every_output() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let b_out = dir.path().join("b.out");
    let c_out = dir.path().join("c.out");

    let mut child = tee_cmd()
        .arg("-o")
        .arg(&b_out)
        .arg("-o")
        .arg(&c_out)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()?;
    child.stdin.take().unwrap().write_all(b"hello\ngo\n")?;
    let status = child.wait()?;
    assert!(status.success());

    assert_eq!(fs::read_to_string(&b_out)?, "hello\ngo\n");
    assert_eq!(fs::read_to_string(&c_out)?, "hello\ngo\n");
    Ok(())
}

#[test]
fn test_tee_scatter_is_line_aligned() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let s1 = dir.path().join("s1");
    let s2 = dir.path().join("s2");

    let mut rng = rand::thread_rng();
    let lines: Vec<String> = (0..200)
        .map(|i| format!("{i} {}", rng.gen::<u32>()))
        .collect();
    let payload = lines.join("\n") + "\n";
    fs::write(&input, &payload)?;

    let status = tee_cmd()
        .arg("-s")
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&s1)
        .arg("-o")
        .arg(&s2)
        .status()?;
    assert!(status.success());

    let a = fs::read_to_string(&s1)?;
    let b = fs::read_to_string(&s2)?;
    assert_eq!(a.len() + b.len(), payload.len(), "bytes must be preserved");
    let mut seen: Vec<String> = a.lines().chain(b.lines()).map(String::from).collect();
    seen.sort_by_key(|l| {
        l.split_whitespace()
            .next()
            .unwrap()
            .parse::<usize>()
            .unwrap()
    });
    assert_eq!(seen, lines, "every line lands in exactly one output");
    Ok(())
}

#[test]
fn test_tee_append_flag_accumulates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    fs::write(&input, "once\n")?;

    for _ in 0..2 {
        let status = tee_cmd()
            .arg("-a")
            .arg("-i")
            .arg(&input)
            .arg("-o")
            .arg(&output)
            .status()?;
        assert!(status.success());
    }
    assert_eq!(fs::read_to_string(&output)?, "once\nonce\n");
    Ok(())
}

#[test]
fn test_tee_rejects_bad_permutation() {
    let out = tee_cmd()
        .arg("-p")
        .arg("0,7")
        .output()
        .expect("failed to run dgsh-tee");
    assert_eq!(out.status.code(), Some(1));
}

#[test]
// serialize: the spill stress shares the machine's memory and tmp space
#[serial]
fn test_tee_survives_memory_pressure_with_spill() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");

    let mut rng = rand::thread_rng();
    let payload: Vec<u8> = (0..128 * 1024).map(|_| rng.gen::<u8>()).collect();
    fs::write(&input, &payload)?;

    let status = tee_cmd()
        .arg("-I")
        .arg("-f")
        .arg("-b")
        .arg("4096")
        .arg("-m")
        .arg("16k")
        .arg("-T")
        .arg(dir.path())
        .arg("-M")
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .status()?;
    assert!(status.success());
    assert_eq!(fs::read(&output)?, payload);
    Ok(())
}

#[test]
fn test_conc_fails_cleanly_without_its_descriptors() -> Result<()> {
    // A concentrator for two peers owns descriptors it never got; the
    // relay must give up with the protocol status before the timeout.
    let mut child = Command::new(exe_path("dgsh-conc"))
        .arg("-i")
        .arg("2")
        .env("DGSH_TIMEOUT", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    let status = child.wait()?;
    assert_eq!(status.code(), Some(65));
    Ok(())
}
