//! Data-engine behaviour over real pipes and files, without a
//! negotiation phase.

use std::fs;
use std::io::Write;
use std::os::unix::io::IntoRawFd;
use std::path::Path;

use color_eyre::Result;
use rand::Rng;

use dgsh::tee::{Config, Engine};

/// A pipe read end whose contents are `data`, already at EOF.
fn loaded_pipe(data: &[u8]) -> Result<std::os::unix::io::RawFd> {
    let (r, w) = nix::unistd::pipe()?;
    let mut writer = fs::File::from(w);
    writer.write_all(data)?;
    drop(writer);
    Ok(r.into_raw_fd())
}

fn file_sink(path: &Path) -> Result<std::os::unix::io::RawFd> {
    Ok(fs::File::create(path)?.into_raw_fd())
}

#[test]
fn tee_copies_one_input_to_every_output() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let out1 = dir.path().join("out1");
    let out2 = dir.path().join("out2");
    let payload = b"hello\ngo\n";

    let mut engine = Engine::new(Config {
        // A tiny page size walks the payload across pages.
        buffer_size: 4,
        ..Config::default()
    });
    engine.add_source(Some("input".into()), loaded_pipe(payload)?)?;
    engine.add_sink(Some("out1".into()), file_sink(&out1)?)?;
    engine.add_sink(Some("out2".into()), file_sink(&out2)?)?;
    engine.run()?;

    assert_eq!(fs::read(&out1)?, payload);
    assert_eq!(fs::read(&out2)?, payload);
    Ok(())
}

#[test]
fn cat_concatenates_chained_inputs_in_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("out");

    let mut engine = Engine::new(Config::default());
    engine.add_source(Some("first".into()), loaded_pipe(b"first\n")?)?;
    engine.add_source(Some("second".into()), loaded_pipe(b"second\n")?)?;
    engine.add_sink(Some("out".into()), file_sink(&out)?)?;
    engine.run()?;

    assert_eq!(fs::read(&out)?, b"first\nsecond\n");
    Ok(())
}

#[test]
fn permutation_routes_each_input_to_its_named_output() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let k1 = dir.path().join("k1");
    let k2 = dir.path().join("k2");

    let mut engine = Engine::new(Config {
        permute: vec![1, 0],
        ..Config::default()
    });
    engine.add_source(Some("s1".into()), loaded_pipe(b"alpha\n")?)?;
    engine.add_source(Some("s2".into()), loaded_pipe(b"beta\n")?)?;
    engine.add_sink(Some("k1".into()), file_sink(&k1)?)?;
    engine.add_sink(Some("k2".into()), file_sink(&k2)?)?;
    engine.run()?;

    // -p 2,1: the first input lands on the second output.
    assert_eq!(fs::read(&k1)?, b"beta\n");
    assert_eq!(fs::read(&k2)?, b"alpha\n");
    Ok(())
}

#[test]
fn scatter_partitions_lines_across_sinks() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let s1 = dir.path().join("s1");
    let s2 = dir.path().join("s2");
    let payload = b"1\n2\n3\n4\n";

    let mut engine = Engine::new(Config {
        scatter: true,
        ..Config::default()
    });
    engine.add_source(Some("input".into()), loaded_pipe(payload)?)?;
    engine.add_sink(Some("s1".into()), file_sink(&s1)?)?;
    engine.add_sink(Some("s2".into()), file_sink(&s2)?)?;
    engine.run()?;

    let a = fs::read_to_string(&s1)?;
    let b = fs::read_to_string(&s2)?;
    assert_eq!(a.len() + b.len(), payload.len(), "bytes must be preserved");
    let mut seen: Vec<&str> = a.lines().chain(b.lines()).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec!["1", "2", "3", "4"]);
    // Record alignment: every piece ends on a terminator.
    for part in [&a, &b] {
        assert!(part.is_empty() || part.ends_with('\n'), "{part:?}");
    }
    Ok(())
}

#[test]
fn broken_sink_is_dropped_and_the_rest_completes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("out");
    let payload = b"survives a closed consumer\n";

    // A pipe whose read end is already gone delivers EPIPE on write.
    let (broken_r, broken_w) = nix::unistd::pipe()?;
    drop(broken_r);

    let mut engine = Engine::new(Config::default());
    engine.add_source(Some("input".into()), loaded_pipe(payload)?)?;
    engine.add_sink(Some("broken".into()), broken_w.into_raw_fd())?;
    engine.add_sink(Some("out".into()), file_sink(&out)?)?;
    engine.run()?;

    assert_eq!(fs::read(&out)?, payload);
    Ok(())
}

#[test]
fn spilled_pages_come_back_byte_identical() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let out = dir.path().join("out");

    let mut rng = rand::thread_rng();
    let payload: Vec<u8> = (0..64 * 1024).map(|_| rng.gen::<u8>()).collect();
    fs::write(&input, &payload)?;

    // A ceiling of two pages forces most of the input through the
    // spill file; input-side buffering reads it all regardless.
    let mut engine = Engine::new(Config {
        buffer_size: 4096,
        max_mem: 8192,
        use_tmp_file: true,
        input_side_buffering: true,
        tmp_dir: Some(dir.path().to_path_buf()),
        ..Config::default()
    });
    engine.add_source(
        Some("input".into()),
        fs::File::open(&input)?.into_raw_fd(),
    )?;
    engine.add_sink(Some("out".into()), file_sink(&out)?)?;
    engine.run()?;

    assert_eq!(fs::read(&out)?, payload);
    Ok(())
}

#[test]
fn memory_ceiling_without_spill_still_completes() -> Result<()> {
    // The engine throttles reading instead of failing when the pool
    // is full and no spill file is allowed.
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let out = dir.path().join("out");

    let payload: Vec<u8> = (0..32 * 1024).map(|i| (i % 251) as u8).collect();
    fs::write(&input, &payload)?;

    let mut engine = Engine::new(Config {
        buffer_size: 1024,
        max_mem: 4096,
        ..Config::default()
    });
    engine.add_source(
        Some("input".into()),
        fs::File::open(&input)?.into_raw_fd(),
    )?;
    engine.add_sink(Some("out".into()), file_sink(&out)?)?;
    engine.run()?;

    assert_eq!(fs::read(&out)?, payload);
    Ok(())
}
