//! End-to-end negotiations over real socketpairs, one thread per
//! participant, exercising the full block circulation, the solver and
//! the descriptor exchange.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::thread;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use serial_test::serial;

use dgsh::negotiate::{negotiate, NegotiateFlags, Outcome, Session};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

fn sockpair() -> (OwnedFd, OwnedFd) {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .expect("socketpair")
}

fn ready(outcome: Outcome) -> Result<(Vec<i32>, Vec<i32>)> {
    match outcome {
        Outcome::Ready {
            input_fds,
            output_fds,
        } => Ok((input_fds, output_fds)),
        Outcome::DrawExit => Err(eyre!("unexpected draw-exit")),
    }
}

#[test]
#[serial]
fn linear_pipeline_negotiates_and_moves_data() -> Result<()> {
    let (a_out, b_in) = sockpair();
    let (b_out, c_in) = sockpair();

    let source = thread::spawn(move || -> Result<()> {
        let session = Session::new("gen", false, true, None, None)
            .over_fds(-1, a_out.as_raw_fd());
        let (inputs, outputs) = ready(session.negotiate()?)?;
        assert!(inputs.is_empty());
        assert_eq!(outputs.len(), 1);
        let mut w = unsafe { File::from_raw_fd(outputs[0]) };
        w.write_all(b"hello through the graph\n")?;
        Ok(())
    });

    let filter = thread::spawn(move || -> Result<()> {
        let session = Session::new("filter", true, true, None, None)
            .over_fds(b_in.as_raw_fd(), b_out.as_raw_fd());
        let (inputs, outputs) = ready(session.negotiate()?)?;
        assert_eq!(inputs.len(), 1);
        assert_eq!(outputs.len(), 1);
        let mut r = unsafe { File::from_raw_fd(inputs[0]) };
        let mut w = unsafe { File::from_raw_fd(outputs[0]) };
        let mut data = Vec::new();
        r.read_to_end(&mut data)?;
        w.write_all(&data)?;
        Ok(())
    });

    let sink = thread::spawn(move || -> Result<String> {
        let session = Session::new("sink", true, false, None, None)
            .over_fds(c_in.as_raw_fd(), -1);
        let (inputs, outputs) = ready(session.negotiate()?)?;
        assert_eq!(inputs.len(), 1);
        assert!(outputs.is_empty());
        let mut r = unsafe { File::from_raw_fd(inputs[0]) };
        let mut text = String::new();
        r.read_to_string(&mut text)?;
        Ok(text)
    });

    source.join().unwrap()?;
    filter.join().unwrap()?;
    let text = sink.join().unwrap()?;
    assert_eq!(text, "hello through the graph\n");
    Ok(())
}

#[test]
#[serial]
fn flexible_source_matches_fixed_consumer() -> Result<()> {
    // The consumer asks for exactly two channels; the flexible source
    // must provide both over the single edge.
    let (a_out, b_in) = sockpair();

    let source = thread::spawn(move || -> Result<usize> {
        let session = Session::new("gen", false, true, None, Some(-1))
            .over_fds(-1, a_out.as_raw_fd());
        let (_, outputs) = ready(session.negotiate()?)?;
        for fd in &outputs {
            drop(unsafe { File::from_raw_fd(*fd) });
        }
        Ok(outputs.len())
    });
    let sink = thread::spawn(move || -> Result<usize> {
        let session = Session::new("merge", true, false, Some(2), None)
            .over_fds(b_in.as_raw_fd(), -1);
        let (inputs, _) = ready(session.negotiate()?)?;
        for fd in &inputs {
            drop(unsafe { File::from_raw_fd(*fd) });
        }
        Ok(inputs.len())
    });

    assert_eq!(source.join().unwrap()?, 2);
    assert_eq!(sink.join().unwrap()?, 2);
    Ok(())
}

#[test]
#[serial]
fn unsatisfiable_constraints_fail_everywhere() {
    let (a_out, b_in) = sockpair();

    let source = thread::spawn(move || {
        Session::new("one-out", false, true, None, Some(1))
            .over_fds(-1, a_out.as_raw_fd())
            .negotiate()
    });
    // Two inputs demanded from a producer that provides one and has
    // no other consumer.
    let sink = thread::spawn(move || {
        Session::new("two-in", true, false, Some(2), None)
            .over_fds(b_in.as_raw_fd(), -1)
            .negotiate()
    });

    assert!(source.join().unwrap().is_err());
    assert!(sink.join().unwrap().is_err());
}

#[test]
#[serial]
fn draw_exit_releases_every_participant() -> Result<()> {
    std::env::set_var("DGSH_DRAW_EXIT", "1");
    let (a_out, b_in) = sockpair();

    let source = thread::spawn(move || {
        Session::new("gen", false, true, None, None)
            .over_fds(-1, a_out.as_raw_fd())
            .negotiate()
    });
    let sink = thread::spawn(move || {
        Session::new("sink", true, false, None, None)
            .over_fds(b_in.as_raw_fd(), -1)
            .negotiate()
    });

    let a = source.join().unwrap();
    let b = sink.join().unwrap();
    std::env::remove_var("DGSH_DRAW_EXIT");
    assert!(matches!(a?, Outcome::DrawExit));
    assert!(matches!(b?, Outcome::DrawExit));
    Ok(())
}

#[test]
#[serial]
fn no_graph_means_stdio_passthrough() -> Result<()> {
    std::env::remove_var("DGSH_IN");
    std::env::remove_var("DGSH_OUT");
    let (inputs, outputs) = ready(negotiate(
        NegotiateFlags::empty(),
        "solo",
        Some(-1),
        Some(-1),
    )?)?;
    assert_eq!(inputs, vec![0]);
    assert_eq!(outputs, vec![1]);

    // A process negotiates once.
    assert!(negotiate(NegotiateFlags::empty(), "solo", None, None).is_err());
    Ok(())
}
