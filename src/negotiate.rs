//! The distributed negotiation engine.
//!
//! Every tool on the graph calls [`negotiate`] before touching data. A
//! message block is circulated over the participants' standard streams
//! and filled with their I/O requirements; the initiator solves the
//! constraint problem and circulates the solution; a final pass
//! exchanges the actual pipe descriptors over the same streams using
//! ancillary messages. On success the first negotiated descriptor of
//! each side has been duped over the corresponding standard stream.

use std::fs::File;
use std::io::Write as _;
use std::mem::ManuallyDrop;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use log::{debug, info};
use nix::errno::Errno;
use nix::libc;
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;

use crate::codec::{self, ProtocolError};
use crate::fdpass;
use crate::graph::{Edge, MessageBlock, Node, State, DIR_STDIN, DIR_STDOUT};
use crate::solver::{self, SolveOptions, SolveOutcome};

/// Exit status for a failed or timed-out negotiation.
pub const EX_PROTOCOL: i32 = 65;
/// Exit status after a draw-exit run.
pub const EX_DRAW_EXIT: i32 = 69;

/// Negotiation timeout when `DGSH_TIMEOUT` is unset (seconds).
const DEFAULT_TIMEOUT: u32 = 5;

bitflags! {
    /// Flags accepted by [`negotiate`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NegotiateFlags: u32 {
        /// On failure, print one diagnostic line and exit the process
        /// with [`EX_PROTOCOL`] (or [`EX_DRAW_EXIT`] after a draw-exit
        /// run) instead of returning.
        const HANDLE_ERROR = 0x100;
    }
}

/// What the caller should do after a successful negotiation.
#[derive(Debug)]
pub enum Outcome {
    /// Run the data phase over the returned descriptors. The first
    /// input descriptor is stdin and the first output descriptor is
    /// stdout; ownership of all of them moves to the caller.
    Ready {
        input_fds: Vec<RawFd>,
        output_fds: Vec<RawFd>,
    },
    /// The graph was solved for drawing only; exit without a data
    /// phase.
    DrawExit,
}

/// Set once a negotiation has finished in this process, and consulted
/// by the alarm handler. The handler itself may only write to stderr
/// and `_exit`.
static NEGOTIATION_COMPLETED: AtomicBool = AtomicBool::new(false);

extern "C" fn alarm_handler(signal: libc::c_int) {
    if signal == libc::SIGALRM && !NEGOTIATION_COMPLETED.load(Ordering::Relaxed) {
        let msg = b"dgsh: timeout for negotiation, exiting\n";
        unsafe {
            libc::write(2, msg.as_ptr().cast(), msg.len());
            libc::_exit(EX_PROTOCOL);
        }
    }
}

/// Arm the per-process negotiation alarm (`DGSH_TIMEOUT` seconds,
/// default 5).
pub fn arm_negotiation_timeout() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(alarm_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGALRM, &action) }.wrap_err("installing SIGALRM handler")?;
    let secs = std::env::var("DGSH_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT);
    unistd::alarm::set(secs);
    Ok(())
}

/// Cancel the alarm and stop handling `SIGALRM`.
pub fn disarm_negotiation_timeout() {
    NEGOTIATION_COMPLETED.store(true, Ordering::Relaxed);
    unistd::alarm::cancel();
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let _ = unsafe { sigaction(Signal::SIGALRM, &ignore) };
}

/// Borrow a raw descriptor as a `File` without taking ownership.
pub(crate) fn borrowed_file(fd: RawFd) -> ManuallyDrop<File> {
    ManuallyDrop::new(unsafe { File::from_raw_fd(fd) })
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0)
        != 0
}

#[derive(Default)]
struct SeenCounts {
    run: i32,
    error: i32,
    draw_exit: i32,
}

/// One participant's negotiation state: the local node, the block it
/// currently holds, and the descriptors it negotiates over.
///
/// [`negotiate`] is the conventional entry point; a `Session` can also
/// be driven directly over explicit descriptors, which is how the
/// engine is exercised in-process.
pub struct Session {
    tool_name: String,
    pid: i32,
    dgsh_in: bool,
    dgsh_out: bool,
    requires_channels: i32,
    provides_channels: i32,
    sock_in: RawFd,
    sock_out: RawFd,
    rewire_stdio: bool,
    solve_opts: SolveOptions,
    block: Option<MessageBlock>,
    self_index: i32,
    fd_direction: i32,
}

impl Session {
    /// Create a session. `n_inputs`/`n_outputs` carry the caller's
    /// channel constraints: `None` means one implicit stdio stream,
    /// −1 means flexible.
    pub fn new(
        tool_name: &str,
        dgsh_in: bool,
        dgsh_out: bool,
        n_inputs: Option<i32>,
        n_outputs: Option<i32>,
    ) -> Self {
        Session {
            tool_name: tool_name.to_string(),
            pid: unistd::getpid().as_raw(),
            dgsh_in,
            dgsh_out,
            requires_channels: n_inputs.unwrap_or(i32::from(dgsh_in)),
            provides_channels: n_outputs.unwrap_or(i32::from(dgsh_out)),
            sock_in: libc::STDIN_FILENO,
            sock_out: libc::STDOUT_FILENO,
            rewire_stdio: true,
            solve_opts: SolveOptions::from_env(),
            block: None,
            self_index: -1,
            fd_direction: -1,
        }
    }

    /// Negotiate over explicit descriptors instead of the standard
    /// streams, and leave stdin/stdout untouched afterwards.
    pub fn over_fds(mut self, sock_in: RawFd, sock_out: RawFd) -> Self {
        self.sock_in = sock_in;
        self.sock_out = sock_out;
        self.rewire_stdio = false;
        self
    }

    fn side_fd(&self, direction: i32) -> RawFd {
        if direction == DIR_STDIN {
            self.sock_in
        } else {
            self.sock_out
        }
    }

    /// Wait until the sides the protocol is interested in become
    /// ready, returning the ready directions in stdin-first order.
    fn wait_ready(&mut self, isread: bool) -> Result<Vec<i32>> {
        let mut dirs = Vec::with_capacity(2);
        if self.dgsh_out && !self.dgsh_in {
            self.fd_direction = DIR_STDOUT;
            dirs.push(DIR_STDOUT);
        } else if self.dgsh_in && !self.dgsh_out {
            self.fd_direction = DIR_STDIN;
            dirs.push(DIR_STDIN);
        } else if isread {
            dirs.push(DIR_STDIN);
            dirs.push(DIR_STDOUT);
        } else {
            // Pass the block across: received on one side, forwarded
            // on the other.
            let origin = self
                .block
                .as_ref()
                .map(|mb| mb.origin_fd_direction)
                .unwrap_or(DIR_STDIN);
            let dir = if origin == DIR_STDOUT {
                DIR_STDOUT
            } else {
                DIR_STDIN
            };
            self.fd_direction = dir;
            dirs.push(dir);
        }

        loop {
            let mut read_set = FdSet::new();
            let mut write_set = FdSet::new();
            let interest = if isread { &mut read_set } else { &mut write_set };
            for &d in &dirs {
                interest.insert(unsafe { BorrowedFd::borrow_raw(self.side_fd(d)) });
            }
            match select(None, &mut read_set, &mut write_set, None, None) {
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).wrap_err("select on negotiation descriptors"),
                Ok(_) => {
                    let fired = if isread { read_set } else { write_set };
                    let ready: Vec<i32> = dirs
                        .iter()
                        .copied()
                        .filter(|&d| {
                            fired.contains(unsafe { BorrowedFd::borrow_raw(self.side_fd(d)) })
                        })
                        .collect();
                    return Ok(ready);
                }
            }
        }
    }

    /// Record this participant in the block: its node (no-op when the
    /// pid is already present) and the edge implied by the block's
    /// origin and our own side.
    fn register_node_edge(&mut self) -> Result<()> {
        let mb = self.block.as_mut().expect("no block to register with");

        match mb.nodes.iter().position(|n| n.pid == self.pid) {
            Some(i) => self.self_index = i as i32,
            None => {
                self.self_index = mb.add_node(Node {
                    pid: self.pid,
                    index: -1,
                    name: self.tool_name.clone(),
                    requires_channels: self.requires_channels,
                    provides_channels: self.provides_channels,
                    dgsh_in: self.dgsh_in,
                    dgsh_out: self.dgsh_out,
                });
                debug!(
                    "added node {} at position {} on the graph, initiator {}",
                    self.tool_name, self.self_index, mb.initiator_pid
                );
            }
        }

        // A freshly constructed block carries no origin yet.
        if mb.origin_index < 0 {
            return Ok(());
        }
        if mb.origin_index as usize >= mb.nodes.len() {
            bail!(ProtocolError::new(format!(
                "dispatcher node index {} not present in graph",
                mb.origin_index
            )));
        }

        let edge = if mb.origin_fd_direction == DIR_STDIN {
            // Sent from the origin's stdin side, so the origin is the
            // destination and we are the source.
            self.fd_direction = if self.dgsh_in { DIR_STDIN } else { DIR_STDOUT };
            Edge {
                from: self.self_index,
                to: mb.origin_index,
                instances: 0,
                from_instances: 0,
                to_instances: 0,
            }
        } else {
            self.fd_direction = if self.dgsh_out { DIR_STDOUT } else { DIR_STDIN };
            Edge {
                from: mb.origin_index,
                to: self.self_index,
                instances: 0,
                from_instances: 0,
                to_instances: 0,
            }
        };
        debug_assert_ne!(edge.from, edge.to);
        if !mb.has_edge_between(edge.from, edge.to) {
            mb.add_edge(edge);
            debug!("added edge {} -> {}; graph now has {} edges", edge.from, edge.to, mb.edges.len());
        }
        Ok(())
    }

    /// Fold a received block (or a read failure) into the session. The
    /// received message is the single truth for shared state.
    fn analyse_read(&mut self, fresh: Option<MessageBlock>, seen: &mut SeenCounts) {
        match fresh {
            Some(mb) => self.block = Some(mb),
            None => {
                let mb = self
                    .block
                    .get_or_insert_with(|| MessageBlock::new(self.pid));
                mb.state = State::Error;
            }
        }
        let state = {
            let mb = self.block.as_ref().unwrap();
            (mb.state, mb.is_error_confirmed)
        };
        match state {
            (State::Error, true) => seen.error += 1,
            (State::Error, false) => {}
            (State::DrawExit, _) => seen.draw_exit += 1,
            (State::Run, _) => seen.run += 1,
            (State::Negotiation, _) => {
                if self.register_node_edge().is_err() {
                    self.block.as_mut().unwrap().state = State::Error;
                }
            }
            _ => {}
        }
    }

    /// Stamp the block with this participant as dispatcher before a
    /// write.
    fn set_dispatcher(&mut self) {
        let mb = self.block.as_mut().expect("no block to dispatch");
        debug_assert!(self.self_index >= 0);
        mb.origin_index = self.self_index;
        mb.origin_fd_direction = self.fd_direction;
        mb.is_origin_conc = false;
        mb.conc_pid = -1;
    }

    /// Run the protocol loop to completion and perform the descriptor
    /// exchange. Returns the negotiated outcome.
    pub fn negotiate(mut self) -> Result<Outcome> {
        let n_io_sides = i32::from(self.dgsh_in) + i32::from(self.dgsh_out);
        let mut seen = SeenCounts::default();
        let mut isread;

        if self.dgsh_out && !self.dgsh_in {
            // A pure source constructs the block and speaks first.
            self.block = Some(MessageBlock::new(self.pid));
            if self.register_node_edge().is_err() {
                self.block.as_mut().unwrap().state = State::Error;
            }
            isread = false;
        } else {
            isread = true;
        }

        let final_state = 'protocol: loop {
            let pass_is_read = isread;
            let ready = self.wait_ready(pass_is_read)?;
            for dir in ready {
                if !pass_is_read {
                    self.set_dispatcher();
                    let fd = self.side_fd(dir);
                    let write_failed = {
                        let mb = self.block.as_ref().unwrap();
                        let mut w = borrowed_file(fd);
                        let res = codec::write_block(&mut *w, mb);
                        let _ = w.flush();
                        res.is_err()
                    };
                    if write_failed {
                        self.block.as_mut().unwrap().state = State::Error;
                    }
                    if n_io_sides == seen.run
                        || n_io_sides == seen.error
                        || n_io_sides == seen.draw_exit
                    {
                        let mb = self.block.as_mut().unwrap();
                        if mb.state == State::Run {
                            mb.state = State::Complete;
                        }
                        break 'protocol mb.state;
                    }
                    isread = true;
                } else {
                    let fd = self.side_fd(dir);
                    let fresh = {
                        let mut r = borrowed_file(fd);
                        match codec::read_block(&mut *r) {
                            Ok(mb) => Some(mb),
                            Err(e) => {
                                debug!("reading block on fd {fd}: {e:#}");
                                None
                            }
                        }
                    };
                    self.analyse_read(fresh, &mut seen);

                    // The initiator drives the phase changes: it solves
                    // when the requirements have circulated, and leaves
                    // once the solution has.
                    if self.pid == self.block.as_ref().unwrap().initiator_pid {
                        match self.block.as_ref().unwrap().state {
                            State::Negotiation => {
                                let mb = self.block.as_mut().unwrap();
                                mb.state = State::NegotiationEnd;
                                info!("gathered I/O requirements; solving");
                                match solver::solve(mb, &self.solve_opts) {
                                    Ok(SolveOutcome::Run) => {
                                        info!("computed solution");
                                        mb.state = State::Run;
                                    }
                                    Ok(SolveOutcome::DrawExit) => mb.state = State::DrawExit,
                                    Err(e) => {
                                        eprintln!("{}: {e}", self.tool_name);
                                        mb.state = State::Error;
                                        mb.is_error_confirmed = true;
                                    }
                                }
                            }
                            State::Run => {
                                info!("communicated the solution");
                                self.block.as_mut().unwrap().state = State::Complete;
                                break 'protocol State::Complete;
                            }
                            State::Error => {
                                let mb = self.block.as_mut().unwrap();
                                if mb.is_error_confirmed {
                                    break 'protocol State::Error;
                                }
                                mb.is_error_confirmed = true;
                            }
                            State::DrawExit => break 'protocol State::DrawExit,
                            state => {
                                bail!(ProtocolError::new(format!(
                                    "initiator holds block in unexpected state {}",
                                    state.name()
                                )))
                            }
                        }
                    }
                    isread = false;
                }
            }
        };

        debug!(
            "{} ({}) leaves negotiation with state {}",
            self.tool_name,
            self.self_index,
            final_state.name()
        );
        match final_state {
            State::Complete => self.establish_io_connections(),
            State::DrawExit => Ok(Outcome::DrawExit),
            _ => Err(eyre!("dgsh negotiation failed")),
        }
    }

    /// Count this node's solved edge instances per side.
    fn io_counts(&self) -> Result<(Vec<Edge>, Vec<Edge>)> {
        let mb = self.block.as_ref().unwrap();
        let solution = mb
            .solution
            .as_ref()
            .ok_or_else(|| ProtocolError::new("negotiation completed without a solution"))?;
        let nc = solution
            .get(self.self_index as usize)
            .ok_or_else(|| ProtocolError::new("own node missing from solution"))?;
        Ok((nc.incoming.clone(), nc.outgoing.clone()))
    }

    /// Receive the input descriptors, create and send the output
    /// pipes, and dup the first descriptor of each side over the
    /// corresponding standard stream.
    fn establish_io_connections(&mut self) -> Result<Outcome> {
        let (incoming, outgoing) = self.io_counts()?;

        // Receive one descriptor per incoming edge instance, in the
        // canonical edge order both sides share.
        let mut input_fds = Vec::new();
        for edge in &incoming {
            for _ in 0..edge.instances {
                input_fds.push(fdpass::read_fd(self.sock_in)?);
            }
        }

        // Create a pipe per outgoing edge instance; the read end goes
        // to the consumer, the write end stays here.
        let mut output_fds = Vec::new();
        for edge in &outgoing {
            for _ in 0..edge.instances {
                let (read_end, write_end) =
                    unistd::pipe().wrap_err("creating a data-phase pipe")?;
                fdpass::write_fd(self.sock_out, read_end.as_raw_fd())?;
                drop(read_end);
                output_fds.push(write_end.into_raw_fd());
            }
        }

        if self.rewire_stdio {
            if let Some(first) = input_fds.first().copied() {
                unistd::dup2(first, libc::STDIN_FILENO).wrap_err("dup over stdin")?;
                unistd::close(first).ok();
                input_fds[0] = libc::STDIN_FILENO;
            }
            if let Some(first) = output_fds.first().copied() {
                unistd::dup2(first, libc::STDOUT_FILENO).wrap_err("dup over stdout")?;
                unistd::close(first).ok();
                output_fds[0] = libc::STDOUT_FILENO;
            }
        }
        debug!(
            "negotiation complete: {} inputs, {} outputs",
            input_fds.len(),
            output_fds.len()
        );
        Ok(Outcome::Ready {
            input_fds,
            output_fds,
        })
    }
}

fn validate_input(tool_name: &str, n_inputs: Option<i32>, n_outputs: Option<i32>) -> Result<()> {
    if tool_name.is_empty() {
        bail!("empty tool name provided to negotiate");
    }
    for n in [n_inputs, n_outputs].into_iter().flatten() {
        if n < -1 {
            bail!(
                "I/O requirement {n} for tool {tool_name} is less than -1"
            );
        }
    }
    Ok(())
}

fn negotiate_inner(
    tool_name: &str,
    n_inputs: Option<i32>,
    n_outputs: Option<i32>,
) -> Result<Outcome> {
    if NEGOTIATION_COMPLETED.load(Ordering::Relaxed) {
        bail!("negotiation already completed in this process");
    }
    validate_input(tool_name, n_inputs, n_outputs)?;

    let dgsh_in = env_flag("DGSH_IN");
    let dgsh_out = env_flag("DGSH_OUT");
    debug!(
        "tool {} negotiating: in {:?} out {:?}, dgsh_in {} dgsh_out {}",
        tool_name, n_inputs, n_outputs, dgsh_in, dgsh_out
    );

    if (n_inputs.unwrap_or(0) > 1 && !dgsh_in) || (n_outputs.unwrap_or(0) > 1 && !dgsh_out) {
        NEGOTIATION_COMPLETED.store(true, Ordering::Relaxed);
        bail!("multiple channels requested on a side not facing the graph");
    }

    // No graph on either side: pass the standard streams through.
    if !dgsh_in && !dgsh_out {
        NEGOTIATION_COMPLETED.store(true, Ordering::Relaxed);
        let input_fds = match n_inputs {
            Some(0) => Vec::new(),
            _ => vec![libc::STDIN_FILENO],
        };
        let output_fds = match n_outputs {
            Some(0) => Vec::new(),
            _ => vec![libc::STDOUT_FILENO],
        };
        return Ok(Outcome::Ready {
            input_fds,
            output_fds,
        });
    }

    arm_negotiation_timeout()?;
    let session = Session::new(tool_name, dgsh_in, dgsh_out, n_inputs, n_outputs);
    let outcome = session.negotiate();
    disarm_negotiation_timeout();
    outcome
}

/// Take part in the negotiation for the graph this process belongs to.
///
/// `n_inputs` and `n_outputs` express the caller's channel
/// requirements: `None` claims exactly one implicit stdio stream,
/// `Some(-1)` any number, `Some(k)` exactly `k`. The environment
/// variables `DGSH_IN` and `DGSH_OUT` state which standard streams
/// face the graph.
pub fn negotiate(
    flags: NegotiateFlags,
    tool_name: &str,
    n_inputs: Option<i32>,
    n_outputs: Option<i32>,
) -> Result<Outcome> {
    match negotiate_inner(tool_name, n_inputs, n_outputs) {
        Ok(Outcome::DrawExit) if flags.contains(NegotiateFlags::HANDLE_ERROR) => {
            std::process::exit(EX_DRAW_EXIT);
        }
        Err(e) if flags.contains(NegotiateFlags::HANDLE_ERROR) => {
            eprintln!("{tool_name}: dgsh negotiation failed: {e:#}");
            std::process::exit(EX_PROTOCOL);
        }
        other => other,
    }
}
