//! The concentrator relay.
//!
//! A passive process that sits at a multi-way junction of the graph
//! and routes message blocks so that every participant behind it sees
//! the block. It owns descriptors 0, 1 and 3..N+1 (2 stays reserved
//! for diagnostics), relays blocks along a fixed rotation until every
//! port has both sent and received a final-state block, and then
//! shuttles the negotiated pipe descriptors across the junction.

use std::io::Write as _;
use std::os::unix::io::{BorrowedFd, RawFd};

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use log::{debug, info, trace};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::unistd;

use crate::codec;
use crate::fdpass;
use crate::graph::{ConcInfo, MessageBlock, State, DIR_STDOUT};
use crate::negotiate::borrowed_file;
use crate::solver::{self, SolveOptions, SolveOutcome};

/// First descriptor after the standard streams.
const FREE_FILENO: RawFd = 3;

#[derive(Default)]
struct Port {
    /// Pid of the process on this descriptor, discovered from the
    /// blocks it sends.
    pid: i32,
    /// The peer has transmitted to us.
    seen: bool,
    /// We have transmitted a final-state block to the peer.
    written: bool,
    /// Both of the above under RUN, DRAW-EXIT or confirmed ERROR.
    run_ready: bool,
    /// Block staged for writing on this descriptor.
    to_write: Option<MessageBlock>,
}

/// Relay state for one concentrator process.
pub struct Concentrator {
    pid: i32,
    /// Gathering (`-i`): descriptors 0, 3, 4, … feed descriptor 1.
    /// Otherwise scattering: descriptor 0 feeds 1, 3, 4, …
    multiple_inputs: bool,
    /// Scatterer without a stdin peer (`-n`); self-initiates a block.
    noinput: bool,
    /// Descriptors owned, including the reserved stderr slot.
    nfd: RawFd,
    ports: Vec<Port>,
    /// Origin recorded from the single end, restored onto blocks that
    /// bounce between the multi-end ports.
    origin_index: i32,
    origin_direction: i32,
    /// Most recent block, used for the descriptor shuffle at exit.
    block: Option<MessageBlock>,
    solve_opts: SolveOptions,
}

impl Concentrator {
    /// Create a relay over `arity` peers on the multi end.
    pub fn new(multiple_inputs: bool, noinput: bool, arity: usize) -> Self {
        let nfd = if arity == 1 { 2 } else { arity as RawFd + 2 };
        Concentrator {
            pid: unistd::getpid().as_raw(),
            multiple_inputs,
            noinput,
            nfd,
            ports: (0..nfd).map(|_| Port::default()).collect(),
            origin_index: -1,
            origin_direction: -1,
            block: None,
            solve_opts: SolveOptions::from_env(),
        }
    }

    /// The descriptor a block read from `fd` is passed along to.
    /// Sets `ro` when the block's origin must be restored, so that
    /// multi-end peers see the single end's origin rather than each
    /// other's.
    fn next_fd(&self, fd: RawFd, ro: &mut bool) -> RawFd {
        if self.multiple_inputs {
            match fd {
                0 => 1,
                1 => 0,
                _ => {
                    *ro = true;
                    fd
                }
            }
        } else {
            if fd == 0 && !self.noinput {
                return 1;
            }
            if fd == 0 || fd == 1 {
                if !self.noinput {
                    *ro = true;
                }
                if self.nfd > 2 {
                    return FREE_FILENO;
                }
            }
            if fd == self.nfd - 1 {
                if self.noinput {
                    1
                } else {
                    0
                }
            } else {
                if !self.noinput {
                    *ro = true;
                }
                fd + 1
            }
        }
    }

    /// Port indices on the multi end, in shuffle order.
    fn multi_ports(&self) -> Vec<RawFd> {
        if self.multiple_inputs {
            std::iter::once(0).chain(FREE_FILENO..self.nfd).collect()
        } else {
            let mut ports = Vec::new();
            let mut ignore = false;
            let mut i = 1;
            while i != 0 {
                ports.push(i);
                i = self.next_fd(i, &mut ignore);
            }
            ports
        }
    }

    /// Register this concentrator in the block's conc array, once all
    /// neighbour pids are known. Returns false to retry later.
    fn set_io_channels(&self, mb: &mut MessageBlock) -> bool {
        if mb.find_conc(self.pid).is_some() {
            return true;
        }
        let single_end: RawFd = if self.multiple_inputs { 1 } else { 0 };
        let endpoint_pid = self.ports[single_end as usize].pid;
        if endpoint_pid == 0 {
            return false;
        }
        let mut proc_pids = Vec::new();
        for i in self.multi_ports() {
            let pid = self.ports[i as usize].pid;
            if pid == 0 {
                return false;
            }
            proc_pids.push(pid);
        }
        mb.concs.push(ConcInfo {
            pid: self.pid,
            input_fds: -1,
            output_fds: -1,
            proc_pids,
            endpoint_pid,
            multiple_inputs: self.multiple_inputs,
        });
        debug!("registered conc {}; block now has {} concs", self.pid, mb.concs.len());
        true
    }

    fn stage(&mut self, port: usize, mut mb: MessageBlock) {
        mb.is_origin_conc = true;
        mb.conc_pid = self.pid;
        self.block = Some(mb.clone());
        self.ports[port].to_write = Some(mb);
    }

    fn mark_run_ready(&mut self, i: usize) {
        if self.ports[i].seen && self.ports[i].written {
            self.ports[i].run_ready = true;
            trace!("port {i} is run ready");
        }
    }

    /// A block in a state that releases the peer behind a port.
    fn is_final(mb: &MessageBlock) -> bool {
        mb.state == State::Run
            || (mb.state == State::DrawExit && mb.is_draw_exit_confirmed)
            || (mb.state == State::Error && mb.is_error_confirmed)
    }

    fn handle_write(&mut self, i: usize) -> Result<()> {
        let mb = self.ports[i].to_write.take().expect("write on empty port");
        {
            let mut w = borrowed_file(i as RawFd);
            codec::write_block(&mut *w, &mb)
                .wrap_err_with(|| format!("relaying block on fd {i}"))?;
            let _ = w.flush();
        }
        if Self::is_final(&mb) {
            self.ports[i].written = true;
        }
        self.block = Some(mb);
        self.mark_run_ready(i);
        Ok(())
    }

    fn handle_read(&mut self, i: usize) -> Result<()> {
        let mut ro = false;
        let next = self.next_fd(i as RawFd, &mut ro) as usize;
        debug_assert!(!self.ports[i].run_ready);
        debug_assert!(self.ports[next].to_write.is_none());

        let mut rb = {
            let mut r = borrowed_file(i as RawFd);
            codec::read_block(&mut *r).wrap_err_with(|| format!("reading block on fd {i}"))?
        };
        trace!("fd {i}: block in state {} heads to fd {next}", rb.state.name());

        // Remember the origin announced on the single end.
        if self.origin_index == -1 {
            let single_end = if self.multiple_inputs { 1 } else { 0 };
            if i == single_end {
                self.origin_index = rb.origin_index;
                self.origin_direction = rb.origin_fd_direction;
            }
        }

        self.ports[i].pid = rb.origin_pid();

        if ro {
            rb.origin_index = self.origin_index;
            rb.origin_fd_direction = self.origin_direction;
        } else if self.noinput {
            rb.origin_index = -1;
            rb.origin_fd_direction = DIR_STDOUT;
        }

        if !self.noinput {
            self.set_io_channels(&mut rb);
        }

        if rb.state == State::Negotiation && self.noinput {
            // The root scatterer has no upstream initiator; it runs
            // the solver itself once every peer has reported.
            self.ports[i].seen = true;
            let seen = (1..self.nfd as usize)
                .filter(|&j| self.ports[j].seen)
                .count() as RawFd;
            if (self.nfd > 2 && seen == self.nfd - 2) || seen == self.nfd - 1 {
                info!("gathered I/O requirements; solving");
                match solver::solve(&mut rb, &self.solve_opts) {
                    Ok(SolveOutcome::Run) => {
                        info!("computed solution");
                        rb.state = State::Run;
                    }
                    Ok(SolveOutcome::DrawExit) => {
                        rb.state = State::DrawExit;
                        rb.is_draw_exit_confirmed = true;
                    }
                    Err(e) => {
                        eprintln!("dgsh-conc: {e}");
                        rb.state = State::Error;
                        rb.is_error_confirmed = true;
                    }
                }
                for j in 1..self.nfd as usize {
                    self.ports[j].seen = false;
                }
            }
        } else if Self::is_final(&rb) {
            self.ports[i].seen = true;
        } else if rb.state == State::Error {
            rb.is_error_confirmed = true;
        } else if rb.state == State::DrawExit {
            rb.is_draw_exit_confirmed = true;
        }

        self.stage(next, rb);
        self.mark_run_ready(i);
        Ok(())
    }

    /// Operational port count that must become run-ready before the
    /// relay exits.
    fn all_ports_ready(&self) -> bool {
        let ready = self.ports.iter().filter(|p| p.run_ready).count() as RawFd;
        if self.nfd > 2 {
            ready == self.nfd - 1 || (self.noinput && ready == self.nfd - 2)
        } else {
            ready == self.nfd || (self.noinput && ready == self.nfd - 1)
        }
    }

    /// Pass message blocks around until every participant behind this
    /// junction is released.
    fn pass_message_blocks(&mut self) -> Result<State> {
        if self.noinput {
            let mut mb = MessageBlock::new(self.pid);
            mb.origin_fd_direction = DIR_STDOUT;
            self.stage(1, mb);
        }

        loop {
            let mut read_fds = Vec::new();
            let mut write_fds = Vec::new();
            for i in 0..self.nfd {
                if i == 2 {
                    continue;
                }
                if !self.ports[i as usize].seen {
                    read_fds.push(i);
                }
                let p = &self.ports[i as usize];
                if p.to_write.is_some() && !p.written {
                    write_fds.push(i);
                }
            }

            let (ready_read, ready_write) = loop {
                let mut read_set = FdSet::new();
                let mut write_set = FdSet::new();
                for &fd in &read_fds {
                    read_set.insert(unsafe { BorrowedFd::borrow_raw(fd) });
                }
                for &fd in &write_fds {
                    write_set.insert(unsafe { BorrowedFd::borrow_raw(fd) });
                }
                match select(None, &mut read_set, &mut write_set, None, None) {
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e).wrap_err("select on concentrator ports"),
                    Ok(_) => {
                        let rr: Vec<RawFd> = read_fds
                            .iter()
                            .copied()
                            .filter(|&fd| read_set.contains(unsafe { BorrowedFd::borrow_raw(fd) }))
                            .collect();
                        let rw: Vec<RawFd> = write_fds
                            .iter()
                            .copied()
                            .filter(|&fd| write_set.contains(unsafe { BorrowedFd::borrow_raw(fd) }))
                            .collect();
                        break (rr, rw);
                    }
                }
            };

            for fd in ready_write {
                self.handle_write(fd as usize)?;
            }
            for fd in ready_read {
                self.handle_read(fd as usize)?;
            }

            if self.all_ports_ready() {
                debug!("conc {} leaves negotiation", self.pid);
                let state = self
                    .block
                    .as_ref()
                    .map(|mb| mb.state)
                    .ok_or_else(|| eyre!("relay finished without a block"))?;
                return Ok(state);
            }
        }
    }

    /// Read the negotiated descriptors arriving on stdin and deal them
    /// out to the peers according to each peer's expected count.
    fn scatter_input_fds(&self) -> Result<()> {
        let mb = self.block.as_ref().unwrap();
        let this_conc = mb
            .find_conc(self.pid)
            .ok_or_else(|| eyre!("concentrator with pid {} not registered", self.pid))?;
        let n_to_read = this_conc.input_fds;
        let mut fds = Vec::with_capacity(n_to_read as usize);
        for _ in 0..n_to_read {
            fds.push(fdpass::read_fd(0)?);
        }
        let mut write_index = 0usize;
        for i in self.multi_ports() {
            let n = mb.expected_fds(self.ports[i as usize].pid);
            if n < 0 {
                bail!("unknown descriptor count for peer on fd {i}");
            }
            for fd in &fds[write_index..write_index + n as usize] {
                fdpass::write_fd(i, *fd)?;
            }
            write_index += n as usize;
        }
        debug_assert_eq!(write_index, fds.len());
        Ok(())
    }

    /// Collect the peers' negotiated descriptors and funnel them to
    /// the single consumer on stdout.
    fn gather_input_fds(&self) -> Result<()> {
        let mb = self.block.as_ref().unwrap();
        let this_conc = mb
            .find_conc(self.pid)
            .ok_or_else(|| eyre!("concentrator with pid {} not registered", self.pid))?;
        let n_to_write = this_conc.output_fds;
        let mut fds = Vec::with_capacity(n_to_write as usize);
        for i in self.multi_ports() {
            let n = mb.provided_fds(self.ports[i as usize].pid);
            if n < 0 {
                bail!("unknown descriptor count for peer on fd {i}");
            }
            for _ in 0..n {
                fds.push(fdpass::read_fd(i)?);
            }
        }
        debug_assert_eq!(fds.len(), n_to_write as usize);
        for fd in fds {
            fdpass::write_fd(1, fd)?;
        }
        Ok(())
    }

    /// Relay the negotiation and perform the final descriptor shuffle.
    /// Returns the state to map to the process exit status.
    pub fn run(mut self) -> Result<State> {
        let state = self.pass_message_blocks()?;
        if state == State::Run {
            if self.multiple_inputs {
                self.gather_input_fds()?;
            } else if !self.noinput {
                self.scatter_input_fds()?;
            }
            return Ok(State::Complete);
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(conc: &Concentrator, fd: RawFd) -> (RawFd, bool) {
        let mut ro = false;
        let next = conc.next_fd(fd, &mut ro);
        (next, ro)
    }

    #[test]
    fn gather_routes_between_ends_and_bounces_peers() {
        let conc = Concentrator::new(true, false, 3);
        assert_eq!(route(&conc, 0), (1, false));
        assert_eq!(route(&conc, 1), (0, false));
        assert_eq!(route(&conc, 3), (3, true));
        assert_eq!(route(&conc, 4), (4, true));
    }

    #[test]
    fn scatter_rotates_through_peers() {
        let conc = Concentrator::new(false, false, 3);
        assert_eq!(route(&conc, 0), (1, false));
        assert_eq!(route(&conc, 1), (3, true));
        assert_eq!(route(&conc, 3), (4, true));
        assert_eq!(route(&conc, 4), (0, false));
    }

    #[test]
    fn scatter_without_stdin_skips_the_origin_restore() {
        let conc = Concentrator::new(false, true, 3);
        assert_eq!(route(&conc, 1), (3, false));
        assert_eq!(route(&conc, 3), (4, false));
        assert_eq!(route(&conc, 4), (1, false));
    }

    #[test]
    fn two_descriptor_scatter_falls_through_to_stdin() {
        // Arity one leaves only the standard streams; stdout routes
        // back to stdin.
        let conc = Concentrator::new(false, false, 1);
        assert_eq!(conc.nfd, 2);
        assert_eq!(route(&conc, 0), (1, false));
        assert_eq!(route(&conc, 1), (0, true));
    }

    #[test]
    fn multi_ports_cover_the_fan_side() {
        let gather = Concentrator::new(true, false, 3);
        assert_eq!(gather.multi_ports(), vec![0, 3, 4]);
        let scatter = Concentrator::new(false, false, 3);
        assert_eq!(scatter.multi_ports(), vec![1, 3, 4]);
        let tiny = Concentrator::new(false, false, 1);
        assert_eq!(tiny.multi_ports(), vec![1]);
    }
}
