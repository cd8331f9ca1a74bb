//! Wire codec for the negotiation message block.
//!
//! A block travels as a sequence of chunks in a fixed order: the scalar
//! header, then the node array, the concentrator records (each followed
//! by its peer-pid list), the edge array while negotiating, and the
//! graph solution once one exists. Both peers live on the same host, so
//! all integers are 32-bit little-endian and booleans are single bytes.
//!
//! Every chunk is written and read with a single system call. Chunks
//! larger than the scatter-gather ceiling are split into pieces aligned
//! on whole records, never mid-record.

use std::fmt;
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use log::trace;
use nix::errno::Errno;

use crate::graph::{ConcInfo, Edge, MessageBlock, Node, NodeConnections, State, NODE_NAME_LEN};

/// Error in the framing or content of a received block.
#[derive(Debug)]
pub struct ProtocolError {
    msg: String,
}

impl ProtocolError {
    /// Create an error carrying a human-readable description.
    pub fn new<S: ToString>(msg: S) -> Self {
        ProtocolError {
            msg: msg.to_string(),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "protocol error: {}", self.msg)
    }
}

impl std::error::Error for ProtocolError {}

/// Scatter-gather ceiling used to split oversized chunks, matching the
/// common `_SC_IOV_MAX` value.
const IOV_MAX: usize = 1024;

/// Transient out-of-buffer-space writes are retried this many times.
const ENOBUFS_RETRIES: u32 = 3;
const ENOBUFS_PAUSE: Duration = Duration::from_millis(10);

const HEADER_LEN: usize = 36;
const NODE_LEN: usize = NODE_NAME_LEN + 18;
const EDGE_LEN: usize = 20;
const CONC_LEN: usize = 21;
const CONNECTIONS_LEN: usize = 12;

/// Write one chunk with a single write call, retrying a transient
/// `ENOBUFS` with a short pause. Any other failure, including a short
/// write, is fatal to the block.
fn write_chunk<W: Write>(w: &mut W, buf: &[u8]) -> Result<()> {
    let mut retries = 0;
    loop {
        match w.write(buf) {
            Ok(n) if n == buf.len() => return Ok(()),
            Ok(n) => bail!(ProtocolError::new(format!(
                "short write: {} of {} bytes",
                n,
                buf.len()
            ))),
            Err(e)
                if e.raw_os_error() == Some(Errno::ENOBUFS as i32)
                    && retries < ENOBUFS_RETRIES =>
            {
                retries += 1;
                thread::sleep(ENOBUFS_PAUSE);
            }
            Err(e) => return Err(e).wrap_err("writing message block chunk"),
        }
    }
}

/// Read one chunk with a single read call. A short read means the
/// stream lost framing.
fn read_chunk<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    let n = r.read(buf).wrap_err("reading message block chunk")?;
    if n != buf.len() {
        bail!(ProtocolError::new(format!(
            "short read: {} of {} bytes",
            n,
            buf.len()
        )));
    }
    Ok(())
}

/// Write a record array, splitting into record-aligned pieces when it
/// exceeds the scatter-gather ceiling.
fn write_records<W: Write>(w: &mut W, buf: &[u8], record_len: usize) -> Result<()> {
    if buf.len() <= IOV_MAX {
        return write_chunk(w, buf);
    }
    let piece_len = (IOV_MAX / record_len) * record_len;
    for piece in buf.chunks(piece_len) {
        write_chunk(w, piece)?;
    }
    Ok(())
}

/// Read a record array written by [`write_records`], mirroring its
/// piece boundaries.
fn read_records<R: Read>(r: &mut R, buf: &mut [u8], record_len: usize) -> Result<()> {
    if buf.len() <= IOV_MAX {
        return read_chunk(r, buf);
    }
    let piece_len = (IOV_MAX / record_len) * record_len;
    for piece in buf.chunks_mut(piece_len) {
        read_chunk(r, piece)?;
    }
    Ok(())
}

fn put_bool(buf: &mut Vec<u8>, b: bool) {
    buf.push(b as u8)
}

fn get_bool(r: &mut &[u8]) -> Result<bool> {
    Ok(r.read_u8()? != 0)
}

fn encode_header(mb: &MessageBlock) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.write_i32::<LE>(mb.version).unwrap();
    buf.push(mb.state.into());
    put_bool(&mut buf, mb.is_error_confirmed);
    put_bool(&mut buf, mb.is_draw_exit_confirmed);
    put_bool(&mut buf, mb.is_origin_conc);
    buf.write_i32::<LE>(mb.initiator_pid).unwrap();
    buf.write_i32::<LE>(mb.origin_index).unwrap();
    buf.write_i32::<LE>(mb.origin_fd_direction).unwrap();
    buf.write_i32::<LE>(mb.conc_pid).unwrap();
    buf.write_i32::<LE>(mb.nodes.len() as i32).unwrap();
    buf.write_i32::<LE>(mb.edges.len() as i32).unwrap();
    buf.write_i32::<LE>(mb.concs.len() as i32).unwrap();
    buf
}

fn encode_node(buf: &mut Vec<u8>, n: &Node) {
    buf.write_i32::<LE>(n.pid).unwrap();
    buf.write_i32::<LE>(n.index).unwrap();
    let mut name = [0u8; NODE_NAME_LEN];
    let len = n.name.len().min(NODE_NAME_LEN);
    name[..len].copy_from_slice(&n.name.as_bytes()[..len]);
    buf.extend_from_slice(&name);
    buf.write_i32::<LE>(n.requires_channels).unwrap();
    buf.write_i32::<LE>(n.provides_channels).unwrap();
    put_bool(buf, n.dgsh_in);
    put_bool(buf, n.dgsh_out);
}

fn decode_node(r: &mut &[u8]) -> Result<Node> {
    let pid = r.read_i32::<LE>()?;
    let index = r.read_i32::<LE>()?;
    let mut name = [0u8; NODE_NAME_LEN];
    r.read_exact(&mut name)?;
    let end = name.iter().position(|&b| b == 0).unwrap_or(NODE_NAME_LEN);
    let name = String::from_utf8_lossy(&name[..end]).into_owned();
    Ok(Node {
        pid,
        index,
        name,
        requires_channels: r.read_i32::<LE>()?,
        provides_channels: r.read_i32::<LE>()?,
        dgsh_in: get_bool(r)?,
        dgsh_out: get_bool(r)?,
    })
}

fn encode_edge(buf: &mut Vec<u8>, e: &Edge) {
    buf.write_i32::<LE>(e.from).unwrap();
    buf.write_i32::<LE>(e.to).unwrap();
    buf.write_i32::<LE>(e.instances).unwrap();
    buf.write_i32::<LE>(e.from_instances).unwrap();
    buf.write_i32::<LE>(e.to_instances).unwrap();
}

fn decode_edge(r: &mut &[u8]) -> Result<Edge> {
    Ok(Edge {
        from: r.read_i32::<LE>()?,
        to: r.read_i32::<LE>()?,
        instances: r.read_i32::<LE>()?,
        from_instances: r.read_i32::<LE>()?,
        to_instances: r.read_i32::<LE>()?,
    })
}

fn encode_conc(buf: &mut Vec<u8>, c: &ConcInfo) {
    buf.write_i32::<LE>(c.pid).unwrap();
    buf.write_i32::<LE>(c.input_fds).unwrap();
    buf.write_i32::<LE>(c.output_fds).unwrap();
    buf.write_i32::<LE>(c.proc_pids.len() as i32).unwrap();
    buf.write_i32::<LE>(c.endpoint_pid).unwrap();
    put_bool(buf, c.multiple_inputs);
}

/// Decode a conc record; its peer-pid vector arrives in a later chunk.
fn decode_conc(r: &mut &[u8]) -> Result<(ConcInfo, usize)> {
    let pid = r.read_i32::<LE>()?;
    let input_fds = r.read_i32::<LE>()?;
    let output_fds = r.read_i32::<LE>()?;
    let n_proc_pids = r.read_i32::<LE>()?;
    let endpoint_pid = r.read_i32::<LE>()?;
    let multiple_inputs = get_bool(r)?;
    if n_proc_pids < 0 {
        bail!(ProtocolError::new(format!(
            "negative conc peer count {n_proc_pids}"
        )));
    }
    Ok((
        ConcInfo {
            pid,
            input_fds,
            output_fds,
            proc_pids: Vec::new(),
            endpoint_pid,
            multiple_inputs,
        },
        n_proc_pids as usize,
    ))
}

fn read_edge_array<R: Read>(r: &mut R, count: usize) -> Result<Vec<Edge>> {
    let mut buf = vec![0u8; count * EDGE_LEN];
    read_records(r, &mut buf, EDGE_LEN)?;
    let mut slice = &buf[..];
    (0..count).map(|_| decode_edge(&mut slice)).collect()
}

fn write_edge_array<W: Write>(w: &mut W, edges: &[Edge]) -> Result<()> {
    let mut buf = Vec::with_capacity(edges.len() * EDGE_LEN);
    for e in edges {
        encode_edge(&mut buf, e);
    }
    write_records(w, &buf, EDGE_LEN)
}

/// Serialize a message block onto `w` in wire order.
pub fn write_block<W: Write>(w: &mut W, mb: &MessageBlock) -> Result<()> {
    write_chunk(w, &encode_header(mb))?;

    if !mb.nodes.is_empty() {
        let mut buf = Vec::with_capacity(mb.nodes.len() * NODE_LEN);
        for n in &mb.nodes {
            encode_node(&mut buf, n);
        }
        write_records(w, &buf, NODE_LEN)?;
    }

    if !mb.concs.is_empty() {
        let mut buf = Vec::with_capacity(mb.concs.len() * CONC_LEN);
        for c in &mb.concs {
            encode_conc(&mut buf, c);
        }
        write_records(w, &buf, CONC_LEN)?;
        for c in &mb.concs {
            let mut buf = Vec::with_capacity(c.proc_pids.len() * 4);
            for pid in &c.proc_pids {
                buf.write_i32::<LE>(*pid).unwrap();
            }
            write_records(w, &buf, 4)?;
        }
    }

    if mb.state == State::Negotiation && !mb.edges.is_empty() {
        write_edge_array(w, &mb.edges)?;
    } else if mb.state == State::Run {
        let solution = mb
            .solution
            .as_ref()
            .ok_or_else(|| ProtocolError::new("block in state RUN carries no solution"))?;
        let mut buf = Vec::with_capacity(solution.len() * CONNECTIONS_LEN);
        for nc in solution {
            buf.write_i32::<LE>(nc.node_index).unwrap();
            buf.write_i32::<LE>(nc.incoming.len() as i32).unwrap();
            buf.write_i32::<LE>(nc.outgoing.len() as i32).unwrap();
        }
        write_records(w, &buf, CONNECTIONS_LEN)?;
        for nc in solution {
            if !nc.incoming.is_empty() {
                write_edge_array(w, &nc.incoming)?;
            }
            if !nc.outgoing.is_empty() {
                write_edge_array(w, &nc.outgoing)?;
            }
        }
    }
    trace!(
        "wrote block: state {}, {} nodes, {} edges, {} concs",
        mb.state.name(),
        mb.nodes.len(),
        mb.edges.len(),
        mb.concs.len()
    );
    Ok(())
}

/// Read a message block from `r`, mirroring [`write_block`].
pub fn read_block<R: Read>(r: &mut R) -> Result<MessageBlock> {
    let mut header = [0u8; HEADER_LEN];
    read_chunk(r, &mut header)?;
    let mut h = &header[..];

    let version = h.read_i32::<LE>()?;
    let state = State::try_from(h.read_u8()?)
        .map_err(|e| ProtocolError::new(format!("bad state on the wire: {e}")))?;
    let is_error_confirmed = get_bool(&mut h)?;
    let is_draw_exit_confirmed = get_bool(&mut h)?;
    let is_origin_conc = get_bool(&mut h)?;
    let initiator_pid = h.read_i32::<LE>()?;
    let origin_index = h.read_i32::<LE>()?;
    let origin_fd_direction = h.read_i32::<LE>()?;
    let conc_pid = h.read_i32::<LE>()?;
    let n_nodes = h.read_i32::<LE>()?;
    let n_edges = h.read_i32::<LE>()?;
    let n_concs = h.read_i32::<LE>()?;
    for count in [n_nodes, n_edges, n_concs] {
        if count < 0 {
            bail!(ProtocolError::new(format!("negative array count {count}")));
        }
    }

    let mut mb = MessageBlock {
        version,
        nodes: Vec::new(),
        edges: Vec::new(),
        initiator_pid,
        state,
        is_error_confirmed,
        is_draw_exit_confirmed,
        origin_index,
        origin_fd_direction,
        is_origin_conc,
        conc_pid,
        concs: Vec::new(),
        solution: None,
    };

    if n_nodes > 0 {
        let mut buf = vec![0u8; n_nodes as usize * NODE_LEN];
        read_records(r, &mut buf, NODE_LEN)?;
        let mut slice = &buf[..];
        for _ in 0..n_nodes {
            mb.nodes.push(decode_node(&mut slice)?);
        }
    }

    if n_concs > 0 {
        let mut buf = vec![0u8; n_concs as usize * CONC_LEN];
        read_records(r, &mut buf, CONC_LEN)?;
        let mut slice = &buf[..];
        let mut pid_counts = Vec::with_capacity(n_concs as usize);
        for _ in 0..n_concs {
            let (c, n_pids) = decode_conc(&mut slice)?;
            mb.concs.push(c);
            pid_counts.push(n_pids);
        }
        for (c, n_pids) in mb.concs.iter_mut().zip(pid_counts) {
            let mut buf = vec![0u8; n_pids * 4];
            read_records(r, &mut buf, 4)?;
            let mut slice = &buf[..];
            for _ in 0..n_pids {
                c.proc_pids.push(slice.read_i32::<LE>()?);
            }
        }
    }

    if mb.state == State::Negotiation && n_edges > 0 {
        mb.edges = read_edge_array(r, n_edges as usize)?;
    } else if mb.state == State::Run {
        let mut buf = vec![0u8; n_nodes as usize * CONNECTIONS_LEN];
        read_records(r, &mut buf, CONNECTIONS_LEN)?;
        let mut slice = &buf[..];
        let mut counts = Vec::with_capacity(n_nodes as usize);
        for _ in 0..n_nodes {
            let node_index = slice.read_i32::<LE>()?;
            let n_in = slice.read_i32::<LE>()?;
            let n_out = slice.read_i32::<LE>()?;
            if n_in < 0 || n_out < 0 {
                bail!(ProtocolError::new("negative solution edge count"));
            }
            counts.push((node_index, n_in as usize, n_out as usize));
        }
        let mut solution = Vec::with_capacity(n_nodes as usize);
        for (node_index, n_in, n_out) in counts {
            let incoming = if n_in > 0 {
                read_edge_array(r, n_in)?
            } else {
                Vec::new()
            };
            let outgoing = if n_out > 0 {
                read_edge_array(r, n_out)?
            } else {
                Vec::new()
            };
            solution.push(NodeConnections {
                node_index,
                incoming,
                outgoing,
            });
        }
        mb.solution = Some(solution);
    }
    trace!(
        "read block: state {}, {} nodes, {} edges, {} concs, origin {}",
        mb.state.name(),
        mb.nodes.len(),
        mb.edges.len(),
        mb.concs.len(),
        mb.origin_index
    );
    Ok(mb)
}
