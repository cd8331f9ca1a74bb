//! The buffered fan-out / fan-in data engine.
//!
//! Copies bytes from N sources to M sinks during the data phase
//! without letting a single slow sink stall the upstream source and
//! without unbounded memory growth. Data a sink cannot yet accept is
//! staged in a per-source pool of fixed-size pages; pages past the
//! slowest consumer are released, and under memory pressure the oldest
//! resident pages can spill to a temporary file.
//!
//! The engine is a select-driven state machine; see [`EngineState`].

use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd;

use crate::negotiate::borrowed_file;

/// Engine configuration, filled in from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of one pool page.
    pub buffer_size: usize,
    /// Soft ceiling on resident pool memory per source.
    pub max_mem: u64,
    /// Partition the single input across the sinks instead of copying
    /// it to all of them.
    pub scatter: bool,
    /// Zero-based destination sink for each source; empty when not
    /// permuting.
    pub permute: Vec<usize>,
    /// Spill buffered data to a temporary file under memory pressure.
    pub use_tmp_file: bool,
    /// Directory for the spill file.
    pub tmp_dir: Option<PathBuf>,
    /// Record terminator for scatter alignment.
    pub record_terminator: u8,
    /// Input-side buffering: never decline to read, at the cost of
    /// unbounded memory.
    pub input_side_buffering: bool,
    /// Print per-source buffer statistics at termination.
    pub memory_stats: bool,
    /// Split scattered data on blocks of this size instead of record
    /// boundaries; zero selects record alignment.
    pub block_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            buffer_size: 1024 * 1024,
            max_mem: 256 * 1024 * 1024,
            scatter: false,
            permute: Vec::new(),
            use_tmp_file: false,
            tmp_dir: None,
            record_terminator: b'\n',
            input_side_buffering: false,
            memory_stats: false,
            block_len: 0,
        }
    }
}

/// Engine failure carrying the process exit status the original tool
/// family uses: 1 for setup and resource errors, 2 for write-side I/O,
/// 3 for fatal reads.
#[derive(Debug)]
pub enum EngineError {
    Setup(String),
    Io(String),
    Read(String),
}

impl EngineError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Setup(_) => 1,
            EngineError::Io(_) => 2,
            EngineError::Read(_) => 3,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::Setup(m) | EngineError::Io(m) | EngineError::Read(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for EngineError {}

type EngineResult<T> = std::result::Result<T, EngineError>;

/// Where one pool page currently lives.
enum Page {
    /// Free slot.
    None,
    /// Resident only.
    Memory(Vec<u8>),
    /// Resident and also written to the spill file.
    MemoryBacked(Vec<u8>),
    /// On the spill file only.
    File,
}

#[derive(Debug, Default, Clone)]
struct PoolStats {
    allocated: u32,
    freed: u32,
    max_allocated: u32,
    paged_out: u32,
    paged_in: u32,
    pages_freed: u32,
}

/// A sequential pool of fixed-size pages holding one source's pending
/// data. The page for byte offset `o` is `o / buffer_size`.
struct BufferPool {
    pages: Vec<Page>,
    /// First page index that has never been allocated.
    allocated_end: usize,
    /// Pages below this index have been released.
    free_begin: usize,
    /// Round-robin page-out position.
    page_out_ptr: usize,
    spill: Option<File>,
    punch_warned: bool,
    stats: PoolStats,
}

impl BufferPool {
    fn new() -> Self {
        BufferPool {
            pages: Vec::new(),
            allocated_end: 0,
            free_begin: 0,
            page_out_ptr: 0,
            spill: None,
            punch_warned: false,
            stats: PoolStats::default(),
        }
    }

    /// Bytes needed to keep everything up to `pool` resident.
    fn memory_size(&self, pool: i64, buffer_size: usize) -> u64 {
        let live = self.stats.allocated as i64 - self.stats.freed as i64;
        let total = live + (pool - self.allocated_end as i64 + 1);
        total.max(0) as u64 * buffer_size as u64
    }

    fn bump_allocated(&mut self) {
        self.stats.allocated += 1;
        self.stats.max_allocated = self
            .stats
            .max_allocated
            .max(self.stats.allocated - self.stats.freed);
    }

    /// Page out resident pages round-robin, oldest first, until the
    /// pool fits in half the memory ceiling.
    fn page_out(&mut self, cfg: &Config) -> EngineResult<()> {
        if self.spill.is_none() {
            let file = match &cfg.tmp_dir {
                Some(dir) => tempfile::tempfile_in(dir),
                None => tempfile::tempfile(),
            }
            .map_err(|e| EngineError::Setup(format!("unable to create temporary file: {e}")))?;
            self.spill = Some(file);
        }
        while self.memory_size(self.allocated_end as i64 - 1, cfg.buffer_size) > cfg.max_mem / 2 {
            let i = self.page_out_ptr;
            match std::mem::replace(&mut self.pages[i], Page::None) {
                Page::Memory(data) => {
                    self.spill
                        .as_ref()
                        .unwrap()
                        .write_all_at(&data, (i * cfg.buffer_size) as u64)
                        .map_err(|e| {
                            EngineError::Setup(format!("write to temporary file failed: {e}"))
                        })?;
                    self.pages[i] = Page::File;
                    self.stats.freed += 1;
                    self.stats.paged_out += 1;
                    trace!("paged out buffer {i}");
                }
                Page::MemoryBacked(_) => {
                    self.pages[i] = Page::File;
                    self.stats.freed += 1;
                    self.stats.paged_out += 1;
                }
                other => self.pages[i] = other,
            }
            self.page_out_ptr += 1;
            if self.page_out_ptr == self.allocated_end {
                self.page_out_ptr = 0;
            }
        }
        Ok(())
    }

    /// Make sure page `pool` is resident.
    fn page_in(&mut self, pool: usize, cfg: &Config) -> EngineResult<()> {
        if matches!(self.pages[pool], Page::Memory(_) | Page::MemoryBacked(_)) {
            return Ok(());
        }
        debug_assert!(matches!(self.pages[pool], Page::File));
        if self.memory_size(self.allocated_end as i64 - 1, cfg.buffer_size) > cfg.max_mem {
            self.page_out(cfg)?;
        }
        let mut data = vec![0u8; cfg.buffer_size];
        self.spill
            .as_ref()
            .unwrap()
            .read_exact_at(&mut data, (pool * cfg.buffer_size) as u64)
            .map_err(|e| EngineError::Setup(format!("read from temporary file failed: {e}")))?;
        self.bump_allocated();
        self.stats.paged_in += 1;
        self.pages[pool] = Page::MemoryBacked(data);
        trace!("paged in buffer {pool}");
        Ok(())
    }

    /// Allocate pages up to and including `pool`. Returns false when
    /// the memory ceiling is hit and spilling is disabled.
    fn allocate(&mut self, pool: usize, cfg: &Config) -> EngineResult<bool> {
        if pool < self.allocated_end {
            return Ok(true);
        }
        if self.memory_size(pool as i64, cfg.buffer_size) > cfg.max_mem {
            if cfg.use_tmp_file {
                self.page_out(cfg)?;
            } else {
                return Ok(false);
            }
        }
        while self.pages.len() <= pool {
            self.pages.push(Page::None);
        }
        for i in self.allocated_end..=pool {
            self.pages[i] = Page::Memory(vec![0u8; cfg.buffer_size]);
            self.bump_allocated();
        }
        self.allocated_end = pool + 1;
        Ok(true)
    }

    #[cfg(target_os = "linux")]
    fn punch_hole(&mut self, pool: usize, cfg: &Config) {
        if let Some(f) = &self.spill {
            let r = unsafe {
                libc::fallocate(
                    f.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    (pool * cfg.buffer_size) as libc::off_t,
                    cfg.buffer_size as libc::off_t,
                )
            };
            if r < 0 && !self.punch_warned {
                warn!("failed to free temporary buffer space");
                self.punch_warned = true;
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn punch_hole(&mut self, _pool: usize, _cfg: &Config) {}

    /// Release every page covering bytes before `pos`.
    fn free_until(&mut self, pos: u64, cfg: &Config) {
        let pool_end = (pos / cfg.buffer_size as u64) as usize;
        for i in self.free_begin..pool_end {
            match std::mem::replace(&mut self.pages[i], Page::None) {
                Page::Memory(_) => self.stats.freed += 1,
                Page::File => {
                    self.punch_hole(i, cfg);
                    self.stats.pages_freed += 1;
                }
                Page::MemoryBacked(_) => {
                    self.punch_hole(i, cfg);
                    self.stats.freed += 1;
                    self.stats.pages_freed += 1;
                }
                Page::None => {}
            }
        }
        if pool_end > self.free_begin {
            self.free_begin = pool_end;
            trace!("freed buffers below {pool_end}");
        }
    }

    /// Slice of the page holding `pos`, paging it in if spilled.
    fn data_at(&mut self, pos: u64, len: usize, cfg: &Config) -> EngineResult<&[u8]> {
        let pool = (pos / cfg.buffer_size as u64) as usize;
        let offset = (pos % cfg.buffer_size as u64) as usize;
        if self.spill.is_some() {
            self.page_in(pool, cfg)?;
        }
        match &self.pages[pool] {
            Page::Memory(data) | Page::MemoryBacked(data) => Ok(&data[offset..offset + len]),
            _ => panic!("data_at on a non-resident page {pool}"),
        }
    }

    /// One byte of buffered data, for record-boundary scans.
    fn byte_at(&mut self, pos: u64, cfg: &Config) -> EngineResult<u8> {
        Ok(self.data_at(pos, 1, cfg)?[0])
    }
}

/// Region length readable from `start` without crossing a page end.
fn region_length(start: u64, end: u64, buffer_size: usize) -> usize {
    let pool_offset = (start % buffer_size as u64) as usize;
    let source_bytes = end - start;
    (buffer_size - pool_offset).min(source_bytes as usize)
}

struct Source {
    name: Option<String>,
    fd: RawFd,
    pool: BufferPool,
    /// Bytes read from this source so far.
    pos_read: u64,
    reached_eof: bool,
    /// Minimum position consumed across the sinks reading this source.
    read_min_pos: u64,
    /// Currently readable (head of its chain or unchained).
    active: bool,
    /// An active sink still consumes it.
    is_read: bool,
    /// Reading stops here rather than advancing the chain.
    chain_last: bool,
    /// Next source in this chain.
    next: Option<usize>,
}

struct Sink {
    name: Option<String>,
    fd: RawFd,
    /// Position up to which this sink has written.
    pos_written: u64,
    /// Position up to which it may write.
    pos_to_write: u64,
    active: bool,
    /// Index of the source feeding this sink.
    src: usize,
}

fn endpoint_name(name: &Option<String>, fd: RawFd) -> String {
    match name {
        Some(n) => n.clone(),
        None => format!("fd({fd})"),
    }
}

/// Scheduling states of the copying engine.
///
/// The two read states differ in policy: input-side buffering always
/// reads when input is available, presenting an infinite buffer to the
/// upstream; output-side buffering reads only when some active sink
/// has no pending data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    /// Must read input; write whatever is pending.
    ReadIb,
    /// As above, but reading is gated on downstream room.
    ReadOb,
    /// No more reads; drain everything pending.
    DrainIb,
    /// Empty the buffers by writing, then resume reading.
    DrainOb,
    /// Write before reading again.
    WriteOb,
}

enum ReadResult {
    Ok,
    Oom,
    Again,
    Eof,
}

/// The copying engine. Register sources and sinks, then [`Engine::run`].
pub struct Engine {
    cfg: Config,
    sources: Vec<Source>,
    sinks: Vec<Sink>,
    /// Source traversal order following the chain links.
    source_order: Vec<usize>,
    reached_eof: bool,
}

/// Set `fd` to non-blocking mode. Select readiness alone does not
/// guarantee a large write will not block.
fn non_block(fd: RawFd, name: &str) -> EngineResult<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| EngineError::Io(format!("error getting flags for {name}: {e}")))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| EngineError::Io(format!("error setting {name} to non-blocking mode: {e}")))?;
    Ok(())
}

/// Reorder `count` chain links column-major with a notional row length,
/// mirroring the original's linked-list transposition. A list of 9
/// with rows of 3 yields 0,3,6,1,4,7,2,5,8.
fn transpose(count: usize, row_length: usize) -> Vec<usize> {
    let mut next: Vec<Option<usize>> = (0..count)
        .map(|i| if i + 1 < count { Some(i + 1) } else { None })
        .collect();
    for (i, n) in next
        .iter_mut()
        .enumerate()
        .take(count.saturating_sub(row_length))
    {
        *n = Some(i + row_length);
    }
    for i in count.saturating_sub(row_length)..count.saturating_sub(1) {
        next[i] = Some((i + 1) % row_length);
    }
    let mut order = Vec::with_capacity(count);
    let mut cur = (count > 0).then_some(0);
    while let Some(i) = cur {
        order.push(i);
        cur = next[i];
    }
    debug_assert_eq!(order.len(), count);
    order
}

impl Engine {
    pub fn new(cfg: Config) -> Self {
        Engine {
            cfg,
            sources: Vec::new(),
            sinks: Vec::new(),
            source_order: Vec::new(),
            reached_eof: false,
        }
    }

    /// Register a source descriptor; switched to non-blocking mode.
    pub fn add_source(&mut self, name: Option<String>, fd: RawFd) -> EngineResult<()> {
        non_block(fd, &endpoint_name(&name, fd))?;
        self.sources.push(Source {
            name,
            fd,
            pool: BufferPool::new(),
            pos_read: 0,
            reached_eof: false,
            read_min_pos: 0,
            active: false,
            is_read: false,
            chain_last: false,
            next: None,
        });
        Ok(())
    }

    /// Register a sink descriptor; switched to non-blocking mode.
    pub fn add_sink(&mut self, name: Option<String>, fd: RawFd) -> EngineResult<()> {
        non_block(fd, &endpoint_name(&name, fd))?;
        self.sinks.push(Sink {
            name,
            fd,
            pos_written: 0,
            pos_to_write: 0,
            active: true,
            src: 0,
        });
        Ok(())
    }

    pub fn n_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn n_sinks(&self) -> usize {
        self.sinks.len()
    }

    /// Chain sources and sinks into groups.
    ///
    /// With nin ≥ nout the inputs are chained into nout groups and
    /// consumed sequentially (cat and multipipe cat); with nout > nin
    /// the outputs are grouped over the inputs (tee and multipipe
    /// tee). Permutation maps each input to its named output and chains
    /// nothing.
    fn chain_io(&mut self) -> EngineResult<()> {
        let nin = self.sources.len();
        let nout = self.sinks.len();
        let permute = !self.cfg.permute.is_empty();

        if nin >= nout {
            if nin % nout != 0 {
                return Err(EngineError::Setup(format!(
                    "the number of inputs {nin} is not an exact multiple of the number of outputs {nout}"
                )));
            }
            let group_size = nin / nout;
            let order = transpose(nin, group_size);
            for (pos, &si) in order.iter().enumerate() {
                self.sources[si].active = pos % group_size == 0;
                self.sources[si].chain_last = (pos + 1) % group_size == 0;
                self.sources[si].next = order.get(pos + 1).copied();
            }
            for k in 0..nout {
                self.sinks[k].src = if permute {
                    let dest = &self.cfg.permute;
                    match dest.iter().position(|&d| d == k) {
                        Some(input_n) => order[input_n],
                        None => {
                            return Err(EngineError::Setup(format!(
                                "unspecified output {}",
                                k + 1
                            )))
                        }
                    }
                } else {
                    order[k * group_size]
                };
            }
            self.source_order = order;
        } else {
            if nout % nin != 0 {
                return Err(EngineError::Setup(format!(
                    "the number of outputs {nout} is not an exact multiple of the number of inputs {nin}"
                )));
            }
            debug_assert!(!permute);
            let group_size = nout / nin;
            let order = transpose(nout, group_size);
            for src in &mut self.sources {
                src.active = true;
                src.chain_last = true;
            }
            for (pos, &ki) in order.iter().enumerate() {
                self.sinks[ki].src = pos / group_size;
            }
            self.source_order = (0..nin).collect();
        }

        for (i, src) in self.sources.iter().enumerate() {
            debug!(
                "source {} ({}): active={} chain_last={} next={:?}",
                i,
                endpoint_name(&src.name, src.fd),
                src.active,
                src.chain_last,
                src.next
            );
        }
        for (k, sink) in self.sinks.iter().enumerate() {
            debug!(
                "sink {} ({}): reads source {}",
                k,
                endpoint_name(&sink.name, sink.fd),
                sink.src
            );
        }
        Ok(())
    }

    /// Read from a source into its buffer pool.
    fn source_read(&mut self, si: usize) -> EngineResult<ReadResult> {
        let cfg = self.cfg.clone();
        let src = &mut self.sources[si];
        let pool = (src.pos_read / cfg.buffer_size as u64) as usize;
        let offset = (src.pos_read % cfg.buffer_size as u64) as usize;
        if !src.pool.allocate(pool, &cfg)? {
            trace!("memory full for {}", endpoint_name(&src.name, src.fd));
            return Ok(ReadResult::Oom);
        }
        let n = {
            let data = match &mut src.pool.pages[pool] {
                Page::Memory(data) => data,
                _ => panic!("reading into a non-resident page"),
            };
            let mut f = borrowed_file(src.fd);
            match f.read(&mut data[offset..]) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(ReadResult::Again)
                }
                Err(e) => {
                    return Err(EngineError::Read(format!(
                        "read from {}: {e}",
                        endpoint_name(&src.name, src.fd)
                    )))
                }
            }
        };
        src.pos_read += n as u64;
        trace!(
            "read {n} bytes from {}; now at {}",
            endpoint_name(&src.name, src.fd),
            src.pos_read
        );
        if n == 0 {
            Ok(ReadResult::Eof)
        } else {
            Ok(ReadResult::Ok)
        }
    }

    /// Allocate available data to sinks that are empty and writable,
    /// adjusting their source, `pos_written` and `pos_to_write`.
    fn allocate_data_to_sinks(&mut self, ready: &[bool]) -> EngineResult<()> {
        let cfg = self.cfg.clone();

        if !cfg.scatter {
            // Easy case: every sink follows its source, advancing along
            // the chain on EOF.
            for k in 0..self.sinks.len() {
                let (src_pos, src_eof, src_last, src_next) = {
                    let src = &self.sources[self.sinks[k].src];
                    (src.pos_read, src.reached_eof, src.chain_last, src.next)
                };
                if self.sinks[k].pos_written == src_pos && src_eof && !src_last {
                    let next = src_next.expect("chained source without a successor");
                    self.sinks[k].src = next;
                    self.sinks[k].pos_written = 0;
                    self.sources[next].active = true;
                    debug!("sink {k} advances to source {next}");
                }
                self.sinks[k].pos_to_write = self.sources[self.sinks[k].src].pos_read;
            }
            return Ok(());
        }

        // Fair scattering across the available sinks; a single source
        // by construction.
        let source_pos_read = self.sources[0].pos_read;
        let mut pos_assigned = self
            .sinks
            .iter()
            .map(|o| o.pos_to_write)
            .max()
            .unwrap_or(0);
        let available_sinks = self
            .sinks
            .iter()
            .enumerate()
            .filter(|(k, o)| o.pos_written == o.pos_to_write && ready[*k])
            .count();
        // Clamp to the end of the page so assignment stays within one
        // continuous memory region.
        let available_data = region_length(pos_assigned, source_pos_read, cfg.buffer_size);
        if available_sinks == 0 {
            return Ok(());
        }

        let data_per_sink = available_data / available_sinks;
        let mut data_to_assign = 0usize;
        let mut use_reliable = false;
        for k in 0..self.sinks.len() {
            if self.sinks[k].pos_written != self.sinks[k].pos_to_write || !ready[k] {
                continue;
            }
            // The first sink also gets the remainder bytes.
            if data_to_assign == 0 {
                data_to_assign = region_length(
                    pos_assigned,
                    pos_assigned + (data_per_sink + available_data % available_sinks) as u64,
                    cfg.buffer_size,
                );
            } else {
                data_to_assign = data_per_sink;
            }
            self.sinks[k].pos_written = pos_assigned;
            if cfg.block_len == 0 {
                let mut assigned = false;
                if available_data > cfg.buffer_size / 2 && !use_reliable {
                    // Fast path: assume several records fit in the
                    // share and scan backward from its end for a
                    // terminator.
                    let mut data_end = pos_assigned as i64 + data_to_assign as i64 - 1;
                    loop {
                        if data_end <= pos_assigned as i64 {
                            use_reliable = true;
                            break;
                        }
                        if self.sources[0].pool.byte_at(data_end as u64, &cfg)?
                            == cfg.record_terminator
                        {
                            pos_assigned = data_end as u64 + 1;
                            assigned = true;
                            break;
                        }
                        data_end -= 1;
                    }
                }
                if !assigned {
                    // Reliable path: scan forward remembering the last
                    // terminator; defer assignment when none exists in
                    // the available region.
                    let mut last_nl: i64 = -1;
                    let mut data_end = pos_assigned;
                    loop {
                        if data_end >= source_pos_read {
                            if last_nl != -1 {
                                pos_assigned = last_nl as u64 + 1;
                                break;
                            }
                            self.sinks[k].pos_to_write = pos_assigned;
                            return Ok(());
                        }
                        if self.sources[0].pool.byte_at(data_end, &cfg)? == cfg.record_terminator {
                            last_nl = data_end as i64;
                            if data_end - pos_assigned > data_per_sink as u64 {
                                pos_assigned = data_end + 1;
                                break;
                            }
                        }
                        data_end += 1;
                    }
                }
            } else {
                pos_assigned += data_to_assign as u64;
            }
            self.sinks[k].pos_to_write = pos_assigned;
            trace!(
                "scatter to sink {k}: pos_written={} pos_to_write={}",
                self.sinks[k].pos_written,
                self.sinks[k].pos_to_write
            );
        }
        Ok(())
    }

    /// Write buffered data to every ready sink and release pages no
    /// consumer needs any more. Returns the number of bytes written.
    fn sink_write(&mut self, ready: &[bool]) -> EngineResult<usize> {
        let cfg = self.cfg.clone();
        for src in &mut self.sources {
            src.read_min_pos = src.pos_read;
            src.is_read = false;
        }

        self.allocate_data_to_sinks(ready)?;

        let mut written = 0usize;
        for k in 0..self.sinks.len() {
            if self.sinks[k].active && ready[k] {
                let (pos_written, pos_to_write, src_i) = {
                    let o = &self.sinks[k];
                    (o.pos_written, o.pos_to_write, o.src)
                };
                let len = region_length(pos_written, pos_to_write, cfg.buffer_size);
                if len > 0 {
                    let n = {
                        let data = self.sources[src_i].pool.data_at(pos_written, len, &cfg)?;
                        let mut f = borrowed_file(self.sinks[k].fd);
                        f.write(data)
                    };
                    match n {
                        Ok(n) => {
                            self.sinks[k].pos_written += n as u64;
                            written += n;
                            trace!(
                                "wrote {n} of {len} bytes to {}",
                                endpoint_name(&self.sinks[k].name, self.sinks[k].fd)
                            );
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                            // The sink's reader can terminate early;
                            // drop the sink, keep going.
                            self.sinks[k].active = false;
                            let _ = unistd::close(self.sinks[k].fd);
                            debug!(
                                "EPIPE for {}",
                                endpoint_name(&self.sinks[k].name, self.sinks[k].fd)
                            );
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            return Err(EngineError::Io(format!(
                                "error writing to {}: {e}",
                                endpoint_name(&self.sinks[k].name, self.sinks[k].fd)
                            )))
                        }
                    }
                }
            }
            if self.sinks[k].active {
                let src = &mut self.sources[self.sinks[k].src];
                src.read_min_pos = src.read_min_pos.min(self.sinks[k].pos_written);
                src.is_read = true;
            }
        }

        // Free buffers every consumer of a source has passed; stop at
        // the first source still being read.
        for &si in &self.source_order.clone() {
            let min_pos = self.sources[si].read_min_pos;
            self.sources[si].pool.free_until(min_pos, &cfg);
            if self.sources[si].is_read {
                break;
            }
        }
        Ok(written)
    }

    fn print_memory_stats(&self) {
        for src in &self.sources {
            let s = &src.pool.stats;
            eprintln!("Input file: {}", endpoint_name(&src.name, src.fd));
            eprintln!(
                "Buffers allocated: {} Freed: {} Maximum allocated: {}",
                s.allocated, s.freed, s.max_allocated
            );
            eprintln!(
                "Page out: {} In: {} Pages freed: {}",
                s.paged_out, s.paged_in, s.pages_freed
            );
        }
    }

    /// Copy every source to its sinks without letting any single
    /// descriptor block the engine. Returns once all sources are at
    /// EOF and every active sink has drained.
    pub fn run(&mut self) -> EngineResult<()> {
        if self.sources.is_empty() || self.sinks.is_empty() {
            return Err(EngineError::Setup(
                "no sources or no sinks to copy between".to_string(),
            ));
        }
        if self.cfg.scatter && self.sources.len() > 1 {
            return Err(EngineError::Setup(
                "scattering not supported with more than one input".to_string(),
            ));
        }

        // EPIPE is handled at each write site instead.
        unsafe {
            let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        }

        self.chain_io()?;
        let mut state = if self.cfg.input_side_buffering {
            EngineState::ReadIb
        } else {
            EngineState::ReadOb
        };

        loop {
            trace!("state: {state:?}");
            let mut read_interest: Vec<usize> = Vec::new();
            let mut write_interest: Vec<usize> = Vec::new();

            if !self.reached_eof {
                match state {
                    EngineState::ReadIb => {
                        for (i, src) in self.sources.iter().enumerate() {
                            if !src.reached_eof {
                                read_interest.push(i);
                            }
                        }
                    }
                    EngineState::ReadOb => {
                        for (i, src) in self.sources.iter().enumerate() {
                            if src.active && !src.reached_eof {
                                read_interest.push(i);
                            }
                        }
                    }
                    _ => {}
                }
            }
            for (k, sink) in self.sinks.iter().enumerate() {
                if !sink.active {
                    continue;
                }
                match state {
                    EngineState::ReadIb | EngineState::ReadOb | EngineState::DrainOb => {
                        if sink.pos_written < sink.pos_to_write {
                            write_interest.push(k);
                        }
                    }
                    // Wait on all active sinks, not only those with
                    // pending data, to avoid starving downstream
                    // processes when no input arrives.
                    EngineState::DrainIb | EngineState::WriteOb => write_interest.push(k),
                }
            }

            let (sources_ready, sinks_ready) =
                if read_interest.is_empty() && write_interest.is_empty() {
                    (vec![false; self.sources.len()], vec![false; self.sinks.len()])
                } else {
                    self.wait_io(&read_interest, &write_interest)?
                };

            if self.sink_write(&sinks_ready)? > 0 {
                // Progress downstream; loop without reading to avoid
                // growing the buffers.
                if state == EngineState::DrainOb {
                    state = EngineState::WriteOb;
                }
                continue;
            }

            if self.reached_eof {
                let mut pending = 0;
                for k in 0..self.sinks.len() {
                    if !self.sinks[k].active {
                        continue;
                    }
                    if self.sinks[k].pos_written < self.sinks[k].pos_to_write {
                        pending += 1;
                    } else {
                        // Close early so downstream sees EOF and cannot
                        // deadlock on us.
                        debug!(
                            "retiring {}",
                            endpoint_name(&self.sinks[k].name, self.sinks[k].fd)
                        );
                        unistd::close(self.sinks[k].fd).map_err(|e| {
                            EngineError::Io(format!(
                                "error closing {}: {e}",
                                endpoint_name(&self.sinks[k].name, self.sinks[k].fd)
                            ))
                        })?;
                        self.sinks[k].active = false;
                    }
                }
                if pending == 0 {
                    if self.cfg.memory_stats {
                        self.print_memory_stats();
                    }
                    return Ok(());
                }
            }

            match state {
                EngineState::ReadIb => {
                    self.reached_eof = true;
                    for pos in 0..self.source_order.len() {
                        let si = self.source_order[pos];
                        if sources_ready[si] {
                            match self.source_read(si)? {
                                ReadResult::Eof => self.sources[si].reached_eof = true,
                                ReadResult::Oom => {
                                    return Err(EngineError::Setup(
                                        "out of memory with input-side buffering specified"
                                            .to_string(),
                                    ))
                                }
                                ReadResult::Ok | ReadResult::Again => {}
                            }
                        }
                        if !self.sources[si].reached_eof {
                            self.reached_eof = false;
                        }
                    }
                    if self.reached_eof {
                        state = EngineState::DrainIb;
                    }
                }
                EngineState::ReadOb => {
                    self.reached_eof = true;
                    for pos in 0..self.source_order.len() {
                        let si = self.source_order[pos];
                        if self.sources[si].active && sources_ready[si] {
                            match self.source_read(si)? {
                                ReadResult::Eof => {
                                    self.sources[si].reached_eof = true;
                                    self.sources[si].active = false;
                                    if !self.sources[si].chain_last {
                                        let next = self.sources[si]
                                            .next
                                            .expect("chained source without a successor");
                                        self.sources[next].active = true;
                                    }
                                }
                                ReadResult::Again => {}
                                ReadResult::Oom => state = EngineState::DrainOb,
                                ReadResult::Ok => state = EngineState::WriteOb,
                            }
                        }
                        if !self.sources[si].reached_eof {
                            self.reached_eof = false;
                        }
                    }
                    if self.reached_eof {
                        state = EngineState::DrainIb;
                    }
                }
                EngineState::DrainIb => {}
                EngineState::DrainOb => {
                    state = if self.reached_eof {
                        EngineState::WriteOb
                    } else {
                        EngineState::ReadOb
                    };
                }
                EngineState::WriteOb => {
                    if !self.reached_eof {
                        state = EngineState::ReadOb;
                    }
                }
            }
        }
    }

    /// Block until any interesting descriptor is ready; returns
    /// readiness flags indexed like the sources and sinks.
    fn wait_io(
        &self,
        read_interest: &[usize],
        write_interest: &[usize],
    ) -> EngineResult<(Vec<bool>, Vec<bool>)> {
        loop {
            let mut read_set = FdSet::new();
            let mut write_set = FdSet::new();
            for &i in read_interest {
                read_set.insert(unsafe { BorrowedFd::borrow_raw(self.sources[i].fd) });
            }
            for &k in write_interest {
                write_set.insert(unsafe { BorrowedFd::borrow_raw(self.sinks[k].fd) });
            }
            match select(None, &mut read_set, &mut write_set, None, None) {
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(EngineError::Read(format!("select: {e}"))),
                Ok(_) => {
                    let mut sources_ready = vec![false; self.sources.len()];
                    let mut sinks_ready = vec![false; self.sinks.len()];
                    for &i in read_interest {
                        sources_ready[i] = read_set
                            .contains(unsafe { BorrowedFd::borrow_raw(self.sources[i].fd) });
                    }
                    for &k in write_interest {
                        sinks_ready[k] = write_set
                            .contains(unsafe { BorrowedFd::borrow_raw(self.sinks[k].fd) });
                    }
                    return Ok((sources_ready, sinks_ready));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_is_column_major() {
        assert_eq!(transpose(9, 3), vec![0, 3, 6, 1, 4, 7, 2, 5, 8]);
        assert_eq!(transpose(6, 3), vec![0, 3, 1, 4, 2, 5]);
        assert_eq!(transpose(3, 3), vec![0, 1, 2]);
        assert_eq!(transpose(4, 1), vec![0, 1, 2, 3]);
        assert_eq!(transpose(1, 1), vec![0]);
    }

    #[test]
    fn region_length_stops_at_page_end() {
        assert_eq!(region_length(0, 10, 1024), 10);
        assert_eq!(region_length(1000, 5000, 1024), 24);
        assert_eq!(region_length(1024, 1034, 1024), 10);
        assert_eq!(region_length(5, 5, 1024), 0);
    }

    #[test]
    fn pool_pages_spill_and_return() {
        let cfg = Config {
            buffer_size: 16,
            max_mem: 32,
            use_tmp_file: true,
            ..Config::default()
        };
        let mut pool = BufferPool::new();
        // Fill three pages; the ceiling only fits two.
        for i in 0..3 {
            assert!(pool.allocate(i, &cfg).unwrap());
            if let Page::Memory(data) = &mut pool.pages[i] {
                data.fill(b'a' + i as u8);
            }
        }
        assert!(pool.stats.paged_out > 0, "expected a page-out");
        // Every byte must still be reachable, resident or not.
        for i in 0..3u64 {
            assert_eq!(pool.byte_at(i * 16, &cfg).unwrap(), b'a' + i as u8);
        }
        assert!(pool.stats.paged_in > 0);
    }

    #[test]
    fn pool_respects_ceiling_without_spill() {
        let cfg = Config {
            buffer_size: 16,
            max_mem: 32,
            use_tmp_file: false,
            ..Config::default()
        };
        let mut pool = BufferPool::new();
        assert!(pool.allocate(0, &cfg).unwrap());
        assert!(pool.allocate(1, &cfg).unwrap());
        assert!(!pool.allocate(2, &cfg).unwrap(), "ceiling must refuse");
    }

    #[test]
    fn freeing_releases_pages_below_the_low_water_mark() {
        let cfg = Config {
            buffer_size: 16,
            max_mem: 1024,
            ..Config::default()
        };
        let mut pool = BufferPool::new();
        for i in 0..4 {
            assert!(pool.allocate(i, &cfg).unwrap());
        }
        pool.free_until(33, &cfg);
        assert_eq!(pool.free_begin, 2);
        assert!(matches!(pool.pages[0], Page::None));
        assert!(matches!(pool.pages[1], Page::None));
        assert!(matches!(pool.pages[2], Page::Memory(_)));
        assert_eq!(pool.stats.freed, 2);
    }

    fn engine_with(nin: usize, nout: usize, permute: Vec<usize>) -> Engine {
        // Descriptor numbers are never used by chain_io.
        let mut engine = Engine::new(Config {
            permute,
            ..Config::default()
        });
        for i in 0..nin {
            engine.sources.push(Source {
                name: Some(format!("in{i}")),
                fd: -1,
                pool: BufferPool::new(),
                pos_read: 0,
                reached_eof: false,
                read_min_pos: 0,
                active: false,
                is_read: false,
                chain_last: false,
                next: None,
            });
        }
        for k in 0..nout {
            engine.sinks.push(Sink {
                name: Some(format!("out{k}")),
                fd: -1,
                pos_written: 0,
                pos_to_write: 0,
                active: true,
                src: 0,
            });
        }
        engine
    }

    #[test]
    fn cat_chains_all_inputs_to_one_output() {
        let mut engine = engine_with(3, 1, vec![]);
        engine.chain_io().unwrap();
        assert!(engine.sources[0].active);
        assert!(!engine.sources[1].active);
        assert!(!engine.sources[2].active);
        assert_eq!(engine.sources[0].next, Some(1));
        assert_eq!(engine.sources[1].next, Some(2));
        assert!(engine.sources[2].chain_last);
        assert_eq!(engine.sinks[0].src, 0);
    }

    #[test]
    fn tee_feeds_all_outputs_from_one_input() {
        let mut engine = engine_with(1, 3, vec![]);
        engine.chain_io().unwrap();
        assert!(engine.sources[0].active && engine.sources[0].chain_last);
        for sink in &engine.sinks {
            assert_eq!(sink.src, 0);
        }
    }

    #[test]
    fn permutation_crosses_the_streams() {
        // dgsh-tee -p 2,1: input 0 feeds output 1 and vice versa.
        let mut engine = engine_with(2, 2, vec![1, 0]);
        engine.chain_io().unwrap();
        assert_eq!(engine.sinks[0].src, 1);
        assert_eq!(engine.sinks[1].src, 0);
    }

    #[test]
    fn multipipe_groups_follow_the_transposition() {
        let mut engine = engine_with(6, 2, vec![]);
        engine.chain_io().unwrap();
        // Transposed traversal 0,3,1,4,2,5 in groups of three: the
        // chain heads are 0 and 4.
        assert_eq!(engine.source_order, vec![0, 3, 1, 4, 2, 5]);
        assert_eq!(engine.sinks[0].src, 0);
        assert_eq!(engine.sinks[1].src, 4);
        assert!(engine.sources[0].active);
        assert!(engine.sources[4].active);
        assert!(!engine.sources[3].active);
        // Chain for the first sink runs 0 -> 3 -> 1.
        assert_eq!(engine.sources[0].next, Some(3));
        assert_eq!(engine.sources[3].next, Some(1));
        assert!(engine.sources[1].chain_last);
    }

    #[test]
    fn uneven_multipipe_is_rejected() {
        let mut engine = engine_with(3, 2, vec![]);
        match engine.chain_io() {
            Err(EngineError::Setup(msg)) => assert!(msg.contains("exact multiple"), "{msg}"),
            other => panic!("expected setup error, got {other:?}"),
        }
    }
}
