//! In-memory model of the negotiation message block.
//!
//! The block is the single vehicle of the negotiation: it is circulated
//! over the participants' standard streams, accretes nodes and edges
//! while in [`State::Negotiation`], and carries the computed
//! [`NodeConnections`] solution once the initiator moves it to
//! [`State::Run`]. All cross references (edge endpoints, solution
//! records) are indices into the block's own vectors, so a block can be
//! serialized and rebuilt without fixups.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Protocol version stamped into every block.
pub const PROTOCOL_VERSION: i32 = 1;

/// Fixed width of a node name on the wire; longer names are truncated.
pub const NODE_NAME_LEN: usize = 100;

/// Origin direction marker: the block was last written on a stdin-side
/// descriptor.
pub const DIR_STDIN: i32 = 0;
/// Origin direction marker: the block was last written on a stdout-side
/// descriptor.
pub const DIR_STDOUT: i32 = 1;

/// Negotiation protocol states.
///
/// Transitions are monotone: `Negotiation` → `NegotiationEnd` → one of
/// `Run`, `DrawExit`, `Error` → `Complete`. A participant never
/// downgrades the state of a block it forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum State {
    /// Negotiation has finished and the local participant may run.
    Complete,
    /// Requirements are still being gathered.
    Negotiation,
    /// The initiator has seen the full graph and is about to solve.
    NegotiationEnd,
    /// A solution is attached and is being shared.
    Run,
    /// The constraints are unsolvable or an I/O error occurred.
    Error,
    /// Solution was computed and drawn; every participant exits.
    DrawExit,
}

impl State {
    /// Human-readable state name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            State::Complete => "COMPLETE",
            State::Negotiation => "NEGOTIATION",
            State::NegotiationEnd => "NEGOTIATION_END",
            State::Run => "RUN",
            State::Error => "ERROR",
            State::DrawExit => "DRAW_EXIT",
        }
    }
}

/// A participating tool on the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Process id of the tool.
    pub pid: i32,
    /// Position in the block's node array; set when the node is added.
    pub index: i32,
    /// Tool name, used in diagnostics and graph drawings.
    pub name: String,
    /// Input channels the tool requires; −1 means flexible.
    pub requires_channels: i32,
    /// Output channels the tool provides; −1 means flexible.
    pub provides_channels: i32,
    /// True when the tool's input side faces the graph.
    pub dgsh_in: bool,
    /// True when the tool's output side faces the graph.
    pub dgsh_out: bool,
}

/// An I/O connection between two nodes.
///
/// `from` and `to` index the block's node array. `instances` is the
/// final pipe multiplicity; `from_instances` and `to_instances` hold
/// the two endpoints' working values while the solver runs (−1 while a
/// side is flexible).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: i32,
    pub to: i32,
    pub instances: i32,
    pub from_instances: i32,
    pub to_instances: i32,
}

/// Registration record for a concentrator relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcInfo {
    /// The concentrator's process id.
    pub pid: i32,
    /// Total descriptors on its input side; −1 until computed.
    pub input_fds: i32,
    /// Total descriptors on its output side; −1 until computed.
    pub output_fds: i32,
    /// Peer pids at the multi-descriptor end.
    pub proc_pids: Vec<i32>,
    /// Peer pid at the single-descriptor end.
    pub endpoint_pid: i32,
    /// True for a gathering (input) concentrator.
    pub multiple_inputs: bool,
}

/// One node's share of the graph solution: owned copies of its solved
/// incoming and outgoing edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeConnections {
    pub node_index: i32,
    pub incoming: Vec<Edge>,
    pub outgoing: Vec<Edge>,
}

/// The negotiation message block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    pub version: i32,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Pid of the process that created this block. Never changes once
    /// set; when two blocks meet, the one with the smaller initiator
    /// pid survives.
    pub initiator_pid: i32,
    pub state: State,
    /// Set by the initiator on its second pass over an error.
    pub is_error_confirmed: bool,
    /// Set when a draw-exit solution has been computed and shared.
    pub is_draw_exit_confirmed: bool,
    /// Node-array index of the last dispatcher; −1 on a fresh block.
    pub origin_index: i32,
    /// Which side the dispatcher wrote on ([`DIR_STDIN`]/[`DIR_STDOUT`]).
    pub origin_fd_direction: i32,
    /// True when the last dispatcher was a concentrator.
    pub is_origin_conc: bool,
    /// Pid of the dispatching concentrator, −1 otherwise.
    pub conc_pid: i32,
    pub concs: Vec<ConcInfo>,
    /// Attached once the initiator has solved the constraint problem.
    pub solution: Option<Vec<NodeConnections>>,
}

impl MessageBlock {
    /// Construct a fresh block with the given process as initiator.
    pub fn new(initiator_pid: i32) -> Self {
        MessageBlock {
            version: PROTOCOL_VERSION,
            nodes: Vec::new(),
            edges: Vec::new(),
            initiator_pid,
            state: State::Negotiation,
            is_error_confirmed: false,
            is_draw_exit_confirmed: false,
            origin_index: -1,
            origin_fd_direction: -1,
            is_origin_conc: false,
            conc_pid: -1,
            concs: Vec::new(),
            solution: None,
        }
    }

    /// Look up a node by process id.
    pub fn node_by_pid(&self, pid: i32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.pid == pid)
    }

    /// Append a node, assigning its array index, and return that index.
    pub fn add_node(&mut self, mut node: Node) -> i32 {
        let index = self.nodes.len() as i32;
        node.index = index;
        self.nodes.push(node);
        index
    }

    /// True when an edge already links the two indices, in either
    /// orientation. At most one edge exists per unordered pair.
    pub fn has_edge_between(&self, a: i32, b: i32) -> bool {
        self.edges
            .iter()
            .any(|e| (e.from == a && e.to == b) || (e.from == b && e.to == a))
    }

    /// Append an edge between existing node indices.
    pub fn add_edge(&mut self, edge: Edge) {
        debug_assert!(edge.from != edge.to);
        debug_assert!((edge.from as usize) < self.nodes.len());
        debug_assert!((edge.to as usize) < self.nodes.len());
        self.edges.push(edge);
    }

    /// Look up a concentrator record by pid.
    pub fn find_conc(&self, pid: i32) -> Option<&ConcInfo> {
        self.concs.iter().find(|c| c.pid == pid)
    }

    /// Pid of the process that dispatched this block, or 0 when the
    /// node array is still empty (an error manifested early).
    pub fn origin_pid(&self) -> i32 {
        if self.is_origin_conc {
            return self.conc_pid;
        }
        match self.nodes.get(self.origin_index as usize) {
            Some(n) => n.pid,
            None => 0,
        }
    }

    /// Number of input descriptors the process with `pid` expects,
    /// according to the solution. Applicable to concentrators too.
    /// Returns −1 for an unknown pid or a conc whose counts are not yet
    /// fixed.
    pub fn expected_fds(&self, pid: i32) -> i32 {
        if let Some(node) = self.node_by_pid(pid) {
            let Some(solution) = &self.solution else {
                return -1;
            };
            return solution[node.index as usize]
                .incoming
                .iter()
                .map(|e| e.instances)
                .sum();
        }
        match self.find_conc(pid) {
            Some(c) => c.input_fds,
            None => -1,
        }
    }

    /// Number of output descriptors the process with `pid` provides,
    /// mirroring [`MessageBlock::expected_fds`].
    pub fn provided_fds(&self, pid: i32) -> i32 {
        if let Some(node) = self.node_by_pid(pid) {
            let Some(solution) = &self.solution else {
                return -1;
            };
            return solution[node.index as usize]
                .outgoing
                .iter()
                .map(|e| e.instances)
                .sum();
        }
        match self.find_conc(pid) {
            Some(c) => c.output_fds,
            None => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(pid: i32, name: &str) -> Node {
        Node {
            pid,
            index: -1,
            name: name.to_string(),
            requires_channels: 1,
            provides_channels: 1,
            dgsh_in: true,
            dgsh_out: true,
        }
    }

    #[test]
    fn node_indices_follow_insertion_order() {
        let mut mb = MessageBlock::new(100);
        assert_eq!(mb.add_node(node(100, "a")), 0);
        assert_eq!(mb.add_node(node(200, "b")), 1);
        assert_eq!(mb.nodes[1].index, 1);
        assert_eq!(mb.node_by_pid(200).unwrap().name, "b");
    }

    #[test]
    fn edge_lookup_ignores_orientation() {
        let mut mb = MessageBlock::new(100);
        mb.add_node(node(100, "a"));
        mb.add_node(node(200, "b"));
        mb.add_edge(Edge {
            from: 0,
            to: 1,
            instances: 0,
            from_instances: 0,
            to_instances: 0,
        });
        assert!(mb.has_edge_between(0, 1));
        assert!(mb.has_edge_between(1, 0));
        assert!(!mb.has_edge_between(0, 0));
    }

    #[test]
    fn origin_pid_tracks_conc_dispatch() {
        let mut mb = MessageBlock::new(100);
        mb.add_node(node(100, "a"));
        mb.origin_index = 0;
        assert_eq!(mb.origin_pid(), 100);
        mb.is_origin_conc = true;
        mb.conc_pid = 777;
        assert_eq!(mb.origin_pid(), 777);
    }
}
