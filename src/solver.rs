//! The I/O constraint solver.
//!
//! Works purely over a block's node and edge arrays in two phases.
//! Phase one distributes each node's channel constraint across its
//! edges (the dry match). Phase two reconciles the two working values
//! stored at each edge's endpoints, shifting instances between edges of
//! the same node side when the endpoints disagree, and retries until
//! every node's fixed constraint is met or the retry budget runs out.
//! On success the per-node edge references are compacted into owned
//! solution records and the concentrator descriptor counts are fixed.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;

use log::{debug, trace};

use crate::graph::{MessageBlock, NodeConnections};

/// Attempts to reconcile working instance values before giving up.
const CROSS_MATCH_RETRIES: u32 = 10;

/// The node side a constraint applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Input,
    Output,
}

/// One node whose fixed constraint could not be met.
#[derive(Debug)]
pub struct Unsatisfied {
    pub name: String,
    pub side: Side,
    pub required: i32,
}

/// Why the solver failed. The initiator stamps the block with ERROR and
/// prints this on its diagnostic stream.
#[derive(Debug)]
pub enum SolverError {
    /// A fixed constraint faces more than one flexible peer on one
    /// node side; not solvable in the general case.
    MultipleFlexible,
    /// Fixed constraints left unmet after the retry budget.
    Unsatisfied(Vec<Unsatisfied>),
    /// The concentrator descriptor-count fixpoint did not converge.
    ConcFds,
    /// The graph drawing could not be written.
    Draw(std::io::Error),
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SolverError::MultipleFlexible => {
                write!(f, "more than one edge is flexible; cannot compute a solution")
            }
            SolverError::Unsatisfied(nodes) => {
                writeln!(
                    f,
                    "no solution was found to satisfy the I/O requirements of the following {} participating processes:",
                    nodes.len()
                )?;
                for n in nodes {
                    let side = match n.side {
                        Side::Input => "nin",
                        Side::Output => "nout",
                    };
                    if n.required == -1 {
                        writeln!(f, "{} ({}=flex)", n.name, side)?;
                    } else {
                        writeln!(f, "{} ({}={})", n.name, side, n.required)?;
                    }
                }
                Ok(())
            }
            SolverError::ConcFds => {
                write!(f, "unable to compute concentrator descriptor counts")
            }
            SolverError::Draw(e) => write!(f, "unable to write graph drawing: {e}"),
        }
    }
}

impl std::error::Error for SolverError {}

/// What a successful solve asks the participants to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    /// Share the solution and run the data phase.
    Run,
    /// The solution was drawn; everyone exits without a data phase.
    DrawExit,
}

/// Environment-derived solving options.
#[derive(Debug, Default, Clone)]
pub struct SolveOptions {
    /// Base name for DOT drawings of the solved graph.
    pub dot_draw: Option<String>,
    /// Emit DRAW-EXIT instead of RUN after a successful solve.
    pub draw_exit: bool,
}

impl SolveOptions {
    /// Read `DGSH_DOT_DRAW` and `DGSH_DRAW_EXIT`.
    pub fn from_env() -> Self {
        SolveOptions {
            dot_draw: std::env::var("DGSH_DOT_DRAW").ok(),
            draw_exit: std::env::var("DGSH_DRAW_EXIT").is_ok(),
        }
    }
}

/// Edge indices incident to one node, gathered once per solve.
#[derive(Debug, Default, Clone)]
struct NodeEdgeRefs {
    incoming: Vec<usize>,
    outgoing: Vec<usize>,
}

/// Distribute a node's channel constraint across one side's edges.
///
/// A fixed constraint k over n edges gives each edge ⌈k/n⌉ or ⌊k/n⌋
/// working instances; a flexible constraint marks every edge −1 on
/// that side.
fn satisfy_io_constraints(
    mb: &mut MessageBlock,
    constraint: i32,
    edge_refs: &[usize],
    is_incoming: bool,
) {
    let n = edge_refs.len() as i32;
    let (weight, mut modulo) = if constraint > 0 {
        (constraint / n, constraint % n)
    } else if constraint == 0 {
        (0, 0)
    } else {
        (-1, 0)
    };
    for &ei in edge_refs {
        let value = weight + (modulo > 0) as i32;
        let edge = &mut mb.edges[ei];
        if is_incoming {
            edge.to_instances = value;
        } else {
            edge.from_instances = value;
        }
        if modulo > 0 {
            modulo -= 1;
        }
        trace!(
            "dry match: edge {} -> {} now from {} to {}",
            edge.from,
            edge.to,
            edge.from_instances,
            edge.to_instances
        );
    }
}

/// Phase one: gather each node's edges and record the per-side working
/// instance values. Idempotent over the same block.
fn node_match_constraints(mb: &mut MessageBlock) -> Vec<NodeEdgeRefs> {
    let mut sides = vec![NodeEdgeRefs::default(); mb.nodes.len()];
    for (ei, edge) in mb.edges.iter().enumerate() {
        sides[edge.from as usize].outgoing.push(ei);
        sides[edge.to as usize].incoming.push(ei);
    }
    for i in 0..mb.nodes.len() {
        let requires = mb.nodes[i].requires_channels;
        let provides = mb.nodes[i].provides_channels;
        let refs = sides[i].clone();
        if !refs.outgoing.is_empty() {
            satisfy_io_constraints(mb, provides, &refs.outgoing, false);
        }
        if !refs.incoming.is_empty() {
            satisfy_io_constraints(mb, requires, &refs.incoming, true);
        }
    }
    sides
}

/// Record an instance move against an edge whose two fixed endpoint
/// values disagree. Returns the signed amount to apply later.
fn record_move_unbalanced(diff: &mut i32, to_move: i32, pair: i32) -> Option<i32> {
    if (*diff > 0 && to_move < pair) || (*diff < 0 && to_move > pair) {
        let amount = if (*diff > 0 && *diff - (pair - to_move) >= 0)
            || (*diff < 0 && *diff - (pair - to_move) <= 0)
        {
            pair - to_move
        } else {
            *diff
        };
        *diff -= amount;
        Some(amount)
    } else {
        None
    }
}

/// Record an instance move against an edge whose pair side is
/// flexible. Subtraction never drives an edge below one instance.
fn record_move_flexible(diff: &mut i32, to_move: i32) -> Option<i32> {
    if *diff > 0 || (*diff < 0 && to_move > 1) {
        let amount = if *diff < 0 && *diff + (to_move - 1) <= 0 {
            -(to_move - 1)
        } else {
            *diff
        };
        *diff -= amount;
        Some(amount)
    } else {
        None
    }
}

/// Shift `diff` instances to or from other edges of the same node side
/// that have slack. The moves are applied only when the full difference
/// can be absorbed; otherwise nothing changes and the caller retries.
fn move_instances(mb: &mut MessageBlock, edge_refs: &[usize], mut diff: i32, is_incoming: bool) -> bool {
    let mut moves: Vec<(usize, i32)> = Vec::new();

    // Unbalanced fixed edges first.
    for &ei in edge_refs {
        let edge = &mb.edges[ei];
        let (from, to) = (edge.from_instances, edge.to_instances);
        if from == -1 || to == -1 {
            continue;
        }
        let (to_move, pair) = if is_incoming { (to, from) } else { (from, to) };
        if let Some(amount) = record_move_unbalanced(&mut diff, to_move, pair) {
            moves.push((ei, amount));
        }
        if diff == 0 {
            break;
        }
    }

    // Then edges whose pair side is flexible.
    if diff != 0 {
        for &ei in edge_refs {
            let edge = &mb.edges[ei];
            let (from, to) = (edge.from_instances, edge.to_instances);
            let to_move = if is_incoming {
                if from >= 0 {
                    continue;
                }
                to
            } else {
                if to >= 0 {
                    continue;
                }
                from
            };
            if let Some(amount) = record_move_flexible(&mut diff, to_move) {
                moves.push((ei, amount));
            }
            if diff == 0 {
                break;
            }
        }
    }

    if diff != 0 {
        return false;
    }
    for (ei, amount) in moves {
        let edge = &mut mb.edges[ei];
        if is_incoming {
            edge.to_instances += amount;
        } else {
            edge.from_instances += amount;
        }
        trace!("moved {} instances on edge {} -> {}", amount, edge.from, edge.to);
    }
    true
}

/// Cross-match one node side. Returns whether the side's constraint is
/// met; bumps `edges_matched` once per edge reconciled from this side.
fn cross_match_side(
    mb: &mut MessageBlock,
    constraint: i32,
    edge_refs: &[usize],
    is_incoming: bool,
    edges_matched: &mut u32,
) -> Result<bool, SolverError> {
    let mut from_flex = 0;
    let mut to_flex = 0;

    for &ei in edge_refs {
        let before = *edges_matched;
        let (from, to) = {
            let e = &mb.edges[ei];
            (e.from_instances, e.to_instances)
        };
        if from == -1 || to == -1 {
            let e = &mut mb.edges[ei];
            if from == -1 && to == -1 {
                from_flex += 1;
                to_flex += 1;
                e.instances = 1;
            } else if from == -1 {
                from_flex += 1;
                e.instances = to;
            } else {
                to_flex += 1;
                e.instances = from;
            }
            *edges_matched += 1;
            // A fixed constraint facing several flexible peers on one
            // side admits many solutions; refuse rather than guess.
            if constraint > 0
                && ((is_incoming && from_flex > 1) || (!is_incoming && to_flex > 1))
            {
                return Err(SolverError::MultipleFlexible);
            }
        } else if from == to {
            mb.edges[ei].instances = from;
            *edges_matched += 1;
        } else if from < to {
            if is_incoming {
                if move_instances(mb, edge_refs, to - from, true) {
                    mb.edges[ei].to_instances -= to - from;
                    *edges_matched += 1;
                }
            } else if move_instances(mb, edge_refs, -(to - from), false) {
                mb.edges[ei].from_instances += to - from;
                *edges_matched += 1;
            }
        } else {
            if is_incoming {
                if move_instances(mb, edge_refs, -(from - to), true) {
                    mb.edges[ei].to_instances += from - to;
                    *edges_matched += 1;
                }
            } else if move_instances(mb, edge_refs, from - to, false) {
                mb.edges[ei].from_instances -= from - to;
                *edges_matched += 1;
            }
        }
        if before == *edges_matched {
            debug!("could not match edge {} of this side yet", ei);
            return Ok(false);
        }
    }

    if constraint == -1 {
        return Ok(true);
    }
    let fds: i32 = edge_refs.iter().map(|&ei| mb.edges[ei].instances).sum();
    trace!(
        "{} endpoints to set up: {}, constraint: {}",
        if is_incoming { "incoming" } else { "outgoing" },
        fds,
        constraint
    );
    Ok(fds == constraint)
}

/// Phase two over the whole graph. `Ok(None)` means everything matched;
/// `Ok(Some(..))` lists the sides still unsatisfied this round.
fn cross_match_constraints(
    mb: &mut MessageBlock,
    sides: &[NodeEdgeRefs],
) -> Result<Option<Vec<Unsatisfied>>, SolverError> {
    let mut edges_matched = 0u32;
    let mut unsatisfied = Vec::new();

    for i in 0..mb.nodes.len() {
        let provides = mb.nodes[i].provides_channels;
        let requires = mb.nodes[i].requires_channels;
        if !sides[i].outgoing.is_empty()
            && !cross_match_side(mb, provides, &sides[i].outgoing, false, &mut edges_matched)?
        {
            unsatisfied.push(Unsatisfied {
                name: mb.nodes[i].name.clone(),
                side: Side::Output,
                required: provides,
            });
        }
        if !sides[i].incoming.is_empty()
            && !cross_match_side(mb, requires, &sides[i].incoming, true, &mut edges_matched)?
        {
            unsatisfied.push(Unsatisfied {
                name: mb.nodes[i].name.clone(),
                side: Side::Input,
                required: requires,
            });
        }
    }
    debug!(
        "cross matched {} of {} nodes, {} of {} edges",
        mb.nodes.len() - unsatisfied.len(),
        mb.nodes.len(),
        edges_matched / 2,
        mb.edges.len()
    );
    if edges_matched as usize / 2 == mb.edges.len() && unsatisfied.is_empty() {
        Ok(None)
    } else {
        Ok(Some(unsatisfied))
    }
}

/// Compact each node's edge references into owned solution records.
fn prepare_solution(mb: &mut MessageBlock, sides: &[NodeEdgeRefs]) {
    let mut solution = Vec::with_capacity(mb.nodes.len());
    for (i, refs) in sides.iter().enumerate() {
        solution.push(NodeConnections {
            node_index: i as i32,
            incoming: refs.incoming.iter().map(|&ei| mb.edges[ei]).collect(),
            outgoing: refs.outgoing.iter().map(|&ei| mb.edges[ei]).collect(),
        });
    }
    mb.solution = Some(solution);
}

/// Fix every concentrator's total input and output descriptor counts by
/// summing solved instances at its endpoints, iterating until directly
/// attached concentrators resolve too.
fn calculate_conc_fds(mb: &mut MessageBlock) -> Result<(), SolverError> {
    let n_concs = mb.concs.len();
    if n_concs == 0 {
        return Ok(());
    }
    let mut calculated = 0;
    let mut retries = 0;
    loop {
        for i in 0..n_concs {
            let (endpoint_pid, proc_pids, multiple_inputs, done) = {
                let c = &mb.concs[i];
                (
                    c.endpoint_pid,
                    c.proc_pids.clone(),
                    c.multiple_inputs,
                    c.input_fds >= 0 && c.output_fds >= 0,
                )
            };
            if done {
                continue;
            }

            let mut input_fds = 0;
            let mut output_fds = 0;
            if multiple_inputs {
                output_fds = mb.expected_fds(endpoint_pid);
            } else {
                input_fds = mb.provided_fds(endpoint_pid);
            }
            for pid in proc_pids {
                let fds = if multiple_inputs {
                    mb.provided_fds(pid)
                } else {
                    mb.expected_fds(pid)
                };
                if mb.find_conc(pid).is_some() && fds == -1 {
                    input_fds = -1;
                    output_fds = -1;
                    break;
                } else if multiple_inputs {
                    input_fds += fds;
                } else {
                    output_fds += fds;
                }
            }
            // Use what the multi-descriptor end tells us when the
            // single end is itself an unresolved concentrator.
            if multiple_inputs && input_fds >= 0 && output_fds == -1 {
                output_fds = input_fds;
            } else if !multiple_inputs && output_fds >= 0 && input_fds == -1 {
                input_fds = output_fds;
            }

            if input_fds >= 0 && output_fds >= 0 {
                debug_assert_eq!(input_fds, output_fds);
                calculated += 1;
            }
            let c = &mut mb.concs[i];
            c.input_fds = input_fds;
            c.output_fds = output_fds;
            debug!(
                "conc {} now has {} input and {} output fds",
                c.pid, c.input_fds, c.output_fds
            );
        }
        if calculated != n_concs && retries < n_concs {
            retries += 1;
            continue;
        }
        break;
    }
    if retries == n_concs {
        return Err(SolverError::ConcFds);
    }
    Ok(())
}

/// Strip any path from a tool name's command word and escape double
/// quotes for use as a DOT label.
fn display_name(name: &str) -> String {
    let (head, rest) = match name.find(' ') {
        Some(i) => (&name[..i], &name[i..]),
        None => (name, ""),
    };
    let head = head.rsplit('/').next().unwrap_or(head);
    format!("{head}{rest}").replace('"', "\\\"")
}

/// Append the solved graph to `<base>.dot` (active edge instances only)
/// and every candidate edge to `<base>-ngt.dot`.
fn output_graph(mb: &MessageBlock, base: &str) -> std::io::Result<()> {
    let solution = mb.solution.as_ref().expect("drawing an unsolved graph");
    let mut solved = OpenOptions::new()
        .append(true)
        .create(true)
        .open(format!("{base}.dot"))?;
    let mut negotiated = OpenOptions::new()
        .append(true)
        .create(true)
        .open(format!("{base}-ngt.dot"))?;

    writeln!(solved, "digraph {{")?;
    writeln!(negotiated, "digraph {{")?;
    for node in &mb.nodes {
        let label = display_name(&node.name);
        writeln!(solved, "\tn{} [label=\"{}\"];", node.index, label)?;
        writeln!(negotiated, "\tn{} [label=\"{}\"];", node.index, label)?;
        for edge in &solution[node.index as usize].outgoing {
            writeln!(negotiated, "\tn{} -> n{};", node.index, edge.to)?;
            if edge.instances == 0 {
                continue;
            }
            writeln!(solved, "\tn{} -> n{};", node.index, edge.to)?;
        }
    }
    writeln!(solved, "}}")?;
    writeln!(negotiated, "}}")?;
    Ok(())
}

/// Solve the I/O constraint problem recorded in `mb`.
///
/// On success the block carries a solution (dropped again for
/// [`SolveOutcome::DrawExit`]) and every concentrator's descriptor
/// counts are fixed. On failure the block is left without a solution
/// and the caller is expected to circulate ERROR.
pub fn solve(mb: &mut MessageBlock, opts: &SolveOptions) -> Result<SolveOutcome, SolverError> {
    let sides = node_match_constraints(mb);

    let mut retries = 0;
    loop {
        match cross_match_constraints(mb, &sides)? {
            None => break,
            Some(unsatisfied) => {
                if retries > CROSS_MATCH_RETRIES {
                    return Err(SolverError::Unsatisfied(unsatisfied));
                }
                retries += 1;
            }
        }
    }

    prepare_solution(mb, &sides);
    if let Err(e) = calculate_conc_fds(mb) {
        mb.solution = None;
        return Err(e);
    }

    if let Some(base) = &opts.dot_draw {
        if let Err(e) = output_graph(mb, base) {
            mb.solution = None;
            return Err(SolverError::Draw(e));
        }
    }
    if opts.draw_exit {
        debug!("documented the solution; asking the graph to exit");
        mb.solution = None;
        return Ok(SolveOutcome::DrawExit);
    }
    Ok(SolveOutcome::Run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Node};

    fn node(pid: i32, requires: i32, provides: i32) -> Node {
        Node {
            pid,
            index: -1,
            name: format!("tool{pid}"),
            requires_channels: requires,
            provides_channels: provides,
            dgsh_in: requires != 0,
            dgsh_out: provides != 0,
        }
    }

    fn edge(from: i32, to: i32) -> Edge {
        Edge {
            from,
            to,
            instances: 0,
            from_instances: 0,
            to_instances: 0,
        }
    }

    fn chain(constraints: &[(i32, i32)]) -> MessageBlock {
        let mut mb = MessageBlock::new(100);
        for (i, (requires, provides)) in constraints.iter().enumerate() {
            mb.add_node(node(100 + i as i32, *requires, *provides));
        }
        for i in 0..constraints.len() as i32 - 1 {
            mb.add_edge(edge(i, i + 1));
        }
        mb
    }

    #[test]
    fn dry_match_spreads_fixed_constraints() {
        // One producer of 5 channels feeding three consumers.
        let mut mb = MessageBlock::new(100);
        mb.add_node(node(100, 0, 5));
        mb.add_node(node(101, -1, 0));
        mb.add_node(node(102, -1, 0));
        mb.add_node(node(103, -1, 0));
        mb.add_edge(edge(0, 1));
        mb.add_edge(edge(0, 2));
        mb.add_edge(edge(0, 3));
        node_match_constraints(&mut mb);
        let spread: Vec<i32> = mb.edges.iter().map(|e| e.from_instances).collect();
        assert_eq!(spread, vec![2, 2, 1]);
        assert!(mb.edges.iter().all(|e| e.to_instances == -1));
    }

    #[test]
    fn dry_match_is_idempotent() {
        let mut mb = chain(&[(0, 2), (2, -1), (-1, 0)]);
        node_match_constraints(&mut mb);
        let first: Vec<_> = mb.edges.clone();
        node_match_constraints(&mut mb);
        assert_eq!(first, mb.edges);
    }

    #[test]
    fn linear_chain_solves_to_single_instances() {
        let mut mb = chain(&[(0, 1), (1, 1), (1, 0)]);
        let outcome = solve(&mut mb, &SolveOptions::default()).unwrap();
        assert_eq!(outcome, SolveOutcome::Run);
        for e in &mb.edges {
            assert_eq!(e.instances, 1);
            assert_eq!(e.from_instances, e.to_instances);
        }
        let solution = mb.solution.as_ref().unwrap();
        assert_eq!(solution[1].incoming.len(), 1);
        assert_eq!(solution[1].outgoing.len(), 1);
    }

    #[test]
    fn flexible_sink_absorbs_fixed_fan_out() {
        // Producer insists on three channels; sink is flexible.
        let mut mb = chain(&[(0, 3), (-1, 0)]);
        solve(&mut mb, &SolveOptions::default()).unwrap();
        assert_eq!(mb.edges[0].instances, 3);
    }

    #[test]
    fn fixed_pair_mismatch_is_unsatisfiable() {
        // Sink demands two channels, producer provides exactly one and
        // has nowhere else to send.
        let mut mb = chain(&[(0, 1), (2, 0)]);
        match solve(&mut mb, &SolveOptions::default()) {
            Err(SolverError::Unsatisfied(nodes)) => {
                assert!(!nodes.is_empty());
                let text = SolverError::Unsatisfied(nodes).to_string();
                assert!(text.contains("nin=2") || text.contains("nout=1"), "{text}");
            }
            other => panic!("expected unsatisfied constraints, got {other:?}"),
        }
        assert!(mb.solution.is_none());
    }

    #[test]
    fn flexible_report_prints_flex() {
        let err = SolverError::Unsatisfied(vec![Unsatisfied {
            name: "comm".into(),
            side: Side::Input,
            required: -1,
        }]);
        assert!(err.to_string().contains("(nin=flex)"));
    }

    #[test]
    fn conc_fd_counts_reach_fixpoint() {
        // Three sources through a gathering conc into one consumer that
        // takes three channels.
        let mut mb = MessageBlock::new(100);
        mb.add_node(node(100, 0, 1));
        mb.add_node(node(101, 0, 1));
        mb.add_node(node(102, 0, 1));
        mb.add_node(node(103, 3, 0));
        mb.add_edge(edge(0, 3));
        mb.add_edge(edge(1, 3));
        mb.add_edge(edge(2, 3));
        mb.concs.push(crate::graph::ConcInfo {
            pid: 900,
            input_fds: -1,
            output_fds: -1,
            proc_pids: vec![100, 101, 102],
            endpoint_pid: 103,
            multiple_inputs: true,
        });
        solve(&mut mb, &SolveOptions::default()).unwrap();
        let conc = mb.find_conc(900).unwrap();
        assert_eq!(conc.input_fds, 3);
        assert_eq!(conc.output_fds, 3);
    }

    #[test]
    fn dot_labels_lose_paths_and_escape_quotes() {
        assert_eq!(display_name("/usr/bin/comm -z"), "comm -z");
        assert_eq!(display_name("grep \"a b\""), "grep \\\"a b\\\"");
        assert_eq!(display_name("tee"), "tee");
    }
}
