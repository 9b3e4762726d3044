use std::collections::{BTreeMap, VecDeque};

use crate::monitor::Monitor;

/// Ports of a synchronizer node. The aggregation uses the four cardinal
/// ports; the diagonals are wired for the quadrant exchange of the wider
/// design and stay silent here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    N,
    S,
    E,
    W,
    NE,
    NW,
    SE,
    SW,
}

pub const SYNC_DIRECTIONS: [SyncDirection; 8] = [
    SyncDirection::N,
    SyncDirection::S,
    SyncDirection::E,
    SyncDirection::W,
    SyncDirection::NE,
    SyncDirection::NW,
    SyncDirection::SE,
    SyncDirection::SW,
];

impl SyncDirection {
    pub fn index(self) -> usize {
        match self {
            SyncDirection::N => 0,
            SyncDirection::S => 1,
            SyncDirection::E => 2,
            SyncDirection::W => 3,
            SyncDirection::NE => 4,
            SyncDirection::NW => 5,
            SyncDirection::SE => 6,
            SyncDirection::SW => 7,
        }
    }

    pub fn opposite(self) -> SyncDirection {
        match self {
            SyncDirection::N => SyncDirection::S,
            SyncDirection::S => SyncDirection::N,
            SyncDirection::E => SyncDirection::W,
            SyncDirection::W => SyncDirection::E,
            SyncDirection::NE => SyncDirection::SW,
            SyncDirection::SW => SyncDirection::NE,
            SyncDirection::NW => SyncDirection::SE,
            SyncDirection::SE => SyncDirection::NW,
        }
    }

    pub fn delta(self) -> (i32, i32) {
        match self {
            SyncDirection::N => (0, -1),
            SyncDirection::S => (0, 1),
            SyncDirection::E => (1, 0),
            SyncDirection::W => (-1, 0),
            SyncDirection::NE => (1, -1),
            SyncDirection::NW => (-1, -1),
            SyncDirection::SE => (1, 1),
            SyncDirection::SW => (-1, 1),
        }
    }
}

/// A partial reduction: how many events it covers and their minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncAgg {
    pub count: u32,
    pub min: Option<u64>,
}

impl SyncAgg {
    fn combine(self, other: SyncAgg) -> SyncAgg {
        let min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        };
        SyncAgg { count: self.count + other.count, min }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMsg {
    /// Cumulative column aggregate from the sending side.
    Col { ident: u32, agg: SyncAgg },
    /// Cumulative column-summary aggregate along the row (count is columns).
    Row { ident: u32, agg: SyncAgg },
    /// Global result, forwarded north from (0, 0) to the host.
    Done { ident: u32, agg: SyncAgg },
}

#[derive(Debug, Default)]
struct SyncState {
    contributed: bool,
    value: Option<u64>,
    from_n: SyncAgg,
    from_s: SyncAgg,
    from_e: SyncAgg,
    from_w: SyncAgg,
    col_complete: bool,
    col_min: Option<u64>,
    complete: bool,
    global_min: Option<u64>,
    /// Last aggregate sent per cardinal direction, to suppress resends.
    sent: [Option<SyncAgg>; 4],
    done_sent: bool,
    completion_recorded: bool,
}

/// One node of the lamlet-wide barrier network.
///
/// Grid nodes sit at kamlet coordinates; the host hangs off at (0, -1) and
/// is treated as the northernmost member of column 0. Aggregation runs as a
/// column reduction (events flow N/S), then a row reduction of column
/// summaries (E/W); node (0, 0) forwards the global result north.
pub struct Synchronizer {
    pub x: i32,
    pub y: i32,
    k_cols: usize,
    k_rows: usize,
    states: BTreeMap<u32, SyncState>,
    inboxes: [VecDeque<SyncMsg>; 8],
    outboxes: [VecDeque<SyncMsg>; 8],
}

impl Synchronizer {
    pub fn new(k_cols: usize, k_rows: usize, x: i32, y: i32) -> Self {
        Synchronizer {
            x,
            y,
            k_cols,
            k_rows,
            states: BTreeMap::new(),
            inboxes: Default::default(),
            outboxes: Default::default(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.y < 0
    }

    fn col_expected(&self) -> u32 {
        // The host contributes into column 0.
        self.k_rows as u32 + if self.x == 0 { 1 } else { 0 }
    }

    /// Contribute this node's event for a barrier. `value` feeds the min
    /// reduction; `None` leaves the min untouched.
    pub fn local_event(&mut self, cycle: u64, ident: u32, value: Option<u64>, monitor: &mut Monitor) {
        monitor.record_sync_local_event(cycle, ident, (self.x, self.y), value);
        let state = self.states.entry(ident).or_default();
        assert!(!state.contributed, "double local_event for sync ident {ident}");
        state.contributed = true;
        state.value = value;
    }

    pub fn is_complete(&self, ident: u32) -> bool {
        self.states.get(&ident).map(|s| s.complete).unwrap_or(false)
    }

    pub fn get_min_value(&self, ident: u32) -> Option<u64> {
        let state = self.states.get(&ident).expect("min of unknown sync ident");
        assert!(state.complete, "min read before barrier completion");
        state.global_min
    }

    pub fn has_output(&self, direction: SyncDirection) -> bool {
        !self.outboxes[direction.index()].is_empty()
    }

    pub fn get_output(&mut self, direction: SyncDirection) -> Option<SyncMsg> {
        self.outboxes[direction.index()].pop_front()
    }

    pub fn can_receive(&self, direction: SyncDirection) -> bool {
        self.inboxes[direction.index()].len() < 2
    }

    pub fn receive(&mut self, direction: SyncDirection, msg: SyncMsg) {
        assert!(self.can_receive(direction));
        self.inboxes[direction.index()].push_back(msg);
    }

    pub fn update(&mut self) {}

    /// Absorb incoming aggregates and emit any that changed.
    pub fn step(&mut self, cycle: u64, monitor: &mut Monitor) {
        for direction in SYNC_DIRECTIONS {
            while let Some(msg) = self.inboxes[direction.index()].pop_front() {
                self.absorb(direction, msg);
            }
        }
        let idents: Vec<u32> = self.states.keys().copied().collect();
        for ident in idents {
            self.evaluate(cycle, ident, monitor);
        }
    }

    fn absorb(&mut self, direction: SyncDirection, msg: SyncMsg) {
        match msg {
            SyncMsg::Col { ident, agg } => {
                let state = self.states.entry(ident).or_default();
                match direction {
                    SyncDirection::N => state.from_n = agg,
                    SyncDirection::S => state.from_s = agg,
                    other => panic!("column aggregate arriving from {other:?}"),
                }
            }
            SyncMsg::Row { ident, agg } => {
                let state = self.states.entry(ident).or_default();
                match direction {
                    SyncDirection::E => state.from_e = agg,
                    SyncDirection::W => state.from_w = agg,
                    other => panic!("row aggregate arriving from {other:?}"),
                }
            }
            SyncMsg::Done { ident, agg } => {
                assert!(self.is_host(), "Done at a grid node");
                let state = self.states.entry(ident).or_default();
                state.complete = true;
                state.global_min = agg.min;
            }
        }
    }

    fn send_if_changed(
        &mut self,
        ident: u32,
        direction: SyncDirection,
        agg: SyncAgg,
        make: fn(u32, SyncAgg) -> SyncMsg,
    ) {
        let state = self.states.get_mut(&ident).unwrap();
        let slot = &mut state.sent[direction.index()];
        if agg.count > 0 && *slot != Some(agg) {
            *slot = Some(agg);
            self.outboxes[direction.index()].push_back(make(ident, agg));
        }
    }

    fn evaluate(&mut self, cycle: u64, ident: u32, monitor: &mut Monitor) {
        let own = {
            let state = self.states.get(&ident).unwrap();
            if state.contributed {
                SyncAgg { count: 1, min: state.value }
            } else {
                SyncAgg::default()
            }
        };

        if self.is_host() {
            // The host only feeds its event into column 0.
            self.send_if_changed(ident, SyncDirection::S, own, |i, a| SyncMsg::Col {
                ident: i,
                agg: a,
            });
            return;
        }

        // Column pass.
        let (from_n, from_s) = {
            let state = self.states.get(&ident).unwrap();
            (state.from_n, state.from_s)
        };
        if self.y + 1 < self.k_rows as i32 {
            self.send_if_changed(ident, SyncDirection::S, own.combine(from_n), |i, a| {
                SyncMsg::Col { ident: i, agg: a }
            });
        }
        if self.y > 0 {
            self.send_if_changed(ident, SyncDirection::N, own.combine(from_s), |i, a| {
                SyncMsg::Col { ident: i, agg: a }
            });
        }
        let col_total = own.combine(from_n).combine(from_s);
        let col_expected = self.col_expected();
        {
            let state = self.states.get_mut(&ident).unwrap();
            assert!(col_total.count <= col_expected, "column overcounted for ident {ident}");
            if col_total.count == col_expected {
                state.col_complete = true;
                state.col_min = col_total.min;
            }
        }

        // Row pass over completed columns.
        let (col_complete, col_min, from_e, from_w) = {
            let state = self.states.get(&ident).unwrap();
            (state.col_complete, state.col_min, state.from_e, state.from_w)
        };
        if !col_complete {
            return;
        }
        let own_col = SyncAgg { count: 1, min: col_min };
        if self.x + 1 < self.k_cols as i32 {
            self.send_if_changed(ident, SyncDirection::E, own_col.combine(from_w), |i, a| {
                SyncMsg::Row { ident: i, agg: a }
            });
        }
        if self.x > 0 {
            self.send_if_changed(ident, SyncDirection::W, own_col.combine(from_e), |i, a| {
                SyncMsg::Row { ident: i, agg: a }
            });
        }
        let row_total = own_col.combine(from_e).combine(from_w);
        if row_total.count == self.k_cols as u32 {
            let state = self.states.get_mut(&ident).unwrap();
            state.complete = true;
            state.global_min = row_total.min;
            let first_completion = !state.completion_recorded;
            state.completion_recorded = true;
            let global_min = state.global_min;
            let send_done = self.x == 0 && self.y == 0 && !state.done_sent;
            if send_done {
                state.done_sent = true;
            }
            if first_completion {
                monitor.record_sync_local_complete(cycle, ident, (self.x, self.y), global_min);
            }
            if send_done {
                self.outboxes[SyncDirection::N.index()]
                    .push_back(SyncMsg::Done { ident, agg: row_total });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A wired grid of synchronizers plus the host at (0, -1).
    struct SyncNetwork {
        nodes: HashMap<(i32, i32), Synchronizer>,
        coords: Vec<(i32, i32)>,
        monitor: Monitor,
        cycle: u64,
    }

    impl SyncNetwork {
        fn new(cols: usize, rows: usize) -> Self {
            let mut nodes = HashMap::new();
            let mut coords = Vec::new();
            for y in 0..rows as i32 {
                for x in 0..cols as i32 {
                    nodes.insert((x, y), Synchronizer::new(cols, rows, x, y));
                    coords.push((x, y));
                }
            }
            nodes.insert((0, -1), Synchronizer::new(cols, rows, 0, -1));
            coords.push((0, -1));
            SyncNetwork { nodes, coords, monitor: Monitor::new(), cycle: 0 }
        }

        fn event(&mut self, at: (i32, i32), ident: u32, value: Option<u64>) {
            let cycle = self.cycle;
            self.nodes
                .get_mut(&at)
                .unwrap()
                .local_event(cycle, ident, value, &mut self.monitor);
        }

        fn step(&mut self) {
            // Transfer one message per directed link.
            let coords = self.coords.clone();
            for &(x, y) in &coords {
                for direction in SYNC_DIRECTIONS {
                    let (dx, dy) = direction.delta();
                    let neighbor = (x + dx, y + dy);
                    if !self.nodes.contains_key(&neighbor) {
                        continue;
                    }
                    let opposite = direction.opposite();
                    if !self.nodes[&neighbor].can_receive(opposite) {
                        continue;
                    }
                    let msg = self.nodes.get_mut(&(x, y)).unwrap().get_output(direction);
                    if let Some(msg) = msg {
                        self.nodes.get_mut(&neighbor).unwrap().receive(opposite, msg);
                    }
                }
            }
            let cycle = self.cycle;
            for &coord in &coords {
                let node = self.nodes.get_mut(&coord).unwrap();
                node.step(cycle, &mut self.monitor);
            }
            self.cycle += 1;
        }

        fn all_complete(&self, ident: u32) -> bool {
            self.nodes.values().all(|n| n.is_complete(ident))
        }
    }

    #[test]
    fn test_barrier_completes_everywhere() {
        let mut net = SyncNetwork::new(2, 2);
        for coord in [(0, 0), (1, 0), (0, 1), (1, 1), (0, -1)] {
            net.event(coord, 5, None);
        }
        let bound = (2 + 2) * 5 + 10;
        for _ in 0..bound {
            net.step();
        }
        assert!(net.all_complete(5));
        assert_eq!(net.nodes[&(0, -1)].get_min_value(5), None);
    }

    #[test]
    fn test_barrier_waits_for_last_contributor() {
        let mut net = SyncNetwork::new(2, 2);
        for coord in [(0, 0), (1, 0), (0, 1), (0, -1)] {
            net.event(coord, 1, None);
        }
        for _ in 0..40 {
            net.step();
        }
        assert!(!net.all_complete(1));
        net.event((1, 1), 1, None);
        for _ in 0..(2 + 2) * 5 + 10 {
            net.step();
        }
        assert!(net.all_complete(1));
    }

    #[test]
    fn test_min_aggregation_across_barriers() {
        // Three concurrent barriers: mixed values, all-same values, and no
        // values at all.
        let mut net = SyncNetwork::new(2, 2);
        let values_a = [(0, 0, Some(17)), (1, 0, Some(3)), (0, 1, Some(9)), (1, 1, Some(42))];
        for (x, y, v) in values_a {
            net.event((x, y), 10, v);
        }
        net.event((0, -1), 10, None);
        for coord in [(0, 0), (1, 0), (0, 1), (1, 1), (0, -1)] {
            net.event(coord, 11, Some(1000));
        }
        for coord in [(0, 0), (1, 0), (0, 1), (1, 1), (0, -1)] {
            net.event(coord, 12, None);
        }
        for _ in 0..(2 + 2) * 5 + 10 {
            net.step();
        }
        for ident in [10, 11, 12] {
            assert!(net.all_complete(ident));
        }
        assert_eq!(net.nodes[&(0, -1)].get_min_value(10), Some(3));
        assert_eq!(net.nodes[&(1, 1)].get_min_value(10), Some(3));
        assert_eq!(net.nodes[&(0, -1)].get_min_value(11), Some(1000));
        assert_eq!(net.nodes[&(0, -1)].get_min_value(12), None);
    }

    #[test]
    fn test_single_column_grid() {
        // The scenario geometry: one column of two kamlets plus the host.
        let mut net = SyncNetwork::new(1, 2);
        net.event((0, 0), 2, Some(7));
        net.event((0, 1), 2, Some(4));
        net.event((0, -1), 2, None);
        for _ in 0..(1 + 2) * 5 + 10 {
            net.step();
        }
        assert!(net.all_complete(2));
        assert_eq!(net.nodes[&(0, -1)].get_min_value(2), Some(4));
    }

    #[test]
    fn test_wide_grid_liveness_bound() {
        let (cols, rows) = (4, 3);
        let mut net = SyncNetwork::new(cols, rows);
        for y in 0..rows as i32 {
            for x in 0..cols as i32 {
                net.event((x, y), 9, Some((x + y) as u64));
            }
        }
        // All grid events fired; the host is the last contributor.
        for _ in 0..5 {
            net.step();
        }
        net.event((0, -1), 9, None);
        for _ in 0..(cols + rows) * 5 + 10 {
            net.step();
        }
        assert!(net.all_complete(9));
        assert_eq!(net.nodes[&(0, -1)].get_min_value(9), Some(0));
    }
}
