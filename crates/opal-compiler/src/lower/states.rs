//! State Numbering
//!
//! Assigns the resumption cursor values. Encoding follows the classic
//! state-machine convention: -1 is the not-started (and transient
//! running) value, -2 is the single closed sentinel shared by normal
//! completion and faulting, suspension points count up from 0 in pass
//! order, and suspension points inside a cleanup clause count down from
//! -3 so a resume-during-unwind is distinguishable from a normal resume.

use super::regions::RegionTree;
use crate::ir::{BasicBlockId, IrFunction, Place, SuspendId};
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Cursor value of a frame that has not started (and of one mid-call)
pub const STATE_NOT_STARTED: i32 = -1;
/// Transient running value; never persisted across a suspension
pub const STATE_RUNNING: i32 = STATE_NOT_STARTED;
/// Terminal sentinel: completed or faulted, never resumable
pub const STATE_CLOSED: i32 = -2;
/// First cleanup-resume state; later ones count downward
pub const STATE_FIRST_CLEANUP: i32 = -3;

/// One numbered suspension point
#[derive(Debug, Clone, Serialize)]
pub struct StateEntry {
    pub state: i32,
    pub point: SuspendId,
    /// Block whose terminator is the suspension
    pub block: BasicBlockId,
    /// Block execution continues at when resumed in this state
    pub resume: BasicBlockId,
    /// Where the resumption input lands, if the point awaits a value
    pub result: Option<Place>,
    /// Whether this state resumes inside a cleanup clause
    pub in_cleanup: bool,
}

/// The numbered states of one function
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateTable {
    pub entries: Vec<StateEntry>,
    #[serde(skip)]
    by_point: FxHashMap<SuspendId, i32>,
}

impl StateTable {
    /// The cursor value assigned to a suspension point
    pub fn state_of(&self, point: SuspendId) -> Option<i32> {
        self.by_point.get(&point).copied()
    }

    /// Number of suspension states (normal and cleanup)
    pub fn state_count(&self) -> usize {
        self.entries.len()
    }
}

/// Number every suspension point of a function
pub fn number(func: &IrFunction, tree: &RegionTree) -> StateTable {
    let mut table = StateTable::default();
    let mut next_normal: i32 = 0;
    let mut next_cleanup: i32 = STATE_FIRST_CLEANUP;

    for point in func.suspend_points() {
        let in_cleanup = tree.in_cleanup(point.block);
        let state = if in_cleanup {
            let s = next_cleanup;
            next_cleanup -= 1;
            s
        } else {
            let s = next_normal;
            next_normal += 1;
            s
        };
        table.by_point.insert(point.point, state);
        table.entries.push(StateEntry {
            state,
            point: point.point,
            block: point.block,
            resume: point.resume,
            result: point.result,
            in_cleanup,
        });
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Operand, SuspendKind};
    use crate::lower::regions::RegionTree;

    #[test]
    fn test_sequential_points_count_up_from_zero() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        b.yield_value(Operand::int(1));
        b.yield_value(Operand::int(2));
        b.yield_value(Operand::int(3));
        let func = b.finish();

        let tree = RegionTree::build(&func).unwrap();
        let table = number(&func, &tree);
        let states: Vec<i32> = table.entries.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![0, 1, 2]);
    }

    #[test]
    fn test_cleanup_points_count_down_from_first_cleanup() {
        let mut b = FunctionBuilder::new("g", SuspendKind::Generator);
        b.begin_try();
        b.yield_value(Operand::int(1));
        b.begin_finally();
        b.yield_value(Operand::int(2));
        b.end_try();
        let func = b.finish();

        let tree = RegionTree::build(&func).unwrap();
        let table = number(&func, &tree);
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.entries[0].state, 0);
        assert!(!table.entries[0].in_cleanup);
        assert_eq!(table.entries[1].state, STATE_FIRST_CLEANUP);
        assert!(table.entries[1].in_cleanup);
    }

    #[test]
    fn test_sentinels_are_distinct() {
        assert_eq!(STATE_NOT_STARTED, -1);
        assert_eq!(STATE_RUNNING, STATE_NOT_STARTED);
        assert_eq!(STATE_CLOSED, -2);
        assert!(STATE_FIRST_CLEANUP < STATE_CLOSED);
    }
}
