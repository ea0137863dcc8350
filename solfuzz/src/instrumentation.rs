//! This module provides AFL-style coverage for EVM execution.
//!
//! Instead of rewriting the bytecode under test, coverage is collected by a
//! `revm` inspector that observes every interpreter step:
//! 1.  Each step is mapped to a location derived from the program counter and
//!     the opcode being executed.
//! 2.  The edge between the previous and the current location is counted in a
//!     private hit-count map.
//! 3.  After an iteration the orchestrator copies that map into the process-wide
//!     [`COVERAGE_MAP`] observed by `libafl`, and the private map is cleared.

use revm::interpreter::Interpreter;
use revm::{Database, EvmContext, Inspector};

use crate::constants::EVM_COVERAGE_MAP_SIZE;

/// The coverage map shared with the `libafl` map observer.
///
/// # Safety
///
/// This is a mutable static memory region, which is inherently `unsafe`.
/// It is only written from the harness thread between executions and read by
/// the observer after each execution, which is the contract `libafl`'s
/// in-process executor relies on.
pub static mut COVERAGE_MAP: [u8; EVM_COVERAGE_MAP_SIZE] = [0; EVM_COVERAGE_MAP_SIZE];

/// Returns the process-wide coverage map for the `libafl` observer.
///
/// # Safety
///
/// The caller must not hold another reference to the map while the returned
/// slice is alive, except through the observer created from it.
pub unsafe fn coverage_map() -> &'static mut [u8] {
    unsafe { &mut *(&raw mut COVERAGE_MAP) }
}

/// Records AFL-style edge hit counts for every executed EVM instruction.
#[derive(Debug, Clone)]
pub struct CoverageInspector {
    map: Vec<u8>,
    prev_location: usize,
}

impl Default for CoverageInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageInspector {
    pub fn new() -> Self {
        Self {
            map: vec![0; EVM_COVERAGE_MAP_SIZE],
            prev_location: 0,
        }
    }

    /// Counts the edge from the previous location into the one at `pc` executing `opcode`.
    ///
    /// ```text
    ///   curr_location = hash(pc, opcode) % MAP_SIZE;
    ///   map[curr_location ^ prev_location]++;
    ///   prev_location = curr_location >> 1;
    /// ```
    pub fn record(&mut self, pc: usize, opcode: u8) {
        let curr_location = location(pc, opcode);
        let slot = &mut self.map[curr_location ^ self.prev_location];
        *slot = slot.wrapping_add(1);
        self.prev_location = curr_location >> 1;
    }

    pub fn map(&self) -> &[u8] {
        &self.map
    }

    /// Number of distinct edges hit since the last reset.
    pub fn edges(&self) -> usize {
        self.map.iter().filter(|&&hits| hits != 0).count()
    }

    /// Copies the collected hit counts into `target` and starts a fresh trace.
    pub fn flush_into(&mut self, target: &mut [u8]) {
        assert_eq!(
            target.len(),
            self.map.len(),
            "Coverage map size mismatch"
        );
        target.copy_from_slice(&self.map);
        self.reset();
    }

    pub fn reset(&mut self) {
        self.map.fill(0);
        self.prev_location = 0;
    }
}

impl<DB: Database> Inspector<DB> for CoverageInspector {
    fn step(&mut self, interp: &mut Interpreter, _context: &mut EvmContext<DB>) {
        self.record(interp.program_counter(), interp.current_opcode());
    }
}

fn location(pc: usize, opcode: u8) -> usize {
    // Fibonacci hashing spreads neighbouring program counters over the map.
    let mixed = (pc as u64 ^ ((opcode as u64) << 32)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed >> 48) as usize % EVM_COVERAGE_MAP_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_counts_edges_not_locations() {
        let mut inspector = CoverageInspector::new();
        inspector.record(0, 0x60);
        inspector.record(2, 0x60);
        inspector.record(0, 0x60);
        inspector.record(2, 0x60);

        let total: usize = inspector.map().iter().map(|&h| h as usize).sum();
        assert_eq!(total, 4);
        // The 0 -> 2 edge is taken twice, so at most three distinct edges exist.
        assert!(inspector.edges() <= 3);
    }

    #[test]
    fn flush_moves_the_trace_and_resets() {
        let mut inspector = CoverageInspector::new();
        inspector.record(7, 0x01);
        let mut target = vec![0u8; EVM_COVERAGE_MAP_SIZE];
        inspector.flush_into(&mut target);

        assert_eq!(target.iter().filter(|&&h| h != 0).count(), 1);
        assert_eq!(inspector.edges(), 0);
    }

    #[test]
    fn locations_stay_inside_the_map() {
        for pc in [0usize, 1, 255, 24_576, usize::MAX] {
            for opcode in [0x00u8, 0x5b, 0xff] {
                assert!(location(pc, opcode) < EVM_COVERAGE_MAP_SIZE);
            }
        }
    }
}
