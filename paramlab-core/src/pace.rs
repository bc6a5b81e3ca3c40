//! Cooperative pacing for long evaluation loops.
//!
//! A sweep runs on one worker thread and must stay responsive to abort
//! requests and progress polls without a scheduler preempting it. The gate
//! divides work into batches: every `combo_batch` completed combinations the
//! caller runs its checkpoint (observe the cancel flag, publish progress,
//! beat the heartbeat), and every `bar_batch` processed bars the worker
//! yields its timeslice so co-resident jobs get CPU time.

/// Combinations between checkpoints.
pub const DEFAULT_COMBO_BATCH: u32 = 5;
/// Bars between thread yields inside a single evaluation.
pub const DEFAULT_BAR_BATCH: u32 = 500;

#[derive(Debug)]
pub struct YieldGate {
    combo_batch: u32,
    bar_batch: u32,
    combos_since: u32,
    bars_since: u32,
}

impl YieldGate {
    /// Batch sizes are clamped to at least 1.
    pub fn new(combo_batch: u32, bar_batch: u32) -> Self {
        Self {
            combo_batch: combo_batch.max(1),
            bar_batch: bar_batch.max(1),
            combos_since: 0,
            bars_since: 0,
        }
    }

    /// Record one finished combination. Returns true at a batch boundary,
    /// which is the caller's cue to run its checkpoint.
    pub fn tick_combination(&mut self) -> bool {
        self.combos_since += 1;
        if self.combos_since >= self.combo_batch {
            self.combos_since = 0;
            true
        } else {
            false
        }
    }

    /// Record one processed bar. Yields the thread at a batch boundary; no
    /// evaluation state is touched, the loop resumes exactly where it was.
    pub fn tick_bar(&mut self) {
        self.bars_since += 1;
        if self.bars_since >= self.bar_batch {
            self.bars_since = 0;
            std::thread::yield_now();
        }
    }

    pub fn combo_batch(&self) -> u32 {
        self.combo_batch
    }

    pub fn bar_batch(&self) -> u32 {
        self.bar_batch
    }
}

impl Default for YieldGate {
    fn default() -> Self {
        Self::new(DEFAULT_COMBO_BATCH, DEFAULT_BAR_BATCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_every_n_combinations() {
        let mut gate = YieldGate::new(5, 500);
        let mut checkpoints = 0;
        for _ in 0..23 {
            if gate.tick_combination() {
                checkpoints += 1;
            }
        }
        // boundaries after combos 5, 10, 15, 20
        assert_eq!(checkpoints, 4);
    }

    #[test]
    fn batch_of_one_checkpoints_every_time() {
        let mut gate = YieldGate::new(1, 1);
        assert!(gate.tick_combination());
        assert!(gate.tick_combination());
    }

    #[test]
    fn zero_batches_are_clamped() {
        let gate = YieldGate::new(0, 0);
        assert_eq!(gate.combo_batch(), 1);
        assert_eq!(gate.bar_batch(), 1);
    }

    #[test]
    fn bar_ticks_do_not_panic_across_boundaries() {
        let mut gate = YieldGate::new(5, 10);
        for _ in 0..35 {
            gate.tick_bar();
        }
    }

    #[test]
    fn default_matches_documented_batches() {
        let gate = YieldGate::default();
        assert_eq!(gate.combo_batch(), DEFAULT_COMBO_BATCH);
        assert_eq!(gate.bar_batch(), DEFAULT_BAR_BATCH);
    }
}
