//! Beam, histogram and peer-group pruning.
//!
//! Scores are watermarked while tokens are created. After propagation the
//! population is cut with the current beam, optionally followed by histogram
//! pruning. When histogram pruning had to bite the current beam is narrowed to
//! the cutoff it found, otherwise it grows back towards the configured beam.

use crate::config::PruningStrategy;
use crate::constants::pruning::{BEAM_GROWTH, MIN_BEAM, NUM_HISTOGRAM_BINS};
use crate::constants::search::{LOG_PROB_FLOOR, MAX_LEX_TREE_DEPTH, MAX_WORD_COUNT_SLOTS};
use crate::search::lexicon::NodeFlags;

const DEPTH_BUCKETS: usize = MAX_LEX_TREE_DEPTH / 2;

/// The parts of a token that pruning looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PruneCandidate {
    pub total_log_prob: f32,
    pub flags: NodeFlags,
    pub word_count: u32,
    pub depth: u32,
}

/// Per-frame score maxima.
#[derive(Debug, Clone)]
pub struct Watermarks {
    pub best: f32,
    pub best_word_end: f32,
    /// Lowest score seen, never above zero.
    pub worst: f32,
    pub fan_in: f32,
    pub fan_out: f32,
    word_count: Vec<f32>,
    depth: [f32; DEPTH_BUCKETS],
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            best: LOG_PROB_FLOOR,
            best_word_end: LOG_PROB_FLOOR,
            worst: 0.0,
            fan_in: LOG_PROB_FLOOR,
            fan_out: LOG_PROB_FLOOR,
            word_count: Vec::with_capacity(MAX_WORD_COUNT_SLOTS),
            depth: [LOG_PROB_FLOOR; DEPTH_BUCKETS],
        }
    }
}

fn depth_bucket(depth: u32) -> usize {
    (depth as usize / 2).min(DEPTH_BUCKETS - 1)
}

impl Watermarks {
    /// Start a new frame.
    pub fn reset(&mut self) {
        self.best = LOG_PROB_FLOOR;
        self.best_word_end = LOG_PROB_FLOOR;
        self.worst = 0.0;
        self.fan_in = LOG_PROB_FLOOR;
        self.fan_out = LOG_PROB_FLOOR;
        self.word_count.clear();
        self.depth = [LOG_PROB_FLOOR; DEPTH_BUCKETS];
    }

    /// Best score among tokens with `word_count` words outside fan nodes.
    pub fn best_for_word_count(&self, word_count: u32) -> f32 {
        self.word_count
            .get(word_count as usize)
            .copied()
            .unwrap_or(LOG_PROB_FLOOR)
    }

    /// Best score among tokens in the depth bucket of `depth`.
    pub fn best_for_depth(&self, depth: u32) -> f32 {
        self.depth[depth_bucket(depth)]
    }

    /// Account for a newly stored token.
    pub fn observe(&mut self, candidate: &PruneCandidate) {
        let total = candidate.total_log_prob;
        if candidate.flags.contains(NodeFlags::USE_WORD_END_BEAM) {
            self.best_word_end = self.best_word_end.max(total);
        }
        self.best = self.best.max(total);

        let fan = NodeFlags::FAN_IN | NodeFlags::FAN_OUT;
        if candidate.flags.contains(NodeFlags::FAN_IN) {
            self.fan_in = self.fan_in.max(total);
        }
        if candidate.flags.contains(NodeFlags::FAN_OUT) {
            self.fan_out = self.fan_out.max(total);
        }
        if !candidate.flags.intersects(fan) {
            let slot = candidate.word_count as usize;
            if self.word_count.len() <= slot {
                self.word_count.resize(slot + 1, LOG_PROB_FLOOR);
            }
            self.word_count[slot] = self.word_count[slot].max(total);
            if !candidate.flags.contains(NodeFlags::AFTER_WORD_ID) {
                let bucket = depth_bucket(candidate.depth);
                self.depth[bucket] = self.depth[bucket].max(total);
            }
        }

        self.worst = self.worst.min(total);
    }
}

impl PruningStrategy {
    /// True if the peer-group beam of this strategy rejects `candidate`.
    pub fn discards(&self, marks: &Watermarks, candidate: &PruneCandidate) -> bool {
        let total = candidate.total_log_prob;
        let flags = candidate.flags;
        match *self {
            PruningStrategy::Beam => false,
            PruningStrategy::FanIn { beam } => flags.contains(NodeFlags::FAN_IN) && total < marks.fan_in - beam,
            PruningStrategy::FanOut { beam } => flags.contains(NodeFlags::FAN_OUT) && total < marks.fan_out - beam,
            PruningStrategy::EqualWordCount { beam } => {
                !flags.intersects(NodeFlags::FAN_IN | NodeFlags::FAN_OUT)
                    && total < marks.best_for_word_count(candidate.word_count) - beam
            }
            PruningStrategy::EqualDepth { beam } => {
                !flags.intersects(NodeFlags::FAN_IN | NodeFlags::FAN_OUT | NodeFlags::AFTER_WORD_ID)
                    && total < marks.best_for_depth(candidate.depth) - beam
            }
        }
    }
}

/// Fixed-bin histogram of token scores over `[worst, best]`.
#[derive(Debug, Clone)]
pub struct ScoreHistogram {
    bins: [usize; NUM_HISTOGRAM_BINS],
    worst: f32,
    best: f32,
    bin_width: f32,
}

impl ScoreHistogram {
    pub fn new(worst: f32, best: f32) -> Self {
        Self {
            bins: [0; NUM_HISTOGRAM_BINS],
            worst,
            best,
            bin_width: (best - worst) / (NUM_HISTOGRAM_BINS - 1) as f32,
        }
    }

    pub fn add(&mut self, score: f32) {
        let bin = if self.bin_width > 0.0 {
            ((score - self.worst) / self.bin_width).floor().max(0.0) as usize
        } else {
            NUM_HISTOGRAM_BINS - 1
        };
        self.bins[bin.min(NUM_HISTOGRAM_BINS - 1)] += 1;
    }

    /// Lowest score to keep so that fewer than `max` of `count` tokens remain.
    ///
    /// The top bin is never cut, so the best token always survives.
    pub fn cutoff(&self, count: usize, max: usize) -> f32 {
        let mut remaining = count;
        let mut dropped = 0;
        while dropped < NUM_HISTOGRAM_BINS - 2 {
            remaining = remaining.saturating_sub(self.bins[dropped]);
            if remaining < max {
                break;
            }
            dropped += 1;
        }
        (self.worst + (dropped + 1) as f32 * self.bin_width).min(self.best)
    }
}

/// Outcome of one pruning pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PruneReport {
    pub kept: usize,
    pub pruned: usize,
    /// Histogram pruning cut the population.
    pub histogram_applied: bool,
}

/// Configured and current beam widths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamController {
    global: f32,
    word_end: f32,
    current_global: f32,
    current_word_end: f32,
}

impl BeamController {
    pub fn new(global: f32, word_end: f32) -> Self {
        Self {
            global,
            word_end,
            current_global: global,
            current_word_end: word_end,
        }
    }

    /// Restore the configured widths.
    pub fn reset(&mut self) {
        self.current_global = self.global;
        self.current_word_end = self.word_end;
    }

    pub fn current_global(&self) -> f32 {
        self.current_global
    }

    pub fn current_word_end(&self) -> f32 {
        self.current_word_end
    }

    pub fn global_limit(&self, marks: &Watermarks) -> f32 {
        marks.best - self.current_global
    }

    pub fn word_end_limit(&self, marks: &Watermarks) -> f32 {
        marks.best_word_end - self.current_word_end
    }

    /// Narrow the beam to `width`, never beyond the configured beam and
    /// never below [`MIN_BEAM`].
    pub fn shrink_to(&mut self, width: f32) {
        self.current_global = width.max(MIN_BEAM).min(self.global);
        self.rescale_word_end();
    }

    /// Grow the beam back after a frame without histogram pruning.
    pub fn relax(&mut self) {
        if self.current_global < self.global {
            self.current_global = (self.current_global * BEAM_GROWTH).min(self.global);
            self.rescale_word_end();
        }
    }

    fn rescale_word_end(&mut self) {
        self.current_word_end = self.current_global / self.global * self.word_end;
    }

    /// Decide which candidates survive the frame. `keep[i]` is set for
    /// every survivor; the beam is adapted for the next frame.
    pub fn prune(
        &mut self,
        candidates: &[PruneCandidate],
        marks: &Watermarks,
        strategy: &PruningStrategy,
        max_tokens: usize,
        keep: &mut Vec<bool>,
    ) -> PruneReport {
        let beam_limit = self.global_limit(marks);
        let survives = |c: &PruneCandidate| !(c.total_log_prob < beam_limit || strategy.discards(marks, c));
        keep.clear();

        if max_tokens > 0 && candidates.len() > max_tokens {
            let mut histogram = ScoreHistogram::new(marks.worst.max(beam_limit), marks.best);
            keep.extend(candidates.iter().map(|c| {
                let kept = survives(c);
                if kept {
                    histogram.add(c.total_log_prob);
                }
                kept
            }));
            let mut kept = keep.iter().filter(|&&k| k).count();
            let mut applied_cutoff = None;
            if kept > max_tokens {
                let cutoff = histogram.cutoff(kept, max_tokens);
                let before = kept;
                for (flag, c) in keep.iter_mut().zip(candidates) {
                    if *flag && c.total_log_prob < cutoff {
                        *flag = false;
                        kept -= 1;
                    }
                }
                if kept < before {
                    applied_cutoff = Some(cutoff);
                }
            }
            // Tied survivors leave nothing to cut, so the beam is not narrowed.
            match applied_cutoff {
                Some(cutoff) => self.shrink_to(marks.best - cutoff),
                None => self.relax(),
            }
            let histogram_applied = applied_cutoff.is_some();
            PruneReport {
                kept,
                pruned: candidates.len() - kept,
                histogram_applied,
            }
        } else {
            keep.extend(candidates.iter().map(survives));
            self.relax();
            let kept = keep.iter().filter(|&&k| k).count();
            PruneReport {
                kept,
                pruned: candidates.len() - kept,
                histogram_applied: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(total: f32) -> PruneCandidate {
        PruneCandidate {
            total_log_prob: total,
            flags: NodeFlags::NONE,
            word_count: 0,
            depth: 0,
        }
    }

    fn marks_for(candidates: &[PruneCandidate]) -> Watermarks {
        let mut marks = Watermarks::default();
        for c in candidates {
            marks.observe(c);
        }
        marks
    }

    #[test]
    fn test_watermarks_track_groups() {
        let mut marks = Watermarks::default();
        marks.observe(&PruneCandidate { flags: NodeFlags::FAN_IN, ..plain(-5.0) });
        marks.observe(&PruneCandidate { flags: NodeFlags::USE_WORD_END_BEAM, ..plain(-7.0) });
        marks.observe(&PruneCandidate { word_count: 3, depth: 9, ..plain(-2.0) });
        assert_eq!(marks.best, -2.0);
        assert_eq!(marks.best_word_end, -7.0);
        assert_eq!(marks.worst, -7.0);
        assert_eq!(marks.fan_in, -5.0);
        assert_eq!(marks.best_for_word_count(3), -2.0);
        assert_eq!(marks.best_for_word_count(1), LOG_PROB_FLOOR);
        assert_eq!(marks.best_for_depth(8), -2.0);

        marks.reset();
        assert_eq!(marks.best, LOG_PROB_FLOOR);
        assert_eq!(marks.worst, 0.0);
        assert_eq!(marks.best_for_word_count(3), LOG_PROB_FLOOR);
    }

    #[test]
    fn test_strategy_predicates() {
        let fan_in = PruneCandidate { flags: NodeFlags::FAN_IN, ..plain(-20.0) };
        let inner = PruneCandidate { word_count: 1, depth: 4, ..plain(-20.0) };
        let mut marks = Watermarks::default();
        marks.observe(&PruneCandidate { flags: NodeFlags::FAN_IN, ..plain(-1.0) });
        marks.observe(&PruneCandidate { word_count: 1, depth: 5, ..plain(-1.0) });

        assert!(!PruningStrategy::Beam.discards(&marks, &fan_in));
        assert!(PruningStrategy::FanIn { beam: 10.0 }.discards(&marks, &fan_in));
        assert!(!PruningStrategy::FanIn { beam: 10.0 }.discards(&marks, &inner));
        assert!(PruningStrategy::EqualWordCount { beam: 10.0 }.discards(&marks, &inner));
        assert!(!PruningStrategy::EqualWordCount { beam: 10.0 }.discards(&marks, &fan_in));
        assert!(PruningStrategy::EqualDepth { beam: 10.0 }.discards(&marks, &inner));
        assert!(!PruningStrategy::EqualDepth { beam: 30.0 }.discards(&marks, &inner));
        assert!(!PruningStrategy::FanOut { beam: 10.0 }.discards(&marks, &fan_in));
    }

    #[test]
    fn test_beam_only_pass_relaxes_beam() {
        let candidates: Vec<_> = [-1.0, -3.0, -30.0].into_iter().map(plain).collect();
        let marks = marks_for(&candidates);
        let mut beams = BeamController::new(100.0, 50.0);
        beams.shrink_to(10.0);
        assert!((beams.current_word_end() - 5.0).abs() < 1e-4);

        let mut keep = Vec::new();
        let report = beams.prune(&candidates, &marks, &PruningStrategy::Beam, 0, &mut keep);
        assert_eq!(keep, vec![true, true, false]);
        assert_eq!(report, PruneReport { kept: 2, pruned: 1, histogram_applied: false });
        assert!((beams.current_global() - 11.0).abs() < 1e-4);
        assert!((beams.current_word_end() - 5.5).abs() < 1e-4);
    }

    #[test]
    fn test_histogram_respects_cap_and_keeps_best() {
        let candidates: Vec<_> = (0..1000).map(|i| plain(-(i as f32) * 0.37)).collect();
        let marks = marks_for(&candidates);
        let mut beams = BeamController::new(1e10, 1e10);
        let mut keep = Vec::new();
        let report = beams.prune(&candidates, &marks, &PruningStrategy::Beam, 100, &mut keep);

        assert!(report.histogram_applied);
        assert!(report.kept <= 100);
        assert!(report.kept > 80);
        assert!(keep[0]);
        assert!(beams.current_global() < 1e10);
        let ratio = beams.current_word_end() / beams.current_global();
        assert!((ratio - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_histogram_with_ties_keeps_top_bin() {
        let candidates: Vec<_> = (0..50).map(|_| plain(-4.0)).chain([plain(-9.0)]).collect();
        let marks = marks_for(&candidates);
        let mut beams = BeamController::new(1e10, 1e10);
        let mut keep = Vec::new();
        let report = beams.prune(&candidates, &marks, &PruningStrategy::Beam, 10, &mut keep);
        assert_eq!(report.kept, 50);
        assert!(!keep[50]);
    }

    #[test]
    fn test_beam_recovers_after_collapse() {
        let candidates = vec![plain(-5.0), plain(-6.0)];
        let marks = marks_for(&candidates);
        let mut beams = BeamController::new(100.0, 50.0);
        let mut keep = Vec::new();

        // A single token cap puts the cutoff on the best score.
        let report = beams.prune(&candidates, &marks, &PruningStrategy::Beam, 1, &mut keep);
        assert_eq!(report, PruneReport { kept: 1, pruned: 1, histogram_applied: true });
        assert_eq!(keep, vec![true, false]);
        assert!((beams.current_global() - MIN_BEAM).abs() < 1e-6);
        assert!((beams.current_word_end() - MIN_BEAM / 2.0).abs() < 1e-6);

        let single = [plain(-5.0)];
        let single_marks = marks_for(&single);
        for _ in 0..200 {
            beams.prune(&single, &single_marks, &PruningStrategy::Beam, 0, &mut keep);
        }
        assert_eq!(beams.current_global(), 100.0);
        assert!((beams.current_word_end() - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_tied_scores_leave_beam_alone() {
        let candidates = vec![plain(-5.0); 3];
        let marks = marks_for(&candidates);
        let mut beams = BeamController::new(100.0, 100.0);
        let mut keep = Vec::new();

        let report = beams.prune(&candidates, &marks, &PruningStrategy::Beam, 2, &mut keep);
        assert_eq!(report, PruneReport { kept: 3, pruned: 0, histogram_applied: false });
        assert_eq!(beams.current_global(), 100.0);
        assert_eq!(beams.current_word_end(), 100.0);
    }

    #[test]
    fn test_wider_beam_keeps_at_least_as_many() {
        let candidates: Vec<_> = (0..200).map(|i| plain(-(i as f32))).collect();
        let marks = marks_for(&candidates);
        let mut keep = Vec::new();
        let mut previous = 0;
        for width in [1.0, 10.0, 50.0, 150.0, 1e10] {
            let mut beams = BeamController::new(width, width);
            let report = beams.prune(&candidates, &marks, &PruningStrategy::Beam, 0, &mut keep);
            assert!(report.kept >= previous);
            previous = report.kept;
        }
        assert_eq!(previous, 200);
    }

    #[test]
    fn test_cutoff_never_exceeds_best() {
        let mut histogram = ScoreHistogram::new(-10.0, 0.0);
        for _ in 0..20 {
            histogram.add(0.0);
        }
        let cutoff = histogram.cutoff(20, 5);
        assert!(cutoff <= 0.0 && cutoff > -1e-4);
    }
}
