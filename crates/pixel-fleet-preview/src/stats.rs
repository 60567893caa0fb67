use serde::Serialize;

use crate::analysis::PreviewAnalysis;

/// Counts shown in the statistics panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreviewStats {
    pub original: u64,
    pub correct: u64,
    pub incorrect: u64,
    pub missing: u64,
}

impl PreviewStats {
    pub fn from_analysis(analysis: &PreviewAnalysis) -> Self {
        Self {
            original: analysis.original_count(),
            correct: analysis.correct.len() as u64,
            incorrect: analysis.incorrect.len() as u64,
            missing: analysis.missing.len() as u64,
        }
    }

    /// Denominator for accuracy: never below what was actually classified,
    /// so an incomplete reference set cannot push accuracy over 100%.
    pub fn total(&self) -> u64 {
        self.original
            .max(self.correct + self.incorrect + self.missing)
    }

    /// Percentage of the total that is correct, 0.0 when nothing is known.
    pub fn accuracy(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.correct as f64 / total as f64 * 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy_reference_case() {
        let stats = PreviewStats { original: 10, correct: 7, incorrect: 2, missing: 1 };
        assert!((stats.accuracy() - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_undercounted_reference() {
        let stats = PreviewStats { original: 4, correct: 6, incorrect: 1, missing: 1 };
        assert_eq!(stats.total(), 8);
        assert!((stats.accuracy() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty() {
        assert_eq!(PreviewStats::default().accuracy(), 0.0);
    }
}
