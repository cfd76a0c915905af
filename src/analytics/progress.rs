use serde::{Deserialize, Serialize};

/// Sequential processing phases. Each owns a quarter of overall progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Loading,
    Extracting,
    Detecting,
    Analyzing,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Loading,
        Stage::Extracting,
        Stage::Detecting,
        Stage::Analyzing,
    ];

    /// 1-based position, as sent to clients.
    pub fn number(self) -> u8 {
        match self {
            Stage::Loading => 1,
            Stage::Extracting => 2,
            Stage::Detecting => 3,
            Stage::Analyzing => 4,
        }
    }

    pub fn base_percent(self) -> f64 {
        match self {
            Stage::Loading => 0.0,
            Stage::Extracting => 25.0,
            Stage::Detecting => 50.0,
            Stage::Analyzing => 75.0,
        }
    }
}

/// Overall percentage (0–100) for a stage and its own percentage.
pub fn overall_progress(stage: Stage, stage_percent: f64) -> f64 {
    stage.base_percent() + stage_percent.clamp(0.0, 100.0) * 0.25
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub loading: f64,
    pub extracting: f64,
    pub detecting: f64,
    pub analyzing: f64,
}

impl StageProgress {
    pub fn get(&self, stage: Stage) -> f64 {
        match stage {
            Stage::Loading => self.loading,
            Stage::Extracting => self.extracting,
            Stage::Detecting => self.detecting,
            Stage::Analyzing => self.analyzing,
        }
    }

    /// Never moves a stage backwards.
    pub fn advance(&mut self, stage: Stage, percent: f64) {
        let percent = percent.clamp(0.0, 100.0);
        let slot = match stage {
            Stage::Loading => &mut self.loading,
            Stage::Extracting => &mut self.extracting,
            Stage::Detecting => &mut self.detecting,
            Stage::Analyzing => &mut self.analyzing,
        };
        if percent > *slot {
            *slot = percent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_boundaries() {
        assert_eq!(overall_progress(Stage::Loading, 0.0), 0.0);
        assert_eq!(overall_progress(Stage::Loading, 100.0), 25.0);
        assert_eq!(overall_progress(Stage::Extracting, 0.0), 25.0);
        assert_eq!(overall_progress(Stage::Detecting, 50.0), 62.5);
        assert_eq!(overall_progress(Stage::Analyzing, 100.0), 100.0);
    }

    #[test]
    fn test_out_of_range_stage_percent_is_clamped() {
        assert_eq!(overall_progress(Stage::Detecting, 150.0), 75.0);
        assert_eq!(overall_progress(Stage::Extracting, -10.0), 25.0);
    }

    #[test]
    fn test_monotonic_across_stage_transitions() {
        let mut last = 0.0;
        for stage in Stage::ALL {
            for step in 0..=20 {
                let value = overall_progress(stage, step as f64 * 5.0);
                assert!(value >= last, "{stage:?} {step}: {value} < {last}");
                last = value;
            }
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_stage_progress_never_regresses() {
        let mut progress = StageProgress::default();
        progress.advance(Stage::Detecting, 40.0);
        progress.advance(Stage::Detecting, 20.0);
        assert_eq!(progress.get(Stage::Detecting), 40.0);
        progress.advance(Stage::Detecting, 250.0);
        assert_eq!(progress.detecting, 100.0);
    }
}
