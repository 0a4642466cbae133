use crate::error::{EngineError, Result};
use serde::Serialize;

/// KJSEA achievement levels, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AchievementLevel {
    EE1,
    EE2,
    ME1,
    ME2,
    AE1,
    AE2,
    BE1,
    BE2,
}

// Ordered by descending minimum; first match wins.
const BANDS: [(f64, AchievementLevel); 8] = [
    (90.0, AchievementLevel::EE1),
    (75.0, AchievementLevel::EE2),
    (58.0, AchievementLevel::ME1),
    (41.0, AchievementLevel::ME2),
    (31.0, AchievementLevel::AE1),
    (21.0, AchievementLevel::AE2),
    (11.0, AchievementLevel::BE1),
    (0.0, AchievementLevel::BE2),
];

impl AchievementLevel {
    pub fn code(self) -> &'static str {
        match self {
            AchievementLevel::EE1 => "EE1",
            AchievementLevel::EE2 => "EE2",
            AchievementLevel::ME1 => "ME1",
            AchievementLevel::ME2 => "ME2",
            AchievementLevel::AE1 => "AE1",
            AchievementLevel::AE2 => "AE2",
            AchievementLevel::BE1 => "BE1",
            AchievementLevel::BE2 => "BE2",
        }
    }

    pub fn points(self) -> u8 {
        match self {
            AchievementLevel::EE1 => 8,
            AchievementLevel::EE2 => 7,
            AchievementLevel::ME1 => 6,
            AchievementLevel::ME2 => 5,
            AchievementLevel::AE1 => 4,
            AchievementLevel::AE2 => 3,
            AchievementLevel::BE1 => 2,
            AchievementLevel::BE2 => 1,
        }
    }

    pub fn descriptor(self) -> &'static str {
        match self {
            AchievementLevel::EE1 | AchievementLevel::EE2 => "Exceeding Expectations",
            AchievementLevel::ME1 | AchievementLevel::ME2 => "Meeting Expectations",
            AchievementLevel::AE1 | AchievementLevel::AE2 => "Approaching Expectations",
            AchievementLevel::BE1 | AchievementLevel::BE2 => "Below Expectations",
        }
    }

    pub fn min_percent(self) -> f64 {
        BANDS
            .iter()
            .find(|(_, level)| *level == self)
            .map(|(min, _)| *min)
            .unwrap_or(0.0)
    }

    pub fn to_json(self) -> serde_json::Value {
        serde_json::json!({
            "level": self.code(),
            "points": self.points(),
            "descriptor": self.descriptor(),
            "minPercent": self.min_percent(),
        })
    }
}

pub fn classify(percentage: f64) -> Result<AchievementLevel> {
    if !percentage.is_finite() {
        return Err(EngineError::input("percentage must be a finite number"));
    }
    if !(0.0..=100.0).contains(&percentage) {
        return Err(EngineError::input(format!(
            "percentage {} is outside 0..=100",
            percentage
        )));
    }
    for (min, level) in BANDS {
        if percentage >= min {
            return Ok(level);
        }
    }
    Ok(AchievementLevel::BE2)
}

pub fn bands() -> Vec<AchievementLevel> {
    BANDS.iter().map(|(_, level)| *level).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_are_inclusive_at_band_start() {
        let cases = [
            (100.0, "EE1"),
            (90.0, "EE1"),
            (89.999, "EE2"),
            (75.0, "EE2"),
            (74.9, "ME1"),
            (58.0, "ME1"),
            (57.5, "ME2"),
            (41.0, "ME2"),
            (40.99, "AE1"),
            (31.0, "AE1"),
            (30.0, "AE2"),
            (21.0, "AE2"),
            (20.0, "BE1"),
            (11.0, "BE1"),
            (10.999, "BE2"),
            (0.0, "BE2"),
        ];
        for (p, expected) in cases {
            assert_eq!(classify(p).expect("classify").code(), expected, "p={}", p);
        }
    }

    #[test]
    fn every_percentage_lands_in_exactly_one_band() {
        let levels = bands();
        assert_eq!(levels.len(), 8);
        for step in 0..=100_000 {
            let p = step as f64 / 1000.0;
            let level = classify(p).expect("classify");
            let matching = levels
                .iter()
                .filter(|l| {
                    let upper = levels
                        .iter()
                        .map(|o| o.min_percent())
                        .filter(|m| *m > l.min_percent())
                        .fold(f64::INFINITY, f64::min);
                    p >= l.min_percent() && p < upper
                })
                .count();
            assert_eq!(matching, 1, "p={}", p);
            assert!(p >= level.min_percent());
        }
    }

    #[test]
    fn rejects_nan_and_out_of_range() {
        assert!(matches!(classify(f64::NAN), Err(EngineError::Input(_))));
        assert!(matches!(classify(f64::INFINITY), Err(EngineError::Input(_))));
        assert!(matches!(classify(-0.5), Err(EngineError::Input(_))));
        assert!(matches!(classify(100.01), Err(EngineError::Input(_))));
    }

    #[test]
    fn points_descend_with_level() {
        let pts: Vec<u8> = bands().into_iter().map(|l| l.points()).collect();
        assert_eq!(pts, vec![8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(AchievementLevel::ME2.descriptor(), "Meeting Expectations");
    }
}
