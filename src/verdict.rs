use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    TitanConfig,
    EfficientAlpha,
    LuckyPeak,
    SafeHarbor,
    Aggressive,
    Degraded,
    Unsafe,
    Unclassified,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Verdict::TitanConfig => "TITAN CONFIG",
            Verdict::EfficientAlpha => "Efficient Alpha",
            Verdict::LuckyPeak => "Lucky Peak",
            Verdict::SafeHarbor => "Safe Harbor",
            Verdict::Aggressive => "Aggressive",
            Verdict::Degraded => "Degraded",
            Verdict::Unsafe => "Unsafe",
            Verdict::Unclassified => "Unclassified",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerdictInputs {
    /// `None` when the benchmark return was zero or missing.
    pub alpha: Option<f64>,
    /// Negative fraction.
    pub max_drawdown: f64,
    pub stress_pass: bool,
    pub plateau_pass: bool,
}

impl VerdictInputs {
    fn alpha_above(&self, bound: f64) -> bool {
        self.alpha.map(|alpha| alpha > bound).unwrap_or(false)
    }

    fn alpha_at_most(&self, bound: f64) -> bool {
        self.alpha.map(|alpha| alpha <= bound).unwrap_or(false)
    }
}

type Rule = fn(&VerdictInputs) -> bool;

/// Evaluated top to bottom; the first matching tier wins.
const TIERS: &[(Verdict, Rule)] = &[
    (Verdict::TitanConfig, |v: &VerdictInputs| {
        v.alpha_above(1.5) && v.max_drawdown > -0.25 && v.stress_pass && v.plateau_pass
    }),
    (Verdict::EfficientAlpha, |v: &VerdictInputs| {
        v.alpha_above(1.0) && v.max_drawdown > -0.30 && v.stress_pass
    }),
    (Verdict::LuckyPeak, |v: &VerdictInputs| {
        v.alpha_above(1.5) && (!v.stress_pass || !v.plateau_pass)
    }),
    (Verdict::SafeHarbor, |v: &VerdictInputs| v.max_drawdown > -0.15 && v.stress_pass),
    (Verdict::Aggressive, |v: &VerdictInputs| {
        v.alpha_above(1.0) && v.max_drawdown <= -0.30
    }),
    (Verdict::Degraded, |v: &VerdictInputs| {
        v.alpha_at_most(1.0) && v.max_drawdown > -0.35 && v.plateau_pass
    }),
    (Verdict::Unsafe, |v: &VerdictInputs| v.max_drawdown <= -0.35 || !v.stress_pass),
];

pub fn classify(inputs: &VerdictInputs) -> Verdict {
    TIERS
        .iter()
        .find(|(_, rule)| rule(inputs))
        .map(|(verdict, _)| *verdict)
        .unwrap_or(Verdict::Unclassified)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(alpha: Option<f64>, dd: f64, stress: bool, plateau: bool) -> VerdictInputs {
        VerdictInputs {
            alpha,
            max_drawdown: dd,
            stress_pass: stress,
            plateau_pass: plateau,
        }
    }

    #[test]
    fn strong_stable_config_is_titan() {
        assert_eq!(
            classify(&inputs(Some(1.6), -0.20, true, true)),
            Verdict::TitanConfig
        );
    }

    #[test]
    fn failing_stress_downgrades_titan_to_lucky_peak() {
        assert_eq!(
            classify(&inputs(Some(1.6), -0.20, false, true)),
            Verdict::LuckyPeak
        );
    }

    #[test]
    fn earlier_tiers_take_priority() {
        // Matches both Efficient Alpha and Safe Harbor.
        assert_eq!(
            classify(&inputs(Some(1.2), -0.10, true, false)),
            Verdict::EfficientAlpha
        );
        assert_eq!(
            classify(&inputs(Some(0.8), -0.10, true, false)),
            Verdict::SafeHarbor
        );
        assert_eq!(
            classify(&inputs(Some(1.2), -0.32, false, false)),
            Verdict::Aggressive
        );
        assert_eq!(
            classify(&inputs(Some(0.9), -0.20, false, true)),
            Verdict::Degraded
        );
        assert_eq!(
            classify(&inputs(Some(0.9), -0.40, true, true)),
            Verdict::Unsafe
        );
        assert_eq!(
            classify(&inputs(Some(0.9), -0.20, true, false)),
            Verdict::Unclassified
        );
    }

    #[test]
    fn missing_alpha_never_satisfies_alpha_tiers() {
        assert_eq!(classify(&inputs(None, -0.20, true, true)), Verdict::Unclassified);
        assert_eq!(classify(&inputs(None, -0.10, true, true)), Verdict::SafeHarbor);
        assert_eq!(classify(&inputs(None, -0.20, false, true)), Verdict::Unsafe);
    }
}
