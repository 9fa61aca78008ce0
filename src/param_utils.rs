use crate::models::ParameterAssignment;
use crate::strategy::{PlateauParameter, DEFAULT_PLATEAU_TOLERANCE};

/// Substrings used to pick plateau parameters when no strategy descriptor is known.
const PLATEAU_NAME_HINTS: &[&str] = &["sma", "threshold"];

/// Check whether `candidate` lies inside a relative band around `center`.
pub fn within_relative_band(candidate: f64, center: f64, tolerance: f64) -> bool {
    if !candidate.is_finite() || !center.is_finite() {
        return false;
    }
    let allowed = if center.abs() > f64::EPSILON {
        tolerance * center.abs()
    } else {
        tolerance
    };
    (candidate - center).abs() <= allowed + 1e-12
}

/// Resolve which declared plateau parameters exist in the evaluated grid.
///
/// Returns `None` when none of them are present, which callers report as the
/// trivially-stable fallback.
pub fn resolve_plateau_parameters(
    declared: &[PlateauParameter],
    grid_parameters: &[String],
) -> Option<Vec<PlateauParameter>> {
    let resolved: Vec<PlateauParameter> = if declared.is_empty() {
        PLATEAU_NAME_HINTS
            .iter()
            .filter_map(|hint| {
                grid_parameters
                    .iter()
                    .find(|name| name.to_ascii_lowercase().contains(hint))
                    .map(|name| PlateauParameter {
                        name: name.clone(),
                        tolerance: DEFAULT_PLATEAU_TOLERANCE,
                    })
            })
            .collect()
    } else {
        declared
            .iter()
            .filter(|param| grid_parameters.iter().any(|name| name == &param.name))
            .cloned()
            .collect()
    };

    if resolved.is_empty() {
        None
    } else {
        Some(resolved)
    }
}

/// Every band parameter of `candidate` is numeric and inside the band around `center`.
pub fn is_neighbor(
    center: &ParameterAssignment,
    candidate: &ParameterAssignment,
    bands: &[PlateauParameter],
) -> bool {
    bands.iter().all(|band| {
        match (
            center.get(&band.name).and_then(|value| value.as_f64()),
            candidate.get(&band.name).and_then(|value| value.as_f64()),
        ) {
            (Some(center_value), Some(candidate_value)) => {
                within_relative_band(candidate_value, center_value, band.tolerance)
            }
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParamValue;

    fn params(sma: i64, threshold: f64) -> ParameterAssignment {
        ParameterAssignment(vec![
            ("sma_period".to_string(), ParamValue::Int(sma)),
            ("band_threshold".to_string(), ParamValue::Float(threshold)),
        ])
    }

    #[test]
    fn relative_band_is_inclusive() {
        assert!(within_relative_band(125.0, 100.0, 0.25));
        assert!(!within_relative_band(126.0, 100.0, 0.25));
        assert!(within_relative_band(0.1, 0.0, 0.25));
    }

    #[test]
    fn falls_back_to_name_hints_without_declaration() {
        let grid = vec!["sma_period".to_string(), "band_threshold".to_string()];
        let resolved = resolve_plateau_parameters(&[], &grid).expect("hints match");
        assert_eq!(resolved.len(), 2);
        assert!(resolve_plateau_parameters(&[], &["lookback".to_string()]).is_none());
    }

    #[test]
    fn neighbors_must_match_every_band() {
        let bands = vec![
            PlateauParameter {
                name: "sma_period".to_string(),
                tolerance: 0.25,
            },
            PlateauParameter {
                name: "band_threshold".to_string(),
                tolerance: 0.5,
            },
        ];
        assert!(is_neighbor(&params(200, 0.02), &params(180, 0.025), &bands));
        assert!(!is_neighbor(&params(200, 0.02), &params(100, 0.02), &bands));
        assert!(!is_neighbor(&params(200, 0.02), &params(200, 0.05), &bands));
    }
}
