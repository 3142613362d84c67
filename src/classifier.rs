// =============================================================================
// Trade Classifier — position lifecycle actions from (start, side, size)
// =============================================================================
//
// Pure and total: every (startPosition ∈ ℝ, side, size > 0) input maps to
// exactly one of the eight lifecycle actions. The position delta is
// `+size` for buys and `-size` for sells; the new position is
// `startPosition + delta`.
//
// "Close" is chosen when the new position lands on zero. Upstream sizes are
// decimal strings parsed into f64, so exact zero cannot be relied on; the
// zero test uses an epsilon scaled by the magnitudes involved.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Relative epsilon for the close-all test, scaled by
/// `max(|startPosition|, |delta|)`.
const CLOSE_EPSILON: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Lifecycle action
// ---------------------------------------------------------------------------

/// The eight canonical position lifecycle actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleAction {
    #[serde(rename = "Open Long (Open New)")]
    OpenLong,
    #[serde(rename = "Increase Long (Add)")]
    IncreaseLong,
    #[serde(rename = "Decrease Long (Partial Close)")]
    DecreaseLong,
    #[serde(rename = "Close Long (Close All)")]
    CloseLong,
    #[serde(rename = "Open Short (Open New)")]
    OpenShort,
    #[serde(rename = "Increase Short (Add)")]
    IncreaseShort,
    #[serde(rename = "Decrease Short (Partial Close)")]
    DecreaseShort,
    #[serde(rename = "Close Short (Close All)")]
    CloseShort,
}

impl LifecycleAction {
    /// True for actions produced by a buy fill (positive delta).
    pub fn is_buy(self) -> bool {
        matches!(
            self,
            Self::OpenLong | Self::IncreaseLong | Self::DecreaseShort | Self::CloseShort
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenLong => "Open Long (Open New)",
            Self::IncreaseLong => "Increase Long (Add)",
            Self::DecreaseLong => "Decrease Long (Partial Close)",
            Self::CloseLong => "Close Long (Close All)",
            Self::OpenShort => "Open Short (Open New)",
            Self::IncreaseShort => "Increase Short (Add)",
            Self::DecreaseShort => "Decrease Short (Partial Close)",
            Self::CloseShort => "Close Short (Close All)",
        }
    }
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Open Long (Open New)" => Ok(Self::OpenLong),
            "Increase Long (Add)" => Ok(Self::IncreaseLong),
            "Decrease Long (Partial Close)" => Ok(Self::DecreaseLong),
            "Close Long (Close All)" => Ok(Self::CloseLong),
            "Open Short (Open New)" => Ok(Self::OpenShort),
            "Increase Short (Add)" => Ok(Self::IncreaseShort),
            "Decrease Short (Partial Close)" => Ok(Self::DecreaseShort),
            "Close Short (Close All)" => Ok(Self::CloseShort),
            other => anyhow::bail!("unknown lifecycle action: {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Result of classifying a single fill against the prior position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classified {
    pub action: LifecycleAction,
    /// Signed delta applied to the position (+size buy, -size sell).
    pub delta: f64,
    /// Position size after the fill.
    pub new_position: f64,
}

/// Classify one fill.
///
/// `start_position` is the signed position immediately before the fill,
/// as reported by the upstream exchange (authoritative). A fill that flips
/// the position through zero in one leg classifies as a decrease of the
/// prior side; the sign of `new_position` carries the flip.
pub fn classify(start_position: f64, side: Side, size: f64) -> Classified {
    let delta = side.delta_sign() * size;
    let new_position = start_position + delta;

    let eps = CLOSE_EPSILON * start_position.abs().max(delta.abs());
    let closes = new_position.abs() <= eps;
    let flat_before = start_position.abs() <= eps;

    let action = if flat_before {
        if delta > 0.0 {
            LifecycleAction::OpenLong
        } else {
            LifecycleAction::OpenShort
        }
    } else if start_position > 0.0 {
        if delta > 0.0 {
            LifecycleAction::IncreaseLong
        } else if closes {
            LifecycleAction::CloseLong
        } else {
            LifecycleAction::DecreaseLong
        }
    } else if delta < 0.0 {
        LifecycleAction::IncreaseShort
    } else if closes {
        LifecycleAction::CloseShort
    } else {
        LifecycleAction::DecreaseShort
    };

    let new_position = if closes { 0.0 } else { new_position };

    Classified {
        action,
        delta,
        new_position,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_buy_opens_long() {
        let c = classify(0.0, Side::Buy, 1.0);
        assert_eq!(c.action, LifecycleAction::OpenLong);
        assert_eq!(c.delta, 1.0);
        assert_eq!(c.new_position, 1.0);
    }

    #[test]
    fn flat_sell_opens_short() {
        let c = classify(0.0, Side::Sell, 2.5);
        assert_eq!(c.action, LifecycleAction::OpenShort);
        assert_eq!(c.delta, -2.5);
        assert_eq!(c.new_position, -2.5);
    }

    #[test]
    fn long_buy_increases() {
        let c = classify(1.0, Side::Buy, 0.5);
        assert_eq!(c.action, LifecycleAction::IncreaseLong);
        assert_eq!(c.new_position, 1.5);
    }

    #[test]
    fn long_partial_sell_decreases() {
        let c = classify(2.0, Side::Sell, 0.5);
        assert_eq!(c.action, LifecycleAction::DecreaseLong);
        assert_eq!(c.new_position, 1.5);
    }

    #[test]
    fn long_full_sell_closes() {
        let c = classify(1.0, Side::Sell, 1.0);
        assert_eq!(c.action, LifecycleAction::CloseLong);
        assert_eq!(c.new_position, 0.0);
    }

    #[test]
    fn short_sell_increases() {
        let c = classify(-1.0, Side::Sell, 1.0);
        assert_eq!(c.action, LifecycleAction::IncreaseShort);
        assert_eq!(c.new_position, -2.0);
    }

    #[test]
    fn short_partial_buy_decreases() {
        let c = classify(-2.0, Side::Buy, 1.0);
        assert_eq!(c.action, LifecycleAction::DecreaseShort);
        assert_eq!(c.new_position, -1.0);
    }

    #[test]
    fn short_full_buy_closes() {
        let c = classify(-3.0, Side::Buy, 3.0);
        assert_eq!(c.action, LifecycleAction::CloseShort);
        assert_eq!(c.new_position, 0.0);
    }

    #[test]
    fn close_tolerates_float_residue() {
        // 0.1 + 0.2 style residue: the sum is not exactly 0.3 in binary.
        let start = 0.1 + 0.2;
        let c = classify(start, Side::Sell, 0.3);
        assert_eq!(c.action, LifecycleAction::CloseLong);
        assert_eq!(c.new_position, 0.0);
    }

    #[test]
    fn flip_through_zero_is_a_decrease() {
        // One leg takes a 1.0 long to a 0.5 short; the sign change is carried
        // by new_position, the action stays on the prior side.
        let c = classify(1.0, Side::Sell, 1.5);
        assert_eq!(c.action, LifecycleAction::DecreaseLong);
        assert_eq!(c.new_position, -0.5);
    }

    #[test]
    fn totality_over_a_grid() {
        // Every (start, side, size) combination must produce an action that
        // satisfies new_position == start + signed delta.
        let starts = [-10.0, -1.0, -1e-9, 0.0, 1e-9, 1.0, 10.0];
        let sizes = [1e-9, 0.5, 1.0, 10.0];
        for &start in &starts {
            for &size in &sizes {
                for side in [Side::Buy, Side::Sell] {
                    let c = classify(start, side, size);
                    let expected = start + side.delta_sign() * size;
                    // classify snaps near-zero results to exactly zero.
                    assert!(
                        (c.new_position - expected).abs()
                            <= 1e-12 * start.abs().max(size) + f64::EPSILON,
                        "start={start} side={side:?} size={size}"
                    );
                }
            }
        }
    }

    #[test]
    fn action_strings_are_stable() {
        assert_eq!(LifecycleAction::OpenLong.to_string(), "Open Long (Open New)");
        assert_eq!(
            LifecycleAction::CloseLong.to_string(),
            "Close Long (Close All)"
        );
        assert_eq!(
            serde_json::to_value(LifecycleAction::CloseShort).unwrap(),
            "Close Short (Close All)"
        );
    }
}
