// Elo rating calculation for match settlement.
//
// The K-factor comes from a configurable rating-band ("title") table:
// stronger players move more slowly. Expected scores are always taken
// against the opponent's pre-match rating, never the live score, so
// concurrent matches cannot leak into each other.

use serde::{Deserialize, Serialize};

use crate::models::{MatchStatus, RatingStatus};

pub const INITIAL_SCORE: f64 = 1500.0;

/// One row of the title table: the K-factor applied from `floor`
/// (inclusive) up to the next band's floor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KBand {
    pub floor: f64,
    pub k: f64,
}

/// Default title table, floors ascending.
pub fn default_k_bands() -> Vec<KBand> {
    vec![
        KBand { floor: 0.0, k: 40.0 },
        KBand { floor: 1200.0, k: 32.0 },
        KBand { floor: 1600.0, k: 24.0 },
        KBand { floor: 2000.0, k: 16.0 },
        KBand { floor: 2400.0, k: 10.0 },
    ]
}

/// Look up the K-factor for a score. Falls back to the first band for
/// scores below every floor.
pub fn k_for(bands: &[KBand], score: f64) -> f64 {
    let mut k = bands.first().map(|b| b.k).unwrap_or(32.0);
    for band in bands {
        if score >= band.floor {
            k = band.k;
        }
    }
    k
}

/// Expected score of a player rated `a` against a player rated `b`.
pub fn expected(a: f64, b: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((b - a) / 400.0))
}

/// One side of a settlement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SideSettlement {
    pub status: RatingStatus,
    pub after: f64,
    pub change: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settlement {
    pub u1: SideSettlement,
    pub u2: SideSettlement,
}

/// Compute both sides' settlement from a terminal match status and the
/// pre-match `before` scores. Deterministic: re-running with the same
/// inputs reproduces the same deltas, which is what makes a crashed
/// half-settlement retryable.
///
/// A system error settles both sides as `error` with no rating impact.
/// A draw leaves both scores untouched.
pub fn settle(
    status: MatchStatus,
    u1_before: f64,
    u2_before: f64,
    bands: &[KBand],
) -> Option<Settlement> {
    match status {
        MatchStatus::SystemError => Some(Settlement {
            u1: SideSettlement { status: RatingStatus::Error, after: u1_before, change: 0.0 },
            u2: SideSettlement { status: RatingStatus::Error, after: u2_before, change: 0.0 },
        }),
        MatchStatus::Draw => Some(Settlement {
            u1: SideSettlement { status: RatingStatus::Draw, after: u1_before, change: 0.0 },
            u2: SideSettlement { status: RatingStatus::Draw, after: u2_before, change: 0.0 },
        }),
        MatchStatus::U1Win | MatchStatus::U2Win => {
            let u1_won = status == MatchStatus::U1Win;
            let (w_before, l_before) = if u1_won {
                (u1_before, u2_before)
            } else {
                (u2_before, u1_before)
            };
            let w_delta = k_for(bands, w_before) * (1.0 - expected(w_before, l_before));
            let l_delta = -k_for(bands, l_before) * expected(l_before, w_before);
            let winner = SideSettlement {
                status: RatingStatus::Win,
                after: w_before + w_delta,
                change: w_delta,
            };
            let loser = SideSettlement {
                status: RatingStatus::Lose,
                after: l_before + l_delta,
                change: l_delta,
            };
            Some(Settlement {
                u1: if u1_won { winner } else { loser },
                u2: if u1_won { loser } else { winner },
            })
        }
        MatchStatus::Pending | MatchStatus::Running => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_score_symmetry() {
        let e = expected(1500.0, 1500.0);
        assert!((e - 0.5).abs() < 1e-9);
        let a = expected(1800.0, 1500.0);
        let b = expected(1500.0, 1800.0);
        assert!((a + b - 1.0).abs() < 1e-9);
        assert!(a > 0.8 && a < 1.0);
    }

    #[test]
    fn test_k_band_lookup() {
        let bands = default_k_bands();
        assert_eq!(k_for(&bands, 0.0), 40.0);
        assert_eq!(k_for(&bands, 1199.9), 40.0);
        assert_eq!(k_for(&bands, 1200.0), 32.0);
        assert_eq!(k_for(&bands, 1999.9), 24.0);
        assert_eq!(k_for(&bands, 2400.0), 10.0);
        assert_eq!(k_for(&bands, 3000.0), 10.0);
    }

    #[test]
    fn test_settle_equal_ratings_win() {
        let bands = default_k_bands();
        let s = settle(MatchStatus::U1Win, 1500.0, 1500.0, &bands).unwrap();
        assert_eq!(s.u1.status, RatingStatus::Win);
        assert_eq!(s.u2.status, RatingStatus::Lose);
        // K=32 at 1500, expected 0.5: winner +16, loser -16
        assert!((s.u1.change - 16.0).abs() < 1e-9);
        assert!((s.u2.change + 16.0).abs() < 1e-9);
        assert!((s.u1.after - 1516.0).abs() < 1e-9);
        assert!((s.u2.after - 1484.0).abs() < 1e-9);
    }

    #[test]
    fn test_settle_upset_moves_more() {
        let bands = default_k_bands();
        // Low-rated u1 beats high-rated u2
        let upset = settle(MatchStatus::U1Win, 1300.0, 1900.0, &bands).unwrap();
        let favorite = settle(MatchStatus::U1Win, 1900.0, 1300.0, &bands).unwrap();
        assert!(upset.u1.change > favorite.u1.change);
        assert!(upset.u1.change > 0.0);
        assert!(upset.u2.change < 0.0);
    }

    #[test]
    fn test_settle_draw_leaves_scores() {
        let bands = default_k_bands();
        let s = settle(MatchStatus::Draw, 1700.0, 1400.0, &bands).unwrap();
        assert_eq!(s.u1.status, RatingStatus::Draw);
        assert_eq!(s.u2.status, RatingStatus::Draw);
        assert_eq!(s.u1.after, 1700.0);
        assert_eq!(s.u2.after, 1400.0);
        assert_eq!(s.u1.change, 0.0);
    }

    #[test]
    fn test_settle_system_error_no_impact() {
        let bands = default_k_bands();
        let s = settle(MatchStatus::SystemError, 1650.0, 1420.0, &bands).unwrap();
        assert_eq!(s.u1.status, RatingStatus::Error);
        assert_eq!(s.u2.status, RatingStatus::Error);
        assert_eq!(s.u1.after, 1650.0);
        assert_eq!(s.u2.after, 1420.0);
        assert_eq!(s.u2.change, 0.0);
    }

    #[test]
    fn test_settle_live_status_is_none() {
        let bands = default_k_bands();
        assert!(settle(MatchStatus::Pending, 1500.0, 1500.0, &bands).is_none());
        assert!(settle(MatchStatus::Running, 1500.0, 1500.0, &bands).is_none());
    }

    #[test]
    fn test_settle_deterministic() {
        let bands = default_k_bands();
        let a = settle(MatchStatus::U2Win, 1512.5, 1498.25, &bands).unwrap();
        let b = settle(MatchStatus::U2Win, 1512.5, 1498.25, &bands).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_settle_same_band_zero_sum() {
        let bands = default_k_bands();
        let s = settle(MatchStatus::U1Win, 1450.0, 1480.0, &bands).unwrap();
        // Both in the same K band: deltas cancel
        assert!((s.u1.change + s.u2.change).abs() < 1e-9);
    }
}
