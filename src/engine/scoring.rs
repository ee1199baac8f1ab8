use serde::Serialize;

use crate::models::bid::Bid;

const PRICE_WEIGHT: f64 = 0.70;
const RATING_WEIGHT: f64 = 0.30;

pub const MAX_RANKED: usize = 20;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScoreBreakdown {
    pub price_score: f64,
    pub rating_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedBid {
    pub bid: Bid,
    pub driver_rating: f64,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Orders pending bids best-first: cheaper is better, a stronger driver
/// rating breaks near-ties. `limit` is clamped to `1..=MAX_RANKED`.
pub fn rank_bids(candidates: Vec<(Bid, f64)>, limit: usize) -> Vec<RankedBid> {
    let cheapest = candidates
        .iter()
        .map(|(bid, _)| bid.proposed_price)
        .fold(f64::INFINITY, f64::min);

    let mut ranked: Vec<RankedBid> = candidates
        .into_iter()
        .map(|(bid, driver_rating)| {
            let breakdown = ScoreBreakdown {
                price_score: price_score(cheapest, bid.proposed_price),
                rating_score: rating_score(driver_rating),
            };
            RankedBid {
                score: weighted_score(&breakdown),
                bid,
                driver_rating,
                breakdown,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.bid.created_at.cmp(&b.bid.created_at))
    });
    ranked.truncate(limit.clamp(1, MAX_RANKED));
    ranked
}

pub fn weighted_score(breakdown: &ScoreBreakdown) -> f64 {
    (breakdown.price_score * PRICE_WEIGHT) + (breakdown.rating_score * RATING_WEIGHT)
}

fn price_score(cheapest: f64, proposed: f64) -> f64 {
    if proposed <= 0.0 || !cheapest.is_finite() {
        return 0.0;
    }
    (cheapest / proposed).clamp(0.0, 1.0)
}

fn rating_score(rating: f64) -> f64 {
    (rating / 5.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::rank_bids;
    use crate::models::bid::{Bid, BidStatus};

    fn bid(price: f64, age_secs: i64) -> Bid {
        let at = Utc::now() - Duration::seconds(age_secs);
        Bid {
            id: Uuid::new_v4(),
            order_id: Uuid::nil(),
            driver_id: Uuid::new_v4(),
            proposed_price: price,
            message: None,
            status: BidStatus::Pending,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn cheaper_bid_wins_when_ratings_match() {
        let ranked = rank_bids(vec![(bid(120.0, 0), 4.0), (bid(100.0, 0), 4.0)], 10);
        assert_eq!(ranked[0].bid.proposed_price, 100.0);
        assert_eq!(ranked[0].breakdown.price_score, 1.0);
    }

    #[test]
    fn rating_can_outweigh_a_small_price_gap() {
        let ranked = rank_bids(vec![(bid(100.0, 0), 1.0), (bid(102.0, 0), 5.0)], 10);
        assert_eq!(ranked[0].bid.proposed_price, 102.0);
    }

    #[test]
    fn ties_go_to_the_earlier_bid() {
        let early = bid(100.0, 60);
        let early_id = early.id;
        let ranked = rank_bids(vec![(bid(100.0, 0), 4.0), (early, 4.0)], 10);
        assert_eq!(ranked[0].bid.id, early_id);
    }

    #[test]
    fn limit_is_clamped() {
        let many: Vec<_> = (0..30).map(|i| (bid(100.0 + i as f64, 0), 4.0)).collect();
        assert_eq!(rank_bids(many.clone(), 0).len(), 1);
        assert_eq!(rank_bids(many, 100).len(), 20);
        assert!(rank_bids(Vec::new(), 5).is_empty());
    }
}
