use serde::{Deserialize, Serialize};

/// Marketplace cut withheld from the driver's payout.
pub const PLATFORM_FEE_RATE: f64 = 0.05;

const BASE_RATE_PER_KM: f64 = 15.0;
const MIN_DISTANCE_CHARGE: f64 = 100.0;
const RATE_PER_TON: f64 = 10.0;
const RATE_PER_CUBIC_METER: f64 = 5.0;
const MIN_PRICE: f64 = 500.0;

/// The money fields fixed on an order when a bid is accepted. They only
/// ever exist together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub final_price: f64,
    pub platform_fee: f64,
    pub order_amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub distance_km: f64,
    #[serde(flatten)]
    pub settlement: Settlement,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn settle(final_price: f64) -> Settlement {
    let platform_fee = round2(final_price * PLATFORM_FEE_RATE);
    Settlement {
        final_price,
        platform_fee,
        order_amount: final_price - platform_fee,
    }
}

/// Suggested price for a haul before any bidding happens.
pub fn quote(distance_km: f64, weight_t: f64, volume_m3: f64) -> Quote {
    let distance_charge = (distance_km.max(0.0) * BASE_RATE_PER_KM).max(MIN_DISTANCE_CHARGE);
    let cargo_charge = weight_t.max(0.0) * RATE_PER_TON + volume_m3.max(0.0) * RATE_PER_CUBIC_METER;
    let price = round2((distance_charge + cargo_charge).max(MIN_PRICE));

    let mut settlement = settle(price);
    settlement.order_amount = round2(settlement.order_amount);

    Quote {
        distance_km,
        settlement,
    }
}

#[cfg(test)]
mod tests {
    use super::{quote, round2, settle};

    #[test]
    fn fee_is_five_percent_rounded_to_cents() {
        let s = settle(90.0);
        assert_eq!(s.final_price, 90.0);
        assert_eq!(s.platform_fee, 4.5);
        assert_eq!(s.order_amount, 85.5);

        for price in [1.0, 10.01, 333.33, 1234.57, 99_999.99] {
            let s = settle(price);
            assert_eq!(s.platform_fee, round2(price * 0.05));
            assert_eq!(s.order_amount, price - s.platform_fee);
        }
    }

    #[test]
    fn short_light_haul_hits_minimum_price() {
        let q = quote(2.0, 0.5, 1.0);
        assert_eq!(q.settlement.final_price, 500.0);
        assert_eq!(q.settlement.platform_fee, 25.0);
        assert_eq!(q.settlement.order_amount, 475.0);
    }

    #[test]
    fn long_haul_scales_with_distance_and_cargo() {
        let q = quote(100.0, 10.0, 20.0);
        // 1500 + 100 + 100
        assert_eq!(q.settlement.final_price, 1700.0);
        assert_eq!(q.settlement.platform_fee, 85.0);
    }
}
