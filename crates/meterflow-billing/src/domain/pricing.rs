use crate::domain::types::{Amount, BillingInterval, Currency, PriceId};
use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Pricing model. A closed set so that rating is exhaustive over every
/// variant the catalog can express.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum PricingModel {
    /// Per-unit rate, prorated to the billing interval.
    Flat,
    /// Quantity is partitioned across the tiers; each tier charges its own
    /// per-unit rate plus a one-off flat amount once usage reaches it.
    Tiered { tiers: Vec<PriceTier> },
    /// The entire quantity is charged at the single tier containing it.
    Volume { tiers: Vec<PriceTier> },
    /// Quantity is rounded up to whole packages of `billing_unit` units.
    /// Quantity up to `billing_threshold` is zero-rated.
    Package {
        billing_unit: Decimal,
        billing_threshold: Option<Decimal>,
    },
}

/// Currency-specific, time-bounded rate for a price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAmount {
    pub currency: Currency,
    /// Per-unit rate in minor units; fractional minor units are allowed
    /// here, rounding happens on the computed line amount.
    pub unit_amount: Decimal,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl PriceAmount {
    pub fn new(currency: Currency, unit_amount: Decimal) -> Self {
        Self {
            currency,
            unit_amount,
            valid_from: None,
            valid_until: None,
        }
    }

    fn in_effect(&self, currency: &Currency, at: DateTime<Utc>) -> bool {
        if self.currency != *currency {
            return false;
        }
        if let Some(from) = self.valid_from {
            if at < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if at >= until {
                return false;
            }
        }
        true
    }
}

/// Half-open quantity range `[start, end)`; `end = None` is unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTier {
    pub start: Decimal,
    pub end: Option<Decimal>,
    pub unit_amount: Decimal,
    pub flat_amount: i64,
}

impl PriceTier {
    pub fn new(start: Decimal, end: Option<Decimal>, unit_amount: Decimal) -> Self {
        Self {
            start,
            end,
            unit_amount,
            flat_amount: 0,
        }
    }

    fn contains(&self, quantity: Decimal) -> bool {
        quantity >= self.start && self.end.map_or(true, |end| quantity < end)
    }
}

/// A catalog price: one pricing model plus its currency-specific rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: PriceId,
    pub model: PricingModel,
    pub amounts: Vec<PriceAmount>,
}

impl Price {
    pub fn new(model: PricingModel, amounts: Vec<PriceAmount>) -> Self {
        Self {
            id: PriceId::new(),
            model,
            amounts,
        }
    }

    pub fn flat(currency: Currency, unit_amount: Decimal) -> Self {
        Self::new(
            PricingModel::Flat,
            vec![PriceAmount::new(currency, unit_amount)],
        )
    }

    /// Tier layout invariant: ordered, starting at zero, contiguous up to
    /// the last defined boundary.
    pub fn validate(&self) -> Result<()> {
        let tiers = match &self.model {
            PricingModel::Tiered { tiers } | PricingModel::Volume { tiers } => tiers,
            PricingModel::Package { billing_unit, .. } => {
                if *billing_unit <= Decimal::ZERO {
                    return Err(BillingError::InvalidPriceTiers {
                        reason: "package billing_unit must be positive".to_string(),
                    });
                }
                return Ok(());
            }
            PricingModel::Flat => return Ok(()),
        };

        if tiers.is_empty() {
            return Err(BillingError::InvalidPriceTiers {
                reason: "tiered price has no tiers".to_string(),
            });
        }
        if tiers[0].start != Decimal::ZERO {
            return Err(BillingError::InvalidPriceTiers {
                reason: format!("first tier starts at {}, expected 0", tiers[0].start),
            });
        }

        for pair in tiers.windows(2) {
            let end = match pair[0].end {
                Some(end) => end,
                None => {
                    return Err(BillingError::InvalidPriceTiers {
                        reason: "only the last tier may be unbounded".to_string(),
                    })
                }
            };
            if end <= pair[0].start {
                return Err(BillingError::InvalidPriceTiers {
                    reason: format!("tier [{}, {}) is empty", pair[0].start, end),
                });
            }
            if pair[1].start != end {
                return Err(BillingError::InvalidPriceTiers {
                    reason: format!(
                        "gap or overlap between tier ending at {} and tier starting at {}",
                        end, pair[1].start
                    ),
                });
            }
        }

        Ok(())
    }

    pub fn amount_in_effect(&self, currency: &Currency, at: DateTime<Utc>) -> Result<&PriceAmount> {
        self.amounts
            .iter()
            .find(|a| a.in_effect(currency, at))
            .ok_or_else(|| BillingError::MissingPriceAmount {
                currency: currency.to_string(),
                at: at.to_rfc3339(),
            })
    }
}

/// Output of the pricing resolver for one line.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedLine {
    pub quantity: Decimal,
    /// Effective per-unit rate in minor units, for display on the line.
    pub unit_amount: Decimal,
    pub amount: Amount,
}

/// Price a resolved quantity against a price, selecting the rate in
/// effect for `currency` at `at` and prorating flat rates to `interval`.
pub fn resolve_amount(
    price: &Price,
    quantity: Decimal,
    currency: &Currency,
    at: DateTime<Utc>,
    interval: BillingInterval,
) -> Result<PricedLine> {
    if quantity < Decimal::ZERO {
        return Err(BillingError::InvalidQuantity {
            value: quantity.to_string(),
        });
    }

    match &price.model {
        PricingModel::Flat => {
            let rate = price.amount_in_effect(currency, at)?;
            let amount = Amount::round(rate.unit_amount * quantity * interval.proration_factor());
            Ok(PricedLine {
                quantity,
                unit_amount: rate.unit_amount,
                amount,
            })
        }
        PricingModel::Tiered { tiers } => {
            // The per-currency rate must exist even though tier rates are
            // used for the math; a price with no rate for the invoice
            // currency is a catalog error either way.
            price.amount_in_effect(currency, at)?;
            let amount = price_tiered(tiers, quantity)?;
            Ok(priced(quantity, amount))
        }
        PricingModel::Volume { tiers } => {
            price.amount_in_effect(currency, at)?;
            let amount = price_volume(tiers, quantity)?;
            Ok(priced(quantity, amount))
        }
        PricingModel::Package {
            billing_unit,
            billing_threshold,
        } => {
            let rate = price.amount_in_effect(currency, at)?;
            let amount = price_package(rate.unit_amount, *billing_unit, *billing_threshold, quantity)?;
            Ok(priced(quantity, amount))
        }
    }
}

fn priced(quantity: Decimal, amount: Amount) -> PricedLine {
    let unit_amount = if quantity > Decimal::ZERO {
        (amount.as_decimal() / quantity).round_dp(6)
    } else {
        Decimal::ZERO
    };
    PricedLine {
        quantity,
        unit_amount,
        amount,
    }
}

fn price_tiered(tiers: &[PriceTier], quantity: Decimal) -> Result<Amount> {
    let mut total = Amount::zero();
    for tier in tiers {
        let upper = tier.end.unwrap_or(quantity.max(tier.start));
        let in_tier = (quantity.min(upper) - tier.start).max(Decimal::ZERO);
        if in_tier.is_zero() {
            continue;
        }
        let contribution = in_tier * tier.unit_amount + Decimal::from(tier.flat_amount);
        total = total.add(Amount::round(contribution));
    }
    Ok(total)
}

fn price_volume(tiers: &[PriceTier], quantity: Decimal) -> Result<Amount> {
    let tier = tiers
        .iter()
        .find(|t| t.contains(quantity))
        .ok_or_else(|| BillingError::InvalidPriceTiers {
            reason: format!("no volume tier contains quantity {}", quantity),
        })?;
    let amount = quantity * tier.unit_amount + Decimal::from(tier.flat_amount);
    Ok(Amount::round(amount))
}

fn price_package(
    unit_amount: Decimal,
    billing_unit: Decimal,
    billing_threshold: Option<Decimal>,
    quantity: Decimal,
) -> Result<Amount> {
    if billing_unit <= Decimal::ZERO {
        return Err(BillingError::InvalidPriceTiers {
            reason: "package billing_unit must be positive".to_string(),
        });
    }

    let chargeable = match billing_threshold {
        Some(threshold) => (quantity - threshold).max(Decimal::ZERO),
        None => quantity,
    };
    if chargeable.is_zero() {
        return Ok(Amount::zero());
    }

    let packages = (chargeable / billing_unit).ceil();
    Ok(Amount::round(packages * unit_amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::IntervalUnit;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn usd() -> Currency {
        Currency::usd()
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn monthly() -> BillingInterval {
        BillingInterval::monthly()
    }

    #[test]
    fn test_flat_price_monthly() {
        let price = Price::flat(usd(), dec!(1000));
        let line = resolve_amount(&price, Decimal::ONE, &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 1000);
        assert_eq!(line.unit_amount, dec!(1000));
    }

    #[test]
    fn test_flat_price_prorated_weekly() {
        let price = Price::flat(usd(), dec!(1000));
        let weekly = BillingInterval::new(IntervalUnit::Week, 1);
        let line = resolve_amount(&price, Decimal::ONE, &usd(), now(), weekly).unwrap();
        // 1000 * 30/7 = 4285.71..., rounded half-up
        assert_eq!(line.amount.as_minor(), 4286);
    }

    #[test]
    fn test_tiered_price_partitions_quantity() {
        // First 100 units at 1 cent, remainder at 0.8 cent.
        let price = Price::new(
            PricingModel::Tiered {
                tiers: vec![
                    PriceTier::new(dec!(0), Some(dec!(100)), dec!(1)),
                    PriceTier::new(dec!(100), None, dec!(0.8)),
                ],
            },
            vec![PriceAmount::new(usd(), dec!(1))],
        );

        let line = resolve_amount(&price, dec!(150), &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 140);
    }

    #[test]
    fn test_tiered_flat_component_applied_once_reached() {
        let mut first = PriceTier::new(dec!(0), Some(dec!(10)), dec!(0));
        first.flat_amount = 500;
        let mut second = PriceTier::new(dec!(10), None, dec!(2));
        second.flat_amount = 300;

        let price = Price::new(
            PricingModel::Tiered {
                tiers: vec![first, second],
            },
            vec![PriceAmount::new(usd(), dec!(1))],
        );

        // Quantity stops inside the first tier: second flat never charged.
        let line = resolve_amount(&price, dec!(10), &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 500);

        let line = resolve_amount(&price, dec!(15), &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 500 + 5 * 2 + 300);
    }

    #[test]
    fn test_volume_price_charges_single_tier() {
        let price = Price::new(
            PricingModel::Volume {
                tiers: vec![
                    PriceTier::new(dec!(0), Some(dec!(100)), dec!(1)),
                    PriceTier::new(dec!(100), None, dec!(0.8)),
                ],
            },
            vec![PriceAmount::new(usd(), dec!(1))],
        );

        // Entire quantity priced at the containing tier, not partitioned.
        let line = resolve_amount(&price, dec!(150), &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 120);

        let line = resolve_amount(&price, dec!(50), &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 50);
    }

    #[test]
    fn test_package_price_rounds_up() {
        let price = Price::new(
            PricingModel::Package {
                billing_unit: dec!(100),
                billing_threshold: None,
            },
            vec![PriceAmount::new(usd(), dec!(250))],
        );

        let line = resolve_amount(&price, dec!(101), &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 500);

        let line = resolve_amount(&price, dec!(100), &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 250);

        let line = resolve_amount(&price, dec!(0), &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 0);
    }

    #[test]
    fn test_package_threshold_zero_rates_floor() {
        let price = Price::new(
            PricingModel::Package {
                billing_unit: dec!(10),
                billing_threshold: Some(dec!(50)),
            },
            vec![PriceAmount::new(usd(), dec!(100))],
        );

        let line = resolve_amount(&price, dec!(50), &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 0);

        let line = resolve_amount(&price, dec!(75), &usd(), now(), monthly()).unwrap();
        assert_eq!(line.amount.as_minor(), 300);
    }

    #[test]
    fn test_missing_price_amount() {
        let price = Price::flat(Currency::new("EUR"), dec!(1000));
        let err = resolve_amount(&price, Decimal::ONE, &usd(), now(), monthly()).unwrap_err();
        assert!(matches!(err, BillingError::MissingPriceAmount { .. }));
    }

    #[test]
    fn test_time_bounded_amount_selection() {
        let past = now() - chrono::Duration::days(60);
        let cutover = now() - chrono::Duration::days(30);

        let old_rate = PriceAmount {
            currency: usd(),
            unit_amount: dec!(500),
            valid_from: Some(past),
            valid_until: Some(cutover),
        };
        let new_rate = PriceAmount {
            currency: usd(),
            unit_amount: dec!(750),
            valid_from: Some(cutover),
            valid_until: None,
        };
        let price = Price::new(PricingModel::Flat, vec![old_rate, new_rate]);

        let before = resolve_amount(&price, Decimal::ONE, &usd(), cutover - chrono::Duration::days(1), monthly()).unwrap();
        assert_eq!(before.amount.as_minor(), 500);

        let after = resolve_amount(&price, Decimal::ONE, &usd(), now(), monthly()).unwrap();
        assert_eq!(after.amount.as_minor(), 750);
    }

    #[test]
    fn test_negative_quantity_rejected() {
        let price = Price::flat(usd(), dec!(1000));
        let err = resolve_amount(&price, dec!(-1), &usd(), now(), monthly()).unwrap_err();
        assert!(matches!(err, BillingError::InvalidQuantity { .. }));
    }

    #[test]
    fn test_tier_validation() {
        let overlapping = Price::new(
            PricingModel::Tiered {
                tiers: vec![
                    PriceTier::new(dec!(0), Some(dec!(100)), dec!(1)),
                    PriceTier::new(dec!(90), None, dec!(0.8)),
                ],
            },
            vec![PriceAmount::new(usd(), dec!(1))],
        );
        assert!(overlapping.validate().is_err());

        let gap = Price::new(
            PricingModel::Tiered {
                tiers: vec![
                    PriceTier::new(dec!(0), Some(dec!(100)), dec!(1)),
                    PriceTier::new(dec!(150), None, dec!(0.8)),
                ],
            },
            vec![PriceAmount::new(usd(), dec!(1))],
        );
        assert!(gap.validate().is_err());

        let valid = Price::new(
            PricingModel::Tiered {
                tiers: vec![
                    PriceTier::new(dec!(0), Some(dec!(100)), dec!(1)),
                    PriceTier::new(dec!(100), None, dec!(0.8)),
                ],
            },
            vec![PriceAmount::new(usd(), dec!(1))],
        );
        valid.validate().unwrap();
    }

    proptest! {
        /// Tiered pricing partitions the quantity exactly: below the
        /// boundary it equals the first-tier rate, above it the two tier
        /// contributions sum, each rounded half-up on its own.
        #[test]
        fn prop_tiered_partition_matches_manual_sum(quantity in 0u32..100_000) {
            let tiers = vec![
                PriceTier::new(dec!(0), Some(dec!(100)), dec!(1)),
                PriceTier::new(dec!(100), None, dec!(0.8)),
            ];
            let quantity = Decimal::from(quantity);
            let amount = price_tiered(&tiers, quantity).unwrap();

            let first = quantity.min(dec!(100));
            let second = (quantity - dec!(100)).max(Decimal::ZERO);
            let expected = Amount::round(first * dec!(1)).as_minor()
                + Amount::round(second * dec!(0.8)).as_minor();
            prop_assert_eq!(amount.as_minor(), expected);
        }

        /// Tiered amounts never decrease as usage grows.
        #[test]
        fn prop_tiered_amount_is_monotonic(a in 0u32..50_000, b in 0u32..50_000) {
            let tiers = vec![
                PriceTier::new(dec!(0), Some(dec!(100)), dec!(1)),
                PriceTier::new(dec!(100), None, dec!(0.8)),
            ];
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let low = price_tiered(&tiers, Decimal::from(low)).unwrap();
            let high = price_tiered(&tiers, Decimal::from(high)).unwrap();
            prop_assert!(low.as_minor() <= high.as_minor());
        }
    }
}
