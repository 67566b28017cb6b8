//! Invoice money math.
//!
//! All arithmetic is done in `Decimal`; nothing in this module touches
//! floats. Each line is priced independently: the line subtotal and tax are
//! rounded to two decimal places first, and invoice totals are sums of those
//! already-rounded line amounts. Rounding is banker's rounding (round half
//! to even), which is what `Decimal::round_dp` does by default.

use crate::models::LineItemInput;
use rust_decimal::Decimal;

const MONEY_DP: u32 = 2;

/// Priced amounts for a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemAmounts {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

/// A line item together with its computed amounts, ready for persistence.
#[derive(Debug, Clone)]
pub struct PricedItem {
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub tax_rate: Option<Decimal>,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

/// Invoice-level totals plus the priced lines they were aggregated from.
#[derive(Debug, Clone)]
pub struct PricedInvoice {
    pub subtotal: Decimal,
    pub tax_total: Decimal,
    pub total: Decimal,
    pub items: Vec<PricedItem>,
}

/// Price a single line. Tax is a percentage of the rounded line subtotal; a
/// missing or zero rate yields zero tax rather than an error.
pub fn item_amounts(quantity: i32, unit_price: Decimal, tax_rate: Option<Decimal>) -> ItemAmounts {
    let subtotal = (unit_price * Decimal::from(quantity)).round_dp(MONEY_DP);

    let tax_amount = match tax_rate {
        Some(rate) if !rate.is_zero() => {
            (subtotal * rate / Decimal::ONE_HUNDRED).round_dp(MONEY_DP)
        }
        _ => Decimal::ZERO,
    };

    ItemAmounts {
        subtotal,
        tax_amount,
        total: subtotal + tax_amount,
    }
}

/// Price every line and aggregate. Totals are sums of the per-line rounded
/// amounts, so they never pick up sub-cent residue.
pub fn price_invoice(items: &[LineItemInput]) -> PricedInvoice {
    let mut priced = Vec::with_capacity(items.len());
    let mut subtotal = Decimal::ZERO;
    let mut tax_total = Decimal::ZERO;

    for item in items {
        let amounts = item_amounts(item.quantity, item.unit_price, item.tax_rate);
        subtotal += amounts.subtotal;
        tax_total += amounts.tax_amount;
        priced.push(PricedItem {
            description: item.description.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            tax_rate: item.tax_rate,
            subtotal: amounts.subtotal,
            tax_amount: amounts.tax_amount,
            total: amounts.total,
        });
    }

    PricedInvoice {
        subtotal,
        tax_total,
        total: subtotal + tax_total,
        items: priced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn line(quantity: i32, unit_price: &str, tax_rate: Option<&str>) -> LineItemInput {
        LineItemInput {
            description: "Test line".to_string(),
            quantity,
            unit_price: dec(unit_price),
            tax_rate: tax_rate.map(dec),
        }
    }

    #[test]
    fn mixed_tax_invoice_totals() {
        let priced = price_invoice(&[
            line(2, "10.00", None),
            line(1, "33.33", Some("7.25")),
        ]);

        assert_eq!(priced.items[0].subtotal, dec("20.00"));
        assert_eq!(priced.items[0].tax_amount, Decimal::ZERO);
        assert_eq!(priced.items[1].subtotal, dec("33.33"));
        // 33.33 * 7.25% = 2.416425, rounds to 2.42
        assert_eq!(priced.items[1].tax_amount, dec("2.42"));

        assert_eq!(priced.subtotal, dec("53.33"));
        assert_eq!(priced.tax_total, dec("2.42"));
        assert_eq!(priced.total, dec("55.75"));
    }

    #[test]
    fn taxed_line_totals_include_the_tax() {
        let priced = price_invoice(&[line(2, "10.00", Some("10"))]);

        assert_eq!(priced.subtotal, dec("20.00"));
        assert_eq!(priced.tax_total, dec("2.00"));
        assert_eq!(priced.total, dec("22.00"));
    }

    #[test]
    fn zero_and_missing_tax_rate_yield_zero_tax() {
        assert_eq!(item_amounts(3, dec("9.99"), None).tax_amount, Decimal::ZERO);
        assert_eq!(
            item_amounts(3, dec("9.99"), Some(Decimal::ZERO)).tax_amount,
            Decimal::ZERO
        );
    }

    #[test]
    fn half_cent_tax_rounds_to_even() {
        // 10.00 * 1.25% = 0.125 -> 0.12, 30.00 * 1.25% = 0.375 -> 0.38
        assert_eq!(item_amounts(1, dec("10.00"), Some(dec("1.25"))).tax_amount, dec("0.12"));
        assert_eq!(item_amounts(1, dec("30.00"), Some(dec("1.25"))).tax_amount, dec("0.38"));
    }

    #[test]
    fn zero_quantity_line_is_free() {
        let amounts = item_amounts(0, dec("100.00"), Some(dec("20.00")));
        assert_eq!(amounts.subtotal, Decimal::ZERO);
        assert_eq!(amounts.tax_amount, Decimal::ZERO);
        assert_eq!(amounts.total, Decimal::ZERO);
    }

    #[test]
    fn empty_invoice_totals_are_zero() {
        let priced = price_invoice(&[]);
        assert_eq!(priced.subtotal, Decimal::ZERO);
        assert_eq!(priced.tax_total, Decimal::ZERO);
        assert_eq!(priced.total, Decimal::ZERO);
        assert!(priced.items.is_empty());
    }

    #[test]
    fn totals_are_sums_of_rounded_line_amounts() {
        let mut rng = rand::thread_rng();

        for _ in 0..100 {
            let items: Vec<LineItemInput> = (0..rng.gen_range(1..8))
                .map(|_| {
                    let cents: i64 = rng.gen_range(0..100_000);
                    let tax_rate = if rng.gen_bool(0.5) {
                        Some(Decimal::new(rng.gen_range(0..3_000), 2))
                    } else {
                        None
                    };
                    LineItemInput {
                        description: "Random line".to_string(),
                        quantity: rng.gen_range(0..10),
                        unit_price: Decimal::new(cents, 2),
                        tax_rate,
                    }
                })
                .collect();

            let priced = price_invoice(&items);

            let mut subtotal = Decimal::ZERO;
            let mut tax_total = Decimal::ZERO;
            for item in &priced.items {
                // Every stored amount must already be exact at two decimals.
                assert_eq!(item.subtotal.round_dp(2), item.subtotal);
                assert_eq!(item.tax_amount.round_dp(2), item.tax_amount);
                assert_eq!(item.total, item.subtotal + item.tax_amount);
                subtotal += item.subtotal;
                tax_total += item.tax_amount;
            }

            assert_eq!(priced.subtotal, subtotal);
            assert_eq!(priced.tax_total, tax_total);
            assert_eq!(priced.total, subtotal + tax_total);
        }
    }
}
