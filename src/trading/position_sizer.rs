//! Risk-based order sizing under margin and exchange constraints.

use rust_decimal::Decimal;
use tracing::{debug, info};

use super::config::AccountConfig;
use crate::models::SizingMode;

/// A constraint that changed the raw quantity.
#[derive(Debug, Clone, PartialEq)]
pub enum SizingAdjustment {
    /// Notional was below the exchange minimum
    RaisedToMinimum { from: Decimal, to: Decimal },
    /// Required margin exceeded the per-position cap
    MarginCapped { from: Decimal, to: Decimal },
    /// Rounded down to the quantity step
    Rounded { from: Decimal, to: Decimal },
}

/// Why no order could be sized.
#[derive(Debug, Clone, PartialEq)]
pub enum SizingRejection {
    InvalidInput(String),
    /// Existing margin already consumes the cap
    NoMarginAvailable,
    /// Rounding left nothing to trade
    ZeroQuantity,
}

impl std::fmt::Display for SizingRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid sizing input: {}", msg),
            Self::NoMarginAvailable => write!(f, "no margin available under the cap"),
            Self::ZeroQuantity => write!(f, "quantity rounds to zero"),
        }
    }
}

/// Concrete order size.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub quantity: Decimal,
    pub notional: Decimal,
    pub required_margin: Decimal,
    pub adjustments: Vec<SizingAdjustment>,
}

/// Converts signals into quantities.
#[derive(Debug, Clone)]
pub struct RiskSizer {
    config: AccountConfig,
}

impl RiskSizer {
    pub fn new(config: AccountConfig) -> Self {
        Self { config }
    }

    pub fn leverage(&self) -> u32 {
        self.config.leverage
    }

    /// Largest margin one position may lock.
    pub fn margin_cap(&self, equity: Decimal) -> Decimal {
        equity * self.config.max_margin_ratio
    }

    /// Size a new position.
    ///
    /// Risk-percent: equity x risk / |entry - stop|. Fixed-notional:
    /// configured notional / entry. Then minimum notional, margin cap and
    /// quantity step are applied in that order, so the cap always binds.
    pub fn size(
        &self,
        mode: SizingMode,
        entry: Decimal,
        stop: Decimal,
        equity: Decimal,
    ) -> Result<SizedOrder, SizingRejection> {
        if entry <= Decimal::ZERO {
            return Err(SizingRejection::InvalidInput(format!("entry {}", entry)));
        }
        if equity <= Decimal::ZERO {
            return Err(SizingRejection::InvalidInput(format!("equity {}", equity)));
        }

        let raw = match mode {
            SizingMode::RiskPercent => {
                let distance = (entry - stop).abs();
                if distance.is_zero() {
                    return Err(SizingRejection::InvalidInput(
                        "stop equals entry".to_string(),
                    ));
                }
                equity * self.config.risk_per_trade / distance
            }
            SizingMode::FixedNotional => self.config.fixed_notional / entry,
        };

        self.constrain(raw, entry, equity, Decimal::ZERO)
    }

    /// Size a pyramid add against the margin already held by the position.
    pub fn size_add(
        &self,
        desired: Decimal,
        price: Decimal,
        equity: Decimal,
        existing_margin: Decimal,
    ) -> Result<SizedOrder, SizingRejection> {
        if price <= Decimal::ZERO || desired <= Decimal::ZERO {
            return Err(SizingRejection::InvalidInput(format!(
                "add of {} at {}",
                desired, price
            )));
        }
        self.constrain(desired, price, equity, existing_margin)
    }

    fn constrain(
        &self,
        raw: Decimal,
        price: Decimal,
        equity: Decimal,
        existing_margin: Decimal,
    ) -> Result<SizedOrder, SizingRejection> {
        let leverage = Decimal::from(self.config.leverage.max(1));
        let step = self.config.quantity_step;
        let mut adjustments = Vec::new();
        let mut quantity = raw;

        // (1) exchange minimum notional
        if quantity * price < self.config.min_notional {
            let raised = ceil_to_step(self.config.min_notional / price, step);
            adjustments.push(SizingAdjustment::RaisedToMinimum {
                from: quantity,
                to: raised,
            });
            quantity = raised;
        }

        // (2) margin cap, shrink rather than cancel
        let cap = self.margin_cap(equity) - existing_margin;
        if cap <= Decimal::ZERO {
            return Err(SizingRejection::NoMarginAvailable);
        }
        let margin = quantity * price / leverage;
        if margin > cap {
            let capped = cap * leverage / price;
            adjustments.push(SizingAdjustment::MarginCapped {
                from: quantity,
                to: capped,
            });
            quantity = capped;
        }

        // (3) quantity step
        let rounded = floor_to_step(quantity, step);
        if rounded != quantity {
            adjustments.push(SizingAdjustment::Rounded {
                from: quantity,
                to: rounded,
            });
        }
        if rounded <= Decimal::ZERO {
            return Err(SizingRejection::ZeroQuantity);
        }

        let notional = rounded * price;
        let order = SizedOrder {
            quantity: rounded,
            notional,
            required_margin: notional / leverage,
            adjustments,
        };

        for adj in &order.adjustments {
            match adj {
                SizingAdjustment::Rounded { .. } => debug!(adjustment = ?adj, "Sizing adjusted"),
                _ => info!(adjustment = ?adj, "Sizing adjusted"),
            }
        }
        Ok(order)
    }
}

fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

fn ceil_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).ceil() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sizer(leverage: u32) -> RiskSizer {
        RiskSizer::new(AccountConfig {
            leverage,
            risk_per_trade: dec!(0.01),
            max_margin_ratio: dec!(0.20),
            ..Default::default()
        })
    }

    #[test]
    fn test_risk_percent_accepted_unmodified() {
        let order = sizer(10)
            .size(SizingMode::RiskPercent, dec!(100), dec!(98), dec!(1000))
            .unwrap();

        assert_eq!(order.quantity, dec!(5));
        assert_eq!(order.required_margin, dec!(50));
        assert!(order.adjustments.is_empty());
    }

    #[test]
    fn test_margin_cap_shrinks_instead_of_rejecting() {
        let order = sizer(2)
            .size(SizingMode::RiskPercent, dec!(100), dec!(98), dec!(1000))
            .unwrap();

        assert_eq!(order.quantity, dec!(4));
        assert_eq!(order.required_margin, dec!(200));
        assert!(matches!(
            order.adjustments[0],
            SizingAdjustment::MarginCapped { .. }
        ));
    }

    #[test]
    fn test_sizing_is_deterministic() {
        let s = sizer(3);
        let a = s.size(SizingMode::RiskPercent, dec!(27123.4), dec!(26890.1), dec!(1543.21));
        let b = s.size(SizingMode::RiskPercent, dec!(27123.4), dec!(26890.1), dec!(1543.21));
        assert_eq!(a, b);
    }

    #[test]
    fn test_margin_bound_holds() {
        let equity = dec!(1000);
        for leverage in [1u32, 2, 3, 5, 10, 20] {
            for stop in [dec!(99.9), dec!(99), dec!(97), dec!(90)] {
                let s = sizer(leverage);
                if let Ok(order) = s.size(SizingMode::RiskPercent, dec!(100), stop, equity) {
                    assert!(
                        order.required_margin <= s.margin_cap(equity),
                        "leverage {} stop {} margin {}",
                        leverage,
                        stop,
                        order.required_margin
                    );
                }
            }
        }
    }

    #[test]
    fn test_fixed_notional_raised_to_minimum() {
        let s = RiskSizer::new(AccountConfig {
            fixed_notional: dec!(2),
            min_notional: dec!(5),
            ..Default::default()
        });
        let order = s
            .size(SizingMode::FixedNotional, dec!(3), dec!(2.9), dec!(1000))
            .unwrap();

        // 5 / 3 = 1.6666.. ceiled to the step
        assert_eq!(order.quantity, dec!(1.667));
        assert!(order.notional >= dec!(5));
    }

    #[test]
    fn test_rejects_zero_after_rounding() {
        let s = RiskSizer::new(AccountConfig {
            quantity_step: dec!(1),
            min_notional: Decimal::ZERO,
            ..Default::default()
        });
        // Margin cap of 200 at 5x buys 0.01 of a 100k asset, which rounds to 0
        let result = s.size(SizingMode::RiskPercent, dec!(100000), dec!(99000), dec!(1000));
        assert_eq!(result, Err(SizingRejection::ZeroQuantity));
    }

    #[test]
    fn test_add_respects_existing_margin() {
        let s = sizer(10);
        // Cap 200, 180 already used: at most 20 margin = 200 notional = 2 units
        let order = s
            .size_add(dec!(5), dec!(100), dec!(1000), dec!(180))
            .unwrap();
        assert_eq!(order.quantity, dec!(2));

        assert_eq!(
            s.size_add(dec!(1), dec!(100), dec!(1000), dec!(200)),
            Err(SizingRejection::NoMarginAvailable)
        );
    }
}
