use rust_decimal::Decimal;

/// Flat proportional taker fee applied to both the opening cost and the
/// closing exit value (§4.5 steps 6-7). Default 4 bp (0.0004).
#[derive(Debug, Clone, Copy)]
pub struct FeeModel {
    pub fee_rate: Decimal,
}

impl FeeModel {
    pub fn new(fee_rate: Decimal) -> Self {
        Self { fee_rate }
    }

    pub fn fee_on(&self, notional: Decimal) -> Decimal {
        notional * self.fee_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fee_on_notional_matches_scenario_1() {
        let model = FeeModel::new(dec!(0.0004));
        // 16.670 * 120 = 2000.40, fee = 0.80016 -> matches spec's 0.80 after rounding display
        let notional = dec!(16.670) * dec!(120);
        assert_eq!(model.fee_on(notional), dec!(0.800160));
    }
}
