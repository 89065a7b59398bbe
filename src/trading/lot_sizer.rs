//! Lot sizing: turns a master volume into a slave volume.
//!
//! All functions are pure, so the same inputs always size the same order.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::SizingError;
use crate::models::{LotMode, SlaveConfig};

/// Volume before bounds and rounding.
pub fn raw_volume(
    master_volume: Decimal,
    master_balance: Decimal,
    slave_balance: Decimal,
    config: &SlaveConfig,
) -> Result<Decimal, SizingError> {
    match config.lot_mode {
        LotMode::Exact => Ok(master_volume),
        LotMode::Fixed => Ok(config.lot_value),
        LotMode::Multiplier => Ok(master_volume * config.lot_value),
        LotMode::Proportional => {
            if master_balance <= Decimal::ZERO {
                return Err(SizingError::InvalidRatio);
            }
            Ok(master_volume * slave_balance / master_balance)
        }
    }
}

/// Final slave volume: clamp to `[min_lot, max_lot]`, round to `lot_step`,
/// clamp again so rounding never leaves the bounds.
pub fn compute_slave_volume(
    master_volume: Decimal,
    master_balance: Decimal,
    slave_balance: Decimal,
    config: &SlaveConfig,
    lot_step: Decimal,
) -> Result<Decimal, SizingError> {
    if config.min_lot > config.max_lot {
        return Err(SizingError::InvalidBounds(format!(
            "min_lot {} > max_lot {}",
            config.min_lot, config.max_lot
        )));
    }
    if lot_step <= Decimal::ZERO {
        return Err(SizingError::InvalidBounds(format!(
            "lot step {} must be positive",
            lot_step
        )));
    }

    let raw = raw_volume(master_volume, master_balance, slave_balance, config)?;
    let clamped = raw.max(config.min_lot).min(config.max_lot);
    let rounded = round_to_step(clamped, lot_step);

    // Rounding can push below min_lot or above max_lot; step back inside
    let mut volume = rounded;
    if volume > config.max_lot {
        volume -= lot_step;
    }
    if volume < config.min_lot {
        volume += lot_step;
    }
    let volume = volume.max(config.min_lot).min(config.max_lot).normalize();

    if volume <= Decimal::ZERO {
        return Err(SizingError::ZeroVolume);
    }
    Ok(volume)
}

/// Slave volume to close when the master closed `closed_volume` out of
/// `original_volume`: proportional, rounded to the step, at least one step
/// and never more than `slave_volume`. A result equal to `slave_volume`
/// means a full close.
pub fn partial_close_volume(
    closed_volume: Decimal,
    original_volume: Decimal,
    slave_volume: Decimal,
    lot_step: Decimal,
) -> Decimal {
    if original_volume <= Decimal::ZERO || closed_volume >= original_volume {
        return slave_volume;
    }

    let proportional = slave_volume * closed_volume / original_volume;
    let rounded = if lot_step > Decimal::ZERO {
        round_to_step(proportional, lot_step).max(lot_step)
    } else {
        proportional
    };

    rounded.min(slave_volume).normalize()
}

fn round_to_step(volume: Decimal, step: Decimal) -> Decimal {
    let steps = (volume / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    steps * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionDescriptor;
    use rust_decimal_macros::dec;

    fn config(mode: LotMode, value: Decimal, min: Decimal, max: Decimal) -> SlaveConfig {
        let mut config = SlaveConfig::new("s1", ConnectionDescriptor::default());
        config.lot_mode = mode;
        config.lot_value = value;
        config.min_lot = min;
        config.max_lot = max;
        config
    }

    #[test]
    fn test_multiplier_is_clamped() {
        let config = config(LotMode::Multiplier, dec!(2), dec!(0.01), dec!(0.5));
        let raw = raw_volume(dec!(1.0), dec!(10000), dec!(2000), &config).unwrap();
        assert_eq!(raw, dec!(2.0));

        let volume = compute_slave_volume(dec!(1.0), dec!(10000), dec!(2000), &config, dec!(0.01)).unwrap();
        assert_eq!(volume, dec!(0.5));
    }

    #[test]
    fn test_proportional() {
        let config = config(LotMode::Proportional, dec!(1), dec!(0.01), dec!(10));
        let volume = compute_slave_volume(dec!(1.0), dec!(10000), dec!(2000), &config, dec!(0.01)).unwrap();
        assert_eq!(volume, dec!(0.2));

        assert_eq!(
            compute_slave_volume(dec!(1.0), Decimal::ZERO, dec!(2000), &config, dec!(0.01)),
            Err(SizingError::InvalidRatio)
        );
    }

    #[test]
    fn test_exact_and_fixed() {
        let exact = config(LotMode::Exact, dec!(1), dec!(0.01), dec!(10));
        assert_eq!(
            compute_slave_volume(dec!(0.37), dec!(1), dec!(1), &exact, dec!(0.01)).unwrap(),
            dec!(0.37)
        );

        let fixed = config(LotMode::Fixed, dec!(0.3), dec!(0.01), dec!(10));
        assert_eq!(
            compute_slave_volume(dec!(5), dec!(1), dec!(1), &fixed, dec!(0.01)).unwrap(),
            dec!(0.3)
        );
    }

    #[test]
    fn test_rounding_stays_in_bounds() {
        // 0.017 rounds to 0.02 with step 0.01, which is above max_lot 0.015
        let config = config(LotMode::Exact, dec!(1), dec!(0.001), dec!(0.015));
        let volume = compute_slave_volume(dec!(0.017), dec!(1), dec!(1), &config, dec!(0.01)).unwrap();
        assert!(volume >= config.min_lot && volume <= config.max_lot);

        let coarse = config.clone();
        for master in [dec!(0.001), dec!(0.25), dec!(3), dec!(100)] {
            let first = compute_slave_volume(master, dec!(1), dec!(1), &coarse, dec!(0.01)).unwrap();
            let second = compute_slave_volume(master, dec!(1), dec!(1), &coarse, dec!(0.01)).unwrap();
            assert_eq!(first, second);
            assert!(first >= coarse.min_lot && first <= coarse.max_lot);
        }
    }

    #[test]
    fn test_zero_volume() {
        let config = config(LotMode::Exact, dec!(1), Decimal::ZERO, dec!(10));
        assert_eq!(
            compute_slave_volume(dec!(0.001), dec!(1), dec!(1), &config, dec!(0.01)),
            Err(SizingError::ZeroVolume)
        );
    }

    #[test]
    fn test_partial_close_volume() {
        assert_eq!(partial_close_volume(dec!(0.5), dec!(1.0), dec!(0.4), dec!(0.01)), dec!(0.2));
        // Rounds up to at least one step
        assert_eq!(partial_close_volume(dec!(0.01), dec!(1.0), dec!(0.1), dec!(0.01)), dec!(0.01));
        // Whole master volume means whole slave volume
        assert_eq!(partial_close_volume(dec!(1.0), dec!(1.0), dec!(0.4), dec!(0.01)), dec!(0.4));
        // Never more than the slave holds
        assert_eq!(partial_close_volume(dec!(0.9), dec!(1.0), dec!(0.01), dec!(0.01)), dec!(0.01));
    }
}
