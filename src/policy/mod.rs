use serde::{Deserialize, Serialize};

use crate::ledger::Amount;

/// Base units per whole token for an 18-decimal reward token.
pub const WEI_PER_TOKEN: Amount = 1_000_000_000_000_000_000;

pub const DEFAULT_XP_DIVISOR: u128 = 100;
pub const DEFAULT_LESSON_CAP: Amount = 1;
pub const DEFAULT_MODULE_BONUS: Amount = 10;
/// Base units per token for vaults created from the command line.
pub const DEFAULT_UNIT: Amount = WEI_PER_TOKEN;

/// Fixed reward constants of a vault. Set once when the vault is created.
///
/// A lesson pays `min(lesson_cap, xp * unit / xp_divisor)`; a module pays
/// `module_bonus`. All amounts are in base units.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardPolicy {
    pub xp_divisor: u128,
    pub lesson_cap: Amount,
    pub module_bonus: Amount,
    pub unit: Amount,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("xp divisor must be > 0")]
    ZeroDivisor,
    #[error("unit must be > 0")]
    ZeroUnit,
    #[error("lesson cap {cap} is too large for divisor {divisor}")]
    CapTooLarge { cap: Amount, divisor: u128 },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenAmountError {
    #[error("{0:?} is not a token amount")]
    Invalid(String),
    #[error("{0:?} is finer than one base unit")]
    TooPrecise(String),
    #[error("{0:?} overflows base units")]
    Overflow(String),
    #[error("unit must be > 0")]
    ZeroUnit,
}

/// Parses a decimal token amount (`"10"`, `"0.5"`) into base units of a
/// token with `unit` base units per whole token.
pub fn parse_tokens(text: &str, unit: Amount) -> Result<Amount, TokenAmountError> {
    if unit == 0 {
        return Err(TokenAmountError::ZeroUnit);
    }
    let text = text.trim();
    let invalid = || TokenAmountError::Invalid(text.to_string());
    let overflow = || TokenAmountError::Overflow(text.to_string());
    let (whole, frac) = match text.split_once('.') {
        Some((whole, frac)) => (whole, Some(frac)),
        None => (text, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(whole) {
        return Err(invalid());
    }
    let whole: Amount = whole.parse().map_err(|_| overflow())?;
    let mut amount = whole.checked_mul(unit).ok_or_else(overflow)?;

    if let Some(frac) = frac {
        if !digits(frac) {
            return Err(invalid());
        }
        let frac = frac.trim_end_matches('0');
        if !frac.is_empty() {
            let too_precise = || TokenAmountError::TooPrecise(text.to_string());
            let scale = u32::try_from(frac.len())
                .ok()
                .and_then(|len| 10u128.checked_pow(len))
                .ok_or_else(too_precise)?;
            let numer: Amount = frac.parse().map_err(|_| too_precise())?;
            let scaled = numer.checked_mul(unit).ok_or_else(overflow)?;
            if scaled % scale != 0 {
                return Err(too_precise());
            }
            amount = amount.checked_add(scaled / scale).ok_or_else(overflow)?;
        }
    }
    Ok(amount)
}

/// Renders base units as tokens. Units that are a power of ten print as a
/// decimal; any other unit prints a remainder as `whole rem/unit`.
pub fn format_tokens(amount: Amount, unit: Amount) -> String {
    if unit == 0 {
        return amount.to_string();
    }
    let (whole, rem) = (amount / unit, amount % unit);
    if rem == 0 {
        return whole.to_string();
    }
    match decimals(unit) {
        Some(places) => {
            let frac = format!("{rem:0width$}", width = places as usize);
            format!("{whole}.{}", frac.trim_end_matches('0'))
        }
        None => format!("{whole} {rem}/{unit}"),
    }
}

fn decimals(unit: Amount) -> Option<u32> {
    let mut places = 0;
    let mut rest = unit;
    while rest > 1 {
        if rest % 10 != 0 {
            return None;
        }
        rest /= 10;
        places += 1;
    }
    Some(places)
}

/// Whole-token constants (`unit = 1`). The CLI uses `scaled(DEFAULT_UNIT)`.
impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            xp_divisor: DEFAULT_XP_DIVISOR,
            lesson_cap: DEFAULT_LESSON_CAP,
            module_bonus: DEFAULT_MODULE_BONUS,
            unit: 1,
        }
    }
}

impl RewardPolicy {
    /// Default constants expressed in base units of a token with `unit`
    /// base units per whole token.
    pub fn scaled(unit: Amount) -> Self {
        Self {
            xp_divisor: DEFAULT_XP_DIVISOR,
            lesson_cap: DEFAULT_LESSON_CAP.saturating_mul(unit),
            module_bonus: DEFAULT_MODULE_BONUS.saturating_mul(unit),
            unit,
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.xp_divisor == 0 {
            return Err(PolicyError::ZeroDivisor);
        }
        if self.unit == 0 {
            return Err(PolicyError::ZeroUnit);
        }
        if self.lesson_cap.checked_mul(self.xp_divisor).is_none() {
            return Err(PolicyError::CapTooLarge {
                cap: self.lesson_cap,
                divisor: self.xp_divisor,
            });
        }
        Ok(())
    }

    /// Capped lesson reward for `xp`. Never exceeds `lesson_cap`, however
    /// large `xp` is.
    pub fn lesson_reward(&self, xp: u128) -> Amount {
        match xp.checked_mul(self.unit) {
            Some(scaled) => (scaled / self.xp_divisor).min(self.lesson_cap),
            // xp * unit > u128::MAX >= lesson_cap * xp_divisor (see validate)
            None => self.lesson_cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lesson_reward_is_capped() {
        let policy = RewardPolicy::default();
        assert_eq!(policy.lesson_reward(1_000), 1);
        assert_eq!(policy.lesson_reward(250), 1);
        assert_eq!(policy.lesson_reward(100), 1);
        assert_eq!(policy.lesson_reward(99), 0);
        assert_eq!(policy.lesson_reward(u128::MAX), 1);
    }

    #[test]
    fn scaled_policy_pays_fractions_of_a_token() {
        let policy = RewardPolicy::scaled(WEI_PER_TOKEN);
        policy.validate().unwrap();
        assert_eq!(policy.lesson_reward(50), WEI_PER_TOKEN / 2);
        assert_eq!(policy.lesson_reward(250), WEI_PER_TOKEN);
        assert_eq!(policy.module_bonus, 10 * WEI_PER_TOKEN);
        assert_eq!(policy.lesson_reward(u128::MAX), WEI_PER_TOKEN);
    }

    #[test]
    fn default_unit_pays_sub_token_lessons() {
        let policy = RewardPolicy::scaled(DEFAULT_UNIT);
        policy.validate().unwrap();
        assert!(policy.lesson_reward(40) > 0);
        assert_eq!(
            policy.lesson_reward(40),
            parse_tokens("0.4", DEFAULT_UNIT).unwrap()
        );
        assert_eq!(format_tokens(policy.lesson_reward(40), DEFAULT_UNIT), "0.4");
        assert_eq!(format_tokens(policy.module_bonus, DEFAULT_UNIT), "10");
    }

    #[test]
    fn token_amounts_scale_by_unit() {
        assert_eq!(parse_tokens("10", WEI_PER_TOKEN), Ok(10 * WEI_PER_TOKEN));
        assert_eq!(parse_tokens("0.5", WEI_PER_TOKEN), Ok(WEI_PER_TOKEN / 2));
        assert_eq!(parse_tokens("1.250", 1_000), Ok(1_250));
        assert_eq!(parse_tokens("3", 1), Ok(3));
        assert_eq!(parse_tokens("2.0", 1), Ok(2));
        assert_eq!(
            parse_tokens("0.5", 1),
            Err(TokenAmountError::TooPrecise("0.5".into()))
        );
        assert_eq!(
            parse_tokens("0.0000000000000000001", WEI_PER_TOKEN),
            Err(TokenAmountError::TooPrecise("0.0000000000000000001".into()))
        );
        for bad in ["", ".5", "1.", "-1", "1e3", "0x10"] {
            assert_eq!(
                parse_tokens(bad, WEI_PER_TOKEN),
                Err(TokenAmountError::Invalid(bad.into()))
            );
        }
        assert!(matches!(
            parse_tokens("1000000000000000000000", WEI_PER_TOKEN),
            Err(TokenAmountError::Overflow(_))
        ));
        assert_eq!(parse_tokens("1", 0), Err(TokenAmountError::ZeroUnit));
    }

    #[test]
    fn token_amounts_render_without_trailing_zeros() {
        assert_eq!(format_tokens(WEI_PER_TOKEN / 2, WEI_PER_TOKEN), "0.5");
        assert_eq!(format_tokens(WEI_PER_TOKEN + 5, WEI_PER_TOKEN), "1.000000000000000005");
        assert_eq!(format_tokens(7, 1), "7");
        assert_eq!(format_tokens(7, 3), "2 1/3");
        assert_eq!(format_tokens(0, WEI_PER_TOKEN), "0");
    }

    #[test]
    fn validate_rejects_degenerate_constants() {
        let mut policy = RewardPolicy::default();
        policy.xp_divisor = 0;
        assert_eq!(policy.validate(), Err(PolicyError::ZeroDivisor));

        let mut policy = RewardPolicy::default();
        policy.unit = 0;
        assert_eq!(policy.validate(), Err(PolicyError::ZeroUnit));

        let mut policy = RewardPolicy::default();
        policy.lesson_cap = u128::MAX;
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::CapTooLarge { .. })
        ));
    }
}
