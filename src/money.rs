//! Exact money arithmetic
//!
//! All amounts in the billing engine flow through [`Money`], a thin wrapper over
//! `rust_decimal::Decimal`. Addition and subtraction are exact; division rounds
//! to [`DIVISION_SCALE`] decimal places, which is the only place precision is
//! ever dropped.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

/// Decimal places kept after a division
pub const DIVISION_SCALE: u32 = 16;

const ONE_HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Monetary amount with exact decimal semantics
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
    sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Wrap a decimal without rounding
    pub fn from_decimal(d: Decimal) -> Self {
        Money(d)
    }

    /// Parse from a decimal string, keeping every digit the caller supplied
    pub fn from_str_exact(s: &str) -> Result<Self, rust_decimal::Error> {
        Ok(Money(Decimal::from_str_exact(s.trim())?))
    }

    /// Create from a whole amount
    pub fn from_major(amount: i64) -> Self {
        Money(Decimal::from(amount))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Strictly greater than zero
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Strictly less than zero
    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    /// `self * rate / 100`, `None` on overflow
    pub fn checked_percentage(&self, rate: Decimal) -> Option<Self> {
        self.0
            .checked_mul(rate)?
            .checked_div(ONE_HUNDRED)
            .map(|d| Money(d.round_dp(DIVISION_SCALE)))
    }

    /// Split evenly into `periods` parts, rounded to [`DIVISION_SCALE`]
    pub fn checked_split(&self, periods: u32) -> Option<Self> {
        if periods == 0 {
            return None;
        }
        self.0
            .checked_div(Decimal::from(periods))
            .map(|d| Money(d.round_dp(DIVISION_SCALE)))
    }

    /// Multiply by a whole number of periods, `None` on overflow
    pub fn checked_times(&self, periods: u32) -> Option<Self> {
        self.0.checked_mul(Decimal::from(periods)).map(Money)
    }

    pub fn checked_add(&self, other: Money) -> Option<Self> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(&self, other: Money) -> Option<Self> {
        self.0.checked_sub(other.0).map(Money)
    }

    /// Canonical representation without trailing zeros
    pub fn normalize(&self) -> Self {
        Money(self.0.normalize())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::from_str_exact(s)
    }
}

impl From<Decimal> for Money {
    fn from(d: Decimal) -> Self {
        Money::from_decimal(d)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, other: Money) -> Money {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, other: Money) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, other: Money) -> Money {
        Money(self.0 - other.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}
