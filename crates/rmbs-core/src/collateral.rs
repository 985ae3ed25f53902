//! Rule-based collateral cashflow projection.
//!
//! Amortizes a mortgage pool period by period under CPR/CDR/severity
//! assumptions. Per period: scheduled interest and principal from the level
//! payment, then defaults on the start balance, then prepayments on the
//! balance net of scheduled principal and defaults. Recoveries flow to
//! principal collections per RMBS convention.

use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};

use crate::error::RmbsError;
use crate::types::{Money, Rate};
use crate::RmbsResult;

/// One period of projected pool cashflows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct PeriodCashflow {
    pub period: u32,
    pub begin_balance: Money,
    pub end_balance: Money,
    pub interest_collected: Money,
    pub principal_collected: Money,
    pub realized_loss: Money,
    pub default_amount: Money,
    pub scheduled_interest: Money,
    pub scheduled_principal: Money,
    pub prepayment: Money,
    pub recoveries: Money,
    pub servicer_advances: Money,
}

/// Pool amortization engine.
#[derive(Debug, Clone)]
pub struct CollateralModel {
    pub original_balance: Money,
    pub wac: Rate,
    pub wam: u32,
}

impl CollateralModel {
    pub fn new(original_balance: Money, wac: Rate, wam: u32) -> Self {
        CollateralModel {
            original_balance,
            wac,
            wam,
        }
    }

    /// Generate pool cashflows for `periods` months.
    ///
    /// `cpr` and `cdr` are annualized; `severity` is loss given default.
    /// Projection starts from `start_balance` when given, otherwise from the
    /// pool's original balance.
    pub fn generate_cashflows(
        &self,
        periods: u32,
        cpr: Rate,
        cdr: Rate,
        severity: Rate,
        start_balance: Option<Money>,
    ) -> RmbsResult<Vec<PeriodCashflow>> {
        validate_rate("cpr", cpr)?;
        validate_rate("cdr", cdr)?;
        validate_rate("severity", severity)?;

        let one = Decimal::ONE;
        let smm = one - (one - cpr).powf(1.0 / 12.0);
        let mdr = one - (one - cdr).powf(1.0 / 12.0);
        let r_m = self.wac / Decimal::from(12);

        let mut balance = start_balance.unwrap_or(self.original_balance);
        let mut rows = Vec::with_capacity(periods as usize);

        for t in 1..=periods {
            if balance <= Decimal::ZERO {
                rows.push(PeriodCashflow {
                    period: t,
                    ..Default::default()
                });
                continue;
            }

            let interest_due = balance * r_m;

            // Scheduled amortization from the level mortgage payment,
            // remaining term clamped so the final payment stays finite.
            let remaining_term = self.wam.saturating_sub(t).max(1);
            let scheduled_principal = if r_m.is_zero() {
                balance / Decimal::from(remaining_term)
            } else {
                let discount = (one + r_m)
                    .checked_powi(-(i64::from(remaining_term)))
                    .ok_or_else(|| {
                        RmbsError::Calculation("level payment discount overflow".into())
                    })?;
                let level_payment = (balance * r_m) / (one - discount);
                (level_payment - interest_due).max(Decimal::ZERO)
            };

            // Defaults occur on the start balance
            let default_amount = balance * mdr;
            let realized_loss = default_amount * severity;
            let recoveries = default_amount - realized_loss;

            // Prepayments occur on the balance net of scheduled and defaults
            let post_scheduled = balance - scheduled_principal - default_amount;
            let prepayment = (post_scheduled * smm).max(Decimal::ZERO);

            let principal_collected = scheduled_principal + prepayment + recoveries;
            let end_balance = balance - scheduled_principal - default_amount - prepayment;

            rows.push(PeriodCashflow {
                period: t,
                begin_balance: balance,
                end_balance,
                interest_collected: interest_due,
                principal_collected,
                realized_loss,
                default_amount,
                scheduled_interest: interest_due,
                scheduled_principal,
                prepayment,
                recoveries,
                servicer_advances: Decimal::ZERO,
            });

            balance = end_balance;
        }

        Ok(rows)
    }
}

fn validate_rate(field: &str, value: Rate) -> RmbsResult<()> {
    if value < Decimal::ZERO || value > Decimal::ONE {
        return Err(RmbsError::InvalidInput {
            field: field.into(),
            reason: "must be in [0, 1]".into(),
        });
    }
    Ok(())
}
