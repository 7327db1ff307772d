use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{
    add_months, round2, LeaseContract, NewPayment, Payment, PaymentPatch, PaymentStatus,
    PaymentType, RentChange, YearMonth,
};

/// Identity of one expected obligation in a contract schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleKey {
    Rent { month: YearMonth },
    Deposit { month: YearMonth, installment: u32 },
}

impl ScheduleKey {
    pub fn payment_type(&self) -> PaymentType {
        match self {
            Self::Rent { .. } => PaymentType::Rent,
            Self::Deposit { .. } => PaymentType::Deposit,
        }
    }

    pub fn month(&self) -> YearMonth {
        match self {
            Self::Rent { month } | Self::Deposit { month, .. } => *month,
        }
    }

    /// Stored payments are matched by `(payment_type, payment_month)`.
    pub fn slot(&self) -> (PaymentType, YearMonth) {
        (self.payment_type(), self.month())
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rent { month } => write!(f, "rent-{month}"),
            Self::Deposit { month, installment } => write!(f, "deposit-{month}-{installment}"),
        }
    }
}

impl Serialize for ScheduleKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpectedPayment {
    pub key: ScheduleKey,
    pub payment_date: NaiveDate,
    pub expected_amount: f64,
    pub reference: String,
}

impl ExpectedPayment {
    pub fn to_new_payment(&self, contract: &LeaseContract) -> NewPayment {
        NewPayment {
            contract_id: contract.id.clone(),
            tenant_id: contract.tenant_id.clone(),
            unit_id: contract.unit_id.clone(),
            payment_month: self.key.month(),
            payment_date: self.payment_date,
            expected_amount: self.expected_amount,
            amount: 0.0,
            payment_type: self.key.payment_type(),
            status: PaymentStatus::Pending,
            reference: self.reference.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentUpdate {
    pub id: String,
    pub expected_amount: f64,
    pub payment_date: NaiveDate,
}

impl PaymentUpdate {
    pub fn patch(&self) -> PaymentPatch {
        PaymentPatch {
            expected_amount: self.expected_amount,
            payment_date: self.payment_date,
        }
    }
}

/// Operations that converge stored payments to the expected schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PaymentPlan {
    pub creates: Vec<ExpectedPayment>,
    pub updates: Vec<PaymentUpdate>,
    pub deletes: Vec<String>,
    /// Ids in `deletes` that duplicate a slot the schedule still expects.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub duplicates: Vec<String>,
}

impl PaymentPlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MonthlyCharges {
    base_rent: f64,
    utilities: f64,
    heating: f64,
}

impl MonthlyCharges {
    fn of_contract(contract: &LeaseContract) -> Self {
        Self {
            base_rent: contract.base_rent,
            utilities: contract.utilities,
            heating: contract.heating,
        }
    }

    fn of_change(change: &RentChange) -> Self {
        Self {
            base_rent: change.base_rent,
            utilities: change.utilities.unwrap_or(0.0),
            heating: change.heating.unwrap_or(0.0),
        }
    }

    fn total(self) -> f64 {
        round2(self.base_rent + self.utilities + self.heating)
    }
}

/// Last month of the schedule: the contract end, or `horizon_months` past
/// `today` for open-ended contracts.
pub fn schedule_end_month(
    contract: &LeaseContract,
    today: NaiveDate,
    horizon_months: u32,
) -> YearMonth {
    let end = contract
        .end_date
        .unwrap_or_else(|| add_months(today, horizon_months));
    YearMonth::of(end)
}

pub fn build_expected_schedule(
    contract: &LeaseContract,
    rent_changes: &[RentChange],
    today: NaiveDate,
    horizon_months: u32,
) -> Vec<ExpectedPayment> {
    let mut expected = build_rent_entries(
        contract,
        rent_changes,
        schedule_end_month(contract, today, horizon_months),
    );
    expected.extend(build_deposit_entries(contract));
    expected
}

fn build_rent_entries(
    contract: &LeaseContract,
    rent_changes: &[RentChange],
    end: YearMonth,
) -> Vec<ExpectedPayment> {
    // Newest-first with a stable sort, then reversed: among changes sharing an
    // effective date the one listed first ends up last, so the cursor below
    // settles on it.
    let mut ordered = rent_changes.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| b.effective_date.cmp(&a.effective_date));
    ordered.reverse();

    let base = MonthlyCharges::of_contract(contract);
    let mut applicable = None;
    let mut cursor = 0;

    let mut entries = Vec::new();
    let mut month = YearMonth::of(contract.start_date);
    while month <= end {
        while cursor < ordered.len() && YearMonth::of(ordered[cursor].effective_date) <= month {
            applicable = Some(MonthlyCharges::of_change(ordered[cursor]));
            cursor += 1;
        }
        let charges = applicable.unwrap_or(base);

        let payment_date = match contract.rent_due_day {
            Some(day) => month.day_clamped(day),
            None => month.first_day(),
        };

        entries.push(ExpectedPayment {
            key: ScheduleKey::Rent { month },
            payment_date,
            expected_amount: charges.total(),
            reference: format!("Miete {month}"),
        });
        month = month.next();
    }
    entries
}

fn build_deposit_entries(contract: &LeaseContract) -> Vec<ExpectedPayment> {
    if contract.deposit <= 0.0 {
        return Vec::new();
    }

    let installments = contract.deposit_installment_count();
    let per_installment = round2(contract.deposit / f64::from(installments));
    let anchor = contract.deposit_anchor_date();

    (0..installments)
        .map(|index| {
            let payment_date = if index == 0 {
                anchor
            } else {
                let shifted = add_months(anchor, index);
                match contract.rent_due_day {
                    Some(day) => YearMonth::of(shifted).day_clamped(day),
                    None => shifted,
                }
            };
            // The last installment takes the rounding remainder.
            let expected_amount = if index + 1 == installments {
                round2(contract.deposit - per_installment * f64::from(installments - 1))
            } else {
                per_installment
            };
            ExpectedPayment {
                key: ScheduleKey::Deposit {
                    month: YearMonth::of(payment_date),
                    installment: index,
                },
                payment_date,
                expected_amount,
                reference: format!("Kaution {}/{}", index + 1, installments),
            }
        })
        .collect()
}

fn amounts_differ(stored: f64, expected: f64) -> bool {
    (round2(stored) - round2(expected)).abs() >= 0.005
}

/// Diffs the expected schedule against stored payments.
///
/// Only `pending`/`partial` rows of the scheduled types take part: they are
/// matched by `(payment_type, payment_month)`, rewritten when their amount or
/// due date drifted, and deleted when their slot left the schedule. A second
/// untouched `pending` row in a slot that already has a match is a duplicate
/// and is deleted as well. Every other row is left alone.
pub fn plan_reconciliation(expected: &[ExpectedPayment], stored: &[Payment]) -> PaymentPlan {
    let mut open_by_slot: HashMap<(PaymentType, YearMonth), Vec<&Payment>> = HashMap::new();
    for payment in stored
        .iter()
        .filter(|payment| payment.status.is_mutable() && payment.payment_type.is_scheduled())
    {
        open_by_slot
            .entry((payment.payment_type.clone(), payment.payment_month))
            .or_default()
            .push(payment);
    }

    let mut plan = PaymentPlan::default();
    let mut matched: HashSet<&str> = HashSet::new();
    let mut expected_slots = HashSet::new();

    for entry in expected {
        let slot = entry.key.slot();
        let candidate = open_by_slot.get(&slot).and_then(|candidates| {
            candidates
                .iter()
                .find(|payment| !matched.contains(payment.id.as_str()))
                .copied()
        });
        expected_slots.insert(slot);

        let Some(existing) = candidate else {
            plan.creates.push(entry.clone());
            continue;
        };
        matched.insert(existing.id.as_str());

        if amounts_differ(existing.expected_amount, entry.expected_amount)
            || existing.payment_date != Some(entry.payment_date)
        {
            plan.updates.push(PaymentUpdate {
                id: existing.id.clone(),
                expected_amount: entry.expected_amount,
                payment_date: entry.payment_date,
            });
        }
    }

    for payment in stored {
        if matched.contains(payment.id.as_str()) {
            continue;
        }
        let slot = (payment.payment_type.clone(), payment.payment_month);
        let Some(candidates) = open_by_slot.get(&slot) else {
            continue;
        };
        if !candidates.iter().any(|candidate| candidate.id == payment.id) {
            continue;
        }
        let orphaned = !expected_slots.contains(&slot);
        let duplicate = payment.status == PaymentStatus::Pending && payment.amount == 0.0;
        if orphaned || duplicate {
            plan.deletes.push(payment.id.clone());
        }
        if !orphaned && duplicate {
            plan.duplicates.push(payment.id.clone());
        }
    }

    plan
}
