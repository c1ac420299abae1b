//! Month-bucketed aggregation over a user's transactions.
//!
//! Everything here is a pure function of the transaction slice, the reference
//! day and the plan. Sums are plain `f64` accumulations performed in ascending
//! date order (stable on input order for equal dates), so repeated runs over
//! the same snapshot produce bit-identical output.

use time::Date;

use crate::constants::*;
use crate::models::{
    CategoryTotal, MonthStats, MonthlyTotal, PlanType, ReportSummary, TopMonth, Transaction,
    TransactionType,
};
use crate::utils::parse_date;

const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

fn month_index(date: Date) -> i32 {
    date.year() * 12 + (u8::from(date.month()) as i32 - 1)
}

fn month_label(index: i32) -> String {
    let year = index.div_euclid(12);
    let month = index.rem_euclid(12) as usize;
    format!("{} {:02}", MONTH_NAMES[month], year.rem_euclid(100))
}

/// Transactions with a parseable date, oldest first.
fn chronological(transactions: &[Transaction]) -> Vec<(Date, &Transaction)> {
    let mut dated: Vec<(Date, &Transaction)> = transactions
        .iter()
        .filter_map(|tx| parse_date(&tx.date).ok().map(|date| (date, tx)))
        .collect();
    dated.sort_by_key(|(date, _)| *date);
    dated
}

fn category_name(tx: &Transaction) -> String {
    let trimmed = tx.category.trim();
    if trimmed.is_empty() {
        UNCATEGORIZED_LABEL.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Trailing `months` calendar months ending with `today`'s month, oldest first.
/// Every month is present even when it has no transactions.
pub fn monthly_totals(transactions: &[Transaction], today: Date, months: u32) -> Vec<MonthlyTotal> {
    if months == 0 {
        return Vec::new();
    }

    let last = month_index(today);
    let first = last - (months as i32 - 1);

    let mut buckets: Vec<MonthlyTotal> = (first..=last)
        .map(|index| MonthlyTotal {
            month: month_label(index),
            income: 0.0,
            expense: 0.0,
        })
        .collect();

    for (date, tx) in chronological(transactions) {
        let index = month_index(date);
        if index < first || index > last {
            continue;
        }
        let bucket = &mut buckets[(index - first) as usize];
        match tx.transaction_type {
            TransactionType::Income => bucket.income += tx.amount,
            TransactionType::Expense => bucket.expense += tx.amount,
        }
    }

    buckets
}

/// Expenses of `today`'s calendar month grouped by category, largest first,
/// truncated to the top six. Equal amounts keep first-seen order.
pub fn category_breakdown(transactions: &[Transaction], today: Date) -> Vec<CategoryTotal> {
    let current = month_index(today);
    let mut totals: Vec<CategoryTotal> = Vec::new();

    for (date, tx) in chronological(transactions) {
        if tx.transaction_type != TransactionType::Expense || month_index(date) != current {
            continue;
        }
        let name = category_name(tx);
        match totals.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => entry.value += tx.amount,
            None => totals.push(CategoryTotal {
                name,
                value: tx.amount,
            }),
        }
    }

    totals.sort_by(|a, b| b.value.total_cmp(&a.value));
    totals.truncate(TOP_CATEGORIES);
    totals
}

/// Best three months by profit. Ties keep chronological order.
pub fn top_months(monthly: &[MonthlyTotal]) -> Vec<TopMonth> {
    let mut ranked: Vec<TopMonth> = monthly
        .iter()
        .map(|m| TopMonth {
            month: m.month.clone(),
            profit: m.income - m.expense,
            income: m.income,
            expense: m.expense,
        })
        .collect();

    ranked.sort_by(|a, b| b.profit.total_cmp(&a.profit));
    ranked.truncate(TOP_MONTHS);
    ranked
}

pub fn month_stats(transactions: &[Transaction], today: Date) -> MonthStats {
    let current = month_index(today);
    let mut stats = MonthStats::default();

    for (date, tx) in chronological(transactions) {
        if month_index(date) != current {
            continue;
        }
        match tx.transaction_type {
            TransactionType::Income => stats.total_income += tx.amount,
            TransactionType::Expense => {
                stats.total_expense += tx.amount;
                *stats
                    .expenses_by_category
                    .entry(category_name(tx))
                    .or_insert(0.0) += tx.amount;
            }
        }
    }

    stats.total_profit = stats.total_income - stats.total_expense;
    stats
}

/// Sums of income and expense dated after `today`: (receivable, payable).
pub fn scheduled_totals(transactions: &[Transaction], today: Date) -> (f64, f64) {
    let mut receivable = 0.0;
    let mut payable = 0.0;

    for (date, tx) in chronological(transactions) {
        if date <= today {
            continue;
        }
        match tx.transaction_type {
            TransactionType::Income => receivable += tx.amount,
            TransactionType::Expense => payable += tx.amount,
        }
    }

    (receivable, payable)
}

pub fn report_months(plan: PlanType) -> u32 {
    match plan {
        PlanType::Free => FREE_REPORT_MONTHS,
        PlanType::Pro => PRO_REPORT_MONTHS,
    }
}

pub fn build_report(transactions: &[Transaction], today: Date, plan: PlanType) -> ReportSummary {
    let monthly = monthly_totals(transactions, today, report_months(plan));
    let top_months = plan.is_pro().then(|| top_months(&monthly));

    ReportSummary {
        plan_type: plan,
        category_breakdown: category_breakdown(transactions, today),
        monthly,
        top_months,
    }
}
