//! Aggregate figures over a set of expenses. Amounts are summed as recorded,
//! without currency conversion.
use super::expense::{Category, CurrencyCode, Expense, ExpenseStatus, TimeStamp};
use super::user::UserId;
use chrono::{Datelike, Timelike, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

const MONTHS_REPORTED: usize = 12;
const TOP_EMPLOYEES: usize = 10;
const RECENT_ACTIVITY: usize = 10;
const SECONDS_PER_HOUR: i64 = 3600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucket {
    pub count: usize,
    pub total: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpenseStats {
    pub by_status: BTreeMap<ExpenseStatus, Bucket>,
    pub by_category: Vec<(Category, Bucket)>, // largest total first
    pub monthly: Vec<(Month, Bucket)>,        // most recent first
    pub total_count: usize,
    pub total_amount: Decimal,
}

/// A manager's view over their team. Month comparisons are against `now`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeamAnalytics {
    pub current_month: Bucket,
    pub previous_month: Bucket,
    pub percentage_change: Decimal, // zero when the previous month had no spend
    pub current_by_status: BTreeMap<ExpenseStatus, Bucket>,
    pub overall: ExpenseStats,
    pub top_employees: Vec<(UserId, Bucket)>,
    pub by_currency: Vec<(CurrencyCode, Bucket)>,
    pub rejection_reasons: Vec<(String, usize)>,
    /// Submissions keyed by (days from Monday, hour) of `created_at`.
    pub submission_heatmap: BTreeMap<(u32, u32), usize>,
    pub pending_count: usize,
    pub avg_approval_hours: Option<i64>,
    pub team_size: usize,
    pub recent: Vec<Expense>,
}

impl Bucket {
    fn add(&mut self, amount: Decimal) {
        self.count += 1;
        self.total += amount;
    }
}

impl Month {
    pub fn of(date: &TimeStamp<Utc>) -> Self {
        let date = date.to_datetime_utc();
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn previous(self) -> Self {
        match self.month {
            1 => Self {
                year: self.year - 1,
                month: 12,
            },
            month => Self {
                year: self.year,
                month: month - 1,
            },
        }
    }
}

// groups by key and returns the largest totals first, ties in key order
fn ranked<K: Ord + Clone + std::hash::Hash>(
    expenses: &[&Expense],
    key: impl Fn(&Expense) -> K,
) -> Vec<(K, Bucket)> {
    let mut buckets: HashMap<K, Bucket> = HashMap::new();
    for &expense in expenses {
        buckets
            .entry(key(expense))
            .or_default()
            .add(expense.details.amount.value());
    }
    let mut ranked: Vec<_> = buckets.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total.cmp(&a.1.total).then(a.0.cmp(&b.0)));
    ranked
}

/// Rounded mean hours from creation to `manager`'s approval, over the expenses they approved.
pub fn average_approval_hours<'a>(
    manager: &UserId,
    expenses: impl IntoIterator<Item = &'a Expense>,
) -> Option<i64> {
    let waits: Vec<i64> = expenses
        .into_iter()
        .filter_map(|expense| {
            let approval = expense.manager_approval().filter(|a| a.by == *manager)?;
            let waited = approval.at.to_datetime_utc() - expense.created_at.to_datetime_utc();
            Some(waited.num_seconds().max(0))
        })
        .collect();
    if waits.is_empty() {
        return None;
    }
    let count = waits.len() as i64;
    let total: i64 = waits.iter().sum();
    Some((total + count * SECONDS_PER_HOUR / 2) / (count * SECONDS_PER_HOUR))
}

/// Builds [`TeamAnalytics`] from the team's expenses. `in_range` narrows
/// everything except the month-over-month comparison, which always looks at
/// the whole team history.
pub fn team_analytics(
    team: &[Expense],
    in_range: impl Fn(&Expense) -> bool,
    team_size: usize,
    avg_approval_hours: Option<i64>,
    now: TimeStamp<Utc>,
) -> TeamAnalytics {
    let current = Month::of(&now);
    let previous = current.previous();
    let mut analytics = TeamAnalytics {
        team_size,
        avg_approval_hours,
        ..TeamAnalytics::default()
    };

    for expense in team {
        let amount = expense.details.amount.value();
        let month = Month::of(&expense.details.date);
        if month >= current {
            analytics.current_month.add(amount);
            analytics
                .current_by_status
                .entry(expense.status())
                .or_default()
                .add(amount);
        } else if month == previous {
            analytics.previous_month.add(amount);
        }
    }
    if !analytics.previous_month.total.is_zero() {
        let change = analytics.current_month.total - analytics.previous_month.total;
        analytics.percentage_change =
            (change / analytics.previous_month.total * Decimal::ONE_HUNDRED).round_dp(2);
    }

    let selected: Vec<&Expense> = team.iter().filter(|&expense| in_range(expense)).collect();
    analytics.overall = summarise(selected.iter().copied());
    analytics.top_employees = ranked(&selected, |expense| expense.submitted_by.clone());
    analytics.top_employees.truncate(TOP_EMPLOYEES);
    analytics.by_currency = ranked(&selected, |expense| expense.details.currency.clone());

    let mut reasons: HashMap<&str, usize> = HashMap::new();
    for expense in &selected {
        if expense.status() == ExpenseStatus::Pending {
            analytics.pending_count += 1;
        }
        if let Some(rejection) = expense.rejection() {
            *reasons.entry(rejection.reason.as_str()).or_default() += 1;
        }
        let created = expense.created_at.to_datetime_utc();
        *analytics
            .submission_heatmap
            .entry((created.weekday().num_days_from_monday(), created.hour()))
            .or_default() += 1;
    }
    analytics.rejection_reasons = reasons
        .into_iter()
        .map(|(reason, count)| (reason.to_string(), count))
        .collect();
    analytics
        .rejection_reasons
        .sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut recent = selected;
    recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    analytics.recent = recent.into_iter().take(RECENT_ACTIVITY).cloned().collect();
    analytics
}

pub fn summarise<'a>(expenses: impl IntoIterator<Item = &'a Expense>) -> ExpenseStats {
    let mut stats = ExpenseStats::default();
    let mut by_category: HashMap<Category, Bucket> = HashMap::new();
    let mut monthly: BTreeMap<Month, Bucket> = BTreeMap::new();

    for expense in expenses {
        let amount = expense.details.amount.value();
        let date = expense.details.date.to_datetime_utc();

        stats.by_status.entry(expense.status()).or_default().add(amount);
        by_category
            .entry(expense.details.category)
            .or_default()
            .add(amount);
        monthly
            .entry(Month {
                year: date.year(),
                month: date.month(),
            })
            .or_default()
            .add(amount);

        stats.total_count += 1;
        stats.total_amount += amount;
    }

    stats.by_category = by_category.into_iter().collect();
    stats
        .by_category
        .sort_by(|a, b| b.1.total.cmp(&a.1.total).then(a.0.cmp(&b.0)));
    stats.monthly = monthly.into_iter().rev().take(MONTHS_REPORTED).collect();
    stats
}
