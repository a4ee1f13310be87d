//! Read-side filters over transactions.

use chrono::{Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use vaultline_common::{start_of_day, AccountNumber, Timestamp, Transaction, TransactionType};

/// Calendar window, evaluated in the business offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Day,
    /// Monday-based week.
    Week,
    Month,
    Year,
}

impl Period {
    /// `[start, now]` of the period containing `now`.
    pub fn window(&self, now: Timestamp, offset: FixedOffset) -> (Timestamp, Timestamp) {
        let today = start_of_day(now, offset);
        let local = now.with_timezone(&offset).date_naive();
        let start = match self {
            Period::Day => today,
            Period::Week => today - Duration::days(i64::from(local.weekday().num_days_from_monday())),
            Period::Month => local_midnight(
                NaiveDate::from_ymd_opt(local.year(), local.month(), 1),
                offset,
            )
            .unwrap_or(today),
            Period::Year => local_midnight(NaiveDate::from_ymd_opt(local.year(), 1, 1), offset)
                .unwrap_or(today),
        };
        (start, now)
    }
}

fn local_midnight(date: Option<NaiveDate>, offset: FixedOffset) -> Option<Timestamp> {
    let midnight = date?.and_time(NaiveTime::MIN);
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|d| d.with_timezone(&Utc))
}

/// Filter for transaction listings and counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFilter {
    /// Matches either side of the transaction.
    pub account: Option<AccountNumber>,
    pub transaction_type: Option<TransactionType>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<Timestamp>,
    /// Inclusive upper bound on `created_at`.
    pub to: Option<Timestamp>,
    pub flagged: Option<bool>,
    pub include_deleted: bool,
}

impl TransactionFilter {
    pub fn for_account(account: AccountNumber) -> Self {
        Self {
            account: Some(account),
            ..Self::default()
        }
    }

    pub fn within(mut self, period: Period, now: Timestamp, offset: FixedOffset) -> Self {
        let (from, to) = period.window(now, offset);
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        if tx.is_deleted && !self.include_deleted {
            return false;
        }
        if let Some(account) = &self.account {
            let touches = tx.sender_account_number.as_ref() == Some(account)
                || tx.recipient_account_number.as_ref() == Some(account);
            if !touches {
                return false;
            }
        }
        if self.transaction_type.is_some_and(|t| t != tx.transaction_type) {
            return false;
        }
        if self.min_amount.is_some_and(|m| tx.amount.value < m) {
            return false;
        }
        if self.max_amount.is_some_and(|m| tx.amount.value > m) {
            return false;
        }
        if self.from.is_some_and(|f| tx.created_at < f) {
            return false;
        }
        if self.to.is_some_and(|t| tx.created_at > t) {
            return false;
        }
        if self.flagged.is_some_and(|f| f != tx.is_flagged) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use rust_decimal_macros::dec;
    use vaultline_common::{offset_from_minutes, Currency, Money, PaymentReference};

    fn at(s: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_period_windows() {
        let offset = offset_from_minutes(60);
        // Wednesday 2024-05-15 12:00 local.
        let now = at("2024-05-15T11:00:00Z");

        assert_eq!(Period::Day.window(now, offset).0, at("2024-05-14T23:00:00Z"));
        assert_eq!(Period::Week.window(now, offset).0, at("2024-05-12T23:00:00Z"));
        assert_eq!(Period::Month.window(now, offset).0, at("2024-04-30T23:00:00Z"));
        assert_eq!(Period::Year.window(now, offset).0, at("2023-12-31T23:00:00Z"));
    }

    #[test]
    fn test_filter_matching() {
        let account = AccountNumber::parse("0000001236").unwrap();
        let tx = Transaction::deposit(
            account.clone(),
            Money::new(dec!(250), Currency::ngn()),
            PaymentReference::generate(),
            at("2024-05-15T11:00:00Z"),
        );

        let filter = TransactionFilter::for_account(account.clone());
        assert!(filter.matches(&tx));

        let filter = TransactionFilter {
            min_amount: Some(dec!(300)),
            ..TransactionFilter::for_account(account)
        };
        assert!(!filter.matches(&tx));

        let filter = TransactionFilter {
            transaction_type: Some(TransactionType::Debit),
            ..TransactionFilter::default()
        };
        assert!(!filter.matches(&tx));
    }
}
