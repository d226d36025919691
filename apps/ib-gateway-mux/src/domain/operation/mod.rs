//! Gateway Operations
//!
//! The closed set of operation kinds a client may route through the shared
//! session. Permission checks and the gateway adapter both match on this enum,
//! so adding an operation means touching both places explicitly.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An operation kind that can be dispatched to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Query the gateway's authentication/connection status.
    CheckConnection,
    /// List brokerage accounts visible to the session.
    GetAccountInfo,
    /// Positions for an account.
    GetPortfolio,
    /// Recent executions.
    GetTrades,
    /// Market data snapshot for one or more contracts.
    GetMarketData,
    /// Bid/ask midpoint for a single contract.
    GetMidPrice,
}

impl Operation {
    /// Every operation kind, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::CheckConnection,
        Self::GetAccountInfo,
        Self::GetPortfolio,
        Self::GetTrades,
        Self::GetMarketData,
        Self::GetMidPrice,
    ];

    /// Wire name of the operation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CheckConnection => "check_connection",
            Self::GetAccountInfo => "get_account_info",
            Self::GetPortfolio => "get_portfolio",
            Self::GetTrades => "get_trades",
            Self::GetMarketData => "get_market_data",
            Self::GetMidPrice => "get_mid_price",
        }
    }

    /// Whether the operation only reads brokerage state.
    ///
    /// Every operation routed today is a read. Anything with side effects
    /// must still be granted through the allow-list like any other operation.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        match self {
            Self::CheckConnection
            | Self::GetAccountInfo
            | Self::GetPortfolio
            | Self::GetTrades
            | Self::GetMarketData
            | Self::GetMidPrice => true,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an operation name is not part of the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == normalized)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

/// A set of permitted operations.
///
/// Ordered so status output and log lines are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Operation>);

impl PermissionSet {
    /// An empty permission set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(BTreeSet::new())
    }

    /// A permission set granting every operation.
    #[must_use]
    pub fn all() -> Self {
        Self(Operation::ALL.into_iter().collect())
    }

    /// Parse a comma separated list of operation names.
    ///
    /// # Errors
    ///
    /// Returns the first name that is not a known operation.
    pub fn parse_list(list: &str) -> Result<Self, UnknownOperation> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Operation::from_str)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    /// Whether `op` is permitted.
    #[must_use]
    pub fn contains(&self, op: Operation) -> bool {
        self.0.contains(&op)
    }

    /// Operations in `self` that are missing from `allowed`.
    #[must_use]
    pub fn not_covered_by(&self, allowed: &Self) -> Vec<Operation> {
        self.0.difference(&allowed.0).copied().collect()
    }

    /// Number of permitted operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no operation is permitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over permitted operations in order.
    pub fn iter(&self) -> impl Iterator<Item = Operation> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Operation> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("get_portfolio", Operation::GetPortfolio ; "plain")]
    #[test_case("GET_TRADES", Operation::GetTrades ; "upper case")]
    #[test_case("  get_mid_price ", Operation::GetMidPrice ; "padded")]
    #[test_case("check_connection", Operation::CheckConnection ; "status")]
    fn parses_known_operations(input: &str, expected: Operation) {
        assert_eq!(input.parse::<Operation>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_operation() {
        let err = "place_order".parse::<Operation>().unwrap_err();
        assert_eq!(err, UnknownOperation("place_order".to_string()));
    }

    #[test]
    fn wire_names_round_trip() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
    }

    #[test]
    fn serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&Operation::GetAccountInfo).unwrap(),
            "\"get_account_info\""
        );
    }

    #[test]
    fn permission_list_parsing() {
        let set = PermissionSet::parse_list("get_portfolio, get_trades,,").unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(Operation::GetPortfolio));
        assert!(!set.contains(Operation::GetMidPrice));

        assert!(PermissionSet::parse_list("get_portfolio,wire_funds").is_err());
        assert!(PermissionSet::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn not_covered_by_reports_missing_operations() {
        let requested: PermissionSet = [Operation::GetPortfolio, Operation::GetTrades]
            .into_iter()
            .collect();
        let allowed: PermissionSet = [Operation::GetPortfolio].into_iter().collect();

        assert_eq!(requested.not_covered_by(&allowed), vec![Operation::GetTrades]);
        assert!(requested.not_covered_by(&PermissionSet::all()).is_empty());
    }

    #[test]
    fn every_operation_is_read_only() {
        assert!(Operation::ALL.iter().all(Operation::is_read_only));
    }
}
