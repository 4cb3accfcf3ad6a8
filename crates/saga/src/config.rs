use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the settlement saga takes stock for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReservationMode {
    /// One conditional decrement per item, each committed on its own.
    #[default]
    Conditional,
    /// Coordinator locks on every product, taken in ascending id order,
    /// then a single locked read-modify-write transaction.
    SortedLocks,
}

impl ReservationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationMode::Conditional => "conditional",
            ReservationMode::SortedLocks => "sorted-locks",
        }
    }
}

impl std::fmt::Display for ReservationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReservationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conditional" => Ok(ReservationMode::Conditional),
            "sorted-locks" => Ok(ReservationMode::SortedLocks),
            other => Err(format!(
                "unknown stock reservation mode '{other}', expected conditional or sorted-locks"
            )),
        }
    }
}

/// Settlement tuning.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub reservation: ReservationMode,
    /// How long to wait for a product or order lock.
    pub lock_wait: Duration,
    /// Upper bound on how long a lock is held.
    pub lock_lease: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            reservation: ReservationMode::default(),
            lock_wait: Duration::from_secs(3),
            lock_lease: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reservation_mode() {
        assert_eq!(
            "sorted-locks".parse::<ReservationMode>().unwrap(),
            ReservationMode::SortedLocks
        );
        assert_eq!(
            " Conditional ".parse::<ReservationMode>().unwrap(),
            ReservationMode::Conditional
        );
        assert!("optimistic".parse::<ReservationMode>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for mode in [ReservationMode::Conditional, ReservationMode::SortedLocks] {
            assert_eq!(mode.to_string().parse::<ReservationMode>().unwrap(), mode);
        }
    }
}
