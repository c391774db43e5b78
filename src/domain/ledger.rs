use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ExtensionGrant {
    pub from_index: usize,
    pub minutes: f64,
}

/// Running total of extra minutes granted during a meeting.
///
/// Each grant remembers the item that was active when it was given. The end
/// boundary of every item from that point on moves forward by the granted
/// minutes; items before it keep their boundaries. The ledger only grows.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtensionLedger {
    grants: Vec<ExtensionGrant>,
    total_extension_minutes: f64,
}

impl ExtensionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a grant. Repeated calls add again; every confirmation is its
    /// own grant.
    pub fn grant_extension(&mut self, from_index: usize, minutes: f64) -> Result<f64, String> {
        if !minutes.is_finite() || minutes <= 0.0 {
            return Err("extension minutes must be a positive number".to_string());
        }
        self.grants.push(ExtensionGrant {
            from_index,
            minutes,
        });
        self.total_extension_minutes += minutes;
        Ok(self.total_extension_minutes)
    }

    pub fn total_extension_minutes(&self) -> f64 {
        self.total_extension_minutes
    }

    /// Minutes by which the end boundary of item `index` has been pushed.
    pub fn shift_for(&self, index: usize) -> f64 {
        self.grants
            .iter()
            .filter(|grant| grant.from_index <= index)
            .map(|grant| grant.minutes)
            .sum()
    }

    pub fn grants(&self) -> &[ExtensionGrant] {
        &self.grants
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_accumulates_without_dedup() {
        let mut ledger = ExtensionLedger::new();
        assert_eq!(ledger.grant_extension(0, 1.0), Ok(1.0));
        assert_eq!(ledger.grant_extension(0, 1.0), Ok(2.0));
        assert_eq!(ledger.total_extension_minutes(), 2.0);
        assert_eq!(ledger.grants().len(), 2);
    }

    #[test]
    fn grant_rejects_non_positive_minutes() {
        let mut ledger = ExtensionLedger::new();
        assert!(ledger.grant_extension(0, 0.0).is_err());
        assert!(ledger.grant_extension(0, -1.0).is_err());
        assert!(ledger.grant_extension(0, f64::NAN).is_err());
        assert!(ledger.is_empty());
        assert_eq!(ledger.total_extension_minutes(), 0.0);
    }

    #[test]
    fn shift_applies_from_grant_index_forward() {
        let mut ledger = ExtensionLedger::new();
        ledger.grant_extension(1, 2.0).expect("grant");
        ledger.grant_extension(3, 0.5).expect("grant");

        assert_eq!(ledger.shift_for(0), 0.0);
        assert_eq!(ledger.shift_for(1), 2.0);
        assert_eq!(ledger.shift_for(2), 2.0);
        assert_eq!(ledger.shift_for(3), 2.5);
        assert_eq!(ledger.shift_for(9), 2.5);
    }
}
