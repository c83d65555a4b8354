use crate::application::handoff::sbp::{SBP_POLLING_DELAY, SBP_POLLING_RETRIES};
use crate::application::handoff::wallet::{WALLET_POLLING_DELAY, WALLET_POLLING_RETRIES};
use crate::application::poller::PollingBudget;
use crate::domain::payment::BankApp;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Tunables shared by every flow a session creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub sbp: PollingBudget,
    pub deep_link_wallet: PollingBudget,
    pub app_wallet: PollingBudget,
    /// Bank apps probed when resolving who can open an SBP link.
    pub sbp_banks: Vec<BankApp>,
    pub wallet_version: String,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            sbp: PollingBudget::new(SBP_POLLING_RETRIES, SBP_POLLING_DELAY),
            deep_link_wallet: PollingBudget::new(WALLET_POLLING_RETRIES, WALLET_POLLING_DELAY),
            app_wallet: PollingBudget::new(WALLET_POLLING_RETRIES, WALLET_POLLING_DELAY),
            sbp_banks: Vec::new(),
            wallet_version: "2".to_string(),
        }
    }
}

impl FlowSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Applies command-line overrides to every polling budget.
    pub fn with_overrides(mut self, retries: Option<u32>, delay: Option<Duration>) -> Self {
        for budget in [&mut self.sbp, &mut self.deep_link_wallet, &mut self.app_wallet] {
            if let Some(retries) = retries {
                budget.retries = retries;
            }
            if let Some(delay) = delay {
                budget.delay = delay;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"sbp": {{"retries": 3, "delay_ms": 50}}}}"#).unwrap();

        let settings = FlowSettings::load(file.path()).unwrap();
        assert_eq!(settings.sbp, PollingBudget::new(3, Duration::from_millis(50)));
        assert_eq!(settings.app_wallet.retries, 10);
        assert_eq!(settings.app_wallet.delay, Duration::from_secs(3));
    }

    #[test]
    fn test_overrides_apply_to_every_budget() {
        let settings = FlowSettings::default().with_overrides(Some(2), Some(Duration::ZERO));
        assert_eq!(settings.sbp, PollingBudget::new(2, Duration::ZERO));
        assert_eq!(settings.deep_link_wallet, PollingBudget::new(2, Duration::ZERO));
        assert_eq!(settings.app_wallet, PollingBudget::new(2, Duration::ZERO));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = FlowSettings::load("/nonexistent/settings.json").unwrap_err();
        assert!(matches!(err, crate::error::AcquiringError::Io(_)));
    }
}
