use crate::domain::ports::PortfolioStore;
use crate::domain::trading::portfolio::Portfolio;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Durable portfolio persistence via the tmp-then-rename discipline (§4.5
/// step 8, §6). A failed write is logged at warning and simply retried on
/// the next mutation (§7 kind 6) — it never blocks the pipeline.
pub struct FilePortfolioStore {
    file_path: PathBuf,
}

impl FilePortfolioStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }
}

impl PortfolioStore for FilePortfolioStore {
    fn load(&self) -> Result<Option<Portfolio>> {
        if !self.file_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.file_path).context("failed to read portfolio file")?;
        let portfolio: Portfolio =
            serde_json::from_str(&content).context("failed to parse portfolio JSON")?;
        info!("loaded portfolio from {:?}", self.file_path);
        Ok(Some(portfolio))
    }

    fn save(&self, portfolio: &Portfolio) -> Result<()> {
        if let Some(parent) = self.file_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).context("failed to create portfolio directory")?;
        }

        let content = serde_json::to_string_pretty(portfolio).context("failed to serialize portfolio")?;
        let temp_path = self.file_path.with_extension("tmp");

        if let Err(e) = fs::write(&temp_path, &content) {
            warn!("failed to write temp portfolio file: {}", e);
            return Err(e).context("failed to write temp portfolio file");
        }
        if let Err(e) = fs::rename(&temp_path, &self.file_path) {
            warn!("failed to rename portfolio file into place: {}", e);
            return Err(e).context("failed to rename portfolio file");
        }

        info!("saved portfolio to {:?}", self.file_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::{Position, PositionSide};
    use rust_decimal_macros::dec;

    mod tempfile_like_dir {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub fn unique_path(prefix: &str) -> PathBuf {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            std::env::temp_dir().join(format!("{prefix}-{}-{}.json", std::process::id(), n))
        }
    }

    #[test]
    fn round_trips_balance_and_positions() {
        let path = tempfile_like_dir::unique_path("rustrade-portfolio-test");
        let store = FilePortfolioStore::new(path.clone());

        let mut portfolio = Portfolio::new(dec!(10000));
        portfolio.cash_balance = dec!(7998.80);
        portfolio.positions.insert(
            "BTCUSDT".into(),
            Position {
                symbol: "BTCUSDT".into(),
                side: PositionSide::Long,
                entry_price: dec!(120),
                qty: dec!(16.670),
                opened_ts: 1000,
                stop_loss: dec!(116),
                take_profit: dec!(126),
            },
        );

        store.save(&portfolio).unwrap();
        let reloaded = store.load().unwrap().expect("portfolio should exist");

        assert_eq!(reloaded.cash_balance, portfolio.cash_balance);
        assert_eq!(reloaded.positions.len(), 1);
        assert_eq!(
            reloaded.positions["BTCUSDT"].qty,
            portfolio.positions["BTCUSDT"].qty
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_returns_none_when_file_absent() {
        let path = tempfile_like_dir::unique_path("rustrade-portfolio-missing");
        let store = FilePortfolioStore::new(path);
        assert!(store.load().unwrap().is_none());
    }
}
