//! Forwarding to the external spreadsheet-sync command
//!
//! The command owns the spreadsheet. It is run twice per incremental
//! update: once with `--get-last-date` (prints `YYYY-MM-DD` or nothing),
//! then with the CSV ledger on standard input.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::SpreadsheetConfig;
use crate::constants;

pub struct SheetSync<'a> {
    config: &'a SpreadsheetConfig,
}

impl<'a> SheetSync<'a> {
    pub fn new(config: &'a SpreadsheetConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .context("Spreadsheet sync command is empty")?;

        let mut command = Command::new(program);
        command.args(args);
        command.env("GOOGLE_SHEET_URL", &self.config.url);
        command.env("GOOGLE_SHEET_TAB_NAME", &self.config.tab_name);
        if let Some(file) = &self.config.service_account_file {
            command.env("GCP_SERVICE_ACCOUNT_FILE", file);
        }
        command.stderr(Stdio::inherit());
        command.kill_on_drop(true);
        Ok(command)
    }

    fn program(&self) -> &str {
        self.config
            .command
            .first()
            .map(String::as_str)
            .unwrap_or(constants::SHEET_SYNC_COMMAND)
    }

    /// Last date already in the spreadsheet, if any
    pub async fn last_recorded_date(&self) -> Result<Option<NaiveDate>> {
        let mut command = self.command()?;
        command.arg(constants::SHEET_LAST_DATE_FLAG);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program()))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} {} exited with {}",
                self.program(),
                constants::SHEET_LAST_DATE_FLAG,
                output.status
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(line) = stdout.lines().map(str::trim).rfind(|l| !l.is_empty()) else {
            info!("Spreadsheet has no recorded dates");
            return Ok(None);
        };

        let date = NaiveDate::parse_from_str(line, "%Y-%m-%d")
            .with_context(|| format!("Unexpected last date from {}: '{}'", self.program(), line))?;
        debug!(%date, "Spreadsheet last recorded date");
        Ok(Some(date))
    }

    /// Pipe CSV rows (header included) to the command
    pub async fn append(&self, csv: &[u8]) -> Result<()> {
        let mut command = self.command()?;
        command.stdin(Stdio::piped());
        command.stdout(Stdio::inherit());

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to run {}", self.program()))?;

        let mut stdin = child
            .stdin
            .take()
            .context("Spreadsheet sync command has no stdin")?;
        stdin.write_all(csv).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let status = child.wait().await?;
        if !status.success() {
            anyhow::bail!("{} exited with {}", self.program(), status);
        }

        info!(bytes = csv.len(), "Forwarded ledger to spreadsheet");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sync_config(script: &str) -> SpreadsheetConfig {
        SpreadsheetConfig {
            url: "https://docs.google.com/spreadsheets/d/abc".to_string(),
            tab_name: "stLink Data".to_string(),
            service_account_file: None,
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        }
    }

    #[tokio::test]
    async fn test_last_date_is_parsed() {
        let config = sync_config(r#"test "$0" = "--get-last-date" && echo 2025-01-06"#);
        let date = SheetSync::new(&config).last_recorded_date().await.unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 1, 6));
    }

    #[tokio::test]
    async fn test_empty_sheet_has_no_last_date() {
        let config = sync_config("true");
        let date = SheetSync::new(&config).last_recorded_date().await.unwrap();
        assert_eq!(date, None);
    }

    #[tokio::test]
    async fn test_collaborator_sees_sheet_settings() {
        let config = sync_config(r#"test "$GOOGLE_SHEET_TAB_NAME" = "stLink Data" && echo 2024-12-30"#);
        let date = SheetSync::new(&config).last_recorded_date().await.unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 12, 30));
    }

    #[tokio::test]
    async fn test_append_pipes_csv() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("received.csv");
        let config = sync_config(&format!("cat > '{}'", out.display()));

        let csv = b"block_date,block\n2025-01-06 13:00:11,21570000\n";
        SheetSync::new(&config).append(csv).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), csv);
    }

    #[tokio::test]
    async fn test_failing_collaborator_is_fatal() {
        let config = sync_config("cat > /dev/null; exit 3");
        let err = SheetSync::new(&config).append(b"x\n").await.unwrap_err();
        assert!(err.to_string().contains("exited"));
    }
}
