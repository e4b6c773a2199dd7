//! Ledger output (CSV stream and console report)

use alloy::primitives::Address;
use anyhow::Result;
use csv::{Terminator, Writer, WriterBuilder};
use std::io::Write;

use crate::ledger::BlockRecord;
use crate::selector::RecordType;
use crate::units::{format_reward, format_token};

/// Column order of the CSV contract
pub const CSV_HEADER: [&str; 8] = [
    "block_date",
    "block",
    "type",
    "stlink_balance",
    "link_balance",
    "lsd_tokens",
    "queued_tokens",
    "reward_share",
];

/// Extra column written with `--with-price`
pub const PRICE_COLUMN: &str = "link_price_usd";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub enum Reporter<W: Write> {
    Csv {
        writer: Writer<W>,
        with_price: bool,
    },
    Text {
        out: W,
        with_price: bool,
    },
}

impl<W: Write> Reporter<W> {
    /// CSV reporter; the header is written immediately
    pub fn csv(out: W, with_price: bool) -> Result<Self> {
        let mut writer = WriterBuilder::new()
            .terminator(Terminator::Any(b'\n'))
            .from_writer(out);

        let mut header: Vec<&str> = CSV_HEADER.to_vec();
        if with_price {
            header.push(PRICE_COLUMN);
        }
        writer.write_record(&header)?;
        writer.flush()?;

        Ok(Reporter::Csv { writer, with_price })
    }

    /// Human-readable reporter
    pub fn text(out: W, with_price: bool) -> Self {
        Reporter::Text { out, with_price }
    }

    /// Banner before the first record (console only)
    pub fn begin(&mut self, wallet: Address, blocks: usize) -> Result<()> {
        if let Reporter::Text { out, .. } = self {
            writeln!(out)?;
            writeln!(out, "=== Balances for {} at {} blocks ===", wallet, blocks)?;
        }
        Ok(())
    }

    /// Emit one record, flushed so a later failure keeps the rows already written
    pub fn write(&mut self, record: &BlockRecord) -> Result<()> {
        match self {
            Reporter::Csv { writer, with_price } => {
                let mut row = vec![
                    record.timestamp.format(DATE_FORMAT).to_string(),
                    record.block_number.to_string(),
                    record.record_type.to_string(),
                    format_token(record.stlink_balance),
                    format_token(record.link_balance),
                    format_token(record.lsd_tokens),
                    format_token(record.queued_tokens),
                    record.reward_share.map(format_reward).unwrap_or_default(),
                ];
                if *with_price {
                    row.push(
                        record
                            .link_price_usd
                            .map(|p| format!("{:.2}", p))
                            .unwrap_or_default(),
                    );
                }
                writer.write_record(&row)?;
                writer.flush()?;
            }
            Reporter::Text { out, with_price } => {
                write_text_block(out, record, *with_price)?;
                out.flush()?;
            }
        }
        Ok(())
    }

    /// Flush and hand back the underlying writer
    pub fn finish(self) -> Result<W> {
        match self {
            Reporter::Csv { writer, .. } => writer
                .into_inner()
                .map_err(|e| anyhow::anyhow!("Failed to flush CSV output: {}", e.error())),
            Reporter::Text { mut out, .. } => {
                out.flush()?;
                Ok(out)
            }
        }
    }
}

fn write_text_block<W: Write>(out: &mut W, record: &BlockRecord, with_price: bool) -> Result<()> {
    let kind = match record.direction {
        Some(direction) => format!("{} ({})", record.record_type, direction),
        None => record.record_type.to_string(),
    };

    writeln!(out)?;
    writeln!(
        out,
        "Block {} (Date: {}, Type: {})",
        record.block_number,
        record.timestamp.format(DATE_FORMAT),
        kind
    )?;
    writeln!(out, "Wallet:")?;
    writeln!(out, "  stLINK: {}", format_token(record.stlink_balance))?;
    writeln!(out, "  LINK: {}", format_token(record.link_balance))?;
    writeln!(out, "Priority Pool:")?;
    writeln!(out, "  stLINK: {}", format_token(record.lsd_tokens))?;
    writeln!(out, "  LINK: {} (Queued)", format_token(record.queued_tokens))?;

    if record.record_type == RecordType::Reward {
        match record.reward_share {
            Some(share) => writeln!(out, "  Reward: {}", format_reward(share))?,
            None => writeln!(out, "  Reward: unavailable")?,
        }
        if with_price {
            match record.link_price_usd {
                Some(price) => writeln!(out, "  LINK Price (USD): {:.2}", price)?,
                None => writeln!(out, "  LINK Price (USD): unavailable")?,
            }
        }
    }

    for warning in &record.warnings {
        writeln!(out, "  ⚠️  {}", warning)?;
    }

    Ok(())
}
