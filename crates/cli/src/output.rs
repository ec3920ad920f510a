//! Bar output formatting

use std::io::Write;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use index_core::{Bar, Instrument, Price};

/// How bars are written to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `<unix seconds> <price>` per line, after a header
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(anyhow::anyhow!("Unknown output format: {}", other)),
        }
    }
}

#[derive(Serialize)]
struct BarLine<'a> {
    instrument: &'a Instrument,
    timestamp: i64,
    time: DateTime<Utc>,
    price: &'a Price,
}

pub fn write_header(out: &mut impl Write, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Text {
        writeln!(out, "Timestamp IndexPrice")?;
    }
    Ok(())
}

pub fn write_bar(out: &mut impl Write, bar: &Bar, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => writeln!(out, "{} {}", bar.unix_timestamp(), bar.price)?,
        OutputFormat::Json => {
            let line = BarLine {
                instrument: &bar.instrument,
                timestamp: bar.unix_timestamp(),
                time: bar.timestamp,
                price: &bar.price,
            };
            serde_json::to_writer(&mut *out, &line)?;
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(())
}
