use std::io::{self, Write};

use serde::Serialize;

use crate::pipeline::RunSummary;
use crate::pivot::PivotRow;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_rows(rows: &[PivotRow]) -> io::Result<()> {
        Self::print_json(&rows)
    }

    pub fn print_count(label: &str, count: usize) -> io::Result<()> {
        Self::print_json(&serde_json::json!({ label: count }))
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
