use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::app::{
    CanonicalizeResult, FetchResult, LoadResult, ParseResult, ProgressEvent, ProgressSink,
};
use crate::query::AddressView;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_parse(result: &ParseResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_load(result: &LoadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_canonicalize(result: &CanonicalizeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_address(result: &AddressView) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_plots(result: &Value) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Forwards stage progress to the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
