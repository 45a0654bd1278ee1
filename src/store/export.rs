//! CSV exports of the usage log and the baseline table.

use crate::settings::FlowSettings;
use crate::store::baseline::BaselineMap;
use crate::store::log::LogEntry;
use crate::store::StoreError;
use csv::{QuoteStyle, Terminator, WriterBuilder};

pub const LOG_CSV_HEADER: &str = "Date, Start Time, Duration, Stations, Valves, Usage, Units";
pub const RATES_CSV_HEADER: &str = "Station, Rate, Units, Recorded";

/// Writer into memory with `header` already in place. Fields are quoted
/// only when they contain a delimiter, quote or line break.
fn csv_writer(header: &str) -> csv::Writer<Vec<u8>> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(header.as_bytes());
    buf.push(b'\n');
    WriterBuilder::new()
        .has_headers(false)
        .quote_style(QuoteStyle::Necessary)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(buf)
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String, StoreError> {
    let bytes = writer
        .into_inner()
        .map_err(|e| StoreError::Io(e.into_error()))?;
    String::from_utf8(bytes)
        .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// Usage log as CSV, rows in the order given.
pub fn log_csv<'a>(
    entries: impl IntoIterator<Item = &'a LogEntry>,
) -> Result<String, StoreError> {
    let mut writer = csv_writer(LOG_CSV_HEADER);
    for e in entries {
        let usage = e.usage.to_string();
        writer.write_record([
            e.date.as_str(),
            e.start.as_str(),
            e.duration.as_str(),
            e.stations.as_str(),
            e.valves.as_str(),
            usage.as_str(),
            e.measure.as_str(),
        ])?;
    }
    finish(writer)
}

/// Baseline table as CSV, rates in volume per hour.
pub fn rates_csv(
    baselines: &BaselineMap,
    station_name: impl Fn(usize) -> String,
    settings: &FlowSettings,
) -> Result<String, StoreError> {
    let mut writer = csv_writer(RATES_CSV_HEADER);
    let unit = rate_unit(settings);
    for (station, history) in baselines {
        writer.write_record([
            station_name(*station),
            format_rate(history.rate, settings),
            unit.clone(),
            history.time.format("%Y-%m-%d %H:%M:%S").to_string(),
        ])?;
    }
    finish(writer)
}

/// A pulses/hour rate in volume/hour with one decimal, or raw pulses/hour
/// when no calibration is set.
pub fn format_rate(pulses_per_hour: f64, settings: &FlowSettings) -> String {
    if settings.calibrated() {
        format!("{:.1}", pulses_per_hour / settings.pulses_per_measure)
    } else {
        format!("{pulses_per_hour:.1}")
    }
}

/// Unit label matching [`format_rate`].
pub fn rate_unit(settings: &FlowSettings) -> String {
    if settings.calibrated() {
        format!("{}/hr", settings.volume_measure)
    } else {
        "pulses/hr".to_string()
    }
}
