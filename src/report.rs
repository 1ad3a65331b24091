//! Run artifacts written at the end of a scan or verify run.
use crate::error::ScanError;
use crate::types::{AttemptOutcome, ScanResult, VerifiedServer};
use csv::Writer;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

pub const RESULTS_FILE: &str = "results.json";
pub const VERIFIED_JSON_FILE: &str = "verified_servers.json";
pub const VERIFIED_CSV_FILE: &str = "verified_servers.csv";
pub const SUMMARY_FILE: &str = "summary.txt";

const CSV_HEADER: [&str; 9] = [
    "URL",
    "IP",
    "Port",
    "Transport",
    "Protocol Version",
    "Server Name",
    "Tools Count",
    "Response Time (ms)",
    "SSL Enabled",
];

/// Write every report for `result` into `dir` and return the written paths.
pub fn write_all(dir: &Path, result: &ScanResult) -> Result<Vec<PathBuf>, ScanError> {
    fs::create_dir_all(dir).map_err(|e| report_err(dir, e))?;
    let paths = vec![
        dir.join(RESULTS_FILE),
        dir.join(VERIFIED_JSON_FILE),
        dir.join(VERIFIED_CSV_FILE),
        dir.join(SUMMARY_FILE),
    ];
    write_json(&paths[0], result)?;
    write_json(&paths[1], &result.verified)?;
    let csv = verified_csv(&result.verified).map_err(|e| report_err(&paths[2], e))?;
    fs::write(&paths[2], csv).map_err(|e| report_err(&paths[2], e))?;
    fs::write(&paths[3], render_summary(result)).map_err(|e| report_err(&paths[3], e))?;
    info!(dir = %dir.display(), verified = result.verified.len(), "reports written");
    Ok(paths)
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ScanError> {
    let file = File::create(path).map_err(|e| report_err(path, e))?;
    let mut w = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut w, value).map_err(|e| report_err(path, e))?;
    w.flush().map_err(|e| report_err(path, e))
}

/// One row per verified server, header first.
pub fn verified_csv(servers: &[VerifiedServer]) -> Result<Vec<u8>, csv::Error> {
    let mut wtr = Writer::from_writer(vec![]);
    wtr.write_record(CSV_HEADER)?;
    for s in servers {
        wtr.write_record(&[
            s.url.clone(),
            s.host.clone(),
            s.port.to_string(),
            s.confirmed_transport.to_string(),
            s.protocol_version.clone().unwrap_or_default(),
            s.server_info.name.clone().unwrap_or_default(),
            s.tools.len().to_string(),
            s.response_time_ms.to_string(),
            s.tls.to_string(),
        ])?;
    }
    wtr.into_inner().map_err(|e| csv::Error::from(e.into_error()))
}

pub fn render_summary(result: &ScanResult) -> String {
    let mut out = String::new();
    let rule = "=".repeat(80);
    let thin = "-".repeat(80);

    let _ = writeln!(out, "MCP Scan Summary - {}", result.scan_id);
    let _ = writeln!(out, "{rule}\n");
    let _ = writeln!(out, "Status: {}", result.status);
    let _ = writeln!(out, "Started: {}", rfc3339(result.started_at));
    if let Some(done) = result.finished_at {
        let _ = writeln!(out, "Completed: {}", rfc3339(done));
        let _ = writeln!(out, "Duration: {}", done - result.started_at);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Filters used: {}", result.filters_used.len());
    let _ = writeln!(out, "Filters failed: {}", result.filter_failures.len());
    let _ = writeln!(out, "Servers discovered: {}", result.discovered.len());
    let _ = writeln!(out, "Servers probed: {}", result.host_reports.len());
    let _ = writeln!(out, "Servers verified: {}", result.verified.len());

    if !result.filter_failures.is_empty() {
        let _ = writeln!(out, "\nFailed Filters:\n{thin}");
        for f in &result.filter_failures {
            let _ = writeln!(
                out,
                "  [{}] {} ({} attempt(s)): {}",
                f.category, f.query, f.attempts, f.reason
            );
        }
    }

    if !result.verified.is_empty() {
        let _ = writeln!(out, "\nVerified Servers:\n{thin}");
        for s in &result.verified {
            let _ = writeln!(out, "\nURL: {}", s.url);
            let _ = writeln!(out, "  IP: {}:{}", s.host, s.port);
            let _ = writeln!(out, "  Transport: {}", s.confirmed_transport);
            let _ = writeln!(out, "  Protocol: {}", s.protocol_version.as_deref().unwrap_or("N/A"));
            let _ = writeln!(
                out,
                "  Server: {}",
                s.server_info.name.as_deref().unwrap_or("Unknown")
            );
            let _ = writeln!(out, "  Tools: {}", s.tools.len());
            for tool in &s.tools {
                let _ = writeln!(
                    out,
                    "    - {}: {}",
                    tool.name,
                    tool.description.as_deref().unwrap_or("No description")
                );
            }
        }
    }

    let unverified: Vec<_> = result.host_reports.iter().filter(|r| !r.verified).collect();
    if !unverified.is_empty() {
        let _ = writeln!(out, "\nUnverified Hosts:\n{thin}");
        for r in unverified {
            let reasons: Vec<String> = r
                .attempts
                .iter()
                .map(|a| match &a.detail {
                    Some(d) if a.outcome != AttemptOutcome::ProtocolConfirmed => {
                        format!("{}={} ({d})", a.transport, a.outcome)
                    }
                    _ => format!("{}={}", a.transport, a.outcome),
                })
                .collect();
            let _ = writeln!(out, "  {}:{}  {}", r.host, r.port, reasons.join(", "));
        }
    }
    out
}

fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| t.to_string())
}

fn report_err(path: &Path, e: impl std::fmt::Display) -> ScanError {
    ScanError::Report(format!("{}: {e}", path.display()))
}
