//! Joins request logs with reconstructed flows into labelled feature rows.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;

use log::info;
use rayon::prelude::*;
use serde::Serialize;

use crate::error::{Result, SleuthError};
use crate::features::{DEFAULT_SERVICE_PORT, DerivedFeatures, FeatureTables};
use crate::flow::FlowAggregate;
use crate::flow_csv::{FlowLoadStats, load_flow_dir};
use crate::index::FlowIndex;
use crate::l7::{L7LoadStats, L7LogEntry, load_l7_logs};
use crate::label::{Label, Labeler};
use crate::matcher::{MatchOutcome, Matcher};
use crate::timestamp::format_timestamp;

pub const ANONYMOUS_USER: &str = "anonymous";
const LOGIN_PATH: &str = "/login";

/// One output row: request fields, matched flow fields, derived features
/// and the label. Flow columns are empty when no flow matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRecord {
    pub timestamp: String,
    pub request_id: String,
    pub src_ip: String,
    pub src_port: u16,
    pub method: String,
    pub url: String,
    pub response_status: u16,
    pub duration_ms: String,
    pub user: String,
    pub security_level: String,
    pub response_size: String,
    pub user_agent: String,
    pub num_headers: String,
    pub num_query_params: String,
    pub num_body_keys: String,
    pub request_content_length: String,
    pub request_body: String,

    pub dst_port: Option<u16>,
    pub protocol: Option<u8>,
    pub protocol_type: Option<String>,
    pub flow_start_time: Option<String>,
    pub flow_end_time: Option<String>,
    pub flow_duration: Option<String>,
    pub total_packets: Option<u64>,
    pub total_bytes: Option<u64>,
    pub src_bytes: Option<u64>,
    pub dst_bytes: Option<u64>,
    pub land: u8,

    pub service: String,
    pub logged_in: u8,
    pub is_guest_login: u8,
    pub num_failed_logins: u8,

    pub label: Label,
}

/// Flow-derived part of a record.
#[derive(Debug, Clone, Default, PartialEq)]
struct FlowColumns {
    dst_port: Option<u16>,
    protocol: Option<u8>,
    protocol_type: Option<String>,
    flow_start_time: Option<String>,
    flow_end_time: Option<String>,
    flow_duration: Option<String>,
    total_packets: Option<u64>,
    total_bytes: Option<u64>,
    src_bytes: Option<u64>,
    dst_bytes: Option<u64>,
    land: u8,
}

impl FlowColumns {
    fn from_flow(flow: &FlowAggregate, tables: &FeatureTables) -> Self {
        let derived = DerivedFeatures::derive(flow, &tables.protocols);
        FlowColumns {
            dst_port: Some(flow.dst_port),
            protocol: Some(flow.protocol),
            protocol_type: Some(derived.protocol_type),
            flow_start_time: Some(format_timestamp(&flow.start_time)),
            flow_end_time: Some(format_timestamp(&flow.end_time)),
            flow_duration: Some(format!("{:.6}", derived.duration)),
            total_packets: Some(flow.total_packets),
            total_bytes: Some(flow.total_bytes),
            src_bytes: Some(flow.src_bytes),
            dst_bytes: Some(flow.dst_bytes),
            land: derived.land,
        }
    }
}

/// Login-related NSL-KDD flags computed from the request alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginFeatures {
    pub logged_in: u8,
    pub is_guest_login: u8,
    pub num_failed_logins: u8,
}

impl LoginFeatures {
    pub fn from_request(user: &str, url: &str, status: u16) -> Self {
        let logged_in = !user.is_empty() && user != ANONYMOUS_USER;
        let is_guest = user.eq_ignore_ascii_case("guest");
        let failed_login = url.contains(LOGIN_PATH) && matches!(status, 200 | 401) && !logged_in;
        LoginFeatures {
            logged_in: u8::from(logged_in),
            is_guest_login: u8::from(is_guest),
            num_failed_logins: u8::from(failed_login),
        }
    }
}

/// Carried-through counters keep their logged text; absent ones become `0`.
fn logged_count(value: Option<&str>) -> String {
    value.unwrap_or("0").to_string()
}

/// Builds the row for one request given its match result.
pub fn assemble_record(
    entry: &L7LogEntry,
    flow: Option<&FlowAggregate>,
    labeler: &Labeler,
    tables: &FeatureTables,
) -> MergedRecord {
    let src_ip = entry.client_addr().to_string();
    let user = entry
        .user
        .clone()
        .unwrap_or_else(|| ANONYMOUS_USER.to_string());
    let url = entry.url.clone().unwrap_or_default();
    let response_status = entry.response_status.unwrap_or(0);
    let login = LoginFeatures::from_request(&user, &url, response_status);
    let service_port = flow.map_or(DEFAULT_SERVICE_PORT, |f| f.dst_port);
    let columns = flow
        .map(|f| FlowColumns::from_flow(f, tables))
        .unwrap_or_default();
    let label = labeler.label(&src_ip);

    MergedRecord {
        timestamp: entry.timestamp.clone(),
        request_id: entry.request_id.clone().unwrap_or_default(),
        src_ip,
        src_port: entry.src_port.unwrap_or(0),
        method: entry.method.clone().unwrap_or_default(),
        url,
        response_status,
        duration_ms: logged_count(entry.duration_ms.as_deref()),
        user,
        security_level: entry.security_level.clone().unwrap_or_default(),
        response_size: logged_count(entry.response_size.as_deref()),
        user_agent: entry.user_agent.clone().unwrap_or_default(),
        num_headers: logged_count(entry.num_headers.as_deref()),
        num_query_params: logged_count(entry.num_query_params.as_deref()),
        num_body_keys: logged_count(entry.num_body_keys.as_deref()),
        request_content_length: logged_count(entry.request_content_length.as_deref()),
        request_body: entry.request_body(),

        dst_port: columns.dst_port,
        protocol: columns.protocol,
        protocol_type: columns.protocol_type,
        flow_start_time: columns.flow_start_time,
        flow_end_time: columns.flow_end_time,
        flow_duration: columns.flow_duration,
        total_packets: columns.total_packets,
        total_bytes: columns.total_bytes,
        src_bytes: columns.src_bytes,
        dst_bytes: columns.dst_bytes,
        land: columns.land,

        service: tables.services.lookup(service_port).to_string(),
        logged_in: login.logged_in,
        is_guest_login: login.is_guest_login,
        num_failed_logins: login.num_failed_logins,

        label,
    }
}

/// Count of records per label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDistribution(BTreeMap<Label, usize>);

impl LabelDistribution {
    pub fn add(&mut self, label: Label) {
        *self.0.entry(label).or_default() += 1;
    }

    pub fn count(&self, label: Label) -> usize {
        self.0.get(&label).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    /// Lines of `label: count (pct%)`, alphabetical by label.
    pub fn report_lines(&self) -> Vec<String> {
        let total = self.total();
        self.0
            .iter()
            .map(|(label, &count)| {
                let pct = if total == 0 {
                    0.0
                } else {
                    100.0 * count as f64 / total as f64
                };
                format!("{}: {} ({:.1}%)", label, count, pct)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub records: usize,
    pub matched: usize,
    /// Entries whose timestamp or client endpoint could not be used
    pub unmatchable: usize,
    pub labels: LabelDistribution,
}

pub struct MergeOutput {
    pub records: Vec<MergedRecord>,
    pub stats: MergeStats,
}

/// Matches, labels and assembles every entry, preserving input order.
pub fn merge_entries(
    entries: &[L7LogEntry],
    index: &FlowIndex,
    matcher: &Matcher,
    labeler: &Labeler,
    tables: &FeatureTables,
) -> MergeOutput {
    info!(
        "Merging {} L7 entries against {} flows",
        entries.len(),
        index.len()
    );
    let results: Vec<(MergedRecord, MatchOutcome<'_>)> = entries
        .par_iter()
        .map(|entry| {
            let outcome = matcher.find(entry, index);
            let record = assemble_record(entry, outcome.flow(), labeler, tables);
            (record, outcome)
        })
        .collect();

    let mut stats = MergeStats::default();
    let mut records = Vec::with_capacity(results.len());
    for (record, outcome) in results {
        match outcome {
            MatchOutcome::Matched(_) => stats.matched += 1,
            MatchOutcome::Unmatchable => stats.unmatchable += 1,
            MatchOutcome::NoCandidate => {}
        }
        stats.labels.add(record.label);
        records.push(record);
    }
    stats.records = records.len();
    info!(
        "Merged {} records ({} matched with L3/4 flows)",
        stats.records, stats.matched
    );
    MergeOutput { records, stats }
}

/// Writes merged records. Returns `false`, writing nothing, when there are
/// no records.
pub fn write_merged_csv(records: &[MergedRecord], output_path: &Path) -> Result<bool> {
    if records.is_empty() {
        info!("No records to save.");
        return Ok(false);
    }
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| SleuthError::io(parent, e))?;
    }
    let file = File::create(output_path).map_err(|e| SleuthError::io(output_path, e))?;
    let mut wtr = csv::Writer::from_writer(file);
    for record in records {
        wtr.serialize(record)
            .map_err(|e| SleuthError::csv(output_path, e))?;
    }
    wtr.flush().map_err(|e| SleuthError::io(output_path, e))?;
    info!("Saved {} records to {:?}", records.len(), output_path);
    Ok(true)
}

/// Everything the merge stage needs besides its inputs.
#[derive(Debug, Clone, Default)]
pub struct MergeSettings {
    pub matcher: Matcher,
    pub labeler: Labeler,
    pub tables: FeatureTables,
}

/// Completeness summary of a merge run.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    pub l7: L7LoadStats,
    pub flows: FlowLoadStats,
    pub merge: MergeStats,
    /// `false` when there were no records and no file was written
    pub written: bool,
}

/// Loads request logs and flow tables, merges them and writes the dataset.
pub fn run_merge(
    logs_dir: &Path,
    csv_dir: &Path,
    output_path: &Path,
    settings: &MergeSettings,
) -> Result<MergeReport> {
    let (entries, l7) = load_l7_logs(logs_dir)?;
    let (flows, flow_stats) = load_flow_dir(csv_dir)?;
    info!("Building flow index...");
    let index = FlowIndex::build(flows);
    let output = merge_entries(
        &entries,
        &index,
        &settings.matcher,
        &settings.labeler,
        &settings.tables,
    );
    let written = write_merged_csv(&output.records, output_path)?;
    Ok(MergeReport {
        l7,
        flows: flow_stats,
        merge: output.stats,
        written,
    })
}
