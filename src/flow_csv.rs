//! Flow table CSV: written by the capture stage, read back by the merge stage.

use std::fs::{self, File};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SleuthError};
use crate::features::{DerivedFeatures, ProtocolTable};
use crate::flow::FlowAggregate;
use crate::timestamp::{format_timestamp, parse_timestamp};

pub const FLOW_COLUMNS: [&str; 14] = [
    "src_ip",
    "dst_ip",
    "src_port",
    "dst_port",
    "protocol",
    "protocol_type",
    "start_time",
    "end_time",
    "duration",
    "total_packets",
    "total_bytes",
    "src_bytes",
    "dst_bytes",
    "land",
];

/// One CSV row; field order matches [`FLOW_COLUMNS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlowRow {
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    protocol: u8,
    protocol_type: String,
    start_time: String,
    end_time: String,
    duration: String,
    total_packets: u64,
    total_bytes: u64,
    src_bytes: u64,
    dst_bytes: u64,
    land: u8,
}

impl FlowRow {
    fn from_flow(flow: &FlowAggregate, protocols: &ProtocolTable) -> Self {
        let derived = DerivedFeatures::derive(flow, protocols);
        FlowRow {
            src_ip: flow.src_ip,
            dst_ip: flow.dst_ip,
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            protocol: flow.protocol,
            protocol_type: derived.protocol_type,
            start_time: format_timestamp(&flow.start_time),
            end_time: format_timestamp(&flow.end_time),
            duration: format!("{:.6}", derived.duration),
            total_packets: flow.total_packets,
            total_bytes: flow.total_bytes,
            src_bytes: flow.src_bytes,
            dst_bytes: flow.dst_bytes,
            land: derived.land,
        }
    }

    fn into_flow(self) -> Option<FlowAggregate> {
        let start_time = parse_timestamp(&self.start_time)?;
        let end_time = parse_timestamp(&self.end_time)?;
        if end_time < start_time {
            return None;
        }
        Some(FlowAggregate {
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            src_port: self.src_port,
            dst_port: self.dst_port,
            protocol: self.protocol,
            start_time,
            end_time,
            total_packets: self.total_packets,
            total_bytes: self.total_bytes,
            src_bytes: self.src_bytes,
            dst_bytes: self.dst_bytes,
        })
    }
}

/// Writes a flow table. The header row is written even when `flows` is empty.
pub fn write_flow_csv(
    flows: &[FlowAggregate],
    protocols: &ProtocolTable,
    output_path: &Path,
) -> Result<()> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| SleuthError::io(parent, e))?;
    }
    let file = File::create(output_path).map_err(|e| SleuthError::io(output_path, e))?;
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(file);
    let csv_err = |e| SleuthError::csv(output_path, e);
    wtr.write_record(FLOW_COLUMNS).map_err(csv_err)?;
    for flow in flows {
        wtr.serialize(FlowRow::from_flow(flow, protocols))
            .map_err(csv_err)?;
    }
    wtr.flush().map_err(|e| SleuthError::io(output_path, e))?;
    Ok(())
}

/// Outcome of reading flow tables back in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowLoadStats {
    pub files: usize,
    pub rows: usize,
    pub malformed_rows: usize,
    pub unreadable_files: Vec<PathBuf>,
}

/// Reads one flow table. Rows that fail to parse are skipped and counted;
/// an I/O failure makes the whole file an error.
pub fn read_flow_csv(path: &Path) -> Result<(Vec<FlowAggregate>, usize)> {
    let mut rdr = ReaderBuilder::new()
        .from_path(path)
        .map_err(|e| SleuthError::csv(path, e))?;
    rdr.headers().map_err(|e| SleuthError::csv(path, e))?;
    let mut flows = Vec::new();
    let mut malformed = 0;
    for (idx, result) in rdr.deserialize::<FlowRow>().enumerate() {
        let row = match result {
            Ok(row) => row.into_flow(),
            Err(e) if e.is_io_error() => return Err(SleuthError::csv(path, e)),
            Err(_) => None,
        };
        match row {
            Some(flow) => flows.push(flow),
            None => {
                malformed += 1;
                debug!("Skipping malformed flow row {} in {:?}", idx + 2, path);
            }
        }
    }
    Ok((flows, malformed))
}

/// Loads every `*.csv` in `dir`, in file-name order. A file that cannot be
/// read is reported and skipped; the directory itself must be readable.
pub fn load_flow_dir(dir: &Path) -> Result<(Vec<FlowAggregate>, FlowLoadStats)> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| SleuthError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    paths.sort();

    let mut flows = Vec::new();
    let mut stats = FlowLoadStats::default();
    for path in paths {
        info!("Loading flow table: {:?}", path);
        match read_flow_csv(&path) {
            Ok((file_flows, malformed)) => {
                stats.files += 1;
                stats.rows += file_flows.len();
                stats.malformed_rows += malformed;
                flows.extend(file_flows);
            }
            Err(e) => {
                warn!("{}", e);
                stats.unreadable_files.push(path);
            }
        }
    }
    info!(
        "Loaded {} flows from {} files ({} malformed rows skipped)",
        stats.rows, stats.files, stats.malformed_rows
    );
    Ok((flows, stats))
}
