//! Offline capture files as streaming packet sources.

use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use log::{info, warn};
use pcap::{Capture, Offline};
use rayon::prelude::*;

use crate::error::{DecodeError, Result, SleuthError};
use crate::features::ProtocolTable;
use crate::flow::{AggregationStats, FlowTable};
use crate::flow_csv::write_flow_csv;
use crate::packet::{LinkType, Packet, decode_frame};

/// Streams decoded packets out of a capture file one record at a time.
///
/// A read error other than end-of-file ends the stream; the error is
/// yielded once and [`CaptureReader::truncated`] reports it afterwards.
pub struct CaptureReader {
    cap: Capture<Offline>,
    link: LinkType,
    truncated: bool,
    done: bool,
}

impl CaptureReader {
    pub fn open(path: &Path) -> Result<Self> {
        let cap = Capture::from_file(path).map_err(|source| SleuthError::CaptureOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let dlt = cap.get_datalink().0;
        let link = LinkType::from_dlt(dlt).ok_or_else(|| SleuthError::UnsupportedLinkType {
            path: path.to_path_buf(),
            linktype: dlt,
        })?;
        Ok(CaptureReader {
            cap,
            link,
            truncated: false,
            done: false,
        })
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for CaptureReader {
    type Item = std::result::Result<Packet, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cap.next_packet() {
            Ok(raw) => {
                let sec = raw.header.ts.tv_sec as i64;
                let usec = raw.header.ts.tv_usec as i64;
                let ts = match u32::try_from(usec * 1000)
                    .ok()
                    .and_then(|nanos| Utc.timestamp_opt(sec, nanos).single())
                {
                    Some(ts) => ts,
                    None => return Some(Err(DecodeError::Timestamp { sec, usec })),
                };
                Some(decode_frame(raw.data, self.link, ts, raw.header.len))
            }
            Err(pcap::Error::NoMorePackets) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.truncated = true;
                Some(Err(DecodeError::Read(e.to_string())))
            }
        }
    }
}

/// What happened to one capture file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSummary {
    pub input: PathBuf,
    pub output: PathBuf,
    pub flows: usize,
    pub stats: AggregationStats,
    pub truncated: bool,
}

/// Aggregates a capture into a flow table in one streaming pass.
pub fn aggregate_capture(path: &Path, max_packets: Option<u64>) -> Result<(FlowTable, AggregationStats, bool)> {
    info!("Reading {:?}", path);
    let mut reader = CaptureReader::open(path)?;
    let mut table = FlowTable::new();
    let stats = table.ingest(reader.by_ref(), max_packets);
    if reader.truncated() {
        warn!("Capture {:?} ended with a read error; keeping partial flows", path);
    }
    Ok((table, stats, reader.truncated()))
}

/// Output path for a capture: `<output_dir>/<stem>.csv`.
pub fn flow_csv_path(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    output_dir.join(format!("{}.csv", stem))
}

/// Turns one capture file into one flow table CSV.
pub fn process_capture(
    input: &Path,
    output_dir: &Path,
    protocols: &ProtocolTable,
    max_packets: Option<u64>,
) -> Result<CaptureSummary> {
    let (table, stats, truncated) = aggregate_capture(input, max_packets)?;
    let output = flow_csv_path(input, output_dir);
    let flows = table.into_flows();
    write_flow_csv(&flows, protocols, &output)?;
    info!(
        "{:?}: {} packets read, {} flows, {} skipped; wrote {:?}",
        input,
        stats.packets_read,
        flows.len(),
        stats.skipped(),
        output
    );
    Ok(CaptureSummary {
        input: input.to_path_buf(),
        output,
        flows: flows.len(),
        stats,
        truncated,
    })
}

/// Processes independent captures concurrently. Results come back in input
/// order; one failing file does not affect the others.
pub fn process_captures(
    inputs: &[PathBuf],
    output_dir: &Path,
    protocols: &ProtocolTable,
    max_packets: Option<u64>,
) -> Vec<Result<CaptureSummary>> {
    inputs
        .par_iter()
        .map(|input| process_capture(input, output_dir, protocols, max_packets))
        .collect()
}
