use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

// Minimal little-endian pcap with an Ethernet link type.
fn pcap_bytes(frames: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    for (sec, frame) in frames {
        out.extend_from_slice(&sec.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }
    out
}

fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
    let mut frame = vec![0u8; 14 + 20 + 8];
    frame[12] = 0x08;
    let ip = &mut frame[14..34];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&28u16.to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);
    let udp = &mut frame[34..42];
    udp[0..2].copy_from_slice(&sport.to_be_bytes());
    udp[2..4].copy_from_slice(&dport.to_be_bytes());
    udp[4..6].copy_from_slice(&8u16.to_be_bytes());
    frame
}

fn write_capture(path: &Path) {
    let query = udp_frame([10, 0, 0, 5], [10, 0, 0, 1], 40000, 53);
    let answer = udp_frame([10, 0, 0, 1], [10, 0, 0, 5], 53, 40000);
    fs::write(path, pcap_bytes(&[(100, query), (101, answer)])).expect("Failed to write pcap");
}

fn flow_sleuth() -> Command {
    let mut cmd = Command::cargo_bin("flow-sleuth").expect("Failed to find binary");
    cmd.env_remove("ATTACKER_IP").env_remove("NORMAL_IP");
    cmd
}

#[test]
fn test_flows_writes_csv_per_capture() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let input = temp_dir.path().join("capture-001.pcap");
    write_capture(&input);
    let output_dir = temp_dir.path().join("csv");

    flow_sleuth()
        .arg("flows")
        .arg("-i")
        .arg(&input)
        .arg("-o")
        .arg(&output_dir)
        .assert()
        .success();

    let content =
        fs::read_to_string(output_dir.join("capture-001.csv")).expect("CSV output file not found");
    let mut lines = content.lines();
    assert_eq!(
        lines.next(),
        Some(
            "src_ip,dst_ip,src_port,dst_port,protocol,protocol_type,start_time,end_time,duration,total_packets,total_bytes,src_bytes,dst_bytes,land"
        )
    );
    let row = lines.next().expect("missing flow row");
    assert!(row.contains("10.0.0.5,10.0.0.1,40000,53,17,udp"));
    assert!(row.ends_with(",1.000000,2,84,42,42,0"));
    assert_eq!(lines.next(), None);
}

#[test]
fn test_flows_missing_capture_fails() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    flow_sleuth()
        .arg("flows")
        .arg("-i")
        .arg(temp_dir.path().join("missing.pcap"))
        .arg("-o")
        .arg(temp_dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("capture files failed"));
}

#[test]
fn test_merge_labels_and_reports() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let csv_dir = temp_dir.path().join("csv");
    let logs_dir = temp_dir.path().join("logs");
    fs::create_dir_all(&logs_dir).unwrap();
    let input = temp_dir.path().join("capture.pcap");
    write_capture(&input);
    flow_sleuth()
        .args(["flows", "-o"])
        .arg(&csv_dir)
        .arg("-i")
        .arg(&input)
        .assert()
        .success();

    fs::write(
        logs_dir.join("traffic-1.log"),
        concat!(
            r#"{"message":"Traffic Log","timestamp":"1970-01-01T00:01:40.500Z","ip":"::ffff:10.0.0.5","src_port":"40000","url":"/login","response_status":401}"#,
            "\n",
            r#"{"message":"Traffic Log","timestamp":"1970-01-01T00:01:40Z","ip":"10.0.0.8","src_port":1000}"#,
            "\n",
        ),
    )
    .unwrap();
    let output = temp_dir.path().join("out").join("merged.csv");

    flow_sleuth()
        .arg("merge")
        .arg("--logs-dir")
        .arg(&logs_dir)
        .arg("--csv-dir")
        .arg(&csv_dir)
        .arg("-o")
        .arg(&output)
        .args(["--attacker-ip", "10.0.0.5", "--normal-ip", "10.0.0.0/24"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved 2 records"))
        .stdout(predicate::str::contains("Matched 1 of 2 records"))
        .stdout(predicate::str::contains("Label Distribution:"))
        .stdout(predicate::str::contains("attack: 1 (50.0%)"))
        .stdout(predicate::str::contains("normal: 1 (50.0%)"));

    let merged = fs::read_to_string(&output).expect("merged CSV not written");
    assert_eq!(merged.lines().count(), 3);
    assert!(merged.lines().next().unwrap().ends_with(",label"));
}

#[test]
fn test_merge_without_logs_writes_nothing() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let output = temp_dir.path().join("merged.csv");
    flow_sleuth()
        .arg("merge")
        .arg("--logs-dir")
        .arg(temp_dir.path())
        .arg("--csv-dir")
        .arg(temp_dir.path())
        .arg("-o")
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("No records to save."))
        .stdout(predicate::str::contains("Label Distribution").not());
    assert!(!output.exists());
}

#[test]
fn test_watch_once_converts_and_deletes() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let pcap_dir = temp_dir.path().join("pcap");
    let csv_dir = temp_dir.path().join("csv");
    fs::create_dir_all(&pcap_dir).unwrap();
    write_capture(&pcap_dir.join("capture-1.pcap"));
    fs::write(pcap_dir.join("notes.txt"), "ignored").unwrap();

    let config = temp_dir.path().join("flow-sleuth.toml");
    fs::write(&config, "[capture]\nsettle_secs = 0\n").unwrap();

    flow_sleuth()
        .arg("--config")
        .arg(&config)
        .arg("watch")
        .arg("--pcap-dir")
        .arg(&pcap_dir)
        .arg("--csv-dir")
        .arg(&csv_dir)
        .arg("--once")
        .assert()
        .success();

    assert!(csv_dir.join("capture-1.csv").exists());
    assert!(!pcap_dir.join("capture-1.pcap").exists());
    assert!(pcap_dir.join("notes.txt").exists());
}

#[test]
fn test_bad_config_is_rejected() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let config = temp_dir.path().join("bad.toml");
    fs::write(&config, "[matching]\ntolerance_ms = \"soon\"\n").unwrap();
    flow_sleuth()
        .arg("--config")
        .arg(&config)
        .arg("merge")
        .assert()
        .failure();
}
