use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

/// Minimal legacy PCAP (microsecond, little-endian).
fn legacy_pcap(frames: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0xA1B2_C3D4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    for (sec, usec, data) in frames {
        out.extend_from_slice(&sec.to_le_bytes());
        out.extend_from_slice(&usec.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
    }
    out
}

/// Ethernet + IPv4 + TCP frame.
fn tcp_frame(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    flags: u8,
    ident: u16,
) -> Vec<u8> {
    let mut b = Vec::new();
    b.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    b.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    b.extend_from_slice(&[0x08, 0x00]);
    b.extend_from_slice(&[0x45, 0]);
    b.extend_from_slice(&40u16.to_be_bytes());
    b.extend_from_slice(&ident.to_be_bytes());
    b.extend_from_slice(&[0, 0, 64, 6, 0, 0]);
    b.extend_from_slice(&src);
    b.extend_from_slice(&dst);
    b.extend_from_slice(&sport.to_be_bytes());
    b.extend_from_slice(&dport.to_be_bytes());
    b.extend_from_slice(&1u32.to_be_bytes());
    b.extend_from_slice(&0u32.to_be_bytes());
    b.push(0x50);
    b.push(flags);
    b.extend_from_slice(&0x2000u16.to_be_bytes());
    b.extend_from_slice(&[0, 0, 0, 0]);
    b
}

fn sample_capture() -> Vec<u8> {
    sample_capture_at(1_700_000_000, 50123, 0x0100)
}

fn sample_capture_at(sec: u32, client_port: u16, ident_base: u16) -> Vec<u8> {
    let syn = tcp_frame(
        [10, 0, 0, 1],
        client_port,
        [10, 0, 0, 2],
        1433,
        0x02,
        ident_base + 1,
    );
    let syn_ack = tcp_frame(
        [10, 0, 0, 2],
        1433,
        [10, 0, 0, 1],
        client_port,
        0x12,
        ident_base + 2,
    );
    legacy_pcap(&[(sec, 0, syn), (sec, 500, syn_ack)])
}

#[test]
fn analyse_prints_summary_and_exits_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("capture.pcap");
    fs::write(&input, sample_capture()).expect("write capture");

    Command::cargo_bin("sqltrace")
        .expect("binary")
        .args(["analyse", input.to_str().expect("utf-8 path")])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 frames"))
        .stdout(predicate::str::contains("1 TCP"));
}

#[test]
fn analyse_writes_report_csv_and_json() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("capture.pcap");
    fs::write(&input, sample_capture()).expect("write capture");
    let report = dir.path().join("report.txt");
    let csv = dir.path().join("stats.csv");
    let json = dir.path().join("report.json");

    Command::cargo_bin("sqltrace")
        .expect("binary")
        .args([
            "analyze", // the alias works too
            input.to_str().expect("utf-8 path"),
            "-o",
            report.to_str().expect("utf-8 path"),
            "--csv",
            csv.to_str().expect("utf-8 path"),
            "--json",
            json.to_str().expect("utf-8 path"),
            "--quiet",
        ])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let report_text = fs::read_to_string(&report).expect("report written");
    assert!(report_text.contains("Totals: 2 frames"));

    let csv_text = fs::read_to_string(&csv).expect("csv written");
    assert!(csv_text.starts_with("server,client,"));

    let json_value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&json).expect("json written"))
            .expect("json parses");
    assert_eq!(json_value["report_version"], 1);
    assert_eq!(json_value["totals"]["frames"], 2);
}

#[test]
fn missing_file_exits_with_error_and_hint() {
    Command::cargo_bin("sqltrace")
        .expect("binary")
        .args(["analyse", "no-such-file.pcap"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("file not found"))
        .stderr(predicate::str::contains("hint:"));
}

#[test]
fn wildcard_filespec_expands() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join("a.pcap"),
        sample_capture_at(1_700_000_000, 50123, 0x0100),
    )
    .expect("write capture");
    fs::write(
        dir.path().join("b.pcap"),
        sample_capture_at(1_700_000_060, 50999, 0x0900),
    )
    .expect("write capture");
    let spec = dir.path().join("*.pcap");

    Command::cargo_bin("sqltrace")
        .expect("binary")
        .args(["analyse", spec.to_str().expect("utf-8 path")])
        .assert()
        .success()
        .stdout(predicate::str::contains("4 frames"));
}
