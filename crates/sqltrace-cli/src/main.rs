use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glob::glob;

use sqltrace_core::{
    AnalysisOptions, AnalysisOutput, Report, TICKS_PER_SECOND, analyze_files,
};

#[derive(Parser, Debug)]
#[command(name = "sqltrace")]
#[command(version)]
#[command(
    about = "Offline analyzer for SQL Server network captures (NetMon / PCAP / PCAPNG).",
    long_about = None,
    after_help = "Examples:\n  sqltrace analyse trace.pcap -o report.txt\n  sqltrace analyse 'traces/*.cap' -o report.txt --csv stats.csv\n  sqltrace analyse trace.pcapng --json report.json --diag diag.log"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyse capture file(s) and report SQL Server login outcomes.
    #[command(alias = "analyze")]
    Analyse {
        /// Capture file or wildcard filespec (.cap, .pcap, .pcapng)
        filespec: String,

        /// Output report path (human-readable text)
        #[arg(short = 'o', long)]
        report: Option<PathBuf>,

        /// Per-conversation statistics as CSV
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Full report model as JSON
        #[arg(long)]
        json: Option<PathBuf>,

        /// Diagnostic stream output path
        #[arg(long)]
        diag: Option<PathBuf>,

        /// Suppress the summary on stdout
        #[arg(long)]
        quiet: bool,

        /// Bounded look-back used by the TCP analysis passes
        #[arg(long, default_value_t = 20)]
        lookback: usize,

        /// Idle seconds after a RESET before a reused port pair starts a
        /// new conversation
        #[arg(long, default_value_t = 10)]
        idle_threshold: u64,

        /// Ignore conversations with either port below this value
        #[arg(long, default_value_t = 500)]
        sql_port_floor: u16,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env().init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Analyse {
            filespec,
            report,
            csv,
            json,
            diag,
            quiet,
            lookback,
            idle_threshold,
            sql_port_floor,
        } => cmd_analyse(
            &filespec,
            report,
            csv,
            json,
            diag,
            quiet,
            AnalysisOptions {
                lookback,
                idle_reuse_threshold: idle_threshold * TICKS_PER_SECOND,
                sql_port_floor,
            },
        ),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err.message);
            if let Some(hint) = err.hint {
                eprintln!("hint: {hint}");
            }
            ExitCode::from(2)
        }
    }
}

#[derive(Debug)]
struct CliError {
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            message: message.into(),
            hint,
        }
    }
}

fn cmd_analyse(
    filespec: &str,
    report_path: Option<PathBuf>,
    csv_path: Option<PathBuf>,
    json_path: Option<PathBuf>,
    diag_path: Option<PathBuf>,
    quiet: bool,
    opts: AnalysisOptions,
) -> Result<(), CliError> {
    let paths = expand_filespec(filespec)?;
    let output = analyze_files(&paths, &opts).map_err(|e| {
        CliError::new(
            e.to_string(),
            Some(format!("no capture files matched '{filespec}'")),
        )
    })?;

    write_outputs(&output, &report_path, &csv_path, &json_path, &diag_path)
        .map_err(|e| CliError::new(format!("{e:#}"), None))?;

    if !quiet {
        print_summary(&output);
    }
    Ok(())
}

fn write_outputs(
    output: &AnalysisOutput,
    report_path: &Option<PathBuf>,
    csv_path: &Option<PathBuf>,
    json_path: &Option<PathBuf>,
    diag_path: &Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(path) = report_path {
        fs::write(path, render_text_report(&output.report))
            .with_context(|| format!("cannot write report {}", path.display()))?;
    }
    if let Some(path) = csv_path {
        fs::write(path, render_csv(&output.report))
            .with_context(|| format!("cannot write CSV {}", path.display()))?;
    }
    if let Some(path) = json_path {
        let json =
            serde_json::to_string_pretty(&output.report).context("cannot serialize report")?;
        fs::write(path, json).with_context(|| format!("cannot write JSON {}", path.display()))?;
    }
    if let Some(path) = diag_path {
        let mut lines = output.diagnostics.render_lines().join("\n");
        lines.push('\n');
        fs::write(path, lines)
            .with_context(|| format!("cannot write diagnostics {}", path.display()))?;
    }
    Ok(())
}

fn expand_filespec(filespec: &str) -> Result<Vec<PathBuf>, CliError> {
    if filespec.contains('*') || filespec.contains('?') {
        let entries = glob(filespec)
            .map_err(|e| CliError::new(format!("bad filespec '{filespec}': {e}"), None))?;
        let paths: Vec<PathBuf> = entries.filter_map(Result::ok).collect();
        if paths.is_empty() {
            return Err(CliError::new(
                format!("no files matched '{filespec}'"),
                Some("check the wildcard pattern and working directory".to_string()),
            ));
        }
        Ok(paths)
    } else {
        let path = PathBuf::from(filespec);
        if !path.exists() {
            return Err(CliError::new(
                format!("file not found: {filespec}"),
                Some("supported formats: NetMon .cap, .pcap, .pcapng".to_string()),
            ));
        }
        Ok(vec![path])
    }
}

fn print_summary(output: &AnalysisOutput) {
    let totals = &output.report.totals;
    println!(
        "{} frames, {} conversations ({} TCP, {} UDP), {} SQL",
        totals.frames,
        totals.conversations,
        totals.tcp_conversations,
        totals.udp_conversations,
        totals.sql_conversations
    );
    for server in &output.report.sql_servers {
        println!(
            "SQL Server {}: {} conversation(s), {} login failure(s)",
            server.endpoint, server.conversation_count, server.login_failures
        );
    }
    let diag_count = output.diagnostics.events().len();
    if diag_count > 0 {
        println!("{diag_count} diagnostic event(s); use --diag to write them out");
    }
}

fn render_text_report(report: &Report) -> String {
    let mut out = String::new();
    let push = |out: &mut String, line: &str| {
        out.push_str(line);
        out.push('\n');
    };

    push(&mut out, &format!(
        "{} {} analysis report",
        report.tool.name, report.tool.version
    ));
    if let Some(generated) = &report.generated_at {
        push(&mut out, &format!("capture end: {generated}"));
    }
    push(&mut out, "");

    push(&mut out, "Input files:");
    for input in &report.inputs {
        push(&mut out, &format!(
            "  {} ({} bytes, {} frames, {} .. {})",
            input.path,
            input.bytes,
            input.frames,
            input.time_start.as_deref().unwrap_or("-"),
            input.time_end.as_deref().unwrap_or("-"),
        ));
    }
    push(&mut out, "");

    let t = &report.totals;
    push(&mut out, &format!(
        "Totals: {} frames, {} conversations ({} TCP / {} UDP), {} SQL, {} truncation error(s), {} capture duplicate(s)",
        t.frames,
        t.conversations,
        t.tcp_conversations,
        t.udp_conversations,
        t.sql_conversations,
        t.truncation_errors,
        t.capture_duplicates
    ));
    push(&mut out, "");

    if report.sql_servers.is_empty() {
        push(&mut out, "No SQL Server conversations identified.");
    }
    for server in &report.sql_servers {
        push(&mut out, &format!(
            "SQL Server {} - {} conversation(s), {} login failure(s), {} redirect(s)",
            server.endpoint,
            server.conversation_count,
            server.login_failures,
            server.redirected_logins
        ));
        for conv in &server.conversations {
            push(&mut out, &format!(
                "  {} -> {}  [{}]  frames={} dur={:.3}s retrans={}/{} keepalive={}",
                conv.client,
                conv.server,
                conv.login_flags,
                conv.frames,
                conv.duration_seconds,
                conv.sig_retransmits,
                conv.raw_retransmits,
                conv.keep_alives
            ));
            push(&mut out, &format!(
                "    encrypted={} tds={} database={} server={} outcome={}",
                conv.encrypted,
                conv.tds_version_server,
                conv.database.as_deref().unwrap_or("-"),
                conv.server_name.as_deref().unwrap_or("-"),
                if conv.login_failure {
                    if conv.late_login_ack {
                        "FAILED (late login ack)"
                    } else {
                        "FAILED"
                    }
                } else if conv.post_login_response {
                    "succeeded"
                } else {
                    "incomplete"
                }
            ));
            if let Some(error) = &conv.error {
                push(&mut out, &format!(
                    "    error {} state {}: {}",
                    error.number, error.state, error.message
                ));
            }
            if let Some(redirect) = &conv.redirect {
                push(&mut out, &format!("    redirected to {redirect}"));
            }
        }
        push(&mut out, "");
    }
    out
}

fn render_csv(report: &Report) -> String {
    let mut out = String::new();
    out.push_str(
        "server,client,frames,duration_s,syn,fin,reset,raw_retransmits,sig_retransmits,\
         keep_alives,keep_alive_retransmits,duplicates,truncation_errors,encrypted,mars,\
         integrated_security,null_credentials,tds_version,database,login_failure,late_login_ack\n",
    );
    for server in &report.sql_servers {
        for conv in &server.conversations {
            out.push_str(&format!(
                "{},{},{},{:.6},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
                csv_field(&server.endpoint),
                csv_field(&conv.client),
                conv.frames,
                conv.duration_seconds,
                conv.syn_count,
                conv.fin_count,
                conv.reset_count,
                conv.raw_retransmits,
                conv.sig_retransmits,
                conv.keep_alives,
                conv.keep_alive_retransmits,
                conv.capture_duplicates,
                conv.truncation_errors,
                conv.encrypted,
                conv.mars,
                conv.integrated_security,
                conv.null_credentials,
                csv_field(&conv.tds_version_server),
                csv_field(conv.database.as_deref().unwrap_or("")),
                conv.login_failure,
                conv.late_login_ack
            ));
        }
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
