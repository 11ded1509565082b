use clap::Parser;
use config::Config;
use std::process::ExitCode;
use tlsedge::{scenario, Harness, ScenarioReport};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the tlsedge crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("tlsedge={level}");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "TLS socket edge-case harness", long_about = None)]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,

    /// Server certificate (PEM), overrides tls_server_cert
    #[arg(long)]
    cert: Option<String>,

    /// Server private key (PEM), overrides tls_server_key
    #[arg(long)]
    key: Option<String>,

    /// Read settings namespaced under this name first
    #[arg(long, default_value = "")]
    name: String,

    /// Scenario to run; repeat to run several (default: all)
    #[arg(long = "scenario", value_name = "NAME")]
    scenarios: Vec<String>,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn build_config(args: &Args) -> Result<Config, config::ConfigError> {
    let mut builder = Config::builder();
    if let Some(config_path) = &args.config {
        builder = builder.add_source(config::File::with_name(config_path));
    }
    if let Some(cert) = &args.cert {
        builder = builder.set_override("tls_server_cert", cert.as_str())?;
    }
    if let Some(key) = &args.key {
        builder = builder.set_override("tls_server_key", key.as_str())?;
    }
    builder.build()
}

fn summarize(report: &ScenarioReport) -> String {
    match report {
        ScenarioReport::Saturate(r) => format!(
            "{} bytes offered, {:?} after {:?}, protocol: {:?}",
            r.payload_len, r.error_kind, r.elapsed, r.protocol_version
        ),
        ScenarioReport::LargeSend(r) => format!(
            "{} of {} bytes received, clean eof: {}, send error: {:?}",
            r.received_len, r.reference_len, r.clean_eof, r.send_error
        ),
        ScenarioReport::HandshakeChurn(r) => format!(
            "{} churned, {} failed handshakes, {} served, {} late connects, refused after teardown: {}",
            r.churned, r.failed_handshakes, r.served, r.late_attempts, r.refused_after_teardown
        ),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match build_config(&args) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let harness = match Harness::new_named(&config, &args.name) {
        Ok(h) => h,
        Err(err) => {
            eprintln!("Failed to set up harness: {err}");
            return ExitCode::FAILURE;
        }
    };

    let scenarios = if args.scenarios.is_empty() {
        scenario::all()
    } else {
        let mut selected = Vec::new();
        for name in &args.scenarios {
            match scenario::by_name(name) {
                Some(s) => selected.push(s),
                None => {
                    eprintln!("Unknown scenario '{name}'");
                    return ExitCode::FAILURE;
                }
            }
        }
        selected
    };

    let mut failed = 0;
    for (name, result) in scenario::run_scenarios(&harness, &scenarios) {
        match result {
            Ok(report) => println!("PASS {name}: {}", summarize(&report)),
            Err(err) => {
                println!("FAIL {name}: {err}");
                failed += 1;
            }
        }
    }

    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
