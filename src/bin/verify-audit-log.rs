use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use tracing::{error, info};

use secure_audit::audit::AuditLogStore;

fn main() -> Result<()> {
    let matches = Command::new("verify-audit-log")
        .version("1.0.0")
        .about("Verify secure audit log integrity against its stored Merkle root")
        .arg(
            Arg::new("log-path")
                .short('l')
                .long("log-path")
                .value_name("PATH")
                .default_value("secure_audit.log")
                .help("Path to audit log file"),
        )
        .arg(
            Arg::new("root-path")
                .short('r')
                .long("root-path")
                .value_name("PATH")
                .default_value("merkle_root.txt")
                .help("Path to stored Merkle root"),
        )
        .arg(
            Arg::new("proof")
                .short('p')
                .long("proof")
                .value_name("INDEX")
                .value_parser(clap::value_parser!(usize))
                .help("Print and check an inclusion proof for the entry at INDEX"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let log_path = matches
        .get_one::<String>("log-path")
        .ok_or_else(|| anyhow!("--log-path is required"))?;
    let root_path = matches
        .get_one::<String>("root-path")
        .ok_or_else(|| anyhow!("--root-path is required"))?;
    let proof_index = matches.get_one::<usize>("proof").copied();

    let store = AuditLogStore::new(log_path, root_path);

    if let Err(e) = run(&store, proof_index, verbose, quiet) {
        error!("Audit log verification failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn run(store: &AuditLogStore, proof_index: Option<usize>, verbose: bool, quiet: bool) -> Result<()> {
    info!("Verifying audit log: {}", store.log_path().display());

    let report = store.verify_detailed()?;
    if !report.is_valid {
        return Err(anyhow!("{}", report.summary()));
    }

    if !quiet {
        println!("{}", report.summary());
    }

    if verbose {
        println!("\nAudit Log Summary:");
        println!("  Total entries: {}", report.entry_count);
        println!("  Log file: {}", store.log_path().display());
        println!("  Root file: {}", store.root_path().display());
        println!(
            "  Merkle root: {}",
            report.stored_root.as_deref().unwrap_or("none")
        );
    }

    if let Some(index) = proof_index {
        let proof = store.prove(index)?;
        if !proof.verify() {
            return Err(anyhow!("Inclusion proof for entry {} does not reach the root", index));
        }
        if !quiet {
            println!("{}", proof.summary());
            println!(
                "Entry {} of {} proven with {} sibling hashes",
                index,
                report.entry_count,
                proof.size()
            );
            for (level, step) in proof.steps.iter().enumerate() {
                println!("  [{}] {:?} {}", level, step.side, step.sibling);
            }
        }
    }

    Ok(())
}
