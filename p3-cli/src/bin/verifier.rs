use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;
use p3::verifier::{self, FileReport, Judgment};

const BAD_INVOCATION: i32 = 64;

/// Judge stored exchange transcripts.
#[derive(Parser)]
#[command(name = "p3-verifier")]
struct Args {
    /// Validate that the exchange stored in the given file completed.
    #[arg(long = "checkSuccess")]
    check_success: Option<PathBuf>,

    /// Judge a dispute between the two given transcript files.
    #[arg(long = "isDispute")]
    is_dispute: bool,

    /// Transcript files for dispute mode.
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    p3_cli::init_tracing();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            exit(BAD_INVOCATION);
        }
    };

    match (&args.check_success, args.is_dispute) {
        (Some(_), false) if args.files.is_empty() => {}
        (None, true) if args.files.len() == 2 => {}
        (Some(_), _) => {
            eprintln!("cannot combine --checkSuccess with dispute arguments");
            exit(BAD_INVOCATION);
        }
        (None, true) => {
            eprintln!("dispute mode expects exactly two files, got {}", args.files.len());
            exit(BAD_INVOCATION);
        }
        (None, false) => {
            eprintln!("pass either --checkSuccess <file> or --isDispute <file1> <file2>");
            exit(BAD_INVOCATION);
        }
    }

    println!("Loading the identity authority's public key...\n");
    let authority_key =
        p3::authority::fetch_public_key().await.context("could not load the authority key")?;

    if let Some(path) = &args.check_success {
        match verifier::verify_success(path, &authority_key) {
            Ok(report) => {
                println!("The exchange was recorded by the {}", report.storer);
                println!("The peer's SSOID is '{}'", report.peer_ssoid);
                println!("Managed to decrypt the ciphertext => Transaction ended successfully");
                exit(Judgment::Success.exit_code());
            }
            Err(err) => {
                eprintln!("could not verify the exchange: {err}");
                exit(Judgment::Failure.exit_code());
            }
        }
    }

    let outcome = verifier::solve_dispute(&args.files[0], &args.files[1], &authority_key);
    if let Some((first, second)) = &outcome.reports {
        print_file_report(first, 1);
        print_file_report(second, 2);
    }
    print_judgment(&outcome.summary, outcome.judgment);
}

fn print_file_report(report: &FileReport, number: usize) {
    println!("============== Analysis of file {number} ==============");
    println!("| * SSOID: {:<37}|", report.peer_ssoid);
    println!("| * Type: {:<38}|", report.storer.to_string());
    println!("| * Successfully completed the protocol: {:<7}|", report.outcome.is_ok());
    if let Err(err) = &report.outcome {
        println!("|   ({err})");
    }
    println!("================================================\n");
}

fn print_judgment(summary: &str, judgment: Judgment) -> ! {
    let lines: Vec<&str> = summary.lines().collect();
    let width = lines.iter().map(|line| line.len()).max().unwrap_or(0).max(10);

    // "| " + line + " |" is width + 4 columns; center "Judgment" in the rule.
    let half = "=".repeat((width + 4).saturating_sub(10) / 2);
    println!("{half} Judgment {half}");
    for line in &lines {
        println!("| {line:<width$} |");
    }
    println!("{}", "=".repeat(half.len() * 2 + 10));

    exit(judgment.exit_code());
}
