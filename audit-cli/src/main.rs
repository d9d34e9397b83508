use audit_cli::Cli;
use audit_rag::VerdictStatus;
use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _ = if cli.json_logs {
        audit_telemetry::init_with_json("audit")
    } else {
        audit_telemetry::init_telemetry("audit")
    };

    match audit_cli::run(cli).await {
        Ok(outcome) => {
            println!(
                "{}: {} validated, {} flagged in {:.1}s",
                outcome.report.document_name,
                outcome.report.count(VerdictStatus::Validated),
                outcome.report.count(VerdictStatus::Flagged),
                outcome.report.processing_time_secs,
            );
            println!("results written to {}", outcome.results_path.display());
        }
        Err(err) => {
            error!(error = %err, "audit failed");
            for cause in err.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            std::process::exit(1);
        }
    }
}
