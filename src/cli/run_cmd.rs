use std::path::PathBuf;

use anyhow::{Result, anyhow};
use console::style;
use tokio_util::sync::CancellationToken;

use super::agent_cmd::resolve_agent_id;
use super::invoice_cmd::cancel_on_ctrl_c;
use super::{or_dash, parse_command_args};
use crate::core::models::FraudVerdict;
use crate::core::services::{ServiceError, Services};
use crate::core::terminal::{
    GuideSection, print_info, print_step, print_success, print_table, print_warn,
};

pub(crate) fn verdict_label(fraud: bool) -> String {
    if fraud {
        style("FRAUDULENT").red().bold().to_string()
    } else {
        style("legitimate").green().to_string()
    }
}

pub(crate) fn print_verdicts(verdicts: &[FraudVerdict]) {
    if verdicts.is_empty() {
        print_info("The analysis returned no verdicts.");
        return;
    }
    let rows: Vec<Vec<String>> = verdicts
        .iter()
        .map(|v| {
            vec![
                or_dash(Some(&v.file_name)),
                or_dash(Some(&v.merchant)),
                or_dash(Some(&v.invoice_date)),
                or_dash(Some(&v.total_amount)),
                or_dash(Some(&v.city)),
                verdict_label(v.fraud),
            ]
        })
        .collect();
    print_table(
        &["FILE", "MERCHANT", "DATE", "AMOUNT", "CITY", "VERDICT"],
        &rows,
    );
    for verdict in verdicts.iter().filter(|v| v.fraud && !v.reasons.is_empty()) {
        let name = or_dash(Some(&verdict.file_name));
        println!("\n  {}", style(name).bold());
        for reason in &verdict.reasons {
            println!("    • {}", reason);
        }
    }
    println!();
}

fn print_usage() {
    GuideSection::new("optiagent run")
        .command(
            "<agent> --mission <file> <invoice>...",
            "Analyse invoices against the mission order",
        )
        .command("--upload", "Also upload the invoices to the agent first")
        .print();
}

pub async fn run_analysis_command(services: &Services, args: &[String]) -> Result<()> {
    let parsed = parse_command_args(args, 2, &["--mission", "-m"]);
    let (Some(raw), Some(mission)) = (parsed.positional(0), parsed.value(&["--mission", "-m"]))
    else {
        print_usage();
        return Err(anyhow!("An agent id and --mission <file> are required"));
    };
    let invoices: Vec<PathBuf> = parsed
        .positionals_from(1)
        .iter()
        .map(PathBuf::from)
        .collect();
    if invoices.is_empty() {
        print_usage();
        return Err(anyhow!("Give at least one invoice file to analyse"));
    }
    let agent_id = resolve_agent_id(services, raw).await?;

    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(&cancel);

    if parsed.has(&["--upload"]) {
        print_step("Uploading invoices");
        match services
            .files()
            .upload_invoices(&agent_id, invoices.clone(), &cancel)
            .await
        {
            Ok(report) => {
                for file in &report.uploaded {
                    print_success(&format!("Uploaded {}", file.file_name));
                }
                if !report.queued.is_empty() {
                    print_warn(&format!(
                        "{} upload(s) kept locally for `optiagent sync flush`",
                        report.queued.len()
                    ));
                }
            }
            Err(ServiceError::Canceled) => {
                watcher.abort();
                print_warn("Canceled before the analysis started.");
                return Ok(());
            }
            Err(e) => {
                watcher.abort();
                return Err(e.into());
            }
        }
    }

    print_step(&format!(
        "Analysing {} invoice(s), press Ctrl-C to cancel",
        invoices.len()
    ));
    let result = services
        .executions()
        .run(&agent_id, invoices, PathBuf::from(mission), &cancel)
        .await;
    watcher.abort();

    let report = match result {
        Ok(report) => report,
        Err(ServiceError::Canceled) => {
            print_warn("Analysis canceled; the execution was marked failed.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    print_verdicts(&report.verdicts);
    let flagged = report.verdicts.iter().filter(|v| v.fraud).count();
    let summary = format!(
        "Execution {} {}: {} of {} invoice(s) flagged",
        report.execution.id,
        report.execution.status,
        flagged,
        report.verdicts.len()
    );
    match &report.local_only {
        None => print_success(&summary),
        Some(reason) => print_warn(&format!(
            "{}; bookkeeping kept locally ({}). Run `optiagent sync flush` later.",
            summary, reason
        )),
    }
    if let Some(id) = &report.store_execution_id {
        print_info(&format!("Analysis service reference: {}", id));
    }
    Ok(())
}
