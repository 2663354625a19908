use anyhow::{Result, anyhow};
use console::style;

use super::agent_cmd::resolve_agent_id;
use super::run_cmd::{print_verdicts, verdict_label};
use super::{
    confirmed, list_query, note_source, or_dash, parse_command_args, report_outcome, required,
    short_time, signed_in, sub_command,
};
use crate::core::listing::SortDirection;
use crate::core::models::Execution;
use crate::core::services::Services;
use crate::core::status::ExecutionStatus;
use crate::core::store::EXECUTIONS;
use crate::core::terminal::{GuideSection, print_info, print_status, print_table, short_id};

const HISTORY_FLAGS: [&str; 7] = [
    "--search",
    "-s",
    "--sort",
    "--agent",
    "-a",
    "--status",
    "--verdict",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerdictFilter {
    Legitimate,
    Fraudulent,
}

impl VerdictFilter {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "legitimate" | "legit" | "clean" => Some(VerdictFilter::Legitimate),
            "fraudulent" | "fraud" => Some(VerdictFilter::Fraudulent),
            _ => None,
        }
    }

    /// Executions without results match neither verdict.
    pub fn matches(&self, execution: &Execution) -> bool {
        match (self, execution.is_fraudulent()) {
            (VerdictFilter::Fraudulent, Some(fraud)) => fraud,
            (VerdictFilter::Legitimate, Some(fraud)) => !fraud,
            (_, None) => false,
        }
    }
}

pub(crate) fn filter_history(
    executions: Vec<Execution>,
    status: Option<ExecutionStatus>,
    verdict: Option<VerdictFilter>,
) -> Vec<Execution> {
    executions
        .into_iter()
        .filter(|e| status.is_none_or(|s| e.status == s))
        .filter(|e| verdict.is_none_or(|v| v.matches(e)))
        .collect()
}

async fn resolve_execution_id(services: &Services, raw: &str) -> Result<String> {
    let cached: Vec<Execution> = services.store.get(EXECUTIONS).await?;
    let matches: Vec<&Execution> = cached.iter().filter(|e| e.id.starts_with(raw)).collect();
    match matches.as_slice() {
        [only] => Ok(only.id.clone()),
        [] => Ok(raw.to_string()),
        many if many.iter().any(|e| e.id == raw) => Ok(raw.to_string()),
        many => Err(anyhow!(
            "'{}' matches {} executions, use a longer id",
            raw,
            many.len()
        )),
    }
}

fn verdict_cell(execution: &Execution) -> String {
    match execution.is_fraudulent() {
        Some(fraud) => verdict_label(fraud),
        None => "-".to_string(),
    }
}

fn status_cell(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Completed => style(status.as_str()).green().to_string(),
        ExecutionStatus::Failed => style(status.as_str()).red().to_string(),
        ExecutionStatus::Running => style(status.as_str()).yellow().to_string(),
    }
}

pub async fn run_history_command(services: &Services, args: &[String]) -> Result<()> {
    let parsed = parse_command_args(args, 3, &HISTORY_FLAGS);
    match sub_command(args) {
        "" | "list" | "ls" => {
            let (executions, source) = if let Some(raw) = parsed.value(&["--agent", "-a"]) {
                let agent_id = resolve_agent_id(services, raw).await?;
                services.executions().list_for_agent(&agent_id).await?
            } else if parsed.has(&["--all"]) {
                services.executions().get_all().await?
            } else {
                let user = signed_in(services).await?;
                services.executions().list_for_user(&user.id).await?
            };
            note_source(source);

            let status = parsed.value(&["--status"]).map(ExecutionStatus::normalize);
            let verdict = match parsed.value(&["--verdict"]) {
                Some(raw) => Some(VerdictFilter::parse(raw).ok_or_else(|| {
                    anyhow!("--verdict must be 'legitimate' or 'fraudulent'")
                })?),
                None => None,
            };
            let executions = filter_history(executions, status, verdict);
            let executions = list_query(&parsed, "startTime", SortDirection::Desc).apply(executions);
            if executions.is_empty() {
                print_info("No executions match.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = executions
                .iter()
                .map(|e| {
                    vec![
                        short_id(&e.id).to_string(),
                        short_id(&e.agent_id).to_string(),
                        status_cell(e.status),
                        short_time(e.start_time.as_deref()),
                        e.files.len().to_string(),
                        verdict_cell(e),
                    ]
                })
                .collect();
            print_table(
                &["ID", "AGENT", "STATUS", "STARTED", "FILES", "VERDICT"],
                &rows,
            );
        }
        "show" => {
            let raw = required(parsed.positional(0), "history show <execution-id>")?;
            let id = resolve_execution_id(services, raw).await?;
            let (execution, source) = services.executions().get(&id).await?;
            note_source(source);

            println!("\n  {} {}", style("Execution").bold(), execution.id);
            print_status("Agent", &execution.agent_id);
            print_status("Status", &status_cell(execution.status));
            print_status("Started", &short_time(execution.start_time.as_deref()));
            print_status("Ended", &short_time(execution.end_time.as_deref()));
            print_status("Files", &or_dash(Some(&execution.files.join(", "))));
            if let Some(error) = &execution.error {
                print_status("Error", error);
            }
            println!();

            let mut verdicts = execution.verdicts();
            if verdicts.is_empty() {
                let (results, _) = services.executions().analysis_results(&execution.id).await?;
                verdicts = results.iter().flat_map(|r| r.verdicts()).collect();
            }
            if execution.status.is_terminal() || !verdicts.is_empty() {
                print_verdicts(&verdicts);
            }
        }
        "delete" | "rm" => {
            let raw = required(parsed.positional(0), "history delete <execution-id> [--yes]")?;
            let id = resolve_execution_id(services, raw).await?;
            if !confirmed(&parsed, &format!("Delete execution {} and its results?", id))? {
                print_info("Nothing deleted.");
                return Ok(());
            }
            let outcome = services.executions().delete(&id).await?;
            report_outcome(&outcome, "Execution deleted");
        }
        _ => {
            GuideSection::new("optiagent history")
                .command("list", "Your executions, newest first")
                .command("  --agent <id>", "Executions of one agent")
                .command("  --all", "Every execution in the store")
                .command("  --status <s>", "running, completed or failed")
                .command("  --verdict <v>", "legitimate or fraudulent")
                .command("show <id>", "Execution details and per-invoice verdicts")
                .command("delete <id>", "Remove an execution and its results (--yes)")
                .print();
        }
    }
    Ok(())
}
