use std::path::PathBuf;

use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;

use super::agent_cmd::resolve_agent_id;
use super::{
    CommandArgs, list_query, note_source, or_dash, parse_command_args, report_outcome, required,
    short_time, sub_command,
};
use crate::core::listing::SortDirection;
use crate::core::models::{Invoice, InvoiceStatus, StoredFile};
use crate::core::services::{ServiceError, Services, UploadReport};
use crate::core::terminal::{
    GuideSection, print_error, print_info, print_success, print_table, print_warn,
};

const INVOICE_FLAGS: [&str; 10] = [
    "--search",
    "-s",
    "--sort",
    "--amount",
    "--client",
    "--number",
    "--status",
    "--issued",
    "--due",
    "--description",
];

/// Start from a generated draft and apply whatever fields were passed.
fn invoice_from_flags(mut invoice: Invoice, parsed: &CommandArgs) -> Result<Invoice> {
    if let Some(raw) = parsed.value(&["--amount"]) {
        invoice.amount = raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("--amount expects a number, got '{}'", raw))?;
    }
    if let Some(client) = parsed.value(&["--client"]) {
        invoice.client_name = client.to_string();
    }
    if let Some(number) = parsed.value(&["--number"]) {
        invoice.invoice_number = number.to_string();
    }
    if let Some(raw) = parsed.value(&["--status"]) {
        invoice.status = InvoiceStatus::parse(raw)
            .ok_or_else(|| anyhow!("--status must be pending, paid or overdue"))?;
    }
    if let Some(issued) = parsed.value(&["--issued"]) {
        invoice.issue_date = Some(issued.to_string());
    }
    if let Some(due) = parsed.value(&["--due"]) {
        invoice.due_date = Some(due.to_string());
    }
    if let Some(description) = parsed.value(&["--description"]) {
        invoice.description = Some(description.to_string());
    }
    Ok(invoice)
}

fn invoice_rows(invoices: &[Invoice]) -> Vec<Vec<String>> {
    invoices
        .iter()
        .map(|i| {
            vec![
                i.id.clone(),
                i.invoice_number.clone(),
                i.client_name.clone(),
                format!("{:.2}", i.amount),
                i.status.as_str().to_string(),
                short_time(i.due_date.as_deref()),
            ]
        })
        .collect()
}

fn file_rows(files: &[StoredFile]) -> Vec<Vec<String>> {
    files
        .iter()
        .map(|f| {
            vec![
                f.id.clone(),
                f.file_name.clone(),
                or_dash(f.file_type.as_deref()),
                short_time(f.upload_date.as_deref()),
            ]
        })
        .collect()
}

fn print_upload_report(report: &UploadReport) {
    for file in &report.uploaded {
        print_success(&format!("Uploaded {} ({})", file.file_name, file.id));
    }
    for file in &report.queued {
        print_warn(&format!(
            "{} kept locally; run `optiagent sync flush` to upload it later",
            file.file_name
        ));
    }
    for (path, reason) in &report.failed {
        print_error(&format!("{}: {}", path.display(), reason));
    }
}

/// Cancel `token` on Ctrl-C until the returned task is aborted.
pub(crate) fn cancel_on_ctrl_c(token: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    })
}

pub async fn run_invoice_command(services: &Services, args: &[String]) -> Result<()> {
    let parsed = parse_command_args(args, 3, &INVOICE_FLAGS);
    match sub_command(args) {
        "list" | "ls" => {
            let raw = required(parsed.positional(0), "invoice list <agent-id>")?;
            let agent_id = resolve_agent_id(services, raw).await?;
            let (invoices, source) = services.agents().list_invoices(&agent_id).await?;
            note_source(source);
            let invoices = list_query(&parsed, "dueDate", SortDirection::Desc).apply(invoices);
            if invoices.is_empty() {
                print_info("No invoices for this agent.");
                return Ok(());
            }
            print_table(
                &["ID", "NUMBER", "CLIENT", "AMOUNT", "STATUS", "DUE"],
                &invoice_rows(&invoices),
            );
        }
        "add" => {
            let raw = required(parsed.positional(0), "invoice add <agent-id> --amount <n>")?;
            let agent_id = resolve_agent_id(services, raw).await?;
            let (agent, _) = services.agents().get(&agent_id).await?;
            let invoice = invoice_from_flags(Invoice::draft(&agent), &parsed)?;
            let outcome = services.agents().add_invoice(&agent.id, invoice).await?;
            report_outcome(
                &outcome,
                &format!("Invoice {} added", outcome.value().invoice_number),
            );
        }
        "delete" | "rm" => {
            let raw = required(parsed.positional(0), "invoice delete <agent-id> <invoice-id>")?;
            let invoice_id = required(
                parsed.positional(1),
                "invoice delete <agent-id> <invoice-id>",
            )?;
            let agent_id = resolve_agent_id(services, raw).await?;
            let outcome = services
                .agents()
                .delete_invoice(&agent_id, invoice_id)
                .await?;
            report_outcome(&outcome, "Invoice deleted");
        }
        "upload" => {
            let raw = required(parsed.positional(0), "invoice upload <agent-id> <file>...")?;
            let agent_id = resolve_agent_id(services, raw).await?;
            let paths: Vec<PathBuf> = parsed
                .positionals_from(1)
                .iter()
                .map(PathBuf::from)
                .collect();
            if paths.is_empty() {
                return Err(anyhow!("Usage: optiagent invoice upload <agent-id> <file>..."));
            }

            if parsed.has(&["--inline"]) {
                for path in &paths {
                    let file = services
                        .files()
                        .upload_invoice_inline(&agent_id, path)
                        .await?;
                    print_success(&format!("Uploaded {} ({})", file.file_name, file.id));
                }
                return Ok(());
            }

            let cancel = CancellationToken::new();
            let watcher = cancel_on_ctrl_c(&cancel);
            let result = services
                .files()
                .upload_invoices(&agent_id, paths, &cancel)
                .await;
            watcher.abort();
            match result {
                Ok(report) => print_upload_report(&report),
                Err(ServiceError::Canceled) => print_warn("Upload canceled."),
                Err(e) => return Err(e.into()),
            }
        }
        "files" => {
            let raw = required(parsed.positional(0), "invoice files <agent-id>")?;
            let agent_id = resolve_agent_id(services, raw).await?;
            let (files, source) = services.files().list_invoice_files(&agent_id).await?;
            note_source(source);
            if files.is_empty() {
                print_info("No invoice files uploaded for this agent.");
                return Ok(());
            }
            print_table(&["FILE ID", "NAME", "TYPE", "UPLOADED"], &file_rows(&files));
        }
        "delete-file" | "rm-file" => {
            let file_id = required(parsed.positional(0), "invoice delete-file <file-id>")?;
            let outcome = services.files().delete_invoice_file(file_id).await?;
            report_outcome(&outcome, "Invoice file deleted");
        }
        _ => {
            GuideSection::new("optiagent invoice")
                .command("list <agent>", "Invoices of an agent (--search, --sort <field>, --asc/--desc)")
                .command(
                    "add <agent>",
                    "--amount <n> [--client] [--number] [--status] [--issued] [--due] [--description]",
                )
                .command("delete <agent> <invoice>", "Remove an invoice")
                .command("upload <agent> <file>...", "Upload invoice documents (--inline for base64)")
                .command("files <agent>", "Uploaded invoice documents")
                .command("delete-file <file>", "Remove an uploaded document")
                .print();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::Agent;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn agent() -> Agent {
        Agent {
            id: "a1".into(),
            name: "Agent X".into(),
            role: "Reviewer".into(),
            description: None,
            created_at: None,
            user_id: Some("u1".into()),
            invoices: vec![],
        }
    }

    #[test]
    fn flags_override_the_draft() {
        let args = argv(&[
            "optiagent", "invoice", "add", "a1", "--amount", "412.50", "--status", "PAID",
            "--client", "Hotel Atlas",
        ]);
        let parsed = parse_command_args(&args, 3, &INVOICE_FLAGS);
        let invoice = invoice_from_flags(Invoice::draft(&agent()), &parsed).unwrap();
        assert_eq!(invoice.amount, 412.5);
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.client_name, "Hotel Atlas");
        assert!(invoice.invoice_number.starts_with("INV-"));
    }

    #[test]
    fn bad_amount_and_status_are_rejected() {
        let args = argv(&["optiagent", "invoice", "add", "a1", "--amount", "lots"]);
        let parsed = parse_command_args(&args, 3, &INVOICE_FLAGS);
        assert!(invoice_from_flags(Invoice::draft(&agent()), &parsed).is_err());

        let args = argv(&["optiagent", "invoice", "add", "a1", "--status", "lost"]);
        let parsed = parse_command_args(&args, 3, &INVOICE_FLAGS);
        assert!(invoice_from_flags(Invoice::draft(&agent()), &parsed).is_err());
    }
}
