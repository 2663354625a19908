use anyhow::Result;

use super::{short_time, sub_command};
use crate::core::services::{FlushReport, Services};
use crate::core::store::OutboxEntry;
use crate::core::terminal::{
    GuideSection, print_info, print_status, print_success, print_table, print_warn,
};

fn pending_rows(entries: &[OutboxEntry]) -> Vec<Vec<String>> {
    entries
        .iter()
        .enumerate()
        .map(|(idx, e)| {
            vec![
                (idx + 1).to_string(),
                short_time(Some(&e.queued_at)),
                e.op.describe(),
                e.reason.clone(),
            ]
        })
        .collect()
}

fn print_flush_report(report: &FlushReport) {
    if report.replayed == 0 && report.rejected.is_empty() && report.stopped_at.is_none() {
        print_info("Nothing to sync.");
        return;
    }
    if report.replayed > 0 {
        print_success(&format!("Synced {} queued write(s).", report.replayed));
    }
    for (label, reason) in &report.rejected {
        print_warn(&format!("Dropped '{}', the backend refused it: {}", label, reason));
    }
    if let Some((label, reason)) = &report.stopped_at {
        print_warn(&format!(
            "Stopped at '{}': {}. {} write(s) still queued.",
            label, reason, report.remaining
        ));
    }
}

fn kib(bytes: u64) -> String {
    format!("{:.1} KiB", bytes as f64 / 1024.0)
}

pub async fn run_sync_command(services: &Services, args: &[String]) -> Result<()> {
    match sub_command(args) {
        "" | "status" => {
            let pending = services.sync().pending().await?;
            let used = services.store.usage().await?;
            print_status(
                "Local store",
                &format!("{} of {} used", kib(used), kib(services.store.quota_bytes())),
            );
            print_status("Queued writes", &pending.len().to_string());
            if !pending.is_empty() {
                println!();
                print_table(&["#", "QUEUED", "OPERATION", "REASON"], &pending_rows(&pending));
            }
        }
        "flush" | "push" => {
            let report = services.sync().flush().await?;
            print_flush_report(&report);
        }
        _ => {
            GuideSection::new("optiagent sync")
                .command("status", "Store usage and writes waiting for the backend")
                .command("flush", "Replay queued writes in order, dropping refused ones and stopping at the first outage")
                .print();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::PendingOp;

    #[test]
    fn rows_number_entries_in_queue_order() {
        let entries = vec![
            OutboxEntry {
                id: "x".into(),
                queued_at: "2024-05-01T08:00:00Z".into(),
                reason: "network error".into(),
                user_id: Some("u1".into()),
                op: PendingOp::DeleteAgent {
                    agent_id: "a1".into(),
                },
            },
            OutboxEntry {
                id: "y".into(),
                queued_at: "2024-05-01T08:05:00Z".into(),
                reason: "network error".into(),
                user_id: None,
                op: PendingOp::DeleteExecution {
                    execution_id: "e1".into(),
                },
            },
        ];
        let rows = pending_rows(&entries);
        assert_eq!(rows[0][0], "1");
        assert_eq!(rows[0][1], "2024-05-01 08:00");
        assert!(rows[0][2].contains("a1"));
        assert_eq!(rows[1][0], "2");
    }

    #[test]
    fn kib_has_one_decimal() {
        assert_eq!(kib(1536), "1.5 KiB");
        assert_eq!(kib(0), "0.0 KiB");
    }
}
