use std::path::Path;

use anyhow::Result;
use console::style;

use super::agent_cmd::resolve_agent_id;
use super::{
    CommandArgs, confirmed, note_source, or_dash, parse_command_args, report_outcome, required,
    short_time, sub_command,
};
use crate::core::models::MissionOrder;
use crate::core::services::{ServiceError, Services};
use crate::core::terminal::{GuideSection, print_info, print_status};

const MISSION_FLAGS: [&str; 5] = ["--name", "--client", "--start", "--end", "--description"];

fn mission_from_flags(mut order: MissionOrder, parsed: &CommandArgs) -> MissionOrder {
    if let Some(name) = parsed.value(&["--name"]) {
        order.mission_name = name.to_string();
    }
    if let Some(client) = parsed.value(&["--client"]) {
        order.client_name = client.to_string();
    }
    if let Some(start) = parsed.value(&["--start"]) {
        order.start_date = Some(start.to_string());
    }
    if let Some(end) = parsed.value(&["--end"]) {
        order.end_date = Some(end.to_string());
    }
    if let Some(description) = parsed.value(&["--description"]) {
        order.description = Some(description.to_string());
    }
    order
}

pub async fn run_mission_command(services: &Services, args: &[String]) -> Result<()> {
    let parsed = parse_command_args(args, 3, &MISSION_FLAGS);
    match sub_command(args) {
        "show" => {
            let raw = required(parsed.positional(0), "mission show <agent-id>")?;
            let agent_id = resolve_agent_id(services, raw).await?;
            let (order, source) = services.agents().get_mission_order(&agent_id).await?;
            note_source(source);
            let (file, _) = services.files().get_mission_order_file(&agent_id).await?;

            match order {
                Some(order) => {
                    println!(
                        "\n  {} {}",
                        style(&order.mission_name).bold(),
                        style(&order.client_name).dim()
                    );
                    print_status("Description", &or_dash(order.description.as_deref()));
                    print_status(
                        "Period",
                        &format!(
                            "{} → {}",
                            short_time(order.start_date.as_deref()),
                            short_time(order.end_date.as_deref())
                        ),
                    );
                }
                None => print_info("No mission order recorded for this agent."),
            }
            if let Some(file) = file {
                print_status("Document", &format!("{} ({})", file.file_name, file.id));
            }
            println!();
        }
        "set" => {
            let raw = required(parsed.positional(0), "mission set <agent-id> --name <mission>")?;
            let agent_id = resolve_agent_id(services, raw).await?;
            let (agent, _) = services.agents().get(&agent_id).await?;
            let (current, _) = services.agents().get_mission_order(&agent.id).await?;
            let base = current.unwrap_or_else(|| MissionOrder::draft(&agent));
            let order = mission_from_flags(base, &parsed);
            let outcome = services
                .agents()
                .set_mission_order(&agent.id, order)
                .await?;
            report_outcome(
                &outcome,
                &format!("Mission order '{}' saved", outcome.value().mission_name),
            );
        }
        "upload" => {
            let raw = required(parsed.positional(0), "mission upload <agent-id> <file>")?;
            let path = required(parsed.positional(1), "mission upload <agent-id> <file>")?;
            let agent_id = resolve_agent_id(services, raw).await?;
            let outcome = services
                .files()
                .upload_mission_order(&agent_id, Path::new(path))
                .await?;
            report_outcome(
                &outcome,
                &format!("Mission order document {} uploaded", outcome.value().file_name),
            );
        }
        "delete" | "rm" => {
            let raw = required(parsed.positional(0), "mission delete <agent-id> [--yes]")?;
            let agent_id = resolve_agent_id(services, raw).await?;
            if !confirmed(&parsed, "Delete the mission order and its document?")? {
                print_info("Nothing deleted.");
                return Ok(());
            }
            let outcome = services.agents().delete_mission_order(&agent_id).await?;
            report_outcome(&outcome, "Mission order deleted");
            match services.files().delete_mission_order_file(&agent_id).await {
                Ok(outcome) => report_outcome(&outcome, "Mission order document deleted"),
                Err(ServiceError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        _ => {
            GuideSection::new("optiagent mission")
                .command("show <agent>", "Mission order and uploaded document")
                .command(
                    "set <agent>",
                    "--name <mission> [--client] [--start] [--end] [--description]",
                )
                .command("upload <agent> <file>", "Upload the mission order document")
                .command("delete <agent>", "Remove the mission order and document (--yes)")
                .print();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::Agent;

    #[test]
    fn flags_fill_the_draft_and_keep_the_rest() {
        let agent = Agent {
            id: "a1".into(),
            name: "Agent X".into(),
            role: "Reviewer".into(),
            description: None,
            created_at: None,
            user_id: None,
            invoices: vec![],
        };
        let args: Vec<String> = ["optiagent", "mission", "set", "a1", "--name", "Rabat audit"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = parse_command_args(&args, 3, &MISSION_FLAGS);
        let order = mission_from_flags(MissionOrder::draft(&agent), &parsed);
        assert_eq!(order.mission_name, "Rabat audit");
        assert_eq!(order.client_name, "Agent X");
        assert_eq!(order.agent_id.as_deref(), Some("a1"));
        assert!(order.end_date.is_some());
    }
}
