use anyhow::{Result, anyhow};
use console::style;

use super::{
    confirmed, list_query, note_source, or_dash, parse_command_args, report_outcome,
    required, short_time, signed_in, sub_command,
};
use crate::core::listing::SortDirection;
use crate::core::models::{Agent, AgentPatch};
use crate::core::services::Services;
use crate::core::status::ExecutionStatus;
use crate::core::store::AGENTS;
use crate::core::terminal::{GuideSection, print_info, print_status, print_table, short_id};

const AGENT_FLAGS: [&str; 9] = [
    "--search",
    "-s",
    "--sort",
    "--name",
    "-n",
    "--role",
    "-r",
    "--description",
    "-d",
];

/// Accept a full id or an unambiguous prefix of a cached agent id.
pub(crate) async fn resolve_agent_id(services: &Services, raw: &str) -> Result<String> {
    let cached: Vec<Agent> = services.store.get(AGENTS).await?;
    if cached.iter().any(|a| a.id == raw) {
        return Ok(raw.to_string());
    }
    let matches: Vec<&Agent> = cached.iter().filter(|a| a.id.starts_with(raw)).collect();
    match matches.len() {
        0 => Ok(raw.to_string()),
        1 => Ok(matches[0].id.clone()),
        n => Err(anyhow!("'{}' matches {} agents, use a longer id", raw, n)),
    }
}

fn agent_rows(agents: &[Agent]) -> Vec<Vec<String>> {
    agents
        .iter()
        .map(|a| {
            vec![
                short_id(&a.id).to_string(),
                a.name.clone(),
                a.role.clone(),
                short_time(a.created_at.as_deref()),
                a.invoices.len().to_string(),
            ]
        })
        .collect()
}

pub async fn run_agent_command(services: &Services, args: &[String]) -> Result<()> {
    let parsed = parse_command_args(args, 3, &AGENT_FLAGS);
    match sub_command(args) {
        "list" | "ls" => {
            let (agents, source) = if parsed.has(&["--all"]) {
                services.agents().list_all().await?
            } else {
                let user = signed_in(services).await?;
                services.agents().list_for_user(&user.id).await?
            };
            note_source(source);
            let query = list_query(&parsed, "createdAt", SortDirection::Desc);
            let agents = query.apply(agents);
            if agents.is_empty() {
                print_info("No agents found.");
                return Ok(());
            }
            print_table(
                &["ID", "NAME", "ROLE", "CREATED", "INVOICES"],
                &agent_rows(&agents),
            );
        }
        "show" => {
            let raw = required(parsed.positional(0), "agent show <agent-id>")?;
            let id = resolve_agent_id(services, raw).await?;
            let (agent, source) = services.agents().get(&id).await?;
            note_source(source);

            println!("\n  {} {}", style(&agent.name).bold(), style(&agent.role).dim());
            print_status("Id", &agent.id);
            print_status("Description", &or_dash(agent.description.as_deref()));
            print_status("Created", &short_time(agent.created_at.as_deref()));
            print_status("Invoices", &agent.invoices.len().to_string());

            let (order, _) = services.agents().get_mission_order(&agent.id).await?;
            print_status(
                "Mission order",
                &order
                    .map(|o| format!("{} ({})", o.mission_name, o.client_name))
                    .unwrap_or_else(|| "-".to_string()),
            );

            let (executions, _) = services.executions().list_for_agent(&agent.id).await?;
            let failed = executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Failed)
                .count();
            print_status(
                "Executions",
                &format!("{} ({} failed)", executions.len(), failed),
            );
            println!();
        }
        "create" | "add" => {
            let name = match parsed.value(&["--name", "-n"]).or(parsed.positional(0)) {
                Some(n) => n.to_string(),
                None => inquire::Text::new("Agent name:").prompt()?,
            };
            let role = match parsed.value(&["--role", "-r"]) {
                Some(r) => r.to_string(),
                None => inquire::Text::new("Role:").prompt()?,
            };
            let description = parsed
                .value(&["--description", "-d"])
                .map(str::to_string);

            let outcome = services.agents().create(&name, &role, description).await?;
            let agent = outcome.value();
            report_outcome(
                &outcome,
                &format!("Agent '{}' created with id {}", agent.name, agent.id),
            );
        }
        "edit" | "update" => {
            let raw = required(parsed.positional(0), "agent edit <agent-id> [--name] [--role]")?;
            let id = resolve_agent_id(services, raw).await?;
            let patch = AgentPatch {
                name: parsed.value(&["--name", "-n"]).map(str::to_string),
                role: parsed.value(&["--role", "-r"]).map(str::to_string),
                description: parsed
                    .value(&["--description", "-d"])
                    .map(str::to_string),
            };
            if patch.is_empty() {
                return Err(anyhow!(
                    "Nothing to change. Pass --name, --role or --description."
                ));
            }
            let outcome = services.agents().update(&id, &patch).await?;
            report_outcome(&outcome, &format!("Agent '{}' updated", outcome.value().name));
        }
        "delete" | "remove" | "rm" => {
            let raw = required(parsed.positional(0), "agent delete <agent-id> [--yes]")?;
            let id = resolve_agent_id(services, raw).await?;
            if !confirmed(
                &parsed,
                &format!(
                    "Delete agent {} with its invoices, mission order and executions?",
                    id
                ),
            )? {
                print_info("Nothing deleted.");
                return Ok(());
            }
            let outcome = services.agents().delete(&id).await?;
            report_outcome(
                &outcome,
                &format!(
                    "Agent deleted along with {} execution(s)",
                    outcome.value()
                ),
            );
        }
        _ => {
            GuideSection::new("optiagent agent")
                .command("list", "Your agents (--all, --search <t>, --sort <field>, --asc/--desc)")
                .command("show <id>", "Details, mission order and execution count")
                .command("create <name>", "--role <role> [--description <text>]")
                .command("edit <id>", "--name, --role or --description")
                .command("delete <id>", "Delete the agent and everything attached (--yes)")
                .print();
            println!(
                "  Sort fields: {}",
                style("name, role, createdAt, id").dim()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::LocalStore;

    fn agent(id: &str) -> Agent {
        Agent {
            id: id.to_string(),
            name: format!("Agent {}", id),
            role: "Reviewer".into(),
            description: None,
            created_at: Some("2024-01-01T09:30:00Z".into()),
            user_id: Some("u1".into()),
            invoices: vec![],
        }
    }

    #[tokio::test]
    async fn prefixes_resolve_to_cached_agents() {
        let store = LocalStore::in_memory(1024 * 1024).unwrap();
        store
            .save_all(AGENTS, &[agent("abc123"), agent("abd456")])
            .await
            .unwrap();
        let config = crate::core::config::Config::default();
        let services = Services::new(store, crate::core::api::ApiClient::new(&config).unwrap());

        assert_eq!(resolve_agent_id(&services, "abc").await.unwrap(), "abc123");
        assert_eq!(resolve_agent_id(&services, "abd456").await.unwrap(), "abd456");
        assert_eq!(resolve_agent_id(&services, "zzz").await.unwrap(), "zzz");
        assert!(resolve_agent_id(&services, "ab").await.is_err());
    }

    #[test]
    fn rows_shorten_ids_and_times() {
        let rows = agent_rows(&[agent("0123456789abcdef")]);
        assert_eq!(rows[0][0], "01234567");
        assert_eq!(rows[0][3], "2024-01-01 09:30");
        assert_eq!(rows[0][4], "0");
    }
}
