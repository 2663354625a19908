mod agent_cmd;
mod auth_cmd;
mod catalog_cmd;
mod config_cmd;
mod history_cmd;
mod invoice_cmd;
mod mission_cmd;
mod profile_cmd;
mod run_cmd;
mod sync_cmd;

use anyhow::{Result, anyhow};
use console::style;
use tracing::debug;

use crate::core::config::Config;
use crate::core::listing::{ListQuery, SortDirection};
use crate::core::models::User;
use crate::core::services::{Outcome, ServiceError, Services, Source};
use crate::core::terminal::{self, GuideSection, print_error, print_success, print_warn};
use crate::logging;
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Account")
        .command("login", "Sign in and store the session locally")
        .command("register", "Create an account")
        .command("logout", "Forget the stored session")
        .command("whoami", "Show the signed-in user and their counters")
        .command("profile", "Show, update or delete your profile")
        .print();

    GuideSection::new("Agents")
        .command("agent", "List, inspect, create, edit and delete agents")
        .command("invoice", "Manage an agent's invoices and invoice files")
        .command("mission", "Manage an agent's mission order")
        .command("run", "Analyse invoices against a mission order")
        .command("history", "Browse and delete past executions")
        .print();

    GuideSection::new("Catalog")
        .command("client", "Local client list")
        .command("product", "Local product list")
        .print();

    GuideSection::new("Maintenance")
        .command("sync", "Show or replay writes kept while offline")
        .command("config", "Show or change endpoint settings")
        .print();

    GuideSection::new("Global flags")
        .command("--api-url <url>", "Override the primary API base for this call")
        .command("--verbose, -v", "Mirror log lines to stderr")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("optiagent").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GlobalFlags {
    pub api_url: Option<String>,
    pub verbose: bool,
}

/// Pull global flags out of the argument list wherever they appear, keeping
/// the remaining arguments in order.
pub(crate) fn split_global_flags(args: &[String]) -> (GlobalFlags, Vec<String>) {
    let mut flags = GlobalFlags::default();
    let mut rest = Vec::with_capacity(args.len());
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--api-url" => {
                if i + 1 < args.len() {
                    flags.api_url = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                flags.verbose = true;
                i += 1;
            }
            _ => {
                rest.push(args[i].clone());
                i += 1;
            }
        }
    }
    (flags, rest)
}

/// Arguments after a subcommand: positionals, `--flag value` pairs and bare switches.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct CommandArgs {
    positionals: Vec<String>,
    values: Vec<(String, String)>,
    switches: Vec<String>,
}

impl CommandArgs {
    pub fn positional(&self, idx: usize) -> Option<&str> {
        self.positionals.get(idx).map(String::as_str)
    }

    pub fn positionals_from(&self, idx: usize) -> &[String] {
        self.positionals.get(idx..).unwrap_or(&[])
    }

    /// Last value given for any of `names`.
    pub fn value(&self, names: &[&str]) -> Option<&str> {
        self.values
            .iter()
            .rev()
            .find(|(flag, _)| names.contains(&flag.as_str()))
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, names: &[&str]) -> bool {
        self.switches.iter().any(|s| names.contains(&s.as_str()))
    }
}

/// `value_flags` lists every flag (aliases included) that consumes the next argument.
pub(crate) fn parse_command_args(args: &[String], start: usize, value_flags: &[&str]) -> CommandArgs {
    let mut parsed = CommandArgs::default();
    let mut i = start;
    while i < args.len() {
        let arg = args[i].as_str();
        if value_flags.contains(&arg) {
            if i + 1 < args.len() {
                parsed.values.push((arg.to_string(), args[i + 1].clone()));
                i += 2;
            } else {
                i += 1;
            }
        } else if arg.len() > 1 && arg.starts_with('-') {
            parsed.switches.push(arg.to_string());
            i += 1;
        } else {
            parsed.positionals.push(arg.to_string());
            i += 1;
        }
    }
    parsed
}

pub(crate) fn sub_command(args: &[String]) -> &str {
    if args.len() > 2 { args[2].as_str() } else { "" }
}

pub(crate) fn required<'a>(value: Option<&'a str>, usage: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow!("Missing argument. Usage: optiagent {}", usage))
}

/// Search, sort field and direction from `--search`, `--sort`, `--asc` and `--desc`.
/// Picking the default field again flips its direction.
pub(crate) fn list_query(
    parsed: &CommandArgs,
    default_field: &str,
    default_direction: SortDirection,
) -> ListQuery {
    let mut query = ListQuery::new(default_field, default_direction)
        .with_search(parsed.value(&["--search", "-s"]).map(str::to_string));
    if let Some(field) = parsed.value(&["--sort"]) {
        query.toggle_sort(field);
    }
    if parsed.has(&["--desc"]) {
        query.direction = SortDirection::Desc;
    } else if parsed.has(&["--asc"]) {
        query.direction = SortDirection::Asc;
    }
    query
}

pub(crate) fn report_outcome<T>(outcome: &Outcome<T>, done: &str) {
    match outcome {
        Outcome::Synced(_) => print_success(done),
        Outcome::LocalOnly { reason, .. } => print_warn(&format!(
            "{} locally only; backend unreachable ({}). Run `optiagent sync flush` later.",
            done, reason
        )),
    }
}

pub(crate) fn note_source(source: Source) {
    if source == Source::Cache {
        print_warn("Backend unreachable, showing locally cached data.");
    }
}

pub(crate) async fn signed_in(services: &Services) -> Result<User> {
    Ok(services
        .users()
        .current_user()
        .await?
        .ok_or(ServiceError::Unauthenticated)?)
}

/// Ask before destroying something unless `--yes` was passed.
pub(crate) fn confirmed(parsed: &CommandArgs, question: &str) -> Result<bool> {
    if parsed.has(&["--yes", "-y"]) {
        return Ok(true);
    }
    Ok(inquire::Confirm::new(question).with_default(false).prompt()?)
}

pub(crate) fn or_dash(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => "-".to_string(),
    }
}

/// Trim RFC 3339 timestamps to `YYYY-MM-DD HH:MM` for tables.
pub(crate) fn short_time(value: Option<&str>) -> String {
    match value.and_then(|v| v.get(..16)) {
        Some(head) => head.replace('T', " "),
        None => or_dash(value),
    }
}

pub async fn run_main() -> Result<()> {
    let raw: Vec<String> = std::env::args().collect();
    let (global, args) = split_global_flags(&raw);

    if args.len() < 2 {
        print_help();
        return Ok(());
    }
    let cmd = args[1].as_str();
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let data_dir = NativePlatform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    NativePlatform::restrict_dir_permissions(&data_dir);
    logging::init(&data_dir, global.verbose)?;

    let mut config = Config::load(&data_dir).await?;
    if cmd == "config" {
        return config_cmd::run_config_command(&args, config).await;
    }
    config.apply_overrides(global.api_url.as_deref())?;

    debug!("Dispatching '{}' against {}", cmd, config.api_url);
    let services = Services::open(&config).await?;

    match cmd {
        "login" => auth_cmd::run_login(&services, &args).await,
        "register" => auth_cmd::run_register(&services, &args).await,
        "logout" => auth_cmd::run_logout(&services).await,
        "whoami" => auth_cmd::run_whoami(&services).await,
        "profile" => profile_cmd::run_profile_command(&services, &args).await,
        "agent" | "agents" => agent_cmd::run_agent_command(&services, &args).await,
        "invoice" | "invoices" => invoice_cmd::run_invoice_command(&services, &args).await,
        "mission" => mission_cmd::run_mission_command(&services, &args).await,
        "run" => run_cmd::run_analysis_command(&services, &args).await,
        "history" => history_cmd::run_history_command(&services, &args).await,
        "client" | "clients" => catalog_cmd::run_client_command(&services, &args).await,
        "product" | "products" => catalog_cmd::run_product_command(&services, &args).await,
        "sync" => sync_cmd::run_sync_command(&services, &args).await,
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn global_flags_are_removed_wherever_they_appear() {
        let args = argv(&[
            "optiagent",
            "agent",
            "--api-url",
            "http://10.0.0.2:8081/api",
            "list",
            "-v",
        ]);
        let (flags, rest) = split_global_flags(&args);
        assert_eq!(flags.api_url.as_deref(), Some("http://10.0.0.2:8081/api"));
        assert!(flags.verbose);
        assert_eq!(rest, argv(&["optiagent", "agent", "list"]));
    }

    #[test]
    fn dangling_value_flag_is_ignored() {
        let (flags, rest) = split_global_flags(&argv(&["optiagent", "whoami", "--api-url"]));
        assert!(flags.api_url.is_none());
        assert_eq!(rest, argv(&["optiagent", "whoami"]));
    }

    #[test]
    fn command_args_split_positionals_values_and_switches() {
        let args = argv(&[
            "optiagent",
            "agent",
            "create",
            "Agent X",
            "--role",
            "Reviewer",
            "--yes",
            "extra",
            "--name",
            "ignored",
            "--name",
            "Agent Y",
        ]);
        let parsed = parse_command_args(&args, 3, &["--role", "--name"]);
        assert_eq!(parsed.positional(0), Some("Agent X"));
        assert_eq!(parsed.positional(1), Some("extra"));
        assert_eq!(parsed.positionals_from(1), &argv(&["extra"])[..]);
        assert!(parsed.positionals_from(5).is_empty());
        assert_eq!(parsed.value(&["--role", "-r"]), Some("Reviewer"));
        assert_eq!(parsed.value(&["--name"]), Some("Agent Y"));
        assert!(parsed.has(&["--yes", "-y"]));
        assert!(!parsed.has(&["--desc"]));
    }

    #[test]
    fn list_query_toggles_like_a_column_header() {
        let args = argv(&["optiagent", "agent", "list", "--sort", "createdAt"]);
        let parsed = parse_command_args(&args, 3, &["--search", "-s", "--sort"]);
        let query = list_query(&parsed, "createdAt", SortDirection::Desc);
        assert_eq!(query.direction, SortDirection::Asc);

        let args = argv(&["optiagent", "agent", "list", "--sort", "name", "--desc", "-s", "rev"]);
        let parsed = parse_command_args(&args, 3, &["--search", "-s", "--sort"]);
        let query = list_query(&parsed, "createdAt", SortDirection::Desc);
        assert_eq!(query.sort_field, "name");
        assert_eq!(query.direction, SortDirection::Desc);
        assert_eq!(query.search.as_deref(), Some("rev"));
    }

    #[test]
    fn required_rejects_blank_values() {
        assert!(required(Some("a1"), "agent show <id>").is_ok());
        assert!(required(Some("  "), "agent show <id>").is_err());
        let err = required(None, "agent show <id>").unwrap_err();
        assert!(err.to_string().contains("agent show <id>"));
    }

    #[test]
    fn short_time_trims_timestamps() {
        assert_eq!(short_time(Some("2024-03-01T10:15:30Z")), "2024-03-01 10:15");
        assert_eq!(short_time(Some("2024")), "2024");
        assert_eq!(short_time(None), "-");
    }
}
