use anyhow::Result;
use console::style;

use super::{note_source, parse_command_args, signed_in};
use crate::core::models::User;
use crate::core::services::Services;
use crate::core::terminal::{print_info, print_status, print_success};

fn prompt_or(value: Option<&str>, label: &str) -> Result<String> {
    match value {
        Some(v) => Ok(v.to_string()),
        None => Ok(inquire::Text::new(label).prompt()?),
    }
}

fn password_or(value: Option<&str>, label: &str) -> Result<String> {
    match value {
        Some(v) => Ok(v.to_string()),
        None => Ok(inquire::Password::new(label)
            .without_confirmation()
            .prompt()?),
    }
}

pub(crate) fn print_user(user: &User) {
    println!(
        "\n  {} {}",
        style(&user.name).bold(),
        style(format!("<{}>", user.email)).dim()
    );
    print_status("User id", &user.id);
    print_status("Agents", &user.stats.total_agents.to_string());
    print_status(
        "Executions",
        &format!(
            "{} total, {} completed, {} failed",
            user.stats.total_executions,
            user.stats.successful_executions,
            user.stats.failed_executions
        ),
    );
    println!();
}

pub async fn run_login(services: &Services, args: &[String]) -> Result<()> {
    let parsed = parse_command_args(args, 2, &["--email", "-e", "--password", "-p"]);
    let email = prompt_or(
        parsed.value(&["--email", "-e"]).or(parsed.positional(0)),
        "Email:",
    )?;
    let password = password_or(parsed.value(&["--password", "-p"]), "Password:")?;

    let user = services.users().login(&email, &password).await?;
    print_success(&format!("Signed in as {} <{}>", user.name, user.email));
    Ok(())
}

pub async fn run_register(services: &Services, args: &[String]) -> Result<()> {
    let parsed = parse_command_args(
        args,
        2,
        &["--name", "-n", "--email", "-e", "--password", "-p"],
    );
    let name = prompt_or(parsed.value(&["--name", "-n"]), "Full name:")?;
    let email = prompt_or(parsed.value(&["--email", "-e"]), "Email:")?;
    let password = match parsed.value(&["--password", "-p"]) {
        Some(p) => p.to_string(),
        None => inquire::Password::new("Password:").prompt()?,
    };

    let user = services.users().register(&name, &email, &password).await?;
    if user.token.is_some() {
        print_success(&format!("Account created, signed in as {}", user.email));
    } else {
        print_success(&format!("Account created for {}", user.email));
        print_info("Run `optiagent login` to sign in.");
    }
    Ok(())
}

pub async fn run_logout(services: &Services) -> Result<()> {
    if services.users().logout().await? {
        print_success("Signed out.");
    } else {
        print_info("No active session.");
    }
    Ok(())
}

pub async fn run_whoami(services: &Services) -> Result<()> {
    let mut user = signed_in(services).await?;
    let (stats, source) = services.users().stats(&user.id).await?;
    note_source(source);
    user.stats = stats;
    print_user(&user);
    Ok(())
}
