use anyhow::Result;
use console::style;

use super::auth_cmd::print_user;
use super::{CommandArgs, confirmed, note_source, parse_command_args, report_outcome, sub_command};
use crate::core::models::ProfileUpdate;
use crate::core::services::Services;
use crate::core::terminal::{GuideSection, print_info, print_status, print_success};

const PROFILE_FLAGS: [&str; 8] = [
    "--name",
    "-n",
    "--email",
    "-e",
    "--image",
    "--current",
    "--new",
    "--confirm",
];

fn profile_update(parsed: &CommandArgs) -> ProfileUpdate {
    ProfileUpdate {
        name: parsed.value(&["--name", "-n"]).map(str::to_string),
        email: parsed.value(&["--email", "-e"]).map(str::to_string),
        profile_image: parsed.value(&["--image"]).map(str::to_string),
    }
}

fn secret(parsed: &CommandArgs, flag: &str, label: &str) -> Result<String> {
    match parsed.value(&[flag]) {
        Some(v) => Ok(v.to_string()),
        None => Ok(inquire::Password::new(label)
            .without_confirmation()
            .prompt()?),
    }
}

pub async fn run_profile_command(services: &Services, args: &[String]) -> Result<()> {
    let parsed = parse_command_args(args, 3, &PROFILE_FLAGS);
    match sub_command(args) {
        "" | "show" => {
            let (user, source) = services.users().profile().await?;
            note_source(source);
            print_user(&user);
            if let Some(image) = &user.profile_image {
                print_status("Picture", image);
            }
        }
        "update" | "edit" => {
            let update = profile_update(&parsed);
            let outcome = services.users().update_profile(&update).await?;
            report_outcome(&outcome, "Profile updated");
            let user = outcome.value();
            println!(
                "  {} {}",
                style(&user.name).bold(),
                style(format!("<{}>", user.email)).dim()
            );
        }
        "password" => {
            let current = secret(&parsed, "--current", "Current password:")?;
            let new = secret(&parsed, "--new", "New password:")?;
            let confirm = secret(&parsed, "--confirm", "Confirm new password:")?;
            services
                .users()
                .change_password(&current, &new, &confirm)
                .await?;
            print_success("Password changed.");
        }
        "delete" => {
            if !confirmed(
                &parsed,
                "Delete your account and every agent, execution and file attached to it?",
            )? {
                print_info("Nothing deleted.");
                return Ok(());
            }
            let removed = services.users().delete_account().await?;
            print_success(&format!(
                "Account deleted along with {} agent(s). You are signed out.",
                removed
            ));
        }
        _ => {
            GuideSection::new("optiagent profile")
                .command("show", "Profile and counters (default)")
                .command("update", "--name <n> --email <e> --image <url>")
                .command("password", "--current <p> --new <p> --confirm <p>")
                .command("delete", "Delete the account (--yes to skip the prompt)")
                .print();
        }
    }
    Ok(())
}
