use anyhow::Result;

use super::{parse_command_args, required, sub_command};
use crate::core::config::{CONFIG_FILE, Config};
use crate::core::terminal::{GuideSection, print_status, print_success};

pub async fn run_config_command(args: &[String], mut config: Config) -> Result<()> {
    let parsed = parse_command_args(args, 3, &[]);
    match sub_command(args) {
        "" | "show" => {
            print_status("Data directory", &config.data_dir.display().to_string());
            print_status(
                "Config file",
                &config.data_dir.join(CONFIG_FILE).display().to_string(),
            );
            println!();
            print!("{}", config.to_toml()?);
        }
        "set" => {
            let key = required(parsed.positional(0), "config set <key> <value>")?;
            let value = required(parsed.positional(1), "config set <key> <value>")?;
            config.set_field(key, value)?;
            config.save().await?;
            print_success(&format!("{} = {}", key, value));
        }
        "path" => println!("{}", config.data_dir.join(CONFIG_FILE).display()),
        _ => {
            GuideSection::new("optiagent config")
                .command("show", "Effective settings (file + environment)")
                .command("set <key> <value>", "Change one setting and save it")
                .command("path", "Location of config.toml")
                .print();
            println!(
                "  Keys: api_url, executions_url, analysis_url, request_timeout_secs, storage_quota_bytes\n"
            );
        }
    }
    Ok(())
}
