use anyhow::{Result, anyhow};

use super::{CommandArgs, list_query, parse_command_args, required, sub_command};
use crate::core::listing::SortDirection;
use crate::core::services::{ClientDraft, ProductDraft, Services};
use crate::core::terminal::{GuideSection, print_info, print_success, print_table};

const CLIENT_FLAGS: [&str; 7] = [
    "--search", "-s", "--sort", "--name", "--contact", "--email", "--phone",
];
const PRODUCT_FLAGS: [&str; 7] = [
    "--search", "-s", "--sort", "--name", "--category", "--price", "--stock",
];

fn parse_id(raw: Option<&str>, usage: &str) -> Result<u64> {
    let raw = required(raw, usage)?;
    raw.trim()
        .parse()
        .map_err(|_| anyhow!("'{}' is not a numeric id", raw))
}

fn owned(parsed: &CommandArgs, flag: &str) -> Option<String> {
    parsed.value(&[flag]).map(str::to_string)
}

fn client_draft(parsed: &CommandArgs) -> ClientDraft {
    ClientDraft {
        name: owned(parsed, "--name"),
        contact: owned(parsed, "--contact"),
        email: owned(parsed, "--email"),
        phone: owned(parsed, "--phone"),
    }
}

fn product_draft(parsed: &CommandArgs) -> Result<ProductDraft> {
    let stock = match parsed.value(&["--stock"]) {
        Some(raw) => Some(
            raw.trim()
                .parse()
                .map_err(|_| anyhow!("--stock expects a whole number, got '{}'", raw))?,
        ),
        None => None,
    };
    Ok(ProductDraft {
        name: owned(parsed, "--name"),
        category: owned(parsed, "--category"),
        price: owned(parsed, "--price"),
        stock,
    })
}

pub async fn run_client_command(services: &Services, args: &[String]) -> Result<()> {
    let parsed = parse_command_args(args, 3, &CLIENT_FLAGS);
    let catalog = services.catalog();
    match sub_command(args) {
        "" | "list" | "ls" => {
            let clients = list_query(&parsed, "id", SortDirection::Asc)
                .apply(catalog.list_clients().await?);
            if clients.is_empty() {
                print_info("No clients yet.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = clients
                .iter()
                .map(|c| {
                    vec![
                        c.id.to_string(),
                        c.name.clone(),
                        c.contact.clone(),
                        c.email.clone(),
                        c.phone.clone(),
                    ]
                })
                .collect();
            print_table(&["ID", "NAME", "CONTACT", "EMAIL", "PHONE"], &rows);
        }
        "add" => {
            let mut draft = client_draft(&parsed);
            if draft.name.is_none() {
                draft.name = parsed.positional(0).map(str::to_string);
            }
            let client = catalog.add_client(&draft).await?;
            print_success(&format!("Client '{}' added with id {}", client.name, client.id));
        }
        "edit" | "update" => {
            let id = parse_id(parsed.positional(0), "client edit <id> [--name] [--email] ...")?;
            let client = catalog.update_client(id, &client_draft(&parsed)).await?;
            print_success(&format!("Client {} updated", client.id));
        }
        "delete" | "rm" => {
            let id = parse_id(parsed.positional(0), "client delete <id>")?;
            catalog.delete_client(id).await?;
            print_success(&format!("Client {} deleted", id));
        }
        _ => {
            GuideSection::new("optiagent client")
                .command("list", "Clients (--search, --sort id|name|contact|email|phone)")
                .command("add <name>", "[--contact] [--email] [--phone]")
                .command("edit <id>", "[--name] [--contact] [--email] [--phone]")
                .command("delete <id>", "Remove a client")
                .print();
        }
    }
    Ok(())
}

pub async fn run_product_command(services: &Services, args: &[String]) -> Result<()> {
    let parsed = parse_command_args(args, 3, &PRODUCT_FLAGS);
    let catalog = services.catalog();
    match sub_command(args) {
        "" | "list" | "ls" => {
            let products = list_query(&parsed, "id", SortDirection::Asc)
                .apply(catalog.list_products().await?);
            if products.is_empty() {
                print_info("No products yet.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = products
                .iter()
                .map(|p| {
                    vec![
                        p.id.to_string(),
                        p.name.clone(),
                        p.category.clone(),
                        p.price.clone(),
                        p.stock.to_string(),
                    ]
                })
                .collect();
            print_table(&["ID", "NAME", "CATEGORY", "PRICE", "STOCK"], &rows);
        }
        "add" => {
            let mut draft = product_draft(&parsed)?;
            if draft.name.is_none() {
                draft.name = parsed.positional(0).map(str::to_string);
            }
            let product = catalog.add_product(&draft).await?;
            print_success(&format!(
                "Product '{}' added with id {}",
                product.name, product.id
            ));
        }
        "edit" | "update" => {
            let id = parse_id(parsed.positional(0), "product edit <id> [--price] [--stock] ...")?;
            let product = catalog.update_product(id, &product_draft(&parsed)?).await?;
            print_success(&format!("Product {} updated", product.id));
        }
        "delete" | "rm" => {
            let id = parse_id(parsed.positional(0), "product delete <id>")?;
            catalog.delete_product(id).await?;
            print_success(&format!("Product {} deleted", id));
        }
        _ => {
            GuideSection::new("optiagent product")
                .command("list", "Products (--search, --sort id|name|category|price|stock)")
                .command("add <name>", "[--category] [--price] [--stock]")
                .command("edit <id>", "[--name] [--category] [--price] [--stock]")
                .command("delete <id>", "Remove a product")
                .print();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn product_stock_must_be_a_whole_number() {
        let args = argv(&["optiagent", "product", "add", "Audit", "--stock", "2.5"]);
        let parsed = parse_command_args(&args, 3, &PRODUCT_FLAGS);
        assert!(product_draft(&parsed).is_err());

        let args = argv(&["optiagent", "product", "add", "Audit", "--stock", "4", "--price", "9.90"]);
        let parsed = parse_command_args(&args, 3, &PRODUCT_FLAGS);
        let draft = product_draft(&parsed).unwrap();
        assert_eq!(draft.stock, Some(4));
        assert_eq!(draft.price.as_deref(), Some("9.90"));
        assert!(draft.name.is_none());
    }

    #[test]
    fn ids_are_numeric() {
        assert_eq!(parse_id(Some("12"), "client delete <id>").unwrap(), 12);
        assert!(parse_id(Some("abc"), "client delete <id>").is_err());
        assert!(parse_id(None, "client delete <id>").is_err());
    }
}
