//! Client command handlers: register, list, toggle, and test download clients.

use anyhow::Result;
use bookfetch_core::{NewDownloadClient, RequestLifecycle};

use crate::cli::{ClientAddArgs, ClientCommand};

pub async fn run_client_command(command: &ClientCommand, lifecycle: &RequestLifecycle) -> Result<()> {
    let store = lifecycle.store();
    match command {
        ClientCommand::Add(args) => add(lifecycle, args).await,
        ClientCommand::List => {
            let clients = store.list_clients().await?;
            if clients.is_empty() {
                println!("No download clients. Add one with `bookfetch client add`.");
                return Ok(());
            }
            for client in &clients {
                println!(
                    "#{:<3} {:<16} {:<7} priority={:<3} {} {}",
                    client.id,
                    client.name,
                    client.client_type,
                    client.priority,
                    if client.enabled { "enabled " } else { "disabled" },
                    client.base_url
                );
            }
            Ok(())
        }
        ClientCommand::Test { client_id } => {
            if lifecycle.orchestrator().test_client(*client_id).await? {
                println!("Client {client_id}: connection OK.");
            } else {
                println!("Client {client_id}: reachable, but credentials were refused.");
            }
            Ok(())
        }
        ClientCommand::Enable { client_id } => {
            store.set_client_enabled(*client_id, true).await?;
            println!("Client {client_id} enabled.");
            Ok(())
        }
        ClientCommand::Disable { client_id } => {
            store.set_client_enabled(*client_id, false).await?;
            println!("Client {client_id} disabled.");
            Ok(())
        }
    }
}

async fn add(lifecycle: &RequestLifecycle, args: &ClientAddArgs) -> Result<()> {
    let client = lifecycle
        .store()
        .insert_client(&NewDownloadClient {
            name: args.name.clone(),
            client_type: args.client_type,
            base_url: args.url.clone(),
            username: args.username.clone(),
            password: args.password.clone(),
            api_key: args.api_key.clone(),
            category: args.category.clone(),
            priority: args.priority,
            enabled: !args.disabled,
        })
        .await?;
    println!(
        "Added {} client {} as #{}.",
        client.client_type, client.name, client.id
    );
    Ok(())
}
