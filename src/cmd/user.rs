//! User registration and listing — `agencyflow user`.

use anyhow::Result;

use agencyflow::config::AppConfig;
use agencyflow::crm::auth::DbTokenAuth;
use agencyflow::crm::db::{CrmDb, DbHandle};

use crate::UserCommands;

pub async fn cmd_user(config: &AppConfig, command: UserCommands) -> Result<()> {
    let db_path = config.server_config().db_path;
    let db = DbHandle::new(CrmDb::new(&db_path)?);

    match command {
        UserCommands::Add { email, agency } => {
            let auth = DbTokenAuth::new(db.clone());
            let (user, token) = auth.register(&email).await?;
            println!("Registered {} ({})", user.email, user.id);
            println!("Access token: {}", token);
            println!("The token is shown once; store it now.");

            if let Some(name) = agency {
                let name = name.trim().to_string();
                if name.is_empty() {
                    anyhow::bail!("Agency name must not be empty");
                }
                let user_id = user.id;
                let (agency, _) = db.call(move |db| db.create_agency(&name, user_id)).await?;
                println!("Created agency '{}' ({}) owned by {}", agency.name, agency.id, user.email);
            }
        }
        UserCommands::List => {
            let users = db.lock_sync()?.list_auth_users()?;
            if users.is_empty() {
                println!("No users registered. Add one with 'agencyflow user add --email <email>'.");
                return Ok(());
            }
            println!();
            println!("{:<38} EMAIL", "ID");
            for user in users {
                println!("{:<38} {}", user.id.to_string(), user.email);
            }
            println!();
        }
    }

    Ok(())
}
