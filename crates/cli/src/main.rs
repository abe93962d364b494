use cifrachat_crypto::password::hash_password;
use cifrachat_storage::{NewUser, connect};
use std::env;
use tokio::runtime::Builder;
use tracing::info;

fn main() {
    let _ = dotenvy::dotenv();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter("info")
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to init tracing");
    let mut runtime = Builder::new_multi_thread();
    runtime.enable_all();
    let runtime = runtime.build().expect("failed to build runtime");
    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<(), String> {
    let mut args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() {
        return Err("usage: cifrachat-cli <migrate|create-user|diagnose>".to_string());
    }
    let command = args.remove(0);
    match command.as_str() {
        "migrate" => command_migrate().await,
        "create-user" => command_create_user(args).await,
        "diagnose" => command_diagnose().await,
        other => Err(format!("unknown command: {}", other)),
    }
}

async fn command_migrate() -> Result<(), String> {
    let storage = storage_connect().await?;
    storage
        .migrate()
        .await
        .map_err(|err| format!("migrate failed: {}", err))
}

async fn command_create_user(mut args: Vec<String>) -> Result<(), String> {
    if args.len() < 2 {
        return Err("usage: cifrachat-cli create-user <username> <password>".to_string());
    }
    let username = args.remove(0).trim().to_lowercase();
    let password = args.remove(0);
    if username.chars().count() < 2 {
        return Err("username must be at least 2 characters".to_string());
    }
    if password.chars().count() < 4 {
        return Err("password must be at least 4 characters".to_string());
    }
    let record = hash_password(&password);
    let storage = storage_connect().await?;
    let user = storage
        .create_user(&NewUser {
            username,
            password_hash: record.hash,
            salt: record.salt,
        })
        .await
        .map_err(|err| format!("create failed: {}", err))?;
    println!("user_id={}", user.user_id);
    println!("username={}", user.username);
    Ok(())
}

async fn command_diagnose() -> Result<(), String> {
    let storage = storage_connect().await?;
    storage
        .readiness()
        .await
        .map_err(|err| format!("readiness failed: {}", err))?;
    storage
        .lookup_session("diagnose-probe")
        .await
        .map_err(|err| format!("session lookup failed: {}", err))?;
    info!("diagnose complete");
    Ok(())
}

async fn storage_connect() -> Result<cifrachat_storage::Storage, String> {
    let pg = env::var("CIFRACHAT_PG_DSN").map_err(|_| "CIFRACHAT_PG_DSN not set".to_string())?;
    connect(&pg)
        .await
        .map_err(|err| format!("storage connect failed: {}", err))
}
