use kiroku::*;

#[tokio::main]
async fn main() {
    kiroku::init_tracing();

    let args = std::env::args().collect::<Vec<_>>();

    let identity = match &args[..] {
        [_, email] => models::Identity {
            email : email.clone(),
            ..Default::default()
        },
        [_, email, name] => models::Identity {
            email : email.clone(),
            name : name.clone(),
            ..Default::default()
        },
        _ => {
            eprintln!("usage: add_user email [name]");
            std::process::exit(1);
        },
    };

    if let Err(err) = run(identity).await {
        tracing::error!(error = %err, "add_user failed");
        std::process::exit(1);
    }
}

async fn run(identity : models::Identity) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = config::Config::from_env()?;
    let db = database::Db::new(&config.database)?;

    let user = db.upsert_user(&identity).await?;
    let server = api::ServerInner::new(&config, db);
    let token = server.issue_session(&user)?;

    tracing::info!(user_id = user.id, email = %user.email, "user ready");

    // the token goes to stdout so it can be piped
    println!("{}", token);

    Ok(())
}
