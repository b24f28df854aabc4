use kiroku::{api, config, database};

#[tokio::main]
async fn main() {
    kiroku::init_tracing();

    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(1);
        },
    };

    let db = match database::Db::new(&config.database) {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(
                error = %err,
                path = %config.database.display(),
                "could not open database"
            );
            std::process::exit(1);
        },
    };

    let server = api::ServerInner::new(&config, db);

    tracing::info!(addr = %config.addr, server_name = %config.server_name, "listening");

    warp::serve(api::routes(&server)).run(config.addr).await;
}
