//! Command line stand-in for the browser extension. Works on a local
//! storage file and syncs it against a server.

use kiroku::client::{self, LocalStore, SyncClient};

const USAGE : &str = "usage:
    kiroku-ext save STORE URL
    kiroku-ext remove STORE URL
    kiroku-ext list STORE
    kiroku-ext set-key STORE API_KEY
    kiroku-ext sync STORE BASE_URL";

#[tokio::main]
async fn main() {
    kiroku::init_tracing();

    let args = std::env::args().collect::<Vec<_>>();
    let args = args.iter().map(String::as_str).collect::<Vec<_>>();

    let res = match &args[..] {
        [_, "save", store, url] => save(store, url),
        [_, "remove", store, url] => remove(store, url),
        [_, "list", store] => list(store),
        [_, "set-key", store, key] => set_key(store, key),
        [_, "sync", store, base_url] => sync(store, base_url).await,
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        },
    };

    if let Err(err) = res {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn save(store : &str, url : &str) -> kiroku::Result<()> {
    let url = kiroku::sync::parse_link_url(url)?;

    let mut store = LocalStore::open(store)?;
    if store.add_link(url.as_str()) {
        store.save()?;
        println!("saved {}", url);
    } else {
        println!("already saved {}", url);
    }

    Ok(())
}

fn remove(store : &str, url : &str) -> kiroku::Result<()> {
    let mut store = LocalStore::open(store)?;
    if store.remove_link(url) {
        store.save()?;
        println!("removed {}", url);
    } else {
        println!("not saved {}", url);
    }

    Ok(())
}

fn list(store : &str) -> kiroku::Result<()> {
    let store = LocalStore::open(store)?;

    for url in store.saved_links() {
        println!("{}", url);
    }

    if let Some(t) = store.last_sync() {
        eprintln!("last sync {}", t);
    }

    Ok(())
}

fn set_key(store : &str, key : &str) -> kiroku::Result<()> {
    let mut store = LocalStore::open(store)?;
    store.set_api_key(key.trim());
    store.save()
}

async fn sync(store : &str, base_url : &str) -> kiroku::Result<()> {
    let mut store = LocalStore::open(store)?;

    let api_key = store
        .api_key()
        .map(str::to_string)
        .ok_or(kiroku::Error::MissingApiKey)?;

    let sync_client = SyncClient::new(base_url, &api_key)?;
    let summary = client::reconcile(&mut store, &sync_client).await?;

    println!(
        "created {}, skipped {}, pulled {}, added {}",
        summary.created, summary.skipped, summary.pulled, summary.added
    );
    for err in &summary.errors {
        eprintln!("{}", err);
    }

    Ok(())
}
