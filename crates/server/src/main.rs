use std::path::Path;
use std::process;
use std::sync::Arc;

use library::{Storage, StorageError};
use metadata::LoftyReader;
use tracing::{error, info};

use server::config::{config_path_from_env, load_or_create_config};
use server::manager::Server;
use server::session::ServerContext;

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = match load_or_create_config(&config_path) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!("could not load config from {:?}: {}", config_path, err);
            process::exit(1);
        }
    };
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let mount = Path::new(&config.mount_path);
    if !mount.exists() {
        error!("mount path {} does not exist, is the drive mounted?", mount.display());
        process::exit(2);
    }

    let root = mount.join(&config.server_folder);
    let storage = match Storage::open(&root, Arc::new(LoftyReader)) {
        Ok(storage) => storage,
        Err(err @ StorageError::RootMissing(_)) => {
            error!("{}", err);
            process::exit(3);
        }
        Err(err @ StorageError::CreateFolder(..)) => {
            error!("{}", err);
            process::exit(4);
        }
    };
    info!(
        "storage ready under {}, {} tracks catalogued",
        root.display(),
        storage.track_count()
    );

    let ctx = ServerContext {
        storage: Arc::new(storage),
        config,
    };
    let mut server = match Server::start(ctx) {
        Ok(server) => server,
        Err(err) => {
            error!("could not bind listeners: {}", err);
            process::exit(1);
        }
    };
    server.wait();
}
