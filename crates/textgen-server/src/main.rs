use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser};
use salvo::{
    affix_state,
    cors::{AllowHeaders, AllowOrigin, Cors},
    http::Method,
    logging::Logger,
    prelude::*,
    Router,
};
use textgen_core::{model_route, ReloadRequest, ThreadRequest};
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
};

use crate::types::ThreadState;

mod api;
mod config;
mod types;

/// Environment variable that overrides the folder models are loaded from.
const MODEL_LOCATION: &str = "MODEL_LOCATION";

pub fn build_path(path: impl AsRef<Path>, name: impl AsRef<Path>) -> Result<PathBuf> {
    let permitted = path.as_ref();
    let name = name.as_ref();
    if name.components().any(|c| c == std::path::Component::ParentDir) {
        bail!("cannot have \"..\" in names");
    }
    let path = match name.is_absolute() || name.starts_with(permitted) {
        true => name.into(),
        false => permitted.join(name),
    };
    match path.starts_with(permitted) {
        true => Ok(path),
        false => bail!("path not permitted"),
    }
}

/// Keep the files named by a reload request inside the folders the server was configured with.
///
/// An empty tokenizer path selects the configured `tokenizer`.
pub fn confine_reload(
    request: &mut ReloadRequest,
    models: impl AsRef<Path>,
    tokenizer: impl AsRef<Path>,
) -> Result<()> {
    let tokenizer = tokenizer.as_ref();
    request.model_path = build_path(models, &request.model_path)?;
    request.tokenizer_path = match request.tokenizer_path.as_os_str().is_empty() {
        true => tokenizer.to_path_buf(),
        false => {
            let folder = tokenizer
                .parent()
                .filter(|path| !path.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            build_path(folder, &request.tokenizer_path)?
        }
    };
    Ok(())
}

pub async fn load_config(path: impl AsRef<Path>) -> Result<config::Config> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    Ok(toml::from_str(&contents)?)
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long, short)]
    ip: Option<IpAddr>,
    #[arg(long, short)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("textgen_server", log::LevelFilter::Info)
        .with_module_level("textgen_core", log::LevelFilter::Info)
        .with_module_level("web_rwkv", log::LevelFilter::Info)
        .init()
        .expect("start logger");

    let args = Args::parse();

    let cmd = Args::command();
    let version = cmd.get_version().unwrap_or("0.0.1");
    let bin_name = cmd.get_bin_name().unwrap_or("textgen_server");

    log::info!("{}\tversion: {}", bin_name, version);

    let (sender, receiver) = flume::unbounded::<ThreadRequest>();
    tokio::spawn(model_route(receiver));

    let config = {
        let path = args
            .config
            .clone()
            .unwrap_or("assets/configs/Config.toml".into());
        log::info!("reading config {}...", path.to_string_lossy());
        let mut config = load_config(path).await.expect("load config failed");
        if let Ok(location) = std::env::var(MODEL_LOCATION) {
            log::info!("model location overridden by {MODEL_LOCATION}: {location}");
            config.model.path = location.into();
        }
        config
    };
    let listen = config.listen.clone();

    let request = Box::new(config.clone().try_into().expect("load model failed"));
    let _ = sender.send(ThreadRequest::Reload {
        request,
        sender: None,
    });

    let cors = Cors::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(vec![Method::GET, Method::POST])
        .allow_headers(AllowHeaders::any())
        .into_handler();

    let admin_router = Router::new()
        .push(Router::with_path("/models/load").post(api::load))
        .push(Router::with_path("/models/unload").get(api::unload));
    let api_router = Router::new()
        .push(Router::with_path("/predict").post(api::predict::predict))
        .push(Router::with_path("/generate").post(api::generate))
        .push(Router::with_path("/adapters").get(api::adapters))
        .push(Router::with_path("/models/info").get(api::info));

    let app = Router::new()
        .hoop(Logger::new())
        .hoop(affix_state::inject(ThreadState {
            sender,
            path: config.model.path,
            tokenizer: config.tokenizer.path,
            predict: config.predict,
        }))
        .push(Router::with_path("/api").push(api_router))
        .push(Router::with_path("/admin").push(admin_router));

    let doc = OpenApi::new(bin_name, version).merge_router(&app);

    let app = app
        .push(doc.into_router("/api-docs/openapi.json"))
        .push(SwaggerUi::new("/api-docs/openapi.json").into_router("api-docs"));

    let service = Service::new(app).hoop(cors);
    let ip_addr = args.ip.unwrap_or(listen.ip);
    let port = args.port.unwrap_or(listen.port);
    let addr = SocketAddr::new(ip_addr, port);

    log::info!("server started at {addr}");
    let acceptor = TcpListener::new(addr).bind().await;
    salvo::server::Server::new(acceptor).serve(service).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_names_join_the_permitted_folder() {
        let path = build_path("assets/models", "model.st").unwrap();
        assert_eq!(path, PathBuf::from("assets/models/model.st"));

        let path = build_path("assets/models", "assets/models/sub/model.st").unwrap();
        assert_eq!(path, PathBuf::from("assets/models/sub/model.st"));
    }

    #[test]
    fn escaping_names_are_rejected() {
        assert!(build_path("assets/models", "../model.st").is_err());
        assert!(build_path("assets/models", "sub/../../model.st").is_err());
        assert!(build_path("assets/models", "/etc/passwd").is_err());
    }

    #[test]
    fn reload_paths_stay_inside_the_configured_folders() {
        let mut request = ReloadRequest {
            model_path: "model.st".into(),
            tokenizer_path: "other_vocab.json".into(),
            ..Default::default()
        };
        confine_reload(&mut request, "assets/models", "assets/tokenizer/vocab.json").unwrap();
        assert_eq!(request.model_path, PathBuf::from("assets/models/model.st"));
        assert_eq!(
            request.tokenizer_path,
            PathBuf::from("assets/tokenizer/other_vocab.json")
        );

        let mut request = ReloadRequest {
            model_path: "model.st".into(),
            ..Default::default()
        };
        confine_reload(&mut request, "assets/models", "assets/tokenizer/vocab.json").unwrap();
        assert_eq!(
            request.tokenizer_path,
            PathBuf::from("assets/tokenizer/vocab.json")
        );
    }

    #[test]
    fn escaping_tokenizer_paths_are_rejected() {
        for tokenizer_path in ["/etc/passwd", "../secret.json", "sub/../../secret.json"] {
            let mut request = ReloadRequest {
                model_path: "model.st".into(),
                tokenizer_path: tokenizer_path.into(),
                ..Default::default()
            };
            assert!(
                confine_reload(&mut request, "assets/models", "assets/tokenizer/vocab.json")
                    .is_err(),
                "{tokenizer_path} should be rejected"
            );
        }

        let mut request = ReloadRequest {
            model_path: "model.st".into(),
            tokenizer_path: "/etc/passwd".into(),
            ..Default::default()
        };
        assert!(confine_reload(&mut request, "assets/models", "vocab.json").is_err());
    }
}
