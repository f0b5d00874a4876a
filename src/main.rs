use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use socketry::app::App;
use socketry::cache::TtlCache;
use socketry::config::ServerConfig;
use socketry::http::StatusCode;
use socketry::middleware::{LoggerMiddleware, from_fn, from_middleware};
use socketry::router::{Router, RouterError};
use socketry::server::{Server, ShutdownSignal};
use socketry::template::TemplateEngine;

/// HTTP/1.1 and WebSocket demo server.
#[derive(Debug, Parser)]
#[command(name = "socketry", version, about)]
struct Args {
    /// Path to a TOML config file.
    #[arg(short, long, env = "SOCKETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address; overrides the config file.
    #[arg(short, long)]
    addr: Option<String>,

    /// Log filter directive, e.g. `debug` or `socketry=trace`.
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(log) = args.log {
        config.log = log;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        addr = %config.addr,
        cache = config.cache.enabled,
        templates = %config.templates_dir.display(),
        "configuration loaded"
    );

    let router = demo_router(TemplateEngine::new(&config.templates_dir))?;
    let mut app = App::new(router);
    if config.cache.enabled {
        app = app.with_cache(TtlCache::new(config.cache.capacity, config.cache.ttl()));
    }

    let server = Server::bind(config)
        .await?
        .with_shutdown(ShutdownSignal::with_os_signals());
    server.run(app).await?;

    tracing::info!("shutdown complete");
    Ok(())
}

fn demo_router(templates: TemplateEngine) -> Result<Router, RouterError> {
    let templates = Arc::new(templates);
    let mut router = Router::new();
    router.use_middleware(from_middleware(LoggerMiddleware));

    router.get("/", move |_req, res, _| {
        match templates.render("home.grd", &json!({ "name": "John Doe" })) {
            Ok(html) => {
                res.html(html);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to render home page");
                res.status(StatusCode::INTERNAL_SERVER_ERROR)
                    .text("Internal Server Error");
            }
        }
    })?;

    router.get("/users/:id", |_req, res, params| {
        let id = params.get("id").unwrap_or_default();
        res.text(format!("User ID: {id}"));
    })?;

    let powered_by = from_fn(|req, res, next| {
        next.run(req, res);
        res.header("X-Powered-By", "socketry");
    });
    router.group("/api", vec![powered_by], |api| {
        api.get("/status", |_req, res, _| {
            res.json(&json!({ "status": "ok" }));
        })?;
        api.post("/echo", |req, res, _| {
            res.text(req.body_text().into_owned());
        })?;
        api.get("/posts/:slug([a-z0-9-]+)", |_req, res, params| {
            res.json(&json!({ "slug": params.get("slug") }));
        })?;
        Ok(())
    })?;

    router.fallback("/*", |req, res, _| {
        res.status(StatusCode::NOT_FOUND)
            .text(format!("No page at {}", req.path()));
    })?;

    Ok(router)
}
