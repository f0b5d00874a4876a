//! Dispatch glue between the server and the application.
//!
//! An [`App`] owns everything a connection task needs once a request has been
//! read: the frozen route table, the WebSocket handler, the broadcast
//! registry and an optional response cache.

use std::fmt;
use std::sync::Arc;

use crate::cache::TtlCache;
use crate::http::{Request, Response, StatusCode};
use crate::middleware::Pipeline;
use crate::realtime::{ClientRegistry, EchoBroadcast, WebSocketHandler};
use crate::router::{RouteMatch, Router, RouterError};

pub struct App {
    router: Arc<Router>,
    ws_handler: Arc<dyn WebSocketHandler>,
    registry: Arc<ClientRegistry>,
    cache: Option<TtlCache<Response>>,
}

impl App {
    /// An app serving `router`, answering WebSocket messages with
    /// [`EchoBroadcast`] and caching nothing.
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
            ws_handler: Arc::new(EchoBroadcast),
            registry: Arc::new(ClientRegistry::new()),
            cache: None,
        }
    }

    #[must_use]
    pub fn with_websocket(mut self, handler: impl WebSocketHandler) -> Self {
        self.ws_handler = Arc::new(handler);
        self
    }

    /// Serves repeated requests from `cache`, keyed by `METHOD:path`.
    ///
    /// The key ignores the query string, headers and body, so routes whose
    /// output depends on them will be served stale for the entry's lifetime.
    #[must_use]
    pub fn with_cache(mut self, cache: TtlCache<Response>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn websocket_handler(&self) -> &Arc<dyn WebSocketHandler> {
        &self.ws_handler
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> Option<&TtlCache<Response>> {
        self.cache.as_ref()
    }

    /// Produces the response for one HTTP request.
    ///
    /// A cached response short-circuits everything else. Otherwise the
    /// matched route's handler runs inside global then route middleware, and
    /// the result is cached. An unmatched request gets `404 Not Found`,
    /// still passed through the global middleware but never cached.
    pub fn handle_http(&self, mut req: Request) -> Response {
        let key = cache_key(&req);
        if let Some(hit) = self.cache.as_ref().and_then(|cache| cache.get(&key)) {
            tracing::debug!(key = %key, "response served from cache");
            return hit;
        }

        let mut res = Response::default();
        match self.router.match_route(req.method(), req.path()) {
            Ok(RouteMatch { route, params }) => {
                req.set_path_params(params);
                let pipeline: Pipeline = self
                    .router
                    .global_middleware()
                    .iter()
                    .chain(route.middleware())
                    .cloned()
                    .collect();
                let handler = route.handler();
                pipeline.execute(&mut req, &mut res, &|req: &mut Request, res: &mut Response| {
                    handler(req, res, req.path_params());
                });

                if let Some(cache) = &self.cache {
                    cache.set(key, res.clone(), None);
                }
            }
            Err(e) => {
                if !matches!(e, RouterError::NoRouteMatched { .. }) {
                    tracing::warn!(error = %e, "route lookup failed");
                }
                let pipeline: Pipeline = self.router.global_middleware().iter().cloned().collect();
                pipeline.execute(&mut req, &mut res, &not_found);
            }
        }
        res
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("routes", &self.router.len())
            .field("clients", &self.registry.len())
            .field("cache", &self.cache.as_ref().map(TtlCache::size))
            .finish_non_exhaustive()
    }
}

fn cache_key(req: &Request) -> String {
    format!("{}:{}", req.method(), req.path())
}

fn not_found(_req: &mut Request, res: &mut Response) {
    res.status(StatusCode::NOT_FOUND).text("Not Found");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::from_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn get(path: &str) -> Request {
        request(&format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"))
    }

    #[test]
    fn routes_with_path_params() {
        let mut router = Router::new();
        router
            .get("/users/:id", |_req, res, params| {
                res.text(format!("user {}", params.get("id").unwrap_or("?")));
            })
            .unwrap();
        let app = App::new(router);

        let res = app.handle_http(get("/users/42"));
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.body_text(), "user 42");
    }

    #[test]
    fn unmatched_is_404() {
        let app = App::new(Router::new());
        let res = app.handle_http(get("/nope"));
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(res.body_text(), "Not Found");
    }

    #[test]
    fn global_then_group_then_route_middleware() {
        let mark = |tag: &'static str| {
            from_fn(move |req, res, next| {
                res.append_body(format!("{tag} "));
                next.run(req, res);
            })
        };

        let mut router = Router::new();
        router.use_middleware(mark("global"));
        router
            .group("/api", vec![mark("group")], |api| {
                api.get_with("/ping", vec![mark("route")], |_req, res, _| {
                    res.append_body("pong");
                })?;
                Ok(())
            })
            .unwrap();
        let app = App::new(router);

        let res = app.handle_http(get("/api/ping"));
        assert_eq!(res.body_text(), "global group route pong");
    }

    #[test]
    fn global_middleware_sees_unmatched_requests() {
        let mut router = Router::new();
        router.use_middleware(from_fn(|req, res, next| {
            next.run(req, res);
            res.header("X-Seen", "1");
        }));
        let app = App::new(router);

        let res = app.handle_http(get("/missing"));
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(res.headers().get("x-seen"), Some("1"));
    }

    #[test]
    fn cached_response_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut router = Router::new();
        router
            .get("/count", move |_req, res, _| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                res.text(n.to_string());
            })
            .unwrap();
        let app = App::new(router).with_cache(TtlCache::new(10, Duration::from_secs(60)));

        assert_eq!(app.handle_http(get("/count")).body_text(), "1");
        // Same key: served from cache even though the handler would answer "2".
        assert_eq!(app.handle_http(get("/count?x=1")).body_text(), "1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(app.cache().unwrap().exists("GET:/count"));
    }

    #[test]
    fn not_found_is_not_cached() {
        let app = App::new(Router::new()).with_cache(TtlCache::default());
        app.handle_http(get("/missing"));
        assert_eq!(app.cache().unwrap().size(), 0);
    }
}
