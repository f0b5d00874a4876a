//! Request routing: map URL templates and HTTP methods to handlers.
//!
//! Templates compile to anchored regular expressions:
//!
//! | Template                 | Example match            | Captured params        |
//! |--------------------------|--------------------------|------------------------|
//! | `/users`                 | `/users`                 | *(none)*               |
//! | `/users/:id`             | `/users/42`              | `id → "42"`            |
//! | `/posts/:slug([a-z-]+)`  | `/posts/hello-world`     | `slug → "hello-world"` |
//! | `/files/*`               | `/files/docs/readme.txt` | *(none)*               |
//!
//! A `:name` without an inline constraint matches `[A-Za-z0-9_]+`. Trailing
//! slashes are normalized on both templates and incoming paths, so `/users/`
//! and `/users` are equivalent.
//!
//! Routes live in one bucket per method plus a fallback bucket. Within a
//! bucket the first registered route that matches wins; the fallback bucket
//! is consulted only when the method's own bucket has no match.
//!
//! The table is built once before serving and is then shared read-only
//! behind an `Arc`, so matching needs no locking.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::http::{Method, PathParams, Request, Response};
use crate::middleware::MiddlewareHandler;

/// Default pattern for a `:name` placeholder without an inline constraint.
const DEFAULT_PARAM_PATTERN: &str = "[A-Za-z0-9_]+";

/// Route handler: reads the request and fills in the response.
pub type Handler = Arc<dyn Fn(&Request, &mut Response, &PathParams) + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unsupported HTTP method `{0}`")]
    UnsupportedMethod(String),

    #[error("invalid route template `{template}`: {source}")]
    InvalidPattern {
        template: String,
        #[source]
        source: Box<regex::Error>,
    },

    #[error("no route matched {method} {path}")]
    NoRouteMatched { method: String, path: String },
}

/// The bucket a route is registered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,
    Fallback,
}

impl RouteMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Head => "HEAD",
            Self::Fallback => "FALLBACK",
        }
    }

    /// The bucket for a request method, if routes can be registered for it.
    pub fn from_method(method: &Method) -> Option<Self> {
        Some(match method {
            Method::Get => Self::Get,
            Method::Post => Self::Post,
            Method::Put => Self::Put,
            Method::Patch => Self::Patch,
            Method::Delete => Self::Delete,
            Method::Options => Self::Options,
            Method::Head => Self::Head,
            _ => return None,
        })
    }
}

impl FromStr for RouteMethod {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "PATCH" => Self::Patch,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "HEAD" => Self::Head,
            "FALLBACK" => Self::Fallback,
            _ => return Err(RouterError::UnsupportedMethod(s.to_owned())),
        })
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered route.
pub struct Route {
    method: RouteMethod,
    template: String,
    matcher: Regex,
    handler: Handler,
    middleware: Vec<MiddlewareHandler>,
}

impl Route {
    pub fn method(&self) -> RouteMethod {
        self.method
    }

    /// The fully prefixed template, e.g. `/api/users/:id`.
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Group middleware followed by route-specific middleware.
    pub fn middleware(&self) -> &[MiddlewareHandler] {
        &self.middleware
    }

    fn captures(&self, path: &str) -> Option<PathParams> {
        let caps = self.matcher.captures(path)?;
        Some(
            self.matcher
                .capture_names()
                .flatten()
                .filter_map(|name| caps.name(name).map(|m| (name, m.as_str())))
                .collect(),
        )
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("template", &self.template)
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

/// A successful match: the route and the parameters captured from the path.
#[derive(Debug)]
pub struct RouteMatch<'r> {
    pub route: &'r Route,
    pub params: PathParams,
}

/// Prefix and middleware inherited by routes registered inside a group.
#[derive(Clone, Default)]
struct Scope {
    prefix: String,
    middleware: Vec<MiddlewareHandler>,
}

impl Scope {
    fn nest(&self, prefix: &str, middleware: Vec<MiddlewareHandler>) -> Self {
        let mut combined = self.middleware.clone();
        combined.extend(middleware);
        Self {
            prefix: join(&self.prefix, prefix),
            middleware: combined,
        }
    }
}

/// HTTP route table.
///
/// # Examples
///
/// ```
/// use socketry::http::Method;
/// use socketry::router::Router;
///
/// # fn main() -> Result<(), socketry::router::RouterError> {
/// let mut router = Router::new();
/// router
///     .get("/users/:id", |_req, res, params| {
///         res.text(format!("user {}", params.get("id").unwrap_or("?")));
///     })?
///     .fallback("/*", |_req, res, _| {
///         res.text("fallback");
///     })?;
///
/// let found = router.match_route(&Method::Get, "/users/42")?;
/// assert_eq!(found.params.get("id"), Some("42"));
/// assert_eq!(router.match_route(&Method::Get, "/nope")?.route.template(), "/*");
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Router {
    routes: HashMap<RouteMethod, Vec<Route>>,
    global: Vec<MiddlewareHandler>,
    matchers: HashMap<String, Regex>,
}

/// Generates the per-verb registration helpers shared by [`Router`] and [`RouteGroup`].
macro_rules! verb_methods {
    ($($name:ident, $name_with:ident => $method:ident;)*) => {
        $(
            #[doc = concat!("Registers a `", stringify!($method), "` route.")]
            pub fn $name<H>(&mut self, uri: &str, handler: H) -> Result<&mut Self, RouterError>
            where
                H: Fn(&Request, &mut Response, &PathParams) + Send + Sync + 'static,
            {
                self.$name_with(uri, Vec::new(), handler)
            }

            #[doc = concat!("Registers a `", stringify!($method), "` route with route-specific middleware.")]
            pub fn $name_with<H>(
                &mut self,
                uri: &str,
                middleware: Vec<MiddlewareHandler>,
                handler: H,
            ) -> Result<&mut Self, RouterError>
            where
                H: Fn(&Request, &mut Response, &PathParams) + Send + Sync + 'static,
            {
                self.register(RouteMethod::$method, uri, middleware, Arc::new(handler))?;
                Ok(self)
            }
        )*
    };
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    verb_methods! {
        get, get_with => Get;
        post, post_with => Post;
        put, put_with => Put;
        patch, patch_with => Patch;
        delete, delete_with => Delete;
        options, options_with => Options;
        head, head_with => Head;
        fallback, fallback_with => Fallback;
    }

    /// Registers a route for a method given by name (case-insensitive).
    ///
    /// # Errors
    ///
    /// [`RouterError::UnsupportedMethod`] for anything other than the seven
    /// supported verbs and `FALLBACK`.
    pub fn add_route<H>(
        &mut self,
        method: &str,
        uri: &str,
        middleware: Vec<MiddlewareHandler>,
        handler: H,
    ) -> Result<&mut Self, RouterError>
    where
        H: Fn(&Request, &mut Response, &PathParams) + Send + Sync + 'static,
    {
        let method = method.parse()?;
        self.register(method, uri, middleware, Arc::new(handler))?;
        Ok(self)
    }

    /// Registers routes under `prefix`, each inheriting `middleware` ahead of its own.
    ///
    /// ```
    /// use socketry::middleware::from_fn;
    /// use socketry::router::Router;
    ///
    /// # fn main() -> Result<(), socketry::router::RouterError> {
    /// let auth = from_fn(|req, res, next| next.run(req, res));
    /// let mut router = Router::new();
    /// router.group("/api", vec![auth], |api| {
    ///     api.get("/status", |_req, res, _| {
    ///         res.json(&serde_json::json!({"ok": true}));
    ///     })?;
    ///     api.group("/v1", Vec::new(), |v1| {
    ///         v1.get("/users/:id", |_req, _res, _| {})?;
    ///         Ok(())
    ///     })?;
    ///     Ok(())
    /// })?;
    ///
    /// assert!(router.match_route(&socketry::Method::Get, "/api/v1/users/7").is_ok());
    /// # Ok(())
    /// # }
    /// ```
    pub fn group<F>(
        &mut self,
        prefix: &str,
        middleware: Vec<MiddlewareHandler>,
        build: F,
    ) -> Result<&mut Self, RouterError>
    where
        F: FnOnce(&mut RouteGroup<'_>) -> Result<(), RouterError>,
    {
        let scope = Scope::default().nest(prefix, middleware);
        build(&mut RouteGroup {
            router: &mut *self,
            scope,
        })?;
        Ok(self)
    }

    /// Adds global middleware; it runs ahead of every route's own chain.
    pub fn use_middleware(&mut self, middleware: MiddlewareHandler) -> &mut Self {
        self.global.push(middleware);
        self
    }

    pub fn global_middleware(&self) -> &[MiddlewareHandler] {
        &self.global
    }

    /// Finds the route for `method` and `path`.
    ///
    /// # Errors
    ///
    /// [`RouterError::NoRouteMatched`] when neither the method's routes nor the
    /// fallback routes match.
    pub fn match_route(&self, method: &Method, path: &str) -> Result<RouteMatch<'_>, RouterError> {
        let path = normalize(path);
        let bucket = RouteMethod::from_method(method);

        bucket
            .into_iter()
            .chain([RouteMethod::Fallback])
            .filter_map(|m| self.routes.get(&m))
            .flatten()
            .find_map(|route| {
                route
                    .captures(path)
                    .map(|params| RouteMatch { route, params })
            })
            .ok_or_else(|| RouterError::NoRouteMatched {
                method: method.to_string(),
                path: path.to_owned(),
            })
    }

    /// Routes registered for `method`, in registration order.
    pub fn routes(&self, method: RouteMethod) -> &[Route] {
        self.routes.get(&method).map(Vec::as_slice).unwrap_or_default()
    }

    /// Total number of routes across all buckets.
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(
        &mut self,
        method: RouteMethod,
        uri: &str,
        middleware: Vec<MiddlewareHandler>,
        handler: Handler,
    ) -> Result<(), RouterError> {
        self.register_in(&Scope::default(), method, uri, middleware, handler)
    }

    fn register_in(
        &mut self,
        scope: &Scope,
        method: RouteMethod,
        uri: &str,
        route_middleware: Vec<MiddlewareHandler>,
        handler: Handler,
    ) -> Result<(), RouterError> {
        let template = join(&scope.prefix, uri);
        let matcher = self.matcher(&template)?;

        let mut middleware = scope.middleware.clone();
        middleware.extend(route_middleware);

        tracing::debug!(%method, %template, "route registered");
        self.routes.entry(method).or_default().push(Route {
            method,
            template,
            matcher,
            handler,
            middleware,
        });
        Ok(())
    }

    // Compiled matchers are cached by the fully prefixed template.
    fn matcher(&mut self, template: &str) -> Result<Regex, RouterError> {
        if let Some(re) = self.matchers.get(template) {
            return Ok(re.clone());
        }
        let re = compile(template).map_err(|e| RouterError::InvalidPattern {
            template: template.to_owned(),
            source: Box::new(e),
        })?;
        self.matchers.insert(template.to_owned(), re.clone());
        Ok(re)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes)
            .field("global_middleware", &self.global.len())
            .finish_non_exhaustive()
    }
}

/// Registration scope handed to a [`Router::group`] builder.
pub struct RouteGroup<'r> {
    router: &'r mut Router,
    scope: Scope,
}

impl RouteGroup<'_> {
    verb_methods! {
        get, get_with => Get;
        post, post_with => Post;
        put, put_with => Put;
        patch, patch_with => Patch;
        delete, delete_with => Delete;
        options, options_with => Options;
        head, head_with => Head;
        fallback, fallback_with => Fallback;
    }

    /// The prefix every route in this group receives.
    pub fn prefix(&self) -> &str {
        &self.scope.prefix
    }

    /// Opens a nested group; the outer scope is untouched once it returns.
    pub fn group<F>(
        &mut self,
        prefix: &str,
        middleware: Vec<MiddlewareHandler>,
        build: F,
    ) -> Result<&mut Self, RouterError>
    where
        F: FnOnce(&mut RouteGroup<'_>) -> Result<(), RouterError>,
    {
        let scope = self.scope.nest(prefix, middleware);
        build(&mut RouteGroup {
            router: &mut *self.router,
            scope,
        })?;
        Ok(self)
    }

    fn register(
        &mut self,
        method: RouteMethod,
        uri: &str,
        middleware: Vec<MiddlewareHandler>,
        handler: Handler,
    ) -> Result<(), RouterError> {
        self.router
            .register_in(&self.scope, method, uri, middleware, handler)
    }
}

// Strip a trailing slash, keeping the root `/`.
fn normalize(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    }
}

fn join(prefix: &str, uri: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let uri = normalize(uri);
    let joined = match (prefix.is_empty(), uri) {
        (true, "") => "/".to_owned(),
        (true, _) if uri.starts_with('/') => uri.to_owned(),
        (true, _) => format!("/{uri}"),
        (false, "" | "/") => prefix.to_owned(),
        (false, _) if uri.starts_with('/') => format!("{prefix}{uri}"),
        (false, _) => format!("{prefix}/{uri}"),
    };
    if joined.starts_with('/') {
        joined
    } else {
        format!("/{joined}")
    }
}

/// Compiles a route template to an anchored regex.
fn compile(template: &str) -> Result<Regex, regex::Error> {
    let template = normalize(template);
    let mut pattern = String::with_capacity(template.len() * 2 + 2);
    pattern.push('^');

    let bytes = template.as_bytes();
    let mut i = 0;
    while i < template.len() {
        let c = bytes[i];
        if c == b':' {
            let name_len = template[i + 1..]
                .bytes()
                .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
                .count();
            if name_len > 0 {
                let name = &template[i + 1..i + 1 + name_len];
                i += 1 + name_len;
                let constraint = match constraint(&template[i..]) {
                    Some(inner) => {
                        i += inner.len() + 2;
                        inner
                    }
                    None => DEFAULT_PARAM_PATTERN,
                };
                pattern.push_str(&format!("(?P<{name}>{constraint})"));
                continue;
            }
        }
        if c == b'*' {
            pattern.push_str(".*");
            i += 1;
            continue;
        }
        // Literal run up to the next placeholder or wildcard.
        let first = template[i..].chars().next().map_or(1, char::len_utf8);
        let end = template[i + first..]
            .find([':', '*'])
            .map_or(template.len(), |pos| i + first + pos);
        pattern.push_str(&regex::escape(&template[i..end]));
        i = end;
    }

    pattern.push('$');
    Regex::new(&pattern)
}

// Returns the text inside a balanced `( ... )` at the start of `rest`.
fn constraint(rest: &str) -> Option<&str> {
    if !rest.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    let mut escaped = false;
    for (idx, ch) in rest.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&rest[1..idx]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Pipeline, from_fn};

    fn noop(_: &Request, _: &mut Response, _: &PathParams) {}

    fn tagged(tag: &'static str) -> MiddlewareHandler {
        from_fn(move |req, res, next| {
            res.append_body(tag);
            next.run(req, res);
        })
    }

    #[test]
    fn param_route_and_fallback() {
        let mut router = Router::new();
        router.get("/users/:id", noop).unwrap();
        router.fallback("/*", noop).unwrap();

        let m = router.match_route(&Method::Get, "/users/42").unwrap();
        assert_eq!(m.route.template(), "/users/:id");
        assert_eq!(m.params.get("id"), Some("42"));

        let m = router.match_route(&Method::Get, "/nope").unwrap();
        assert_eq!(m.route.method(), RouteMethod::Fallback);
        assert!(m.params.is_empty());
    }

    #[test]
    fn no_match_without_fallback() {
        let mut router = Router::new();
        router.get("/users/:id", noop).unwrap();
        assert!(matches!(
            router.match_route(&Method::Get, "/nope"),
            Err(RouterError::NoRouteMatched { .. })
        ));
        // Method buckets are separate.
        assert!(router.match_route(&Method::Post, "/users/42").is_err());
    }

    #[test]
    fn first_registration_wins() {
        let mut router = Router::new();
        router.get("/items/special", noop).unwrap();
        router.get("/items/:name", noop).unwrap();

        let m = router.match_route(&Method::Get, "/items/special").unwrap();
        assert_eq!(m.route.template(), "/items/special");
        assert!(m.params.is_empty());
    }

    #[test]
    fn default_param_pattern_rejects_other_characters() {
        let mut router = Router::new();
        router.get("/users/:id", noop).unwrap();
        assert!(router.match_route(&Method::Get, "/users/a-b").is_err());
        assert!(router.match_route(&Method::Get, "/users/4/2").is_err());
    }

    #[test]
    fn inline_regex_constraints() {
        let mut router = Router::new();
        router.get("/posts/:year(\\d{4})/:slug([a-z-]+)", noop).unwrap();

        let m = router
            .match_route(&Method::Get, "/posts/2024/hello-world")
            .unwrap();
        assert_eq!(m.params.get("year"), Some("2024"));
        assert_eq!(m.params.get("slug"), Some("hello-world"));
        assert!(router.match_route(&Method::Get, "/posts/24/hello").is_err());
    }

    #[test]
    fn literal_characters_are_escaped() {
        let mut router = Router::new();
        router.get("/file.txt", noop).unwrap();
        assert!(router.match_route(&Method::Get, "/file.txt").is_ok());
        assert!(router.match_route(&Method::Get, "/fileXtxt").is_err());
    }

    #[test]
    fn trailing_slashes_are_normalized() {
        let mut router = Router::new();
        router.get("/users/", noop).unwrap();
        router.get("/", noop).unwrap();
        assert!(router.match_route(&Method::Get, "/users").is_ok());
        assert!(router.match_route(&Method::Get, "/users/").is_ok());
        assert_eq!(router.match_route(&Method::Get, "/").unwrap().route.template(), "/");
    }

    #[test]
    fn unsupported_method() {
        let mut router = Router::new();
        assert!(matches!(
            router.add_route("BREW", "/coffee", Vec::new(), noop),
            Err(RouterError::UnsupportedMethod(m)) if m == "BREW"
        ));
        router.add_route("patch", "/coffee", Vec::new(), noop).unwrap();
        assert!(router.match_route(&Method::Patch, "/coffee").is_ok());
    }

    #[test]
    fn invalid_constraint_is_reported() {
        let mut router = Router::new();
        assert!(matches!(
            router.get("/bad/:id([)", noop),
            Err(RouterError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn groups_nest_and_restore_scope() {
        let mut router = Router::new();
        router
            .group("/api", vec![tagged("G")], |api| {
                api.group("/v1", vec![tagged("N")], |v1| {
                    v1.get_with("/users/:id", vec![tagged("R")], noop)?;
                    Ok(())
                })?;
                assert_eq!(api.prefix(), "/api");
                api.get("/status", noop)?;
                Ok(())
            })
            .unwrap();
        router.get("/outside", noop).unwrap();

        let m = router.match_route(&Method::Get, "/api/v1/users/9").unwrap();
        assert_eq!(m.route.template(), "/api/v1/users/:id");
        assert_eq!(m.route.middleware().len(), 3);

        let mut req = Request::parse(b"GET /api/v1/users/9 HTTP/1.1\r\n\r\n").unwrap().0;
        let mut res = Response::default();
        let pipeline: Pipeline = m.route.middleware().iter().cloned().collect();
        pipeline.execute(&mut req, &mut res, &|_, res| {
            res.append_body("H");
        });
        assert_eq!(res.body_text(), "GNRH");

        assert_eq!(
            router
                .match_route(&Method::Get, "/api/status")
                .unwrap()
                .route
                .middleware()
                .len(),
            1
        );
        assert!(
            router
                .match_route(&Method::Get, "/outside")
                .unwrap()
                .route
                .middleware()
                .is_empty()
        );
    }

    #[test]
    fn matchers_are_cached_by_full_template() {
        let mut router = Router::new();
        router.get("/a/:id", noop).unwrap();
        router.post("/a/:id", noop).unwrap();
        router
            .group("/a", Vec::new(), |g| {
                g.put("/:id", noop)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(router.len(), 3);
        assert_eq!(router.matchers.len(), 1);
    }

    #[test]
    fn global_middleware_is_kept_separately() {
        let mut router = Router::new();
        router.use_middleware(tagged("X"));
        router.get("/", noop).unwrap();
        assert_eq!(router.global_middleware().len(), 1);
        assert!(router.routes(RouteMethod::Get)[0].middleware().is_empty());
    }

    #[test]
    fn join_prefixes() {
        assert_eq!(join("", "/users"), "/users");
        assert_eq!(join("", "users"), "/users");
        assert_eq!(join("/api", "/"), "/api");
        assert_eq!(join("/api/", "users"), "/api/users");
        assert_eq!(join("", "/"), "/");
    }
}
