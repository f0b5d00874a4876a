//! Middleware pipeline: composable before/after request handler logic.
//!
//! An ordered list of middleware wraps a terminal endpoint. Each middleware
//! receives the request, the response being built, and a [`Next`] cursor into
//! the rest of the chain. It may:
//!
//! - **Pass through**: call `next.run(req, res)`.
//! - **Decorate**: do work before and/or after `next.run(req, res)`.
//! - **Short-circuit**: return without calling `next`; whatever the response
//!   holds at that point is what the client receives.
//!
//! For a chain `[a, b]` around endpoint `h` the call order is
//! `a → b → h`, unwinding `h → b → a`.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; consumed by [`Next::run`].
//! - [`MiddlewareHandler`]: shared, type-erased middleware.
//! - [`Pipeline`]: an owned ordered list that can execute against an endpoint.
//! - [`LoggerMiddleware`]: built-in request/response logger.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::http::{Request, Response};

/// The terminal step of a chain, usually a closure that calls the route handler.
pub type Endpoint<'a> = &'a (dyn Fn(&mut Request, &mut Response) + 'a);

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward the
/// request at most once.
///
/// # Examples
///
/// ```
/// use socketry::http::{Request, Response};
/// use socketry::middleware::{Middleware, Next};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn invoke(&self, req: &mut Request, res: &mut Response, next: Next<'_>) {
///         next.run(req, res);
///     }
/// }
/// ```
pub struct Next<'a> {
    remaining: &'a [MiddlewareHandler],
    endpoint: Endpoint<'a>,
}

impl<'a> Next<'a> {
    /// Creates a cursor positioned at the start of `chain`.
    pub fn new(chain: &'a [MiddlewareHandler], endpoint: Endpoint<'a>) -> Self {
        Self {
            remaining: chain,
            endpoint,
        }
    }

    /// Invokes the next middleware, or the endpoint once the chain is exhausted.
    pub fn run(self, req: &mut Request, res: &mut Response) {
        match self.remaining.split_first() {
            Some((head, rest)) => head.invoke(
                req,
                res,
                Next {
                    remaining: rest,
                    endpoint: self.endpoint,
                },
            ),
            None => (self.endpoint)(req, res),
        }
    }

    /// Number of middleware still ahead of the endpoint.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.remaining.len())
            .finish_non_exhaustive()
    }
}

/// The core trait for all middleware.
///
/// Implementations must be `Send + Sync`: one instance is shared by every
/// connection task. Execution within a request is synchronous.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the rest of the chain.
    fn invoke(&self, req: &mut Request, res: &mut Response, next: Next<'_>);
}

/// A shared, type-erased middleware.
pub type MiddlewareHandler = Arc<dyn Middleware>;

/// Wraps a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// ```
/// use socketry::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(LoggerMiddleware);
/// ```
pub fn from_middleware<M>(middleware: M) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(middleware)
}

/// Builds a middleware from a closure.
///
/// ```
/// use socketry::middleware::from_fn;
///
/// let powered_by = from_fn(|req, res, next| {
///     next.run(req, res);
///     res.header("X-Powered-By", "socketry");
/// });
/// ```
pub fn from_fn<F>(f: F) -> MiddlewareHandler
where
    F: Fn(&mut Request, &mut Response, Next<'_>) + Send + Sync + 'static,
{
    Arc::new(FnMiddleware(f))
}

struct FnMiddleware<F>(F);

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut Request, &mut Response, Next<'_>) + Send + Sync,
{
    fn invoke(&self, req: &mut Request, res: &mut Response, next: Next<'_>) {
        (self.0)(req, res, next)
    }
}

/// An ordered middleware list.
#[derive(Clone, Default)]
pub struct Pipeline {
    middleware: Vec<MiddlewareHandler>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware; it runs after everything already added.
    pub fn add(&mut self, middleware: MiddlewareHandler) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    pub fn extend(&mut self, middleware: impl IntoIterator<Item = MiddlewareHandler>) -> &mut Self {
        self.middleware.extend(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Runs the whole chain, ending in `endpoint` unless a middleware short-circuits.
    pub fn execute(&self, req: &mut Request, res: &mut Response, endpoint: Endpoint<'_>) {
        Next::new(&self.middleware, endpoint).run(req, res);
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("len", &self.middleware.len())
            .finish()
    }
}

impl FromIterator<MiddlewareHandler> for Pipeline {
    fn from_iter<I: IntoIterator<Item = MiddlewareHandler>>(iter: I) -> Self {
        Self {
            middleware: iter.into_iter().collect(),
        }
    }
}

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` line after the downstream chain completes,
/// in the format:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
///
/// `LoggerMiddleware` never short-circuits.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn invoke(&self, req: &mut Request, res: &mut Response, next: Next<'_>) {
        let start = Instant::now();
        let method = req.method().as_str().to_string();
        let path = req.path().to_string();

        next.run(req, res);

        let duration = start.elapsed();
        let status = res.status_code().as_u16();

        tracing::info!("{} {} - {} ({:?})", method, path, status, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    fn request() -> Request {
        Request::parse(b"GET /markers HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap()
            .0
    }

    fn marker(name: &'static str) -> MiddlewareHandler {
        from_fn(move |req, res, next| {
            res.append_body(format!("{name}-before "));
            next.run(req, res);
            res.append_body(format!(" {name}-after"));
        })
    }

    fn endpoint(_: &mut Request, res: &mut Response) {
        res.append_body("H");
    }

    #[test]
    fn runs_in_onion_order() {
        let pipeline: Pipeline = [marker("A"), marker("B")].into_iter().collect();
        let mut req = request();
        let mut res = Response::default();

        pipeline.execute(&mut req, &mut res, &endpoint);

        assert_eq!(res.body_text(), "A-before B-before H B-after A-after");
    }

    #[test]
    fn short_circuit_stops_the_chain() {
        let gate = from_fn(|_req, res, _next| {
            res.append_body("A-before");
        });
        let mut pipeline = Pipeline::new();
        pipeline.add(gate).add(marker("B"));

        let mut req = request();
        let mut res = Response::default();
        pipeline.execute(&mut req, &mut res, &endpoint);

        assert_eq!(res.body_text(), "A-before");
    }

    #[test]
    fn empty_pipeline_calls_endpoint() {
        let mut req = request();
        let mut res = Response::default();
        Pipeline::new().execute(&mut req, &mut res, &endpoint);
        assert_eq!(res.body_text(), "H");
    }

    #[test]
    fn middleware_can_mutate_request_for_the_endpoint() {
        let mut pipeline = Pipeline::new();
        pipeline.add(from_fn(|req, res, next| {
            req.set_header("X-User", "alice");
            next.run(req, res);
        }));

        let mut req = request();
        let mut res = Response::default();
        pipeline.execute(&mut req, &mut res, &|req, res| {
            res.text(req.header("x-user").unwrap_or("nobody").to_owned());
        });
        assert_eq!(res.body_text(), "alice");
    }

    #[test]
    fn logger_passes_through() {
        let mut pipeline = Pipeline::new();
        pipeline.add(from_middleware(LoggerMiddleware));

        let mut req = request();
        let mut res = Response::default();
        pipeline.execute(&mut req, &mut res, &|_, res| {
            res.status(StatusCode::CREATED);
        });
        assert_eq!(res.status_code(), StatusCode::CREATED);
    }
}
