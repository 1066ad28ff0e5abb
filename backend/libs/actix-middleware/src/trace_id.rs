//! Request trace ID middleware
//!
//! Every request gets a trace id that follows it into handler logs, hub
//! broadcasts (as the envelope `traceId`) and the response headers.
//!
//! ## Design
//! - If the request has an `X-Trace-ID` header: use it
//! - Otherwise: generate a UUID v4
//! - Store it as [`TraceId`] in request extensions
//! - Echo it back on the response
//!
//! ## Example
//! ```rust
//! use actix_middleware::TraceIdMiddleware;
//! use actix_web::App;
//!
//! let app = App::new()
//!     .wrap(TraceIdMiddleware);
//! ```

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error, HttpMessage, HttpRequest,
};
use futures::future::LocalBoxFuture;
use std::future::{ready, Ready};
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Trace id attached to the current request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(pub String);

/// Middleware that manages request trace ids
#[derive(Clone, Default)]
pub struct TraceIdMiddleware;

impl<S, B> Transform<S, ServiceRequest> for TraceIdMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = TraceIdMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(TraceIdMiddlewareService { service }))
    }
}

pub struct TraceIdMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for TraceIdMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let trace_id = req
            .headers()
            .get(TRACE_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        req.extensions_mut().insert(TraceId(trace_id.clone()));

        let fut = self.service.call(req);

        Box::pin(async move {
            let mut res = fut.await?;
            if let Ok(value) = HeaderValue::from_str(&trace_id) {
                res.headers_mut()
                    .insert(HeaderName::from_static(TRACE_ID_HEADER), value);
            }
            Ok(res)
        })
    }
}

/// Trace id of the request, if the middleware ran
pub fn get_trace_id(req: &HttpRequest) -> Option<String> {
    req.extensions().get::<TraceId>().map(|id| id.0.clone())
}
