//! Rate limiting middleware for producer endpoints
//!
//! Token bucket per client key, using the `governor` crate.
//!
//! **Keying:**
//! - `auth:<hash>` when the request carries an `Authorization` header
//! - `ip:<addr>` otherwise (real IP from proxy headers, then peer address)
//!
//! At most `MAX_TRACKED_KEYS` buckets are kept. At the cap, buckets that
//! have fully refilled are dropped; if that frees nothing, every bucket is
//! forgotten and counting starts over.

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::AUTHORIZATION,
    Error, HttpResponse,
};
use error_types::ServiceError;
use futures::future::LocalBoxFuture;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::collections::hash_map::DefaultHasher;
use std::future::{ready, Ready};
use std::hash::{Hash, Hasher};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Tokens added per second
    pub req_per_second: u32,
    /// Bucket size
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            req_per_second: 20,
            burst_size: 40,
        }
    }
}

/// Keyed limiter with a bound on the number of tracked keys
struct KeyedLimiter {
    quota: Quota,
    max_keys: usize,
    current: Mutex<Arc<DefaultKeyedRateLimiter<String>>>,
}

impl KeyedLimiter {
    fn new(quota: Quota, max_keys: usize) -> Self {
        Self {
            quota,
            max_keys: max_keys.max(1),
            current: Mutex::new(Arc::new(RateLimiter::keyed(quota))),
        }
    }

    fn limiter(&self) -> Arc<DefaultKeyedRateLimiter<String>> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.len() >= self.max_keys {
            current.retain_recent();
            current.shrink_to_fit();
            if current.len() >= self.max_keys {
                warn!(tracked = current.len(), "rate limit key table full, resetting");
                *current = Arc::new(RateLimiter::keyed(self.quota));
            }
        }
        current.clone()
    }

    fn check(&self, key: &str) -> bool {
        self.limiter().check_key(&key.to_string()).is_ok()
    }

    fn tracked(&self) -> usize {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<KeyedLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_max_keys(config, MAX_TRACKED_KEYS)
    }

    pub fn with_max_keys(config: RateLimitConfig, max_keys: usize) -> Self {
        let per_second = NonZeroU32::new(config.req_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);

        Self {
            limiter: Arc::new(KeyedLimiter::new(quota, max_keys)),
        }
    }

    /// Number of client keys currently holding a bucket
    pub fn tracked_keys(&self) -> usize {
        self.limiter.tracked()
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimitMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddlewareService {
            service,
            limiter: self.limiter.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: S,
    limiter: Arc<KeyedLimiter>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let key = client_key(&req);

        if !self.limiter.check(&key) {
            debug!(key = %key, path = %req.path(), "rate limit exceeded");
            let (req, _payload) = req.into_parts();
            let res = HttpResponse::TooManyRequests()
                .json(ServiceError::RateLimited.to_response())
                .map_into_right_body();
            return Box::pin(async move { Ok(ServiceResponse::new(req, res)) });
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
    }
}

fn client_key(req: &ServiceRequest) -> String {
    if let Some(auth) = req.headers().get(AUTHORIZATION) {
        let mut hasher = DefaultHasher::new();
        auth.as_bytes().hash(&mut hasher);
        return format!("auth:{:016x}", hasher.finish());
    }

    let ip = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string();
    format!("ip:{}", ip)
}
