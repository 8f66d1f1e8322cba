use crate::http::{make_boxed_error_response, make_text_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use http::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Health, readiness and config version endpoints for the admin listener.
///
/// `version` returns the version id of the snapshot currently being served,
/// or `None` before the first successful load. The service is ready exactly
/// when a version is available.
pub struct AdminService<V, E> {
    version: V,
    _error: PhantomData<E>,
}

impl<V, E> AdminService<V, E>
where
    V: Fn() -> Option<String>,
{
    pub fn new(version: V) -> Self {
        Self {
            version,
            _error: PhantomData,
        }
    }
}

impl<V, E> Service<Request<Incoming>> for AdminService<V, E>
where
    V: Fn() -> Option<String> + Send + Sync + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let version = (self.version)();

        Box::pin(async move {
            let res = match (req.uri().path(), version) {
                ("/health", _) => make_text_response("ok\n"),
                ("/ready", Some(_)) => make_text_response("ok\n"),
                ("/ready", None) => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
                ("/version", Some(v)) => make_text_response(format!("{v}\n")),
                ("/version", None) => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
                _ => make_boxed_error_response(StatusCode::NOT_FOUND),
            };
            Ok(res)
        })
    }
}
