use crate::runner::metrics::Metrics;

use hyper::server::Server;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response};

use std::net::SocketAddr;

type Error = Box<dyn std::error::Error + Send + Sync>;

/// Serves `/metrics` and `/health` until the server fails. Either endpoint can be turned off,
/// in which case it returns a 404 like any other path.
pub(crate) async fn start(port: u16, metrics: Metrics, serve_metrics: bool, serve_health: bool) {
    let address: SocketAddr = ([0u8; 4], port).into();
    log::info!(
        "Starting server on address: {}, exposing '/metrics': {}, '/health': {}",
        address,
        serve_metrics,
        serve_health
    );

    let svc = Svc::new(metrics, serve_metrics, serve_health);
    let service = make_service_fn(move |_| {
        let service = svc.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |request| {
                futures_util::future::ready(service.handle_request(request))
            }))
        }
    });
    if let Err(err) = Server::bind(&address).serve(service).await {
        log::error!("Server failed with error: {:?}", err);
    }
}

#[derive(Debug, Clone)]
struct Svc {
    metrics: Metrics,
    serve_metrics: bool,
    serve_health: bool,
}

impl Svc {
    fn new(metrics: Metrics, serve_metrics: bool, serve_health: bool) -> Svc {
        Svc {
            metrics,
            serve_metrics,
            serve_health,
        }
    }

    fn not_found(&self) -> Result<Response<Body>, Error> {
        Ok(Response::builder().status(404).body(Body::empty())?)
    }

    fn health(&self) -> Result<Response<Body>, Error> {
        Ok(Response::builder().status(200).body(Body::from("ok"))?)
    }

    fn metrics(&self) -> Result<Response<Body>, Error> {
        let body = self.metrics.encode_as_text()?;
        let resp = Response::builder()
            .status(200)
            .header(http::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
            .body(Body::from(body))?;
        Ok(resp)
    }

    fn handle_request(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let req_path = request.uri().path().trim_end_matches('/');
        let req_method = request.method();
        log::debug!("Got http request {} {}", req_method, request.uri());

        let result = match (req_method, req_path) {
            (&Method::GET, "/health") if self.serve_health => self.health(),
            (&Method::GET, "/metrics") if self.serve_metrics => self.metrics(),
            _ => self.not_found(),
        };
        match result.as_ref() {
            Ok(resp) => log::debug!(
                "Finished handling {} {} with response status: {}",
                req_method,
                request.uri(),
                resp.status()
            ),
            Err(err) => log::error!(
                "Error handling {} {}, error: {:?}",
                req_method,
                request.uri(),
                err
            ),
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn get(svc: &Svc, path: &str) -> Response<Body> {
        let request = Request::get(path).body(Body::empty()).unwrap();
        svc.handle_request(request).unwrap()
    }

    #[test]
    fn endpoints_are_served_when_enabled() {
        let svc = Svc::new(Metrics::new().unwrap(), true, true);
        assert_eq!(200, get(&svc, "/health").status());
        assert_eq!(200, get(&svc, "/health/").status());
        let metrics = get(&svc, "/metrics");
        assert_eq!(200, metrics.status());
        assert_eq!(
            prometheus::TEXT_FORMAT,
            metrics.headers()[http::header::CONTENT_TYPE]
        );
        assert_eq!(404, get(&svc, "/other").status());
    }

    #[test]
    fn disabled_endpoints_are_not_found() {
        let svc = Svc::new(Metrics::new().unwrap(), false, true);
        assert_eq!(404, get(&svc, "/metrics").status());
        assert_eq!(200, get(&svc, "/health").status());

        let svc = Svc::new(Metrics::new().unwrap(), true, false);
        assert_eq!(404, get(&svc, "/health").status());
    }
}
