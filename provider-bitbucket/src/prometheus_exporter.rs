use std::{net::SocketAddr, sync::Arc};

use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode,
    body::Bytes,
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;

async fn serve_req<B>(
    req: Request<B>,
    registry: Arc<Registry>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut result = Vec::new();
            match encoder.encode(&metric_families, &mut result) {
                Ok(_) => Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, encoder.format_type())
                    .body(Full::new(Bytes::from(result))),
                Err(e) => {
                    error!("{}", e);
                    Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Full::default())
                }
            }
        }
        (&Method::GET, "/healthz") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from_static(b"ok"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::default()),
    }
}

pub(crate) async fn start_prometheus_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);
    let registry = Arc::new(registry);
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| serve_req(req, registry.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("metrics connection error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use prometheus::IntCounter;

    async fn get(path: &str, registry: &Arc<Registry>) -> (StatusCode, String) {
        let req = Request::get(path).body(()).unwrap();
        let response = serve_req(req, registry.clone()).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn routes() {
        let registry = Registry::new();
        let counter = IntCounter::new("provider_bitbucket_test_total", "test counter").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();
        let registry = Arc::new(registry);

        let (status, body) = get("/metrics", &registry).await;
        assert_eq!(StatusCode::OK, status);
        assert!(body.contains("provider_bitbucket_test_total 1"));

        assert_eq!((StatusCode::OK, "ok".to_string()), get("/healthz", &registry).await);
        assert_eq!(StatusCode::NOT_FOUND, get("/other", &registry).await.0);
    }
}
