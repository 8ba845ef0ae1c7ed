//! demos/backend.rs
//! Run: cargo run --example backend -- <port> [name]

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr, time::Instant};

#[derive(Serialize)]
struct HealthCheckResponse {
    status: &'static str,
    #[serde(rename = "totalDuration")]
    total_duration: String,
    #[serde(rename = "serverResponse")]
    message: String,
}

async fn handle(req: Request<Body>, name: String) -> Result<Response<Body>, Infallible> {
    println!(
        "{} {} (host={:?})",
        req.method(),
        req.uri(),
        req.headers().get("host")
    );

    if req.uri().path() != "/hc" {
        return Ok(Response::builder()
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(Body::from(format!("You are connected to {name}")))
            .unwrap());
    }

    let start = Instant::now();
    let elapsed = start.elapsed();
    let payload = HealthCheckResponse {
        status: "Healthy",
        total_duration: format!(
            "{:02}:{:02}:{:02}.{:06}",
            elapsed.as_secs() / 3600,
            (elapsed.as_secs() / 60) % 60,
            elapsed.as_secs() % 60,
            elapsed.subsec_micros()
        ),
        message: format!("{name} is running"),
    };

    let response = match serde_json::to_vec(&payload) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Body::from(body)),
        Err(_) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("Error generating JSON")),
    };
    Ok(response.unwrap())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "8080".into())
        .parse()?;
    let name = std::env::args()
        .nth(2)
        .unwrap_or_else(|| format!("Server {port}"));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let make_svc = make_service_fn(move |_conn| {
        let name = name.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(req, name.clone())))
        }
    });

    println!("Starting backend at http://{addr}");
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}
