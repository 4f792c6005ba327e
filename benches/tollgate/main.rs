use tollgate::{Handler, Request, Response, Server};
use tokio::net::TcpListener;

struct HelloWorld;

impl Handler for HelloWorld {
    async fn handle(&self, _: &Request) -> Response {
        Response::ok()
            .header("content-type", "text/plain")
            .body("Hello, world!")
    }
}

// Load generators keep connections open far longer than the defaults allow.
#[tokio::main]
async fn main() {
    use std::time::Duration;
    use tollgate::limits::{ConnLimits, ServerLimits};

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(HelloWorld)
        .server_limits(ServerLimits {
            max_connections: 5000,
            ..ServerLimits::default()
        })
        .connection_limits(ConnLimits {
            persist_timeout: Duration::from_secs(120),
            max_requests_per_connection: 0,
            ..ConnLimits::default()
        })
        .build()
        .launch()
        .await;
}
