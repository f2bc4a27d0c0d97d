//! A server page behind basic auth.
//!
//! ```text
//! curl -u ann:secret 'http://127.0.0.1:8080/hello?name=World'
//! ```

use pool_httpd::{
    handlers::{
        auth::{BasicAuth, ValueAuth},
        serverpage::{page_fn, ServerPage},
    },
    HttpDaemon, Listener, StatusCode,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pool_httpd=info".into()),
        )
        .init();

    let users = ValueAuth::new()
        .user("ann", "secret")
        .info("ann", "name", "Ann");

    let hello = page_fn(|env, args, out, headers| {
        let name = args
            .iter()
            .find(|(k, _)| k == "name")
            .map_or("stranger", |(_, v)| v.as_str());
        let user = env.get("USER").unwrap_or("-");

        headers.set("Content-Type", "text/plain; charset=utf-8");
        out.extend_from_slice(format!("Hello, {name}! (signed in as {user})\n").as_bytes());
        Some(StatusCode::Ok)
    });

    let daemon = HttpDaemon::builder()
        .listener(Listener::listen_on("127.0.0.1:8080").unwrap())
        .handler("*", BasicAuth::new("hello", users))
        .handler("/hello", ServerPage::new(hello))
        .build()
        .unwrap();

    daemon.start().unwrap();
    std::thread::park();
}
