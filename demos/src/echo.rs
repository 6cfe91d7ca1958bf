//! Line-oriented echo server: accepts connections and echoes back
//! everything up to and including each `"\r\n"`. Grounded in the source's
//! `demo/echoco.py` acceptor/handler split, translated into one
//! `TcpServer::serve` handler task per connection instead of a nested
//! acceptor coroutine managing a connection dict by hand.

use std::time::Duration;

use ripple_core::{Deadline, Dispatcher, RippleError, RuntimeConfig, Stream};
use ripple_tcp::{bind, BindOptions, TcpServer};

const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

async fn echo_handler(stream: Stream<mio::net::TcpStream>) -> Result<(), RippleError> {
    loop {
        let line = stream
            .read_until(b"\r\n".to_vec(), stream.buffer_size(), Deadline::from_duration(Some(IDLE_TIMEOUT)))
            .await?;
        stream.write(&line);
        stream.flush(Deadline::from_duration(Some(IDLE_TIMEOUT))).await?;
    }
}

fn main() -> Result<(), RippleError> {
    tracing_subscriber::fmt::init();
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(22077);

    let config = RuntimeConfig::default();
    let sizing = config.effective_buffer_sizing();
    let bind_opts = BindOptions {
        backlog: config.accept_backlog,
        reuse_port: config.reuse_port,
        family: config.family,
    };

    let dispatcher = Dispatcher::new(&config)?;
    dispatcher.submit_default_terminators();
    let listener = bind("localhost", port, &bind_opts)?;
    tracing::info!(%port, "established echo listener");
    let server = TcpServer::serve(dispatcher.clone(), vec![listener], sizing, |stream| echo_handler(stream))?;

    let result = dispatcher.start();
    server.stop();
    result
}
