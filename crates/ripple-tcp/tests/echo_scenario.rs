//! End-to-end scenario: a `TcpServer` echoing lines back over a real TCP
//! loopback connection, driven by a plain blocking `std::net::TcpStream`
//! client running on its own OS thread while the reactor runs on this one.

use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::thread;
use std::time::Duration;

use ripple_core::{Deadline, Dispatcher, RippleError, RuntimeConfig, Stream};
use ripple_tcp::{bind, BindOptions, TcpServer};

async fn echo_once(stream: Stream<mio::net::TcpStream>) -> Result<(), RippleError> {
    let line = stream
        .read_until(b"\r\n".to_vec(), stream.buffer_size(), Deadline::from_duration(Some(Duration::from_secs(5))))
        .await?;
    stream.write(&line);
    stream.flush(Deadline::from_duration(Some(Duration::from_secs(5)))).await?;
    Ok(())
}

#[test]
fn echoes_a_single_line_back_to_a_real_tcp_client() {
    let dispatcher = Dispatcher::new(&RuntimeConfig::default()).unwrap();
    let listener = bind("127.0.0.1", 0, &BindOptions::default()).unwrap();
    let addr = listener.local_addr().unwrap();
    let sizing = RuntimeConfig::default().effective_buffer_sizing();

    let stop_dispatcher = dispatcher.clone();
    let server = TcpServer::serve(dispatcher.clone(), vec![listener], sizing, move |stream| {
        let stop_dispatcher = stop_dispatcher.clone();
        async move {
            let result = echo_once(stream).await;
            stop_dispatcher.stop();
            result
        }
    })
    .unwrap();

    let client = thread::spawn(move || {
        let mut conn = StdTcpStream::connect(addr).unwrap();
        conn.write_all(b"ping\r\n").unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).unwrap();
        buf[..n].to_vec()
    });

    dispatcher.start().unwrap();
    server.stop();

    let echoed = client.join().unwrap();
    assert_eq!(&echoed, b"ping\r\n");
}
