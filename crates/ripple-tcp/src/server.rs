//! L5: the TCP acceptor/connection frame. Turns a set of bound listeners
//! into per-connection `Stream`s handed to a user-supplied handler, each run
//! as its own dispatcher task.

use std::future::Future;
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use ripple_core::{BufferSizing, Dispatcher, IoEvent, IoHandle, IoInterest, RippleError, Stream};

const MAX_ACCEPTS_PER_WAKE: usize = 128;

type Handler = Rc<dyn Fn(Stream<mio::net::TcpStream>) -> std::pin::Pin<Box<dyn Future<Output = Result<(), RippleError>>>>>;

/// Owns the listening fds' reactor registrations. Dropping this does not
/// cancel them; call [`TcpServer::stop`] explicitly.
pub struct TcpServer {
    dispatcher: Dispatcher,
    listener_handles: Vec<IoHandle>,
}

impl TcpServer {
    /// Registers one READ watch per listener and starts accepting. `handler`
    /// is invoked once per accepted connection with a `Stream` already sized
    /// per `sizing`; its returned future is submitted as its own task, and
    /// the connection is closed once that task reaches a terminal state.
    pub fn serve<F, Fut>(
        dispatcher: Dispatcher,
        listeners: Vec<mio::net::TcpListener>,
        sizing: BufferSizing,
        handler: F,
    ) -> Result<Self, RippleError>
    where
        F: Fn(Stream<mio::net::TcpStream>) -> Fut + 'static,
        Fut: Future<Output = Result<(), RippleError>> + 'static,
    {
        let handler: Handler = Rc::new(move |stream| Box::pin(handler(stream)));
        let mut listener_handles = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let fd = listener.as_raw_fd();
            let listener = Rc::new(listener);
            let dispatcher_cb = dispatcher.clone();
            let handler_cb = Rc::clone(&handler);
            let handle = dispatcher.with_reactor_mut(|r| {
                r.setup_io(fd, IoInterest::READ, move |ev| {
                    if let IoEvent::Error(err) = ev {
                        tracing::error!(%err, "listener fd reported an error");
                        return;
                    }
                    accept_loop(&dispatcher_cb, &listener, sizing, &handler_cb);
                })
            })?;
            listener_handles.push(handle);
        }
        Ok(Self {
            dispatcher,
            listener_handles,
        })
    }

    /// Cancels every listener's reactor registration. In-flight connection
    /// handler tasks are left running; cancel them individually via the
    /// `TaskHandle`s returned from your own bookkeeping if you need a hard
    /// shutdown.
    pub fn stop(&self) {
        for handle in &self.listener_handles {
            self.dispatcher.with_reactor_mut(|r| r.cancel_io(*handle));
        }
    }
}

fn accept_loop(dispatcher: &Dispatcher, listener: &Rc<mio::net::TcpListener>, sizing: BufferSizing, handler: &Handler) {
    for _ in 0..MAX_ACCEPTS_PER_WAKE {
        match listener.accept() {
            Ok((conn, peer)) => {
                tracing::debug!(%peer, "accepted connection");
                spawn_connection(dispatcher, conn, sizing, handler);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if RippleError::is_transient_accept_error(&e) => {
                tracing::warn!(error = %e, "transient accept failure, retrying");
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                break;
            }
        }
    }
}

fn spawn_connection(dispatcher: &Dispatcher, conn: mio::net::TcpStream, sizing: BufferSizing, handler: &Handler) {
    let stream = match Stream::new(dispatcher.clone(), conn, sizing) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register accepted connection with the reactor");
            return;
        }
    };
    let for_handler = stream.clone();
    let for_close = stream.clone();
    let fut = (handler.as_ref())(for_handler);
    let task = dispatcher.submit(fut);
    task.on_done(move |outcome| {
        if !outcome.is_success() {
            tracing::debug!(?outcome, "connection handler ended");
        }
        for_close.close();
    });
}
