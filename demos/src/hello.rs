//! Two tasks greeting on independent sleep intervals, torn down by a third
//! task awaiting SIGINT. The runtime analogue of the source's
//! `demo/python/hello.py`.

use std::time::Duration;

use ripple_core::{Dispatcher, RippleError, RuntimeConfig};
use signal_hook::consts::SIGINT;

async fn hello(dispatcher: Dispatcher, name: &'static str, period: Duration) -> Result<(), RippleError> {
    loop {
        dispatcher.sleep(period).await?;
        tracing::info!("Hello, {name}!");
    }
}

async fn terminator(dispatcher: Dispatcher) -> Result<(), RippleError> {
    dispatcher.signal(SIGINT).await?;
    tracing::info!("Got SIGINT!");
    dispatcher.stop();
    Ok(())
}

fn main() -> Result<(), RippleError> {
    tracing_subscriber::fmt::init();
    let dispatcher = Dispatcher::new(&RuntimeConfig::default())?;

    let d = dispatcher.clone();
    dispatcher.submit(async move { hello(d, "World", Duration::from_secs(1)).await });
    let d = dispatcher.clone();
    dispatcher.submit(async move { hello(d, "Alesh", Duration::from_millis(2500)).await });
    let d = dispatcher.clone();
    dispatcher.submit(async move { terminator(d).await });

    dispatcher.start()
}
