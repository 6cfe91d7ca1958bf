//! Exercises the L2/L3/L4 stack together over a real reactor-registered
//! socket pair, rather than mocking the reactor — this spec's core subject
//! is the reactor/dispatcher/buffer coupling itself.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use ripple_core::{Deadline, Dispatcher, RippleError, RuntimeConfig, Stream};

#[test]
fn read_until_delivers_a_full_line_written_from_the_other_end() {
    let dispatcher = Dispatcher::new(&RuntimeConfig::default()).unwrap();
    let (a, b) = mio::net::UnixStream::pair().unwrap();
    let sizing = RuntimeConfig::default().effective_buffer_sizing();
    let writer = Stream::new(dispatcher.clone(), a, sizing).unwrap();
    let reader = Stream::new(dispatcher.clone(), b, sizing).unwrap();

    let received = Rc::new(RefCell::new(None));
    let received2 = Rc::clone(&received);
    let stop_on_read = dispatcher.clone();
    dispatcher.submit(async move {
        let line = reader
            .read_until(b"\r\n".to_vec(), 1024, Deadline::from_duration(Some(Duration::from_secs(5))))
            .await?;
        *received2.borrow_mut() = Some(line);
        stop_on_read.stop();
        Ok(())
    });
    dispatcher.submit(async move {
        writer.write(b"hello world\r\n");
        writer.flush(Deadline::None).await?;
        Ok(())
    });

    dispatcher.start().unwrap();
    assert_eq!(received.borrow().as_ref().unwrap().as_ref(), &b"hello world\r\n"[..]);
}

#[test]
fn read_exactly_waits_across_two_partial_writes() {
    let dispatcher = Dispatcher::new(&RuntimeConfig::default()).unwrap();
    let (a, b) = mio::net::UnixStream::pair().unwrap();
    let sizing = RuntimeConfig::default().effective_buffer_sizing();
    let writer = Stream::new(dispatcher.clone(), a, sizing).unwrap();
    let reader = Stream::new(dispatcher.clone(), b, sizing).unwrap();

    let received = Rc::new(RefCell::new(None));
    let received2 = Rc::clone(&received);
    let stop_on_read = dispatcher.clone();
    dispatcher.submit(async move {
        let bytes = reader.read_exactly(6, Deadline::from_duration(Some(Duration::from_secs(5)))).await?;
        *received2.borrow_mut() = Some(bytes);
        stop_on_read.stop();
        Ok(())
    });
    let write_dispatcher = dispatcher.clone();
    dispatcher.submit(async move {
        writer.write(b"abc");
        writer.flush(Deadline::None).await?;
        write_dispatcher.sleep(Duration::from_millis(20)).await?;
        writer.write(b"def");
        writer.flush(Deadline::None).await?;
        Ok(())
    });

    dispatcher.start().unwrap();
    assert_eq!(received.borrow().as_ref().unwrap().as_ref(), &b"abcdef"[..]);
}

#[test]
fn read_exactly_times_out_when_not_enough_bytes_arrive() {
    let dispatcher = Dispatcher::new(&RuntimeConfig::default()).unwrap();
    let (_a, b) = mio::net::UnixStream::pair().unwrap();
    let sizing = RuntimeConfig::default().effective_buffer_sizing();
    let reader = Stream::new(dispatcher.clone(), b, sizing).unwrap();

    let outcome: Rc<RefCell<Option<Result<bytes::Bytes, RippleError>>>> = Rc::new(RefCell::new(None));
    let outcome2 = Rc::clone(&outcome);
    let stop_dispatcher = dispatcher.clone();
    dispatcher.submit(async move {
        let result = reader
            .read_exactly(10, Deadline::from_duration(Some(Duration::from_millis(30))))
            .await;
        *outcome2.borrow_mut() = Some(result);
        stop_dispatcher.stop();
        Ok(())
    });

    dispatcher.start().unwrap();
    assert!(matches!(outcome.borrow().as_ref().unwrap(), Err(RippleError::Timeout)));
}

#[test]
fn read_exactly_rejects_zero_length() {
    let dispatcher = Dispatcher::new(&RuntimeConfig::default()).unwrap();
    let (a, _b) = mio::net::UnixStream::pair().unwrap();
    let sizing = RuntimeConfig::default().effective_buffer_sizing();
    let reader = Stream::new(dispatcher.clone(), a, sizing).unwrap();

    let outcome: Rc<RefCell<Option<Result<bytes::Bytes, RippleError>>>> = Rc::new(RefCell::new(None));
    let outcome2 = Rc::clone(&outcome);
    dispatcher.submit(async move {
        let result = reader.read_exactly(0, Deadline::None).await;
        *outcome2.borrow_mut() = Some(result);
        Ok(())
    });

    assert!(matches!(outcome.borrow().as_ref().unwrap(), Err(RippleError::InvalidArgument(_))));
}

#[test]
fn read_until_rejects_empty_delimiter() {
    let dispatcher = Dispatcher::new(&RuntimeConfig::default()).unwrap();
    let (a, _b) = mio::net::UnixStream::pair().unwrap();
    let sizing = RuntimeConfig::default().effective_buffer_sizing();
    let reader = Stream::new(dispatcher.clone(), a, sizing).unwrap();

    let outcome: Rc<RefCell<Option<Result<bytes::Bytes, RippleError>>>> = Rc::new(RefCell::new(None));
    let outcome2 = Rc::clone(&outcome);
    dispatcher.submit(async move {
        let result = reader.read_until(Vec::new(), 1024, Deadline::None).await;
        *outcome2.borrow_mut() = Some(result);
        Ok(())
    });

    assert!(matches!(outcome.borrow().as_ref().unwrap(), Err(RippleError::InvalidArgument(_))));
}

proptest::proptest! {
    // Property 7 (spec.md §8): `write(x)` returns `k <= len(x)`, and the
    // buffer never accepts more than `buffer_size` total across any sequence
    // of writes. The reactor is never turned here, so nothing drains `out`
    // out from under the assertions below.
    #[test]
    fn write_never_exceeds_capacity(chunks in proptest::collection::vec(proptest::collection::vec(0u8..255, 0..200), 0..20)) {
        let dispatcher = Dispatcher::new(&RuntimeConfig::default()).unwrap();
        let (a, _b) = mio::net::UnixStream::pair().unwrap();
        let sizing = RuntimeConfig::default().effective_buffer_sizing();
        let writer = Stream::new(dispatcher, a, sizing).unwrap();

        let mut accepted_total = 0usize;
        for chunk in &chunks {
            let k = writer.write(chunk);
            proptest::prop_assert!(k <= chunk.len());
            accepted_total += k;
            proptest::prop_assert!(accepted_total <= writer.buffer_size());
        }
    }
}
