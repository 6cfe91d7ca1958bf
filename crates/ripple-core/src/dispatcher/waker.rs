//! Hand-rolled single-threaded `Waker`.
//!
//! `std::task::Wake` requires `Arc<dyn Wake>` to be `Send + Sync`, which an
//! `Rc`-based single-threaded scheduler cannot provide. This builds a
//! `RawWaker` directly over an `Rc` instead — the same trick local
//! executors (e.g. `async-task`'s local flavor) use; it is sound precisely
//! because the dispatcher, the waker and every task it wakes stay on one
//! thread for their entire lifetime.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::{RawWaker, RawWakerVTable, Waker};

use super::task::TaskId;

struct WakerData {
    ready_queue: Rc<RefCell<VecDeque<TaskId>>>,
    id: TaskId,
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_fn);

unsafe fn clone(ptr: *const ()) -> RawWaker {
    let data = Rc::from_raw(ptr as *const WakerData);
    let cloned = Rc::clone(&data);
    std::mem::forget(data);
    RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake(ptr: *const ()) {
    let data = Rc::from_raw(ptr as *const WakerData);
    data.ready_queue.borrow_mut().push_back(data.id);
}

unsafe fn wake_by_ref(ptr: *const ()) {
    let data = Rc::from_raw(ptr as *const WakerData);
    data.ready_queue.borrow_mut().push_back(data.id);
    std::mem::forget(data);
}

unsafe fn drop_fn(ptr: *const ()) {
    drop(Rc::from_raw(ptr as *const WakerData));
}

pub(crate) fn make_waker(ready_queue: Rc<RefCell<VecDeque<TaskId>>>, id: TaskId) -> Waker {
    let data = Rc::new(WakerData { ready_queue, id });
    let raw = RawWaker::new(Rc::into_raw(data) as *const (), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}
