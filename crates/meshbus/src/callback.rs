// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Callback seams.
//!
//! Each seam is a trait with a blanket impl for closures, so any
//! `Fn(..) + Send + Sync` works directly. [`WithContext`] pairs a plain
//! function with a context value, and [`RawReceiveCallback`] carries an
//! `extern "C"` function plus an opaque pointer for bindings.

use crate::entity::{DataTypeInformation, TopicId};
use crate::service::{ServiceMethodInformation, ServiceResponse};
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};

/// One delivered sample, borrowed for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveData<'a> {
    pub buffer: &'a [u8],
    /// Publisher send time, microseconds since the Unix epoch
    pub send_timestamp: i64,
    pub send_clock: u64,
}

/// Called for every sample a subscriber accepts.
pub trait ReceiveCallback: Send + Sync + 'static {
    fn on_receive(
        &self,
        publisher: &TopicId,
        data_type: &DataTypeInformation,
        data: &ReceiveData<'_>,
    );
}

impl<F> ReceiveCallback for F
where
    F: Fn(&TopicId, &DataTypeInformation, &ReceiveData<'_>) + Send + Sync + 'static,
{
    fn on_receive(
        &self,
        publisher: &TopicId,
        data_type: &DataTypeInformation,
        data: &ReceiveData<'_>,
    ) {
        self(publisher, data_type, data)
    }
}

/// Called for publisher, subscriber, server and client events.
pub trait EventCallback<E>: Send + Sync + 'static {
    fn on_event(&self, event: &E);
}

impl<E, F> EventCallback<E> for F
where
    F: Fn(&E) + Send + Sync + 'static,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

/// Server-side method implementation: returns `(ret_state, response)`.
pub trait MethodCallback: Send + Sync + 'static {
    fn call(&self, method: &ServiceMethodInformation, request: &[u8]) -> (i32, Vec<u8>);
}

impl<F> MethodCallback for F
where
    F: Fn(&ServiceMethodInformation, &[u8]) -> (i32, Vec<u8>) + Send + Sync + 'static,
{
    fn call(&self, method: &ServiceMethodInformation, request: &[u8]) -> (i32, Vec<u8>) {
        self(method, request)
    }
}

/// Client-side response handler.
pub trait ResponseCallback: Send + Sync + 'static {
    fn on_response(&self, response: &ServiceResponse);
}

impl<F> ResponseCallback for F
where
    F: Fn(&ServiceResponse) + Send + Sync + 'static,
{
    fn on_response(&self, response: &ServiceResponse) {
        self(response)
    }
}

/// A function taking an explicit context as first argument.
///
/// ```
/// use meshbus::callback::{EventCallback, WithContext};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// fn count(ctx: &AtomicUsize, _event: &u32) {
///     ctx.fetch_add(1, Ordering::Relaxed);
/// }
///
/// let cb = WithContext::new(AtomicUsize::new(0), count);
/// cb.on_event(&7);
/// assert_eq!(cb.context().load(Ordering::Relaxed), 1);
/// ```
pub struct WithContext<C, F> {
    ctx: C,
    f: F,
}

impl<C, F> WithContext<C, F> {
    pub fn new(ctx: C, f: F) -> Self {
        Self { ctx, f }
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }
}

impl<C, F> ReceiveCallback for WithContext<C, F>
where
    C: Send + Sync + 'static,
    F: Fn(&C, &TopicId, &DataTypeInformation, &ReceiveData<'_>) + Send + Sync + 'static,
{
    fn on_receive(
        &self,
        publisher: &TopicId,
        data_type: &DataTypeInformation,
        data: &ReceiveData<'_>,
    ) {
        (self.f)(&self.ctx, publisher, data_type, data)
    }
}

impl<E, C, F> EventCallback<E> for WithContext<C, F>
where
    C: Send + Sync + 'static,
    F: Fn(&C, &E) + Send + Sync + 'static,
{
    fn on_event(&self, event: &E) {
        (self.f)(&self.ctx, event)
    }
}

impl<C, F> MethodCallback for WithContext<C, F>
where
    C: Send + Sync + 'static,
    F: Fn(&C, &ServiceMethodInformation, &[u8]) -> (i32, Vec<u8>) + Send + Sync + 'static,
{
    fn call(&self, method: &ServiceMethodInformation, request: &[u8]) -> (i32, Vec<u8>) {
        (self.f)(&self.ctx, method, request)
    }
}

impl<C, F> ResponseCallback for WithContext<C, F>
where
    C: Send + Sync + 'static,
    F: Fn(&C, &ServiceResponse) + Send + Sync + 'static,
{
    fn on_response(&self, response: &ServiceResponse) {
        (self.f)(&self.ctx, response)
    }
}

/// C-compatible receive function:
/// `(ctx, topic_name, topic_name_len, payload, payload_len, send_timestamp, send_clock)`.
pub type RawReceiveFn =
    extern "C" fn(*mut c_void, *const u8, usize, *const u8, usize, i64, u64);

/// Receive callback made of a C function pointer and an opaque context.
pub struct RawReceiveCallback {
    f: RawReceiveFn,
    ctx: *mut c_void,
}

// SAFETY: `RawReceiveCallback::new` requires the context to be usable from
// any thread for as long as the callback is installed.
unsafe impl Send for RawReceiveCallback {}
unsafe impl Sync for RawReceiveCallback {}

impl RawReceiveCallback {
    /// # Safety
    ///
    /// `ctx` must stay valid, and safe to use concurrently from the
    /// delivery threads, until the callback is removed from the subscriber.
    pub unsafe fn new(f: RawReceiveFn, ctx: *mut c_void) -> Self {
        Self { f, ctx }
    }
}

impl ReceiveCallback for RawReceiveCallback {
    fn on_receive(
        &self,
        publisher: &TopicId,
        _data_type: &DataTypeInformation,
        data: &ReceiveData<'_>,
    ) {
        let name = publisher.topic_name.as_bytes();
        (self.f)(
            self.ctx,
            name.as_ptr(),
            name.len(),
            data.buffer.as_ptr(),
            data.buffer.len(),
            data.send_timestamp,
            data.send_clock,
        );
    }
}

/// Run a user callback, containing any panic.
pub(crate) fn guarded<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::error!("[{}] user callback panicked: {}", what, msg);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn topic() -> TopicId {
        TopicId::new(EntityId::new(1, 1, "h"), "cb_topic")
    }

    #[test]
    fn test_closure_and_context_forms() {
        let hits = std::sync::Arc::new(AtomicUsize::new(0));
        let hits_clone = std::sync::Arc::clone(&hits);
        let closure = move |_: &TopicId, _: &DataTypeInformation, d: &ReceiveData<'_>| {
            hits_clone.fetch_add(d.buffer.len(), Ordering::SeqCst);
        };
        let data = ReceiveData {
            buffer: b"abc",
            send_timestamp: 0,
            send_clock: 1,
        };
        closure.on_receive(&topic(), &DataTypeInformation::default(), &data);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        fn last_clock(
            ctx: &AtomicU64,
            _: &TopicId,
            _: &DataTypeInformation,
            d: &ReceiveData<'_>,
        ) {
            ctx.store(d.send_clock, Ordering::SeqCst);
        }
        let with_ctx = WithContext::new(AtomicU64::new(0), last_clock);
        with_ctx.on_receive(&topic(), &DataTypeInformation::default(), &data);
        assert_eq!(with_ctx.context().load(Ordering::SeqCst), 1);
    }

    extern "C" fn raw_sum(
        ctx: *mut c_void,
        _name: *const u8,
        name_len: usize,
        _payload: *const u8,
        payload_len: usize,
        _ts: i64,
        clock: u64,
    ) {
        // SAFETY: the test passes a pointer to a live AtomicU64
        let total = unsafe { &*(ctx as *const AtomicU64) };
        total.fetch_add(name_len as u64 + payload_len as u64 + clock, Ordering::SeqCst);
    }

    #[test]
    fn test_raw_callback_receives_lengths() {
        let total = AtomicU64::new(0);
        // SAFETY: `total` outlives the callback
        let cb = unsafe {
            RawReceiveCallback::new(raw_sum, &total as *const AtomicU64 as *mut c_void)
        };
        cb.on_receive(
            &topic(),
            &DataTypeInformation::default(),
            &ReceiveData {
                buffer: b"12345",
                send_timestamp: 0,
                send_clock: 2,
            },
        );
        assert_eq!(total.load(Ordering::SeqCst), 8 + 5 + 2);
    }

    #[test]
    fn test_guarded_contains_panic() {
        assert_eq!(guarded("TEST", || 5), Some(5));
        assert_eq!(guarded("TEST", || -> i32 { panic!("boom") }), None);
    }
}
