use core::fmt;
use std::collections::VecDeque;
use std::pin::Pin;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use super::bridge::{convert, HostType};
use super::evaluator::{EvalError, EvalResult};
use super::governor::CancelSignal;
use super::value::Value;

#[derive(Debug, Default)]
struct ChannelState {
    buffer: VecDeque<Value>,
    closed: bool,
    sent: u64,
    received: u64,
    waiting_receivers: usize,
}

/// FIFO channel shared between tasks.
///
/// A zero-capacity channel completes a send only once the value has been
/// received. Every state change wakes all watchers, which then re-check.
pub struct ChannelValue {
    state: Mutex<ChannelState>,
    notify: Notify,
    capacity: usize,
    elem_type: Option<HostType>,
}

impl fmt::Debug for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChannelValue")
            .field("capacity", &self.capacity)
            .field("buffered", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// A registered waiting receiver. Dropping it withdraws the registration.
pub struct ReceiverGuard<'a>(&'a ChannelValue);

impl Drop for ReceiverGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().waiting_receivers -= 1;
    }
}

async fn wait(notified: Pin<Box<Notified<'_>>>, cancel: &CancelSignal) -> EvalResult<()> {
    tokio::select! {
        _ = notified => Ok(()),
        _ = cancel.cancelled() => Err(EvalError::Interrupt),
    }
}

impl ChannelValue {
    pub fn new(capacity: usize, elem_type: Option<HostType>) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            notify: Notify::new(),
            capacity,
            elem_type,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn elem_type(&self) -> Option<&HostType> {
        self.elem_type.as_ref()
    }

    /// Number of buffered values
    /// Buffered values. Values held by senders parked on an unbuffered channel do not count.
    pub fn len(&self) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// A registered wakeup for the next state change. Create it before
    /// checking readiness so no change is missed in between.
    pub fn watch(&self) -> Pin<Box<Notified<'_>>> {
        let mut notified = Box::pin(self.notify.notified());
        notified.as_mut().enable();
        notified
    }

    fn zero(&self) -> Value {
        self.elem_type
            .as_ref()
            .map(HostType::zero_value)
            .unwrap_or_default()
    }

    fn prepare(&self, value: Value) -> EvalResult<Value> {
        match &self.elem_type {
            Some(ty) => convert(value, ty),
            None => Ok(value),
        }
    }

    pub async fn send(&self, value: Value, cancel: &CancelSignal) -> EvalResult<()> {
        let value = self.prepare(value)?;
        let ticket;
        loop {
            let notified = self.watch();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(closed_send());
                }
                if self.capacity == 0 || state.buffer.len() < self.capacity {
                    state.buffer.push_back(value);
                    state.sent += 1;
                    ticket = state.sent;
                    break;
                }
            }
            wait(notified, cancel).await?;
        }
        self.notify.notify_waiters();
        if self.capacity > 0 {
            return Ok(());
        }
        loop {
            let notified = self.watch();
            {
                let state = self.state.lock();
                if state.received >= ticket || state.closed {
                    return Ok(());
                }
            }
            wait(notified, cancel).await?;
        }
    }

    /// Non-blocking send. Unbuffered channels accept only when a receiver is waiting.
    pub fn try_send(&self, value: Value) -> EvalResult<bool> {
        let value = self.prepare(value)?;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(closed_send());
            }
            let ready = if self.capacity == 0 {
                state.waiting_receivers > state.buffer.len()
            } else {
                state.buffer.len() < self.capacity
            };
            if !ready {
                return Ok(false);
            }
            state.buffer.push_back(value);
            state.sent += 1;
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    /// Receive the next value; `(zero, false)` once closed and drained.
    pub async fn recv(&self, cancel: &CancelSignal) -> EvalResult<(Value, bool)> {
        if let Some(received) = self.try_recv() {
            return Ok(received);
        }
        let _guard = self.register_receiver();
        loop {
            let notified = self.watch();
            if let Some(received) = self.try_recv() {
                return Ok(received);
            }
            wait(notified, cancel).await?;
        }
    }

    /// Count the caller as a waiting receiver until the guard drops, so
    /// non-blocking sends on an unbuffered channel see a counterpart.
    pub fn register_receiver(&self) -> ReceiverGuard<'_> {
        self.state.lock().waiting_receivers += 1;
        self.notify.notify_waiters();
        ReceiverGuard(self)
    }

    pub fn try_recv(&self) -> Option<(Value, bool)> {
        let received = {
            let mut state = self.state.lock();
            match state.buffer.pop_front() {
                Some(value) => {
                    state.received += 1;
                    value
                }
                None if state.closed => return Some((self.zero(), false)),
                None => return None,
            }
        };
        self.notify.notify_waiters();
        Some((received, true))
    }

    pub fn close(&self) -> EvalResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EvalError::InvalidOperation(
                    "close of closed channel".to_string(),
                ));
            }
            state.closed = true;
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

fn closed_send() -> EvalError {
    EvalError::InvalidOperation("send on closed channel".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_buffered_fifo_and_close_drains() {
        let chan = ChannelValue::new(3, None);
        let cancel = CancelSignal::new();
        for i in 1..=3 {
            chan.send(Value::Int(i), &cancel).await.unwrap();
        }
        assert!(!chan.try_send(Value::Int(4)).unwrap());
        chan.close().unwrap();
        for i in 1..=3 {
            assert_eq!(chan.recv(&cancel).await.unwrap(), (Value::Int(i), true));
        }
        assert_eq!(chan.recv(&cancel).await.unwrap(), (Value::Nil, false));
        assert!(chan.send(Value::Int(5), &cancel).await.is_err());
        assert!(chan.close().is_err());
    }

    #[tokio::test]
    async fn test_unbuffered_rendezvous() {
        let chan = Arc::new(ChannelValue::new(0, None));
        let cancel = CancelSignal::new();
        let sender = {
            let chan = chan.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { chan.send(Value::string("ping"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!sender.is_finished());
        assert_eq!(
            chan.recv(&cancel).await.unwrap(),
            (Value::string("ping"), true)
        );
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_typed_channel_converts() {
        let chan = ChannelValue::new(1, Some(HostType::int()));
        let cancel = CancelSignal::new();
        chan.send(Value::Float(2.7), &cancel).await.unwrap();
        assert_eq!(chan.try_recv(), Some((Value::Int(2), true)));
        assert!(chan.send(Value::string("x"), &cancel).await.is_err());
        chan.close().unwrap();
        assert_eq!(chan.try_recv(), Some((Value::Int(0), false)));
    }

    #[tokio::test]
    async fn test_blocked_recv_observes_cancel() {
        let chan = ChannelValue::new(0, None);
        let cancel = CancelSignal::with_timeout(Duration::from_millis(20));
        assert!(matches!(
            chan.recv(&cancel).await,
            Err(EvalError::Interrupt)
        ));
        assert_eq!(chan.state.lock().waiting_receivers, 0);
    }

    #[tokio::test]
    async fn test_registered_receiver_enables_try_send() {
        let chan = ChannelValue::new(0, None);
        assert!(!chan.try_send(Value::Int(1)).unwrap());
        {
            let _receiver = chan.register_receiver();
            assert!(chan.try_send(Value::Int(1)).unwrap());
            assert!(!chan.try_send(Value::Int(2)).unwrap());
            assert_eq!(chan.try_recv(), Some((Value::Int(1), true)));
        }
        assert_eq!(chan.state.lock().waiting_receivers, 0);
    }

    #[tokio::test]
    async fn test_unbuffered_len_ignores_parked_senders() {
        let chan = Arc::new(ChannelValue::new(0, None));
        let cancel = CancelSignal::new();
        let sender = {
            let chan = chan.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { chan.send(Value::Int(7), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(chan.state.lock().buffer.len(), 1);
        assert_eq!(chan.len(), 0);
        assert_eq!(chan.recv(&cancel).await.unwrap(), (Value::Int(7), true));
        sender.await.unwrap().unwrap();

        let buffered = ChannelValue::new(2, None);
        buffered.try_send(Value::Int(1)).unwrap();
        assert_eq!(buffered.len(), 1);
    }
}
