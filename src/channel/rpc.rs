use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};
use tracing::{debug, trace};

use crate::channel::channel_error::ChannelError;
use crate::codec::ChannelMessage;


type RpcResult<M> = Result<M, ChannelError>;

pub struct PendingRpcCall<M> {
    pub unique_id: u64,
    /// name of the type the response is converted to, for error messages
    pub expected: &'static str,
    pub deadline: Instant,
    completion: oneshot::Sender<RpcResult<M>>,
}

impl<M> PendingRpcCall<M> {
    fn complete(self, result: RpcResult<M>) {
        // the caller may have stopped waiting, there is nobody to notify in that case
        let _ = self.completion.send(result);
    }
}


/// Correlates requests and responses by unique id. Ids are allocated from an atomic counter, so
///  concurrent calls never share an id, and 0 is never used because it marks packets that are
///  not part of a call.
pub struct RpcCorrelator<M> {
    next_unique_id: AtomicU64,
    pending: Mutex<FxHashMap<u64, PendingRpcCall<M>>>,
    timeout: Duration,
}

impl<M: ChannelMessage> RpcCorrelator<M> {
    pub fn new(timeout: Duration) -> RpcCorrelator<M> {
        RpcCorrelator {
            next_unique_id: AtomicU64::new(1),
            pending: Default::default(),
            timeout,
        }
    }

    fn next_unique_id(&self) -> u64 {
        loop {
            let result = self.next_unique_id.fetch_add(1, Ordering::Relaxed);
            if result != 0 {
                return result;
            }
        }
    }

    /// Registers a pending call with a fresh unique id. The returned future completes when the
    ///  call is resolved, fails, or times out.
    pub fn begin<R: TryFrom<M>>(self: &Arc<Self>) -> RpcCall<M, R> {
        let unique_id = self.next_unique_id();
        let expected = std::any::type_name::<R>();
        let deadline = Instant::now() + self.timeout;
        let (completion, receiver) = oneshot::channel();

        self.pending.lock().insert(unique_id, PendingRpcCall {
            unique_id,
            expected,
            deadline,
            completion,
        });
        trace!("registered pending RPC call {}", unique_id);

        RpcCall {
            unique_id,
            expected,
            deadline,
            sleep: None,
            receiver,
            correlator: self.clone(),
            done: false,
            _result: Default::default(),
        }
    }

    /// Hands a response to the matching pending call. If there is none, the response is returned
    ///  to the caller.
    pub fn resolve(&self, unique_id: u64, message: M) -> Result<(), M> {
        let Some(pending) = self.pending.lock().remove(&unique_id) else {
            return Err(message);
        };

        let error_code = message.error_code();
        if error_code == 0 {
            pending.complete(Ok(message));
        }
        else {
            debug!("RPC call {} failed with server error code {}", unique_id, error_code);
            pending.complete(Err(ChannelError::RpcServerError { unique_id, error_code }));
        }
        Ok(())
    }

    pub fn fail(&self, unique_id: u64, error: ChannelError) -> bool {
        let pending = self.pending.lock().remove(&unique_id);
        match pending {
            Some(pending) => {
                pending.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// removes a pending call without notifying its caller
    pub fn remove(&self, unique_id: u64) -> bool {
        self.pending.lock().remove(&unique_id).is_some()
    }

    pub fn fail_all(&self, error: ChannelError) -> usize {
        let drained = std::mem::take(&mut *self.pending.lock());
        let result = drained.len();
        for pending in drained.into_values() {
            pending.complete(Err(error.clone()));
        }
        result
    }

    /// Fails all calls with a deadline at or before `now` with a timeout, returning their number
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let expired = {
            let mut pending = self.pending.lock();
            let overdue_ids = pending.values()
                .filter(|p| p.deadline <= now)
                .map(|p| p.unique_id)
                .collect::<Vec<_>>();
            overdue_ids.into_iter()
                .flat_map(|id| pending.remove(&id))
                .collect::<Vec<_>>()
        };

        let result = expired.len();
        for pending in expired {
            debug!("RPC call {} timed out", pending.unique_id);
            let unique_id = pending.unique_id;
            pending.complete(Err(ChannelError::RpcTimeout { unique_id }));
        }
        result
    }

    pub fn is_pending(&self, unique_id: u64) -> bool {
        self.pending.lock().contains_key(&unique_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}


/// The caller's side of a pending call, resolving to the response converted to `R`.
///
/// Dropping an unfinished call removes its pending entry, so a late response is treated like any
///  other response without a matching call.
pub struct RpcCall<M: ChannelMessage, R> {
    unique_id: u64,
    expected: &'static str,
    deadline: Instant,
    /// created on first poll, so that creating a call does not require a timer
    sleep: Option<Pin<Box<Sleep>>>,
    receiver: oneshot::Receiver<RpcResult<M>>,
    correlator: Arc<RpcCorrelator<M>>,
    done: bool,
    _result: PhantomData<fn() -> R>,
}

impl<M: ChannelMessage, R: TryFrom<M>> RpcCall<M, R> {
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    /// Stops waiting for the response. Returns `false` if the call had already completed.
    pub fn cancel(mut self) -> bool {
        self.done = true;
        let result = self.correlator.remove(self.unique_id);
        if result {
            debug!("RPC call {} cancelled", self.unique_id);
        }
        result
    }

    fn convert(&self, result: Result<RpcResult<M>, oneshot::error::RecvError>) -> Result<R, ChannelError> {
        match result {
            Ok(Ok(message)) => {
                let message_id = message.message_id();
                R::try_from(message)
                    .map_err(|_| ChannelError::UnexpectedResponse {
                        unique_id: self.unique_id,
                        message_id,
                        expected: self.expected,
                    })
            }
            Ok(Err(e)) => Err(e),
            // the correlator was dropped together with its channel
            Err(_) => Err(ChannelError::ChannelClosed),
        }
    }
}

impl<M: ChannelMessage, R: TryFrom<M>> Future for RpcCall<M, R> {
    type Output = Result<R, ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(Err(ChannelError::ChannelClosed));
        }

        if let Poll::Ready(result) = Pin::new(&mut self.receiver).poll(cx) {
            self.done = true;
            return Poll::Ready(self.convert(result));
        }

        let deadline = self.deadline;
        let sleep = self.sleep.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        if sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }

        self.done = true;
        if self.correlator.remove(self.unique_id) {
            debug!("RPC call {} timed out", self.unique_id);
            return Poll::Ready(Err(ChannelError::RpcTimeout { unique_id: self.unique_id }));
        }

        // completed concurrently with the deadline
        let result = match self.receiver.try_recv() {
            Ok(result) => Ok(result),
            Err(oneshot::error::TryRecvError::Empty) => Ok(Err(ChannelError::RpcTimeout { unique_id: self.unique_id })),
            Err(oneshot::error::TryRecvError::Closed) => Ok(Err(ChannelError::ChannelClosed)),
        };
        Poll::Ready(result.and_then(|r| self.convert(Ok(r))))
    }
}

impl<M: ChannelMessage, R> Drop for RpcCall<M, R> {
    fn drop(&mut self) {
        if !self.done && self.correlator.remove(self.unique_id) {
            debug!("RPC call {} dropped before completion: removed pending entry", self.unique_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::message::TestMessage;
    use rstest::rstest;
    use rustc_hash::FxHashSet;

    /// a response type that only accepts message id 2
    #[derive(Debug, PartialEq)]
    struct Pong(Vec<u8>);

    impl TryFrom<TestMessage> for Pong {
        type Error = TestMessage;

        fn try_from(value: TestMessage) -> Result<Self, Self::Error> {
            if value.message_id == 2 {
                Ok(Pong(value.payload))
            }
            else {
                Err(value)
            }
        }
    }

    fn correlator() -> Arc<RpcCorrelator<TestMessage>> {
        Arc::new(RpcCorrelator::new(Duration::from_secs(5)))
    }

    #[test]
    fn test_unique_ids() {
        let correlator = correlator();
        let calls = (0..1000)
            .map(|_| correlator.begin::<TestMessage>())
            .collect::<Vec<_>>();

        let ids = calls.iter().map(|c| c.unique_id()).collect::<FxHashSet<_>>();
        assert_eq!(ids.len(), 1000);
        assert!(!ids.contains(&0));
        assert_eq!(correlator.pending_count(), 1000);
    }

    #[test]
    fn test_unique_id_skips_zero() {
        let correlator = correlator();
        correlator.next_unique_id.store(u64::MAX, Ordering::Relaxed);
        assert_eq!(correlator.next_unique_id(), u64::MAX);
        assert_eq!(correlator.next_unique_id(), 1);
    }

    #[rstest]
    #[case::success(TestMessage::new(2, vec![1, 2]), Ok(Pong(vec![1, 2])))]
    #[case::server_error(TestMessage::new(2, vec![]).with_error_code(17), Err(ChannelError::RpcServerError { unique_id: 1, error_code: 17 }))]
    #[case::unexpected_type(TestMessage::new(3, vec![]), Err(ChannelError::UnexpectedResponse { unique_id: 1, message_id: 3, expected: std::any::type_name::<Pong>() }))]
    #[tokio::test]
    async fn test_resolve(#[case] response: TestMessage, #[case] expected: Result<Pong, ChannelError>) {
        let correlator = correlator();
        let call = correlator.begin::<Pong>();
        assert_eq!(call.unique_id(), 1);

        assert!(correlator.resolve(1, response).is_ok());
        assert_eq!(call.await, expected);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_resolve_unknown() {
        let correlator = correlator();
        let _call = correlator.begin::<TestMessage>();

        let response = TestMessage::new(2, vec![9]);
        assert_eq!(correlator.resolve(99, response.clone()), Err(response));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let correlator = correlator();
        let call = correlator.begin::<TestMessage>();
        let unique_id = call.unique_id();

        let started = Instant::now();
        assert_eq!(call.await, Err(ChannelError::RpcTimeout { unique_id }));
        assert_eq!(Instant::now() - started, Duration::from_secs(5));
        assert_eq!(correlator.pending_count(), 0);

        // a late response is not matched
        assert!(correlator.resolve(unique_id, TestMessage::new(2, vec![])).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_overdue() {
        let correlator = correlator();
        let early = correlator.begin::<TestMessage>();
        tokio::time::advance(Duration::from_secs(3)).await;
        let late = correlator.begin::<TestMessage>();

        assert_eq!(correlator.expire_overdue(Instant::now() + Duration::from_secs(2)), 1);
        assert_eq!(correlator.pending_count(), 1);
        assert!(correlator.is_pending(late.unique_id()));

        let unique_id = early.unique_id();
        assert_eq!(early.await, Err(ChannelError::RpcTimeout { unique_id }));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let correlator = correlator();
        let calls = (0..5)
            .map(|_| correlator.begin::<TestMessage>())
            .collect::<Vec<_>>();

        assert_eq!(correlator.fail_all(ChannelError::ChannelClosed), 5);
        assert_eq!(correlator.pending_count(), 0);
        for call in calls {
            assert_eq!(call.await, Err(ChannelError::ChannelClosed));
        }
    }

    #[tokio::test]
    async fn test_fail() {
        let correlator = correlator();
        let call = correlator.begin::<TestMessage>();
        let unique_id = call.unique_id();

        assert!(correlator.fail(unique_id, ChannelError::Cancelled { unique_id }));
        assert!(!correlator.fail(unique_id, ChannelError::Cancelled { unique_id }));
        assert_eq!(call.await, Err(ChannelError::Cancelled { unique_id }));
    }

    #[test]
    fn test_drop_removes_pending() {
        let correlator = correlator();
        let call = correlator.begin::<TestMessage>();
        assert_eq!(correlator.pending_count(), 1);

        drop(call);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_cancel() {
        let correlator = correlator();
        let call = correlator.begin::<TestMessage>();
        let unique_id = call.unique_id();

        assert!(call.cancel());
        assert!(!correlator.is_pending(unique_id));
    }

    #[tokio::test]
    async fn test_dropped_correlator() {
        let correlator = correlator();
        let call = correlator.begin::<TestMessage>();
        let unique_id = call.unique_id();

        // dropping the pending entry (not the call) closes the oneshot channel
        let pending = correlator.pending.lock().remove(&unique_id).unwrap();
        drop(pending);
        assert_eq!(call.await, Err(ChannelError::ChannelClosed));
    }
}
