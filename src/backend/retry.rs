use super::{PostError, Poster, ResponseData};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

const RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
const RETRY_MULTIPLIER: u32 = 2;

/// Buffers and retries failed writes against one backend. If the buffer is
/// full new writes are dropped. Only one request is ever in flight against
/// the wrapped poster: the next batch is not attempted until the previous
/// one succeeded or was flushed away.
pub struct RetryBuffer {
    buffering: AtomicI32,
    flushing: AtomicI32,

    initial_interval: Duration,
    multiplier: u32,
    max_interval: Duration,

    list: BufferList,

    poster: Arc<dyn Poster>,
}

impl RetryBuffer {
    pub fn new(
        max_size: usize,
        max_batch: usize,
        max_interval: Duration,
        poster: Arc<dyn Poster>,
    ) -> Arc<RetryBuffer> {
        Self::with_intervals(
            max_size,
            max_batch,
            max_interval,
            RETRY_INITIAL_INTERVAL,
            poster,
        )
    }

    fn with_intervals(
        max_size: usize,
        max_batch: usize,
        max_interval: Duration,
        initial_interval: Duration,
        poster: Arc<dyn Poster>,
    ) -> Arc<RetryBuffer> {
        let buffer = Arc::new(RetryBuffer {
            buffering: AtomicI32::new(0),
            flushing: AtomicI32::new(0),
            initial_interval,
            multiplier: RETRY_MULTIPLIER,
            max_interval,
            list: BufferList::new(max_size, max_batch),
            poster,
        });

        tokio::spawn(Arc::clone(&buffer).run());

        buffer
    }

    /// Drops every buffered batch without attempting delivery. The escape
    /// hatch for a payload the backend keeps rejecting with 5xx.
    pub fn flush(&self) {
        self.flushing.store(1, Ordering::Release);
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::Acquire) == 1
    }

    async fn run(self: Arc<Self>) {
        loop {
            let batch = self.list.pop().await;

            let mut scratch = BytesMut::with_capacity(batch.size);
            for chunk in &batch.bufs {
                scratch.extend_from_slice(chunk);
            }
            let payload = scratch.freeze();

            let mut interval = self.initial_interval;
            loop {
                if self.flushing.load(Ordering::Acquire) == 1 {
                    self.buffering.store(0, Ordering::Release);
                    batch.latch.release(None);

                    if self.list.size() == 0 {
                        self.flushing.store(0, Ordering::Release);
                    }

                    break;
                }

                match self
                    .poster
                    .post(
                        payload.clone(),
                        &batch.query,
                        batch.auth.as_deref(),
                        &batch.endpoint,
                    )
                    .await
                {
                    Ok(response) if !response.status.is_server_error() => {
                        self.buffering.store(0, Ordering::Release);
                        batch.latch.release(Some(response));
                        break;
                    }
                    Ok(_) | Err(_) => {}
                }

                if interval != self.max_interval {
                    interval = std::cmp::min(interval * self.multiplier, self.max_interval);
                }
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[async_trait]
impl Poster for RetryBuffer {
    async fn post(
        &self,
        payload: Bytes,
        query: &str,
        auth: Option<&str>,
        endpoint: &str,
    ) -> Result<ResponseData, PostError> {
        if self.buffering.load(Ordering::Acquire) == 0 {
            let result = self.poster.post(payload.clone(), query, auth, endpoint).await;
            // A 5xx caused by the point data itself will keep the buffer
            // spinning until an operator flushes it.
            if let Ok(response) = result {
                if !response.status.is_server_error() {
                    return Ok(response);
                }
            }

            self.buffering.store(1, Ordering::Release);
        }

        // Already buffering, or the request just failed. Enqueue without
        // waiting for delivery: the 202 releases the client connection and
        // invites it to keep sending.
        self.list.add(payload, query, auth, endpoint)?;

        Ok(ResponseData::accepted())
    }

    fn stats(&self) -> HashMap<String, String> {
        let mut stats = self.list.stats();
        stats.insert(
            "buffering".to_string(),
            self.buffering.load(Ordering::Acquire).to_string(),
        );
        stats
    }
}

/// Completion latch of a batch: released by the retry worker once the batch
/// was delivered or flushed, carrying the backend response when there is one.
pub struct BatchLatch {
    state: Mutex<LatchState>,
    notify: Notify,
}

#[derive(Default)]
struct LatchState {
    released: bool,
    response: Option<ResponseData>,
}

impl BatchLatch {
    fn new() -> Arc<BatchLatch> {
        Arc::new(BatchLatch {
            state: Mutex::new(LatchState::default()),
            notify: Notify::new(),
        })
    }

    fn release(&self, response: Option<ResponseData>) {
        let mut state = self.state.lock().expect("batch latch lock poisoned");
        state.released = true;
        state.response = response;
        drop(state);
        self.notify.notify_one();
    }

    pub async fn wait(&self) -> Option<ResponseData> {
        loop {
            {
                let state = self.state.lock().expect("batch latch lock poisoned");
                if state.released {
                    return state.response.clone();
                }
            }
            self.notify.notified().await;
        }
    }
}

/// A coalescing unit on the buffer list. Two payloads share a batch only
/// when their query string and authorization header agree.
pub(crate) struct Batch {
    pub query: String,
    pub auth: Option<String>,
    pub endpoint: String,
    pub bufs: Vec<Bytes>,
    pub size: usize,
    pub full: bool,
    pub latch: Arc<BatchLatch>,
}

impl Batch {
    fn new(payload: Bytes, query: &str, auth: Option<&str>, endpoint: &str) -> Batch {
        let size = payload.len();
        Batch {
            query: query.to_string(),
            auth: auth.map(String::from),
            endpoint: endpoint.to_string(),
            bufs: vec![payload],
            size,
            full: false,
            latch: BatchLatch::new(),
        }
    }
}

/// FIFO list of batches with a bounded total byte size. One producer side
/// (`add`, from request handlers) and a single consumer (`pop`, from the
/// retry worker) coordinate through a notify handle.
pub(crate) struct BufferList {
    max_size: usize,
    max_batch: usize,
    inner: Mutex<ListInner>,
    notify: Notify,
}

struct ListInner {
    batches: VecDeque<Batch>,
    size: usize,
}

impl BufferList {
    pub(crate) fn new(max_size: usize, max_batch: usize) -> BufferList {
        BufferList {
            max_size,
            max_batch,
            inner: Mutex::new(ListInner {
                batches: VecDeque::new(),
                size: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ListInner> {
        self.inner.lock().expect("buffer list lock poisoned")
    }

    pub(crate) fn size(&self) -> usize {
        self.lock().size
    }

    pub(crate) fn stats(&self) -> HashMap<String, String> {
        let mut stats = HashMap::new();
        stats.insert("size".to_string(), self.size().to_string());
        stats.insert("maxSize".to_string(), self.max_size.to_string());
        stats
    }

    /// Appends a payload, coalescing it into an existing batch with the same
    /// query string and credentials when possible. Fails when the payload
    /// does not fit in the remaining buffer capacity.
    pub(crate) fn add(
        &self,
        payload: Bytes,
        query: &str,
        auth: Option<&str>,
        endpoint: &str,
    ) -> Result<Arc<BatchLatch>, PostError> {
        let mut inner = self.lock();

        if inner.size + payload.len() > self.max_size {
            return Err(PostError::BufferFull);
        }
        inner.size += payload.len();

        // Skip batches that do not match the query string or the auth
        // credentials (auth must be checked to keep multi-user traffic
        // apart), and batches already marked full.
        let mut found = None;
        for (i, batch) in inner.batches.iter_mut().enumerate() {
            if batch.query != query || batch.auth.as_deref() != auth || batch.full {
                continue;
            }

            if batch.size + payload.len() > self.max_batch {
                // prevent future writes from preceding this write
                batch.full = true;
                continue;
            }

            found = Some(i);
            break;
        }

        let latch = match found {
            Some(i) => {
                let batch = &mut inner.batches[i];
                batch.size += payload.len();
                batch.bufs.push(payload);
                Arc::clone(&batch.latch)
            }
            None => {
                let batch = Batch::new(payload, query, auth, endpoint);
                let latch = Arc::clone(&batch.latch);
                inner.batches.push_back(batch);
                latch
            }
        };

        drop(inner);
        self.notify.notify_one();

        Ok(latch)
    }

    /// Removes and returns the head batch, waiting for one to appear.
    pub(crate) async fn pop(&self) -> Batch {
        loop {
            {
                let mut inner = self.lock();
                if let Some(batch) = inner.batches.pop_front() {
                    inner.size -= batch.size;
                    return batch;
                }
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::AtomicU16;
    use tokio::time::timeout;

    fn payload(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    /// Poster returning scripted status codes, then a settable default.
    /// Records every request with its outcome and the maximum observed
    /// concurrency.
    struct ScriptedPoster {
        scripted: Mutex<VecDeque<u16>>,
        default_status: AtomicU16,
        calls: Mutex<Vec<(Bytes, u16)>>,
        in_flight: AtomicI32,
        max_in_flight: AtomicI32,
    }

    impl ScriptedPoster {
        fn new(scripted: &[u16], default_status: u16) -> Arc<ScriptedPoster> {
            Arc::new(ScriptedPoster {
                scripted: Mutex::new(scripted.iter().copied().collect()),
                default_status: AtomicU16::new(default_status),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicI32::new(0),
                max_in_flight: AtomicI32::new(0),
            })
        }

        fn calls(&self) -> Vec<Bytes> {
            self.calls.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
        }

        fn successes(&self) -> Vec<Bytes> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, status)| *status / 100 != 5)
                .map(|(p, _)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Poster for ScriptedPoster {
        async fn post(
            &self,
            payload: Bytes,
            _query: &str,
            _auth: Option<&str>,
            _endpoint: &str,
        ) -> Result<ResponseData, PostError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;

            let status = self
                .scripted
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.default_status.load(Ordering::SeqCst));

            self.calls.lock().unwrap().push((payload, status));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            Ok(ResponseData {
                status: StatusCode::from_u16(status).unwrap(),
                content_type: None,
                content_encoding: None,
                body: Bytes::new(),
            })
        }

        fn stats(&self) -> HashMap<String, String> {
            HashMap::new()
        }
    }

    fn retry_buffer(poster: Arc<ScriptedPoster>) -> Arc<RetryBuffer> {
        RetryBuffer::with_intervals(
            MB_TEST,
            512 * 1024,
            Duration::from_millis(20),
            Duration::from_millis(5),
            poster,
        )
    }

    const MB_TEST: usize = 1024 * 1024;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let poster = ScriptedPoster::new(&[], 204);
        let buffer = retry_buffer(poster.clone());

        let response = buffer
            .post(payload("cpu value=1i 1\n"), "db=x", None, "/write")
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert!(!buffer.is_buffering());
        assert_eq!(poster.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_final() {
        let poster = ScriptedPoster::new(&[400], 204);
        let buffer = retry_buffer(poster.clone());

        let response = buffer
            .post(payload("cpu value=1i 1\n"), "db=x", None, "/write")
            .await
            .unwrap();

        // 4xx is a client-side outcome, never buffered.
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert!(!buffer.is_buffering());
        assert_eq!(buffer.stats().get("size").map(String::as_str), Some("0"));
        assert_eq!(poster.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_server_error_buffers_then_retries() {
        let poster = ScriptedPoster::new(&[500, 500], 204);
        let buffer = retry_buffer(poster.clone());

        let response = buffer
            .post(payload("cpu value=1i 1\n"), "db=x", None, "/write")
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::ACCEPTED);
        assert!(buffer.is_buffering());

        wait_until(|| !buffer.is_buffering()).await;

        // Inline failure, one worker failure, one worker success, all with
        // the same payload.
        let calls = poster.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c == &payload("cpu value=1i 1\n")));
        assert_eq!(buffer.stats().get("size").map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn test_delivery_preserves_arrival_order() {
        // Enough scripted failures that the buffer stays in the buffering
        // state while the later chunks arrive.
        let poster = ScriptedPoster::new(&[500, 500, 500, 500], 204);
        let buffer = retry_buffer(poster.clone());

        for chunk in ["a", "b", "c"] {
            let response = buffer
                .post(payload(chunk), "db=x", None, "/write")
                .await
                .unwrap();
            assert_eq!(response.status, StatusCode::ACCEPTED);
        }

        // However the chunks were batched and however often the head batch
        // was retried, the delivered byte stream is the arrival order.
        wait_until(|| poster.successes().concat() == b"abc").await;
        assert!(!buffer.is_buffering());
        assert_eq!(buffer.stats().get("size").map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn test_at_most_one_in_flight_while_buffering() {
        let poster = ScriptedPoster::new(&[500, 500, 500, 500], 204);
        let buffer = retry_buffer(poster.clone());

        for chunk in ["a", "b", "c", "d"] {
            let _ = buffer.post(payload(chunk), "db=x", None, "/write").await;
        }

        wait_until(|| !buffer.is_buffering()).await;

        assert_eq!(poster.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flush_drains_without_delivery() {
        let poster = ScriptedPoster::new(&[], 500);
        let buffer = retry_buffer(poster.clone());

        let response = buffer
            .post(payload("cpu value=1i 1\n"), "db=x", None, "/write")
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::ACCEPTED);
        assert!(buffer.is_buffering());

        buffer.flush();

        wait_until(|| {
            let stats = buffer.stats();
            stats.get("buffering").map(String::as_str) == Some("0")
                && stats.get("size").map(String::as_str) == Some("0")
                && buffer.flushing.load(Ordering::Acquire) == 0
        })
        .await;

        // Healthy again: a successful post bypasses the buffer entirely.
        poster.default_status.store(204, Ordering::SeqCst);
        let calls_before = poster.calls().len();
        let response = buffer
            .post(payload("mem value=2i 2\n"), "db=x", None, "/write")
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(poster.calls().len(), calls_before + 1);
    }

    #[tokio::test]
    async fn test_latch_carries_worker_response() {
        let poster = ScriptedPoster::new(&[500], 204);
        let buffer = retry_buffer(poster.clone());

        let _ = buffer
            .post(payload("cpu value=1i 1\n"), "db=x", None, "/write")
            .await
            .unwrap();

        // Reach under the hood: the batch latch resolves with the backend
        // response once the worker delivered it.
        let latch = buffer
            .list
            .add(payload("mem value=1i 1\n"), "db=x", None, "/write")
            .unwrap();
        let response = timeout(Duration::from_secs(5), latch.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
    }

    mod buffer_list {
        use super::*;

        #[tokio::test]
        async fn test_rejects_when_full_and_size_unchanged() {
            let list = BufferList::new(10, 10);
            list.add(payload("123456"), "db=x", None, "/write").unwrap();
            assert_eq!(list.size(), 6);

            let err = list
                .add(payload("12345"), "db=x", None, "/write")
                .unwrap_err();
            assert!(matches!(err, PostError::BufferFull));
            assert_eq!(list.size(), 6);

            // An exactly fitting payload is still admitted.
            list.add(payload("1234"), "db=x", None, "/write").unwrap();
            assert_eq!(list.size(), 10);
        }

        #[tokio::test]
        async fn test_coalesces_by_query_and_auth() {
            let list = BufferList::new(1024, 1024);
            list.add(payload("a"), "db=x", None, "/write").unwrap();
            list.add(payload("b"), "db=x", None, "/write").unwrap();
            list.add(payload("c"), "db=y", None, "/write").unwrap();
            list.add(payload("d"), "db=x", Some("Basic abc"), "/write")
                .unwrap();

            let first = list.pop().await;
            assert_eq!(first.bufs, vec![payload("a"), payload("b")]);
            assert_eq!(first.size, 2);

            let second = list.pop().await;
            assert_eq!(second.bufs, vec![payload("c")]);

            let third = list.pop().await;
            assert_eq!(third.bufs, vec![payload("d")]);
            assert_eq!(third.auth.as_deref(), Some("Basic abc"));

            assert_eq!(list.size(), 0);
        }

        #[tokio::test]
        async fn test_full_batch_keeps_fifo_order() {
            let list = BufferList::new(1024, 10);
            list.add(payload("123456"), "db=x", None, "/write").unwrap();
            // Would overflow the head batch: the head is sealed so this
            // write cannot be overtaken by later ones.
            list.add(payload("789012"), "db=x", None, "/write").unwrap();
            // Fits in the second batch, never in the sealed head.
            list.add(payload("abc"), "db=x", None, "/write").unwrap();

            let first = list.pop().await;
            assert!(first.full);
            assert_eq!(first.bufs, vec![payload("123456")]);

            let second = list.pop().await;
            assert_eq!(second.bufs, vec![payload("789012"), payload("abc")]);
        }

        #[tokio::test]
        async fn test_oversize_singleton_batch() {
            let list = BufferList::new(1024, 5);
            // Larger than max_batch but within the buffer: admitted alone.
            list.add(payload("12345678"), "db=x", None, "/write")
                .unwrap();
            list.add(payload("x"), "db=x", None, "/write").unwrap();

            let first = list.pop().await;
            assert_eq!(first.size, 8);
            assert_eq!(first.bufs.len(), 1);

            let second = list.pop().await;
            assert_eq!(second.bufs, vec![payload("x")]);
        }

        #[tokio::test]
        async fn test_pop_blocks_until_add() {
            let list = Arc::new(BufferList::new(1024, 1024));

            let consumer = {
                let list = Arc::clone(&list);
                tokio::spawn(async move { list.pop().await.bufs })
            };

            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!consumer.is_finished());

            list.add(payload("late"), "db=x", None, "/write").unwrap();
            let bufs = timeout(Duration::from_secs(5), consumer)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(bufs, vec![payload("late")]);
        }

        #[tokio::test]
        async fn test_size_is_sum_of_batches() {
            let list = BufferList::new(1024, 4);
            list.add(payload("aa"), "db=x", None, "/write").unwrap();
            list.add(payload("bb"), "db=x", None, "/write").unwrap();
            list.add(payload("cc"), "db=x", None, "/write").unwrap();
            list.add(payload("dd"), "db=y", None, "/write").unwrap();

            let mut total = 0;
            let expected = list.size();
            while list.size() > 0 {
                total += list.pop().await.size;
            }
            assert_eq!(total, expected);
        }
    }
}
