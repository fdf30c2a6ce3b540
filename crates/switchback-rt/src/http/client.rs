//! Thread-pooled HTTP client.
//!
//! Transfers run on a pool of at most `max_clients` blocking worker threads,
//! each holding a clone of one shared `ureq::Agent`. Threads are spawned
//! lazily, one whenever a transfer is queued and no thread is idle. Jobs
//! beyond the pool size wait in the queue in submission order.
//!
//! A finished transfer reports through its [`Completion`], which routes the
//! result back to the awaiting worker via the reactor loop.

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::bridge::{AsyncOperation, AwaitError, Bridge, Completion, OperationError};
use crate::config::HttpConfig;

use super::request::{HttpRequest, HttpResponse};

struct Job {
    request: HttpRequest,
    completion: Completion<HttpResponse>,
}

struct ClientInner {
    agent: ureq::Agent,
    timeout: Duration,
    max_clients: usize,
    tx: Sender<Job>,
    rx: Receiver<Job>,
    /// Threads waiting on the queue.
    idle: Arc<AtomicUsize>,
    /// Threads spawned so far.
    spawned: Mutex<usize>,
}

/// Handle to a shared HTTP worker pool. Cloning is cheap.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.timeout())
            .user_agent(&config.user_agent)
            .build();
        let (tx, rx) = crossbeam_channel::unbounded();
        HttpClient {
            inner: Arc::new(ClientInner {
                agent,
                timeout: config.timeout(),
                max_clients: config.max_clients.max(1),
                tx,
                rx,
                idle: Arc::new(AtomicUsize::new(0)),
                spawned: Mutex::new(0),
            }),
        }
    }

    /// Build the operation that performs `request` on this client.
    pub fn transfer(&self, request: impl Into<HttpRequest>) -> Transfer {
        Transfer {
            client: self.clone(),
            request: request.into(),
        }
    }

    /// Worker threads spawned so far.
    pub fn pool_size(&self) -> usize {
        *self.inner.spawned.lock()
    }

    pub fn max_clients(&self) -> usize {
        self.inner.max_clients
    }

    fn enqueue(&self, job: Job) {
        if !self.ensure_worker() {
            job.completion.fail(OperationError::Transport(
                "no HTTP worker thread available".to_string(),
            ));
            return;
        }
        if let Err(err) = self.inner.tx.send(job) {
            err.into_inner()
                .completion
                .fail(OperationError::Transport("HTTP client shut down".to_string()));
        }
    }

    /// Make sure some thread will pick up the next job. Returns false only
    /// when the pool is empty and no thread could be started.
    fn ensure_worker(&self) -> bool {
        let inner = &self.inner;
        let mut spawned = inner.spawned.lock();
        if inner.idle.load(Ordering::Acquire) > 0 || *spawned >= inner.max_clients {
            return *spawned > 0;
        }

        let index = *spawned;
        let rx = inner.rx.clone();
        let agent = inner.agent.clone();
        let idle = Arc::clone(&inner.idle);
        let timeout = inner.timeout;
        let spawn = thread::Builder::new()
            .name(format!("switchback-http-{index}"))
            .spawn(move || worker_loop(rx, agent, idle, timeout));

        match spawn {
            Ok(_) => {
                *spawned += 1;
                tracing::debug!(worker = index, "spawned HTTP worker thread");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to spawn HTTP worker thread");
                *spawned > 0
            }
        }
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("max_clients", &self.inner.max_clients)
            .field("pool_size", &self.pool_size())
            .field("idle", &self.inner.idle.load(Ordering::Relaxed))
            .finish()
    }
}

fn worker_loop(rx: Receiver<Job>, agent: ureq::Agent, idle: Arc<AtomicUsize>, timeout: Duration) {
    loop {
        idle.fetch_add(1, Ordering::AcqRel);
        let job = rx.recv();
        idle.fetch_sub(1, Ordering::AcqRel);

        // Every sender lives in the client; once it is gone, so is the pool.
        let Ok(Job {
            request,
            completion,
        }) = job
        else {
            break;
        };

        tracing::trace!(method = %request.method, url = %request.url, "performing transfer");
        completion.complete(perform(&agent, &request, timeout));
    }
}

/// One blocking request/response exchange.
fn perform(
    agent: &ureq::Agent,
    request: &HttpRequest,
    default_timeout: Duration,
) -> Result<HttpResponse, OperationError> {
    let mut call = agent
        .request(&request.method, &request.url)
        .timeout(request.timeout.unwrap_or(default_timeout));
    for (name, value) in &request.headers {
        call = call.set(name, value);
    }

    let sent = match &request.body {
        Some(body) => call.send_bytes(body),
        None => call.call(),
    };

    let response = match sent {
        Ok(response) => response,
        Err(ureq::Error::Status(code, response)) => {
            return Err(OperationError::Status {
                code,
                body: response.into_string().unwrap_or_default(),
            });
        }
        Err(ureq::Error::Transport(transport)) => return Err(map_transport(&transport)),
    };

    let url = response.get_url().to_string();
    let status = response.status();
    let headers = response
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            let value = response.header(&name)?.to_string();
            Some((name, value))
        })
        .collect();

    let mut body = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|err| map_io(&err))?;

    if !(200..300).contains(&status) {
        return Err(OperationError::Status {
            code: status,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    Ok(HttpResponse {
        url,
        status,
        headers,
        body,
    })
}

fn map_transport(transport: &ureq::Transport) -> OperationError {
    map_error_chain(transport)
}

/// Timeout only when an `io::Error` in the source chain says so.
fn map_error_chain(err: &(dyn std::error::Error + 'static)) -> OperationError {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            if is_timeout(io_err) {
                return OperationError::Timeout(err.to_string());
            }
        }
        source = inner.source();
    }
    OperationError::Transport(err.to_string())
}

fn map_io(err: &io::Error) -> OperationError {
    if is_timeout(err) {
        OperationError::Timeout(err.to_string())
    } else {
        OperationError::Transport(err.to_string())
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

// ---------------------------------------------------------------------------
// Await integration
// ---------------------------------------------------------------------------

/// An HTTP transfer as an [`AsyncOperation`].
#[derive(Debug)]
pub struct Transfer {
    client: HttpClient,
    request: HttpRequest,
}

impl AsyncOperation for Transfer {
    type Output = HttpResponse;

    fn submit(self, completion: Completion<HttpResponse>) {
        let Transfer { client, request } = self;
        client.enqueue(Job {
            request,
            completion,
        });
    }
}

/// Fetch `request` from inside a worker, suspending it until the response
/// arrives.
///
/// Failed transfers are logged as warnings and returned as
/// `AwaitError::Operation`.
pub fn fetch(
    bridge: &Bridge,
    client: &HttpClient,
    request: impl Into<HttpRequest>,
) -> Result<HttpResponse, AwaitError> {
    let request = request.into();
    let url = request.url.clone();
    bridge.await_op(client.transfer(request)).map_err(|error| {
        tracing::warn!("error: {error} for url {url}");
        error
    })
}
