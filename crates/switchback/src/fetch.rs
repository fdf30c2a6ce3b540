//! `switchback fetch`: one unit of work per URL.

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;

use switchback_rt::http::{fetch, HttpClient};
use switchback_rt::{EventLoop, Outcome, RuntimeConfig, Scheduler, UnitHandle, UnitOfWork};

/// A URL being fetched, as seen by the scheduler.
struct FetchUnit {
    url: String,
    /// Name of the debug argument, when `--debug` was given.
    debug_argument: Option<String>,
    /// Status and body length of the successful response.
    response: Option<(u16, usize)>,
    /// Failure detail written by the wrapper.
    detail: String,
    failures: Rc<Cell<usize>>,
}

impl UnitOfWork for FetchUnit {
    fn mark_async(&mut self) {
        tracing::debug!(url = %self.url, "fetch started");
    }

    fn argument(&self, name: &str) -> Option<String> {
        match &self.debug_argument {
            Some(debug) if debug == name => Some("1".to_string()),
            _ => None,
        }
    }

    fn write(&mut self, chunk: &str) {
        self.detail.push_str(chunk);
    }

    fn finish(&mut self) {
        match self.response {
            Some((status, bytes)) => println!("{} {} {}", self.url, status, bytes),
            None => println!("{} - 0", self.url),
        }
    }

    fn fail(&mut self, error: &anyhow::Error) {
        self.failures.set(self.failures.get() + 1);
        eprintln!("{}: {:#}", self.url, error);
        if !self.detail.is_empty() {
            eprintln!("{}", self.detail);
        }
    }
}

/// Returns whether every URL was fetched successfully.
pub fn run(
    urls: &[String],
    config_path: Option<&Path>,
    timeout_ms: Option<u64>,
    debug: bool,
) -> anyhow::Result<bool> {
    let mut config = match config_path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if let Some(timeout_ms) = timeout_ms {
        config.http.timeout_ms = timeout_ms;
    }
    config.validate()?;

    let mut event_loop = EventLoop::new();
    let scheduler = Scheduler::new(event_loop.handle(), &config);
    let client = HttpClient::new(&config.http);
    let failures = Rc::new(Cell::new(0));
    let debug_argument = debug.then(|| config.unit.debug_argument.clone());

    let mut handles: Vec<UnitHandle> = Vec::with_capacity(urls.len());
    for url in urls {
        let unit = FetchUnit {
            url: url.clone(),
            debug_argument: debug_argument.clone(),
            response: None,
            detail: String::new(),
            failures: Rc::clone(&failures),
        };
        let client = client.clone();
        let url = url.clone();
        let handle = scheduler.run_unit(unit, move |unit, bridge| {
            let response = fetch(bridge, &client, url.as_str())?;
            unit.response = Some((response.status, response.body.len()));
            Ok(Outcome::Finish)
        })?;
        handles.push(handle);
    }

    event_loop.run_until(|| handles.iter().all(UnitHandle::is_finished));

    let failed = failures.get();
    tracing::info!(total = urls.len(), failed, "fetch complete");
    Ok(failed == 0)
}
