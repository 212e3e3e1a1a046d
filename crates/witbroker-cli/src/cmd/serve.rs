//! `wb serve`: host the handle store behind a JSON-lines stdio protocol.
//!
//! # Usage
//!
//! ```text
//! # Serve against a fixture of work items
//! wb serve --fixture items.json
//!
//! # One request per line on stdin, one response per line on stdout
//! {"op":"query","ids":[101,102,103],"source":"stale bugs"}
//! {"op":"bulk","handle":"qh_...","selector":{"states":"Active"},"mutation":{"kind":"assign","user":"ana"},"dryRun":false}
//! {"op":"undo","handle":"qh_..."}
//! ```

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use witbroker_core::config::{BulkConfig, resolve_config};
use witbroker_core::coordinator::preview_items;
use witbroker_core::selector::resolve;
use witbroker_core::{BulkCoordinator, BulkRequest, ErrorCode, HandleStore, Page, Sweeper};

use crate::fixture::FixtureBackend;
use crate::protocol::{ErrorReply, OkReply, Request, parse_selector};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// JSON array of work items that backs queries and mutations.
    #[arg(long, value_name = "ITEMS_JSON")]
    pub fixture: PathBuf,

    /// Config file (default: .witbroker/config.toml, then the user config dir).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

pub fn run_serve(args: &ServeArgs, project_root: &Path) -> Result<()> {
    let config = resolve_config(args.config.as_deref(), project_root)?;
    let backend = FixtureBackend::load(&args.fixture)?;

    let store = HandleStore::with_system_clock().shared();
    let sweeper = Sweeper::spawn(Arc::clone(&store), config.sweep.interval())
        .context("Failed to start handle sweeper")?;
    info!(
        fixture = %args.fixture.display(),
        sweep_interval_secs = config.sweep.interval_secs,
        "serving query handles on stdio"
    );

    let session = Session::new(store, backend, config.bulk);
    let served = session.serve(io::stdin().lock(), &mut io::stdout().lock());
    sweeper.stop();

    let requests = served?;
    info!(requests, "stdin closed, shutting down");
    Ok(())
}

/// Everything one serve loop needs: the store, the coordinator over it, and
/// the tracker mutations go to.
pub struct Session {
    store: Arc<HandleStore>,
    coordinator: BulkCoordinator,
    backend: FixtureBackend,
    bulk: BulkConfig,
}

type Reply = std::result::Result<Value, ErrorReply>;

impl Session {
    pub fn new(store: Arc<HandleStore>, backend: FixtureBackend, bulk: BulkConfig) -> Self {
        Self {
            coordinator: BulkCoordinator::new(Arc::clone(&store)),
            store,
            backend,
            bulk,
        }
    }

    /// Answer requests until `input` is exhausted. Returns the number of
    /// requests handled.
    ///
    /// # Errors
    ///
    /// Only I/O failures on `input` or `output`; bad requests get error
    /// replies and the loop continues.
    pub fn serve(&self, input: impl BufRead, output: &mut impl Write) -> Result<usize> {
        let mut handled = 0;
        for line in input.lines() {
            let line = line.context("Failed to read request line")?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let reply = self.handle_line(line);
            writeln!(output, "{reply}").context("Failed to write response")?;
            output.flush().context("Failed to flush response")?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Process one request line into one response line.
    pub fn handle_line(&self, line: &str) -> String {
        let reply = Request::parse(line).and_then(|request| {
            let op = request.op();
            debug!(op, "request received");
            let reply = self.dispatch(request);
            if let Err(err) = &reply {
                warn!(op, code = err.code, error = %err.error, "request failed");
            }
            reply
        });

        let encoded = match reply {
            Ok(body) => serde_json::to_string(&OkReply::new(body)),
            Err(err) => serde_json::to_string(&err),
        };
        encoded.unwrap_or_else(|err| {
            format!(
                r#"{{"ok":false,"code":"{}","error":"failed to encode response: {err}"}}"#,
                ErrorCode::InternalUnexpected.code()
            )
        })
    }

    fn dispatch(&self, request: Request) -> Reply {
        match request {
            Request::Query { ids, source } => {
                let (found, metadata) = self.backend.query(&ids);
                let skipped = ids.len() - found.len();
                let source = if source.is_empty() {
                    format!("query of {} work items", ids.len())
                } else {
                    source
                };
                let handle = self.store.create(found, metadata, source)?;
                let summary = self.store.validate(&handle)?;
                Ok(json!({
                    "handle": handle,
                    "itemCount": summary.item_count,
                    "expiresAt": summary.expires_at,
                    "skipped": skipped,
                }))
            }
            Request::List {
                include_expired,
                offset,
                limit,
            } => {
                let page = Page::new(offset, limit.unwrap_or(Page::DEFAULT_LIMIT));
                encode(self.store.list(include_expired, page)?)
            }
            Request::Info { handle } => {
                let summary = self.store.validate(&handle)?;
                let remaining = summary
                    .time_remaining(self.store.clock().now())
                    .num_seconds();
                let mut body = encode(summary)?;
                body["remainingSecs"] = json!(remaining);
                Ok(body)
            }
            Request::Select {
                handle,
                selector,
                max_preview,
            } => {
                let selector = parse_selector(selector)?;
                let record = self.store.get(&handle)?;
                let selection = resolve(&record, &selector);
                let (preview, scope) = preview_items(
                    &record,
                    &selection.ids,
                    max_preview.unwrap_or(self.bulk.max_preview_items),
                );
                Ok(json!({
                    "handle": handle,
                    "selector": selector.describe(),
                    "considered": selection.considered,
                    "matched": selection.matched,
                    "ids": selection.ids,
                    "indexErrors": selection.index_errors,
                    "preview": preview,
                    "omitted": scope.omitted,
                }))
            }
            Request::Bulk {
                handle,
                selector,
                mutation,
                dry_run,
                stop_on_error,
                max_preview,
            } => {
                let selector = parse_selector(selector)?;
                let mut request = BulkRequest::new(handle, selector)
                    .stop_on_error(stop_on_error.unwrap_or(self.bulk.stop_on_error))
                    .max_preview_items(max_preview.unwrap_or(self.bulk.max_preview_items));
                if !dry_run.unwrap_or(true) {
                    request = request.live();
                }
                encode(self.coordinator.run(&request, &mutation, &self.backend)?)
            }
            Request::Undo { handle, all } => {
                let ledger = self.coordinator.ledger();
                if all {
                    encode(ledger.undo_all(&handle, &self.backend)?)
                } else {
                    encode(ledger.undo_last(&handle, &self.backend)?)
                }
            }
            Request::History { handle } => {
                let operations = self.coordinator.ledger().history(&handle)?;
                Ok(json!({ "handle": handle, "operations": operations }))
            }
            Request::Drop { handle } => {
                let removed = self.store.remove(&handle)?;
                Ok(json!({ "handle": handle, "removed": removed }))
            }
        }
    }
}

fn encode(value: impl Serialize) -> Reply {
    serde_json::to_value(value)
        .map_err(|err| ErrorReply::new(ErrorCode::InternalUnexpected, err.to_string()))
}
