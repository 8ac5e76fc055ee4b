//! Thin clap front-end: every subcommand maps onto one dispatcher request
//! and the reply envelope is printed as JSON, unformatted. Pretty-printing
//! and colour belong to external wrappers.

use clap::{Parser, Subcommand};

use crate::capture::{DEFAULT_BODY_CAP, DEFAULT_BUFFER_CAP};
use crate::dispatch::Request;

/// Default slice when no range flag is given on console/network.
const DEFAULT_TAIL: usize = 20;

#[derive(Debug, Parser)]
#[command(name = "webctl", version, about = "Drive a Chromium-class browser from the command line")]
pub struct Cli {
    /// Send the command to a remote daemon over TCP instead of the local
    /// socket.
    #[arg(long, global = true)]
    pub remote: Option<String>,
    /// Shared token for the remote daemon.
    #[arg(long, global = true)]
    pub token: Option<String>,
    /// Include dispatch tracing in the daemon log for this command.
    #[arg(long, global = true)]
    pub debug: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the supervisor daemon in the foreground.
    Daemon {
        /// Browser debug address (http://host:port or ws:// URL).
        #[arg(long)]
        browser_url: Option<String>,
        /// Also listen for commands on this TCP address.
        #[arg(long)]
        tcp: Option<String>,
        /// Require this token on the TCP listener.
        #[arg(long)]
        token: Option<String>,
        /// Inline response-body cap in bytes.
        #[arg(long, default_value_t = DEFAULT_BODY_CAP)]
        body_cap: usize,
        /// Capacity of the console and network rings.
        #[arg(long, default_value_t = DEFAULT_BUFFER_CAP)]
        buffer_cap: usize,
    },
    /// Daemon liveness and the session table.
    Status,
    /// Captured console entries for the active session.
    Console {
        /// Entry types to keep (log, warn, error, info, debug, exception).
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
        /// Case-insensitive substring over text and source URL.
        #[arg(long)]
        find: Option<String>,
        #[arg(long)]
        head: Option<usize>,
        #[arg(long)]
        tail: Option<usize>,
        /// Inclusive 0-based index range.
        #[arg(long, num_args = 2)]
        range: Option<Vec<usize>>,
        #[arg(long)]
        all: bool,
    },
    /// Captured network entries for the active session.
    Network {
        /// Resource types to keep (document, xhr, fetch, script, ...).
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        methods: Vec<String>,
        /// Status patterns: exact (404), class (4xx) or range (400-499).
        #[arg(long, value_delimiter = ',')]
        status: Vec<String>,
        /// Regex over the request URL.
        #[arg(long)]
        url: Option<String>,
        #[arg(long, value_delimiter = ',')]
        mimes: Vec<String>,
        /// Minimum duration in seconds.
        #[arg(long)]
        min_duration: Option<f64>,
        /// Minimum size in bytes.
        #[arg(long)]
        min_size: Option<u64>,
        /// Only failed requests.
        #[arg(long)]
        failed: bool,
        /// Case-insensitive substring over URL, method and textual body.
        #[arg(long)]
        find: Option<String>,
        #[arg(long)]
        head: Option<usize>,
        #[arg(long)]
        tail: Option<usize>,
        #[arg(long, num_args = 2)]
        range: Option<Vec<usize>>,
        #[arg(long)]
        all: bool,
    },
    /// Outer HTML of the page or a selector.
    Html {
        #[arg(long)]
        selector: Option<String>,
    },
    /// Computed styles for a selector.
    Css {
        selector: String,
        #[arg(long, value_delimiter = ',')]
        properties: Vec<String>,
    },
    /// Cookies visible to the active page.
    Cookies,
    /// PNG screenshot of the active page.
    Screenshot {
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        full_page: bool,
    },
    /// Evaluate JavaScript on the active session.
    Eval {
        expression: String,
        /// Seconds before the evaluation is abandoned.
        #[arg(long)]
        timeout: Option<u64>,
        /// Do not await a returned promise.
        #[arg(long)]
        no_await: bool,
    },
    /// Navigate the active session.
    Navigate {
        url: String,
        /// Additionally wait for the load event.
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        timeout: Option<u64>,
    },
    Reload {
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        timeout: Option<u64>,
    },
    Back {
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        timeout: Option<u64>,
    },
    Forward {
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Click the centre of the first element matching a selector.
    Click { selector: String },
    /// Insert text, optionally focusing and clearing a field first.
    Type {
        text: String,
        #[arg(long)]
        selector: Option<String>,
        /// Select-all + delete before typing.
        #[arg(long)]
        clear: bool,
        /// Trailing key press (e.g. Enter).
        #[arg(long)]
        key: Option<String>,
    },
    Focus { selector: String },
    /// Press a single key on the active session.
    Key { key: String },
    /// Set the value of a select (or input) element.
    Select { selector: String, value: String },
    Scroll {
        #[arg(long)]
        selector: Option<String>,
        #[arg(long)]
        x: Option<f64>,
        #[arg(long)]
        y: Option<f64>,
    },
    /// Wait for a readiness condition.
    Ready {
        #[arg(long)]
        selector: Option<String>,
        /// JavaScript predicate polled until truthy.
        #[arg(long)]
        predicate: Option<String>,
        #[arg(long)]
        network_idle: bool,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Drop captured entries: console, network or all.
    Clear { target: Option<String> },
    /// List sessions, or switch the active one.
    Target { query: Option<String> },
    /// Stop the daemon.
    Shutdown,
}

fn range_json(
    head: &Option<usize>,
    tail: &Option<usize>,
    range: &Option<Vec<usize>>,
    all: bool,
) -> serde_json::Value {
    let mut spec = serde_json::Map::new();
    if let Some(n) = head {
        spec.insert("head".into(), serde_json::json!(n));
    }
    if let Some(n) = tail {
        spec.insert("tail".into(), serde_json::json!(n));
    }
    if let Some(bounds) = range {
        spec.insert("range".into(), serde_json::json!(bounds));
    }
    if all {
        spec.insert("all".into(), serde_json::json!(true));
    }
    if spec.is_empty() {
        spec.insert("tail".into(), serde_json::json!(DEFAULT_TAIL));
    }
    serde_json::Value::Object(spec)
}

fn opt_list(items: &[String]) -> Option<Vec<String>> {
    if items.is_empty() {
        None
    } else {
        Some(items.to_vec())
    }
}

impl Command {
    /// The dispatcher request for this subcommand; `None` for `daemon`.
    pub fn to_request(&self) -> Option<Request> {
        let req = match self {
            Command::Daemon { .. } => return None,
            Command::Status => Request::new("status"),
            Command::Console {
                types,
                find,
                head,
                tail,
                range,
                all,
            } => Request::new("console").with_params(serde_json::json!({
                "filters": {
                    "types": opt_list(types),
                    "findText": find,
                },
                "range": range_json(head, tail, range, *all),
            })),
            Command::Network {
                types,
                methods,
                status,
                url,
                mimes,
                min_duration,
                min_size,
                failed,
                find,
                head,
                tail,
                range,
                all,
            } => Request::new("network").with_params(serde_json::json!({
                "filters": {
                    "types": opt_list(types),
                    "methods": opt_list(methods),
                    "statusPatterns": opt_list(status),
                    "urlRegex": url,
                    "mimes": opt_list(mimes),
                    "minDuration": min_duration,
                    "minSize": min_size,
                    "onlyFailed": failed,
                    "findText": find,
                },
                "range": range_json(head, tail, range, *all),
            })),
            Command::Html { selector } => {
                Request::new("html").with_params(serde_json::json!({ "selector": selector }))
            }
            Command::Css {
                selector,
                properties,
            } => Request::new("css").with_params(serde_json::json!({
                "selector": selector,
                "properties": opt_list(properties),
            })),
            Command::Cookies => Request::new("cookies"),
            Command::Screenshot { path, full_page } => {
                Request::new("screenshot").with_params(serde_json::json!({
                    "path": path,
                    "fullPage": full_page,
                }))
            }
            Command::Eval {
                expression,
                timeout,
                no_await,
            } => Request::new("eval").with_params(serde_json::json!({
                "expression": expression,
                "timeoutSecs": timeout,
                "awaitPromise": !no_await,
            })),
            Command::Navigate { url, wait, timeout } => {
                Request::new("navigate").with_params(serde_json::json!({
                    "url": url,
                    "wait": wait,
                    "timeoutSecs": timeout,
                }))
            }
            Command::Reload { wait, timeout } => {
                Request::new("reload").with_params(serde_json::json!({
                    "wait": wait,
                    "timeoutSecs": timeout,
                }))
            }
            Command::Back { wait, timeout } => {
                Request::new("back").with_params(serde_json::json!({
                    "wait": wait,
                    "timeoutSecs": timeout,
                }))
            }
            Command::Forward { wait, timeout } => {
                Request::new("forward").with_params(serde_json::json!({
                    "wait": wait,
                    "timeoutSecs": timeout,
                }))
            }
            Command::Click { selector } => {
                Request::new("click").with_params(serde_json::json!({ "selector": selector }))
            }
            Command::Type {
                text,
                selector,
                clear,
                key,
            } => Request::new("type").with_params(serde_json::json!({
                "text": text,
                "selector": selector,
                "clear": clear,
                "key": key,
            })),
            Command::Focus { selector } => {
                Request::new("focus").with_params(serde_json::json!({ "selector": selector }))
            }
            Command::Key { key } => {
                Request::new("key").with_params(serde_json::json!({ "key": key }))
            }
            Command::Select { selector, value } => {
                Request::new("select").with_params(serde_json::json!({
                    "selector": selector,
                    "value": value,
                }))
            }
            Command::Scroll { selector, x, y } => {
                Request::new("scroll").with_params(serde_json::json!({
                    "selector": selector,
                    "x": x,
                    "y": y,
                }))
            }
            Command::Ready {
                selector,
                predicate,
                network_idle,
                timeout,
            } => Request::new("ready").with_params(serde_json::json!({
                "selector": selector,
                "predicate": predicate,
                "networkIdle": network_idle,
                "timeoutSecs": timeout,
            })),
            Command::Clear { target } => {
                let mut req = Request::new("clear");
                if let Some(target) = target {
                    req = req.with_target(target.clone());
                }
                req
            }
            Command::Target { query } => {
                let mut req = Request::new("target");
                if let Some(query) = query {
                    req = req.with_target(query.clone());
                }
                req
            }
            Command::Shutdown => Request::new("shutdown"),
        };
        Some(req)
    }
}
