//! qmock - dry-run requests against a route file.

use anyhow::Result;
use clap::Parser;
use qmock::http::{self, client, IncomingMessage, RouteTable};
use qmock::uri::RequestOptions;
use qmock::{timers, RouteConfig};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Rounds of virtual time and real network work before giving up.
const MAX_ROUNDS: usize = 4;

#[derive(Parser, Debug)]
#[command(
    name = "qmock",
    about = "Dry-run HTTP requests against a qmock route file on a virtual clock",
    version
)]
struct Args {
    /// Path to the route file
    #[arg(short, long, default_value = "routes.yaml")]
    routes: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "warn")]
    log_level: Level,

    /// Print an example route file and exit
    #[arg(long)]
    print_config: bool,

    /// Validate the route file and exit
    #[arg(long)]
    validate: bool,

    /// Body sent with every request
    #[arg(short, long)]
    body: Option<String>,

    /// Extra request header as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    headers: Vec<String>,

    /// Virtual milliseconds to advance per round
    #[arg(long, default_value_t = 60_000)]
    budget_ms: u64,

    /// Requests to run, e.g. `GET:http://api.test/users` or `/health`
    #[arg(value_name = "REQUEST")]
    requests: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Outcome {
    request: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    body: String,
    complete: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

struct Pending {
    request: String,
    response: Rc<RefCell<Option<IncomingMessage>>>,
    errors: Rc<RefCell<Vec<String>>>,
}

impl Pending {
    fn is_settled(&self) -> bool {
        let finished = self
            .response
            .borrow()
            .as_ref()
            .is_some_and(IncomingMessage::is_complete);
        finished || !self.errors.borrow().is_empty()
    }

    fn outcome(&self) -> Outcome {
        let response = self.response.borrow();
        Outcome {
            request: self.request.clone(),
            status: response.as_ref().and_then(IncomingMessage::status_code),
            headers: response
                .as_ref()
                .map(|res| res.headers().into())
                .unwrap_or_default(),
            body: response.as_ref().map(IncomingMessage::text).unwrap_or_default(),
            complete: response.as_ref().is_some_and(IncomingMessage::is_complete),
            errors: self.errors.borrow().clone(),
        }
    }
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("header {raw:?} is not `Name: value`"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn issue(target: &str, headers: &[(String, String)], body: Option<&str>) -> Pending {
    let mut options = RequestOptions::from_url(target);
    for (name, value) in headers {
        options.headers.set(name, value.clone());
    }

    let response = Rc::new(RefCell::new(None));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let slot = response.clone();
    let req = client::request(options, move |res| *slot.borrow_mut() = Some(res));
    let sink = errors.clone();
    req.on_error(move |err| sink.borrow_mut().push(err.to_string()));
    if let Some(body) = body {
        req.write(body.to_string());
    }
    req.end();

    Pending {
        request: target.to_string(),
        response,
        errors,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        print!("{}", include_str!("../demos/routes.yaml"));
        return Ok(());
    }

    let config = if args.routes.exists() {
        info!(path = ?args.routes, "Loading route file");
        RouteConfig::from_file(&args.routes)?
    } else if args.validate || !args.requests.is_empty() {
        anyhow::bail!("route file not found: {}", args.routes.display());
    } else {
        info!("No route file, nothing to do");
        RouteConfig::default()
    };

    if args.validate {
        println!(
            "Route file is valid ({} routes, {} enabled)",
            config.routes.len(),
            config.enabled_routes().count()
        );
        return Ok(());
    }

    let headers = args
        .headers
        .iter()
        .map(|raw| parse_header(raw))
        .collect::<Result<Vec<_>>>()?;

    let table = RouteTable::from_config(&config)?;
    let clock = timers::mock_timers();
    http::mock_http_with(table.clone());

    let pending: Vec<Pending> = args
        .requests
        .iter()
        .map(|target| issue(target, &headers, args.body.as_deref()))
        .collect();

    for round in 0..MAX_ROUNDS {
        clock.advance(args.budget_ms)?;
        if pending.iter().all(Pending::is_settled) {
            break;
        }
        debug!(round, "waiting on real network work");
        timers::runtime().run().await;
    }

    let outcomes: Vec<Outcome> = pending.iter().map(Pending::outcome).collect();
    println!("{}", serde_json::to_string_pretty(&outcomes)?);

    let stats = table.stats();
    info!(
        requests = stats.requests,
        matched = stats.matched,
        unmatched = stats.unmatched,
        virtual_ms = clock.now(),
        "Dry run finished"
    );

    http::unmock_http();
    timers::unmock_timers();
    Ok(())
}
