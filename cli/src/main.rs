use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use orbis::{
    ApiClient, ClientConfig, Credential, DecodedResult, Endpoint, ORDER_REF_FIELD,
    ORDER_STATUS_FIELD, RequestParams, StreamEvent,
};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] orbis::ConfigError),
    #[error(transparent)]
    Client(#[from] orbis::ClientError),
    #[error(transparent)]
    Stream(#[from] orbis::StreamError),
    #[error("unknown endpoint `{0}`; run `orbis-cli endpoints` for the list")]
    UnknownEndpoint(String),
    #[error("invalid parameter `{0}`; expected key=value")]
    InvalidParam(String),
    #[error("--data cannot be combined with key=value parameters")]
    DataWithParams,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("missing expected field `{0}`")]
    MissingField(&'static str),
    #[error("order {order_ref} reached terminal status {status}")]
    OrderRejected { order_ref: String, status: String },
    #[error("order {order_ref} not in status {awaited} after {attempts} attempts (last: {last})")]
    WaitExhausted {
        order_ref: String,
        awaited: String,
        attempts: u32,
        last: String,
    },
}

#[derive(Parser, Debug)]
#[command(name = "orbis-cli", about = "Orbis trading-platform API and stream CLI")]
struct Cli {
    #[arg(long, env = "ORBIS_HOST")]
    host: String,

    #[arg(long, env = "ORBIS_TOKEN", hide_env_values = true)]
    token: String,

    #[arg(long, env = "ORBIS_AUTH_SCHEME", default_value = orbis::config::DEFAULT_AUTH_SCHEME)]
    auth_scheme: String,

    #[arg(long, env = "ORBIS_API_PREFIX", default_value = orbis::config::DEFAULT_API_PREFIX)]
    api_prefix: String,

    #[arg(long, env = "ORBIS_CONNECT_TIMEOUT_SECS", default_value_t = orbis::config::DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout_secs: u64,

    #[arg(long, env = "ORBIS_READ_TIMEOUT_SECS", default_value_t = orbis::config::DEFAULT_READ_TIMEOUT_SECS)]
    read_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered endpoints.
    Endpoints,
    /// Equity quotes for one or more symbols.
    Quotes {
        #[arg(required = true)]
        symbols: Vec<String>,
    },
    /// Search quotes by free-text criteria.
    Search { criteria: String },
    News {
        filter: String,
        #[arg(long, default_value_t = 0)]
        start: u32,
    },
    Fundamentals(FundamentalsCommand),
    Order(OrderCommand),
    /// Invoke any endpoint by name with key=value parameters.
    Call {
        endpoint: String,
        params: Vec<String>,
        /// JSON request body; sends the call as a POST.
        #[arg(long)]
        data: Option<String>,
    },
    /// Print stream events until the connection closes.
    Stream(StreamArgs),
}

#[derive(Args, Debug)]
struct FundamentalsCommand {
    #[command(subcommand)]
    command: FundamentalsSubcommand,
}

#[derive(Subcommand, Debug)]
enum FundamentalsSubcommand {
    Types,
    Get { kind: String, symbol: String },
}

#[derive(Args, Debug)]
struct OrderCommand {
    #[command(subcommand)]
    command: OrderSubcommand,
}

#[derive(Subcommand, Debug)]
enum OrderSubcommand {
    /// Place an equity order against a portfolio model.
    Place(PlaceArgs),
    Status { order_ref: String },
    Cancel { order_ref: String },
    /// Poll an order until it reaches the awaited status.
    Wait {
        order_ref: String,
        #[command(flatten)]
        wait: WaitArgs,
    },
}

#[derive(Args, Debug)]
struct PlaceArgs {
    #[arg(long, default_value_t = 1)]
    model_id: u64,

    #[arg(long, required_unless_present = "data")]
    symbol: Option<String>,

    #[arg(long, default_value_t = 1)]
    quantity: u64,

    /// Limit price; omit for a market order.
    #[arg(long)]
    limit_price: Option<f64>,

    #[arg(long, default_value = "BUY")]
    transaction: String,

    /// Full JSON request body, used instead of the fields above.
    #[arg(long)]
    data: Option<String>,

    /// Wait for acceptance, then cancel the order.
    #[arg(long, default_value_t = false)]
    cancel_after_accept: bool,

    #[command(flatten)]
    wait: WaitArgs,
}

#[derive(Args, Debug, Clone)]
struct WaitArgs {
    #[arg(long, default_value_t = 60)]
    max_attempts: u32,

    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    #[arg(long, default_value = "W")]
    await_status: String,

    /// Statuses that end the wait with an error.
    #[arg(long, value_delimiter = ',', default_value = "R,C,E")]
    fail_on: Vec<String>,
}

#[derive(Args, Debug)]
struct StreamArgs {
    /// Text frames to send once the stream is open.
    #[arg(long)]
    send: Vec<String>,

    /// Close after this many text or binary frames.
    #[arg(long)]
    max_frames: Option<usize>,

    /// Close after this many seconds.
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = ClientConfig::builder(cli.host)
        .credential(Credential::new(cli.auth_scheme, cli.token))
        .api_prefix(cli.api_prefix)
        .connect_timeout(Duration::from_secs(cli.connect_timeout_secs))
        .read_timeout(Duration::from_secs(cli.read_timeout_secs))
        .build()?;
    let client = ApiClient::new(config)?;

    match cli.command {
        Command::Endpoints => {
            for definition in orbis::endpoint::all() {
                println!(
                    "{:<26} {:<4} {}",
                    definition.name, definition.method, definition.path_template
                );
            }
            Ok(())
        }
        Command::Quotes { symbols } => {
            let symbols: Vec<&str> = symbols.iter().map(String::as_str).collect();
            print_result(client.quotes(&symbols).await?)
        }
        Command::Search { criteria } => print_result(client.quote_search(&criteria).await?),
        Command::News { filter, start } => print_result(client.news(&filter, start).await?),
        Command::Fundamentals(fundamentals) => run_fundamentals(&client, fundamentals).await,
        Command::Order(order) => run_order(&client, order).await,
        Command::Call {
            endpoint,
            params,
            data,
        } => run_call(&client, &endpoint, &params, data.as_deref()).await,
        Command::Stream(args) => run_stream(&client, args).await,
    }
}

async fn run_fundamentals(client: &ApiClient, command: FundamentalsCommand) -> Result<(), CliError> {
    match command.command {
        FundamentalsSubcommand::Types => print_result(client.fundamental_types().await?),
        FundamentalsSubcommand::Get { kind, symbol } => {
            print_result(client.fundamentals(&kind, &symbol).await?)
        }
    }
}

async fn run_order(client: &ApiClient, command: OrderCommand) -> Result<(), CliError> {
    match command.command {
        OrderSubcommand::Place(args) => place_order(client, args).await,
        OrderSubcommand::Status { order_ref } => print_result(client.order_status(&order_ref).await?),
        OrderSubcommand::Cancel { order_ref } => print_result(client.cancel_order(&order_ref).await?),
        OrderSubcommand::Wait { order_ref, wait } => {
            let status = wait_for_status(client, &order_ref, &wait).await?;
            println!("{order_ref} {status}");
            Ok(())
        }
    }
}

async fn place_order(client: &ApiClient, args: PlaceArgs) -> Result<(), CliError> {
    let body = match &args.data {
        Some(raw) => serde_json::from_str::<Value>(raw)?,
        None => equity_order_body(&args),
    };

    let placed = client.place_model_equity_order(&body).await?;
    let order_ref = placed
        .as_object()
        .and_then(|object| object.get(ORDER_REF_FIELD))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or(CliError::MissingField(ORDER_REF_FIELD))?;
    eprintln!("order placed as: {order_ref}");

    if !args.cancel_after_accept {
        return print_result(placed);
    }

    let status = wait_for_status(client, &order_ref, &args.wait).await?;
    eprintln!("order {order_ref} reached {status}; cancelling");
    print_result(client.cancel_order(&order_ref).await?)
}

fn equity_order_body(args: &PlaceArgs) -> Value {
    let mut order = json!({
        "quote": { "symbol": args.symbol.as_deref().unwrap_or_default() },
        "orderType": if args.limit_price.is_some() { "LIMIT" } else { "MARKET" },
        "quantity": args.quantity,
        "transaction": args.transaction.to_uppercase(),
    });
    if let Some(price) = args.limit_price {
        order["limitPrice"] = json!(price);
    }
    json!({ "model": { "id": args.model_id }, "order": order })
}

async fn run_call(
    client: &ApiClient,
    name: &str,
    raw_params: &[String],
    data: Option<&str>,
) -> Result<(), CliError> {
    let endpoint = Endpoint::lookup(name).ok_or_else(|| CliError::UnknownEndpoint(name.to_owned()))?;

    if let Some(raw) = data {
        if !raw_params.is_empty() {
            return Err(CliError::DataWithParams);
        }
        let body = serde_json::from_str::<Value>(raw)?;
        return print_result(client.post(endpoint, &body).await?);
    }

    let params = parse_params(raw_params)?;
    print_result(client.call(endpoint, &params).await?)
}

async fn run_stream(client: &ApiClient, args: StreamArgs) -> Result<(), CliError> {
    let (handle, mut events) = client.connect_stream().await?;
    let deadline = args.duration_secs.map(Duration::from_secs);
    let mut frames = 0_usize;

    let drive = async {
        while let Some(event) = events.recv().await {
            match &event {
                StreamEvent::Opened { status, .. } => {
                    eprintln!("stream opened (HTTP {status})");
                    for text in &args.send {
                        handle.send_text(text.clone())?;
                    }
                }
                StreamEvent::Text(text) => {
                    println!("{text}");
                    frames = frames.saturating_add(1);
                }
                StreamEvent::Binary(bytes) => {
                    println!("<binary {} bytes>", bytes.len());
                    frames = frames.saturating_add(1);
                }
                StreamEvent::Error(message) => eprintln!("stream error: {message}"),
                StreamEvent::Closed { code, reason, remote } => {
                    eprintln!("stream closed: code={code} reason={reason:?} remote={remote}");
                }
            }
            if args.max_frames.is_some_and(|limit| frames >= limit) {
                handle.close();
            }
        }
        Ok::<(), CliError>(())
    };

    match deadline {
        Some(limit) => {
            tokio::pin!(drive);
            if tokio::time::timeout(limit, &mut drive).await.is_err() {
                handle.close();
                drive.await?;
            }
        }
        None => drive.await?,
    }
    handle.join().await;
    Ok(())
}

// =============================================================================
// ORDER WAIT
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
enum WaitStep {
    Reached,
    Failed,
    Pending,
}

fn classify_status(status: &str, wait: &WaitArgs) -> WaitStep {
    if status == wait.await_status {
        WaitStep::Reached
    } else if wait.fail_on.iter().any(|s| s == status) {
        WaitStep::Failed
    } else {
        WaitStep::Pending
    }
}

fn order_status_code(result: &DecodedResult) -> Result<String, CliError> {
    result
        .as_object()
        .and_then(|object| object.get(ORDER_STATUS_FIELD))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or(CliError::MissingField(ORDER_STATUS_FIELD))
}

/// Poll the order status, sleeping before each attempt, until it reaches
/// `wait.await_status`, hits a `fail_on` status, or runs out of attempts.
async fn wait_for_status(client: &ApiClient, order_ref: &str, wait: &WaitArgs) -> Result<String, CliError> {
    let interval = Duration::from_millis(wait.interval_ms);
    let mut last = String::from("-");

    for attempt in 1..=wait.max_attempts {
        tokio::time::sleep(interval).await;
        let status = order_status_code(&client.order_status(order_ref).await?)?;
        tracing::debug!(order_ref, attempt, %status, "polled order status");

        match classify_status(&status, wait) {
            WaitStep::Reached => return Ok(status),
            WaitStep::Failed => {
                return Err(CliError::OrderRejected {
                    order_ref: order_ref.to_owned(),
                    status,
                });
            }
            WaitStep::Pending => last = status,
        }
    }

    Err(CliError::WaitExhausted {
        order_ref: order_ref.to_owned(),
        awaited: wait.await_status.clone(),
        attempts: wait.max_attempts,
        last,
    })
}

// =============================================================================
// HELPERS
// =============================================================================

fn parse_param(raw: &str) -> Result<(String, String), CliError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(CliError::InvalidParam(raw.to_owned())),
    }
}

fn parse_params(raw: &[String]) -> Result<RequestParams, CliError> {
    let pairs = raw
        .iter()
        .map(|entry| parse_param(entry))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pairs.into_iter().collect())
}

fn print_result(result: DecodedResult) -> Result<(), CliError> {
    if result.is_empty() {
        eprintln!("no content");
        return Ok(());
    }
    print_json(&result.into_value())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
