use std::sync::Arc;
use std::time::{Duration, Instant};

use msgprims_core::{Message, SharedConnection};
use msgprims_frame::StreamConnection;
use msgprims_manager::RemoteManager;
use msgprims_rpc::{ClientConfig, RpcClient};
use serde_json::Value;

use crate::cmd::CallArgs;
use crate::exit::{io_error, manager_error, rpc_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_call, CallOutput, OutputFormat};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let params = resolve_params(args.json.as_deref())?;

    let stream = StreamConnection::connect_unix(&args.path)
        .await
        .map_err(|err| io_error("connect failed", err))?;
    let connection: SharedConnection = Arc::new(stream);
    let client = RpcClient::with_config(
        connection,
        ClientConfig::default().with_default_timeout(timeout),
    );

    let manager = RemoteManager::create(client.clone())
        .await
        .map_err(|err| manager_error("handshake failed", err))?;

    let type_name = format!("cli:{}", args.service);
    client
        .register_type(type_name.as_str(), [args.method.as_str()])
        .map_err(|err| rpc_error("invalid method", err))?;

    let object = manager
        .get(&args.service, &type_name)
        .await
        .map_err(|err| manager_error("acquire failed", err))?
        .ok_or_else(|| {
            CliError::new(
                crate::exit::FAILURE,
                format!("service not found: {}", args.service),
            )
        })?;

    let started = Instant::now();
    let result = object.call(&args.method, Message::new(params)).await;
    let elapsed_ms = started.elapsed().as_millis();

    if let Err(err) = object.close().await {
        tracing::warn!(error = %err, object_id = object.id(), "release failed");
    }
    let reply = result.map_err(|err| rpc_error("call failed", err))?;

    let out = CallOutput::new(&args.service, object.id(), &args.method, &reply, elapsed_ms);
    print_call(&out, &reply, format);

    if let Err(err) = manager.close().await {
        tracing::debug!(error = %err, "close after call failed");
    }
    Ok(SUCCESS)
}

fn resolve_params(json: Option<&str>) -> CliResult<Value> {
    let Some(json) = json else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value = serde_json::from_str(json)
        .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
    if !value.is_object() {
        return Err(CliError::new(USAGE, "--json must be a JSON object"));
    }
    Ok(value)
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
