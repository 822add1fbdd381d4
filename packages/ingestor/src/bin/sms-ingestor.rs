//! SMS ingestor process
//!
//! Reads platform message deliveries from stdin, one JSON value per line
//! (a single message or an array of messages), runs the parse workers, and
//! prints every created-draft event to stdout as a JSON line. Runs until
//! interrupted.

use serde::Deserialize;
use sms_ledger_ingestor::{IngestorConfig, RawMessage, RedisIngestor};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// One platform delivery
#[derive(Deserialize)]
#[serde(untagged)]
enum PlatformDelivery {
    Batch(Vec<RawMessage>),
    Single(RawMessage),
}

impl PlatformDelivery {
    fn into_messages(self) -> Vec<RawMessage> {
        match self {
            PlatformDelivery::Batch(messages) => messages,
            PlatformDelivery::Single(message) => vec![message],
        }
    }
}

/// Result of reading one input line
#[derive(Debug)]
enum Input {
    Messages(Vec<RawMessage>),
    /// Blank, badly encoded or malformed line; already logged
    Skipped,
    Closed,
}

/// Read and decode the next delivery line
///
/// Only end of input and I/O failures of the reader end the stream; a bad
/// line is skipped.
async fn read_delivery<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Input>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(Input::Closed);
    }

    let line = match std::str::from_utf8(buf) {
        Ok(line) => line.trim(),
        Err(e) => {
            warn!(error = %e, "ignoring malformed delivery");
            return Ok(Input::Skipped);
        }
    };
    if line.is_empty() {
        return Ok(Input::Skipped);
    }

    match serde_json::from_str::<PlatformDelivery>(line) {
        Ok(delivery) => Ok(Input::Messages(delivery.into_messages())),
        Err(e) => {
            warn!(error = %e, "ignoring malformed delivery");
            Ok(Input::Skipped)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = IngestorConfig::from_env()?;
    let ingestor = RedisIngestor::connect(&config).await?;

    let recovered = ingestor.recover().await?;
    let pool = ingestor.start_workers(config.workers);
    info!(workers = config.workers, recovered, "ingestor running");

    let mut subscription = ingestor.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            match event.to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => warn!(error = %e, "could not encode draft event"),
            }
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut buf = Vec::new();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            input = read_delivery(&mut stdin, &mut buf), if stdin_open => match input {
                Ok(Input::Messages(messages)) => {
                    ingestor.ingest_batch(&messages).await;
                }
                Ok(Input::Skipped) => {}
                // keep draining queued jobs until interrupted
                Ok(Input::Closed) => {
                    info!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    error!(error = %e, "stdin unreadable, no further deliveries");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        }
    }

    pool.shutdown().await;
    ingestor.unsubscribe();
    let _ = printer.await;
    Ok(())
}
