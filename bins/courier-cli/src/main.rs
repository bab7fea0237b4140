use courier_api::{decode_payloads, detect_attachment};
use courier_core::error::CoreError;
use courier_core::health::{RelayHealthRanker, RelayHealthRecord};
use courier_core::outbox::{OutboxQueue, OutboxRecord};
use courier_core::store::JsonFileTable;
use std::sync::Arc;

const USAGE: &str = "usage:
  courier-cli outbox <data_dir> <owner_hex>
  courier-cli rank <data_dir> <relay_url>...
  courier-cli decode <plaintext>";

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");
    let result = match command {
        "outbox" => {
            if args.len() < 4 {
                eprintln!("usage: courier-cli outbox <data_dir> <owner_hex>");
                return;
            }
            print_outbox(&args[2], &args[3]).await
        }
        "rank" => {
            if args.len() < 4 {
                eprintln!("usage: courier-cli rank <data_dir> <relay_url>...");
                return;
            }
            print_ranking(&args[2], &args[3..]).await
        }
        "decode" => {
            if args.len() < 3 {
                eprintln!("usage: courier-cli decode <plaintext>");
                return;
            }
            print_decoded(&args[2..].join(" "))
        }
        _ => {
            eprintln!("{}", USAGE);
            return;
        }
    };
    if let Err(err) = result {
        eprintln!("error {}", err);
        std::process::exit(1);
    }
}

async fn print_outbox(data_dir: &str, owner: &str) -> Result<(), CoreError> {
    let table: JsonFileTable<OutboxRecord> = JsonFileTable::open(data_dir, "outbox")?;
    let queue = OutboxQueue::new(Arc::new(table));
    let records = queue.all(owner).await?;
    if records.is_empty() {
        println!("outbox empty");
        return Ok(());
    }
    for record in records {
        println!(
            "{} {} to={} attempts={} acks={} next={}{}",
            record.id,
            record.status.as_str(),
            record.recipient,
            record.attempt_count,
            record.ack_count,
            record.next_attempt_at,
            record
                .last_error
                .as_ref()
                .map(|e| format!(" error={}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn print_ranking(data_dir: &str, urls: &[String]) -> Result<(), CoreError> {
    let table: JsonFileTable<RelayHealthRecord> = JsonFileTable::open(data_dir, "health")?;
    let ranker = RelayHealthRanker::new(Arc::new(table));
    let records = ranker.records().await?;
    for (position, url) in ranker.rank(urls).await?.iter().enumerate() {
        let normalized = courier_api::normalize_relay_url(url);
        let score = records
            .iter()
            .find(|r| r.relay_url == normalized)
            .map(|r| format!("score={} ok={} failed={}", r.score, r.success_count, r.failure_count))
            .unwrap_or_else(|| "unseen".to_string());
        println!("{} {} {}", position + 1, url, score);
    }
    Ok(())
}

fn print_decoded(plaintext: &str) -> Result<(), CoreError> {
    let body = serde_json::json!({
        "payloads": decode_payloads(plaintext),
        "attachment": detect_attachment(plaintext),
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
