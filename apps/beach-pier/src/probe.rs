use anyhow::{anyhow, bail, Result};
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, error};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to a pier, request a match and print the resulting pairing.
pub async fn run_probe(url: &str, wait: Duration) -> Result<()> {
    debug!("Connecting to {}", url);

    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after {} seconds", CONNECT_TIMEOUT.as_secs());
            return Err(anyhow!("Connection timeout - is beach-pier running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let welcome = next_of_type(&mut read, &["welcome"], CONNECT_TIMEOUT).await?;
    let me = welcome["connectionId"]
        .as_str()
        .ok_or_else(|| anyhow!("welcome frame without connectionId"))?
        .to_string();
    println!("connected as {me}");

    let request = json!({ "type": "find-match" }).to_string();
    write.send(Message::Text(request.into())).await?;
    println!("waiting for a partner (up to {}s)...", wait.as_secs());

    let found = next_of_type(&mut read, &["match-found", "queue-timeout"], wait).await?;
    if found["type"] == "queue-timeout" {
        bail!("evicted from the waiting queue before a partner arrived");
    }
    let room_id = found["roomId"].as_str().unwrap_or_default();
    let role = if found["initiator"] == me.as_str() {
        "initiator (sends the offer)"
    } else {
        "answerer"
    };
    println!("matched in {room_id} as {role}");

    write.send(Message::Close(None)).await?;
    Ok(())
}

/// Read frames until one whose `type` is in `kinds` arrives.
async fn next_of_type<S>(read: &mut S, kinds: &[&str], wait: Duration) -> Result<Value>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let result = timeout(wait, async {
        while let Some(frame) = read.next().await {
            let Message::Text(text) = frame? else {
                continue;
            };
            let value: Value = serde_json::from_str(text.as_str())?;
            let kind = value["type"].as_str().unwrap_or_default();
            if kinds.contains(&kind) {
                return Ok::<_, anyhow::Error>(value);
            }
            if kind == "error" {
                return Err(anyhow!("server error: {}", value["message"]));
            }
            debug!("ignoring {} frame", kind);
        }
        Err(anyhow!("connection closed while waiting for {}", kinds.join("/")))
    })
    .await;

    match result {
        Ok(value) => value,
        Err(_) => Err(anyhow!("timed out waiting for {}", kinds.join("/"))),
    }
}
