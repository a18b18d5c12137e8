//! Connector server implementation.

use btp_core::protocol_data::{self, ProtocolData};
use btp_core::{Codec, ErrorKind, Fulfillment, Packet, WireMessage};
use btp_plugin::{FrameCodec, JsonFrames};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub struct Settings {
    pub prefix: String,
    pub balance: u64,
    pub token: Option<String>,
}

struct Prepared {
    sender: String,
    amount: u64,
    fulfillment: Option<Fulfillment>,
}

/// Shared ledger state.
struct Ledger {
    settings: Settings,
    balances: HashMap<String, u64>, // username -> balance
    transfers: HashMap<String, Prepared>,
}

type SharedLedger = Arc<RwLock<Ledger>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

pub async fn run(addr: SocketAddr, settings: Settings) -> anyhow::Result<()> {
    let ledger = Arc::new(RwLock::new(Ledger {
        settings,
        balances: HashMap::new(),
        transfers: HashMap::new(),
    }));

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on ws://{}", addr);

    loop {
        let (stream, client_addr) = listener.accept().await?;
        let ledger = ledger.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, ledger).await {
                tracing::warn!("Connection error from {}: {}", client_addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ledger: SharedLedger,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();
    let codec = Codec::default();

    tracing::debug!("New connection from {}", addr);

    // Wait for auth
    let username = loop {
        let msg = stream.next().await.ok_or(anyhow::anyhow!("Connection closed"))??;
        let Some(wire) = decode(&msg)? else {
            continue;
        };
        let Packet::Message(items) = &wire.packet else {
            anyhow::bail!("expected auth message, got {}", wire.packet.type_name());
        };
        if protocol_data::find(items, "auth").is_none() {
            anyhow::bail!("first message must be auth");
        }
        let field = |name| {
            protocol_data::find(items, name)
                .map(ProtocolData::data_as_text)
                .unwrap_or_default()
        };
        let (username, token) = (field("auth_username"), field("auth_token"));

        let expected = ledger.read().await.settings.token.clone();
        if expected.is_some_and(|t| t != token) {
            let refusal = codec.encode_error(wire.request_id, ErrorKind::NotAccepted, false, "connector");
            send(&mut sink, &refusal).await?;
            anyhow::bail!("{} failed authentication", username);
        }
        send(&mut sink, &codec.ack(wire.request_id)).await?;
        break username;
    };

    let account = {
        let mut l = ledger.write().await;
        let opening = l.settings.balance;
        l.balances.entry(username.clone()).or_insert(opening);
        format!("{}{}", l.settings.prefix, username)
    };
    tracing::info!("{} linked from {}", account, addr);

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("WebSocket error: {}", e);
                break;
            }
        };
        let wire = match decode(&msg) {
            Ok(Some(wire)) => wire,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Invalid frame: {}", e);
                continue;
            }
        };
        if let Some(reply) = settle(&ledger, &codec, &username, &account, wire).await {
            send(&mut sink, &reply).await?;
        }
    }

    tracing::debug!("Connection closed: {}", addr);
    Ok(())
}

fn decode(msg: &Message) -> anyhow::Result<Option<WireMessage>> {
    let bytes: &[u8] = match msg {
        Message::Binary(bytes) => bytes,
        Message::Text(text) => text.as_bytes(),
        _ => return Ok(None),
    };
    Ok(Some(JsonFrames.decode(bytes)?))
}

async fn send(sink: &mut WsSink, wire: &WireMessage) -> anyhow::Result<()> {
    sink.send(Message::Binary(JsonFrames.encode(wire)?.into())).await?;
    Ok(())
}

/// Answer one client message. Settlements from the client need no reply.
async fn settle(
    ledger: &SharedLedger,
    codec: &Codec,
    username: &str,
    account: &str,
    wire: WireMessage,
) -> Option<WireMessage> {
    let id = wire.request_id;
    let fail = |kind: ErrorKind, while_fulfilling: bool| {
        codec.encode_error(id, kind, while_fulfilling, account)
    };
    let mut l = ledger.write().await;

    let reply = match wire.packet {
        Packet::Message(items) => answer(&l, &items, username, account, id)
            .unwrap_or_else(|kind| fail(kind, false)),
        Packet::Prepare {
            transfer_id,
            amount,
            execution_condition,
            ..
        } => match prepare(&mut l, username, &transfer_id, &amount) {
            Ok(()) => {
                tracing::info!("{} prepared {} ({})", transfer_id, amount, execution_condition);
                codec.ack(id)
            }
            Err(kind) => fail(kind, false),
        },
        Packet::Fulfill {
            transfer_id,
            fulfillment,
            ..
        } => match l.transfers.get_mut(&transfer_id) {
            Some(t) if t.fulfillment.is_none() => {
                t.fulfillment = Some(fulfillment);
                tracing::info!("{} fulfilled", transfer_id);
                codec.ack(id)
            }
            Some(_) => fail(ErrorKind::AlreadyFulfilled, false),
            None => fail(ErrorKind::NotAccepted, true),
        },
        Packet::Reject { transfer_id, .. } => {
            let fulfilled = l.transfers.get(&transfer_id).map(|t| t.fulfillment.is_some());
            match fulfilled {
                Some(true) => fail(ErrorKind::AlreadyFulfilled, false),
                Some(false) => {
                    if let Some(t) = l.transfers.remove(&transfer_id) {
                        *l.balances.entry(t.sender).or_insert(0) += t.amount;
                    }
                    tracing::info!("{} rolled back", transfer_id);
                    codec.ack(id)
                }
                None => fail(ErrorKind::TransferNotFound, false),
            }
        }
        packet @ (Packet::Ack(_) | Packet::Response(_) | Packet::Error { .. }) => {
            tracing::debug!("{} from {} for {}", packet.type_name(), account, id);
            return None;
        }
    };
    Some(reply)
}

fn answer(
    l: &Ledger,
    items: &[ProtocolData],
    username: &str,
    account: &str,
    id: u32,
) -> Result<WireMessage, ErrorKind> {
    let primary = items.first().ok_or(ErrorKind::InvalidFields)?;
    let data = match (primary.protocol_name.as_str(), primary.data.as_slice()) {
        ("info", [0]) => ProtocolData::text("info", account),
        ("info", [2]) => ProtocolData::json(
            "info",
            &json!({
                "prefix": l.settings.prefix,
                "currencyCode": "USD",
                "currencyScale": 2,
                "connectors": [],
            }),
        ),
        ("balance", _) => {
            let balance = l.balances.get(username).copied().unwrap_or(0);
            ProtocolData::binary("balance", balance.to_be_bytes().to_vec())
        }
        ("get_fulfillment", raw) => {
            let transfer_id: String =
                serde_json::from_slice(raw).map_err(|_| ErrorKind::InvalidFields)?;
            let fulfillment = l
                .transfers
                .get(&transfer_id)
                .and_then(|t| t.fulfillment)
                .ok_or(ErrorKind::TransferNotFound)?;
            ProtocolData::text("get_fulfillment", fulfillment.to_base64url())
        }
        (name, _) => {
            tracing::debug!("Unsupported request {}", name);
            return Err(ErrorKind::NotAccepted);
        }
    };
    Ok(WireMessage {
        request_id: id,
        packet: Packet::Response(vec![data]),
    })
}

fn prepare(l: &mut Ledger, username: &str, transfer_id: &str, amount: &str) -> Result<(), ErrorKind> {
    if l.transfers.contains_key(transfer_id) {
        return Err(ErrorKind::DuplicateId);
    }
    let amount: u64 = amount.parse().map_err(|_| ErrorKind::InvalidFields)?;
    let balance = l.balances.entry(username.to_string()).or_insert(0);
    if *balance < amount {
        return Err(ErrorKind::InsufficientBalance);
    }
    *balance -= amount;
    l.transfers.insert(
        transfer_id.to_string(),
        Prepared {
            sender: username.to_string(),
            amount,
            fulfillment: None,
        },
    );
    Ok(())
}
