//! Length-prefixed postcard frames.
//!
//! Every frame is `[len: u32 LE][tag: u8][postcard payload]`, where `len`
//! counts the tag and payload. The tag repeats the message variant so a
//! reader can route a frame before decoding it; decoders check that the
//! two agree.

use crate::protocol::{
    ClientMessage, ServerMessage, SyncMessage, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
use anyhow::{bail, ensure, Context, Result};
use serde::{de::DeserializeOwned, Serialize};

const HEADER_LEN: usize = 5;

/// Fingerprint of the wire schema, compared during the handshake.
pub fn compute_schema_hash() -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(PROTOCOL_MAGIC);
    hasher.update(&PROTOCOL_VERSION.to_le_bytes());
    for name in ["ActionRequest", "ClientMessage", "SyncMessage", "ServerMessage"] {
        hasher.update(name.as_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

trait Framed: Serialize + DeserializeOwned {
    const NAME: &'static str;

    fn tag(&self) -> u8;
}

impl Framed for ClientMessage {
    const NAME: &'static str = "client message";

    fn tag(&self) -> u8 {
        match self {
            ClientMessage::Open { .. } => 0,
            ClientMessage::Close { .. } => 1,
            ClientMessage::Action(_) => 2,
            ClientMessage::Disconnect => 3,
        }
    }
}

impl Framed for ServerMessage {
    const NAME: &'static str = "server message";

    fn tag(&self) -> u8 {
        match self {
            ServerMessage::Sync(SyncMessage::Full { .. }) => 0,
            ServerMessage::Sync(SyncMessage::Delta { .. }) => 1,
            ServerMessage::CloseAck { .. } => 2,
        }
    }
}

/// Frame a client message.
pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>> {
    encode(msg)
}

/// Frame a server message.
pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>> {
    encode(msg)
}

/// Decode one framed client message; bytes past the frame are ignored.
pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage> {
    decode(data)
}

/// Decode one framed server message; bytes past the frame are ignored.
pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage> {
    decode(data)
}

fn encode<M: Framed>(msg: &M) -> Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(msg).with_context(|| format!("encoding {} payload", M::NAME))?;
    let len = u32::try_from(payload.len() + 1)
        .with_context(|| format!("{} too large to frame", M::NAME))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.push(msg.tag());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode<M: Framed>(data: &[u8]) -> Result<M> {
    if data.len() < HEADER_LEN {
        bail!("{} frame header truncated at {} bytes", M::NAME, data.len());
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let rest = &data[4..];
    ensure!(len > 0, "{} frame is missing its tag", M::NAME);
    ensure!(
        rest.len() >= len,
        "{} frame truncated: need {} body bytes, have {}",
        M::NAME,
        len,
        rest.len()
    );
    let (tag, payload) = (rest[0], &rest[1..len]);
    let msg: M = postcard::from_bytes(payload)
        .with_context(|| format!("decoding {} payload", M::NAME))?;
    ensure!(
        msg.tag() == tag,
        "{} tag {} does not match its payload (tag {})",
        M::NAME,
        tag,
        msg.tag()
    );
    Ok(msg)
}
