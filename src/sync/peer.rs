use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bitcoin::{
    Block, BlockHash, VarInt,
    block::Header,
    consensus::{self, Decodable, Encodable, ReadExt, encode},
    hashes::Hash,
    io,
    key::rand::Rng,
    p2p::{
        Address, Magic, ServiceFlags,
        message::{CommandString, NetworkMessage, RawNetworkMessage},
        message_blockdata::{GetHeadersMessage, Inventory},
        message_network::VersionMessage,
    },
    secp256k1,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Notify, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace};

const PROTOCOL_VERSION: u32 = 70016;
const USER_AGENT: &str = concat!("/maestro-ledger:", env!("CARGO_PKG_VERSION"), "/");
const SERVICES: ServiceFlags = ServiceFlags::NONE;
const KEEPALIVE: Duration = Duration::from_secs(20);

/// Messages relayed from the peer before the block payloads are decoded
#[derive(Debug)]
enum Inbound {
    Version(Box<VersionMessage>),
    Verack,
    Ping(u64),
    Inv(Vec<Inventory>),
    Headers(Vec<Header>),
    Block(Vec<u8>),
    Ignored,
}

fn version_message() -> NetworkMessage {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();

    NetworkMessage::Version(VersionMessage {
        version: PROTOCOL_VERSION,
        services: SERVICES,
        timestamp,
        receiver: Address::new(&addr, SERVICES),
        sender: Address::new(&addr, SERVICES),
        nonce: secp256k1::rand::thread_rng().r#gen(),
        user_agent: USER_AGENT.into(),
        start_height: 0,
        relay: false,
    })
}

impl Decodable for Inbound {
    fn consensus_decode<D: io::Read + ?Sized>(d: &mut D) -> Result<Self, encode::Error> {
        let _magic: Magic = Decodable::consensus_decode(d)?;
        let command = CommandString::consensus_decode(d)?;
        let len = u32::consensus_decode(d)?;
        let _checksum = <[u8; 4]>::consensus_decode(d)?;

        let mut payload = vec![0u8; len as usize];
        d.read_slice(&mut payload)?;
        let payload = &mut &payload[..];

        let message = match command.as_ref() {
            "version" => Inbound::Version(Box::new(Decodable::consensus_decode(payload)?)),
            "verack" => Inbound::Verack,
            "ping" => Inbound::Ping(Decodable::consensus_decode(payload)?),
            "inv" => Inbound::Inv(Decodable::consensus_decode(payload)?),
            "headers" => {
                let count = VarInt::consensus_decode(payload)?.0 as usize;
                let mut headers = Vec::with_capacity(count.min(2_000));

                for _ in 0..count {
                    headers.push(Decodable::consensus_decode(payload)?);
                    // always zero transactions
                    let _: VarInt = Decodable::consensus_decode(payload)?;
                }

                Inbound::Headers(headers)
            }
            // decoded by the requester so it can be checked against the request
            "block" => Inbound::Block(payload.to_vec()),
            _ => Inbound::Ignored,
        };

        Ok(message)
    }
}

#[derive(Debug, Error)]
pub enum P2PError {
    #[error("error connecting to peer")]
    ConnectFailure(#[source] tokio::io::Error),

    #[error("error reading from peer")]
    IngressIO(#[source] std::io::Error),

    #[error("ingress relay closed")]
    IngressChannelClosed,

    #[error("error decoding peer message")]
    IngressDecoding(#[source] consensus::encode::Error),

    #[error("error writing to peer")]
    EgressIO(#[source] std::io::Error),

    #[error("egress relay closed")]
    EgressChannelClosed,

    #[error("peer {0} channel closed")]
    PeerChannelClosed(String),

    #[error("requested block {0} but received {1}")]
    GetBlocksMismatch(BlockHash, BlockHash),

    #[error("peer disconnected")]
    Disconnected,
}

#[derive(Debug)]
enum Request {
    Headers(GetHeadersMessage),
    Blocks(Vec<Inventory>),
}

impl Request {
    // https://en.bitcoin.it/wiki/Protocol_documentation#getheaders
    fn headers(locator: Vec<BlockHash>) -> Self {
        Self::Headers(GetHeadersMessage::new(locator, BlockHash::all_zeros()))
    }

    // https://en.bitcoin.it/wiki/Protocol_documentation#getdata
    fn blocks(hashes: &[BlockHash]) -> Self {
        Self::Blocks(hashes.iter().copied().map(Inventory::WitnessBlock).collect())
    }
}

/// Session with a single node over the bitcoin p2p protocol
pub struct Peer {
    request_send: mpsc::Sender<Request>,
    headers_recv: mpsc::Receiver<Vec<Header>>,
    blocks_recv: mpsc::Receiver<Vec<u8>>,
    /// Signalled when the peer announces a block
    pub new_block_notification: Arc<Notify>,
    handler: Option<JoinHandle<()>>,
}

impl Peer {
    pub async fn connect<A: ToSocketAddrs>(addr: A, magic: Magic) -> Result<Self, P2PError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(P2PError::ConnectFailure)?;

        let sock_ref = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(KEEPALIVE)
            .with_interval(KEEPALIVE);

        sock_ref
            .set_tcp_keepalive(&keepalive)
            .map_err(P2PError::ConnectFailure)?;
        sock_ref
            .set_tcp_nodelay(true)
            .map_err(P2PError::ConnectFailure)?;

        let (request_send, request_recv) = mpsc::channel(1);
        let (headers_send, headers_recv) = mpsc::channel(20);
        let (blocks_send, blocks_recv) = mpsc::channel(20);

        // signalled once the version handshake completed
        let handshake = Arc::new(Notify::new());
        let new_block = Arc::new(Notify::new());

        let mut handler = PeerHandler::new(
            magic,
            stream,
            request_recv,
            handshake.clone(),
            headers_send,
            blocks_send,
            new_block.clone(),
        );

        let handler = tokio::spawn(async move {
            if let Err(e) = handler.run().await {
                error!("peer handler stopped: {e:?}");
            }
        });

        handshake.notified().await;

        Ok(Self {
            request_send,
            headers_recv,
            blocks_recv,
            new_block_notification: new_block,
            handler: Some(handler),
        })
    }

    async fn request(&self, request: Request) -> Result<(), P2PError> {
        if self.handler.is_none() {
            return Err(P2PError::Disconnected);
        }

        self.request_send
            .send(request)
            .await
            .map_err(|_| P2PError::EgressChannelClosed)
    }

    /// Headers following the first hash of `locator` known to the peer, at most 2000
    pub async fn get_new_headers(
        &mut self,
        locator: Vec<BlockHash>,
    ) -> Result<Vec<Header>, P2PError> {
        trace!("requesting headers from {:?}", locator.first());

        self.request(Request::headers(locator)).await?;

        self.headers_recv
            .recv()
            .await
            .ok_or(P2PError::PeerChannelClosed("headers".into()))
    }

    /// Blocks for `hashes`, in the same order
    pub async fn get_blocks(&mut self, hashes: Vec<BlockHash>) -> Result<Vec<Block>, P2PError> {
        trace!("requesting {} blocks", hashes.len());

        self.request(Request::blocks(&hashes)).await?;

        let mut raw_blocks = Vec::with_capacity(hashes.len());

        for _ in &hashes {
            let raw = self
                .blocks_recv
                .recv()
                .await
                .ok_or(P2PError::PeerChannelClosed("blocks".into()))?;

            raw_blocks.push(raw);
        }

        let mut blocks = Vec::with_capacity(hashes.len());

        for (hash, raw) in hashes.into_iter().zip(raw_blocks) {
            let block = Block::consensus_decode_from_finite_reader(&mut &raw[..])
                .map_err(P2PError::IngressDecoding)?;

            if block.block_hash() != hash {
                return Err(P2PError::GetBlocksMismatch(hash, block.block_hash()));
            }

            blocks.push(block);
        }

        Ok(blocks)
    }

    /// Stop the session, idempotent
    pub fn disconnect(&mut self) {
        if let Some(handler) = self.handler.take() {
            debug!("disconnecting from peer");
            handler.abort();
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct Ingress {
    stream_read: OwnedReadHalf,
    relay: mpsc::Sender<Inbound>,
}

impl Ingress {
    async fn read_message(&mut self) -> Result<Inbound, P2PError> {
        let mut header = [0u8; 24];
        self.stream_read
            .read_exact(&mut header)
            .await
            .map_err(P2PError::IngressIO)?;

        let payload_len = u32::consensus_decode_from_finite_reader(&mut &header[16..20])
            .map_err(P2PError::IngressDecoding)?;

        let mut message = header.to_vec();
        message.resize(24 + payload_len as usize, 0);

        self.stream_read
            .read_exact(&mut message[24..])
            .await
            .map_err(P2PError::IngressIO)?;

        Decodable::consensus_decode(&mut &message[..]).map_err(P2PError::IngressDecoding)
    }

    async fn run(mut self) -> Result<(), P2PError> {
        loop {
            let message = self.read_message().await?;

            self.relay
                .send(message)
                .await
                .map_err(|_| P2PError::IngressChannelClosed)?;
        }
    }
}

struct Egress {
    stream_write: OwnedWriteHalf,
    outbox: mpsc::Receiver<RawNetworkMessage>,
}

impl Egress {
    async fn write_message(&mut self, msg: RawNetworkMessage) -> Result<(), std::io::Error> {
        let mut buf = vec![];
        msg.consensus_encode(&mut buf)?;

        self.stream_write.write_all(&buf).await?;
        self.stream_write.flush().await
    }

    async fn run(mut self) -> Result<(), P2PError> {
        while let Some(msg) = self.outbox.recv().await {
            self.write_message(msg).await.map_err(P2PError::EgressIO)?;
        }

        Err(P2PError::EgressChannelClosed)
    }
}

struct PeerHandler {
    magic: Magic,
    requests: mpsc::Receiver<Request>,
    handshake: Arc<Notify>,
    headers_send: mpsc::Sender<Vec<Header>>,
    blocks_send: mpsc::Sender<Vec<u8>>,
    new_block: Arc<Notify>,
    ingress: JoinHandle<Result<(), P2PError>>,
    inbox: mpsc::Receiver<Inbound>,
    egress: JoinHandle<Result<(), P2PError>>,
    outbox: mpsc::Sender<RawNetworkMessage>,
}

impl PeerHandler {
    fn new(
        magic: Magic,
        stream: TcpStream,
        requests: mpsc::Receiver<Request>,
        handshake: Arc<Notify>,
        headers_send: mpsc::Sender<Vec<Header>>,
        blocks_send: mpsc::Sender<Vec<u8>>,
        new_block: Arc<Notify>,
    ) -> Self {
        let (stream_read, stream_write) = stream.into_split();

        let (inbox_send, inbox) = mpsc::channel(1);
        let (outbox, outbox_recv) = mpsc::channel(1);

        let ingress = tokio::spawn(
            Ingress {
                stream_read,
                relay: inbox_send,
            }
            .run(),
        );
        let egress = tokio::spawn(
            Egress {
                stream_write,
                outbox: outbox_recv,
            }
            .run(),
        );

        Self {
            magic,
            requests,
            handshake,
            headers_send,
            blocks_send,
            new_block,
            ingress,
            inbox,
            egress,
            outbox,
        }
    }

    async fn send(&self, message: NetworkMessage) -> Result<(), P2PError> {
        self.outbox
            .send(RawNetworkMessage::new(self.magic, message))
            .await
            .map_err(|_| P2PError::EgressChannelClosed)
    }

    async fn handle(&self, message: Inbound) -> Result<(), P2PError> {
        match message {
            Inbound::Version(version) => {
                info!(
                    agent = %version.user_agent,
                    height = version.start_height,
                    "peer reported version, acknowledging"
                );
                self.send(NetworkMessage::Verack).await?;
            }
            Inbound::Verack => {
                trace!("handshake complete");
                self.handshake.notify_one();
            }
            Inbound::Inv(inv) => {
                if inv.iter().any(|i| matches!(i, Inventory::Block(_))) {
                    trace!("peer announced a block");
                    self.new_block.notify_one();
                }
            }
            Inbound::Ping(nonce) => self.send(NetworkMessage::Pong(nonce)).await?,
            Inbound::Headers(headers) => {
                trace!("peer sent {} headers", headers.len());
                self.headers_send
                    .send(headers)
                    .await
                    .map_err(|_| P2PError::PeerChannelClosed("headers".into()))?;
            }
            Inbound::Block(raw) => {
                self.blocks_send
                    .send(raw)
                    .await
                    .map_err(|_| P2PError::PeerChannelClosed("blocks".into()))?;
            }
            Inbound::Ignored => (),
        }

        Ok(())
    }

    async fn tick(&mut self) -> Result<(), P2PError> {
        select! {
            request = self.requests.recv() => {
                let message = match request.ok_or(P2PError::PeerChannelClosed("request".into()))? {
                    Request::Headers(msg) => NetworkMessage::GetHeaders(msg),
                    Request::Blocks(inv) => NetworkMessage::GetData(inv),
                };

                self.send(message).await
            }
            message = self.inbox.recv() => {
                let message = message.ok_or(P2PError::IngressChannelClosed)?;

                self.handle(message).await
            }
        }
    }

    async fn run(&mut self) -> Result<(), P2PError> {
        info!("sending version message to peer");

        self.send(version_message()).await?;

        let result = loop {
            if let Err(e) = self.tick().await {
                break Err(e);
            }
        };

        self.ingress.abort();
        self.egress.abort();

        result
    }
}

impl Drop for PeerHandler {
    fn drop(&mut self) {
        self.ingress.abort();
        self.egress.abort();
    }
}
