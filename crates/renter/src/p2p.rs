use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use libp2p::{
    identity, noise,
    request_response::{
        self, Behaviour as RequestResponse, Codec as RequestResponseCodec,
        Event as RequestResponseEvent, Message as RequestResponseMessage, OutboundRequestId,
    },
    swarm::{NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol,
};
use neuro_market_protocol::{
    ContractAckResponse, InitContractResponse, MarketCommand, MarketReply, MARKET_PROTOCOL,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::{io, sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RenterConfig;
use crate::error::{NegotiationError, RpcError};
use crate::host::peer_id_from_multiaddr;
use crate::registry::ContractRegistry;
use crate::rpc::HostRpc;

const COMMAND_QUEUE: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Largest encoded market request or reply accepted from, or sent to, a peer.
pub const MAX_MARKET_MESSAGE: u64 = 1024 * 1024;

#[derive(Clone, Default)]
pub struct MarketCodec;

async fn read_framed<T, M>(io: &mut T) -> io::Result<M>
where
    T: futures::AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    let mut buf = Vec::new();
    (&mut *io)
        .take(MAX_MARKET_MESSAGE + 1)
        .read_to_end(&mut buf)
        .await?;
    if buf.len() as u64 > MAX_MARKET_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("market message exceeds {MAX_MARKET_MESSAGE} bytes"),
        ));
    }
    bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_framed<T, M>(io: &mut T, message: &M) -> io::Result<()>
where
    T: futures::AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let data =
        bincode::serialize(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if data.len() as u64 > MAX_MARKET_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("market message exceeds {MAX_MARKET_MESSAGE} bytes"),
        ));
    }
    io.write_all(&data).await?;
    io.close().await
}

#[async_trait]
impl RequestResponseCodec for MarketCodec {
    type Protocol = StreamProtocol;
    type Request = MarketCommand;
    type Response = MarketReply;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        read_framed(io).await
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        read_framed(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        request: MarketCommand,
    ) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        write_framed(io, &request).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        response: MarketReply,
    ) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        write_framed(io, &response).await
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "RenterEvent")]
pub struct RenterBehaviour {
    pub market: RequestResponse<MarketCodec>,
}

#[derive(Debug)]
pub enum RenterEvent {
    Market(RequestResponseEvent<MarketCommand, MarketReply>),
}

impl From<RequestResponseEvent<MarketCommand, MarketReply>> for RenterEvent {
    fn from(v: RequestResponseEvent<MarketCommand, MarketReply>) -> Self {
        Self::Market(v)
    }
}

type ReplySender = oneshot::Sender<Result<MarketReply, RpcError>>;

enum TransportCommand {
    Call {
        host: PeerId,
        command: MarketCommand,
        reply: ReplySender,
    },
}

/// [`HostRpc`] backed by a libp2p swarm running on its own task.
#[derive(Clone)]
pub struct Libp2pHostRpc {
    peer_id: PeerId,
    commands: mpsc::Sender<TransportCommand>,
}

impl Libp2pHostRpc {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

#[async_trait]
impl HostRpc for Libp2pHostRpc {
    async fn call(
        &self,
        host: PeerId,
        command: MarketCommand,
        timeout: Duration,
    ) -> Result<MarketReply, RpcError> {
        let route = command.route();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(TransportCommand::Call {
                host,
                command,
                reply,
            })
            .await
            .map_err(|_| RpcError::Shutdown)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Shutdown),
            Err(_) => Err(RpcError::Timeout { route, timeout }),
        }
    }
}

fn build_swarm(keypair: identity::Keypair) -> Result<Swarm<RenterBehaviour>> {
    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| anyhow!("tcp/noise init failed: {e}"))?
        .with_behaviour(|_| RenterBehaviour {
            market: RequestResponse::<MarketCodec>::new(
                std::iter::once((
                    StreamProtocol::new(MARKET_PROTOCOL),
                    request_response::ProtocolSupport::Full,
                )),
                request_response::Config::default().with_request_timeout(REQUEST_TIMEOUT),
            ),
        })
        .map_err(|e| anyhow!("renter behaviour init failed: {e}"))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();
    Ok(swarm)
}

/// Starts the renter's market transport on `config.listen` and dials every configured host
/// that carries an address. Host acknowledgements arriving on the market protocol are
/// delivered into `registry`. The driver stops when `shutdown` fires.
pub fn spawn_transport(
    keypair: identity::Keypair,
    config: &RenterConfig,
    registry: Arc<dyn ContractRegistry>,
    shutdown: CancellationToken,
) -> Result<(Libp2pHostRpc, JoinHandle<()>)> {
    let listen = config.listen_addr()?;
    let peer_id = keypair.public().to_peer_id();
    let mut swarm = build_swarm(keypair)?;
    swarm.listen_on(listen)?;

    for addr in &config.hosts {
        // Bare peer ids carry no address to dial.
        let Ok(ma) = addr.trim().parse::<Multiaddr>() else {
            continue;
        };
        let Some(host) = peer_id_from_multiaddr(&ma) else {
            warn!(addr = %ma, "Host address has no /p2p/ component, skipping");
            continue;
        };
        swarm.behaviour_mut().market.add_address(&host, ma.clone());
        if let Err(e) = swarm.dial(ma.clone()) {
            warn!(peer = %host, error = %e, "Initial host dial failed");
        }
    }

    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let handle = tokio::spawn(drive_transport(swarm, rx, registry, shutdown));
    info!(peer = %peer_id, "Renter market transport started");
    Ok((
        Libp2pHostRpc {
            peer_id,
            commands: tx,
        },
        handle,
    ))
}

async fn drive_transport(
    mut swarm: Swarm<RenterBehaviour>,
    mut commands: mpsc::Receiver<TransportCommand>,
    registry: Arc<dyn ContractRegistry>,
    shutdown: CancellationToken,
) {
    let mut pending: HashMap<OutboundRequestId, (&'static str, ReplySender)> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping market transport");
                break;
            }
            Some(command) = commands.recv() => match command {
                TransportCommand::Call { host, command, reply } => {
                    let route = command.route();
                    let request_id = swarm.behaviour_mut().market.send_request(&host, command);
                    debug!(peer = %host, route, "Market request sent");
                    pending.insert(request_id, (route, reply));
                }
            },
            event = swarm.select_next_some() => match event {
                SwarmEvent::Behaviour(RenterEvent::Market(event)) => match event {
                    RequestResponseEvent::Message { peer, message, .. } => match message {
                        RequestResponseMessage::Request { request, channel, .. } => {
                            let response = handle_inbound(registry.as_ref(), peer, request);
                            if swarm.behaviour_mut().market.send_response(channel, response).is_err() {
                                debug!(peer = %peer, "Inbound market channel closed before reply");
                            }
                        }
                        RequestResponseMessage::Response { request_id, response } => {
                            if let Some((_, reply)) = pending.remove(&request_id) {
                                let _ = reply.send(Ok(response));
                            }
                        }
                    },
                    RequestResponseEvent::OutboundFailure { peer, request_id, error, .. } => {
                        warn!(peer = %peer, error = %error, "Market outbound failure");
                        if let Some((route, reply)) = pending.remove(&request_id) {
                            let _ = reply.send(Err(RpcError::Failed {
                                route,
                                reason: error.to_string(),
                            }));
                        }
                    }
                    RequestResponseEvent::InboundFailure { peer, error, .. } => {
                        warn!(peer = %peer, error = %error, "Market inbound failure");
                    }
                    RequestResponseEvent::ResponseSent { peer, .. } => {
                        debug!(peer = %peer, "Market response sent");
                    }
                },
                SwarmEvent::NewListenAddr { address, .. } => {
                    info!(address = %address, "Listening");
                }
                SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                    info!(peer = %peer_id, endpoint = ?endpoint, "Connection established");
                }
                SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                    info!(peer = %peer_id, cause = ?cause, "Connection closed");
                }
                SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                    warn!(peer = ?peer_id, error = ?error, "Outgoing connection error");
                }
                _ => {}
            }
        }
    }

    for (_, (_, reply)) in pending.drain() {
        let _ = reply.send(Err(RpcError::Shutdown));
    }
}

/// Answers a request a host sent to this renter.
pub fn handle_inbound(
    registry: &dyn ContractRegistry,
    peer: PeerId,
    command: MarketCommand,
) -> MarketReply {
    match command {
        MarketCommand::ContractAck(ack) => {
            let contract_id = ack.contract_id.clone();
            let session_id = ack.session_id.clone();
            let result = ack.into_result().map_err(|reason| NegotiationError::Rejected {
                contract_id: contract_id.clone(),
                reason,
            });
            let accepted = result.is_ok();
            let delivered = registry.deliver(&contract_id, result);
            info!(
                peer = %peer,
                session = %session_id,
                contract = %contract_id,
                accepted,
                delivered,
                "Contract acknowledgement received"
            );
            MarketReply::ContractAck(ContractAckResponse { delivered })
        }
        MarketCommand::SupportTokens => MarketReply::SupportTokens(BTreeMap::new()),
        MarketCommand::InitContract(req) => {
            debug!(peer = %peer, session = %req.session_id, "Refusing contract push to a renter");
            MarketReply::InitContract(InitContractResponse {
                accepted: false,
                reason: Some("peer is a renter and does not host shards".to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryContractRegistry;
    use neuro_market_protocol::{ContractAck, InitContractRequest, TokenAddress, SUPPORT_TOKENS_ROUTE};

    fn ack(contract_id: &str, accepted: bool, reason: Option<&str>) -> MarketCommand {
        MarketCommand::ContractAck(ContractAck {
            session_id: "ss-1".to_string(),
            contract_id: contract_id.to_string(),
            shard_hash: "h".to_string(),
            accepted,
            reason: reason.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn accepted_ack_reaches_waiter() {
        let registry = InMemoryContractRegistry::new();
        let rx = registry.register("c-1");
        let reply = handle_inbound(&registry, PeerId::random(), ack("c-1", true, None));
        assert!(matches!(reply, MarketReply::ContractAck(ContractAckResponse { delivered: true })));
        assert!(rx.await.unwrap().is_ok());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn refused_ack_carries_host_reason() {
        let registry = InMemoryContractRegistry::new();
        let rx = registry.register("c-2");
        handle_inbound(&registry, PeerId::random(), ack("c-2", false, Some("disk full")));
        match rx.await.unwrap() {
            Err(NegotiationError::Rejected { contract_id, reason }) => {
                assert_eq!(contract_id, "c-2");
                assert_eq!(reason, "disk full");
            }
            other => panic!("unexpected ack result: {other:?}"),
        }
    }

    #[test]
    fn ack_for_unknown_contract_is_not_delivered() {
        let registry = InMemoryContractRegistry::new();
        let reply = handle_inbound(&registry, PeerId::random(), ack("stale", true, None));
        assert!(matches!(reply, MarketReply::ContractAck(ContractAckResponse { delivered: false })));
    }

    #[test]
    fn renter_refuses_to_host() {
        let registry = InMemoryContractRegistry::new();
        match handle_inbound(&registry, PeerId::random(), MarketCommand::SupportTokens) {
            MarketReply::SupportTokens(tokens) => assert!(tokens.is_empty()),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn codec_frames_commands_with_bincode() {
        let mut codec = MarketCodec;
        let protocol = StreamProtocol::new(MARKET_PROTOCOL);
        let mut wire = futures::io::Cursor::new(Vec::new());
        codec
            .write_request(&protocol, &mut wire, ack("c-9", true, None))
            .await
            .unwrap();

        let mut reader = futures::io::Cursor::new(wire.into_inner());
        match codec.read_request(&protocol, &mut reader).await.unwrap() {
            MarketCommand::ContractAck(ack) => assert_eq!(ack.contract_id, "c-9"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn codec_rejects_oversized_frames() {
        let mut codec = MarketCodec;
        let protocol = StreamProtocol::new(MARKET_PROTOCOL);

        let mut reader =
            futures::io::Cursor::new(vec![0u8; MAX_MARKET_MESSAGE as usize + 16]);
        let err = codec.read_request(&protocol, &mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("exceeds"));

        let mut wire = futures::io::Cursor::new(Vec::new());
        let err = codec
            .write_request(
                &protocol,
                &mut wire,
                init_contract(vec![7u8; MAX_MARKET_MESSAGE as usize]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(wire.into_inner().is_empty());
    }

    fn init_contract(contract: Vec<u8>) -> MarketCommand {
        MarketCommand::InitContract(InitContractRequest {
            session_id: "ss-1".to_string(),
            file_hash: "f".to_string(),
            shard_hash: "h".to_string(),
            price: 250,
            contract,
            storage_length: 30,
            shard_size: 1024,
            shard_index: 0,
            renter_id: "r".to_string(),
        })
    }

    /// Minimal host: advertises one token, accepts every pushed contract and
    /// acknowledges it back to the renter using the contract bytes as its id.
    async fn run_host(mut swarm: Swarm<RenterBehaviour>, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                event = swarm.select_next_some() => {
                    let SwarmEvent::Behaviour(RenterEvent::Market(RequestResponseEvent::Message {
                        peer,
                        message: RequestResponseMessage::Request { request, channel, .. },
                        ..
                    })) = event else {
                        continue;
                    };
                    let reply = match request {
                        MarketCommand::SupportTokens => MarketReply::SupportTokens(BTreeMap::from([(
                            "usdt".to_string(),
                            TokenAddress::new("0xToken"),
                        )])),
                        MarketCommand::InitContract(req) => {
                            let ack = ContractAck {
                                session_id: req.session_id.clone(),
                                contract_id: String::from_utf8_lossy(&req.contract).into_owned(),
                                shard_hash: req.shard_hash.clone(),
                                accepted: true,
                                reason: None,
                            };
                            swarm
                                .behaviour_mut()
                                .market
                                .send_request(&peer, MarketCommand::ContractAck(ack));
                            MarketReply::InitContract(InitContractResponse {
                                accepted: true,
                                reason: None,
                            })
                        }
                        MarketCommand::ContractAck(_) => {
                            MarketReply::ContractAck(ContractAckResponse { delivered: false })
                        }
                    };
                    let _ = swarm.behaviour_mut().market.send_response(channel, reply);
                }
            }
        }
    }

    #[tokio::test]
    async fn transport_talks_to_a_host_over_tcp() {
        let scenario = async {
            let host_key = identity::Keypair::generate_ed25519();
            let host_peer = host_key.public().to_peer_id();
            let mut host = build_swarm(host_key).unwrap();
            host.listen_on("/ip4/127.0.0.1/tcp/0".parse().unwrap()).unwrap();
            let host_addr = loop {
                if let SwarmEvent::NewListenAddr { address, .. } = host.select_next_some().await {
                    break address;
                }
            };
            let host_stop = CancellationToken::new();
            let host_task = tokio::spawn(run_host(host, host_stop.clone()));

            let config = RenterConfig {
                listen: "/ip4/127.0.0.1/tcp/0".to_string(),
                hosts: vec![format!("{host_addr}/p2p/{host_peer}")],
                ..RenterConfig::default()
            };
            let registry = Arc::new(InMemoryContractRegistry::new());
            let shutdown = CancellationToken::new();
            let (rpc, driver) = spawn_transport(
                identity::Keypair::generate_ed25519(),
                &config,
                registry.clone(),
                shutdown.clone(),
            )
            .unwrap();
            let timeout = Duration::from_secs(10);

            match rpc.call(host_peer, MarketCommand::SupportTokens, timeout).await {
                Ok(MarketReply::SupportTokens(tokens)) => {
                    assert_eq!(tokens.get("usdt"), Some(&TokenAddress::new("0xToken")));
                }
                other => panic!("unexpected token reply: {other:?}"),
            }

            let ack_rx = registry.register("c-77");
            match rpc.call(host_peer, init_contract(b"c-77".to_vec()), timeout).await {
                Ok(MarketReply::InitContract(resp)) => assert!(resp.accepted),
                other => panic!("unexpected push reply: {other:?}"),
            }
            assert!(ack_rx.await.unwrap().is_ok());
            assert!(registry.is_empty());

            let err = rpc
                .call(PeerId::random(), MarketCommand::SupportTokens, timeout)
                .await
                .unwrap_err();
            assert!(
                matches!(err, RpcError::Failed { route, .. } if route == SUPPORT_TOKENS_ROUTE),
                "{err:?}"
            );

            shutdown.cancel();
            driver.await.unwrap();
            let err = rpc
                .call(host_peer, MarketCommand::SupportTokens, timeout)
                .await
                .unwrap_err();
            assert!(matches!(err, RpcError::Shutdown), "{err:?}");

            host_stop.cancel();
            host_task.await.unwrap();
        };
        tokio::time::timeout(Duration::from_secs(60), scenario)
            .await
            .expect("transport scenario stalled");
    }
}
