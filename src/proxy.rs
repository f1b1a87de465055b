//! Proxy engine: accepts clients, dials the target for each one, and relays LDAP
//! messages both ways. Intercepted requests are rewritten on the way to the target;
//! responses are never modified.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::client::TlsStream;
use tracing::{debug, error, info};

use crate::ber::{complete_element_len, declared_element_len, decode_integer};
use crate::config_source::{ConfigSnapshot, LiveConfig};
use crate::cookies::SearchCookieTracker;
use crate::error::{CodecResult, ProxyError};
use crate::ldap_protocol::{
    encode_add_request, encode_del_request, encode_ldap_message, encode_modify_dn_request,
    encode_modify_request, encode_search_request, get_paged_results_control, parse_add_request,
    parse_del_request, parse_ldap_message, parse_ldap_message_header, parse_modify_dn_request,
    parse_modify_request, parse_search_request, set_paged_results_cookie, AddRequest, DelRequest,
    InterceptedOp, LdapMessage, ModifyChange, ModifyDnRequest, ModifyRequest, SearchRequest,
    LDAP_TAG_ABANDON_REQUEST, LDAP_TAG_SEARCH_RESULT_DONE,
};
use crate::metrics::{Direction, TrafficStats};
use crate::middleware::ObfuscationContext;
use crate::observer::ProxyObserver;
use crate::tls;

/// Connection to the target: plain TCP (ldap://) or TLS (ldaps://).
pub enum TargetStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for TargetStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TargetStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            TargetStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TargetStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            TargetStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            TargetStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TargetStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            TargetStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TargetStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            TargetStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Parse ldap://host:port or ldaps://host:port into a bind address. `ldap://:port` binds all interfaces.
pub fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    let url = url
        .strip_prefix("ldap://")
        .or_else(|| url.strip_prefix("ldaps://"))
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap:// or ldaps://"))?;
    let url = url.trim_start_matches('/');

    if let Some(port) = url.strip_prefix(':') {
        let port: u16 = port.parse().context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl TargetEndpoint {
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parse the target URL. The port defaults to 389 for ldap:// and 636 for ldaps://.
pub fn parse_target_url(url: &str) -> Result<TargetEndpoint> {
    let (rest, tls) = if let Some(rest) = url.strip_prefix("ldaps://") {
        (rest, true)
    } else if let Some(rest) = url.strip_prefix("ldap://") {
        (rest, false)
    } else {
        anyhow::bail!("Invalid target URL scheme, expected ldap:// or ldaps://: {}", url);
    };
    let rest = rest.trim_start_matches('/').trim_end_matches('/');
    let default_port = if tls { 636 } else { 389 };

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if !rest.ends_with(']') => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid port in target URL: {}", url))?;
            (host, port)
        }
        _ => (rest, default_port),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        anyhow::bail!("Missing host in target URL: {}", url);
    }
    Ok(TargetEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

async fn connect_target(endpoint: &TargetEndpoint, tls_config: Arc<ClientConfig>) -> Result<TargetStream, ProxyError> {
    let addr = endpoint.addr();
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|source| ProxyError::Connect {
            addr: addr.clone(),
            source,
        })?;
    if endpoint.tls {
        Ok(TargetStream::Tls(tls::connect(tcp, &endpoint.host, tls_config).await?))
    } else {
        Ok(TargetStream::Tcp(tcp))
    }
}

/// Read one complete BER element of at most `max` bytes. `Ok(None)` on a clean end of stream.
async fn read_packet<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    side: &'static str,
    max: usize,
) -> Result<Option<Vec<u8>>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(len) = complete_element_len(&buf[..])? {
            if len > max {
                return Err(ProxyError::FrameTooLarge { side, len, max });
            }
            return Ok(Some(buf.split_to(len).to_vec()));
        }
        if let Some(len) = declared_element_len(&buf[..])?.filter(|&len| len > max) {
            return Err(ProxyError::FrameTooLarge { side, len, max });
        }
        if reader.read_buf(buf).await? == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(ProxyError::Closed(side))
            };
        }
    }
}

/// Per-connection generator: reproducible from the configured seed, fresh entropy otherwise.
fn session_rng(seed: Option<u64>, conn_id: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(conn_id)),
        None => StdRng::from_entropy(),
    }
}

/// State shared by the two pumps of one client connection.
struct Session {
    conn_id: u64,
    live: LiveConfig,
    stats: Arc<TrafficStats>,
    observer: Arc<dyn ProxyObserver>,
    cookies: SearchCookieTracker,
    max_message_size: usize,
}

impl Session {
    /// Bytes to forward for one client packet. Anything that is not an enabled,
    /// decodable intercepted request goes out exactly as it came in.
    fn process_request(&self, packet: Vec<u8>, rng: &mut dyn RngCore) -> Vec<u8> {
        let Ok((message_id, tag)) = parse_ldap_message_header(&packet) else {
            return packet;
        };
        if tag == LDAP_TAG_ABANDON_REQUEST {
            self.forget_abandoned(&packet);
        }
        let Some(op) = InterceptedOp::from_tag(tag) else {
            return packet;
        };
        let snapshot = self.live.snapshot();
        if !snapshot.config.intercept.is_enabled(op) {
            return packet;
        }

        self.observer.on_intercept(self.conn_id, op, message_id);
        match self.rewrite(op, &packet, &snapshot, rng) {
            Ok(rewritten) => {
                self.stats.record_intercept(op);
                rewritten
            }
            Err(e) => {
                self.observer.on_rewrite_error(self.conn_id, op, message_id, &e);
                self.stats.record_rewrite_error();
                packet
            }
        }
    }

    fn rewrite(
        &self,
        op: InterceptedOp,
        packet: &[u8],
        snapshot: &ConfigSnapshot,
        rng: &mut dyn RngCore,
    ) -> CodecResult<Vec<u8>> {
        let mut message = parse_ldap_message(packet)?;
        let chains = &snapshot.chains;
        let verbose = snapshot.config.verbose;
        let mut ctx = ObfuscationContext {
            rng,
            tables: &snapshot.tables,
            observer: self.observer.as_ref(),
        };

        let op_body = match op {
            InterceptedOp::Search => return self.rewrite_search(message, snapshot, &mut ctx),
            InterceptedOp::Modify => {
                let req = parse_modify_request(&message.op_body)?;
                let object = chains.basedn.execute(req.object, &mut ctx, verbose);
                // One chain run per change keeps each operation paired with its attribute.
                let mut changes = Vec::with_capacity(req.changes.len());
                for change in req.changes {
                    let operation = change.operation;
                    let entries = chains
                        .attr_entries
                        .execute(vec![change.modification], &mut ctx, verbose);
                    changes.extend(
                        entries
                            .into_iter()
                            .map(|modification| ModifyChange { operation, modification }),
                    );
                }
                encode_modify_request(&ModifyRequest { object, changes })
            }
            InterceptedOp::Add => {
                let req = parse_add_request(&message.op_body)?;
                let entry = chains.basedn.execute(req.entry, &mut ctx, verbose);
                let attributes = chains.attr_entries.execute(req.attributes, &mut ctx, verbose);
                encode_add_request(&AddRequest { entry, attributes })
            }
            InterceptedOp::Delete => {
                let req = parse_del_request(&message.op_body)?;
                let entry = chains.basedn.execute(req.entry, &mut ctx, verbose);
                encode_del_request(&DelRequest { entry })
            }
            InterceptedOp::ModifyDn => {
                let ModifyDnRequest {
                    entry,
                    new_rdn,
                    delete_old_rdn,
                    new_superior,
                } = parse_modify_dn_request(&message.op_body)?;
                let entry = chains.basedn.execute(entry, &mut ctx, verbose);
                let new_superior = new_superior.map(|dn| chains.basedn.execute(dn, &mut ctx, verbose));
                encode_modify_dn_request(&ModifyDnRequest {
                    entry,
                    new_rdn,
                    delete_old_rdn,
                    new_superior,
                })
            }
        };
        message.op_body = op_body;
        Ok(encode_ldap_message(&message))
    }

    /// Search rewrite with paging continuity: a follow-up page of a tracked search
    /// replays the first page's rewritten request with the server's cookie.
    fn rewrite_search(
        &self,
        mut message: LdapMessage,
        snapshot: &ConfigSnapshot,
        ctx: &mut ObfuscationContext<'_>,
    ) -> CodecResult<Vec<u8>> {
        let request = parse_search_request(&message.op_body)?;
        let paged = if snapshot.config.paging.track_cookies {
            get_paged_results_control(message.controls.as_deref())
        } else {
            None
        };
        let signature = request.signature();

        if let Some(cookie) = paged.as_ref().map(|p| &p.cookie).filter(|c| !c.is_empty()) {
            match self.cookies.lookup(cookie, &signature) {
                Some(page) => {
                    set_paged_results_cookie(&mut message, &page.cookie);
                    self.observer.on_cookie_reinjected(self.conn_id, message.message_id);
                    if let Some(previous) = page.request {
                        message.op_body = encode_search_request(&previous)?;
                        self.cookies.record_request(message.message_id, signature, previous);
                        return Ok(encode_ldap_message(&message));
                    }
                }
                None => debug!(
                    conn_id = self.conn_id,
                    message_id = message.message_id,
                    "Paging cookie not tracked, forwarding it as sent"
                ),
            }
        }

        let chains = &snapshot.chains;
        let verbose = snapshot.config.verbose;
        let rewritten = SearchRequest {
            base_object: chains.basedn.execute(request.base_object, ctx, verbose),
            filter: chains.filter.execute(request.filter, ctx, verbose),
            attributes: chains.attr_list.execute(request.attributes, ctx, verbose),
            ..request
        };
        message.op_body = encode_search_request(&rewritten)?;
        if paged.is_some() {
            self.cookies.record_request(message.message_id, signature, rewritten);
        }
        Ok(encode_ldap_message(&message))
    }

    fn forget_abandoned(&self, packet: &[u8]) {
        let abandoned = parse_ldap_message(packet)
            .and_then(|m| decode_integer(&m.op_body))
            .ok()
            .and_then(|id| i32::try_from(id).ok());
        if let Some(id) = abandoned {
            self.cookies.forget(id);
        }
    }

    /// Pick the server cookie out of a SearchResultDone for a tracked paged search.
    fn observe_response(&self, packet: &[u8]) {
        if self.cookies.pending_len() == 0 {
            return;
        }
        let Ok((message_id, LDAP_TAG_SEARCH_RESULT_DONE)) = parse_ldap_message_header(packet) else {
            return;
        };
        let cookie = parse_ldap_message(packet)
            .ok()
            .and_then(|m| get_paged_results_control(m.controls.as_deref()))
            .map(|p| p.cookie);
        match cookie {
            Some(cookie) => {
                self.cookies.on_response(message_id, &cookie);
            }
            None => self.cookies.forget(message_id),
        }
    }
}

/// Client -> target. Owns the session's generator; only this direction rewrites.
async fn forward_pump<R, W>(
    mut reader: R,
    mut writer: W,
    session: Arc<Session>,
    mut rng: StdRng,
    done: Arc<watch::Sender<bool>>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stop = done.subscribe();
    let mut buf = BytesMut::with_capacity(4096);
    let result: Result<(), ProxyError> = async {
        loop {
            if *stop.borrow() {
                return Ok(());
            }
            let packet = tokio::select! {
                packet = read_packet(&mut reader, &mut buf, "client", session.max_message_size) => packet?,
                _ = stop.changed() => return Ok(()),
            };
            let Some(packet) = packet else {
                debug!(conn_id = session.conn_id, "Client disconnected");
                return Ok(());
            };
            let outgoing = session.process_request(packet, &mut rng);
            writer.write_all(&outgoing).await?;
            writer.flush().await?;
            session.stats.record_packet(Direction::Sent, outgoing.len());
        }
    }
    .await;
    done.send_replace(true);
    result
}

/// Target -> client, byte for byte.
async fn reverse_pump<R, W>(
    mut reader: R,
    mut writer: W,
    session: Arc<Session>,
    done: Arc<watch::Sender<bool>>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stop = done.subscribe();
    let mut buf = BytesMut::with_capacity(4096);
    let result: Result<(), ProxyError> = async {
        loop {
            if *stop.borrow() {
                return Ok(());
            }
            let packet = tokio::select! {
                packet = read_packet(&mut reader, &mut buf, "target", session.max_message_size) => packet?,
                _ = stop.changed() => return Ok(()),
            };
            let Some(packet) = packet else {
                debug!(conn_id = session.conn_id, "Target disconnected");
                return Ok(());
            };
            session.observe_response(&packet);
            writer.write_all(&packet).await?;
            writer.flush().await?;
            session.stats.record_packet(Direction::Received, packet.len());
        }
    }
    .await;
    done.send_replace(true);
    result
}

async fn run_session(
    client: TcpStream,
    endpoint: TargetEndpoint,
    tls_config: Arc<ClientConfig>,
    session: Arc<Session>,
    rng: StdRng,
) -> Result<(), ProxyError> {
    let target = connect_target(&endpoint, tls_config).await?;
    debug!(conn_id = session.conn_id, target = %endpoint.addr(), tls = endpoint.tls, "Connected to target");

    let (client_rd, client_wr) = client.into_split();
    let (target_rd, target_wr) = tokio::io::split(target);
    let (done, _) = watch::channel(false);
    let done = Arc::new(done);

    let forward = tokio::spawn(forward_pump(
        client_rd,
        target_wr,
        Arc::clone(&session),
        rng,
        Arc::clone(&done),
    ));
    let reverse = tokio::spawn(reverse_pump(target_rd, client_wr, Arc::clone(&session), done));
    let (forward, reverse) = tokio::join!(forward, reverse);
    forward.map_err(|e| ProxyError::Io(std::io::Error::other(e)))??;
    reverse.map_err(|e| ProxyError::Io(std::io::Error::other(e)))?
}

/// The intercepting proxy: one accept loop, one session task per client.
pub struct ObfuscatingProxy {
    live: LiveConfig,
    stats: Arc<TrafficStats>,
    observer: Arc<dyn ProxyObserver>,
    tls_config: Arc<ClientConfig>,
}

impl ObfuscatingProxy {
    pub fn new(live: LiveConfig, stats: Arc<TrafficStats>, observer: Arc<dyn ProxyObserver>) -> Self {
        Self {
            live,
            stats,
            observer,
            tls_config: tls::insecure_client_config(),
        }
    }

    /// Bind the configured listen URL and serve forever.
    pub async fn start(self) -> Result<()> {
        let listen_url = self.live.snapshot().config.listen.url.clone();
        let addr = parse_listen_url(&listen_url)?;
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("LDAP obfuscating proxy listening on {}", listener.local_addr()?);
        let mut next_conn_id = 0u64;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accept) => accept,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            next_conn_id += 1;
            let conn_id = next_conn_id;

            let snapshot = self.live.snapshot();
            let endpoint = match parse_target_url(&snapshot.config.target.url) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    error!("Dropping connection from {}: {:#}", peer, e);
                    continue;
                }
            };
            self.observer.on_connection(conn_id, peer);
            self.stats.connection_opened();

            let session = Arc::new(Session {
                conn_id,
                live: self.live.clone(),
                stats: Arc::clone(&self.stats),
                observer: Arc::clone(&self.observer),
                cookies: SearchCookieTracker::new(),
                max_message_size: snapshot.config.max_message_size,
            });
            let rng = session_rng(snapshot.config.seed, conn_id);
            let tls_config = Arc::clone(&self.tls_config);

            tokio::spawn(async move {
                let result = run_session(stream, endpoint, tls_config, Arc::clone(&session), rng).await;
                session.observer.on_session_end(conn_id, result.as_ref().err());
                session.stats.connection_closed();
            });
        }
    }
}
