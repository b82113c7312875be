//! Advertising the match on directory ("master") servers
//!
//! Two independent mechanisms keep the match listed:
//! - HTTP directories are visited one after the other. Each visit is a
//!   single GET polled once per tick; whatever the outcome, the cursor
//!   moves on to the next directory. Once the list is exhausted the match
//!   counts as registered until the next periodic refresh.
//! - UDP directories receive a datagram registration from the server
//!   socket with the same index. Hosts are resolved through a DNS cache;
//!   a cache miss starts a background lookup and the directory is simply
//!   tried again on a later tick.
//!
//! Neither mechanism ever blocks the tick or fails the match.

use crate::error::ServerError;
use crate::socket::DatagramSocket;
use log::{debug, info, warn};
use shared::directory::{DirectoryMessage, Registration, NAT_PUNCH_PACKETS};
use shared::MAX_SERVER_SOCKETS;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

pub const REGISTER_PATH: &str = "/server_register.php";
pub const DEREGISTER_PATH: &str = "/server_deregister.php";

/// HTTP directories forget a match after five minutes.
pub const HTTP_REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60);
/// UDP directories forget a match after two minutes.
pub const UDP_REFRESH_INTERVAL: Duration = Duration::from_secs(40);
/// Gives the host's own players time to join before the first count.
pub const UDP_INITIAL_DELAY: Duration = Duration::from_secs(5);
pub const DNS_RETRY_DELAY: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Processing,
    Error(String),
    Finished,
}

/// An HTTP request that completes in the background.
pub trait HttpRequest: Send {
    fn poll(&mut self) -> RequestStatus;
}

pub trait HttpClient: Send {
    fn get(&mut self, url: &str) -> Box<dyn HttpRequest>;
}

/// Runs requests with `reqwest` on the ambient tokio runtime.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(proxy: Option<&str>) -> Result<Self, ServerError> {
        let mut builder = reqwest::Client::builder().timeout(HTTP_TIMEOUT);
        if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::http(proxy)
                .map_err(|e| ServerError::Config(format!("invalid HTTP proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ServerError::Config(format!("cannot create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&mut self, url: &str) -> Box<dyn HttpRequest> {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => return Box::new(FailedRequest(e.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        let request = self.client.get(url);
        handle.spawn(async move {
            let result = match request.send().await {
                Ok(response) => response
                    .error_for_status()
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            // Nobody listening any more means the request was abandoned
            let _ = tx.send(result);
        });
        Box::new(PendingRequest { rx })
    }
}

struct PendingRequest {
    rx: oneshot::Receiver<Result<(), String>>,
}

impl HttpRequest for PendingRequest {
    fn poll(&mut self) -> RequestStatus {
        match self.rx.try_recv() {
            Ok(Ok(())) => RequestStatus::Finished,
            Ok(Err(e)) => RequestStatus::Error(e),
            Err(oneshot::error::TryRecvError::Empty) => RequestStatus::Processing,
            Err(oneshot::error::TryRecvError::Closed) => {
                RequestStatus::Error("request task ended without a result".into())
            }
        }
    }
}

struct FailedRequest(String);

impl HttpRequest for FailedRequest {
    fn poll(&mut self) -> RequestStatus {
        RequestStatus::Error(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpMode {
    Register,
    Deregister,
}

/// Sequential registration on the HTTP directory list.
pub struct HttpRegistration {
    directories: Vec<String>,
    client: Box<dyn HttpClient>,
    cursor: usize,
    registered: bool,
    last_register_at: Instant,
    query: String,
    mode: HttpMode,
    in_flight: Option<Box<dyn HttpRequest>>,
}

impl HttpRegistration {
    pub fn new(directories: Vec<String>, client: Box<dyn HttpClient>, now: Instant) -> Self {
        Self {
            directories,
            client,
            cursor: 0,
            registered: false,
            last_register_at: now,
            query: String::new(),
            mode: HttpMode::Register,
            in_flight: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn directories(&self) -> &[String] {
        &self.directories
    }

    fn start_request(&mut self) {
        let Some(directory) = self.directories.get(self.cursor) else {
            return;
        };
        let url = format!("{}{}", directory.trim_end_matches('/'), self.query);
        match self.mode {
            HttpMode::Register => info!("Registering server at {}", directory),
            HttpMode::Deregister => info!("De-registering server at {}", directory),
        }
        self.in_flight = Some(self.client.get(&url));
    }

    /// Starts a fresh pass over the directory list.
    pub fn register(&mut self, port: u16, ip: IpAddr) {
        if self.directories.is_empty() {
            return;
        }
        self.query = format!("{}?port={}&addr={}", REGISTER_PATH, port, ip);
        self.mode = HttpMode::Register;
        self.registered = false;
        self.cursor = 0;
        self.start_request();
    }

    /// Polls the request in flight. Returns the error text of a failed
    /// directory so the caller can show it to the host.
    pub fn process(&mut self, now: Instant) -> Option<String> {
        if self.registered || self.mode != HttpMode::Register {
            return None;
        }
        let status = self.in_flight.as_mut()?.poll();

        let error = match status {
            RequestStatus::Processing => return None,
            RequestStatus::Error(e) => {
                let directory = self.directories.get(self.cursor).cloned().unwrap_or_default();
                warn!("Could not register with master server {}: {}", directory, e);
                Some(format!("Could not register with master server: {}", e))
            }
            RequestStatus::Finished => {
                self.last_register_at = now;
                None
            }
        };

        // Failed or finished, move on either way
        self.in_flight = None;
        self.cursor += 1;
        if self.cursor < self.directories.len() {
            self.start_request();
        } else {
            self.registered = true;
            self.cursor = 0;
        }
        error
    }

    /// Re-registers once the directories may have forgotten us.
    pub fn check(&mut self, now: Instant, port: u16, ip: IpAddr) {
        if now.saturating_duration_since(self.last_register_at) > HTTP_REFRESH_INTERVAL {
            self.registered = false;
            self.last_register_at = now;
            self.register(port, ip);
        }
    }

    /// Starts withdrawing the match. Returns false when it was never
    /// registered, in which case there is nothing to withdraw.
    pub fn deregister(&mut self, port: u16, ip: IpAddr) -> bool {
        if !self.registered || self.directories.is_empty() {
            return false;
        }
        self.query = format!("{}?port={}&addr={}", DEREGISTER_PATH, port, ip);
        self.mode = HttpMode::Deregister;
        self.registered = false;
        self.cursor = 0;
        self.start_request();
        true
    }

    /// Returns true once every directory has been visited.
    pub fn process_deregister(&mut self) -> bool {
        if self.mode != HttpMode::Deregister {
            return true;
        }
        let Some(request) = self.in_flight.as_mut() else {
            return true;
        };
        if request.poll() == RequestStatus::Processing {
            return false;
        }

        self.in_flight = None;
        self.cursor += 1;
        if self.cursor < self.directories.len() {
            self.start_request();
            false
        } else {
            self.cursor = 0;
            self.mode = HttpMode::Register;
            true
        }
    }
}

/// Host name resolution that never blocks the caller.
pub struct DnsCache {
    resolved: HashMap<String, IpAddr>,
    pending: HashSet<String>,
    tx: mpsc::UnboundedSender<(String, Option<IpAddr>)>,
    rx: mpsc::UnboundedReceiver<(String, Option<IpAddr>)>,
}

impl DnsCache {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            resolved: HashMap::new(),
            pending: HashSet::new(),
            tx,
            rx,
        }
    }

    pub fn insert(&mut self, host: &str, ip: IpAddr) {
        self.resolved.insert(host.to_string(), ip);
    }

    /// Returns the cached address, or starts resolving it and returns `None`.
    pub fn lookup(&mut self, host: &str) -> Option<IpAddr> {
        self.collect();
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        if let Some(ip) = self.resolved.get(host) {
            return Some(*ip);
        }
        self.start_lookup(host);
        None
    }

    fn start_lookup(&mut self, host: &str) {
        if !self.pending.insert(host.to_string()) {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("Cannot resolve {} outside of the async runtime", host);
            self.pending.remove(host);
            return;
        };
        let tx = self.tx.clone();
        let host = host.to_string();
        handle.spawn(async move {
            let ip = match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
                Err(e) => {
                    debug!("Lookup of {} failed: {}", host, e);
                    None
                }
            };
            let _ = tx.send((host, ip));
        });
    }

    fn collect(&mut self) {
        while let Ok((host, ip)) = self.rx.try_recv() {
            self.pending.remove(&host);
            match ip {
                Some(ip) => {
                    debug!("Resolved {} to {}", host, ip);
                    self.resolved.insert(host, ip);
                }
                None => warn!("Could not resolve {}", host),
            }
        }
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Datagram registration on the UDP directory list.
pub struct UdpRegistration {
    directories: Vec<String>,
    next_register_at: Instant,
    dns: DnsCache,
}

impl UdpRegistration {
    pub fn new(directories: Vec<String>, now: Instant) -> Self {
        Self {
            directories,
            next_register_at: now + UDP_INITIAL_DELAY,
            dns: DnsCache::new(),
        }
    }

    pub fn next_register_at(&self) -> Instant {
        self.next_register_at
    }

    pub fn dns_mut(&mut self) -> &mut DnsCache {
        &mut self.dns
    }

    /// Resolves every usable entry, pairing it with the socket index it is
    /// served from. With `retry`, an unresolved entry pulls the next
    /// attempt forward to `DNS_RETRY_DELAY` from now.
    fn targets(&mut self, now: Instant, retry: bool) -> Vec<(usize, SocketAddr)> {
        let mut targets = Vec::new();
        for (index, entry) in self.directories.iter().enumerate() {
            if index >= MAX_SERVER_SOCKETS {
                info!(
                    "UDP masterserver list too big, max {} entries supported",
                    MAX_SERVER_SOCKETS
                );
                break;
            }
            let Some((host, port)) = entry.split_once(':') else {
                continue;
            };
            let Ok(port) = port.trim().parse::<u16>() else {
                warn!("Invalid port in UDP masterserver entry '{}'", entry);
                continue;
            };
            match self.dns.lookup(host.trim()) {
                Some(ip) => targets.push((index, SocketAddr::new(ip, port))),
                None => {
                    if retry {
                        self.next_register_at = now + DNS_RETRY_DELAY;
                    }
                }
            }
        }
        targets
    }

    fn send(
        sockets: &[Box<dyn DatagramSocket>],
        index: usize,
        target: SocketAddr,
        message: &DirectoryMessage,
    ) -> bool {
        let Some(socket) = sockets.get(index).or_else(|| sockets.first()) else {
            return false;
        };
        let dummy = DirectoryMessage::DummyPacket.encode();
        for _ in 0..NAT_PUNCH_PACKETS {
            if let Err(e) = socket.send_to(&dummy, target) {
                warn!("Could not reach UDP masterserver {}: {}", target, e);
                return false;
            }
        }
        match socket.send_to(&message.encode(), target) {
            Ok(_) => true,
            Err(e) => {
                warn!("Could not reach UDP masterserver {}: {}", target, e);
                false
            }
        }
    }

    /// Sends the registration to every resolved directory. Returns how
    /// many directories were reached.
    pub fn register(
        &mut self,
        sockets: &[Box<dyn DatagramSocket>],
        registration: &Registration,
        now: Instant,
    ) -> usize {
        let message = DirectoryMessage::Register(registration.clone());
        let mut sent = 0;
        for (index, target) in self.targets(now, true) {
            info!("Registering on UDP masterserver {}", target);
            if Self::send(sockets, index, target, &message) {
                sent += 1;
            }
        }
        sent
    }

    /// Best-effort withdrawal; nothing is awaited.
    pub fn deregister(&mut self, sockets: &[Box<dyn DatagramSocket>], now: Instant) -> usize {
        let mut sent = 0;
        for (index, target) in self.targets(now, false) {
            if Self::send(sockets, index, target, &DirectoryMessage::Deregister) {
                sent += 1;
            }
        }
        sent
    }

    /// Refreshes the registration when it is due. Returns true if a
    /// registration round was attempted.
    pub fn check(
        &mut self,
        sockets: &[Box<dyn DatagramSocket>],
        registration: &Registration,
        now: Instant,
    ) -> bool {
        if now <= self.next_register_at {
            return false;
        }
        self.next_register_at = now + UDP_REFRESH_INTERVAL;
        self.register(sockets, registration, now);
        true
    }
}
