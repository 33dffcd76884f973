//! Trackers manage peers and stats of torrents. The session consumes them
//! through a narrow interface: announce and scrape. Only the UDP transport
//! (BEP 15) ships in this crate; other transports plug in as new variants.
pub mod action;
pub mod announce;
pub mod connect;
pub mod event;

use std::{net::SocketAddr, time::Duration};

use tokio::{
    net::{ToSocketAddrs, UdpSocket},
    time::{timeout, Instant},
};
use tracing::{debug, error, info};

use crate::{error::Error, peer::PeerId, session::InfoHash};

use self::{action::Action, event::Event};

static ANNOUNCE_RES_BUF_LEN: usize = 8192;

/// A connection id is valid for this long after the connect exchange.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// An announce as the session sees it, transport-independent.
#[derive(Debug, Clone)]
pub struct Announce {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub event: Event,
    pub num_want: u32,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrapeEntry {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

/// The family of tracker transports, selected at construction.
#[derive(Debug)]
pub enum Tracker {
    Udp(UdpTracker),
}

impl Tracker {
    /// Resolve and connect to a UDP tracker given as "host:port".
    pub async fn connect_udp(url: &str) -> Result<Self, Error> {
        Ok(Self::Udp(UdpTracker::connect(url).await?))
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Udp(t) => &t.url,
        }
    }

    pub async fn announce(
        &mut self,
        req: &Announce,
    ) -> Result<AnnounceResponse, Error> {
        match self {
            Self::Udp(t) => t.announce(req).await,
        }
    }

    pub async fn scrape(
        &mut self,
        info_hashes: &[InfoHash],
    ) -> Result<Vec<ScrapeEntry>, Error> {
        match self {
            Self::Udp(t) => t.scrape(info_hashes).await,
        }
    }
}

/// BEP 15. One socket per tracker, connected to its resolved address.
#[derive(Debug)]
pub struct UdpTracker {
    pub url: String,
    socket: UdpSocket,
    peer_addr: SocketAddr,
    connection_id: u64,
    connected_at: Option<Instant>,
}

impl UdpTracker {
    async fn connect(url: &str) -> Result<Self, Error> {
        let socket = Self::new_udp_socket(url).await?;
        let peer_addr =
            socket.peer_addr().map_err(|_| Error::TrackerSocketConnect)?;

        let mut tracker = Self {
            url: url.to_owned(),
            socket,
            peer_addr,
            connection_id: 0,
            connected_at: None,
        };
        tracker.connect_exchange().await?;

        info!("connected to tracker {url}");
        Ok(tracker)
    }

    async fn new_udp_socket<A: ToSocketAddrs>(
        addr: A,
    ) -> Result<UdpSocket, Error> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|_| Error::TrackerSocketConnect)?;
        socket
            .connect(addr)
            .await
            .map_err(|_| Error::TrackerSocketConnect)?;
        Ok(socket)
    }

    /// Obtain a connection id, retransmitting with the BEP 15 backoff.
    async fn connect_exchange(&mut self) -> Result<(), Error> {
        let req = connect::Request::new();
        let mut buf = [0u8; connect::Response::LENGTH];
        let mut len = 0usize;

        self.socket.send(&req.serialize()).await?;

        let mut retransmit = 15;
        for _ in 0..3 {
            match timeout(
                Duration::from_secs(retransmit),
                self.socket.recv(&mut buf),
            )
            .await
            {
                Ok(Ok(n)) => {
                    len = n;
                    break;
                }
                Ok(Err(e)) => {
                    error!("error connecting to tracker: {e:?}");
                    return Err(Error::TrackerResponse);
                }
                Err(_) => {
                    retransmit *= 2;
                    debug!(
                        "tracker connect request was lost, retrying in \
                         {retransmit}s"
                    );
                    self.socket.send(&req.serialize()).await?;
                }
            }
        }

        if len == 0 {
            return Err(Error::TrackerResponse);
        }

        let res = connect::Response::deserialize(&buf[..len])?;
        if res.transaction_id != req.transaction_id
            || res.action != Action::Connect as u32
        {
            return Err(Error::TrackerResponse);
        }

        self.connection_id = res.connection_id;
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    async fn refresh_connection(&mut self) -> Result<(), Error> {
        let stale = self
            .connected_at
            .map(|t| t.elapsed() >= CONNECTION_ID_TTL)
            .unwrap_or(true);
        if stale {
            self.connect_exchange().await?;
        }
        Ok(())
    }

    async fn announce(
        &mut self,
        announce: &Announce,
    ) -> Result<AnnounceResponse, Error> {
        self.refresh_connection().await?;

        debug!("announcing {:?} to {}", announce.event, self.url);

        let req = announce::Request {
            connection_id: self.connection_id,
            transaction_id: rand::random(),
            info_hash: announce.info_hash.clone(),
            peer_id: announce.peer_id.clone(),
            downloaded: announce.downloaded,
            left: announce.left,
            uploaded: announce.uploaded,
            event: announce.event,
            ip_address: 0,
            key: rand::random(),
            num_want: announce.num_want,
            port: announce.port,
        };

        let mut res = [0u8; ANNOUNCE_RES_BUF_LEN];
        let len = self.exchange(&req.serialize(), &mut res).await?;

        let (header, payload) = announce::Response::deserialize(&res[..len])?;
        if header.transaction_id != req.transaction_id
            || header.action != Action::Announce as u32
        {
            return Err(Error::TrackerResponse);
        }

        let peers = announce::parse_compact_peer_list(
            payload,
            self.peer_addr.is_ipv6(),
        )?;

        Ok(AnnounceResponse {
            interval: header.interval,
            leechers: header.leechers,
            seeders: header.seeders,
            peers,
        })
    }

    async fn scrape(
        &mut self,
        info_hashes: &[InfoHash],
    ) -> Result<Vec<ScrapeEntry>, Error> {
        self.refresh_connection().await?;

        let transaction_id: u32 = rand::random();
        let mut req = Vec::with_capacity(16 + info_hashes.len() * 20);
        req.extend_from_slice(&self.connection_id.to_be_bytes());
        req.extend_from_slice(&(Action::Scrape as u32).to_be_bytes());
        req.extend_from_slice(&transaction_id.to_be_bytes());
        for hash in info_hashes {
            req.extend_from_slice(&hash.0);
        }

        let mut res = [0u8; ANNOUNCE_RES_BUF_LEN];
        let len = self.exchange(&req, &mut res).await?;

        if len < 8 {
            return Err(Error::TrackerResponse);
        }
        let action = u32::from_be_bytes(res[0..4].try_into().unwrap());
        let tid = u32::from_be_bytes(res[4..8].try_into().unwrap());
        if action != Action::Scrape as u32 || tid != transaction_id {
            return Err(Error::TrackerResponse);
        }

        let mut entries = Vec::new();
        for chunk in res[8..len].chunks_exact(12) {
            entries.push(ScrapeEntry {
                seeders: u32::from_be_bytes(chunk[0..4].try_into().unwrap()),
                completed: u32::from_be_bytes(chunk[4..8].try_into().unwrap()),
                leechers: u32::from_be_bytes(chunk[8..12].try_into().unwrap()),
            });
        }

        Ok(entries)
    }

    /// Send a packet and await its reply with one retransmission.
    async fn exchange(
        &self,
        req: &[u8],
        res: &mut [u8],
    ) -> Result<usize, Error> {
        self.socket.send(req).await?;

        let mut retransmit = 15;
        for _ in 0..3 {
            match timeout(
                Duration::from_secs(retransmit),
                self.socket.recv(res),
            )
            .await
            {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) => {
                    error!("tracker request failed: {e:?}");
                    return Err(Error::TrackerResponse);
                }
                Err(_) => {
                    retransmit *= 2;
                    debug!("tracker request was lost, retrying");
                    self.socket.send(req).await?;
                }
            }
        }

        Err(Error::TrackerResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal scripted tracker answering connect and announce.
    async fn fake_tracker(expected_hash: InfoHash) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((_len, from)) = socket.recv_from(&mut buf).await
                else {
                    return;
                };
                let action =
                    u32::from_be_bytes(buf[8..12].try_into().unwrap());

                if action == Action::Connect as u32 {
                    let tid = &buf[12..16];
                    let mut res = Vec::new();
                    res.extend_from_slice(&0u32.to_be_bytes());
                    res.extend_from_slice(tid);
                    res.extend_from_slice(&42u64.to_be_bytes());
                    socket.send_to(&res, from).await.unwrap();
                } else if action == Action::Announce as u32 {
                    assert_eq!(&buf[16..36], &expected_hash.0);
                    let tid = &buf[12..16];
                    let mut res = Vec::new();
                    res.extend_from_slice(&1u32.to_be_bytes());
                    res.extend_from_slice(tid);
                    res.extend_from_slice(&1800u32.to_be_bytes());
                    res.extend_from_slice(&1u32.to_be_bytes());
                    res.extend_from_slice(&2u32.to_be_bytes());
                    // one peer at 127.0.0.1:7000
                    res.extend_from_slice(&[127, 0, 0, 1]);
                    res.extend_from_slice(&7000u16.to_be_bytes());
                    socket.send_to(&res, from).await.unwrap();
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn connect_and_announce() {
        let info_hash = InfoHash([8u8; 20]);
        let addr = fake_tracker(info_hash.clone()).await;

        let mut tracker =
            Tracker::connect_udp(&addr.to_string()).await.unwrap();

        let res = tracker
            .announce(&Announce {
                info_hash,
                peer_id: PeerId::gen(),
                port: 6881,
                downloaded: 0,
                uploaded: 0,
                left: 100,
                event: Event::Started,
                num_want: 50,
            })
            .await
            .unwrap();

        assert_eq!(res.interval, 1800);
        assert_eq!(res.seeders, 2);
        assert_eq!(res.peers, vec!["127.0.0.1:7000".parse().unwrap()]);
    }
}
