//! L2CAP data links for the bus.
//!
//! A link starts with a one-byte handshake: the initiator writes `0x00` once
//! the channel is up and the acceptor refuses anything else. Sockets sit
//! behind small traits so the PSM scan, retry loop and handshake can be
//! exercised without a radio.

use std::{fmt, io, mem, os::fd::AsRawFd, sync::Arc, time::Duration};

use async_trait::async_trait;
use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, SeqPacketListener, Security, SecurityLevel, Socket, SocketAddr},
};
use log::{debug, info, warn};
use rand::Rng;
use tokio::time;

use crate::{
   bluetooth::node::{BusAddress, INCOMING_PSM, PSM_DYN_END, PSM_DYN_START},
   error::{AccessorError, ProtoError, Result},
   event::{IncomingDecision, PolicyRef},
};

const HANDSHAKE: u8 = 0x00;
const LISTEN_BACKLOG: u32 = 1;
/// Delay before retrying after socket creation failed
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Bound on a single connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between checks that a connected channel is usable
const LINK_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Bound on reading the handshake byte from an accepted link
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Negotiated MTUs of a connected channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mtu {
   pub incoming: u16,
   pub outgoing: u16,
}

/// Unconnected sequenced-packet socket.
#[async_trait]
pub trait L2capSocket: Send + Sync {
   fn bind(&self, local: Address, psm: u16) -> io::Result<()>;
   /// Low security, `mtu` in both directions and a send buffer of twice
   /// the outgoing MTU.
   fn configure_mtu(&self, mtu: u16) -> io::Result<()>;
   fn listen(self: Box<Self>, backlog: u32) -> io::Result<Box<dyn L2capListener>>;
   async fn connect(self: Box<Self>, target: BusAddress) -> io::Result<Box<dyn L2capStream>>;
}

#[async_trait]
pub trait L2capListener: Send + Sync {
   async fn accept(&self) -> io::Result<(Box<dyn L2capStream>, Address)>;
}

/// Connected channel.
#[async_trait]
pub trait L2capStream: Send + Sync {
   /// Whether the channel is usable. The kernel reports connect completion
   /// before this turns true.
   fn link_up(&self) -> io::Result<bool>;
   fn mtu(&self) -> io::Result<Mtu>;
   async fn send(&self, data: &[u8]) -> io::Result<usize>;
   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

pub trait L2capBackend: Send + Sync {
   fn socket(&self) -> io::Result<Box<dyn L2capSocket>>;
}

/// Kernel L2CAP sockets via `bluer`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BluerL2cap;

impl L2capBackend for BluerL2cap {
   fn socket(&self) -> io::Result<Box<dyn L2capSocket>> {
      Ok(Box::new(BluerSocket(Socket::new_seq_packet()?)))
   }
}

struct BluerSocket(Socket<SeqPacket>);

#[async_trait]
impl L2capSocket for BluerSocket {
   fn bind(&self, local: Address, psm: u16) -> io::Result<()> {
      self.0.bind(SocketAddr::new(local, AddressType::BrEdr, psm))
   }

   fn configure_mtu(&self, mtu: u16) -> io::Result<()> {
      self.0.set_security(Security {
         level: SecurityLevel::Low,
         key_size: 0,
      })?;

      let mut opts = self.0.l2cap_opts()?;
      opts.imtu = mtu;
      opts.omtu = mtu;
      self.0.set_l2cap_opts(&opts)?;

      let sndbuf = 2 * libc::c_int::from(opts.omtu);
      // SAFETY: setsockopt on a live socket with a correctly sized int.
      let ret = unsafe {
         libc::setsockopt(
            self.0.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            (&raw const sndbuf).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
         )
      };
      if ret < 0 {
         return Err(io::Error::last_os_error());
      }
      Ok(())
   }

   fn listen(self: Box<Self>, backlog: u32) -> io::Result<Box<dyn L2capListener>> {
      Ok(Box::new(BluerListener(self.0.listen(backlog)?)))
   }

   async fn connect(self: Box<Self>, target: BusAddress) -> io::Result<Box<dyn L2capStream>> {
      let sa = SocketAddr::new(target.addr, AddressType::BrEdr, target.psm);
      Ok(Box::new(BluerStream(self.0.connect(sa).await?)))
   }
}

struct BluerListener(SeqPacketListener);

#[async_trait]
impl L2capListener for BluerListener {
   async fn accept(&self) -> io::Result<(Box<dyn L2capStream>, Address)> {
      let (stream, sa) = self.0.accept().await?;
      Ok((Box::new(BluerStream(stream)), sa.addr))
   }
}

struct BluerStream(SeqPacket);

#[async_trait]
impl L2capStream for BluerStream {
   fn link_up(&self) -> io::Result<bool> {
      match self.0.as_ref().conn_info() {
         Ok(_) => Ok(true),
         Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(false),
         Err(e) => Err(e),
      }
   }

   fn mtu(&self) -> io::Result<Mtu> {
      let clamp = |v: usize| u16::try_from(v).unwrap_or(u16::MAX);
      Ok(Mtu {
         incoming: clamp(self.0.recv_mtu()?),
         outgoing: clamp(self.0.send_mtu()?),
      })
   }

   async fn send(&self, data: &[u8]) -> io::Result<usize> {
      self.0.send(data).await
   }

   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
      self.0.recv(buf).await
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
   Inbound,
   Outbound,
}

/// An established bus link. Dropping it closes the socket.
pub struct Connection {
   stream: Box<dyn L2capStream>,
   remote: BusAddress,
   direction: Direction,
   redirect: Option<BusAddress>,
   mtu: Mtu,
}

impl fmt::Debug for Connection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Connection")
         .field("remote", &self.remote)
         .field("direction", &self.direction)
         .field("redirect", &self.redirect)
         .field("mtu", &self.mtu)
         .finish_non_exhaustive()
   }
}

impl Connection {
   /// Peer address. Inbound links carry [`INCOMING_PSM`] since the peer's
   /// own listening PSM is not known.
   pub const fn remote(&self) -> BusAddress {
      self.remote
   }

   pub const fn direction(&self) -> Direction {
      self.direction
   }

   /// Address the peer should reconnect to instead, if the incoming policy
   /// asked for a redirect.
   pub const fn redirect(&self) -> Option<BusAddress> {
      self.redirect
   }

   pub const fn mtu(&self) -> Mtu {
      self.mtu
   }

   pub async fn send(&self, data: &[u8]) -> Result<usize> {
      debug!("→ {}: {}", self.remote, hex::encode(data));
      Ok(self.stream.send(data).await?)
   }

   pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
      let n = self.stream.recv(buf).await?;
      debug!("← {}: {}", self.remote, hex::encode(&buf[..n]));
      Ok(n)
   }

   pub fn into_stream(self) -> Box<dyn L2capStream> {
      self.stream
   }
}

/// Listening socket and the PSM it is bound to.
pub struct Listener {
   inner: Box<dyn L2capListener>,
   psm: u16,
}

impl Listener {
   pub const fn psm(&self) -> u16 {
      self.psm
   }
}

impl fmt::Debug for Listener {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Listener").field("psm", &self.psm).finish_non_exhaustive()
   }
}

fn calc_retry_delay() -> Duration {
   Duration::from_millis(500 + rand::thread_rng().gen_range(0..5000))
}

/// Creates listening and connected bus links.
#[derive(Clone)]
pub struct L2capLink {
   backend: Arc<dyn L2capBackend>,
   policy: PolicyRef,
   mtu: u16,
   connect_attempts: u32,
   connect_waits: u32,
}

impl L2capLink {
   pub fn new(
      backend: Arc<dyn L2capBackend>,
      policy: PolicyRef,
      mtu: u16,
      connect_attempts: u32,
      connect_waits: u32,
   ) -> Self {
      Self {
         backend,
         policy,
         mtu,
         connect_attempts,
         connect_waits,
      }
   }

   /// Binds the first free odd PSM in the dynamic range on `local` and
   /// starts listening.
   pub fn listen(&self, local: Address) -> Result<Listener> {
      let socket = self.backend.socket()?;

      let mut last_err = None;
      let mut bound = None;
      for psm in (PSM_DYN_START..=PSM_DYN_END).step_by(2) {
         match socket.bind(local, psm) {
            Ok(()) => {
               bound = Some(psm);
               break;
            },
            Err(e) => last_err = Some(e),
         }
      }
      let Some(psm) = bound else {
         warn!(
            "No unused PSM on {local} (last bind error: {})",
            last_err.map_or_else(|| "none".to_owned(), |e| e.to_string())
         );
         return Err(AccessorError::Exhausted);
      };
      debug!("Bound PSM {psm:#06x} on {local}");

      socket.configure_mtu(self.mtu)?;
      let inner = socket.listen(LISTEN_BACKLOG)?;
      info!("Listening for L2CAP links on {local} PSM {psm:#06x}");
      Ok(Listener { inner, psm })
   }

   /// Accepts one link, checks the handshake byte and vets the peer.
   pub async fn accept(&self, listener: &Listener) -> Result<Connection> {
      let (stream, addr) = listener.inner.accept().await?;
      debug!("Accepted L2CAP link from {addr}");

      let mut byte = [0xffu8; 1];
      let n = time::timeout(HANDSHAKE_TIMEOUT, stream.recv(&mut byte))
         .await
         .map_err(|_| AccessorError::Timeout("handshake byte"))??;
      if n == 0 {
         warn!("{addr}: link closed before handshake");
         return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
      }
      if byte[0] != HANDSHAKE {
         warn!("{addr}: did not receive initial nul byte (got 0x{:02x})", byte[0]);
         return Err(ProtoError::Handshake { byte: byte[0] }.into());
      }

      let redirect = match self.policy.check_incoming_address(addr) {
         IncomingDecision::Allow => None,
         IncomingDecision::Redirect(to) => Some(to),
         IncomingDecision::Reject => {
            debug!("Rejected connection from {addr}");
            return Err(AccessorError::Rejected(addr));
         },
      };

      let mtu = stream.mtu()?;
      match redirect {
         Some(to) => info!("Redirect connection from {addr} to {to}"),
         None => info!("Accept connection from {addr}"),
      }
      Ok(Connection {
         stream,
         remote: BusAddress::new(addr, INCOMING_PSM),
         direction: Direction::Inbound,
         redirect,
         mtu,
      })
   }

   fn new_socket(&self) -> io::Result<Box<dyn L2capSocket>> {
      let socket = self.backend.socket()?;
      socket.configure_mtu(self.mtu)?;
      Ok(socket)
   }

   /// Connects to `target`, retrying failed attempts with jittered backoff,
   /// and sends the handshake byte once the channel is usable.
   pub async fn connect(&self, target: BusAddress) -> Result<Connection> {
      for attempt in 1..=self.connect_attempts {
         let socket = match self.new_socket() {
            Ok(socket) => socket,
            Err(e) => {
               warn!("{target}: create socket failed: {e}");
               time::sleep(CREATE_RETRY_DELAY).await;
               continue;
            },
         };

         debug!("Connecting to {target} (attempt {attempt}/{})", self.connect_attempts);
         let res = time::timeout(CONNECT_TIMEOUT, socket.connect(target))
            .await
            .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into()));
         match res {
            Ok(stream) => return self.finish_connect(stream, target).await,
            Err(e) => {
               debug!("Connect to {target} failed: {e}");
               if attempt < self.connect_attempts {
                  time::sleep(calc_retry_delay()).await;
               }
            },
         }
      }

      warn!("Connect to {target} failed after {} attempts", self.connect_attempts);
      Err(AccessorError::ConnectFailed(target))
   }

   async fn finish_connect(
      &self,
      stream: Box<dyn L2capStream>,
      target: BusAddress,
   ) -> Result<Connection> {
      let mut up = false;
      for _ in 0..self.connect_waits {
         if stream.link_up()? {
            up = true;
            break;
         }
         time::sleep(LINK_POLL_INTERVAL).await;
      }
      if !up {
         warn!("Failed to establish connection with {target}");
         return Err(AccessorError::Timeout("L2CAP link to come up"));
      }

      stream.send(&[HANDSHAKE]).await?;
      let mtu = stream.mtu()?;
      info!("Connected to {target} (mtu in {} out {})", mtu.incoming, mtu.outgoing);
      Ok(Connection {
         stream,
         remote: target,
         direction: Direction::Outbound,
         redirect: None,
         mtu,
      })
   }
}
