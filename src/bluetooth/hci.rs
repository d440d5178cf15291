//! HCI command channel.
//!
//! Commands are written to a raw HCI socket bound to one adapter, with a
//! kernel event filter limiting delivery to the completion events we care
//! about. Framing, argument encoding and event classification are plain
//! functions; the socket sits behind [`HciTransport`].

use std::{
   io,
   mem,
   os::fd::{AsRawFd, FromRawFd, OwnedFd},
   time::Duration,
};

use async_trait::async_trait;
use bluer::Address;
use log::{debug, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::{
   io::unix::AsyncFd,
   time::{self, Instant},
};

use crate::error::{AccessorError, ProtoError, Result};

pub type Packet = SmallVec<[u8; 32]>;

const BTPROTO_HCI: libc::c_int = 1;
const SOL_HCI: libc::c_int = 0;
const HCI_FILTER: libc::c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;
/// `_IOR('H', 213, int)`
const HCIGETCONNINFO: libc::c_ulong = 0x8004_48d5;
const ACL_LINK: u8 = 0x01;
const HCI_LM_MASTER: u32 = 0x0001;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;
/// Largest event: 3 byte header plus 255 byte payload.
const MAX_EVENT_LEN: usize = 258;

/// Per-read wait inside the overall command deadline.
const READ_WAIT: Duration = Duration::from_secs(5);

pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_ROLE_CHANGE: u8 = 0x12;

/// Builds an opcode from its group and command fields.
pub const fn opcode(ogf: u16, ocf: u16) -> u16 {
   (ogf << 10) | ocf
}

pub const OP_PERIODIC_INQUIRY: u16 = opcode(0x01, 0x0003);
pub const OP_EXIT_PERIODIC_INQUIRY: u16 = opcode(0x01, 0x0004);
pub const OP_SNIFF_MODE: u16 = opcode(0x02, 0x0003);
pub const OP_EXIT_SNIFF_MODE: u16 = opcode(0x02, 0x0004);
pub const OP_SWITCH_ROLE: u16 = opcode(0x02, 0x000B);
pub const OP_READ_LINK_POLICY: u16 = opcode(0x02, 0x000C);
pub const OP_WRITE_CLASS_OF_DEVICE: u16 = opcode(0x03, 0x0024);
pub const OP_WRITE_INQUIRY_SCAN_ACTIVITY: u16 = opcode(0x03, 0x001E);
pub const OP_WRITE_INQUIRY_SCAN_TYPE: u16 = opcode(0x03, 0x0043);
pub const OP_WRITE_INQUIRY_TX_POWER: u16 = opcode(0x03, 0x0059);
pub const OP_READ_LOCAL_FEATURES: u16 = opcode(0x04, 0x0003);
pub const OP_WRITE_SSP_DEBUG_MODE: u16 = opcode(0x06, 0x0004);

/// General Inquiry Access Code.
const GIAC_LAP: [u8; 3] = [0x33, 0x8B, 0x9E];
/// Link policy bit allowing sniff mode.
const LINK_POLICY_SNIFF: u16 = 0x0004;

/// Set of HCI event codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask(u64);

impl EventMask {
   pub const fn empty() -> Self {
      Self(0)
   }

   pub const fn with(self, code: u8) -> Self {
      if code < 64 {
         Self(self.0 | (1 << code))
      } else {
         self
      }
   }

   pub const fn contains(self, code: u8) -> bool {
      code < 64 && self.0 & (1 << code) != 0
   }
}

/// Kernel event filter, `struct hci_filter` in userspace layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HciFilter {
   pub type_mask: u32,
   pub event_mask: [u32; 2],
   pub opcode: u16,
}

impl HciFilter {
   pub fn for_command(opcode: u16, mask: EventMask) -> Self {
      Self {
         type_mask: 1 << HCI_EVENT_PKT,
         event_mask: [mask.0 as u32, (mask.0 >> 32) as u32],
         opcode: opcode.to_le(),
      }
   }
}

/// Result of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciResponse {
   /// Command-complete event; `payload` follows the status byte.
   Complete { status: u8, payload: Packet },
   /// Command-status event for a command that completes later.
   Status(u8),
}

impl HciResponse {
   pub const fn status(&self) -> u8 {
      match self {
         Self::Complete { status, .. } | Self::Status(status) => *status,
      }
   }

   /// Maps a non-zero status to [`AccessorError::CommandFailed`].
   pub fn check(self, opcode: u16) -> Result<Self> {
      match self.status() {
         0 => Ok(self),
         status => Err(AccessorError::CommandFailed { opcode, status }),
      }
   }
}

/// ACL link details from the kernel connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclConnInfo {
   pub handle: u16,
   pub link_mode: u32,
}

impl AclConnInfo {
   pub const fn is_master(&self) -> bool {
      self.link_mode & HCI_LM_MASTER != 0
   }
}

/// Requested baseband role on an ACL link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Role {
   Master,
   Slave,
}

/// Sniff mode parameters in baseband slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffParams {
   pub min_interval: u16,
   pub max_interval: u16,
   pub attempt: u16,
   pub timeout: u16,
}

/// Frames a command packet.
pub fn build_command(opcode: u16, args: &[u8]) -> Result<Packet> {
   let len = u8::try_from(args.len())
      .map_err(|_| AccessorError::InvalidArgument("HCI arguments exceed 255 bytes"))?;
   let mut pkt = Packet::new();
   pkt.push(HCI_COMMAND_PKT);
   pkt.extend_from_slice(&opcode.to_le_bytes());
   pkt.push(len);
   pkt.extend_from_slice(args);
   Ok(pkt)
}

/// Splits a buffered event into code and payload. `None` means more bytes
/// are needed.
pub fn parse_event(buf: &[u8]) -> std::result::Result<Option<(u8, &[u8])>, ProtoError> {
   if buf.len() < 3 {
      return Ok(None);
   }
   if buf[0] != HCI_EVENT_PKT {
      return Err(ProtoError::UnexpectedPacketType { packet_type: buf[0] });
   }
   let expected = usize::from(buf[2]);
   let actual = buf.len() - 3;
   if actual < expected {
      Ok(None)
   } else if actual > expected {
      Err(ProtoError::EventSizeMismatch { expected, actual })
   } else {
      Ok(Some((buf[1], &buf[3..])))
   }
}

/// How a received event relates to the command in flight.
#[derive(Debug, PartialEq, Eq)]
pub enum EventMatch<'a> {
   Complete { status: u8, payload: &'a [u8] },
   Status(u8),
   /// Masked event that is not a completion for our command.
   Side,
   Unrelated,
}

pub fn classify(opcode: u16, mask: EventMask, code: u8, payload: &[u8]) -> EventMatch<'_> {
   match code {
      // ncmd, opcode, status, return parameters
      EVT_CMD_COMPLETE if payload.len() >= 4 => {
         if u16::from_le_bytes([payload[1], payload[2]]) == opcode {
            EventMatch::Complete {
               status: payload[3],
               payload: &payload[4..],
            }
         } else {
            EventMatch::Unrelated
         }
      },
      // status, ncmd, opcode
      EVT_CMD_STATUS if payload.len() >= 4 => {
         if u16::from_le_bytes([payload[2], payload[3]]) == opcode {
            EventMatch::Status(payload[0])
         } else {
            EventMatch::Unrelated
         }
      },
      EVT_CMD_COMPLETE | EVT_CMD_STATUS => EventMatch::Unrelated,
      code if mask.contains(code) => EventMatch::Side,
      _ => EventMatch::Unrelated,
   }
}

/// Converts a scan duration in milliseconds to 0.625 ms baseband ticks.
pub const fn ms_to_ticks(ms: u16) -> u16 {
   if ms == 10 {
      0x11
   } else {
      ((ms as u32 * 1000 + 313) / 625) as u16
   }
}

pub fn inquiry_scan_activity_args(window_ms: u16, interval_ms: u16) -> Result<[u8; 4]> {
   if !(10..=2560).contains(&window_ms) {
      return Err(AccessorError::InvalidArgument("inquiry window out of range"));
   }
   if !(11..=2560).contains(&interval_ms) {
      return Err(AccessorError::InvalidArgument("inquiry interval out of range"));
   }
   if window_ms > interval_ms {
      return Err(AccessorError::InvalidArgument("inquiry window exceeds interval"));
   }
   let interval = ms_to_ticks(interval_ms).to_le_bytes();
   let window = ms_to_ticks(window_ms).to_le_bytes();
   Ok([interval[0], interval[1], window[0], window[1]])
}

pub fn periodic_inquiry_args(
   min_period: u16,
   max_period: u16,
   length: u8,
   max_responses: u8,
) -> Result<[u8; 9]> {
   if length > 0x30 || u16::from(length) >= min_period {
      return Err(AccessorError::InvalidArgument("inquiry length out of range"));
   }
   if length != 0 && (min_period < 2 || min_period >= max_period || max_period < 3) {
      return Err(AccessorError::InvalidArgument("inquiry periods out of range"));
   }
   let max = max_period.to_le_bytes();
   let min = min_period.to_le_bytes();
   Ok([
      max[0],
      max[1],
      min[0],
      min[1],
      GIAC_LAP[0],
      GIAC_LAP[1],
      GIAC_LAP[2],
      length,
      max_responses,
   ])
}

pub fn sniff_args(handle: u16, params: &SniffParams) -> Result<[u8; 10]> {
   let interval_ok = |v: u16| (2..=0x7FFE).contains(&v) && v & 1 == 0;
   if !interval_ok(params.min_interval)
      || !interval_ok(params.max_interval)
      || params.max_interval < params.min_interval
   {
      return Err(AccessorError::InvalidArgument("sniff interval out of range"));
   }
   if !(1..=0x7FFF).contains(&params.attempt) || params.timeout > 0x7FFF {
      return Err(AccessorError::InvalidArgument("sniff attempt or timeout out of range"));
   }
   let mut args = [0u8; 10];
   for (chunk, value) in args.chunks_exact_mut(2).zip([
      handle,
      params.min_interval,
      params.max_interval,
      params.attempt,
      params.timeout,
   ]) {
      chunk.copy_from_slice(&value.to_le_bytes());
   }
   Ok(args)
}

/// Address bytes in HCI (little-endian) order.
pub fn bdaddr_le(addr: Address) -> [u8; 6] {
   let mut bytes = addr.0;
   bytes.reverse();
   bytes
}

pub fn role_switch_args(addr: Address, role: Role) -> [u8; 7] {
   let b = bdaddr_le(addr);
   let role = match role {
      Role::Master => 0x00,
      Role::Slave => 0x01,
   };
   [b[0], b[1], b[2], b[3], b[4], b[5], role]
}

/// Whether a role-change event payload concerns `addr`.
fn role_change_for(payload: &[u8], addr: Address) -> bool {
   payload.len() >= 8 && payload[1..7] == bdaddr_le(addr)
}

fn role_change_status(payload: &[u8], addr: Address, role: Role) -> Result<()> {
   match payload[0] {
      0 => Ok(()),
      status => {
         warn!("{addr}: role switch to {role} refused with status 0x{status:02x}");
         Err(AccessorError::CommandFailed {
            opcode: OP_SWITCH_ROLE,
            status,
         })
      },
   }
}

/// Raw access to one adapter's HCI socket.
#[async_trait]
pub trait HciTransport: Send + Sync {
   fn set_filter(&self, filter: &HciFilter) -> io::Result<()>;
   async fn send(&self, frame: &[u8]) -> io::Result<()>;
   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
   fn acl_conn_info(&self, addr: Address) -> io::Result<AclConnInfo>;
}

/// Opens HCI transports by adapter index.
pub trait HciBackend: Send + Sync {
   fn open(&self, dev_id: u16) -> io::Result<Box<dyn HciTransport>>;
}

/// Kernel raw HCI sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawHci;

impl HciBackend for RawHci {
   fn open(&self, dev_id: u16) -> io::Result<Box<dyn HciTransport>> {
      Ok(Box::new(RawHciSocket::open(dev_id)?))
   }
}

#[repr(C)]
struct SockaddrHci {
   hci_family: libc::sa_family_t,
   hci_dev: u16,
   hci_channel: u16,
}

#[repr(C)]
#[derive(Default)]
struct HciConnInfo {
   handle: u16,
   bdaddr: [u8; 6],
   link_type: u8,
   out: u8,
   state: u16,
   link_mode: u32,
}

#[repr(C)]
#[derive(Default)]
struct HciConnInfoReq {
   bdaddr: [u8; 6],
   link_type: u8,
   conn_info: HciConnInfo,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
   if ret < 0 {
      Err(io::Error::last_os_error())
   } else {
      Ok(ret)
   }
}

/// Non-blocking raw HCI socket bound to one adapter.
#[derive(Debug)]
pub struct RawHciSocket {
   fd: AsyncFd<OwnedFd>,
}

impl RawHciSocket {
   pub fn open(dev_id: u16) -> io::Result<Self> {
      // SAFETY: plain socket(2) call; the result is checked before use.
      let raw = cvt(unsafe {
         libc::socket(libc::AF_BLUETOOTH, libc::SOCK_RAW | libc::SOCK_CLOEXEC, BTPROTO_HCI)
      })?;
      // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
      let fd = unsafe { OwnedFd::from_raw_fd(raw) };

      let addr = SockaddrHci {
         hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
         hci_dev: dev_id,
         hci_channel: HCI_CHANNEL_RAW,
      };
      // SAFETY: bind() with a valid fd and a correctly sized sockaddr.
      cvt(unsafe {
         libc::bind(
            fd.as_raw_fd(),
            (&raw const addr).cast::<libc::sockaddr>(),
            mem::size_of::<SockaddrHci>() as libc::socklen_t,
         )
      })?;

      // SAFETY: fcntl on a descriptor we own.
      let flags = cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
      cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) })?;

      Ok(Self {
         fd: AsyncFd::new(fd)?,
      })
   }
}

#[async_trait]
impl HciTransport for RawHciSocket {
   fn set_filter(&self, filter: &HciFilter) -> io::Result<()> {
      // SAFETY: setsockopt with a valid fd and a correctly sized filter.
      cvt(unsafe {
         libc::setsockopt(
            self.fd.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            (filter as *const HciFilter).cast::<libc::c_void>(),
            mem::size_of::<HciFilter>() as libc::socklen_t,
         )
      })
      .map(drop)
   }

   async fn send(&self, frame: &[u8]) -> io::Result<()> {
      loop {
         let mut guard = self.fd.writable().await?;
         let res = guard.try_io(|inner| {
            // SAFETY: the buffer is valid for `frame.len()` bytes.
            let n = unsafe {
               libc::send(inner.as_raw_fd(), frame.as_ptr().cast(), frame.len(), libc::MSG_NOSIGNAL)
            };
            if n < 0 {
               Err(io::Error::last_os_error())
            } else {
               Ok(n as usize)
            }
         });
         match res {
            Ok(Ok(n)) if n == frame.len() => return Ok(()),
            Ok(Ok(n)) => {
               return Err(io::Error::new(
                  io::ErrorKind::WriteZero,
                  format!("short HCI write: {n} of {} bytes", frame.len()),
               ));
            },
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
         }
      }
   }

   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
      loop {
         let mut guard = self.fd.readable().await?;
         let res = guard.try_io(|inner| {
            // SAFETY: the buffer is valid for `buf.len()` bytes.
            let n = unsafe { libc::recv(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n < 0 {
               Err(io::Error::last_os_error())
            } else {
               Ok(n as usize)
            }
         });
         match res {
            Ok(res) => return res,
            Err(_would_block) => continue,
         }
      }
   }

   fn acl_conn_info(&self, addr: Address) -> io::Result<AclConnInfo> {
      let mut req = HciConnInfoReq {
         bdaddr: bdaddr_le(addr),
         link_type: ACL_LINK,
         ..Default::default()
      };
      // SAFETY: HCIGETCONNINFO fills the trailing conn_info of the request.
      cvt(unsafe { libc::ioctl(self.fd.as_raw_fd(), HCIGETCONNINFO as _, &raw mut req) })?;
      Ok(AclConnInfo {
         handle: req.conn_info.handle,
         link_mode: req.conn_info.link_mode,
      })
   }
}

/// A command channel to one adapter.
pub struct HciChannel {
   transport: Box<dyn HciTransport>,
   timeout: Duration,
   side_event: Mutex<Option<(u8, Packet)>>,
}

impl HciChannel {
   pub fn new(transport: Box<dyn HciTransport>, timeout: Duration) -> Self {
      Self {
         transport,
         timeout,
         side_event: Mutex::new(None),
      }
   }

   pub fn open(backend: &dyn HciBackend, dev_id: u16, timeout: Duration) -> Result<Self> {
      Ok(Self::new(backend.open(dev_id)?, timeout))
   }

   /// Takes the first masked event seen during an earlier command that was
   /// not that command's completion.
   pub fn take_side_event(&self) -> Option<(u8, Packet)> {
      self.side_event.lock().take()
   }

   /// Reads until one complete event whose code is in `mask` arrives.
   async fn recv_event(&self, mask: EventMask, deadline: Instant) -> Result<(u8, Packet)> {
      let mut buf = heapless::Vec::<u8, MAX_EVENT_LEN>::new();
      let mut chunk = [0u8; MAX_EVENT_LEN];
      loop {
         let now = Instant::now();
         if now >= deadline {
            return Err(AccessorError::Timeout("HCI event"));
         }
         let wait = READ_WAIT.min(deadline - now);
         let room = MAX_EVENT_LEN - buf.len();
         let n = match time::timeout(wait, self.transport.recv(&mut chunk[..room])).await {
            Ok(n) => n?,
            Err(_) => continue,
         };
         if n == 0 {
            return Err(AccessorError::Os(io::ErrorKind::UnexpectedEof.into()));
         }
         // `room` bounds `n`, so this cannot overflow.
         let _ = buf.extend_from_slice(&chunk[..n]);

         if let Some((code, payload)) = parse_event(&buf)? {
            debug!("HCI ← {code:02x} {}", hex::encode(payload));
            if mask.contains(code) {
               return Ok((code, Packet::from_slice(payload)));
            }
            buf.clear();
         }
      }
   }

   /// Sends one command and waits for its completion.
   ///
   /// `mask` names extra events the caller expects; command complete and
   /// command status are always included. A non-zero status is returned in
   /// the response, not as an error.
   pub async fn execute(&self, opcode: u16, args: &[u8], mask: EventMask) -> Result<HciResponse> {
      let mask = mask.with(EVT_CMD_COMPLETE).with(EVT_CMD_STATUS);
      let frame = build_command(opcode, args)?;

      self
         .transport
         .set_filter(&HciFilter::for_command(opcode, mask))?;
      debug!("HCI → {}", hex::encode(&frame));
      self.transport.send(&frame).await?;

      let deadline = Instant::now() + self.timeout;
      loop {
         let (code, payload) = self.recv_event(mask, deadline).await?;
         match classify(opcode, mask, code, &payload) {
            EventMatch::Complete { status, payload } => {
               return Ok(HciResponse::Complete {
                  status,
                  payload: Packet::from_slice(payload),
               });
            },
            EventMatch::Status(status) => return Ok(HciResponse::Status(status)),
            EventMatch::Side => {
               let mut side = self.side_event.lock();
               if side.is_none() {
                  *side = Some((code, payload));
               }
            },
            EventMatch::Unrelated => {},
         }
      }
   }

   pub fn acl_conn_info(&self, addr: Address) -> Result<AclConnInfo> {
      Ok(self.transport.acl_conn_info(addr)?)
   }

   /// Returns the eight LMP feature bytes.
   pub async fn read_local_features(&self) -> Result<[u8; 8]> {
      let rsp = self
         .execute(OP_READ_LOCAL_FEATURES, &[], EventMask::empty())
         .await?
         .check(OP_READ_LOCAL_FEATURES)?;
      let HciResponse::Complete { payload, .. } = rsp else {
         return Err(AccessorError::Protocol(ProtoError::ResponseTooShort {
            expected: 8,
            actual: 0,
         }));
      };
      payload
         .get(..8)
         .and_then(|f| <[u8; 8]>::try_from(f).ok())
         .ok_or(AccessorError::Protocol(ProtoError::ResponseTooShort {
            expected: 8,
            actual: payload.len(),
         }))
   }

   /// Extended inquiry response support, LMP feature byte 6 bit 0.
   pub async fn is_eir_capable(&self) -> Result<bool> {
      Ok(self.read_local_features().await?[6] & 0x01 != 0)
   }

   pub async fn configure_inquiry_scan(
      &self,
      window_ms: u16,
      interval_ms: u16,
      interlaced: bool,
      tx_power: i8,
   ) -> Result<()> {
      let activity = inquiry_scan_activity_args(window_ms, interval_ms)?;
      if !(-70..=20).contains(&tx_power) {
         return Err(AccessorError::InvalidArgument("inquiry tx power out of range"));
      }

      self
         .execute(OP_WRITE_INQUIRY_SCAN_ACTIVITY, &activity, EventMask::empty())
         .await?
         .check(OP_WRITE_INQUIRY_SCAN_ACTIVITY)?;
      self
         .execute(OP_WRITE_INQUIRY_SCAN_TYPE, &[u8::from(interlaced)], EventMask::empty())
         .await?
         .check(OP_WRITE_INQUIRY_SCAN_TYPE)?;
      self
         .execute(OP_WRITE_INQUIRY_TX_POWER, &[tx_power as u8], EventMask::empty())
         .await?
         .check(OP_WRITE_INQUIRY_TX_POWER)?;
      Ok(())
   }

   pub async fn configure_periodic_inquiry(
      &self,
      min_period: u16,
      max_period: u16,
      length: u8,
      max_responses: u8,
   ) -> Result<()> {
      let args = periodic_inquiry_args(min_period, max_period, length, max_responses)?;
      self
         .execute(OP_EXIT_PERIODIC_INQUIRY, &[], EventMask::empty())
         .await?
         .check(OP_EXIT_PERIODIC_INQUIRY)?;
      self
         .execute(OP_PERIODIC_INQUIRY, &args, EventMask::empty())
         .await?
         .check(OP_PERIODIC_INQUIRY)?;
      Ok(())
   }

   pub async fn set_simple_pairing_debug_mode(&self, enable: bool) -> Result<()> {
      self
         .execute(OP_WRITE_SSP_DEBUG_MODE, &[u8::from(enable)], EventMask::empty())
         .await?
         .check(OP_WRITE_SSP_DEBUG_MODE)?;
      Ok(())
   }

   pub async fn write_class_of_device(&self, cod: u32) -> Result<()> {
      let cod = cod.to_le_bytes();
      self
         .execute(OP_WRITE_CLASS_OF_DEVICE, &cod[..3], EventMask::empty())
         .await?
         .check(OP_WRITE_CLASS_OF_DEVICE)?;
      Ok(())
   }

   /// Requests a role switch and waits for the matching role-change event.
   pub async fn request_role(&self, addr: Address, role: Role) -> Result<()> {
      let mask = EventMask::empty().with(EVT_ROLE_CHANGE);
      self
         .execute(OP_SWITCH_ROLE, &role_switch_args(addr, role), mask)
         .await?
         .check(OP_SWITCH_ROLE)?;

      if let Some((EVT_ROLE_CHANGE, payload)) = self.take_side_event()
         && role_change_for(&payload, addr)
      {
         return role_change_status(&payload, addr, role);
      }

      let deadline = Instant::now() + self.timeout;
      loop {
         let (_, payload) = self.recv_event(mask, deadline).await?;
         if role_change_for(&payload, addr) {
            return role_change_status(&payload, addr, role);
         }
      }
   }

   pub async fn enter_sniff_mode(&self, handle: u16, params: &SniffParams) -> Result<()> {
      let args = sniff_args(handle, params)?;
      self
         .execute(OP_SNIFF_MODE, &args, EventMask::empty())
         .await?
         .check(OP_SNIFF_MODE)?;
      Ok(())
   }

   pub async fn exit_sniff_mode(&self, handle: u16) -> Result<()> {
      self
         .execute(OP_EXIT_SNIFF_MODE, &handle.to_le_bytes(), EventMask::empty())
         .await?
         .check(OP_EXIT_SNIFF_MODE)?;
      Ok(())
   }

   /// Whether the link policy for `handle` permits sniff mode.
   pub async fn sniff_allowed(&self, handle: u16) -> Result<bool> {
      let rsp = self
         .execute(OP_READ_LINK_POLICY, &handle.to_le_bytes(), EventMask::empty())
         .await?
         .check(OP_READ_LINK_POLICY)?;
      match rsp {
         // handle, policy
         HciResponse::Complete { payload, .. } if payload.len() >= 4 => {
            Ok(u16::from_le_bytes([payload[2], payload[3]]) & LINK_POLICY_SNIFF != 0)
         },
         HciResponse::Complete { payload, .. } => {
            Err(AccessorError::Protocol(ProtoError::ResponseTooShort {
               expected: 4,
               actual: payload.len(),
            }))
         },
         HciResponse::Status(_) => Ok(false),
      }
   }
}

#[cfg(test)]
pub(crate) mod testing {
   use std::{collections::VecDeque, sync::Arc};

   use super::*;

   /// Transport that replays canned event frames.
   #[derive(Default)]
   pub struct ScriptedTransport {
      pub replies: Mutex<VecDeque<Vec<u8>>>,
      pub sent: Mutex<Vec<Vec<u8>>>,
      pub filters: Mutex<Vec<HciFilter>>,
      pub conn_info: Option<AclConnInfo>,
   }

   impl ScriptedTransport {
      pub fn reply(&self, frame: Vec<u8>) {
         self.replies.lock().push_back(frame);
      }
   }

   #[async_trait]
   impl HciTransport for Arc<ScriptedTransport> {
      fn set_filter(&self, filter: &HciFilter) -> io::Result<()> {
         self.filters.lock().push(*filter);
         Ok(())
      }

      async fn send(&self, frame: &[u8]) -> io::Result<()> {
         self.sent.lock().push(frame.to_vec());
         Ok(())
      }

      async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
         let next = self.replies.lock().pop_front();
         match next {
            Some(frame) => {
               buf[..frame.len()].copy_from_slice(&frame);
               Ok(frame.len())
            },
            None => std::future::pending().await,
         }
      }

      fn acl_conn_info(&self, _addr: Address) -> io::Result<AclConnInfo> {
         self
            .conn_info
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTCONN))
      }
   }

   /// Command-complete frame for `opcode`.
   pub fn complete(opcode: u16, status: u8, ret: &[u8]) -> Vec<u8> {
      let op = opcode.to_le_bytes();
      let mut frame = vec![HCI_EVENT_PKT, EVT_CMD_COMPLETE, (4 + ret.len()) as u8, 1, op[0], op[1], status];
      frame.extend_from_slice(ret);
      frame
   }

   /// Command-status frame for `opcode`.
   pub fn status(opcode: u16, status: u8) -> Vec<u8> {
      let op = opcode.to_le_bytes();
      vec![HCI_EVENT_PKT, EVT_CMD_STATUS, 4, status, 1, op[0], op[1]]
   }

   struct AckingTransport {
      features: [u8; 8],
      silent: bool,
      pending: Mutex<VecDeque<Vec<u8>>>,
      backend_sent: Arc<Mutex<Vec<Vec<u8>>>>,
   }

   #[async_trait]
   impl HciTransport for AckingTransport {
      fn set_filter(&self, _filter: &HciFilter) -> io::Result<()> {
         Ok(())
      }

      async fn send(&self, frame: &[u8]) -> io::Result<()> {
         self.backend_sent.lock().push(frame.to_vec());
         if self.silent {
            return Ok(());
         }
         let opcode = u16::from_le_bytes([frame[1], frame[2]]);
         let ret: &[u8] = if opcode == OP_READ_LOCAL_FEATURES {
            &self.features
         } else {
            &[]
         };
         self.pending.lock().push_back(complete(opcode, 0, ret));
         Ok(())
      }

      async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
         let next = self.pending.lock().pop_front();
         match next {
            Some(frame) => {
               buf[..frame.len()].copy_from_slice(&frame);
               Ok(frame.len())
            },
            None => std::future::pending().await,
         }
      }

      fn acl_conn_info(&self, _addr: Address) -> io::Result<AclConnInfo> {
         Ok(AclConnInfo {
            handle: 0x0042,
            link_mode: HCI_LM_MASTER,
         })
      }
   }

   /// Backend whose transports acknowledge every command, except on the
   /// device ids listed in `silent`, which never answer.
   pub struct AckingHci {
      pub features: [u8; 8],
      pub silent: Mutex<Vec<u16>>,
      pub opened: Mutex<Vec<u16>>,
      pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
   }

   impl AckingHci {
      pub fn new(eir: bool) -> Arc<Self> {
         let mut features = [0u8; 8];
         features[6] = u8::from(eir);
         Arc::new(Self {
            features,
            silent: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
         })
      }

      pub fn opcodes(&self) -> Vec<u16> {
         self
            .sent
            .lock()
            .iter()
            .map(|f| u16::from_le_bytes([f[1], f[2]]))
            .collect()
      }
   }

   impl HciBackend for AckingHci {
      fn open(&self, dev_id: u16) -> io::Result<Box<dyn HciTransport>> {
         self.opened.lock().push(dev_id);
         Ok(Box::new(AckingTransport {
            features: self.features,
            silent: self.silent.lock().contains(&dev_id),
            pending: Mutex::new(VecDeque::new()),
            backend_sent: self.sent.clone(),
         }))
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use super::{testing::*, *};

   fn channel(transport: &Arc<ScriptedTransport>) -> HciChannel {
      HciChannel::new(Box::new(transport.clone()), Duration::from_secs(10))
   }

   #[test]
   fn test_tick_conversion() {
      assert_eq!(ms_to_ticks(10), 0x11);
      assert_eq!(ms_to_ticks(11), 18);
      assert_eq!(ms_to_ticks(1280), 2048);
      assert_eq!(ms_to_ticks(2560), 4096);

      let mut last = ms_to_ticks(10);
      for ms in 11..=2560 {
         let ticks = ms_to_ticks(ms);
         assert!(ticks >= last, "{ms} ms went backwards");
         last = ticks;
      }
   }

   #[test]
   fn test_inquiry_scan_args() {
      assert_eq!(inquiry_scan_activity_args(11, 1280).unwrap(), [0x00, 0x08, 0x12, 0x00]);
      assert!(inquiry_scan_activity_args(9, 1280).is_err());
      assert!(inquiry_scan_activity_args(100, 50).is_err());
      assert!(inquiry_scan_activity_args(10, 2561).is_err());
   }

   #[test]
   fn test_periodic_inquiry_args() {
      assert_eq!(
         periodic_inquiry_args(4, 6, 3, 0).unwrap(),
         [6, 0, 4, 0, 0x33, 0x8B, 0x9E, 3, 0]
      );
      assert!(periodic_inquiry_args(4, 6, 0x31, 0).is_err());
      assert!(periodic_inquiry_args(3, 6, 3, 0).is_err());
      assert!(periodic_inquiry_args(6, 6, 3, 0).is_err());
      assert!(periodic_inquiry_args(1, 0, 0, 0).is_ok());
   }

   #[test]
   fn test_sniff_args() {
      let params = SniffParams {
         min_interval: 0x0010,
         max_interval: 0x0020,
         attempt: 1,
         timeout: 0,
      };
      assert_eq!(
         sniff_args(0x0102, &params).unwrap(),
         [0x02, 0x01, 0x10, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00, 0x00]
      );
      assert!(sniff_args(1, &SniffParams { min_interval: 3, ..params }).is_err());
      assert!(sniff_args(1, &SniffParams { max_interval: 8, ..params }).is_err());
      assert!(sniff_args(1, &SniffParams { attempt: 0, ..params }).is_err());
      assert!(sniff_args(1, &SniffParams { timeout: 0x8000, ..params }).is_err());
   }

   #[test]
   fn test_role_switch_args_reverse_address() {
      let addr = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
      assert_eq!(
         role_switch_args(addr, Role::Slave),
         [0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 0x01]
      );
   }

   #[test]
   fn test_parse_event_framing() {
      assert_eq!(parse_event(&[0x04, 0x0E]).unwrap(), None);
      assert_eq!(parse_event(&[0x04, 0x0E, 2, 1]).unwrap(), None);
      assert_eq!(parse_event(&[0x04, 0x0E, 1, 7]).unwrap(), Some((0x0E, &[7u8][..])));
      assert!(matches!(
         parse_event(&[0x04, 0x0E, 1, 7, 8]),
         Err(ProtoError::EventSizeMismatch { expected: 1, actual: 2 })
      ));
      assert!(parse_event(&[0x02, 0x00, 0x00]).is_err());
   }

   #[test]
   fn test_filter_layout() {
      let mask = EventMask::empty().with(EVT_CMD_COMPLETE).with(EVT_CMD_STATUS);
      let filter = HciFilter::for_command(0x0C24, mask);
      assert_eq!(filter.type_mask, 1 << 4);
      assert_eq!(filter.event_mask, [(1 << 0x0E) | (1 << 0x0F), 0]);
      assert_eq!(mem::size_of::<HciFilter>(), 16);
   }

   #[tokio::test(start_paused = true)]
   async fn test_execute_skips_unrelated_and_keeps_side_event() {
      let transport = Arc::new(ScriptedTransport::default());
      transport.reply(status(OP_SNIFF_MODE, 0));
      transport.reply(vec![0x04, EVT_ROLE_CHANGE, 8, 0, 1, 2, 3, 4, 5, 6, 0]);
      transport.reply(complete(OP_WRITE_CLASS_OF_DEVICE, 0, &[]));
      let hci = channel(&transport);

      let mask = EventMask::empty().with(EVT_ROLE_CHANGE);
      let rsp = hci.execute(OP_WRITE_CLASS_OF_DEVICE, &[1, 2, 3], mask).await.unwrap();
      assert_eq!(
         rsp,
         HciResponse::Complete {
            status: 0,
            payload: Packet::new()
         }
      );
      assert_eq!(transport.sent.lock()[0], vec![0x01, 0x24, 0x0C, 3, 1, 2, 3]);
      assert_eq!(transport.filters.lock()[0].opcode, 0x0C24);
      let (code, _) = hci.take_side_event().unwrap();
      assert_eq!(code, EVT_ROLE_CHANGE);
      assert!(hci.take_side_event().is_none());
   }

   #[tokio::test(start_paused = true)]
   async fn test_command_status_failure_is_reported() {
      let transport = Arc::new(ScriptedTransport::default());
      transport.reply(status(OP_SNIFF_MODE, 0x0C));
      let hci = channel(&transport);

      let rsp = hci.execute(OP_SNIFF_MODE, &[0; 10], EventMask::empty()).await.unwrap();
      assert_eq!(rsp, HciResponse::Status(0x0C));
      assert!(matches!(
         rsp.check(OP_SNIFF_MODE),
         Err(AccessorError::CommandFailed { status: 0x0C, .. })
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_execute_times_out() {
      let transport = Arc::new(ScriptedTransport::default());
      let hci = channel(&transport);

      let err = hci
         .execute(OP_READ_LOCAL_FEATURES, &[], EventMask::empty())
         .await
         .unwrap_err();
      assert!(matches!(err, AccessorError::Timeout(_)));
   }

   #[tokio::test(start_paused = true)]
   async fn test_eir_feature_bit() {
      let transport = Arc::new(ScriptedTransport::default());
      transport.reply(complete(OP_READ_LOCAL_FEATURES, 0, &[0xff, 0, 0, 0, 0, 0, 0x01, 0]));
      assert!(channel(&transport).is_eir_capable().await.unwrap());

      let transport = Arc::new(ScriptedTransport::default());
      transport.reply(complete(OP_READ_LOCAL_FEATURES, 0, &[0xff; 6]));
      assert!(channel(&transport).is_eir_capable().await.is_err());
   }

   #[tokio::test(start_paused = true)]
   async fn test_role_switch_waits_for_matching_address() {
      let addr = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
      let transport = Arc::new(ScriptedTransport::default());
      transport.reply(status(OP_SWITCH_ROLE, 0));
      transport.reply(vec![0x04, EVT_ROLE_CHANGE, 8, 0, 9, 9, 9, 9, 9, 9, 1]);
      transport.reply(vec![0x04, EVT_ROLE_CHANGE, 8, 0, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 1]);
      let hci = channel(&transport);

      hci.request_role(addr, Role::Slave).await.unwrap();
      assert!(transport.replies.lock().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_refused_role_switch_is_an_error() {
      let addr = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
      let transport = Arc::new(ScriptedTransport::default());
      transport.reply(status(OP_SWITCH_ROLE, 0));
      transport.reply(vec![0x04, EVT_ROLE_CHANGE, 8, 0x21, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 0]);
      let hci = channel(&transport);

      assert!(matches!(
         hci.request_role(addr, Role::Master).await,
         Err(AccessorError::CommandFailed {
            opcode: OP_SWITCH_ROLE,
            status: 0x21
         })
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_inquiry_configuration_sequence() {
      let transport = Arc::new(ScriptedTransport::default());
      transport.reply(complete(OP_WRITE_INQUIRY_SCAN_ACTIVITY, 0, &[]));
      transport.reply(complete(OP_WRITE_INQUIRY_SCAN_TYPE, 0, &[]));
      transport.reply(complete(OP_WRITE_INQUIRY_TX_POWER, 0, &[]));
      let hci = channel(&transport);

      hci.configure_inquiry_scan(11, 1280, true, 8).await.unwrap();
      let sent = transport.sent.lock();
      assert_eq!(sent[1], vec![0x01, 0x43, 0x0C, 1, 1]);
      assert_eq!(sent[2], vec![0x01, 0x59, 0x0C, 1, 8]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_periodic_inquiry_restarts() {
      let transport = Arc::new(ScriptedTransport::default());
      transport.reply(complete(OP_EXIT_PERIODIC_INQUIRY, 0, &[]));
      transport.reply(complete(OP_PERIODIC_INQUIRY, 0, &[]));
      transport.reply(complete(OP_WRITE_SSP_DEBUG_MODE, 0, &[]));
      let hci = channel(&transport);

      hci.configure_periodic_inquiry(4, 6, 3, 0).await.unwrap();
      hci.set_simple_pairing_debug_mode(true).await.unwrap();

      let sent = transport.sent.lock();
      assert_eq!(sent[0], vec![0x01, 0x04, 0x04, 0]);
      assert_eq!(sent[1], vec![0x01, 0x03, 0x04, 9, 6, 0, 4, 0, 0x33, 0x8B, 0x9E, 3, 0]);
      assert_eq!(sent[2], vec![0x01, 0x04, 0x18, 1, 1]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_invalid_periodic_inquiry_sends_nothing() {
      let transport = Arc::new(ScriptedTransport::default());
      let hci = channel(&transport);

      assert!(hci.configure_periodic_inquiry(6, 6, 3, 0).await.is_err());
      assert!(transport.sent.lock().is_empty());
   }
}
