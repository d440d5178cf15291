//! SDP record codec for the bus service record.
//!
//! The daemon exchanges service records as XML documents. This module
//! renders the record we publish and parses the records returned by a
//! remote service query. It performs no I/O.

use std::{borrow::Cow, str::FromStr};

use bluer::Address;
use log::debug;
use roxmltree::{Document, Node};
use uuid::Uuid;

use crate::{
   bluetooth::node::{
      AdvertisedNode, BusAddress, INVALID_PSM, address_from_raw, address_to_raw, is_bus_psm,
   },
   error::{AccessorError, ProtoError, Result},
};

/// Identity UUID of the bus service; the top 32 bits carry the revision.
pub const BUS_UUID_BASE: Uuid = Uuid::from_u128(0x00000000_1c25_481f_9dfb_59193d238280);

pub const ATTR_SERVICE_ID: u32 = 0x0001;
pub const ATTR_VERSION: u32 = 0x0400;
pub const ATTR_CONN_ADDR: u32 = 0x0401;
pub const ATTR_PSM: u32 = 0x0402;
pub const ATTR_ADVERTISEMENTS: u32 = 0x0404;

/// Bus protocol version advertised in published records.
pub const PROTOCOL_VERSION: u32 = 0x0304_0001;

/// Class-of-device bit marking a device that may carry the bus service.
pub const COD_BUS_CAPABLE: u32 = 0x0080_0000;

const REV_MASK: u128 = 0xffff_ffff << 96;

macro_rules! record_template {
   () => {
      concat!(
         "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
         "<record>",
         "<attribute id=\"0x0000\"><uint32 value=\"0x4F492354\"/></attribute>",
         "<attribute id=\"0x0002\"><uint32 value=\"0x00000001\"/></attribute>",
         "<attribute id=\"0x0008\"><uint8 value=\"0xFF\"/></attribute>",
         "<attribute id=\"0x0004\"><sequence><sequence><uuid value=\"0x0100\"/></sequence></sequence></attribute>",
         "<attribute id=\"0x0005\"><sequence><uuid value=\"0x00001002\"/></sequence></attribute>",
         "<attribute id=\"0x0001\"><sequence><uuid value=\"{uuid}\"/></sequence></attribute>",
         "<attribute id=\"0x0400\"><uint32 value=\"{version:#08x}\"/></attribute>",
         "<attribute id=\"0x0401\"><text value=\"{addr}\"/></attribute>",
         "<attribute id=\"0x0402\"><uint16 value=\"{psm:#08x}\"/></attribute>",
         "<attribute id=\"0x0404\"><sequence>{nodes}</sequence></attribute>",
         "<attribute id=\"0x0100\"><text value=\"AllJoyn\"/></attribute>",
         "<attribute id=\"0x0101\"><text value=\"AllJoyn Distributed Message Bus\"/></attribute>",
         "</record>"
      )
   };
}

/// Contents of the bus service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
   pub uuid_rev: u32,
   /// Protocol version; 0 when a decoded record carried none.
   pub version: u32,
   pub bus_addr: BusAddress,
   pub nodes: Vec<AdvertisedNode>,
}

/// Builds the full service UUID for a revision.
pub fn bus_uuid(uuid_rev: u32, base: &Uuid) -> Uuid {
   Uuid::from_u128((base.as_u128() & !REV_MASK) | (u128::from(uuid_rev) << 96))
}

/// Extracts the revision from `uuid` if it carries `base`.
pub fn uuid_rev(uuid: &Uuid, base: &Uuid) -> Option<u32> {
   let raw = uuid.as_u128();
   (raw & !REV_MASK == base.as_u128() & !REV_MASK).then_some((raw >> 96) as u32)
}

/// Scans an advertised service-UUID list for the bus UUID.
pub fn find_bus_uuid_rev<'a, I>(uuids: I, base: &Uuid) -> Option<u32>
where
   I: IntoIterator<Item = &'a str>,
{
   uuids
      .into_iter()
      .filter_map(|s| Uuid::parse_str(s.trim()).ok())
      .find_map(|uuid| uuid_rev(&uuid, base))
}

fn escape(value: &str) -> Cow<'_, str> {
   if !value.contains(['&', '<', '>', '"']) {
      return Cow::Borrowed(value);
   }
   let mut out = String::with_capacity(value.len() + 8);
   for c in value.chars() {
      match c {
         '&' => out.push_str("&amp;"),
         '<' => out.push_str("&lt;"),
         '>' => out.push_str("&gt;"),
         '"' => out.push_str("&quot;"),
         c => out.push(c),
      }
   }
   Cow::Owned(out)
}

fn encode_nodes(nodes: &[AdvertisedNode]) -> String {
   let mut out = String::new();
   for node in nodes {
      out.push_str("<sequence><text value=\"");
      out.push_str(&escape(&node.guid));
      out.push_str("\"/><uint64 value=\"");
      out.push_str(&address_to_raw(node.bus_addr.addr).to_string());
      out.push_str("\"/><uint16 value=\"");
      out.push_str(&node.bus_addr.psm.to_string());
      out.push_str("\"/><sequence>");
      for name in &node.names {
         out.push_str("<text value=\"");
         out.push_str(&escape(name));
         out.push_str("\"/>");
      }
      out.push_str("</sequence></sequence>");
   }
   out
}

/// Renders `record` as the XML document handed to the daemon.
pub fn encode(record: &ServiceRecord, base: &Uuid) -> String {
   format!(
      record_template!(),
      uuid = bus_uuid(record.uuid_rev, base).hyphenated(),
      version = record.version,
      addr = record.bus_addr.addr,
      psm = record.bus_addr.psm,
      nodes = encode_nodes(&record.nodes),
   )
}

/// Parses an integer the way the daemon prints them: `0x` hex, leading-zero
/// octal, or decimal.
fn parse_auto(value: &str) -> Option<u64> {
   let value = value.trim();
   if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
      u64::from_str_radix(hex, 16).ok()
   } else if value.len() > 1 && value.starts_with('0') {
      u64::from_str_radix(&value[1..], 8).ok()
   } else {
      value.parse().ok()
   }
}

fn malformed(reason: &'static str) -> AccessorError {
   ProtoError::MalformedRecord { reason }.into()
}

fn first_value<'a, 'i>(attr: Node<'a, 'i>, tag: &str) -> Option<&'a str> {
   attr
      .children()
      .find(|n| n.has_tag_name(tag))
      .and_then(|n| n.attribute("value"))
}

fn decode_uuid_rev(attr: Node<'_, '_>, base: &Uuid) -> Option<u32> {
   attr
      .descendants()
      .filter(|n| n.has_tag_name("uuid"))
      .filter_map(|n| n.attribute("value"))
      .find_map(|value| find_bus_uuid_rev([value], base))
}

fn decode_node(tuple: Node<'_, '_>) -> Result<AdvertisedNode> {
   let mut parts = tuple.children().filter(Node::is_element);

   let guid = parts
      .next()
      .filter(|n| n.has_tag_name("text"))
      .and_then(|n| n.attribute("value"))
      .map(str::trim)
      .filter(|guid| !guid.is_empty());
   let raw_addr = parts
      .next()
      .filter(|n| n.has_tag_name("uint64"))
      .and_then(|n| n.attribute("value"))
      .and_then(parse_auto)
      .filter(|raw| *raw != 0);
   let psm = parts
      .next()
      .filter(|n| n.has_tag_name("uint16"))
      .and_then(|n| n.attribute("value"))
      .and_then(parse_auto)
      .and_then(|psm| u16::try_from(psm).ok())
      .filter(|psm| *psm != INVALID_PSM);
   let names = parts.next().filter(|n| n.has_tag_name("sequence"));

   let (Some(guid), Some(raw_addr), Some(psm), Some(names)) = (guid, raw_addr, psm, names) else {
      return Err(malformed("incomplete advertised node entry"));
   };

   let mut node = AdvertisedNode::new(guid, BusAddress::new(address_from_raw(raw_addr), psm));
   // The daemon pads text values with a trailing space.
   node.names.extend(
      names
         .children()
         .filter(|n| n.has_tag_name("text"))
         .filter_map(|n| n.attribute("value"))
         .map(str::trim)
         .filter(|name| !name.is_empty())
         .map(str::to_owned),
   );
   Ok(node)
}

fn decode_nodes(attr: Node<'_, '_>) -> Result<Vec<AdvertisedNode>> {
   let Some(list) = attr.children().find(Node::is_element) else {
      return Ok(Vec::new());
   };
   if !list.has_tag_name("sequence") {
      return Ok(Vec::new());
   }
   list
      .children()
      .filter(|n| n.has_tag_name("sequence"))
      .map(decode_node)
      .collect()
}

/// Parses a remote service record.
///
/// The service UUID, connect address, PSM and advertisement list must all be
/// present, and the version attribute must precede the advertisement list.
/// Any malformed node entry fails the whole record.
pub fn decode(xml: &str, base: &Uuid) -> Result<ServiceRecord> {
   let doc = Document::parse(xml).map_err(ProtoError::from)?;
   let root = doc.root_element();
   if !root.has_tag_name("record") {
      return Err(malformed("unexpected root element"));
   }

   let mut uuid_rev = None;
   let mut version = None;
   let mut conn_addr = None;
   let mut psm = None;
   let mut nodes = None;

   for attr in root.children().filter(|n| n.has_tag_name("attribute")) {
      let Some(id) = attr.attribute("id").and_then(parse_auto) else {
         continue;
      };
      match u32::try_from(id).unwrap_or(u32::MAX) {
         ATTR_SERVICE_ID => {
            if let Some(rev) = decode_uuid_rev(attr, base) {
               uuid_rev = Some(rev);
            }
         },
         ATTR_VERSION => {
            let value = first_value(attr, "uint32")
               .and_then(parse_auto)
               .ok_or_else(|| malformed("missing version value"))?;
            version = Some(value as u32);
         },
         ATTR_CONN_ADDR => {
            let value = first_value(attr, "text")
               .ok_or_else(|| malformed("missing connect address value"))?;
            let addr = Address::from_str(value.trim())
               .map_err(|_| malformed("unparsable connect address"))?;
            conn_addr = Some(addr);
         },
         ATTR_PSM => {
            let value = first_value(attr, "uint16")
               .ok_or_else(|| malformed("missing PSM value"))?;
            let value = parse_auto(value)
               .and_then(|v| u16::try_from(v).ok())
               .filter(|v| is_bus_psm(*v))
               .unwrap_or(INVALID_PSM);
            psm = Some(value);
         },
         ATTR_ADVERTISEMENTS => {
            if version.is_none() {
               return Err(malformed("version must precede advertisements"));
            }
            nodes = Some(decode_nodes(attr)?);
         },
         _ => {},
      }
   }

   let uuid_rev = uuid_rev.ok_or(AccessorError::NotFound("bus service UUID"))?;
   let conn_addr = conn_addr.ok_or(AccessorError::NotFound("connect address"))?;
   let psm = psm.ok_or(AccessorError::NotFound("PSM"))?;
   let nodes = nodes.ok_or(AccessorError::NotFound("advertisements"))?;
   if psm == INVALID_PSM {
      return Err(malformed("PSM outside the bus range"));
   }

   debug!(
      "Decoded service record rev {uuid_rev:08x} at {conn_addr} psm {psm:#06x} with {} nodes",
      nodes.len()
   );

   Ok(ServiceRecord {
      uuid_rev,
      version: version.unwrap_or(0),
      bus_addr: BusAddress::new(conn_addr, psm),
      nodes,
   })
}
