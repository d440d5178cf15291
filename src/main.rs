//! Bluetooth accessor daemon.
//!
//! Runs the accessor against the system BlueZ daemon: publishes a service
//! record for this node while Bluetooth is available, accepts links, and
//! logs every accessor event and every remote bus record it finds.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use rand::Rng;
use tokio::{signal, time};

use btaccessor::{
   AccessorError, AccessorEvent, AdvertisedNode, BtAccessor, Config, EventProcessor,
   IncomingDecision, IncomingPolicy, Result,
   bluetooth::{bluez::ZbusBluez, hci::RawHci, l2cap::BluerL2cap, node::INVALID_UUID_REV},
};

/// Delay before polling again while not connectable
const ACCEPT_IDLE_DELAY: Duration = Duration::from_secs(1);

/// Lets every peer in.
struct AllowAll;

impl IncomingPolicy for AllowAll {
   fn check_incoming_address(&self, _addr: Address) -> IncomingDecision {
      IncomingDecision::Allow
   }
}

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting Bluetooth accessor...");

   let config = Config::load()?;
   let bluez = ZbusBluez::system(&config).await?;
   let events = bluez.events().await?;

   let event_bus = EventProcessor::new();
   let accessor = BtAccessor::new(
      config,
      Arc::new(bluez),
      Arc::new(RawHci),
      Arc::new(BluerL2cap),
      Arc::new(AllowAll),
      event_bus.clone(),
      events,
   );

   let (guid, uuid_rev) = {
      let mut rng = rand::thread_rng();
      (hex::encode(rng.r#gen::<[u8; 16]>()), rng.gen_range(1..=u32::MAX))
   };
   info!("Node {guid}, uuid rev {uuid_rev:08x}");

   tokio::spawn(run_events(accessor.clone(), event_bus, guid, uuid_rev));
   tokio::spawn(run_accept(accessor.clone()));

   signal::ctrl_c().await?;
   info!("Shutting down Bluetooth accessor...");
   accessor.shutdown().await;

   Ok(())
}

async fn run_events(accessor: BtAccessor, event_bus: Arc<EventProcessor>, guid: String, uuid_rev: u32) {
   while let Some(event) = event_bus.recv().await {
      info!("{}", event.to_json());
      match event {
         AccessorEvent::DeviceAvailable(true) => {
            if let Err(e) = go_online(&accessor, &guid, uuid_rev).await {
               warn!("Failed to come online: {e}");
            }
         },
         AccessorEvent::DeviceAvailable(false) => {
            accessor.stop_connectable();
            accessor.stop_advertising().await;
         },
         AccessorEvent::DeviceChange { addr, uuid_rev, .. } if uuid_rev != INVALID_UUID_REV => {
            tokio::spawn(query_device(accessor.clone(), addr));
         },
         AccessorEvent::DeviceChange { .. } => {},
      }
   }
   debug!("Event loop stopped");
}

async fn go_online(accessor: &BtAccessor, guid: &str, uuid_rev: u32) -> Result<()> {
   let bus_addr = accessor.start_connectable()?;
   let node = AdvertisedNode::new(guid, bus_addr).with_name(format!("org.btaccessor.n{}", &guid[..8]));
   accessor
      .manager()
      .publish_service_record(uuid_rev, bus_addr, &[node])
      .await?;
   accessor.start_advertising([bus_addr.addr]).await;
   Ok(())
}

async fn query_device(accessor: BtAccessor, addr: Address) {
   match accessor.get_device_info(addr).await {
      Ok(record) => {
         for node in &record.nodes {
            info!("{addr}: node {} at {} names {:?}", node.guid, node.bus_addr, node.names);
         }
      },
      Err(e) => warn!("{addr}: device info query failed: {e}"),
   }
}

async fn run_accept(accessor: BtAccessor) {
   loop {
      match accessor.accept().await {
         Ok(conn) => info!("Incoming link: {conn:?}"),
         Err(AccessorError::NotFound(_)) => time::sleep(ACCEPT_IDLE_DELAY).await,
         Err(e) => warn!("Accept failed: {e}"),
      }
   }
}
