//! gattkeeperd: the GATT engine as a D-Bus service.
//!
//! Drives the default BlueZ adapter and exposes devices, tasks and engine
//! events on the session bus.

use std::sync::Arc;

use gattkeeper::{
   Config, DeviceState, Engine, EngineEvent, EventQueue, ManagerState, NativeSender, Result,
   bluez::BluezBinding, persist::HeedStore,
};
use log::{info, warn};
use tokio::signal;
use zbus::{Connection, connection, object_server::InterfaceRef};

use crate::dbus::{GattkeeperService, GattkeeperServiceSignals};

mod dbus;

const BUS_NAME: &str = "org.gattkeeper";
const OBJECT_PATH: &str = "/org/gattkeeper/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting gattkeeper D-Bus service...");

   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let store = HeedStore::open()?;
   let (native_tx, native_rx) = NativeSender::channel();
   let binding = BluezBinding::new(native_tx).await?;

   let events = EventQueue::new();
   let engine = Engine::builder(config)
      .event_bus(events.clone())
      .store(Arc::new(store))
      .spawn(Box::new(binding), native_rx);

   let service = GattkeeperService::new(engine.clone());

   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("gattkeeper D-Bus service started at {BUS_NAME}");

   spawn_dispatcher(events, connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down gattkeeper service...");
   engine.shutdown().await;

   Ok(())
}

async fn dispatch(iface: &InterfaceRef<GattkeeperService>, event: EngineEvent) -> Result<()> {
   match event {
      EngineEvent::Discovered {
         address,
         name,
         rssi,
      } => {
         iface
            .device_discovered(
               &address.to_string(),
               name.as_deref().unwrap_or_default(),
               rssi.unwrap_or_default(),
            )
            .await?;
      },
      EngineEvent::DeviceState { address, event } => {
         let state: Vec<_> = event.new.iter().map(DeviceState::to_str).collect();
         iface
            .device_state_changed(&address.to_string(), &state.join(","))
            .await?;
      },
      EngineEvent::ManagerState(event) => {
         let state: Vec<_> = event.new.iter().map(ManagerState::to_str).collect();
         iface.adapter_state_changed(&state.join(",")).await?;
      },
      EngineEvent::ConnectionFailed(info) => {
         let json = serde_json::to_string(&info).unwrap_or_default();
         iface
            .connection_failed(&info.address.to_string(), &json)
            .await?;
      },
      EngineEvent::ReconnectStopped {
         address, attempts, ..
      } => {
         iface
            .reconnect_stopped(&address.to_string(), attempts)
            .await?;
      },
      EngineEvent::ValueChanged {
         address,
         characteristic,
         value,
      } => {
         iface
            .value_changed(
               &address.to_string(),
               &characteristic.to_string(),
               &hex::encode(value),
            )
            .await?;
      },
      EngineEvent::Notification {
         address,
         characteristic,
         value,
      } => {
         iface
            .notification(
               &address.to_string(),
               &characteristic.to_string(),
               &hex::encode(value),
            )
            .await?;
      },
      EngineEvent::UhOh(uhoh) => {
         iface
            .uh_oh(&uhoh.kind.to_string(), &uhoh.remedy.to_string())
            .await?;
      },
      EngineEvent::ContractViolation(what) => {
         warn!("Contract violation: {what}");
      },
      EngineEvent::TransactionRequired { address, kind } => {
         iface
            .transaction_required(&address.to_string(), kind.into())
            .await?;
      },
      EngineEvent::TaskEnded(_) => {},
   }
   Ok(())
}

async fn spawn_dispatcher(events: Arc<EventQueue>, connection: Connection) -> Result<()> {
   let iface = connection
      .object_server()
      .interface::<_, GattkeeperService>(OBJECT_PATH)
      .await?;
   tokio::spawn(async move {
      while let Some(event) = events.recv().await {
         if let Err(e) = dispatch(&iface, event).await {
            warn!("Error dispatching event: {e}");
         }
      }
   });

   Ok(())
}
