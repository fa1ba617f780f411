use std::{str::FromStr, time::Duration};

use gattkeeper::{Address, Engine};
use log::info;
use uuid::Uuid;
use zbus::{interface, object_server::SignalEmitter};

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn parse_uuid(uuid: &str) -> zbus::fdo::Result<Uuid> {
   Uuid::from_str(uuid).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn failed(e: gattkeeper::GattError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

pub struct GattkeeperService {
   engine: Engine,
}

impl GattkeeperService {
   pub const fn new(engine: Engine) -> Self {
      Self { engine }
   }
}

#[interface(name = "org.gattkeeper.Manager")]
impl GattkeeperService {
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let devices: Vec<serde_json::Value> = self
         .engine
         .all_devices()
         .await
         .into_iter()
         .map(|d| d.to_json())
         .collect();
      serde_json::to_string(&devices).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn get_device(&self, address: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let dev = self.engine.get_device(addr).await.map_err(failed)?;
      Ok(dev.to_json().to_string())
   }

   async fn register_device(&self, address: String, name: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let name = (!name.is_empty()).then(|| name.into());
      self
         .engine
         .register_device(addr, name, None)
         .await
         .map_err(failed)
   }

   async fn connect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.engine.connect(addr).await.map_err(failed)?;
      info!("Connected to {address}");
      Ok(true)
   }

   async fn disconnect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let outcome = self.engine.disconnect(addr).await.map_err(failed)?;
      Ok(outcome.state.is_success())
   }

   /// Returns the value as a hex string.
   async fn read(&self, address: String, characteristic: String) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let uuid = parse_uuid(&characteristic)?;
      let value = self.engine.read(addr, uuid).await.map_err(failed)?;
      Ok(hex::encode(value))
   }

   async fn write(
      &self,
      address: String,
      characteristic: String,
      payload: String,
      urgent: bool,
   ) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let uuid = parse_uuid(&characteristic)?;
      let data =
         hex::decode(payload).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      if urgent {
         self.engine.write_urgent(addr, uuid, &data).await
      } else {
         self.engine.write(addr, uuid, &data).await
      }
      .map_err(failed)?;
      Ok(true)
   }

   async fn set_notify(
      &self,
      address: String,
      characteristic: String,
      enable: bool,
   ) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let uuid = parse_uuid(&characteristic)?;
      self
         .engine
         .set_notify(addr, uuid, enable)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn read_rssi(&self, address: String) -> zbus::fdo::Result<i16> {
      let addr = parse_address(&address)?;
      self.engine.read_rssi(addr).await.map_err(failed)
   }

   async fn bond(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.engine.bond(addr).await.map_err(failed)?;
      Ok(true)
   }

   async fn unbond(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.engine.unbond(addr).await.map_err(failed)?;
      Ok(true)
   }

   /// Scans for `seconds`, or until `stop_scan` when zero.
   async fn start_scan(&self, seconds: u32) -> zbus::fdo::Result<bool> {
      let duration = (seconds > 0).then(|| Duration::from_secs(seconds.into()));
      self.engine.start_scan(duration).await.map_err(failed)?;
      Ok(true)
   }

   async fn stop_scan(&self) -> zbus::fdo::Result<bool> {
      self.engine.stop_scan().await.map_err(failed)
   }

   async fn start_poll(
      &self,
      address: String,
      characteristic: String,
      interval_ms: u64,
      change_only: bool,
   ) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let uuid = parse_uuid(&characteristic)?;
      self
         .engine
         .start_poll(addr, uuid, Duration::from_millis(interval_ms), change_only)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn stop_poll(&self, address: String, characteristic: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let uuid = parse_uuid(&characteristic)?;
      self.engine.stop_poll(addr, uuid).await.map_err(failed)?;
      Ok(true)
   }

   /// Ends the transaction the device is waiting on.
   async fn end_transaction(&self, address: String, success: bool) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .engine
         .end_transaction(addr, success)
         .await
         .map_err(failed)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_discovered(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
      rssi: i16,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn adapter_state_changed(emitter: &SignalEmitter<'_>, state: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_failed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      info: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn reconnect_stopped(
      emitter: &SignalEmitter<'_>,
      address: &str,
      attempts: u32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn value_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      characteristic: &str,
      value: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn notification(
      emitter: &SignalEmitter<'_>,
      address: &str,
      characteristic: &str,
      value: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn transaction_required(
      emitter: &SignalEmitter<'_>,
      address: &str,
      kind: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn uh_oh(emitter: &SignalEmitter<'_>, kind: &str, remedy: &str) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn adapter_state(&self) -> String {
      self
         .engine
         .manager_state()
         .await
         .map(|flags| flags.join(","))
         .unwrap_or_default()
   }
}
