//! [`PlatformBinding`] over BlueZ.
//!
//! Each request runs as its own tokio task against the default adapter and
//! reports back through a [`NativeSender`]. BlueZ does not hand out numeric
//! GATT status codes, so every failure is reported as [`NO_STATUS`].

use std::{collections::HashMap, pin::pin, time::Duration};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Device, DeviceEvent, DeviceProperty, Session,
   gatt::remote::Characteristic,
};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{task::JoinHandle, time};
use uuid::Uuid;

use crate::{
   address::Address,
   binding::{NativeError, NativeEvent, NativeRequest, NativeSender, PlatformBinding},
   error::Result,
   state::NO_STATUS,
   task::Value,
};

/// How long to wait for BlueZ to resolve services after a connect.
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);

pub struct BluezBinding {
   adapter: Adapter,
   events: NativeSender,
   adapter_monitor: JoinHandle<()>,
   scan: Option<JoinHandle<()>>,
   links: HashMap<Address, JoinHandle<()>>,
   notifications: HashMap<(Address, Uuid), JoinHandle<()>>,
}

impl BluezBinding {
   /// Opens the default adapter and starts watching its power state.
   pub async fn new(events: NativeSender) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;
      info!("Using Bluetooth adapter {}", adapter.name());

      events.deliver(NativeEvent::AdapterState {
         on: adapter.is_powered().await?,
      });
      let adapter_monitor = Self::start_adapter_monitor(adapter.clone(), events.clone());

      Ok(Self {
         adapter,
         events,
         adapter_monitor,
         scan: None,
         links: HashMap::new(),
         notifications: HashMap::new(),
      })
   }

   fn start_adapter_monitor(adapter: Adapter, events: NativeSender) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(stream) = adapter.events().await else {
            warn!("Failed to get adapter events for {}", adapter.name());
            return;
         };
         let mut stream = pin!(stream);
         while let Some(event) = stream.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) = event {
               debug!("Adapter {} powered: {on}", adapter.name());
               if !events.deliver(NativeEvent::AdapterState { on }) {
                  break;
               }
            }
         }
      })
   }

   /// Reports a spontaneous drop of `address` once BlueZ flips `Connected` off.
   fn watch_link(&mut self, device: Device, address: Address) {
      let events = self.events.clone();
      let handle = tokio::spawn(async move {
         let Ok(stream) = device.events().await else {
            warn!("{address}: cannot watch device properties");
            return;
         };
         let mut stream = pin!(stream);
         while let Some(event) = stream.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
               events.deliver(NativeEvent::Disconnected {
                  address,
                  status: NO_STATUS,
               });
               break;
            }
         }
      });
      if let Some(old) = self.links.insert(address, handle) {
         old.abort();
      }
   }

   fn is_watched(&self, address: Address) -> bool {
      self.links.get(&address).is_some_and(|h| !h.is_finished())
   }

   fn device(&self, address: Address) -> std::result::Result<Device, NativeError> {
      self.adapter.device(address.into()).map_err(|e| {
         warn!("{address}: no BlueZ device object: {e}");
         NativeError::Rejected(NO_STATUS)
      })
   }

   fn start_scan(&mut self) {
      if let Some(scan) = self.scan.take() {
         scan.abort();
      }
      let adapter = self.adapter.clone();
      let events = self.events.clone();
      self.scan = Some(tokio::spawn(async move {
         let stream = match adapter.discover_devices().await {
            Ok(stream) => stream,
            Err(e) => {
               warn!("Failed to start discovery: {e}");
               events.deliver(NativeEvent::ScanFailed { status: NO_STATUS });
               return;
            },
         };
         events.deliver(NativeEvent::ScanStarted);

         let mut stream = pin!(stream);
         while let Some(event) = stream.next().await {
            let AdapterEvent::DeviceAdded(addr) = event else {
               continue;
            };
            let Ok(device) = adapter.device(addr) else {
               continue;
            };
            let rssi = device.rssi().await.ok().flatten();
            let name = device.name().await.ok().flatten().map(Into::into);
            events.deliver(NativeEvent::Advertisement {
               address: addr.into(),
               rssi,
               name,
            });
         }
         events.deliver(NativeEvent::ScanStopped);
      }));
   }

   fn stop_scan(&mut self) {
      // Dropping the discovery stream ends the session.
      if let Some(scan) = self.scan.take() {
         scan.abort();
      }
   }

   fn set_notify(&mut self, device: Device, address: Address, characteristic: Uuid, enable: bool) {
      let key = (address, characteristic);
      if let Some(old) = self.notifications.remove(&key) {
         old.abort();
      }
      let events = self.events.clone();
      if !enable {
         events.deliver(NativeEvent::NotifyToggled {
            address,
            characteristic,
            result: Ok(false),
         });
         return;
      }

      let handle = tokio::spawn(async move {
         let stream = match find_characteristic(&device, characteristic).await {
            Ok(Some(ch)) => ch.notify().await.map_err(|e| e.to_string()),
            Ok(None) => Err(format!("characteristic {characteristic} not found")),
            Err(e) => Err(e.to_string()),
         };
         let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
               warn!("{address}: enabling notifications failed: {e}");
               events.deliver(NativeEvent::NotifyToggled {
                  address,
                  characteristic,
                  result: Err(NO_STATUS),
               });
               return;
            },
         };
         events.deliver(NativeEvent::NotifyToggled {
            address,
            characteristic,
            result: Ok(true),
         });

         let mut stream = pin!(stream);
         while let Some(value) = stream.next().await {
            let delivered = events.deliver(NativeEvent::Notification {
               address,
               characteristic,
               value: Value::from_vec(value),
            });
            if !delivered {
               break;
            }
         }
      });
      self.notifications.insert(key, handle);
   }

   fn stop_link_tasks(&mut self, address: Address) {
      self.notifications.retain(|(addr, _), handle| {
         if *addr == address {
            handle.abort();
            false
         } else {
            true
         }
      });
   }
}

impl Drop for BluezBinding {
   fn drop(&mut self) {
      self.adapter_monitor.abort();
      self.stop_scan();
      for handle in self.links.values().chain(self.notifications.values()) {
         handle.abort();
      }
   }
}

async fn find_characteristic(device: &Device, uuid: Uuid) -> bluer::Result<Option<Characteristic>> {
   for service in device.services().await? {
      for ch in service.characteristics().await? {
         if ch.uuid().await? == uuid {
            return Ok(Some(ch));
         }
      }
   }
   Ok(None)
}

async fn resolve_services(device: &Device) -> bluer::Result<Option<Vec<Uuid>>> {
   let deadline = time::Instant::now() + SERVICES_RESOLVE_TIMEOUT;
   while !device.is_services_resolved().await? {
      if time::Instant::now() >= deadline {
         return Ok(None);
      }
      time::sleep(SERVICES_RESOLVE_POLL).await;
   }
   let mut uuids = Vec::new();
   for service in device.services().await? {
      uuids.push(service.uuid().await?);
   }
   Ok(Some(uuids))
}

impl PlatformBinding for BluezBinding {
   fn execute(&mut self, request: NativeRequest) -> std::result::Result<(), NativeError> {
      if self.events.is_closed() {
         return Err(NativeError::Dead);
      }
      debug!("BlueZ request: {request:?}");
      let events = self.events.clone();

      match request {
         NativeRequest::TurnOn | NativeRequest::TurnOff => {
            let on = matches!(request, NativeRequest::TurnOn);
            let adapter = self.adapter.clone();
            // Power changes come back through the adapter monitor.
            tokio::spawn(async move {
               if let Err(e) = adapter.set_powered(on).await {
                  warn!("Failed to set adapter power to {on}: {e}");
               }
            });
         },
         NativeRequest::StartScan => self.start_scan(),
         NativeRequest::StopScan => self.stop_scan(),
         NativeRequest::Connect {
            address,
            auto_connect,
         } => {
            if auto_connect {
               debug!("{address}: BlueZ has no background connect; connecting directly");
            }
            let device = self.device(address)?;
            self.watch_link(device.clone(), address);
            tokio::spawn(async move {
               match device.connect().await {
                  Ok(()) => events.deliver(NativeEvent::Connected { address }),
                  Err(e) => {
                     debug!("{address}: connect failed: {e}");
                     events.deliver(NativeEvent::ConnectFailed {
                        address,
                        status: NO_STATUS,
                     })
                  },
               };
            });
         },
         NativeRequest::Disconnect { address } => {
            let device = self.device(address)?;
            let watched = self.is_watched(address);
            self.stop_link_tasks(address);
            tokio::spawn(async move {
               if let Err(e) = device.disconnect().await {
                  debug!("{address}: disconnect failed: {e}");
               }
               if !watched {
                  events.deliver(NativeEvent::Disconnected {
                     address,
                     status: NO_STATUS,
                  });
               }
            });
         },
         NativeRequest::DiscoverServices { address } => {
            let device = self.device(address)?;
            tokio::spawn(async move {
               let services = match resolve_services(&device).await {
                  Ok(Some(uuids)) => Ok(uuids),
                  Ok(None) => return,
                  Err(e) => {
                     warn!("{address}: service discovery failed: {e}");
                     Err(NO_STATUS)
                  },
               };
               events.deliver(NativeEvent::ServicesDiscovered { address, services });
            });
         },
         NativeRequest::Bond { address } => {
            let device = self.device(address)?;
            tokio::spawn(async move {
               let bonded = match device.pair().await {
                  Ok(()) => true,
                  Err(e) => {
                     warn!("{address}: pairing failed: {e}");
                     false
                  },
               };
               events.deliver(NativeEvent::BondState {
                  address,
                  bonded,
                  status: NO_STATUS,
               });
            });
         },
         NativeRequest::Unbond { address } => {
            let adapter = self.adapter.clone();
            tokio::spawn(async move {
               if let Err(e) = adapter.remove_device(address.into()).await {
                  warn!("{address}: removing bond failed: {e}");
                  return;
               }
               events.deliver(NativeEvent::BondState {
                  address,
                  bonded: false,
                  status: NO_STATUS,
               });
            });
         },
         NativeRequest::Read {
            address,
            characteristic,
         } => {
            let device = self.device(address)?;
            tokio::spawn(async move {
               let result = match find_characteristic(&device, characteristic).await {
                  Ok(Some(ch)) => ch.read().await.map(Value::from_vec).map_err(|e| {
                     debug!("{address}: read {characteristic} failed: {e}");
                     NO_STATUS
                  }),
                  _ => Err(NO_STATUS),
               };
               events.deliver(NativeEvent::CharacteristicRead {
                  address,
                  characteristic,
                  result,
               });
            });
         },
         NativeRequest::Write {
            address,
            characteristic,
            data,
         } => {
            let device = self.device(address)?;
            tokio::spawn(async move {
               debug!("{address}: write {characteristic} <- {}", hex::encode(&data));
               let result = match find_characteristic(&device, characteristic).await {
                  Ok(Some(ch)) => ch.write(&data).await.map_err(|e| {
                     debug!("{address}: write {characteristic} failed: {e}");
                     NO_STATUS
                  }),
                  _ => Err(NO_STATUS),
               };
               events.deliver(NativeEvent::CharacteristicWritten {
                  address,
                  characteristic,
                  result,
               });
            });
         },
         NativeRequest::SetNotify {
            address,
            characteristic,
            enable,
         } => {
            let device = self.device(address)?;
            self.set_notify(device, address, characteristic, enable);
         },
         NativeRequest::ReadRssi { address } => {
            let device = self.device(address)?;
            tokio::spawn(async move {
               let result = match device.rssi().await {
                  Ok(Some(rssi)) => Ok(rssi),
                  _ => Err(NO_STATUS),
               };
               events.deliver(NativeEvent::Rssi { address, result });
            });
         },
      }
      Ok(())
   }
}
