//! Bluetooth device addresses.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GattError;

/// A 48-bit Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Address(pub [u8; 6]);

impl Address {
   pub const fn new(bytes: [u8; 6]) -> Self {
      Self(bytes)
   }

   /// The all-zero address.
   pub const fn any() -> Self {
      Self([0; 6])
   }
}

impl fmt::Display for Address {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for Address {
   type Err = GattError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      let invalid = || GattError::InvalidAddress(s.into());
      let mut bytes = [0u8; 6];
      let mut parts = s.split([':', '-']);
      for byte in &mut bytes {
         let part = parts.next().ok_or_else(invalid)?;
         if part.len() != 2 {
            return Err(invalid());
         }
         let [decoded] = hex::decode(part)
            .map_err(|_| invalid())?
            .try_into()
            .map_err(|_| invalid())?;
         *byte = decoded;
      }
      if parts.next().is_some() {
         return Err(invalid());
      }
      Ok(Self(bytes))
   }
}

impl Serialize for Address {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for Address {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = smol_str::SmolStr::deserialize(deserializer)?;
      s.parse().map_err(serde::de::Error::custom)
   }
}

#[cfg(feature = "bluez")]
impl From<bluer::Address> for Address {
   fn from(addr: bluer::Address) -> Self {
      Self(addr.0)
   }
}

#[cfg(feature = "bluez")]
impl From<Address> for bluer::Address {
   fn from(addr: Address) -> Self {
      Self(addr.0)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_display_and_parse() {
      let addr = Address([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x0F]);
      assert_eq!(addr.to_string(), "AA:BB:CC:01:02:0F");
      assert_eq!("aa:bb:cc:01:02:0f".parse::<Address>().unwrap(), addr);
      assert_eq!("AA-BB-CC-01-02-0F".parse::<Address>().unwrap(), addr);
   }

   #[test]
   fn test_parse_rejects_garbage() {
      assert!("AA:BB:CC:01:02".parse::<Address>().is_err());
      assert!("AA:BB:CC:01:02:0F:11".parse::<Address>().is_err());
      assert!("AA:BB:CC:01:02:ZZ".parse::<Address>().is_err());
      assert!("AAB:B:CC:01:02:0F".parse::<Address>().is_err());
   }
}
