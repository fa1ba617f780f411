//! Bonding decisions around connects and characteristic operations.

use uuid::Uuid;

use crate::{address::Address, config::DeviceConfig, task::TaskType};

/// What a bond filter is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondTrigger {
   /// The device finished service discovery during a connect.
   Connect,
   /// A read, write or notification toggle is about to be queued.
   CharacteristicOp { task: TaskType, characteristic: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondDecision {
   Nothing,
   Bond,
   Unbond,
}

/// Facts the filter can use.
#[derive(Debug, Clone, Copy)]
pub struct BondContext<'a> {
   pub address: Address,
   pub trigger: BondTrigger,
   pub bonded: bool,
   pub config: &'a DeviceConfig,
   pub bond_on_connect: bool,
}

pub trait BondFilter: Send {
   fn decide(&mut self, ctx: &BondContext<'_>) -> BondDecision;
}

impl<F> BondFilter for F
where
   F: FnMut(&BondContext<'_>) -> BondDecision + Send,
{
   fn decide(&mut self, ctx: &BondContext<'_>) -> BondDecision {
      self(ctx)
   }
}

/// Bonds on connect when configured, and before touching any characteristic
/// listed in the device's `bonded_characteristics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigBondFilter;

impl BondFilter for ConfigBondFilter {
   fn decide(&mut self, ctx: &BondContext<'_>) -> BondDecision {
      if ctx.bonded {
         return BondDecision::Nothing;
      }
      let wants = match ctx.trigger {
         BondTrigger::Connect => ctx.bond_on_connect,
         BondTrigger::CharacteristicOp { characteristic, .. } => {
            ctx.config.bonded_characteristics.contains(&characteristic)
         },
      };
      if wants { BondDecision::Bond } else { BondDecision::Nothing }
   }
}

/// Runs the configured [`BondFilter`].
pub struct BondManager {
   filter: Box<dyn BondFilter>,
}

impl Default for BondManager {
   fn default() -> Self {
      Self::new(Box::new(ConfigBondFilter))
   }
}

impl BondManager {
   pub fn new(filter: Box<dyn BondFilter>) -> Self {
      Self { filter }
   }

   pub fn set_filter(&mut self, filter: Box<dyn BondFilter>) {
      self.filter = filter;
   }

   /// Asks the filter, discarding decisions that would not change anything.
   pub fn check(&mut self, ctx: &BondContext<'_>) -> BondDecision {
      match self.filter.decide(ctx) {
         BondDecision::Bond if ctx.bonded => BondDecision::Nothing,
         BondDecision::Unbond if !ctx.bonded => BondDecision::Nothing,
         decision => decision,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const CHAR: Uuid = Uuid::from_u128(0xfeed);

   fn ctx(config: &DeviceConfig, trigger: BondTrigger, bonded: bool) -> BondContext<'_> {
      BondContext {
         address: Address::any(),
         trigger,
         bonded,
         config,
         bond_on_connect: false,
      }
   }

   #[test]
   fn test_config_filter() {
      let config = DeviceConfig {
         bonded_characteristics: vec![CHAR],
         ..DeviceConfig::default()
      };
      let mut bonds = BondManager::default();
      let op = |characteristic| BondTrigger::CharacteristicOp {
         task: TaskType::Read,
         characteristic,
      };

      assert_eq!(bonds.check(&ctx(&config, op(CHAR), false)), BondDecision::Bond);
      assert_eq!(bonds.check(&ctx(&config, op(CHAR), true)), BondDecision::Nothing);
      assert_eq!(bonds.check(&ctx(&config, op(Uuid::nil()), false)), BondDecision::Nothing);
      assert_eq!(bonds.check(&ctx(&config, BondTrigger::Connect, false)), BondDecision::Nothing);
   }

   #[test]
   fn test_pointless_unbond_is_dropped() {
      let config = DeviceConfig::default();
      let mut bonds = BondManager::new(Box::new(|_: &BondContext<'_>| BondDecision::Unbond));
      assert_eq!(bonds.check(&ctx(&config, BondTrigger::Connect, false)), BondDecision::Nothing);
      assert_eq!(bonds.check(&ctx(&config, BondTrigger::Connect, true)), BondDecision::Unbond);
   }
}
