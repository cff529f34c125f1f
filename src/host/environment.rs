//! Selection of the host implementation.

use std::{sync::Arc, time::Duration};

use log::{error, info, warn};

use super::{HostRef, bluez::BluezHost, fallback::FallbackHost};
use crate::config::{Backend, Config};

/// Resolves the adapter host once at start-up.
///
/// With `backend = "auto"` an unreachable BlueZ silently degrades to the
/// fallback host; with `backend = "bluez"` the same failure is logged as an
/// error but the service still comes up on the fallback.
pub async fn resolve_adapter_host(config: &Config) -> HostRef {
   if config.backend == Backend::Fallback {
      info!("Using fallback Bluetooth host");
      return Arc::new(FallbackHost::new());
   }

   let poll_interval = Duration::from_secs(config.adapter_poll_interval.max(1));
   match BluezHost::connect(poll_interval).await {
      Ok(host) => {
         info!("Connected to BlueZ");
         host as HostRef
      },
      Err(e) => {
         if config.backend == Backend::Bluez {
            error!("BlueZ backend requested but unavailable: {e}");
         } else {
            warn!("BlueZ unavailable ({e}), using fallback Bluetooth host");
         }
         Arc::new(FallbackHost::new())
      },
   }
}
