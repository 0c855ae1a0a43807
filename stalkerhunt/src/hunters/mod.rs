//! Ready-made workers.
//!
//! Each hunter is a [`Worker`](crate::worker::Worker) producing
//! [`HuntRecord`]s, so they share one report path:
//!
//! - [`PortHunter`] - TCP connect sweep over a port list
//! - [`BannerHunter`] - connect, optionally send a greeting, read the first bytes
//! - [`ResolveHunter`] - name resolution
//!
//! # Example
//! ```rust,no_run
//! use stalkerhunt::{engine::Hunter, hunters::PortHunter, target::TargetList};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let hunter = Hunter::new(PortHunter::new(vec![135, 445, 3389]));
//! let (findings, _summary) = hunter.run(&"10.0.0.1,10.0.0.2".parse::<TargetList>()?).await?;
//! for finding in findings {
//!     println!("{} {}", finding.target, finding.record);
//! }
//! # Ok(())
//! # }
//! ```
use std::{
    fmt::{self, Display},
    net::IpAddr,
};

use anyhow::Context;
use serde::Serialize;
use tokio::net::lookup_host;

use crate::target::Target;

mod banner;
mod buffer;
mod ports;
mod resolve;

pub use banner::BannerHunter;
pub use buffer::ReadBuffer;
pub use ports::PortHunter;
pub use resolve::ResolveHunter;

/// Record produced by the built-in hunters, tagged by the hunter that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "hunter", rename_all = "snake_case")]
pub enum HuntRecord {
    OpenPort { port: u16 },
    Banner { port: u16, banner: String },
    Resolved { address: IpAddr },
}

impl Display for HuntRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HuntRecord::OpenPort { port } => write!(f, "port {port} open"),
            HuntRecord::Banner { port, banner } => write!(f, "port {port} banner {banner:?}"),
            HuntRecord::Resolved { address } => write!(f, "resolves to {address}"),
        }
    }
}

/// Resolves `target` to its addresses, duplicates removed, lookup order kept.
pub(crate) async fn resolve(target: &Target) -> anyhow::Result<Vec<IpAddr>> {
    let mut addresses: Vec<IpAddr> = Vec::new();
    for addr in lookup_host((target.host(), 0))
        .await
        .with_context(|| format!("failed to resolve {target}"))?
    {
        if !addresses.contains(&addr.ip()) {
            addresses.push(addr.ip());
        }
    }

    if addresses.is_empty() {
        anyhow::bail!("{target} resolved to no address");
    }
    Ok(addresses)
}
